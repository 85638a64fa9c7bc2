//! Device registry: the membership map of device handles.
//!
//! One coarse lock guards membership only. Each [`Device`] guards its own
//! link and runtime state, so work against different devices never contends
//! here. Blocking protocol work is dispatched to tokio's blocking pool via
//! [`DeviceRegistry::run_blocking`], keeping slow serial reads of one device
//! off the async executor and away from the others.

use crate::ecr::device::{Device, DeviceOptions, DeviceRecord, DeviceSnapshot};
use crate::ecr::error::{EcrError, Result};
use crate::ecr::lock::OwnerToken;
use crate::ecr::retry::{Clock, SystemClock};
use crate::ecr::store::DeviceStore;
use crate::ecr::transport::{self, EcrTransport, LinkConfig};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

/// Builds the byte link for a device record.
pub type TransportFactory =
    Arc<dyn Fn(&LinkConfig) -> Result<Box<dyn EcrTransport>> + Send + Sync>;

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    store: Arc<dyn DeviceStore>,
    options: DeviceOptions,
    clock: Arc<dyn Clock>,
    transports: TransportFactory,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>, options: DeviceOptions) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            store,
            options,
            clock: Arc::new(SystemClock),
            transports: Arc::new(transport::create_transport),
        }
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transports = factory;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Device>>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Device>>> {
        self.devices.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register every stored record. Invalid records are skipped.
    pub fn load_all(&self) -> Result<usize> {
        let mut loaded = 0;
        for record in self.store.load_all()? {
            let id = record.device_id.clone();
            match self.insert(record) {
                Ok((_, replaced)) => {
                    if let Some(old) = replaced {
                        old.disconnect();
                    }
                    loaded += 1;
                }
                Err(e) => warn!("Skipping stored device {id}: {e}"),
            }
        }
        info!("Loaded {loaded} devices from store");
        Ok(loaded)
    }

    /// Add or replace a device and persist its record. Replacing is refused
    /// while a live owner holds the previous handle; once replaced, that
    /// handle is disconnected so the new one can claim the port. A failed
    /// save leaves the map as it was.
    pub fn register(&self, record: DeviceRecord) -> Result<Arc<Device>> {
        let (device, replaced) = self.insert(record)?;
        if let Err(e) = self.store.save(&device.record()) {
            warn!("Device {} not saved, registration undone: {e}", device.id());
            if let Some(old) = self.restore(&device, replaced) {
                old.disconnect();
            }
            return Err(e);
        }
        if let Some(old) = replaced {
            old.disconnect();
        }
        Ok(device)
    }

    /// Returns the new handle and the one it replaced, still connected.
    fn insert(&self, record: DeviceRecord) -> Result<(Arc<Device>, Option<Arc<Device>>)> {
        record.validate()?;
        let mut devices = self.write();
        if let Some(other) = devices.values().find(|d| {
            d.id() != record.device_id && d.record().link.port == record.link.port
        }) {
            return Err(EcrError::Config(format!(
                "port {} already used by device {}",
                record.link.port,
                other.id()
            )));
        }
        let transport = (self.transports)(&record.link)?;
        if let Some(old) = devices.get(&record.device_id) {
            old.retire()?;
        }
        let id = record.device_id.clone();
        let port = record.link.port.clone();
        let device = Arc::new(Device::new(
            record,
            transport,
            Arc::clone(&self.clock),
            self.options.clone(),
        ));
        let replaced = devices.insert(id.clone(), Arc::clone(&device));
        if replaced.is_some() {
            info!("Device {id} re-registered on {port}");
        } else {
            info!("Device {id} registered on {port}");
        }
        Ok((device, replaced))
    }

    /// Undo an insert. Returns the replaced handle if it could not be put
    /// back because the entry changed in the meantime.
    fn restore(&self, device: &Arc<Device>, replaced: Option<Arc<Device>>) -> Option<Arc<Device>> {
        let mut devices = self.write();
        let current = devices
            .get(device.id())
            .is_some_and(|d| Arc::ptr_eq(d, device));
        if !current {
            return replaced;
        }
        match replaced {
            Some(old) => {
                old.reinstate();
                devices.insert(old.id().to_string(), old);
            }
            None => {
                devices.remove(device.id());
            }
        }
        None
    }

    pub fn lookup(&self, device_id: &str) -> Result<Arc<Device>> {
        self.read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| EcrError::NotRegistered(device_id.to_string()))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.read().contains_key(device_id)
    }

    /// Drop a device from the map and the store.
    pub fn remove(&self, device_id: &str) -> Result<bool> {
        let removed = self.write().remove(device_id);
        if let Some(device) = &removed {
            device.disconnect();
            info!("Device {device_id} removed");
        }
        let stored = self.store.delete(device_id)?;
        Ok(removed.is_some() || stored)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Save the current record, including identity learned from the device.
    pub fn persist(&self, device_id: &str) -> Result<()> {
        let device = self.lookup(device_id)?;
        self.store.save(&device.record())
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<Arc<Device>> = self.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices.iter().map(|d| d.snapshot()).collect()
    }

    /// Evict every holder older than the staleness timeout.
    pub fn sweep_stale_locks(&self) -> Vec<(String, OwnerToken)> {
        let devices: Vec<Arc<Device>> = self.read().values().cloned().collect();
        devices
            .iter()
            .filter_map(|d| d.sweep_stale_lock().map(|t| (d.id().to_string(), t)))
            .collect()
    }

    /// Run blocking device work on tokio's blocking pool.
    pub async fn run_blocking<T, F>(&self, device_id: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Device) -> Result<T> + Send + 'static,
    {
        let device = self.lookup(device_id)?;
        tokio::task::spawn_blocking(move || work(&device))
            .await
            .map_err(|e| EcrError::InvalidState(format!("worker for {device_id} failed: {e}")))?
    }

    /// Disconnect every link and persist what was learned (app shutdown).
    pub fn shutdown(&self) {
        let devices: Vec<Arc<Device>> = self.read().values().cloned().collect();
        for device in &devices {
            device.disconnect();
            if let Err(e) = self.store.save(&device.record()) {
                warn!("Error saving {} during shutdown: {e}", device.id());
            }
        }
        info!("DeviceRegistry shutdown: {} devices disconnected", devices.len());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecr::catalog::ErrorPolicy;
    use crate::ecr::fiscal::FiscalWorkflow;
    use crate::ecr::lock::LockPolicy;
    use crate::ecr::retry::ManualClock;
    use crate::ecr::status::ShiftState;
    use crate::ecr::store::MemoryStore;
    use crate::ecr::testing::{FakeRegister, SimDevice};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory store whose saves can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        records: MemoryStore,
        fail_saves: AtomicBool,
    }

    impl DeviceStore for FlakyStore {
        fn load_all(&self) -> Result<Vec<DeviceRecord>> {
            self.records.load_all()
        }

        fn save(&self, record: &DeviceRecord) -> Result<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(EcrError::Config("disk full".into()));
            }
            self.records.save(record)
        }

        fn delete(&self, device_id: &str) -> Result<bool> {
            self.records.delete(device_id)
        }
    }

    struct Bench {
        registry: DeviceRegistry,
        store: Arc<FlakyStore>,
        sims: HashMap<String, SimDevice>,
        clock: ManualClock,
    }

    fn bench(ports: &[(&str, FakeRegister)]) -> Bench {
        let sims: HashMap<String, SimDevice> = ports
            .iter()
            .map(|(port, reg)| (port.to_string(), SimDevice::new(reg.clone())))
            .collect();
        let factory_sims = sims.clone();
        let factory: TransportFactory = Arc::new(move |link: &LinkConfig| {
            factory_sims
                .get(&link.port)
                .cloned()
                .map(|s| Box::new(s) as Box<dyn EcrTransport>)
                .ok_or_else(|| EcrError::Config(format!("no port {}", link.port)))
        });
        let store = Arc::new(FlakyStore::default());
        let clock = ManualClock::new();
        let registry = DeviceRegistry::new(
            store.clone(),
            DeviceOptions::new(LockPolicy::default(), 2, ErrorPolicy::default()),
        )
        .with_transport_factory(factory)
        .with_clock(Arc::new(clock.clone()));
        Bench {
            registry,
            store,
            sims,
            clock,
        }
    }

    fn record(id: &str, port: &str) -> DeviceRecord {
        DeviceRecord::new(
            id,
            LinkConfig {
                port: port.into(),
                ..LinkConfig::default()
            },
        )
    }

    #[test]
    fn test_registry_new_is_empty() {
        let b = bench(&[]);
        assert!(b.registry.device_ids().is_empty());
        assert!(!b.registry.contains("kkm-1"));
        assert!(matches!(
            b.registry.lookup("kkm-1"),
            Err(EcrError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_register_persists_and_looks_up() {
        let b = bench(&[("COM1", FakeRegister::default())]);
        b.registry.register(record("kkm-1", "COM1")).unwrap();
        assert_eq!(b.registry.lookup("kkm-1").unwrap().id(), "kkm-1");
        assert_eq!(b.store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_register_rejects_port_of_other_device() {
        let b = bench(&[("COM1", FakeRegister::default())]);
        b.registry.register(record("kkm-1", "COM1")).unwrap();
        let err = b.registry.register(record("kkm-2", "COM1"));
        assert!(matches!(err, Err(EcrError::Config(ref m)) if m.contains("kkm-1")));
        assert_eq!(b.registry.device_ids(), vec!["kkm-1"]);
    }

    #[test]
    fn test_register_rejects_invalid_record() {
        let b = bench(&[]);
        assert!(b.registry.register(record("kkm-1", "")).is_err());
        assert!(b.store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_reregister_disconnects_previous_handle() {
        let b = bench(&[("COM1", FakeRegister::default())]);
        let first = b.registry.register(record("kkm-1", "COM1")).unwrap();
        first.connect().unwrap();
        assert!(b.sims["COM1"].is_open());

        let mut updated = record("kkm-1", "COM1");
        updated.name = "front desk".into();
        let second = b.registry.register(updated).unwrap();
        assert!(!first.is_connected());
        assert_eq!(second.record().name, "front desk");
        assert_eq!(b.store.load_all().unwrap()[0].name, "front desk");
    }

    #[test]
    fn test_reregister_refused_while_held() {
        let b = bench(&[("COM1", FakeRegister::default())]);
        let first = b.registry.register(record("kkm-1", "COM1")).unwrap();
        let owner = OwnerToken::new();
        first.acquire_lock(owner).unwrap();

        let refused = b.registry.register(record("kkm-1", "COM1"));
        assert!(matches!(refused, Err(EcrError::Concurrency { ref device_id }) if device_id == "kkm-1"));
        assert!(Arc::ptr_eq(&b.registry.lookup("kkm-1").unwrap(), &first));
        assert_eq!(first.lock_holder(), Some(owner));

        first.release_lock();
        let second = b.registry.register(record("kkm-1", "COM1")).unwrap();
        assert!(matches!(
            first.acquire_lock(OwnerToken::new()),
            Err(EcrError::NotRegistered(_))
        ));
        second.acquire_lock(OwnerToken::new()).unwrap();
    }

    #[test]
    fn test_reregister_evicts_stale_holder() {
        let b = bench(&[("COM1", FakeRegister::default())]);
        let first = b.registry.register(record("kkm-1", "COM1")).unwrap();
        first.acquire_lock(OwnerToken::new()).unwrap();
        b.clock.advance(Duration::from_secs(61));

        let second = b.registry.register(record("kkm-1", "COM1")).unwrap();
        assert!(!Arc::ptr_eq(&second, &first));
        assert_eq!(first.lock_holder(), None);
    }

    #[test]
    fn test_failed_save_undoes_registration() {
        let b = bench(&[("COM1", FakeRegister::default()), ("COM2", FakeRegister::default())]);
        b.store.fail_saves.store(true, Ordering::SeqCst);
        assert!(b.registry.register(record("kkm-2", "COM2")).is_err());
        assert!(!b.registry.contains("kkm-2"));

        b.store.fail_saves.store(false, Ordering::SeqCst);
        let first = b.registry.register(record("kkm-1", "COM1")).unwrap();
        b.store.fail_saves.store(true, Ordering::SeqCst);
        let mut renamed = record("kkm-1", "COM1");
        renamed.name = "renamed".into();
        assert!(b.registry.register(renamed).is_err());

        let current = b.registry.lookup("kkm-1").unwrap();
        assert!(Arc::ptr_eq(&current, &first));
        first.acquire_lock(OwnerToken::new()).unwrap();
        assert_eq!(b.store.load_all().unwrap()[0].name, first.record().name);
    }

    #[test]
    fn test_load_all_skips_bad_records() {
        let b = bench(&[("COM1", FakeRegister::default()), ("COM2", FakeRegister::default())]);
        b.store.save(&record("a", "COM1")).unwrap();
        b.store.save(&record("b", "COM2")).unwrap();
        b.store.save(&record("c", "COM9")).unwrap();
        assert_eq!(b.registry.load_all().unwrap(), 2);
        assert_eq!(b.registry.device_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_drops_device_and_record() {
        let b = bench(&[("COM1", FakeRegister::default())]);
        b.registry.register(record("kkm-1", "COM1")).unwrap();
        assert!(b.registry.remove("kkm-1").unwrap());
        assert!(!b.registry.contains("kkm-1"));
        assert!(b.store.load_all().unwrap().is_empty());
        assert!(!b.registry.remove("kkm-1").unwrap());
    }

    #[test]
    fn test_sweep_evicts_only_stale_holders() {
        let b = bench(&[("COM1", FakeRegister::default()), ("COM2", FakeRegister::default())]);
        let a = b.registry.register(record("a", "COM1")).unwrap();
        let stale = OwnerToken::new();
        a.acquire_lock(stale).unwrap();
        b.clock.advance(Duration::from_secs(61));
        let fresh = b.registry.register(record("b", "COM2")).unwrap();
        fresh.acquire_lock(OwnerToken::new()).unwrap();

        let evicted = b.registry.sweep_stale_locks();
        assert_eq!(evicted, vec![("a".to_string(), stale)]);
        assert!(fresh.lock_holder().is_some());
    }

    #[test]
    fn test_shutdown_disconnects_and_persists_identity() {
        let b = bench(&[("COM1", FakeRegister::default())]);
        let device = b.registry.register(record("kkm-1", "COM1")).unwrap();
        FiscalWorkflow::new(&device, OwnerToken::new())
            .query_status()
            .unwrap();
        assert!(b.sims["COM1"].is_open());

        b.registry.shutdown();
        assert!(!b.sims["COM1"].is_open());
        assert_eq!(b.store.load_all().unwrap()[0].identity.serial_number, "12345678");
    }

    #[test]
    fn test_snapshots_sorted_by_id() {
        let b = bench(&[("COM1", FakeRegister::default()), ("COM2", FakeRegister::default())]);
        b.registry.register(record("z", "COM1")).unwrap();
        b.registry.register(record("m", "COM2")).unwrap();
        let ids: Vec<String> = b.registry.snapshots().into_iter().map(|s| s.device_id).collect();
        assert_eq!(ids, vec!["m", "z"]);
    }

    #[tokio::test]
    async fn test_run_blocking_drives_devices_independently() {
        let b = bench(&[
            ("COM1", FakeRegister::with_open_shift(3)),
            ("COM2", FakeRegister::default()),
        ]);
        b.registry.register(record("a", "COM1")).unwrap();
        b.registry.register(record("b", "COM2")).unwrap();

        let shift = |d: &Device| FiscalWorkflow::new(d, OwnerToken::new()).shift_state();
        let (a, bb) = tokio::join!(
            b.registry.run_blocking("a", shift),
            b.registry.run_blocking("b", shift)
        );
        assert_eq!(a.unwrap(), ShiftState::Open);
        assert_eq!(bb.unwrap(), ShiftState::Closed);

        let missing = b.registry.run_blocking("nope", shift).await;
        assert!(matches!(missing, Err(EcrError::NotRegistered(_))));
    }
}

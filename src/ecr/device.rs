//! One registered fiscal register: persisted record, runtime state and the
//! command channel that drives it.
//!
//! Runtime fields change only through the `on_*` transition functions of
//! [`DeviceRuntime`]. Guards are always taken channel first, runtime second.

use crate::ecr::catalog::{self, ErrorAction, ErrorPolicy};
use crate::ecr::channel::{CommandChannel, Dialect};
use crate::ecr::error::{EcrError, Result};
use crate::ecr::frame::{Command, Opcode, Response};
use crate::ecr::lock::{Acquired, DeviceLock, LockPolicy, OwnerToken};
use crate::ecr::retry::Clock;
use crate::ecr::session::TransportSession;
use crate::ecr::status::{CheckEvent, CheckState, DeviceStatus, FnStatus, ShiftState};
use crate::ecr::transport::{EcrTransport, LinkConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// Four-byte register password. Stored as a number, wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Password([u8; 4]);

impl Password {
    pub fn new(value: u32) -> Self {
        Self(value.to_le_bytes())
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl From<u32> for Password {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Password> for u32 {
    fn from(p: Password) -> Self {
        u32::from_le_bytes(p.0)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(****)")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Identity parameters read from the register and its fiscal storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityParams {
    pub company_name: String,
    pub tax_id: String,
    pub serial_number: String,
    pub registration_number: String,
    pub fn_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub link: LinkConfig,
    pub operator_password: Password,
    pub admin_password: Password,
    /// Printable characters per receipt line.
    pub line_length: u8,
    pub identity: IdentityParams,
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            name: String::new(),
            link: LinkConfig::default(),
            operator_password: Password::new(1),
            admin_password: Password::new(30),
            line_length: 32,
            identity: IdentityParams::default(),
        }
    }
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>, link: LinkConfig) -> Self {
        Self {
            device_id: device_id.into(),
            link,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(EcrError::Config("device_id must not be empty".into()));
        }
        if self.line_length == 0 {
            return Err(EcrError::Config(format!(
                "device {}: line_length must be positive",
                self.device_id
            )));
        }
        self.link.validate()
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DeviceRuntime {
    pub connected: bool,
    pub lock: DeviceLock,
    pub last_error: u8,
    pub status: Option<DeviceStatus>,
    pub fn_status: Option<FnStatus>,
    /// Last shift state derived from a live query; `None` once the link
    /// drops, since the register may have moved on without us.
    pub shift: Option<ShiftState>,
    pub shift_number: Option<u16>,
    pub check: CheckState,
    /// Set once the handle has been replaced in the registry; no new
    /// owner may take it.
    pub retired: bool,
}

impl DeviceRuntime {
    pub fn on_link(&mut self, ready: bool) {
        if self.connected && !ready {
            self.shift = None;
            self.status = None;
            self.check = CheckState::None;
        }
        self.connected = ready;
    }

    pub fn on_answer(&mut self, code: u8) {
        self.last_error = code;
    }

    pub fn on_status(&mut self, status: DeviceStatus) {
        if !status.has_open_document() {
            self.check = CheckState::None;
        }
        self.shift = Some(status.shift_state());
        self.status = Some(status);
    }

    /// Fiscal storage status refines the shift state derived from the
    /// register mode.
    pub fn on_fn_status(&mut self, fn_status: FnStatus) {
        if let Some(status) = &self.status {
            self.shift = Some(fn_status.shift_state(status));
        }
        self.fn_status = Some(fn_status);
    }

    pub fn on_shift(&mut self, state: ShiftState, number: Option<u16>) {
        self.shift = Some(state);
        if number.is_some() {
            self.shift_number = number;
        }
    }

    pub fn on_check(&mut self, event: CheckEvent) -> Result<CheckState> {
        self.check = self.check.apply(event)?;
        Ok(self.check)
    }
}

/// Serializable view of a device for status endpoints and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub name: String,
    pub port: String,
    pub connected: bool,
    pub busy: bool,
    pub holder: Option<OwnerToken>,
    pub dialect: Option<Dialect>,
    pub last_error: u8,
    pub last_error_message: String,
    pub shift: Option<ShiftState>,
    pub shift_number: Option<u16>,
    pub check: CheckState,
    pub status: Option<DeviceStatus>,
    pub fn_status: Option<FnStatus>,
    pub identity: IdentityParams,
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub lock: LockPolicy,
    pub money_digits: u32,
    pub error_policy: ErrorPolicy,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self::new(LockPolicy::default(), 2, ErrorPolicy::default())
    }
}

impl DeviceOptions {
    pub fn new(lock: LockPolicy, money_digits: u32, error_policy: ErrorPolicy) -> Self {
        Self {
            lock,
            money_digits,
            error_policy,
        }
    }
}

pub struct Device {
    id: String,
    record: Mutex<DeviceRecord>,
    runtime: Mutex<DeviceRuntime>,
    channel: Mutex<CommandChannel>,
    clock: Arc<dyn Clock>,
    options: DeviceOptions,
}

/// Lock guard that releases on drop, unless the lock was already held by
/// the same owner when the guard was taken.
pub struct LockGuard<'a> {
    device: &'a Device,
    token: OwnerToken,
    release: bool,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.release && !self.device.release_lock_for(self.token) {
            warn!(
                "Device {}: lock of {} was taken over before release",
                self.device.id, self.token
            );
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Device {
    pub fn new(
        record: DeviceRecord,
        transport: Box<dyn EcrTransport>,
        clock: Arc<dyn Clock>,
        options: DeviceOptions,
    ) -> Self {
        let session = TransportSession::new(
            transport,
            record.link.clone(),
            Arc::clone(&clock),
            record.admin_password.bytes(),
        );
        Self {
            id: record.device_id.clone(),
            record: Mutex::new(record),
            runtime: Mutex::new(DeviceRuntime::default()),
            channel: Mutex::new(CommandChannel::new(session)),
            clock,
            options,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn record(&self) -> DeviceRecord {
        lock_or_recover(&self.record).clone()
    }

    pub fn operator_password(&self) -> [u8; 4] {
        lock_or_recover(&self.record).operator_password.bytes()
    }

    pub fn admin_password(&self) -> [u8; 4] {
        lock_or_recover(&self.record).admin_password.bytes()
    }

    pub fn line_length(&self) -> usize {
        lock_or_recover(&self.record).line_length as usize
    }

    pub fn update_identity(&self, f: impl FnOnce(&mut IdentityParams)) {
        f(&mut lock_or_recover(&self.record).identity);
    }

    pub(crate) fn with_runtime<R>(&self, f: impl FnOnce(&mut DeviceRuntime) -> R) -> R {
        f(&mut lock_or_recover(&self.runtime))
    }

    // -----------------------------------------------------------------------
    // Link
    // -----------------------------------------------------------------------

    pub fn connect(&self) -> Result<()> {
        let mut channel = lock_or_recover(&self.channel);
        let result = channel.connect();
        self.with_runtime(|rt| rt.on_link(result.is_ok()));
        result
    }

    pub fn disconnect(&self) {
        let mut channel = lock_or_recover(&self.channel);
        channel.disconnect();
        self.with_runtime(|rt| rt.on_link(false));
        info!("Device {} disconnected", self.id);
    }

    pub fn is_connected(&self) -> bool {
        self.with_runtime(|rt| rt.connected)
    }

    pub fn dialect(&self) -> Option<Dialect> {
        lock_or_recover(&self.channel).dialect()
    }

    pub fn set_dialect(&self, dialect: Dialect) {
        lock_or_recover(&self.channel).set_dialect(dialect);
    }

    /// One raw exchange. The answer's error code is recorded on the
    /// runtime state whether or not it is zero.
    pub fn send_command(&self, opcode: Opcode, params: &[u8]) -> Result<Response> {
        let mut channel = lock_or_recover(&self.channel);
        let result = channel.send_command(opcode, params);
        let ready = channel.is_ready();
        let mut rt = lock_or_recover(&self.runtime);
        rt.on_link(ready);
        if let Ok(resp) = &result {
            rt.on_answer(resp.error_code);
        }
        result
    }

    /// Send `command`, resolving an advisory answer code once per the
    /// configured error policy.
    pub fn execute(&self, command: Command, params: &[u8]) -> Result<Response> {
        let opcode = command.opcode();
        let response = self.send_command(opcode, params)?;
        let action = self.options.error_policy.action(response.error_code);
        match action {
            ErrorAction::Fail => Ok(response),
            ErrorAction::ContinuePrint => {
                warn!(
                    "Device {}: {opcode} answered 0x{:02X}, continuing print",
                    self.id, response.error_code
                );
                let cont = self.send_command(Command::ContinuePrint.opcode(), &self.admin_password())?;
                if !cont.is_ok() {
                    warn!(
                        "Device {}: continue print refused: {}",
                        self.id,
                        catalog::describe(cont.error_code)
                    );
                }
                self.send_command(opcode, params)
            }
            ErrorAction::RetryAfter { .. } => {
                debug!(
                    "Device {}: {opcode} answered 0x{:02X}, retrying",
                    self.id, response.error_code
                );
                self.clock.sleep(ErrorPolicy::delay(action));
                self.send_command(opcode, params)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lock
    // -----------------------------------------------------------------------

    pub fn acquire_lock(&self, token: OwnerToken) -> Result<Acquired> {
        let now = self.clock.now();
        let max_busy = self.options.lock.max_busy;
        let outcome = self.with_runtime(|rt| {
            (!rt.retired).then(|| rt.lock.acquire(token, now, max_busy))
        });
        let Some(outcome) = outcome else {
            return Err(EcrError::NotRegistered(self.id.clone()));
        };
        match outcome {
            Ok(Acquired::Evicted(stale)) => {
                warn!("Device {}: evicted stale lock holder {stale}", self.id);
                Ok(Acquired::Evicted(stale))
            }
            Ok(acquired) => Ok(acquired),
            Err(holder) => {
                debug!("Device {} busy, held by {holder}", self.id);
                Err(EcrError::Concurrency {
                    device_id: self.id.clone(),
                })
            }
        }
    }

    /// Poll [`Device::acquire_lock`] on the configured retry schedule.
    pub fn acquire_lock_blocking(&self, token: OwnerToken) -> Result<Acquired> {
        let retry = self.options.lock.retry;
        for attempt in 1..=retry.attempts {
            match self.acquire_lock(token) {
                Err(EcrError::Concurrency { .. }) if attempt < retry.attempts => {
                    self.clock.sleep(retry.delay(attempt));
                }
                other => return other,
            }
        }
        Err(EcrError::Concurrency {
            device_id: self.id.clone(),
        })
    }

    /// Clear the lock whoever holds it.
    pub fn release_lock(&self) -> Option<OwnerToken> {
        self.with_runtime(|rt| rt.lock.release())
    }

    /// Release only if `token` still holds the lock.
    pub fn release_lock_for(&self, token: OwnerToken) -> bool {
        self.with_runtime(|rt| rt.lock.release_if(token))
    }

    pub fn lock_guard(&self, token: OwnerToken) -> Result<LockGuard<'_>> {
        let acquired = self.acquire_lock(token)?;
        Ok(LockGuard {
            device: self,
            token,
            release: acquired != Acquired::Reentrant,
        })
    }

    /// Mark the handle as replaced. Refused while a live owner holds it;
    /// a stale holder is evicted first.
    pub(crate) fn retire(&self) -> Result<()> {
        let now = self.clock.now();
        let max_busy = self.options.lock.max_busy;
        self.with_runtime(|rt| {
            rt.lock.evict_stale(now, max_busy);
            match rt.lock.holder() {
                Some(holder) => {
                    debug!("Device {} held by {holder}, not replaced", self.id);
                    Err(EcrError::Concurrency {
                        device_id: self.id.clone(),
                    })
                }
                None => {
                    rt.retired = true;
                    Ok(())
                }
            }
        })
    }

    pub(crate) fn reinstate(&self) {
        self.with_runtime(|rt| rt.retired = false);
    }

    pub fn lock_holder(&self) -> Option<OwnerToken> {
        self.with_runtime(|rt| rt.lock.holder())
    }

    pub fn sweep_stale_lock(&self) -> Option<OwnerToken> {
        let now = self.clock.now();
        let max_busy = self.options.lock.max_busy;
        let evicted = self.with_runtime(|rt| rt.lock.evict_stale(now, max_busy));
        if let Some(token) = evicted {
            warn!("Device {}: swept stale lock held by {token}", self.id);
        }
        evicted
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let record = self.record();
        // A command in flight holds the channel; report the dialect as unknown
        // rather than wait for it.
        let dialect = self.channel.try_lock().ok().and_then(|c| c.dialect());
        self.with_runtime(|rt| DeviceSnapshot {
            device_id: record.device_id,
            name: record.name,
            port: record.link.port,
            connected: rt.connected,
            busy: rt.lock.is_busy(),
            holder: rt.lock.holder(),
            dialect,
            last_error: rt.last_error,
            last_error_message: catalog::describe(rt.last_error).to_string(),
            shift: rt.shift,
            shift_number: rt.shift_number,
            check: rt.check,
            status: rt.status.clone(),
            fn_status: rt.fn_status.clone(),
            identity: record.identity,
        })
    }
}

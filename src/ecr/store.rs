//! Persistence of device records.
//!
//! The registry only needs load/save/delete; records are stored as JSON
//! so new record fields do not need a schema change.

use crate::ecr::device::DeviceRecord;
use crate::ecr::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

pub trait DeviceStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<DeviceRecord>>;
    fn save(&self, record: &DeviceRecord) -> Result<()>;
    /// Returns whether a record was removed.
    fn delete(&self, device_id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, DeviceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, DeviceRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DeviceStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.records().values().cloned().collect())
    }

    fn save(&self, record: &DeviceRecord) -> Result<()> {
        self.records()
            .insert(record.device_id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, device_id: &str) -> Result<bool> {
        Ok(self.records().remove(device_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        info!("Opening device store at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn schema_version(&self) -> Result<i32> {
        Ok(self.conn().query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn load(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM ecr_devices WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;
    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!("Migrating device store from v{current} to v{CURRENT_SCHEMA_VERSION}");
    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

/// v1: device records.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS ecr_devices (
            device_id TEXT PRIMARY KEY,
            record TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;",
    )?;
    Ok(())
}

impl DeviceStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT device_id, record FROM ecr_devices ORDER BY device_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, json) = row?;
            match serde_json::from_str::<DeviceRecord>(&json) {
                Ok(record) => out.push(record),
                Err(e) => warn!("Skipping unreadable record for device {id}: {e}"),
            }
        }
        Ok(out)
    }

    fn save(&self, record: &DeviceRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.conn().execute(
            "INSERT INTO ecr_devices (device_id, record, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(device_id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at",
            params![record.device_id, json],
        )?;
        Ok(())
    }

    fn delete(&self, device_id: &str) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM ecr_devices WHERE device_id = ?1", params![device_id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecr::device::Password;
    use crate::ecr::transport::LinkConfig;

    fn record(id: &str, port: &str) -> DeviceRecord {
        let mut rec = DeviceRecord::new(
            id,
            LinkConfig {
                port: port.into(),
                ..LinkConfig::default()
            },
        );
        rec.admin_password = Password::new(1234);
        rec.identity.tax_id = "7701234567".into();
        rec
    }

    #[test]
    fn test_sqlite_store_migrates_to_current_version() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_sqlite_save_load_replace_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&record("b", "/dev/ttyUSB1")).unwrap();
        store.save(&record("a", "/dev/ttyUSB0")).unwrap();

        let mut updated = record("a", "/dev/ttyS3");
        updated.name = "front desk".into();
        store.save(&updated).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], updated);
        assert_eq!(all[0].admin_password.bytes(), 1234u32.to_le_bytes());

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.load("a").unwrap(), None);
        assert!(store.load("b").unwrap().is_some());
    }

    #[test]
    fn test_sqlite_skips_unreadable_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&record("ok", "/dev/ttyUSB0")).unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO ecr_devices (device_id, record) VALUES ('bad', 'not json')",
                [],
            )
            .unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].device_id, "ok");
    }

    #[test]
    fn test_sqlite_file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("kkm-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("devices.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save(&record("a", "/dev/ttyUSB0")).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
        drop(store);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(&record("a", "/dev/ttyUSB0")).unwrap();
        store.save(&record("a", "/dev/ttyUSB1")).unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].link.port, "/dev/ttyUSB1");
        assert!(store.delete("a").unwrap());
    }
}

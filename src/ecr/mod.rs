//! ECR (Electronic Cash Register) module.
//!
//! Drives fiscal registers over a serial link: the framed ENQ/ACK/NAK
//! protocol, per-device locking, and the shift and check workflow on top.

pub mod catalog;
pub mod channel;
pub mod codepage;
pub mod device;
pub mod device_manager;
pub mod error;
pub mod fiscal;
pub mod frame;
pub mod lock;
pub mod money;
pub mod retry;
pub mod session;
pub mod status;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::Dialect;
pub use device::{Device, DeviceOptions, DeviceRecord, DeviceSnapshot, Password};
pub use device_manager::DeviceRegistry;
pub use error::{EcrError, Result};
pub use fiscal::FiscalWorkflow;
pub use lock::{LockPolicy, OwnerToken};
pub use store::{DeviceStore, MemoryStore, SqliteStore};
pub use transport::LinkConfig;

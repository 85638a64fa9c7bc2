//! KKM Gateway
//!
//! Drives fiscal cash registers (with a fiscal storage module) over a
//! serial link and enforces the shift and check workflow. The [`ecr`]
//! module holds the protocol stack and workflow; [`config`] reads the
//! gateway configuration.

use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod ecr;

pub use config::GatewayConfig;
pub use ecr::{
    Device, DeviceRecord, DeviceRegistry, EcrError, FiscalWorkflow, LinkConfig, OwnerToken,
    Result,
};

/// Install the global subscriber: console plus, when `log_dir` is given, a
/// daily rolling file. Keep the returned guard alive; dropping it flushes
/// the file writer.
pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kkm_gateway=debug"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "kkm-gateway");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| EcrError::Config(format!("logging already initialised: {e}")))?;
    Ok(guard)
}

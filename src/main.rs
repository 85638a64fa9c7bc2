//! Diagnostic command line for the gateway.
//!
//! ```text
//! kkm-gateway [--config FILE] list
//! kkm-gateway [--config FILE] status  <device-id>
//! kkm-gateway [--config FILE] report  <device-id>
//! kkm-gateway [--config FILE] probe   <port>
//! kkm-gateway [--config FILE] unlock  <device-id>
//! ```

use anyhow::{bail, Context, Result};
use kkm_gateway::ecr::retry::SystemClock;
use kkm_gateway::ecr::transport;
use kkm_gateway::{
    init_logging, Device, DeviceRecord, DeviceRegistry, FiscalWorkflow, GatewayConfig,
    LinkConfig, OwnerToken,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const USAGE: &str = "usage: kkm-gateway [--config FILE] <list | status ID | report ID | probe PORT | unlock ID>";

fn take_flag(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.remove(pos);
    (pos < args.len()).then(|| args.remove(pos))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = match take_flag(&mut args, "--config") {
        Some(path) => GatewayConfig::load(Path::new(&path))
            .with_context(|| format!("loading configuration {path}"))?,
        None => GatewayConfig::default(),
    };
    let _guard = init_logging(config.log_dir.as_deref())?;
    info!("Starting kkm-gateway v{}", env!("CARGO_PKG_VERSION"));

    let registry = config.open_registry().context("opening device registry")?;
    let result = run(&config, &registry, &args).await;
    registry.shutdown();
    result
}

async fn run(config: &GatewayConfig, registry: &DeviceRegistry, args: &[String]) -> Result<()> {
    match args {
        [cmd] if cmd == "list" => print_json(&registry.snapshots()),
        [cmd, id] if cmd == "status" => {
            let snapshot = registry
                .run_blocking(id, |device| {
                    let wf = FiscalWorkflow::new(device, OwnerToken::new());
                    wf.query_status()?;
                    wf.query_fn_status()?;
                    Ok(device.snapshot())
                })
                .await
                .with_context(|| format!("querying {id}"))?;
            registry.persist(id)?;
            print_json(&snapshot)
        }
        [cmd, id] if cmd == "report" => {
            let report = registry
                .run_blocking(id, |device| {
                    FiscalWorkflow::new(device, OwnerToken::new()).current_status()
                })
                .await
                .with_context(|| format!("reading current status of {id}"))?;
            print_json(&report)
        }
        [cmd, port] if cmd == "probe" => {
            let record = DeviceRecord::new(
                "probe",
                LinkConfig {
                    port: port.clone(),
                    ..LinkConfig::default()
                },
            );
            let device = Device::new(
                record.clone(),
                transport::create_transport(&record.link)?,
                Arc::new(SystemClock),
                config.device_options(),
            );
            let kind = tokio::task::spawn_blocking(move || {
                let wf = FiscalWorkflow::new(&device, OwnerToken::new());
                let kind = wf.device_type()?;
                wf.query_status()?;
                device.disconnect();
                Ok::<_, kkm_gateway::EcrError>((kind, device.snapshot()))
            })
            .await?
            .with_context(|| format!("probing {port}"))?;
            print_json(&kind.0)?;
            print_json(&kind.1)
        }
        [cmd, id] if cmd == "unlock" => {
            let previous = registry.lookup(id)?.release_lock();
            match previous {
                Some(token) => println!("released lock held by {token}"),
                None => println!("{id} was not locked"),
            }
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

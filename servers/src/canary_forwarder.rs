//! # Canary Forwarder
//!
//! Polls one Canary historian dataset and republishes every new sample as a
//! JSON message on an MQTT topic, tracking progress in a durable watermark.
//!
//! Exit status is 0 after a signal-driven shutdown and non-zero on invalid
//! configuration, a permanent historian error (unless
//! `ON_PERMANENT_READ_ERROR=pause`) or a watermark invariant violation.

use anyhow::Result;

use lib_common::configs;
use lib_common::loggers;

mod forwarder_logic;
use forwarder_logic::{health, runtime, shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    let config = configs::load_config()?;
    let _log_guard = loggers::setup_logging(&config.logging)?;
    runtime::log_summary(&config);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let loop_shutdown = shutdown_tx.subscribe();

    let health_handle = config.health_port.map(|port| {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, rx).await {
                log::error!("Health endpoint failed: {:#}", e);
            }
        })
    });

    let signal_handle = tokio::spawn(shutdown::listen(shutdown_tx.clone()));

    let result = runtime::run(config, loop_shutdown).await;

    // The loop may have stopped on its own; release the other tasks.
    signal_handle.abort();
    let _ = shutdown_tx.send(());
    if let Some(handle) = health_handle {
        let _ = handle.await;
    }

    match &result {
        Ok(()) => log::info!("Shutdown complete."),
        Err(e) => log::error!("Canary forwarder failed: {:#}", e),
    }
    result
}

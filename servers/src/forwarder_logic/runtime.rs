//! # Forwarder Runtime
//!
//! Assembles the watermark store, the Canary reader and the MQTT publisher
//! from a validated configuration and drives the forward loop until it
//! stops.

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use lib_common::broker::MqttPublisher;
use lib_common::configs::ForwarderConfig;
use lib_common::core::{FileWatermarkStore, ForwardLoop, MemoryWatermarkStore, Watermark, WatermarkStore};
use lib_common::historian::{CanaryAuth, CanaryReader};

/// Logs the effective settings without credentials.
pub fn log_summary(config: &ForwarderConfig) {
    let auth = match &config.canary.auth {
        CanaryAuth::ApiToken(_) => "api token".to_string(),
        CanaryAuth::User { username: Some(user), .. } => format!("user '{}'", user),
        CanaryAuth::User { username: None, .. } => "anonymous session".to_string(),
    };
    log::info!("Canary Views at {} ({})", config.canary.base_url, auth);
    log::info!(
        "MQTT broker {}:{} as '{}', QoS {:?}",
        config.mqtt.host,
        config.mqtt.port,
        config.mqtt.client_id,
        config.mqtt.qos
    );
    match &config.watermark_path {
        Some(path) => log::info!("Watermark file {}", path.display()),
        None => log::warn!("No WATERMARK_PATH set; progress is kept in memory and lost on restart."),
    }
}

/// Runs the forwarder until shutdown or a fatal error.
///
/// `shutdown_rx` must be subscribed before signals are listened for so an
/// early signal is not lost.
pub async fn run(config: ForwarderConfig, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    match config.watermark_path.clone() {
        Some(path) => {
            let store = FileWatermarkStore::open(&path)
                .with_context(|| format!("cannot open watermark file {}", path.display()))?;
            forward(config, store, shutdown_rx).await
        }
        None => forward(config, MemoryWatermarkStore::new(), shutdown_rx).await,
    }
}

async fn forward<S: WatermarkStore>(
    config: ForwarderConfig,
    store: S,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    // --- Phase 1: Watermark ---
    let mut watermark = Watermark::open(&config.forward.dataset_id, store, config.watermark_seed)
        .context("cannot initialise the watermark")?;

    // --- Phase 2: Endpoints ---
    let reader = CanaryReader::new(config.canary)?;
    let publisher = MqttPublisher::new(config.mqtt);

    // --- Phase 3: Forward Loop ---
    let mut forward_loop = ForwardLoop::new(reader, publisher, config.forward);
    let result = forward_loop.run(&mut watermark, &mut shutdown_rx).await;

    // --- Phase 4: Release Sessions ---
    let (mut reader, mut publisher) = forward_loop.into_parts();
    reader.close().await;
    publisher.close().await;

    result?;
    Ok(())
}

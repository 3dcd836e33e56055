//! disp-daemon entry point.
//!
//! Thin on purpose: loads configuration, opens the store, connects to the
//! broker, and spawns the watchdog / initial-dispatch / event-loop tasks.
//! All dispatch and join logic lives in `disp-core`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use disp_core::{AdvisoryReadiness, Dispatcher, Handlers};
use disp_daemon::{mqtt_broker, watchdog};
use disp_store::Store;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    mqtt_broker::init_tracing();

    let config_path = std::env::var("DISP_CONFIG_FILE").ok().map(std::path::PathBuf::from);
    let config = Arc::new(
        disp_config::load(config_path.as_deref()).context("loading dispatcher configuration")?,
    );

    let store = Arc::new(
        Store::connect(&config.sqlite_path)
            .await
            .context("opening dispatcher store")?,
    );

    let (broker, client, eventloop) = mqtt_broker::connect(&config);
    mqtt_broker::subscribe_all(&client, &config)
        .await
        .context("subscribing to broker topics")?;

    let advisory = Arc::new(AdvisoryReadiness::new());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(broker),
        config.clone(),
        advisory.clone(),
    ));
    let handlers = Handlers {
        store: store.clone(),
        dispatcher: dispatcher.clone(),
        advisory: advisory.clone(),
    };

    info!(
        broker_host = %config.broker_host,
        broker_port = config.broker_port,
        sqlite_path = %config.sqlite_path,
        "disp-daemon starting"
    );

    let watchdog_handle = tokio::spawn(watchdog::run(
        handlers.clone(),
        Duration::from_millis(config.watchdog_interval_ms),
    ));
    let initial_dispatch_handle = tokio::spawn(watchdog::run_initial_dispatch(
        handlers.clone(),
        Duration::from_millis(config.initial_dispatch_delay_ms),
    ));
    let event_loop_handle = tokio::spawn(mqtt_broker::run_event_loop(eventloop, handlers));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = event_loop_handle => {
            info!("mqtt event loop exited");
        }
    }

    watchdog_handle.abort();
    initial_dispatch_handle.abort();
    Ok(())
}

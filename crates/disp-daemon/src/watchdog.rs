//! Liveness backstop: polls on a fixed interval and re-evaluates the
//! dispatch condition even when no broker event triggered it. Guarantees
//! progress if an edge was missed (message arrived before the dispatcher
//! subscribed, or a completion race left advisory flags stale — the DB
//! remains authoritative either way, this task just calls `dispatch()`
//! again).

use std::time::Duration;

use disp_core::Handlers;
use tracing::{debug, error};

pub async fn run(handlers: Handlers, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match handlers.dispatch().await {
            Ok(outcome) => debug!(?outcome, "watchdog tick"),
            Err(err) => error!(error = %err, "watchdog dispatch attempt failed"),
        }
    }
}

/// Fires `dispatch()` once, a few seconds after process startup, covering
/// the case where both nodes were already retained-ready on the broker
/// before this process subscribed.
pub async fn run_initial_dispatch(handlers: Handlers, delay: Duration) {
    tokio::time::sleep(delay).await;
    match handlers.dispatch().await {
        Ok(outcome) => debug!(?outcome, "initial dispatch attempt"),
        Err(err) => error!(error = %err, "initial dispatch attempt failed"),
    }
}

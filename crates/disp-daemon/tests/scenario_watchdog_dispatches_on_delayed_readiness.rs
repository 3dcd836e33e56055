//! Scenario: a node-state message that arrives before the daemon has ever
//! run a dispatch attempt must still get picked up by the watchdog's next
//! tick — the watchdog is the liveness backstop when an edge was missed.

use std::sync::Arc;
use std::time::Duration;

use disp_config::Config;
use disp_core::{AdvisoryReadiness, Dispatcher, Handlers, NoopBroker};
use disp_daemon::watchdog;
use disp_schemas::{NewQueueItem, PillType, QueueStatus};
use disp_store::Store;
use sqlx::sqlite::SqlitePoolOptions;

async fn test_handlers(debounce_ms: i64) -> Handlers {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(Store::connect_pool(pool).await.unwrap());
    let mut cfg = Config::default();
    cfg.debounce_ms = debounce_ms;
    cfg.watchdog_interval_ms = 20;
    let advisory = Arc::new(AdvisoryReadiness::new());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(NoopBroker),
        Arc::new(cfg),
        advisory.clone(),
    ));
    Handlers {
        store,
        dispatcher,
        advisory,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn watchdog_claims_a_pending_queue_once_both_nodes_are_ready() {
    let handlers = test_handlers(0).await;
    handlers.store.insert_pill("aspirin", PillType::Solid, 100).await.unwrap();
    let queue_id = handlers
        .store
        .create_queue(1, 1, 1, &[NewQueueItem { pill_id: 1, quantity: 2 }])
        .await
        .unwrap();

    // Readiness is recorded directly against the store, as if a node-state
    // message had arrived and been upserted before this process ever called
    // dispatch() itself.
    handlers.store.upsert_node_status(1, true, true, Some(1)).await.unwrap();
    handlers.store.upsert_node_status(2, true, true, Some(1)).await.unwrap();

    assert_eq!(
        handlers.store.get_queue(queue_id).await.unwrap().unwrap().status,
        QueueStatus::Pending
    );

    let watchdog_handle = tokio::spawn(watchdog::run(handlers.clone(), Duration::from_millis(20)));
    tokio::time::sleep(Duration::from_millis(120)).await;
    watchdog_handle.abort();

    assert_eq!(
        handlers.store.get_queue(queue_id).await.unwrap().unwrap().status,
        QueueStatus::InProgress
    );
}

#[tokio::test]
async fn initial_dispatch_timer_fires_once_after_the_configured_delay() {
    let handlers = test_handlers(0).await;
    handlers.store.insert_pill("x", PillType::Solid, 10).await.unwrap();
    let queue_id = handlers
        .store
        .create_queue(1, 1, 1, &[NewQueueItem { pill_id: 1, quantity: 1 }])
        .await
        .unwrap();
    handlers.store.upsert_node_status(1, true, true, Some(1)).await.unwrap();
    handlers.store.upsert_node_status(2, true, true, Some(1)).await.unwrap();

    watchdog::run_initial_dispatch(handlers.clone(), Duration::from_millis(10)).await;

    assert_eq!(
        handlers.store.get_queue(queue_id).await.unwrap().unwrap().status,
        QueueStatus::InProgress
    );
}

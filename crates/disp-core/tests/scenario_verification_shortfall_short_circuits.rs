//! Scenario 5: a node's `detected` count falling short of the expected sum
//! immediately fails the queue and the other node's later completion must
//! not re-open it.

use std::sync::Arc;

use disp_config::Config;
use disp_core::{AdvisoryReadiness, Dispatcher, Handlers, NoopBroker};
use disp_schemas::{NewQueueItem, PillType, QueueStatus};
use disp_store::Store;
use sqlx::sqlite::SqlitePoolOptions;

async fn test_handlers() -> Handlers {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(Store::connect_pool(pool).await.unwrap());
    let mut cfg = Config::default();
    cfg.debounce_ms = 0;
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

#[tokio::test]
async fn detected_below_expected_fails_immediately_and_ignores_the_later_companion() {
    let h = test_handlers().await;
    h.store.insert_pill("aspirin", PillType::Solid, 100).await.unwrap();
    let queue_id = h
        .store
        .create_queue(1, 1, 1, &[NewQueueItem { pill_id: 1, quantity: 5 }])
        .await
        .unwrap();
    h.store.claim_pending(queue_id).await.unwrap();

    h.handle_raw(
        "disp/evt/2",
        format!(r#"{{"queue_id":{queue_id},"done":1,"status":"success","detected":3}}"#).as_bytes(),
    )
    .await
    .unwrap();

    let queue = h.store.get_queue(queue_id).await.unwrap().unwrap();
    assert_eq!(queue.status, QueueStatus::Failed);
    assert_eq!(
        queue.failed_reason.as_deref(),
        Some("verification_failed_node2:detected=3:expected=5")
    );

    // node 1's later completion must not re-open the queue.
    h.handle_raw(
        "disp/evt/1",
        format!(r#"{{"queue_id":{queue_id},"done":1,"status":"success"}}"#).as_bytes(),
    )
    .await
    .unwrap();
    let queue = h.store.get_queue(queue_id).await.unwrap().unwrap();
    assert_eq!(queue.status, QueueStatus::Failed, "a terminal queue must never transition again (I2)");
}

//! Ties the router's classification to the store and the dispatcher: the
//! part of the system the spec calls the Completion Joiner plus the
//! ack/state bookkeeping that surrounds it. One function per message kind,
//! all taking a `&Store` and (where relevant) a `&Dispatcher` so a single
//! transaction-then-trigger-dispatch flow is the only path through this
//! module — matching the design note that the second arriving node must
//! always observe the first's event inside one transaction, and that
//! `dispatch()` is only ever called after that transaction has committed.

use std::sync::Arc;

use disp_schemas::event_kind;
use disp_store::{JoinOutcome, Store};
use tracing::{info, warn};

use crate::advisory::AdvisoryReadiness;
use crate::dispatcher::Dispatcher;
use crate::router::ClassifiedMessage;

/// Handles a parse failure from the router: append `ack_parse_error` and
/// drop. `queue_id` is unknown at this point (the payload didn't parse), so
/// the event is logged against no queue.
pub async fn handle_route_error(store: &Store, topic: &str, err: &crate::router::RouteError) -> anyhow::Result<()> {
    warn!(topic, error = %err, "malformed inbound payload");
    store
        .insert_event(
            None,
            event_kind::ACK_PARSE_ERROR,
            &serde_json::json!({ "topic": topic, "error": err.to_string() }).to_string(),
        )
        .await?;
    Ok(())
}

/// Dispatches one classified message to its handler. Returns once the
/// message has been fully processed, including any dispatch trigger.
pub async fn handle(
    store: &Store,
    dispatcher: &Dispatcher,
    advisory: &AdvisoryReadiness,
    msg: ClassifiedMessage,
) -> anyhow::Result<()> {
    match msg {
        ClassifiedMessage::Ack {
            node_id,
            queue_id,
            accepted,
        } => handle_ack(store, node_id, queue_id, accepted).await,
        ClassifiedMessage::Completion {
            node_id,
            queue_id,
            raw_payload,
            status,
            detected,
        } => handle_completion(store, dispatcher, advisory, node_id, queue_id, &raw_payload, status, detected).await,
        ClassifiedMessage::NodeState {
            node_id,
            online,
            ready,
            uptime,
        } => handle_node_state(store, dispatcher, node_id, online, ready, uptime).await,
        ClassifiedMessage::Vision { queue_id, count_detected } => handle_vision(store, queue_id, count_detected).await,
        ClassifiedMessage::Unknown => handle_unknown(store).await,
    }
}

async fn handle_ack(store: &Store, node_id: Option<i64>, queue_id: Option<i64>, accepted: bool) -> anyhow::Result<()> {
    let kind = if accepted {
        event_kind::ACK_ACCEPTED
    } else {
        event_kind::ACK_REJECTED
    };
    info!(?node_id, ?queue_id, accepted, "ack received");
    store
        .insert_event(
            queue_id,
            kind,
            &serde_json::json!({ "node_id": node_id, "accepted": accepted }).to_string(),
        )
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_completion(
    store: &Store,
    dispatcher: &Dispatcher,
    advisory: &AdvisoryReadiness,
    node_id: Option<i64>,
    queue_id: Option<i64>,
    raw_payload: &str,
    status: Option<String>,
    detected: Option<i64>,
) -> anyhow::Result<()> {
    let Some(node_id) = node_id else {
        warn!(raw_payload, "completion message without a parseable node id in its topic; dropped");
        return Ok(());
    };
    let Some(queue_id) = queue_id else {
        warn!(node_id, raw_payload, "completion message without a queue_id; dropped");
        return Ok(());
    };

    let outcome = store
        .record_completion(queue_id, node_id, raw_payload, status.as_deref(), detected)
        .await?;

    match outcome {
        JoinOutcome::Duplicate => {
            warn!(queue_id, node_id, "duplicate completion event dropped (I3)");
        }
        JoinOutcome::Recorded { finalized } => {
            advisory.set(node_id, true);
            if let Some(finalized) = &finalized {
                info!(
                    queue_id,
                    node_id,
                    status = finalized.status.as_str(),
                    reason = ?finalized.reason,
                    "queue finalized"
                );
            } else {
                info!(queue_id, node_id, "first node completion recorded; awaiting companion");
            }
            let dispatch_outcome = dispatcher.dispatch().await?;
            info!(queue_id, node_id, ?dispatch_outcome, "dispatch re-evaluated after completion");
        }
    }
    Ok(())
}

async fn handle_node_state(
    store: &Store,
    dispatcher: &Dispatcher,
    node_id: Option<i64>,
    online: Option<bool>,
    ready: Option<bool>,
    uptime: Option<i64>,
) -> anyhow::Result<()> {
    let Some(node_id) = node_id else {
        warn!("node-state message without a parseable node id in its topic; dropped");
        return Ok(());
    };

    let existing = store.get_node_status(node_id).await?;
    let online = online.unwrap_or_else(|| existing.as_ref().map(|s| s.online).unwrap_or(false));
    let ready = ready.unwrap_or_else(|| existing.as_ref().map(|s| s.ready).unwrap_or(false));

    let updated = store.upsert_node_status(node_id, online, ready, uptime).await?;
    store
        .insert_event(
            None,
            event_kind::NODE_STATE,
            &serde_json::json!({ "node_id": node_id, "online": online, "ready": ready, "uptime": uptime }).to_string(),
        )
        .await?;
    info!(node_id, online = updated.online, ready = updated.ready, "node state updated");

    let dispatch_outcome = dispatcher.dispatch().await?;
    info!(node_id, ?dispatch_outcome, "dispatch re-evaluated after node state");
    Ok(())
}

async fn handle_vision(store: &Store, queue_id: Option<i64>, count_detected: i64) -> anyhow::Result<()> {
    info!(?queue_id, count_detected, "standalone vision report");
    store.record_vision_report(queue_id, count_detected).await?;
    Ok(())
}

async fn handle_unknown(store: &Store) -> anyhow::Result<()> {
    warn!("message classified as unknown shape");
    store
        .insert_event(None, event_kind::ACK_UNKNOWN, &serde_json::json!({}).to_string())
        .await?;
    Ok(())
}

/// Convenience wrapper used by `disp-daemon`'s broker event loop: classifies
/// the raw message and routes it, recording an `ack_parse_error` event on a
/// classification failure instead of propagating the error (the spec's
/// error-handling table treats a malformed inbound payload as "append and
/// drop", never as a reason to tear down the event loop).
pub async fn handle_raw(
    store: &Store,
    dispatcher: &Dispatcher,
    advisory: &AdvisoryReadiness,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    match crate::router::classify(topic, payload) {
        Ok(msg) => handle(store, dispatcher, advisory, msg).await,
        Err(err) => handle_route_error(store, topic, &err).await,
    }
}

/// Thin `Arc`-owning facade the daemon's long-lived tasks hold onto; keeps
/// `main.rs` from threading four separate `Arc`s through every task spawn.
#[derive(Clone)]
pub struct Handlers {
    pub store: Arc<Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub advisory: Arc<AdvisoryReadiness>,
}

impl Handlers {
    pub async fn handle_raw(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        handle_raw(&self.store, &self.dispatcher, &self.advisory, topic, payload).await
    }

    pub async fn dispatch(&self) -> anyhow::Result<crate::dispatcher::DispatchOutcome> {
        self.dispatcher.dispatch().await
    }
}

//! The single choke-point through which the dispatcher publishes to the
//! broker. Kept as a trait (rather than a concrete MQTT client type) so the
//! dispatch algorithm in `dispatcher.rs` and its tests never depend on a
//! live broker connection, and so `disp-daemon` can fall back to a
//! [`NoopBroker`] when the real connection drops instead of crashing.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` to `topic` at QoS 1, not retained. Errors are the
    /// caller's to log; a publish failure never rolls back a claim (claim
    /// precedes publish, so a queue is never "in progress" without having
    /// been claimed first, even if the publish itself is lost).
    async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()>;
}

/// Used when the broker connection is down. Every publish "succeeds" from
/// the dispatcher's point of view (so dispatch logic doesn't need a special
/// failure path) but is logged as skipped rather than silently dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroker;

#[async_trait]
impl Broker for NoopBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        warn!(topic, bytes = payload.len(), "broker disconnected; publish skipped");
        Ok(())
    }
}

//! Adapts `rumqttc::AsyncClient` to the `disp_core::Broker` trait, and runs
//! the event loop that turns inbound publishes into calls on
//! `disp_core::Handlers`.

use std::time::Duration;

use async_trait::async_trait;
use disp_config::Config;
use disp_core::{Broker, Handlers};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{error, warn};

pub struct MqttBroker {
    client: AsyncClient,
}

impl MqttBroker {
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| anyhow::anyhow!("mqtt publish to {topic} failed: {e}"))
    }
}

/// Connects to the broker and subscribes to the three handler wildcards
/// plus the standalone vision wildcard. Returns the `Broker` impl (for the
/// dispatcher) and a future that drives the event loop until the process
/// shuts down.
pub fn connect(config: &Config) -> (MqttBroker, AsyncClient, rumqttc::EventLoop) {
    let mut opts = MqttOptions::new(config.client_id.clone(), config.broker_host.clone(), config.broker_port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(opts, 64);
    (MqttBroker { client: client.clone() }, client, eventloop)
}

pub async fn subscribe_all(client: &AsyncClient, config: &Config) -> anyhow::Result<()> {
    client.subscribe(config.topic_ack_wildcard(), QoS::AtLeastOnce).await?;
    client.subscribe(config.topic_evt_wildcard(), QoS::AtLeastOnce).await?;
    client.subscribe(config.topic_state_wildcard(), QoS::AtLeastOnce).await?;
    client.subscribe(config.topic_vision_wildcard(), QoS::AtLeastOnce).await?;
    Ok(())
}

/// Drives `eventloop.poll()` forever, dispatching each inbound `Publish`
/// packet to `handlers`. `rumqttc` reconnects on its own with the backoff
/// baked into `MqttOptions`; a poll error is logged and retried rather than
/// treated as fatal, matching the "broker disconnected: fall back, don't
/// crash" policy.
pub async fn run_event_loop(mut eventloop: rumqttc::EventLoop, handlers: Handlers) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                let payload = publish.payload.to_vec();
                if let Err(err) = handlers.handle_raw(&topic, &payload).await {
                    error!(topic, error = %err, "inbound message handling failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt event loop error; retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// `RUST_LOG` wins if set; otherwise `DISP_LOG`; otherwise `info`.
pub fn init_tracing() {
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("DISP_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

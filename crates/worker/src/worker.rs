use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use siwatt_common::config::{TopicMode, WorkerConfig};
use siwatt_common::types::{BufferedRecord, Sample};
use siwatt_common::WorkerError;

use crate::buffer::recovery::RecoveryManager;
use crate::buffer::FileBuffer;
use crate::pipeline::PipelineRegistry;
use crate::store::StoreClient;

/// Keys a payload must carry to be enqueued.
const REQUIRED_FIELDS: &[&str] = &[
    "datetime",
    "voltage",
    "current",
    "power",
    "energy",
    "frequency",
    "pf",
];

/// Extract `(username, device_code)` from a publish topic, or `None` when the
/// topic does not match the configured shape.
pub fn parse_topic(mode: TopicMode, topic: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = topic.split('/').filter(|part| !part.is_empty()).collect();

    match (mode, parts.as_slice()) {
        (TopicMode::Simple, [username, "swm-raw", device_code]) => {
            Some(((*username).to_string(), (*device_code).to_string()))
        }
        (TopicMode::Prefixed, ["siwatt-mqtt", username, "swm-raw", device_code]) => {
            Some(((*username).to_string(), (*device_code).to_string()))
        }
        _ => None,
    }
}

/// The ingestion worker: subscribes to the raw-measurement wildcard, gates
/// and resolves each message, and drives it through the per-device buffer
/// and aggregation pipeline.
pub struct IngestWorker {
    config: WorkerConfig,
    store: Arc<StoreClient>,
    buffer: FileBuffer,
    registry: PipelineRegistry,
}

impl IngestWorker {
    pub fn new(config: WorkerConfig, store: Arc<StoreClient>, buffer: FileBuffer) -> Self {
        let registry = PipelineRegistry::new(Arc::clone(&store), config.balance_mode);
        Self {
            config,
            store,
            buffer,
            registry,
        }
    }

    /// Replay crash-stranded buffers, then serve the subscription until the
    /// process is terminated.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        RecoveryManager::new(&self.buffer)
            .replay_all(&mut self.registry)
            .await?;

        let mqtt = &self.config.mqtt;
        let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.broker.clone(), mqtt.port);
        options.set_keep_alive(Duration::from_secs(60));
        if let Some(username) = &mqtt.username {
            options.set_credentials(username.clone(), mqtt.password.as_deref().unwrap_or(""));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let wildcard = mqtt.topic_wildcard.clone();

        loop {
            match event_loop.poll().await {
                // Re-subscribe on every (re)connect so broker restarts do not
                // silently drop the subscription.
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    match client.subscribe(wildcard.as_str(), QoS::AtLeastOnce).await {
                        Ok(()) => tracing::info!(topic = %wildcard, "subscribed"),
                        Err(err) => tracing::error!(error = %err, "subscribe failed"),
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_publish(&mut self, topic: &str, payload: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(topic, error = %err, "payload is not valid JSON, dropped");
                metrics::counter!("worker.samples.dropped", "reason" => "decode").increment(1);
                return;
            }
        };
        self.handle_message(topic, value).await;
    }

    /// Validate, resolve and enqueue one decoded message, then drain the
    /// device's buffer through its pipeline.
    pub async fn handle_message(&mut self, topic: &str, payload: serde_json::Value) {
        metrics::counter!("worker.samples.received").increment(1);

        let Some((username, device_code)) = parse_topic(self.config.mqtt.topic_mode, topic) else {
            tracing::warn!(topic, "topic does not match expected shape, dropped");
            metrics::counter!("worker.samples.dropped", "reason" => "topic").increment(1);
            return;
        };

        if let Some(claimed) = payload.get("device_id").and_then(|v| v.as_str()) {
            if !claimed.is_empty() && claimed != device_code {
                tracing::warn!(
                    topic,
                    payload_device_id = claimed,
                    device_code = %device_code,
                    "payload device id does not match topic, dropped"
                );
                metrics::counter!("worker.samples.dropped", "reason" => "mismatch").increment(1);
                return;
            }
        }

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .filter(|field| payload.get(**field).is_none())
            .copied()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(topic, ?missing, "payload missing required fields, dropped");
            metrics::counter!("worker.samples.dropped", "reason" => "fields").increment(1);
            return;
        }

        let sample: Sample = match serde_json::from_value(payload) {
            Ok(sample) => sample,
            Err(err) => {
                tracing::warn!(topic, error = %err, "payload fields have unexpected types, dropped");
                metrics::counter!("worker.samples.dropped", "reason" => "fields").increment(1);
                return;
            }
        };

        let device = match self.store.resolve_device(&username, &device_code).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                tracing::warn!(%username, %device_code, "unknown device, dropped");
                metrics::counter!("worker.samples.dropped", "reason" => "unknown_device")
                    .increment(1);
                return;
            }
            Err(err) => {
                tracing::error!(%username, %device_code, error = %err, "device lookup failed, dropped");
                metrics::counter!("worker.samples.dropped", "reason" => "lookup").increment(1);
                return;
            }
        };

        let mqtt_datetime = sample.datetime.clone();
        let record = BufferedRecord {
            username,
            device_code: device_code.clone(),
            device_id: device.id,
            payload: sample,
        };

        if let Err(err) = self.buffer.append(&device_code, &record).await {
            tracing::error!(%device_code, error = %err, "buffer append failed, message lost");
            return;
        }

        let handler = self.registry.pipeline(&device_code);
        match self.buffer.process(&device_code, handler).await {
            Ok(outcome) => tracing::info!(
                %device_code,
                %mqtt_datetime,
                processed = outcome.processed,
                remaining = outcome.remaining,
                "buffer drained"
            ),
            Err(err) => tracing::error!(%device_code, error = %err, "buffer processing failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_topic_parses() {
        assert_eq!(
            parse_topic(TopicMode::Prefixed, "/siwatt-mqtt/alice/swm-raw/SWM001"),
            Some(("alice".into(), "SWM001".into()))
        );
    }

    #[test]
    fn prefixed_topic_rejects_wrong_literals_and_arity() {
        assert!(parse_topic(TopicMode::Prefixed, "/other/alice/swm-raw/SWM001").is_none());
        assert!(parse_topic(TopicMode::Prefixed, "/siwatt-mqtt/alice/raw/SWM001").is_none());
        assert!(parse_topic(TopicMode::Prefixed, "/siwatt-mqtt/alice/swm-raw").is_none());
        assert!(parse_topic(TopicMode::Prefixed, "alice/swm-raw/SWM001").is_none());
        assert!(parse_topic(TopicMode::Prefixed, "").is_none());
    }

    #[test]
    fn simple_topic_parses() {
        assert_eq!(
            parse_topic(TopicMode::Simple, "alice/swm-raw/SWM001"),
            Some(("alice".into(), "SWM001".into()))
        );
        // Leading or doubled slashes collapse to the same segments.
        assert_eq!(
            parse_topic(TopicMode::Simple, "/alice//swm-raw/SWM001"),
            Some(("alice".into(), "SWM001".into()))
        );
    }

    #[test]
    fn simple_topic_rejects_prefixed_shape() {
        assert!(parse_topic(TopicMode::Simple, "/siwatt-mqtt/alice/swm-raw/SWM001").is_none());
        assert!(parse_topic(TopicMode::Simple, "alice/other/SWM001").is_none());
    }
}

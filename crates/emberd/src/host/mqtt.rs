//! Direct broker connection for feedback publishes.
//!
//! The scene apps push LED/indicator payloads to device-addressed topics.
//! When no broker is configured the bridge relays those publishes through
//! the host's mqtt service instead, so this client stays outbound-only.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::MqttOptions;
use rumqttc::QoS;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::HostError;
use crate::config::MqttConfig;

/// Trait for broker operations
///
/// This trait allows for mocking the broker connection for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the broker
    async fn connect(&mut self) -> Result<(), HostError>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), HostError>;
}

/// Real broker client implementation using rumqttc
pub struct RumqttcClient {
    /// Connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    pub fn new(config: &MqttConfig) -> Self {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Self {
            mqtt_options,
            client: None,
            event_loop_task: None,
        }
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), HostError> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);

        // Nothing is subscribed; the event loop only keeps the connection
        // alive and surfaces broker errors.
        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => debug!("broker event: {:?}", event),
                    Err(e) => {
                        warn!("broker event loop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        self.client = Some(client);
        self.event_loop_task = Some(task);

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), HostError> {
        let client = self.client.as_ref().ok_or(HostError::NotConnected)?;

        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| HostError::Transport(e.to_string()))
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

/// Mock broker client for testing
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub published: std::sync::Mutex<Vec<(String, String)>>,
}

// Implemented on Arc so tests can hand the client to a bridge and keep a
// handle for inspection.
#[cfg(test)]
#[async_trait]
impl MqttClient for std::sync::Arc<MockMqttClient> {
    async fn connect(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), HostError> {
        if let Ok(mut published) = self.published.lock() {
            published.push((
                topic.to_string(),
                String::from_utf8_lossy(payload).to_string(),
            ));
        }
        Ok(())
    }
}

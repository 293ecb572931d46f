//! MQTT TTS transport.
//!
//! Commands go out on `{base}/say` and `{base}/cancel`; the engine
//! reports utterance lifecycle on `{base}/status` as JSON
//! `{"id": ..., "state": "READY|START|SPEAKING|DONE|CANCELLED|ERROR"}`.

use crate::error::{Result, ServiceError};
use crate::tts::backend::{StatusRegistry, TtsBackend, TtsState};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// MQTT connection and topic configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MqttTtsConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

fn default_port() -> u16 {
    1883
}

fn default_base_topic() -> String {
    "tts".to_string()
}

impl Default for MqttTtsConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            base_topic: default_base_topic(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    id: String,
    #[serde(default)]
    state: String,
}

/// TTS backend over an MQTT broker.
pub struct MqttTts {
    client: AsyncClient,
    say_topic: String,
    cancel_topic: String,
    connected: Arc<AtomicBool>,
}

impl MqttTts {
    /// Connect to the broker and start the status event pump.
    pub async fn connect(config: MqttTtsConfig, registry: StatusRegistry) -> Result<Self> {
        if config.host.is_empty() {
            return Err(ServiceError::Tts("no MQTT host configured".to_string()));
        }

        let client_id = format!("golem-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(60));
        if !config.username.is_empty() || !config.password.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let status_topic = format!("{}/status", config.base_topic);
        client
            .subscribe(status_topic.clone(), QoS::AtMostOnce)
            .await
            .map_err(|e| ServiceError::Tts(format!("subscribe: {e}")))?;

        let connected = Arc::new(AtomicBool::new(false));
        let connected_flag = connected.clone();
        let pump_topic = status_topic.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        connected_flag.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic != pump_topic {
                            continue;
                        }
                        match serde_json::from_slice::<StatusPayload>(&publish.payload) {
                            Ok(status) if !status.id.is_empty() => {
                                if let Some(state) = TtsState::from_wire(&status.state) {
                                    debug!(id = %status.id, ?state, "TTS status");
                                    registry.set(&status.id, state);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => debug!(error = %e, "malformed TTS status payload"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected_flag.store(false, Ordering::SeqCst);
                        warn!(error = %e, "MQTT connection lost, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            say_topic: format!("{}/say", config.base_topic),
            cancel_topic: format!("{}/cancel", config.base_topic),
            connected,
        })
    }
}

#[async_trait]
impl TtsBackend for MqttTts {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn is_available(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn say(&self, id: &str, text: &str) -> Result<()> {
        let payload = serde_json::json!({ "id": id, "text": text }).to_string();
        self.client
            .publish(self.say_topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| {
                error!(error = %e, "MQTT say publish failed");
                ServiceError::Tts(format!("publish: {e}"))
            })
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let payload = serde_json::json!({ "id": id }).to_string();
        self.client
            .publish(self.cancel_topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ServiceError::Tts(format!("cancel publish: {e}")))
    }
}

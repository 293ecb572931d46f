//! Startup dependency checks.
//!
//! Validates the external collaborators (STT endpoint, chat model, MQTT
//! broker when selected) before the main loop starts; a missing service
//! aborts launch with a clear message instead of failing mid-dialogue.

use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use golem_services::{LlmClient, SttClient};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::time::Duration;
use tracing::info;

/// Run all configured dependency probes.
pub async fn run_startup_checks(config: &AppConfig) -> Result<()> {
    let stt = SttClient::new(config.stt.clone()).context("building STT client")?;
    stt.health_check().await.context("STT startup check")?;

    let llm = LlmClient::new(config.llm.clone()).context("building LLM client")?;
    llm.check_model().await.context("LLM startup check")?;

    if config.tts.mode == "mqtt" && !config.tts.mqtt.host.is_empty() {
        check_mqtt_broker(config).await.context("MQTT startup check")?;
    }

    info!("startup checks passed");
    Ok(())
}

/// Probe the broker with a short-lived connection.
async fn check_mqtt_broker(config: &AppConfig) -> Result<()> {
    let mqtt = &config.tts.mqtt;
    let client_id = format!("golem-probe-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(5));
    if !mqtt.username.is_empty() || !mqtt.password.is_empty() {
        options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 4);
    let probe = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == rumqttc::ConnectReturnCode::Success {
                        return Ok(());
                    }
                    bail!("broker refused connection: {:?}", ack.code);
                }
                Ok(_) => {}
                Err(e) => bail!("broker unreachable: {e}"),
            }
        }
    };

    let result = tokio::time::timeout(Duration::from_secs(3), probe)
        .await
        .map_err(|_| anyhow::anyhow!("broker connect timed out"))?;
    let _ = client.disconnect().await;
    result?;
    info!(host = %mqtt.host, port = mqtt.port, "MQTT broker reachable");
    Ok(())
}

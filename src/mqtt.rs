//! Northbound MQTT client: the fixed `omniapi/gateway` topic tree, LWT,
//! retained state, and subscribe-on-connect. Start/stop is gated strictly
//! on the uplink supervisor's route (never None), never polled directly.

use crate::events::{EventBus, GatewayEvent};
use crate::node::GatewayId;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const TOPIC_ROOT: &str = "omniapi/gateway";
const KEEP_ALIVE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub uri: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatePayload<'a> {
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
}

/// Inbound command surfaced to the gateway for dispatch. Mirrors the
/// handlers already reachable over HTTP; MQTT is just another ingress.
#[derive(Debug, Clone)]
pub enum MqttCommand {
    Credentials { payload: Vec<u8> },
    Decommission { payload: Vec<u8> },
    Identify { payload: Vec<u8> },
    ScanControl { payload: Vec<u8> },
    Commission { payload: Vec<u8> },
    OtaStart { payload: Vec<u8> },
    OtaAbort,
}

fn parse_topic(root: &str, topic: &str) -> Option<MqttCommand> {
    let cmd_prefix = format!("{root}/cmd/");
    if let Some(rest) = topic.strip_prefix(&cmd_prefix) {
        return match rest {
            "credentials" => Some(MqttCommand::Credentials { payload: Vec::new() }),
            "decommission" => Some(MqttCommand::Decommission { payload: Vec::new() }),
            "identify" => Some(MqttCommand::Identify { payload: Vec::new() }),
            _ => None,
        };
    }
    if topic == format!("{root}/scan") {
        return Some(MqttCommand::ScanControl { payload: Vec::new() });
    }
    if topic == format!("{root}/commission") {
        return Some(MqttCommand::Commission { payload: Vec::new() });
    }
    if topic == format!("{root}/ota/start") {
        return Some(MqttCommand::OtaStart { payload: Vec::new() });
    }
    if topic == format!("{root}/ota/abort") {
        return Some(MqttCommand::OtaAbort);
    }
    None
}

/// Fills in the payload bytes a topic-only match above left empty.
fn with_payload(cmd: MqttCommand, bytes: Vec<u8>) -> MqttCommand {
    match cmd {
        MqttCommand::Credentials { .. } => MqttCommand::Credentials { payload: bytes },
        MqttCommand::Decommission { .. } => MqttCommand::Decommission { payload: bytes },
        MqttCommand::Identify { .. } => MqttCommand::Identify { payload: bytes },
        MqttCommand::ScanControl { .. } => MqttCommand::ScanControl { payload: bytes },
        MqttCommand::Commission { .. } => MqttCommand::Commission { payload: bytes },
        MqttCommand::OtaStart { .. } => MqttCommand::OtaStart { payload: bytes },
        MqttCommand::OtaAbort => MqttCommand::OtaAbort,
    }
}

/// Owns the rumqttc client + poll loop. `start`/`stop` are idempotent and
/// called by the gateway only when the uplink route transitions to/from
/// `None`.
pub struct MqttClient {
    settings: MqttSettings,
    gateway_id: GatewayId,
    client: Arc<Mutex<Option<AsyncClient>>>,
    poll_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MqttClient {
    pub fn new(settings: MqttSettings, gateway_id: GatewayId) -> Self {
        MqttClient {
            settings,
            gateway_id,
            client: Arc::new(Mutex::new(None)),
            poll_task: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Connects, sets the LWT, publishes retained online state, subscribes
    /// to every `→gw` topic, and spawns the background poll task that
    /// forwards incoming publishes as `MqttCommand`s and bus log lines.
    pub async fn start(
        &self,
        bus: Arc<Mutex<EventBus>>,
        commands: tokio::sync::mpsc::UnboundedSender<MqttCommand>,
    ) -> anyhow::Result<()> {
        if self.is_running().await {
            return Ok(());
        }
        let (host, port) = parse_broker_uri(&self.settings.uri)?;
        let mut opts = MqttOptions::new(self.settings.client_id.clone(), host, port);
        opts.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        if let (Some(user), Some(pass)) = (&self.settings.username, &self.settings.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        let lwt_payload = serde_json::to_vec(&StatePayload {
            state: "offline",
            version: None,
        })?;
        opts.set_last_will(LastWill::new(
            format!("{TOPIC_ROOT}/state"),
            lwt_payload,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(opts, 64);

        for topic in [
            format!("{TOPIC_ROOT}/cmd/#"),
            format!("{TOPIC_ROOT}/scan"),
            format!("{TOPIC_ROOT}/commission"),
            format!("{TOPIC_ROOT}/ota/start"),
            format!("{TOPIC_ROOT}/ota/abort"),
        ] {
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }

        let online = serde_json::to_vec(&StatePayload {
            state: "online",
            version: Some(crate::FIRMWARE_VERSION),
        })?;
        client
            .publish(format!("{TOPIC_ROOT}/state"), QoS::AtLeastOnce, true, online)
            .await?;

        *self.client.lock().await = Some(client);
        let task = tokio::spawn(poll_loop(eventloop, bus, commands));
        *self.poll_task.lock().await = Some(task);

        info!(gateway_id = %self.gateway_id.0, "mqtt client started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        self.client.lock().await.take();
    }

    async fn publish(&self, suffix: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
        let guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            client
                .publish(format!("{TOPIC_ROOT}{suffix}"), QoS::AtLeastOnce, retain, payload)
                .await?;
        }
        Ok(())
    }

    pub async fn publish_node_status(&self, mac12: &str, online: bool) -> anyhow::Result<()> {
        let body = serde_json::json!({ "status": if online { "online" } else { "offline" } });
        self.publish(&format!("/nodes/{mac12}/status"), serde_json::to_vec(&body)?, false)
            .await
    }

    pub async fn publish_node_state(&self, mac12: &str, state: serde_json::Value) -> anyhow::Result<()> {
        self.publish(&format!("/nodes/{mac12}/state"), serde_json::to_vec(&state)?, false)
            .await
    }

    pub async fn publish_scan_results(&self, body: serde_json::Value) -> anyhow::Result<()> {
        self.publish("/scan/results", serde_json::to_vec(&body)?, false).await
    }

    pub async fn publish_commission_result(&self, body: serde_json::Value) -> anyhow::Result<()> {
        self.publish("/commission/result", serde_json::to_vec(&body)?, false).await
    }

    pub async fn publish_ota_progress(&self, body: serde_json::Value) -> anyhow::Result<()> {
        self.publish("/ota/progress", serde_json::to_vec(&body)?, false).await
    }

    pub async fn publish_ota_complete(&self, body: serde_json::Value) -> anyhow::Result<()> {
        self.publish("/ota/complete", serde_json::to_vec(&body)?, false).await
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    bus: Arc<Mutex<EventBus>>,
    commands: tokio::sync::mpsc::UnboundedSender<MqttCommand>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(Publish { topic, payload, .. }))) => {
                if let Some(cmd) = parse_topic(TOPIC_ROOT, &topic) {
                    let cmd = with_payload(cmd, payload.to_vec());
                    if commands.send(cmd).is_err() {
                        warn!("mqtt command channel closed, dropping message");
                        return;
                    }
                } else {
                    debug!(%topic, "unrecognized mqtt topic");
                }
            }
            Ok(_) => {}
            Err(e) => {
                bus.lock().await.log(0, format!("mqtt error: {e}"));
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

fn parse_broker_uri(uri: &str) -> anyhow::Result<(String, u16)> {
    let without_scheme = uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(uri);
    match without_scheme.split_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse()?)),
        None => Ok((without_scheme.to_string(), 1883)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cmd_wildcard_subtopics() {
        assert!(matches!(
            parse_topic(TOPIC_ROOT, &format!("{TOPIC_ROOT}/cmd/credentials")),
            Some(MqttCommand::Credentials { .. })
        ));
        assert!(matches!(
            parse_topic(TOPIC_ROOT, &format!("{TOPIC_ROOT}/cmd/identify")),
            Some(MqttCommand::Identify { .. })
        ));
        assert!(parse_topic(TOPIC_ROOT, &format!("{TOPIC_ROOT}/cmd/unknown")).is_none());
    }

    #[test]
    fn parses_fixed_topics() {
        assert!(matches!(
            parse_topic(TOPIC_ROOT, &format!("{TOPIC_ROOT}/ota/abort")),
            Some(MqttCommand::OtaAbort)
        ));
        assert!(matches!(
            parse_topic(TOPIC_ROOT, &format!("{TOPIC_ROOT}/commission")),
            Some(MqttCommand::Commission { .. })
        ));
    }

    #[test]
    fn unrelated_topics_do_not_match() {
        assert!(parse_topic(TOPIC_ROOT, "some/other/topic").is_none());
    }

    #[test]
    fn broker_uri_parsing_handles_scheme_and_bare_host_port() {
        assert_eq!(
            parse_broker_uri("mqtt://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_uri("broker.local:1883").unwrap(),
            ("broker.local".to_string(), 1883)
        );
    }
}

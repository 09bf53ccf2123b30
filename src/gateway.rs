//! Top-level gateway object: owns every subsystem and the long-lived
//! tasks from the concurrency model (main loop, heartbeat, status, OTA
//! download/push, captive DNS, keep-alive pings). Constructed once in
//! `main` with concrete hardware collaborators injected, then `run()`
//! drives it until shutdown.

use crate::codec::{self, MsgType};
use crate::commission::{CommissionError, CommissionResult, CommissioningFsm, MeshAction};
use crate::config::{ConfigStore, Identity, ProvisionState, KEY_MESH_PASS};
use crate::events::{EventBus, GatewayEvent};
use crate::hw::{ApRadio, BlobStore, FlashPartition, MeshTransport, MonotonicClock, RestartControl, StatusLed, UplinkPhy};
use crate::mesh::{Dispatch, MeshRouter, DISCOVERY_PSK};
use crate::mqtt::{MqttClient, MqttCommand, MqttSettings};
use crate::node::{DeviceType, NodeMac, PackedVersion};
use crate::ota::broadcast::{BroadcastPullJob, StartJobInputs};
use crate::ota::push::PushOtaJob;
use crate::ota::self_ota::SelfOtaWriter;
use crate::ota::OtaOrchestrator;
use crate::registry::{HeartbeatFields, NodeRegistry};
use crate::uplink::{Route, UplinkKind, UplinkSupervisor};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::{interval, timeout, Duration, Instant};
use tracing::{debug, info, warn};

pub const NODE_OFFLINE_TIMEOUT_MS: u64 = 90_000;
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);
pub const STATUS_PERIOD: Duration = Duration::from_secs(30);
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);
pub const OTA_MAX_PARTICIPANTS: usize = DEFAULT_CAPACITY;
pub const OTA_CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(5);

use crate::registry::DEFAULT_CAPACITY;

/// Everything a running gateway holds. Each field uses the lock the
/// concurrency model calls for: `RwLock` for read-mostly tables, `Mutex`
/// for the OTA job and anything mutated from more than one task.
pub struct Gateway {
    pub identity: Identity,
    pub config: Mutex<Box<dyn ConfigStore>>,
    pub registry: RwLock<NodeRegistry>,
    pub uplink: Mutex<UplinkSupervisor>,
    pub mesh: MeshRouter,
    pub commission: Mutex<CommissioningFsm>,
    pub ota: Mutex<OtaOrchestrator>,
    pub self_ota: Mutex<SelfOtaWriter<Arc<dyn FlashPartition>>>,
    pub events: Arc<Mutex<EventBus>>,
    pub mqtt: MqttClient,
    pub clock: Arc<dyn MonotonicClock>,
    pub led: Arc<dyn StatusLed>,
    pub blob: Arc<dyn BlobStore<Handle = crate::ota::blob::FileHandle>>,
    pub ap_radio: Arc<dyn ApRadio>,
    pub restart: Arc<dyn RestartControl>,
    ethernet: Arc<dyn UplinkPhy>,
    wifi: Arc<dyn UplinkPhy>,
    mqtt_commands_tx: mpsc::UnboundedSender<MqttCommand>,
    mqtt_commands_rx: Mutex<Option<mpsc::UnboundedReceiver<MqttCommand>>>,
    ota_ack_notify: Notify,
    seq: AtomicU8,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Identity,
        config: Box<dyn ConfigStore>,
        transport: Arc<dyn MeshTransport>,
        flash: Arc<dyn FlashPartition>,
        blob: Arc<dyn BlobStore<Handle = crate::ota::blob::FileHandle>>,
        clock: Arc<dyn MonotonicClock>,
        led: Arc<dyn StatusLed>,
        ap_radio: Arc<dyn ApRadio>,
        restart: Arc<dyn RestartControl>,
        ethernet: Arc<dyn UplinkPhy>,
        wifi: Arc<dyn UplinkPhy>,
        mqtt_settings: MqttSettings,
    ) -> Self {
        let (mqtt_commands_tx, mqtt_commands_rx) = mpsc::unbounded_channel();
        Gateway {
            mesh: MeshRouter::new(transport),
            mqtt: MqttClient::new(mqtt_settings, identity.gateway_id.clone()),
            identity,
            config: Mutex::new(config),
            registry: RwLock::new(NodeRegistry::new(DEFAULT_CAPACITY)),
            uplink: Mutex::new(UplinkSupervisor::new()),
            commission: Mutex::new(CommissioningFsm::new()),
            ota: Mutex::new(OtaOrchestrator::new()),
            self_ota: Mutex::new(SelfOtaWriter::new(flash)),
            events: Arc::new(Mutex::new(EventBus::new())),
            clock,
            led,
            blob,
            ap_radio,
            restart,
            ethernet,
            wifi,
            mqtt_commands_tx,
            mqtt_commands_rx: Mutex::new(Some(mqtt_commands_rx)),
            ota_ack_notify: Notify::new(),
            seq: AtomicU8::new(0),
        }
    }

    pub fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn provision_state(&self) -> ProvisionState {
        self.config.lock().await.provision_state()
    }

    /// Spawns every long-lived task. The caller (main) keeps the gateway
    /// alive for the process lifetime; none of these are expected to
    /// return under normal operation.
    pub fn spawn_tasks(self: &Arc<Self>) {
        let commands_rx = self
            .mqtt_commands_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take());
        tokio::spawn(heartbeat_task(self.clone()));
        tokio::spawn(status_task(self.clone()));
        tokio::spawn(mesh_rx_task(self.clone()));
        tokio::spawn(uplink_task(self.clone()));
        if let Some(commands_rx) = commands_rx {
            tokio::spawn(mqtt_command_task(self.clone(), commands_rx));
        }
    }

    /// Applies a classified mesh dispatch. Mirrors the receive dispatch
    /// table; this is the one place where the pure classification in
    /// `mesh::classify` meets stateful subsystems.
    pub async fn apply_dispatch(&self, dispatch: Dispatch) {
        let now = self.clock.now_ms();
        match dispatch {
            Dispatch::HeartbeatAck(p) => {
                let mac = NodeMac(p.mac);
                let fields = HeartbeatFields {
                    device_type: DeviceType::from_code(p.device_type),
                    mesh_layer: p.mesh_layer,
                    rssi: p.rssi,
                    firmware: PackedVersion(p.fw_version),
                    uptime_sec: p.uptime,
                };
                self.registry.write().await.update_from_heartbeat_ack(mac, fields, now);
            }
            Dispatch::NodeAnnounceCommissioned(p) => {
                let mac = NodeMac(p.mac);
                self.registry.write().await.add(mac, now);
                let _ = self.mqtt.publish_node_status(&mac.as_hex12(), true).await;
            }
            Dispatch::NodeAnnounceUncommissioned(p) => {
                let mac = NodeMac(p.mac);
                self.commission.lock().await.add_discovered_node(
                    mac,
                    DeviceType::from_code(p.device_type),
                    PackedVersion(p.fw_version).render(),
                    false,
                    0,
                    now,
                );
            }
            Dispatch::ScanResponse(p) => {
                let mac = NodeMac(p.mac);
                self.commission.lock().await.add_discovered_node(
                    mac,
                    DeviceType::from_code(p.device_type),
                    PackedVersion(p.fw_version).render(),
                    p.commissioned,
                    p.rssi,
                    now,
                );
            }
            Dispatch::CommissionAck(p) => {
                self.commission.lock().await.complete_commission(NodeMac(p.mac), p.status);
            }
            Dispatch::DecommissionAck(p) => {
                self.commission.lock().await.complete_decommission(NodeMac(p.mac), p.status);
                if p.status == 0 {
                    self.registry.write().await.remove(&NodeMac(p.mac));
                }
            }
            Dispatch::OtaRequest(p) => {
                let mac = NodeMac(p.mac);
                let reply = {
                    let mut ota = self.ota.lock().await;
                    ota.broadcast_mut()
                        .and_then(|job| job.handle_request(mac, p.offset, p.length, now, OTA_MAX_PARTICIPANTS))
                };
                if let Some(data) = reply {
                    let wire = codec::encode(MsgType::OtaData, self.next_seq(), &data.encode());
                    if let Ok(wire) = wire {
                        let _ = self.mesh.send(mac, &wire).await;
                    }
                }
            }
            Dispatch::OtaComplete(p) => {
                let mac = NodeMac(p.mac);
                let mut ota = self.ota.lock().await;
                if ota.owns_mac(&mac) {
                    if let Some(job) = ota.broadcast_mut() {
                        job.mark_completed(mac);
                        job.maybe_finish();
                    }
                    if let Some(job) = ota.push_mut() {
                        job.complete();
                    }
                }
            }
            Dispatch::OtaFailed(p) => {
                let mac = NodeMac(p.mac);
                let mut ota = self.ota.lock().await;
                if ota.owns_mac(&mac) {
                    if let Some(job) = ota.broadcast_mut() {
                        job.mark_failed(mac, p.error);
                        job.maybe_finish();
                    }
                    if let Some(job) = ota.push_mut() {
                        job.fail();
                    }
                }
            }
            Dispatch::OtaAck(p) => {
                let mac = NodeMac(p.mac);
                {
                    let mut ota = self.ota.lock().await;
                    if let Some(job) = ota.push_mut() {
                        if job.target == mac {
                            let _ = job.apply_ack(p);
                        }
                    }
                }
                self.ota_ack_notify.notify_waiters();
            }
            Dispatch::RelayStatus { mac, channel, state } => {
                self.events.lock().await.publish(GatewayEvent::NodeState {
                    mac: mac.to_string(),
                    state: serde_json::json!({"channel": channel, "state": state}),
                });
            }
            Dispatch::LedStatus { mac, on, r, g, b, brightness, effect_id } => {
                self.events.lock().await.publish(GatewayEvent::NodeState {
                    mac: mac.to_string(),
                    state: serde_json::json!({"on": on, "r": r, "g": g, "b": b, "brightness": brightness, "effect_id": effect_id}),
                });
            }
            Dispatch::SensorData { mac, sensor_type, value, unit } => {
                self.events.lock().await.publish(GatewayEvent::NodeState {
                    mac: mac.to_string(),
                    state: serde_json::json!({"sensor_type": sensor_type, "value": value, "unit": unit}),
                });
            }
            Dispatch::Drop => {}
        }
    }

    /// Executes a `MeshAction` the commissioning FSM returned (keeps the
    /// FSM itself free of I/O).
    pub async fn execute_mesh_action(&self, action: MeshAction) -> anyhow::Result<()> {
        match action {
            MeshAction::RestartAs { mesh_id, psk } => {
                self.mesh.start_with_id(mesh_id, &psk).await?;
            }
            MeshAction::Broadcast(bytes) => {
                self.mesh.broadcast(&bytes).await?;
            }
            MeshAction::Send(mac, bytes) => {
                self.mesh.send(mac, &bytes).await?;
            }
        }
        Ok(())
    }

    /// 32-byte production mesh key derived from the persisted `mesh_pass`
    /// setting: truncated if too long, zero-padded if too short.
    pub async fn production_psk(&self) -> [u8; 32] {
        let raw = self
            .config
            .lock()
            .await
            .get(KEY_MESH_PASS)
            .unwrap_or_default();
        derive_key32(&raw)
    }

    /// 32-byte plant identifier shared with every node this gateway
    /// commissions, derived from the gateway's own identity so it is
    /// stable across restarts without needing its own persisted key.
    pub fn plant_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.identity.gateway_id.0.as_bytes());
        hasher.finalize().into()
    }

    pub async fn start_scan(&self) -> anyhow::Result<()> {
        let action = self.commission.lock().await.start_scan(DISCOVERY_PSK)?;
        self.execute_mesh_action(action).await?;
        let wire = codec::encode(MsgType::ScanRequest, self.next_seq(), &[])?;
        self.execute_mesh_action(MeshAction::Broadcast(wire)).await
    }

    pub async fn stop_scan(&self) -> anyhow::Result<()> {
        let psk = self.production_psk().await;
        let psk_str: String = psk.iter().map(|b| *b as char).collect();
        let action = self.commission.lock().await.stop_scan(&psk_str);
        self.execute_mesh_action(action).await
    }

    pub async fn commission_node(
        &self,
        mac: NodeMac,
        name: Option<String>,
    ) -> Result<CommissionResult, ApiErrorOr<CommissionError>> {
        let production_psk = self.production_psk().await;
        let plant_id = self.plant_id();
        let (payload, rx) = self
            .commission
            .lock()
            .await
            .begin_commission(mac, name, &production_psk, &plant_id)?;
        let wire = codec::encode(MsgType::Commission, self.next_seq(), &payload.encode())
            .map_err(|e| ApiErrorOr::Other(anyhow::anyhow!(e.to_string())))?;
        self.mesh
            .send(mac, &wire)
            .await
            .map_err(|e| ApiErrorOr::Other(anyhow::anyhow!(e.to_string())))?;
        match timeout(Duration::from_millis(crate::commission::COMMISSION_ACK_TIMEOUT_MS), rx).await {
            Ok(Ok(result)) => {
                let body = serde_json::json!({"mac": mac.to_string(), "success": result.success, "message": result.message});
                self.events.lock().await.publish(GatewayEvent::CommissionResult(body.clone()));
                let _ = self.mqtt.publish_commission_result(body).await;
                Ok(result)
            }
            _ => Err(ApiErrorOr::Typed(CommissionError::Timeout)),
        }
    }

    pub async fn decommission_node(&self, mac: NodeMac) -> Result<CommissionResult, ApiErrorOr<CommissionError>> {
        let (payload, rx) = self.commission.lock().await.begin_decommission(mac)?;
        let wire = codec::encode(MsgType::Decommission, self.next_seq(), &payload)
            .map_err(|e| ApiErrorOr::Other(anyhow::anyhow!(e.to_string())))?;
        self.mesh
            .send(mac, &wire)
            .await
            .map_err(|e| ApiErrorOr::Other(anyhow::anyhow!(e.to_string())))?;
        match timeout(Duration::from_millis(crate::commission::COMMISSION_ACK_TIMEOUT_MS), rx).await {
            Ok(Ok(result)) => {
                let body = serde_json::json!({"mac": mac.to_string(), "success": result.success, "message": result.message});
                self.events.lock().await.publish(GatewayEvent::CommissionResult(body.clone()));
                let _ = self.mqtt.publish_commission_result(body).await;
                Ok(result)
            }
            _ => Err(ApiErrorOr::Typed(CommissionError::Timeout)),
        }
    }

    pub async fn identify_node(&self, mac: NodeMac) -> anyhow::Result<()> {
        let payload = self.commission.lock().await.identify(mac);
        let wire = codec::encode(MsgType::Identify, self.next_seq(), &payload)?;
        self.mesh.send(mac, &wire).await?;
        Ok(())
    }

    pub async fn relay_command(&self, mac: NodeMac, action: u8) -> anyhow::Result<()> {
        let wire = codec::encode(MsgType::RelayCmd, self.next_seq(), &[0, action])?;
        self.mesh.send(mac, &wire).await?;
        Ok(())
    }

    pub async fn led_command(&self, mac: NodeMac, on: bool) -> anyhow::Result<()> {
        let payload = [on as u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let wire = codec::encode(MsgType::LedCmd, self.next_seq(), &payload)?;
        self.mesh.send(mac, &wire).await?;
        Ok(())
    }

    pub async fn node_reboot(&self, mac: NodeMac) -> anyhow::Result<()> {
        let wire = codec::encode(MsgType::Reboot, self.next_seq(), &[])?;
        self.mesh.send(mac, &wire).await?;
        Ok(())
    }

    pub async fn node_config_set(&self, mac: NodeMac, key: u8, value: &[u8]) -> anyhow::Result<()> {
        let value_len = value.len().min(32) as u8;
        let mut payload = Vec::with_capacity(8 + value_len as usize);
        payload.extend_from_slice(&mac.0);
        payload.push(key);
        payload.push(value_len);
        payload.extend_from_slice(&value[..value_len as usize]);
        let wire = codec::encode(MsgType::ConfigSet, self.next_seq(), &payload)?;
        self.mesh.send(mac, &wire).await?;
        Ok(())
    }

    pub async fn start_broadcast_ota(
        self: &Arc<Self>,
        inputs: StartJobInputs,
    ) -> Result<(), crate::ota::OtaError> {
        let now = self.clock.now_ms();
        self.ota
            .lock()
            .await
            .start_broadcast_pull(BroadcastPullJob::new(inputs, now))?;
        tokio::spawn(broadcast_download_task(self.clone()));
        Ok(())
    }

    pub async fn start_targeted_push(
        self: &Arc<Self>,
        target: NodeMac,
        body: bytes::Bytes,
    ) -> Result<(), crate::ota::OtaError> {
        let crc32 = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&body);
        let job = PushOtaJob::new(target, body.len() as u32, crc32, crate::ota::push::DEFAULT_RETRY_BUDGET);
        self.ota.lock().await.start_targeted_push(job)?;
        let handle = self.blob.begin(body.len() as u64).await;
        if self.blob.append(&handle, &body).await.is_err() {
            self.ota.lock().await.abort();
            return Err(crate::ota::OtaError::Push(crate::ota::push::PushOtaError::WriteError));
        }
        let _ = self.blob.finish(&handle).await;
        tokio::spawn(targeted_push_task(self.clone(), handle, body.len() as u64));
        Ok(())
    }
}

/// Lets commission/decommission return either the subsystem's own typed
/// error or a wrapped I/O failure, without forcing the caller to unify
/// them into one enum the FSM itself has no reason to know about.
pub enum ApiErrorOr<E> {
    Typed(E),
    Other(anyhow::Error),
}

impl<E> From<E> for ApiErrorOr<E> {
    fn from(e: E) -> Self {
        ApiErrorOr::Typed(e)
    }
}

/// Truncates or zero-pads a persisted secret to the fixed 32-byte mesh
/// key width the wire format requires.
fn derive_key32(raw: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = raw.as_bytes();
    let n = bytes.len().min(32);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

async fn broadcast_download_task(gw: Arc<Gateway>) {
    let inputs_summary = {
        let mut ota = gw.ota.lock().await;
        ota.broadcast_mut().map(|job| (job.inputs.url.clone(), job.inputs.total_size))
    };
    let Some((url, total_size)) = inputs_summary else {
        return;
    };
    let downloaded = match reqwest::get(&url).await {
        Ok(resp) => resp.bytes().await.map(|b| b.to_vec()).ok(),
        Err(e) => {
            gw.events.lock().await.publish(GatewayEvent::Log {
                ts: gw.clock.now_ms() / 1000,
                msg: format!("ota download failed: {e}"),
            });
            None
        }
    };
    let advertisement = {
        let mut ota = gw.ota.lock().await;
        match ota.broadcast_mut() {
            Some(job) => {
                let apply_result = match downloaded {
                    Some(bytes) if bytes.len() as u32 == total_size => job.apply_downloaded(bytes),
                    _ => job.apply_downloaded(Vec::new()),
                };
                apply_result.ok().map(|_| job.advertisement())
            }
            None => None,
        }
    };
    let Some(advertisement) = advertisement else {
        gw.ota.lock().await.finish();
        return;
    };
    let wire = match codec::encode(MsgType::OtaAvailable, gw.next_seq(), &advertisement.encode()) {
        Ok(w) => w,
        Err(_) => return,
    };
    let _ = gw.mesh.broadcast(&wire).await;
    let _ = gw
        .mqtt
        .publish_ota_progress(serde_json::json!({"status": "distributing"}))
        .await;

    let mut tick = interval(Duration::from_secs(5));
    let deadline = Instant::now() + crate::ota::broadcast::JOB_DEADLINE;
    loop {
        tick.tick().await;
        if Instant::now() >= deadline {
            let mut ota = gw.ota.lock().await;
            if ota.broadcast_mut().is_some() {
                ota.abort();
            }
            break;
        }
        let now = gw.clock.now_ms();
        let mut ota = gw.ota.lock().await;
        let Some(job) = ota.broadcast_mut() else { break };
        if job.needs_inactivity_resync(now) {
            if let Ok(wire) = codec::encode(MsgType::OtaAvailable, gw.next_seq(), &job.advertisement().encode()) {
                drop(ota);
                let _ = gw.mesh.broadcast(&wire).await;
                continue;
            }
        }
        let (completed, failed, participants) = job.summary();
        let finished = job.maybe_finish();
        if finished {
            let _ = gw
                .mqtt
                .publish_ota_complete(serde_json::json!({
                    "completed": completed, "failed": failed, "total": participants, "success": failed == 0,
                }))
                .await;
            ota.finish();
            break;
        }
    }
}

async fn targeted_push_task(gw: Arc<Gateway>, handle: crate::ota::blob::FileHandle, total_size: u64) {
    let begin = {
        let mut ota = gw.ota.lock().await;
        ota.push_mut().map(|job| job.begin_message())
    };
    let Some(begin) = begin else { return };
    let target = NodeMac(begin.target);
    let Ok(begin_wire) = codec::encode(MsgType::OtaBegin, gw.next_seq(), &begin.encode()) else {
        return;
    };
    if gw.mesh.send(target, &begin_wire).await.is_err() {
        gw.ota.lock().await.abort();
        return;
    }

    let chunk_size = crate::ota::push::CHUNK_SIZE as u64;
    let mut offset = 0u64;
    while offset < total_size {
        let len = chunk_size.min(total_size - offset) as usize;
        let bytes = match gw.blob.read_range(&handle, offset, len).await {
            Ok(b) => b,
            Err(_) => {
                gw.ota.lock().await.abort();
                return;
            }
        };
        let data_msg = {
            let mut ota = gw.ota.lock().await;
            match ota.push_mut() {
                Some(job) => job.data_message(bytes),
                None => return,
            }
        };
        let wire = match codec::encode(MsgType::OtaData, gw.next_seq(), &data_msg.encode()) {
            Ok(w) => w,
            Err(_) => return,
        };
        if gw.mesh.send(target, &wire).await.is_err() {
            gw.ota.lock().await.abort();
            return;
        }

        let acked = 'wait_ack: loop {
            let wait = timeout(OTA_CHUNK_ACK_TIMEOUT, gw.ota_ack_notify.notified());
            if wait.await.is_err() {
                // No ack within the per-chunk window: consume retry budget
                // and resend the same chunk, or give up once exhausted.
                let mut ota = gw.ota.lock().await;
                let retry = match ota.push_mut() {
                    Some(job) => job.ack_timeout(),
                    None => break 'wait_ack false,
                };
                drop(ota);
                match retry {
                    Ok(()) => {
                        if gw.mesh.send(target, &wire).await.is_err() {
                            gw.ota.lock().await.abort();
                            break 'wait_ack false;
                        }
                        continue 'wait_ack;
                    }
                    Err(_) => break 'wait_ack false,
                }
            }
            let mut ota = gw.ota.lock().await;
            match ota.push_mut() {
                Some(job) if job.next_chunk as u64 * chunk_size > offset => break 'wait_ack true,
                Some(job) if job.state == crate::ota::push::PushState::Failed
                    || job.state == crate::ota::push::PushState::Aborted =>
                {
                    break 'wait_ack false;
                }
                Some(_) => continue 'wait_ack,
                None => break 'wait_ack false,
            }
        };
        if !acked {
            gw.ota.lock().await.abort();
            return;
        }
        offset += len as u64;
    }

    let end = {
        let mut ota = gw.ota.lock().await;
        ota.push_mut().map(|job| job.end_message())
    };
    if let Some(end) = end {
        if let Ok(wire) = codec::encode(MsgType::OtaEnd, gw.next_seq(), &end.encode()) {
            let _ = gw.mesh.send(target, &wire).await;
        }
    }
    gw.blob.discard(&handle).await;
}

async fn heartbeat_task(gw: Arc<Gateway>) {
    let mut tick = interval(HEARTBEAT_PERIOD);
    loop {
        tick.tick().await;
        let wire = codec::encode(MsgType::Heartbeat, gw.next_seq(), &[]).unwrap();
        let _ = gw.mesh.broadcast(&wire).await;
        let now = gw.clock.now_ms();
        gw.registry.write().await.sweep(now, NODE_OFFLINE_TIMEOUT_MS);
    }
}

async fn status_task(gw: Arc<Gateway>) {
    let mut tick = interval(STATUS_PERIOD);
    loop {
        tick.tick().await;
        let nodes = gw.registry.read().await.len();
        let route = gw.uplink.lock().await.route();
        let uptime = gw.clock.now_ms() / 1000;
        let status = serde_json::json!({
            "nodes": nodes,
            "route": route,
            "uptime": uptime,
        });
        gw.events.lock().await.publish(GatewayEvent::RouteChanged {
            route: route_label(route).to_string(),
        });
        if gw.mqtt.is_running().await {
            let _ = gw.mqtt.publish_node_state("gateway", status).await;
        }
    }
}

fn route_label(route: Route) -> &'static str {
    match route {
        Route::Ethernet => "ethernet",
        Route::WiFi => "wifi",
        Route::None => "none",
    }
}

/// Drains the mesh transport's event stream: classifies received frames
/// and hands child connect/disconnect straight to the registry, gated on
/// commissioning mode per the discovery-mode no-op rule.
async fn mesh_rx_task(gw: Arc<Gateway>) {
    loop {
        match gw.mesh.recv().await {
            Some(crate::hw::MeshEvent::FrameReceived { from, bytes }) => match crate::mesh::classify(&bytes, from) {
                Ok(dispatch) => gw.apply_dispatch(dispatch).await,
                Err(e) => debug!(?e, mac = %from, "dropping malformed mesh frame"),
            },
            Some(crate::hw::MeshEvent::ChildConnected(mac)) => {
                if gw.commission.lock().await.mode() == crate::commission::Mode::Production {
                    let now = gw.clock.now_ms();
                    gw.registry.write().await.add(mac, now);
                    let _ = gw.mqtt.publish_node_status(&mac.as_hex12(), true).await;
                }
            }
            Some(crate::hw::MeshEvent::ChildDisconnected(mac)) => {
                if gw.commission.lock().await.mode() == crate::commission::Mode::Production {
                    gw.registry.write().await.set_offline(&mac);
                    let _ = gw.mqtt.publish_node_status(&mac.as_hex12(), false).await;
                }
            }
            None => {
                info!("mesh transport event source closed, rx pump exiting");
                return;
            }
        }
    }
}

/// Drains both uplink PHYs and recomputes the route on every transition.
/// MQTT start/stop is gated strictly on the route leaving/entering
/// `None` -- never polled, only driven by this pump.
async fn uplink_task(gw: Arc<Gateway>) {
    loop {
        let changed = tokio::select! {
            event = gw.ethernet.recv() => event.map(|e| (crate::uplink::UplinkKind::Ethernet, e)),
            event = gw.wifi.recv() => event.map(|e| (crate::uplink::UplinkKind::WifiSta, e)),
        };
        let Some((kind, event)) = changed else {
            info!("uplink phy event source closed, uplink pump exiting");
            return;
        };
        let new_route = gw.uplink.lock().await.apply_event(kind, event);
        let Some(route) = new_route else { continue };
        gw.events.lock().await.publish(GatewayEvent::RouteChanged {
            route: route_label(route).to_string(),
        });
        match route {
            Route::None => gw.mqtt.stop().await,
            _ => {
                let _ = gw.mqtt.start(gw.events.clone(), gw.mqtt_commands_tx.clone()).await;
            }
        }
    }
}

fn mqtt_payload_mac(payload: &[u8]) -> Option<NodeMac> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("mac")?.as_str().and_then(NodeMac::parse)
}

async fn mqtt_command_task(gw: Arc<Gateway>, mut rx: mpsc::UnboundedReceiver<MqttCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            MqttCommand::OtaAbort => {
                gw.ota.lock().await.abort();
            }
            MqttCommand::Credentials { payload } => {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&payload) {
                    if let (Some(ssid), Some(pass)) = (
                        value.get("wifi_ssid").and_then(|v| v.as_str()),
                        value.get("wifi_pass").and_then(|v| v.as_str()),
                    ) {
                        let mut config = gw.config.lock().await;
                        let _ = config.set(crate::config::KEY_WIFI_SSID, ssid);
                        let _ = config.set(crate::config::KEY_WIFI_PASS, pass);
                    }
                } else {
                    warn!("malformed credentials command payload");
                }
            }
            MqttCommand::Decommission { payload } => {
                if let Some(mac) = mqtt_payload_mac(&payload) {
                    let _ = gw.decommission_node(mac).await;
                } else {
                    warn!("decommission command missing mac");
                }
            }
            MqttCommand::Identify { payload } => {
                if let Some(mac) = mqtt_payload_mac(&payload) {
                    let _ = gw.identify_node(mac).await;
                } else {
                    warn!("identify command missing mac");
                }
            }
            MqttCommand::ScanControl { payload } => {
                let action = serde_json::from_slice::<serde_json::Value>(&payload)
                    .ok()
                    .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(str::to_string));
                match action.as_deref() {
                    Some("start") => {
                        let _ = gw.start_scan().await;
                    }
                    Some("stop") => {
                        let _ = gw.stop_scan().await;
                    }
                    Some("results") => {
                        let results = gw.commission.lock().await.scan_results();
                        let body = serde_json::json!({"nodes": results, "count": results.len()});
                        let _ = gw.mqtt.publish_scan_results(body).await;
                    }
                    _ => warn!("unrecognized scan command action"),
                }
            }
            MqttCommand::Commission { payload } => {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&payload) {
                    let mac = value.get("mac").and_then(|v| v.as_str()).and_then(NodeMac::parse);
                    let name = value.get("name").and_then(|v| v.as_str()).map(str::to_string);
                    if let Some(mac) = mac {
                        let _ = gw.commission_node(mac, name).await;
                    } else {
                        warn!("commission command missing mac");
                    }
                }
            }
            MqttCommand::OtaStart { payload } => {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&payload) {
                    let inputs = (|| -> Option<StartJobInputs> {
                        Some(StartJobInputs {
                            url: value.get("url")?.as_str()?.to_string(),
                            version: value.get("version")?.as_str()?.to_string(),
                            version_packed: 0,
                            sha256_hex: value.get("sha256")?.as_str()?.to_string(),
                            total_size: value.get("size")?.as_u64()? as u32,
                            device_type: DeviceType::from_code(value.get("device_type")?.as_u64()? as u8),
                            targets: Vec::new(),
                        })
                    })();
                    if let Some(inputs) = inputs {
                        let _ = gw.start_broadcast_ota(inputs).await;
                    } else {
                        warn!("malformed ota/start command payload");
                    }
                }
            }
        }
    }
    info!("mqtt command channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryConfigStore;
    use crate::hw::{NullStatusLed, SystemClock, TransportError};
    use crate::node::GatewayId;
    use crate::ota::blob::FileBlobStore;
    use async_trait::async_trait;

    struct FakeTransport;

    #[async_trait]
    impl MeshTransport for FakeTransport {
        async fn init(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn start(&self, _mesh_id: &str, _psk: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send(&self, _mac: NodeMac, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        async fn broadcast(&self, _bytes: &[u8]) -> Result<usize, TransportError> {
            Ok(0)
        }
        fn routing_table(&self) -> Vec<NodeMac> {
            Vec::new()
        }
        async fn recv(&self) -> Option<crate::hw::MeshEvent> {
            None
        }
    }

    struct FakeFlash;
    impl FlashPartition for FakeFlash {
        fn set_boot_partition(&self, _slot: &str) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn partition_size(&self) -> u64 {
            4 * 1024 * 1024
        }
    }

    struct FakeApRadio;
    #[async_trait]
    impl ApRadio for FakeApRadio {
        async fn start_ap(
            &self,
            _ssid: &str,
            _psk: &str,
            _ip: std::net::Ipv4Addr,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn stop_ap(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn scan(&self) -> Result<Vec<crate::hw::WifiScanResult>, TransportError> {
            Ok(Vec::new())
        }
    }

    struct FakeRestart;
    impl RestartControl for FakeRestart {
        fn schedule_restart(&self, _delay_ms: u64) {}
    }

    struct FakeUplinkPhy(&'static str);
    #[async_trait]
    impl crate::hw::UplinkPhy for FakeUplinkPhy {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn recv(&self) -> Option<crate::hw::PhyEvent> {
            None
        }
    }

    fn test_gateway() -> Gateway {
        let identity = Identity {
            gateway_id: GatewayId("AABBCCDDEEFF".to_string()),
            hostname: "omni_EEFF".to_string(),
        };
        Gateway::new(
            identity,
            Box::new(InMemoryConfigStore::default()),
            Arc::new(FakeTransport),
            Arc::new(FakeFlash),
            Arc::new(FileBlobStore::new(std::env::temp_dir())),
            Arc::new(SystemClock),
            Arc::new(NullStatusLed),
            Arc::new(FakeApRadio),
            Arc::new(FakeRestart),
            Arc::new(FakeUplinkPhy("ethernet")),
            Arc::new(FakeUplinkPhy("wifi")),
            MqttSettings {
                uri: "mqtt://localhost:1883".to_string(),
                client_id: "test".to_string(),
                username: None,
                password: None,
            },
        )
    }

    #[tokio::test]
    async fn heartbeat_ack_dispatch_updates_registry() {
        let gw = test_gateway();
        let mac = [1, 2, 3, 4, 5, 6];
        gw.apply_dispatch(Dispatch::HeartbeatAck(codec::HeartbeatAckPayload {
            mac,
            device_type: 1,
            status: 1,
            mesh_layer: 2,
            rssi: -50,
            fw_version: 0x00010203,
            uptime: 10,
        }))
        .await;
        let snapshot = gw.registry.read().await.snapshot();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn decommission_ack_success_removes_node_from_registry() {
        let gw = test_gateway();
        let mac = NodeMac([1, 2, 3, 4, 5, 6]);
        gw.registry.write().await.add(mac, 0);
        gw.apply_dispatch(Dispatch::DecommissionAck(codec::AckPayload { mac: mac.0, status: 0 }))
            .await;
        assert!(gw.registry.read().await.get(&mac).is_none());
    }
}

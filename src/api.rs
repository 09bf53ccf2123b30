//! Northbound HTTP/WebSocket surface: the `/api/...` REST tree, the `/ws`
//! event stream, and the captive-portal probe redirects. Every handler is
//! a thin translation layer over `Gateway` methods -- no mesh I/O or
//! subsystem state lives here.

use crate::config::{KEY_MQTT_PASS, KEY_MQTT_URI, KEY_MQTT_USER, KEY_WIFI_PASS, KEY_WIFI_SSID};
use crate::error::ApiError;
use crate::gateway::{ApiErrorOr, Gateway};
use crate::node::NodeMac;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

pub type AppState = Arc<Gateway>;

const JSON_BODY_LIMIT: usize = 64 * 1024;
const FIRMWARE_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// Builds the full router: `/api/...`, `/ws`, and the captive-portal probe
/// paths. CORS is wide open -- the northbound API has no browser-side
/// origin to restrict to, since the dashboard is served from the gateway
/// itself or from an arbitrary LAN host during provisioning.
pub fn router(gw: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/network", get(get_network))
        .route("/mesh", get(get_mesh))
        .route("/nodes", get(get_nodes))
        .route("/scan", post(post_scan))
        .route("/scan/stop", post(post_scan_stop))
        .route("/scan/results", get(get_scan_results))
        .route("/commission", post(post_commission))
        .route("/decommission", post(post_decommission))
        .route("/command", post(post_command))
        .route("/logs", get(get_logs))
        .route("/ota/status", get(get_ota_status))
        .route(
            "/ota/upload",
            post(post_ota_upload).route_layer(DefaultBodyLimit::max(FIRMWARE_BODY_LIMIT)),
        )
        .route(
            "/node/ota",
            post(post_node_ota).route_layer(DefaultBodyLimit::max(FIRMWARE_BODY_LIMIT)),
        )
        .route("/node/ota/status", get(get_node_ota_status))
        .route("/node/ota/abort", post(post_node_ota_abort))
        .route("/node/config", post(post_node_config))
        .route("/reboot", post(post_reboot))
        .route("/factory-reset", post(post_factory_reset))
        .route("/wifi/scan", get(get_wifi_scan))
        .route("/provision/status", get(get_provision_status))
        .route("/provision/wifi", post(post_provision_wifi))
        .route("/provision/mqtt", post(post_provision_mqtt))
        .route("/provision/all", post(post_provision_all));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws_handler))
        .route("/generate_204", get(captive_redirect))
        .route("/gen_204", get(captive_redirect))
        .route("/hotspot-detect.html", get(captive_redirect))
        .route("/connecttest.txt", get(captive_redirect))
        .route("/redirect", get(captive_redirect))
        .route("/canonical.html", get(captive_redirect))
        .route("/success.txt", get(captive_redirect))
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(gw)
}

/// Translates `commission_node`/`decommission_node`'s dual-channel error
/// (the FSM's own typed error, or a wrapped I/O failure) into the uniform
/// HTTP error shape.
fn commission_err<E>(e: ApiErrorOr<E>) -> ApiError
where
    ApiError: From<E>,
{
    match e {
        ApiErrorOr::Typed(inner) => ApiError::from(inner),
        ApiErrorOr::Other(err) => ApiError::from(err),
    }
}

fn mac_from(value: &Value, field: &str) -> Result<NodeMac, ApiError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(NodeMac::parse)
        .ok_or_else(|| ApiError::bad_request(format!("missing or invalid '{field}'")))
}

async fn get_status(State(gw): State<AppState>) -> Result<Json<Value>, ApiError> {
    let nodes = gw.registry.read().await.len();
    let route = gw.uplink.lock().await.route();
    let provision_state = gw.provision_state().await;
    let uptime = gw.clock.now_ms() / 1000;
    Ok(Json(json!({
        "success": true,
        "gateway_id": gw.identity.gateway_id.0,
        "hostname": gw.identity.hostname,
        "firmware_version": crate::FIRMWARE_VERSION,
        "provision_state": provision_state,
        "route": route,
        "nodes": nodes,
        "uptime": uptime,
        "mqtt_connected": gw.mqtt.is_running().await,
    })))
}

async fn get_network(State(gw): State<AppState>) -> Json<Value> {
    let uplink = gw.uplink.lock().await;
    let eth = uplink.ethernet();
    let wifi = uplink.wifi();
    Json(json!({
        "success": true,
        "route": uplink.route(),
        "ethernet": {"link_up": eth.link_up, "has_ip": eth.has_ip, "ip": eth.ip},
        "wifi": {"link_up": wifi.link_up, "has_ip": wifi.has_ip, "ip": wifi.ip},
    }))
}

async fn get_mesh(State(gw): State<AppState>) -> Json<Value> {
    let stats = gw.mesh.get_stats();
    Json(json!({
        "success": true,
        "routing_table_size": gw.mesh.get_routing_table().len(),
        "frames_received": stats.frames_received.load(std::sync::atomic::Ordering::Relaxed),
        "frames_dropped": stats.frames_dropped.load(std::sync::atomic::Ordering::Relaxed),
        "send_errors": stats.send_errors.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

async fn get_nodes(State(gw): State<AppState>) -> Json<Value> {
    let nodes = gw.registry.read().await.snapshot();
    Json(json!({"success": true, "nodes": nodes}))
}

async fn post_scan(State(gw): State<AppState>) -> Result<Json<Value>, ApiError> {
    gw.start_scan().await.map_err(ApiError::from)?;
    Ok(Json(json!({"success": true})))
}

async fn post_scan_stop(State(gw): State<AppState>) -> Result<Json<Value>, ApiError> {
    gw.stop_scan().await.map_err(ApiError::from)?;
    Ok(Json(json!({"success": true})))
}

async fn get_scan_results(State(gw): State<AppState>) -> Json<Value> {
    let results = gw.commission.lock().await.scan_results();
    Json(json!({"success": true, "nodes": results, "count": results.len()}))
}

async fn post_commission(
    State(gw): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let mac = mac_from(&body, "mac")?;
    let name = body.get("name").and_then(|v| v.as_str()).map(str::to_string);
    let result = gw.commission_node(mac, name).await.map_err(commission_err)?;
    Ok(Json(json!({"success": result.success, "mac": mac.to_string(), "message": result.message})))
}

async fn post_decommission(
    State(gw): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let mac = mac_from(&body, "mac")?;
    let result = gw.decommission_node(mac).await.map_err(commission_err)?;
    Ok(Json(json!({"success": result.success, "mac": mac.to_string(), "message": result.message})))
}

async fn post_command(
    State(gw): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let mac = mac_from(&body, "mac")?;
    let cmd = body
        .get("cmd")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_request("missing 'cmd'"))?;
    match cmd {
        "relay_on" => gw.relay_command(mac, 1).await.map_err(ApiError::from)?,
        "relay_off" => gw.relay_command(mac, 0).await.map_err(ApiError::from)?,
        "relay_toggle" => gw.relay_command(mac, 2).await.map_err(ApiError::from)?,
        "led_on" => gw.led_command(mac, true).await.map_err(ApiError::from)?,
        "led_off" => gw.led_command(mac, false).await.map_err(ApiError::from)?,
        "identify" => gw.identify_node(mac).await.map_err(ApiError::from)?,
        "reboot" => gw.node_reboot(mac).await.map_err(ApiError::from)?,
        other => return Err(ApiError::bad_request(format!("unknown command '{other}'"))),
    }
    Ok(Json(json!({"success": true})))
}

async fn get_logs(State(gw): State<AppState>) -> Json<Value> {
    let logs: Vec<Value> = gw
        .events
        .lock()
        .await
        .recent_logs()
        .into_iter()
        .map(|(ts, msg)| json!({"ts": ts, "msg": msg}))
        .collect();
    Json(json!({"success": true, "logs": logs}))
}

async fn get_ota_status(State(gw): State<AppState>) -> Json<Value> {
    let writer = gw.self_ota.lock().await;
    Json(json!({
        "success": true,
        "active": writer.is_active(),
        "written": writer.written(),
        "expected_size": writer.expected_size(),
    }))
}

async fn post_ota_upload(State(gw): State<AppState>, body: axum::body::Bytes) -> Result<Json<Value>, ApiError> {
    let mut writer = gw.self_ota.lock().await;
    writer
        .begin(body.len() as u64)
        .map_err(|e| ApiError::conflict(e.to_string()))?;
    writer
        .write(&body)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    writer.end().map_err(|e| ApiError::internal(e.to_string()))?;
    drop(writer);
    gw.restart.schedule_restart(1_500);
    Ok(Json(json!({"success": true, "reboot_required": true})))
}

async fn post_node_ota(
    State(gw): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    let mac = params
        .get("mac")
        .and_then(|s| NodeMac::parse(s))
        .ok_or_else(|| ApiError::bad_request("missing or invalid 'mac' query parameter"))?;
    gw.start_targeted_push(mac, body.into()).await.map_err(ApiError::from)?;
    Ok(Json(json!({"success": true})))
}

async fn get_node_ota_status(State(gw): State<AppState>) -> Json<Value> {
    let mut ota = gw.ota.lock().await;
    if let Some(job) = ota.push_mut() {
        return Json(json!({
            "success": true,
            "kind": "targeted_push",
            "target": job.target.to_string(),
            "state": format!("{:?}", job.state),
            "next_chunk": job.next_chunk,
            "total_chunks": job.total_chunks,
            "progress": job.progress(),
        }));
    }
    if let Some(job) = ota.broadcast_mut() {
        let (completed, failed, participants) = job.summary();
        return Json(json!({
            "success": true,
            "kind": "broadcast_pull",
            "state": format!("{:?}", job.state),
            "version": job.inputs.version,
            "completed": completed,
            "failed": failed,
            "participants": participants,
        }));
    }
    Json(json!({"success": true, "kind": "none"}))
}

async fn post_node_ota_abort(State(gw): State<AppState>) -> Json<Value> {
    gw.ota.lock().await.abort();
    Json(json!({"success": true}))
}

async fn post_node_config(
    State(gw): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let mac = mac_from(&body, "mac")?;
    let key = config_key_code(&body)?;
    let value = body
        .get("value")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_request("missing 'value'"))?;
    gw.node_config_set(mac, key, value.as_bytes()).await.map_err(ApiError::from)?;
    Ok(Json(json!({"success": true})))
}

/// The wire format's `ConfigSet.key` is a bare u8; the HTTP surface
/// accepts either that number directly or one of the named keys the
/// firmware recognizes.
fn config_key_code(body: &Value) -> Result<u8, ApiError> {
    match body.get("key") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| ApiError::bad_request("'key' out of range")),
        Some(Value::String(s)) => match s.as_str() {
            "relay_mode" => Ok(1),
            "led_effect" => Ok(2),
            "report_interval" => Ok(3),
            other => other
                .parse::<u8>()
                .map_err(|_| ApiError::bad_request(format!("unknown config key '{other}'"))),
        },
        _ => Err(ApiError::bad_request("missing 'key'")),
    }
}

async fn post_reboot(State(gw): State<AppState>) -> Json<Value> {
    gw.restart.schedule_restart(1_000);
    Json(json!({"success": true}))
}

async fn post_factory_reset(State(gw): State<AppState>) -> Result<Json<Value>, ApiError> {
    gw.config.lock().await.erase_all().map_err(|e| ApiError::internal(e.to_string()))?;
    gw.restart.schedule_restart(1_000);
    Ok(Json(json!({"success": true})))
}

async fn get_wifi_scan(State(gw): State<AppState>) -> Result<Json<Value>, ApiError> {
    let networks = gw
        .ap_radio
        .scan()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let networks: Vec<Value> = networks
        .into_iter()
        .map(|n| json!({"ssid": n.ssid, "rssi": n.rssi, "secure": n.secure}))
        .collect();
    Ok(Json(json!({"success": true, "networks": networks})))
}

async fn get_provision_status(State(gw): State<AppState>) -> Json<Value> {
    Json(json!({"success": true, "state": gw.provision_state().await}))
}

async fn post_provision_wifi(
    State(gw): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    apply_wifi_config(&gw, &body).await?;
    gw.restart.schedule_restart(2_000);
    Ok(Json(json!({"success": true, "reboot_required": true})))
}

async fn post_provision_mqtt(
    State(gw): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    apply_mqtt_config(&gw, &body).await?;
    Ok(Json(json!({"success": true})))
}

async fn post_provision_all(
    State(gw): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let wifi = body.get("wifi").ok_or_else(|| ApiError::bad_request("missing 'wifi'"))?;
    apply_wifi_config(&gw, wifi).await?;
    if let Some(mqtt) = body.get("mqtt") {
        apply_mqtt_config(&gw, mqtt).await?;
    }
    gw.restart.schedule_restart(2_000);
    Ok(Json(json!({"success": true, "reboot_required": true})))
}

async fn apply_wifi_config(gw: &Gateway, body: &Value) -> Result<(), ApiError> {
    let ssid = body
        .get("ssid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_request("missing 'ssid'"))?;
    let password = body.get("password").and_then(|v| v.as_str()).unwrap_or("");
    let mut config = gw.config.lock().await;
    config.set(KEY_WIFI_SSID, ssid).map_err(|e| ApiError::internal(e.to_string()))?;
    config.set(KEY_WIFI_PASS, password).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(())
}

async fn apply_mqtt_config(gw: &Gateway, body: &Value) -> Result<(), ApiError> {
    let broker_uri = body
        .get("broker_uri")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_request("missing 'broker_uri'"))?;
    let mut config = gw.config.lock().await;
    config.set(KEY_MQTT_URI, broker_uri).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(username) = body.get("username").and_then(|v| v.as_str()) {
        config.set(KEY_MQTT_USER, username).map_err(|e| ApiError::internal(e.to_string()))?;
    }
    if let Some(password) = body.get("password").and_then(|v| v.as_str()) {
        config.set(KEY_MQTT_PASS, password).map_err(|e| ApiError::internal(e.to_string()))?;
    }
    Ok(())
}

async fn captive_redirect() -> impl IntoResponse {
    Redirect::to("http://192.168.4.1/")
}

async fn ws_handler(ws: WebSocketUpgrade, State(gw): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| ws_session(socket, gw))
}

/// Fans out bus events as JSON text frames and keeps the connection
/// alive with a periodic ping; the session ends the moment either side
/// closes or a send fails.
async fn ws_session(mut socket: WebSocket, gw: AppState) {
    let mut events = gw.events.lock().await.subscribe();
    let mut ping = tokio::time::interval(crate::gateway::WS_PING_PERIOD);
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(?e, "websocket recv error");
                        break;
                    }
                }
            }
        }
    }
}

use anyhow::Error;
use omni_gateway::api;
use omni_gateway::config::{
    ConfigStore, FileConfigStore, Identity, ProvisionState, KEY_MQTT_CLIENT, KEY_MQTT_PASS, KEY_MQTT_URI,
    KEY_MQTT_USER,
};
use omni_gateway::gateway::Gateway;
use omni_gateway::hw::{
    FileFlashPartition, NullApRadio, NullMeshTransport, NullUplinkPhy, ProcessRestart, SystemClock,
};
use omni_gateway::mqtt::MqttSettings;
use omni_gateway::node::NodeMac;
use omni_gateway::ota::blob::FileBlobStore;
use rand::RngCore;
use std::sync::Arc;
use tracing::{info, warn};

const HOSTNAME_PREFIX: &str = "omni";
const AP_SSID_PREFIX: &str = "omniapi";
const AP_PSK: &str = "omniapi123";

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("OMNI_GATEWAY_DATA_DIR").unwrap_or_else(|_| ".".to_string());
    let data_dir = std::path::PathBuf::from(data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let config_path = data_dir.join("omni-gateway-config.ron");
    let mut config = FileConfigStore::load(&config_path)?;

    let uplink_mac = resolve_uplink_mac(&mut config)?;
    let identity = Identity::derive(uplink_mac, HOSTNAME_PREFIX);
    info!(gateway_id = %identity.gateway_id.0, hostname = %identity.hostname, "identity resolved");

    let mqtt_settings = MqttSettings {
        uri: config.get(KEY_MQTT_URI).unwrap_or_else(|| "mqtt://localhost:1883".to_string()),
        client_id: config
            .get(KEY_MQTT_CLIENT)
            .unwrap_or_else(|| identity.gateway_id.0.clone()),
        username: config.get(KEY_MQTT_USER),
        password: config.get(KEY_MQTT_PASS),
    };

    let flash_marker = data_dir.join("boot-partition.marker");
    let blob_dir = data_dir.join("ota-staging");
    let provision_state = config.provision_state();

    let gateway = Arc::new(Gateway::new(
        identity,
        Box::new(config),
        Arc::new(NullMeshTransport),
        Arc::new(FileFlashPartition::new(flash_marker, 4 * 1024 * 1024)),
        Arc::new(FileBlobStore::new(blob_dir)),
        Arc::new(SystemClock),
        Arc::new(omni_gateway::hw::NullStatusLed),
        Arc::new(NullApRadio),
        Arc::new(ProcessRestart),
        Arc::new(NullUplinkPhy("ethernet")),
        Arc::new(NullUplinkPhy("wifi")),
        mqtt_settings,
    ));

    gateway.mesh.init().await.ok();
    gateway.mesh.start().await.ok();

    if provision_state == ProvisionState::Unconfigured {
        let suffix = &gateway.identity.gateway_id.0[gateway.identity.gateway_id.0.len() - 4..];
        let ap_ssid = format!("{AP_SSID_PREFIX}_{suffix}");
        info!(ssid = %ap_ssid, "provisioning unconfigured, starting self-AP");
        gateway
            .ap_radio
            .start_ap(&ap_ssid, AP_PSK, [192, 168, 4, 1].into())
            .await
            .ok();

        let dns_bind = std::env::var("OMNI_GATEWAY_CAPTIVE_DNS_BIND")
            .unwrap_or_else(|_| "192.168.4.1:53".to_string());
        tokio::spawn(async move {
            match dns_bind.parse() {
                Ok(addr) => {
                    if let Err(e) = omni_gateway::captive::serve_catchall(addr, [192, 168, 4, 1].into()).await {
                        warn!(?e, "captive dns responder exited");
                    }
                }
                Err(e) => warn!(?e, bind = %dns_bind, "invalid captive dns bind address"),
            }
        });
    }

    gateway.spawn_tasks();

    let bind_addr = std::env::var("OMNI_GATEWAY_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");

    let app = api::router(gateway);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}

/// The uplink MAC that identity derivation needs comes from real NIC
/// hardware out of scope here; this persists a generated one on first
/// boot under a private config key so identity stays stable across
/// restarts without a network-interface seam.
fn resolve_uplink_mac(config: &mut dyn ConfigStore) -> anyhow::Result<NodeMac> {
    const KEY_DEVICE_MAC: &str = "device_mac";
    if let Some(existing) = config.get(KEY_DEVICE_MAC).and_then(|s| NodeMac::parse(&s)) {
        return Ok(existing);
    }
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0xFE;
    let mac = NodeMac(bytes);
    warn!(mac = %mac, "no persisted device mac, generated one for this install");
    config.set(KEY_DEVICE_MAC, &mac.as_hex12())?;
    Ok(mac)
}

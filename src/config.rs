//! Persistent key/value store for Wi-Fi STA, uplink/MQTT, and mesh PSK
//! configuration, plus identity/hostname derivation and provisioning
//! state. The store itself is namespaced and mutable at runtime -- a
//! different shape than a single parse-once struct, since `factory-reset`
//! must be able to erase the whole namespace.

use crate::node::{derive_hostname, GatewayId, NodeMac};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_MQTT_URI: &str = "mqtt_uri";
pub const KEY_MQTT_USER: &str = "mqtt_user";
pub const KEY_MQTT_PASS: &str = "mqtt_pass";
pub const KEY_MQTT_CLIENT: &str = "mqtt_client";
pub const KEY_MESH_PASS: &str = "mesh_pass";
pub const KEY_MESH_CHAN: &str = "mesh_chan";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] ron::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Unconfigured,
    WifiOnly,
    Configured,
}

/// Namespaced key/value abstraction. A host/test build can use
/// `InMemoryConfigStore`; the shipped binary uses `FileConfigStore`.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn erase_all(&mut self) -> Result<(), ConfigError>;

    fn provision_state(&self) -> ProvisionState {
        let has_wifi = self.get(KEY_WIFI_SSID).is_some();
        let has_mqtt = self.get(KEY_MQTT_URI).is_some();
        match (has_wifi, has_mqtt) {
            (false, _) => ProvisionState::Unconfigured,
            (true, false) => ProvisionState::WifiOnly,
            (true, true) => ProvisionState::Configured,
        }
    }
}

#[derive(Default)]
pub struct InMemoryConfigStore {
    values: BTreeMap<String, String>,
}

impl ConfigStore for InMemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), ConfigError> {
        self.values.clear();
        Ok(())
    }
}

/// On-disk document for `FileConfigStore`, RON-encoded like the
/// reference project's own config file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    values: BTreeMap<String, String>,
}

/// File-based store: one RON document read at startup, rewritten
/// atomically (write to a temp path, then rename) on every mutation.
pub struct FileConfigStore {
    path: PathBuf,
    doc: ConfigDocument,
}

impl FileConfigStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(s) => ron::from_str(&s).map_err(ConfigError::Encode)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigDocument::default(),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(FileConfigStore { path, doc })
    }

    fn persist(&self) -> Result<(), ConfigError> {
        let serialized =
            ron::ser::to_string_pretty(&self.doc, Default::default()).map_err(ConfigError::Encode)?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.doc.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.doc.values.insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn erase_all(&mut self) -> Result<(), ConfigError> {
        self.doc.values.clear();
        self.persist()
    }
}

/// Gateway identity (MAC-derived) and AP credentials are never persisted
/// -- derived fresh from the uplink MAC on every boot.
pub struct Identity {
    pub gateway_id: GatewayId,
    pub hostname: String,
}

impl Identity {
    pub fn derive(uplink_mac: NodeMac, hostname_prefix: &str) -> Self {
        Identity {
            gateway_id: GatewayId::from_mac(&uplink_mac),
            hostname: derive_hostname(hostname_prefix, &uplink_mac),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_state_reflects_presence_of_keys() {
        let mut store = InMemoryConfigStore::default();
        assert_eq!(store.provision_state(), ProvisionState::Unconfigured);
        store.set(KEY_WIFI_SSID, "home").unwrap();
        assert_eq!(store.provision_state(), ProvisionState::WifiOnly);
        store.set(KEY_MQTT_URI, "mqtt://broker").unwrap();
        assert_eq!(store.provision_state(), ProvisionState::Configured);
    }

    #[test]
    fn factory_reset_erases_entire_namespace() {
        let mut store = InMemoryConfigStore::default();
        store.set(KEY_WIFI_SSID, "home").unwrap();
        store.set(KEY_MESH_PASS, "secret").unwrap();
        store.erase_all().unwrap();
        assert_eq!(store.get(KEY_WIFI_SSID), None);
        assert_eq!(store.get(KEY_MESH_PASS), None);
        assert_eq!(store.provision_state(), ProvisionState::Unconfigured);
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!(
            "omni-gateway-test-config-{}.ron",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();

        {
            let mut store = FileConfigStore::load(&path).unwrap();
            store.set(KEY_WIFI_SSID, "home").unwrap();
        }
        let store = FileConfigStore::load(&path).unwrap();
        assert_eq!(store.get(KEY_WIFI_SSID), Some("home".to_string()));

        std::fs::remove_file(&path).ok();
    }
}

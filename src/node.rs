//! Node identity and record types shared by the registry, commissioning FSM,
//! and OTA orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 6 opaque bytes, lexicographically ordered, byte-wise equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeMac(pub [u8; 6]);

impl NodeMac {
    pub fn parse(s: &str) -> Option<Self> {
        let hex: String = s.chars().filter(|c| *c != ':').collect();
        if hex.len() != 12 {
            return None;
        }
        let mut out = [0u8; 6];
        for i in 0..6 {
            out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(NodeMac(out))
    }

    pub fn as_hex12(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for NodeMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Serialize for GatewayId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

/// The uplink MAC rendered as 12 uppercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayId(pub String);

impl GatewayId {
    pub fn from_mac(mac: &NodeMac) -> Self {
        GatewayId(mac.as_hex12())
    }
}

/// Fixed prefix + last 4 hex characters of the MAC.
pub fn derive_hostname(prefix: &str, mac: &NodeMac) -> String {
    let hex = mac.as_hex12();
    format!("{}_{}", prefix, &hex[hex.len() - 4..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Unknown,
    Relay,
    LedStrip,
    Dimmer,
    SensorFamily,
    Gateway,
}

impl DeviceType {
    pub fn from_code(b: u8) -> DeviceType {
        match b {
            1 => DeviceType::Relay,
            2 => DeviceType::LedStrip,
            3 => DeviceType::Dimmer,
            4 => DeviceType::SensorFamily,
            5 => DeviceType::Gateway,
            _ => DeviceType::Unknown,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceType::Unknown => 0,
            DeviceType::Relay => 1,
            DeviceType::LedStrip => 2,
            DeviceType::Dimmer => 3,
            DeviceType::SensorFamily => 4,
            DeviceType::Gateway => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Discovered,
    Online,
    Offline,
    Ota,
    Error,
}

/// Packed `(major<<16)|(minor<<8)|patch` rendered on read as "M.m.p".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedVersion(pub u32);

impl PackedVersion {
    pub fn render(self) -> String {
        let major = (self.0 >> 16) & 0xFF;
        let minor = (self.0 >> 8) & 0xFF;
        let patch = self.0 & 0xFF;
        format!("{}.{}.{}", major, minor, patch)
    }
}

impl Serialize for PackedVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.render())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub mac: NodeMac,
    pub device_type: DeviceType,
    pub status: NodeStatus,
    pub mesh_layer: u8,
    pub rssi: i8,
    pub firmware: PackedVersion,
    pub last_seen: u64,
    pub uptime_sec: u32,
}

impl NodeRecord {
    pub fn new(mac: NodeMac, now: u64) -> Self {
        NodeRecord {
            mac,
            device_type: DeviceType::Unknown,
            status: NodeStatus::Discovered,
            mesh_layer: 0,
            rssi: 0,
            firmware: PackedVersion::default(),
            last_seen: now,
            uptime_sec: 0,
        }
    }
}

/// Scan-table entry, distinct from `NodeRecord`, used only during
/// commissioning.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub mac: NodeMac,
    pub device_type: DeviceType,
    pub firmware: String,
    pub rssi: i8,
    pub commissioned: bool,
    pub last_seen: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parses_both_notations() {
        let a = NodeMac::parse("AA:BB:CC:DD:EE:FF").unwrap();
        let b = NodeMac::parse("AABBCCDDEEFF").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn hostname_uses_last_four_hex_chars() {
        let mac = NodeMac([0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        assert_eq!(derive_hostname("omni", &mac), "omni_9ABC");
    }

    #[test]
    fn packed_version_renders_major_minor_patch() {
        let v = PackedVersion(0x00010203);
        assert_eq!(v.render(), "1.2.3");
    }
}

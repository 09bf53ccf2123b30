//! Node registry: up to N reachable nodes keyed by MAC, with a liveness
//! sweeper. Mutated only by the mesh router's receive path and the
//! sweeper -- see the concurrency model.

use crate::node::{DeviceType, NodeMac, NodeRecord, NodeStatus, PackedVersion};
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node registry is full")]
    Full,
    #[error("node not found")]
    NotFound,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Existed,
    Added,
    Full,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Found,
    NotFound,
}

/// Fields carried by a `HeartbeatAck` frame, applied verbatim to the
/// matching record.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatFields {
    pub device_type: DeviceType,
    pub mesh_layer: u8,
    pub rssi: i8,
    pub firmware: PackedVersion,
    pub uptime_sec: u32,
}

pub struct NodeRegistry {
    nodes: HashMap<NodeMac, NodeRecord>,
    capacity: usize,
}

impl NodeRegistry {
    pub fn new(capacity: usize) -> Self {
        NodeRegistry {
            nodes: HashMap::new(),
            capacity,
        }
    }

    /// Idempotent: an existing entry is touched (`last_seen` <- now) and
    /// left `online`; a new entry is created at capacity unless full.
    pub fn add(&mut self, mac: NodeMac, now: u64) -> AddOutcome {
        if let Some(existing) = self.nodes.get_mut(&mac) {
            existing.last_seen = now;
            existing.status = NodeStatus::Online;
            return AddOutcome::Existed;
        }
        if self.nodes.len() >= self.capacity {
            return AddOutcome::Full;
        }
        let mut record = NodeRecord::new(mac, now);
        record.status = NodeStatus::Online;
        self.nodes.insert(mac, record);
        AddOutcome::Added
    }

    pub fn remove(&mut self, mac: &NodeMac) -> RemoveOutcome {
        if self.nodes.remove(mac).is_some() {
            RemoveOutcome::Found
        } else {
            RemoveOutcome::NotFound
        }
    }

    pub fn set_offline(&mut self, mac: &NodeMac) {
        if let Some(record) = self.nodes.get_mut(mac) {
            record.status = NodeStatus::Offline;
        }
    }

    /// Replaces `device_type`, `status`, `mesh_layer`, `rssi`, and firmware
    /// fields; sets `last_seen` <- now. Creates the record if it is the
    /// node's first heartbeat-ack.
    pub fn update_from_heartbeat_ack(&mut self, mac: NodeMac, fields: HeartbeatFields, now: u64) {
        let record = self
            .nodes
            .entry(mac)
            .or_insert_with(|| NodeRecord::new(mac, now));
        record.device_type = fields.device_type;
        record.status = NodeStatus::Online;
        record.mesh_layer = fields.mesh_layer;
        record.rssi = fields.rssi;
        record.firmware = fields.firmware;
        record.uptime_sec = fields.uptime_sec;
        record.last_seen = now;
    }

    /// Transitions any `online` node whose `now - last_seen > timeout_ms`
    /// to `offline`. The record stays, so a future heartbeat re-animates
    /// it.
    pub fn sweep(&mut self, now: u64, timeout_ms: u64) {
        for record in self.nodes.values_mut() {
            if record.status == NodeStatus::Online && now.saturating_sub(record.last_seen) > timeout_ms {
                record.status = NodeStatus::Offline;
            }
        }
    }

    pub fn get(&self, mac: &NodeMac) -> Option<&NodeRecord> {
        self.nodes.get(mac)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deep-copy snapshot for read-only consumers (API handlers, status
    /// task).
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.nodes.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> NodeMac {
        NodeMac([0, 0, 0, 0, 0, b])
    }

    #[test]
    fn add_is_idempotent_and_last_seen_is_non_decreasing() {
        let mut reg = NodeRegistry::new(DEFAULT_CAPACITY);
        assert_eq!(reg.add(mac(1), 100), AddOutcome::Added);
        assert_eq!(reg.add(mac(1), 150), AddOutcome::Existed);
        assert_eq!(reg.add(mac(1), 200), AddOutcome::Existed);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&mac(1)).unwrap().last_seen, 200);
        assert_eq!(reg.get(&mac(1)).unwrap().status, NodeStatus::Online);
    }

    #[test]
    fn add_rejects_past_capacity() {
        let mut reg = NodeRegistry::new(1);
        assert_eq!(reg.add(mac(1), 0), AddOutcome::Added);
        assert_eq!(reg.add(mac(2), 0), AddOutcome::Full);
    }

    #[test]
    fn heartbeat_admission_scenario() {
        let mut reg = NodeRegistry::new(DEFAULT_CAPACITY);
        reg.update_from_heartbeat_ack(
            mac(6),
            HeartbeatFields {
                device_type: DeviceType::Relay,
                mesh_layer: 2,
                rssi: -60,
                firmware: PackedVersion(0x00010203),
                uptime_sec: 120,
            },
            1_000,
        );
        assert_eq!(reg.len(), 1);
        let node = reg.get(&mac(6)).unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.firmware.render(), "1.2.3");
        assert_eq!(node.mesh_layer, 2);
    }

    #[test]
    fn sweep_marks_stale_node_offline_and_keeps_record() {
        let mut reg = NodeRegistry::new(DEFAULT_CAPACITY);
        reg.update_from_heartbeat_ack(
            mac(6),
            HeartbeatFields {
                device_type: DeviceType::Relay,
                mesh_layer: 1,
                rssi: -50,
                firmware: PackedVersion(0),
                uptime_sec: 0,
            },
            1_000,
        );
        reg.sweep(1_000 + 91_000, 90_000);
        let node = reg.get(&mac(6)).unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
    }

    #[test]
    fn liveness_is_monotone_under_repeated_sweeps() {
        let mut reg = NodeRegistry::new(DEFAULT_CAPACITY);
        reg.add(mac(1), 0);
        reg.sweep(100_000, 90_000);
        assert_eq!(reg.get(&mac(1)).unwrap().status, NodeStatus::Offline);
        // A later sweep with no intervening update must not re-animate it.
        reg.sweep(200_000, 90_000);
        assert_eq!(reg.get(&mac(1)).unwrap().status, NodeStatus::Offline);
    }

    #[test]
    fn remove_reports_found_or_not_found() {
        let mut reg = NodeRegistry::new(DEFAULT_CAPACITY);
        reg.add(mac(1), 0);
        assert_eq!(reg.remove(&mac(1)), RemoveOutcome::Found);
        assert_eq!(reg.remove(&mac(1)), RemoveOutcome::NotFound);
    }
}

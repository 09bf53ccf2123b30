//! Commissioning FSM: switches between production and discovery meshes,
//! collects scan responses, ships production credentials, and awaits the
//! node's ack. The gateway is always in exactly one mode.

use crate::codec::CommissionPayload;
use crate::node::{DeviceType, NodeMac, ScanResult};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::oneshot;

pub const DEFAULT_SCAN_RESULT_CAPACITY: usize = 32;
pub const COMMISSION_ACK_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Production,
    Discovery,
}

#[derive(Debug, Error)]
pub enum CommissionError {
    #[error("operation requires mode {0:?}")]
    WrongMode(Mode),
    #[error("timed out waiting for node acknowledgement")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct CommissionResult {
    pub mac: NodeMac,
    pub success: bool,
    pub message: Option<String>,
}

/// Pure state: scan table, mode, and pending-ack bookkeeping. Mesh
/// teardown/restart and frame transmission are performed by the caller
/// (the gateway) against the `MeshAction`s this FSM returns, keeping the
/// FSM itself free of I/O so it's unit-testable.
pub struct CommissioningFsm {
    mode: Mode,
    scanning: bool,
    scan_results: BTreeMap<NodeMac, ScanResult>,
    capacity: usize,
    pending_commission: Option<(NodeMac, oneshot::Sender<CommissionResult>)>,
    pending_decommission: Option<(NodeMac, oneshot::Sender<CommissionResult>)>,
}

pub enum MeshAction {
    RestartAs { mesh_id: &'static str, psk: String },
    Broadcast(Vec<u8>),
    Send(NodeMac, Vec<u8>),
}

impl CommissioningFsm {
    pub fn new() -> Self {
        CommissioningFsm {
            mode: Mode::Production,
            scanning: false,
            scan_results: BTreeMap::new(),
            capacity: DEFAULT_SCAN_RESULT_CAPACITY,
            pending_commission: None,
            pending_decommission: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn scan_results(&self) -> Vec<ScanResult> {
        self.scan_results.values().cloned().collect()
    }

    /// Requires mode `Production`; tears down and re-enters `Discovery`,
    /// clears scan results, sets `scanning = true`.
    pub fn start_scan(&mut self, discovery_psk: &str) -> Result<MeshAction, CommissionError> {
        if self.mode != Mode::Production {
            return Err(CommissionError::WrongMode(Mode::Production));
        }
        self.mode = Mode::Discovery;
        self.scanning = true;
        self.scan_results.clear();
        Ok(MeshAction::RestartAs {
            mesh_id: crate::mesh::DISCOVERY_MESH_ID,
            psk: discovery_psk.to_string(),
        })
    }

    pub fn stop_scan(&mut self, production_psk: &str) -> MeshAction {
        self.mode = Mode::Production;
        self.scanning = false;
        MeshAction::RestartAs {
            mesh_id: crate::mesh::PRODUCTION_MESH_ID,
            psk: production_psk.to_string(),
        }
    }

    /// Called either on `ScanResponse` or on `NodeAnnounce(commissioned =
    /// false)` while in discovery mode. Updates-or-inserts by MAC;
    /// rejects insertion past capacity (existing entries still update).
    pub fn add_discovered_node(
        &mut self,
        mac: NodeMac,
        device_type: DeviceType,
        firmware: String,
        commissioned: bool,
        rssi: i8,
        now: u64,
    ) {
        if let Some(existing) = self.scan_results.get_mut(&mac) {
            existing.device_type = device_type;
            existing.firmware = firmware;
            existing.commissioned = commissioned;
            existing.rssi = rssi;
            existing.last_seen = now;
            return;
        }
        if self.scan_results.len() >= self.capacity {
            return;
        }
        self.scan_results.insert(
            mac,
            ScanResult {
                mac,
                device_type,
                firmware,
                rssi,
                commissioned,
                last_seen: now,
            },
        );
    }

    /// Builds the outbound `Commission` frame; the caller sends it and
    /// retains the returned receiver to learn the eventual ack outcome
    /// (or times it out after `COMMISSION_ACK_TIMEOUT_MS`).
    pub fn begin_commission(
        &mut self,
        mac: NodeMac,
        name: Option<String>,
        production_psk: &[u8; 32],
        plant_id: &[u8; 32],
    ) -> Result<(CommissionPayload, oneshot::Receiver<CommissionResult>), CommissionError> {
        if self.mode != Mode::Discovery {
            return Err(CommissionError::WrongMode(Mode::Discovery));
        }
        let mut network_id = [0u8; 6];
        network_id[..6.min(crate::mesh::PRODUCTION_MESH_ID.len())]
            .copy_from_slice(crate::mesh::PRODUCTION_MESH_ID.as_bytes());
        let mut node_name = [0u8; 32];
        if let Some(name) = &name {
            let bytes = name.as_bytes();
            let n = bytes.len().min(32);
            node_name[..n].copy_from_slice(&bytes[..n]);
        }
        let payload = CommissionPayload {
            target_mac: mac.0,
            network_id,
            network_key: *production_psk,
            plant_id: *plant_id,
            node_name,
        };
        let (tx, rx) = oneshot::channel();
        self.pending_commission = Some((mac, tx));
        Ok((payload, rx))
    }

    /// Delivers a `CommissionAck` to the pending waiter, if the MAC
    /// matches; otherwise it is a stray ack and is dropped.
    pub fn complete_commission(&mut self, mac: NodeMac, status: u8) {
        if let Some((pending_mac, tx)) = self.pending_commission.take() {
            if pending_mac == mac {
                let _ = tx.send(CommissionResult {
                    mac,
                    success: status == 0,
                    message: None,
                });
            } else {
                self.pending_commission = Some((pending_mac, tx));
            }
        }
    }

    pub fn begin_decommission(
        &mut self,
        mac: NodeMac,
    ) -> Result<(Vec<u8>, oneshot::Receiver<CommissionResult>), CommissionError> {
        if self.mode != Mode::Production {
            return Err(CommissionError::WrongMode(Mode::Production));
        }
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&mac.0);
        let (tx, rx) = oneshot::channel();
        self.pending_decommission = Some((mac, tx));
        Ok((payload, rx))
    }

    /// Builds an `Identify{target=mac}` frame. No ack is awaited -- the
    /// node just blinks its indicator on receipt.
    pub fn identify(&self, mac: NodeMac) -> Vec<u8> {
        mac.0.to_vec()
    }

    pub fn complete_decommission(&mut self, mac: NodeMac, status: u8) {
        if let Some((pending_mac, tx)) = self.pending_decommission.take() {
            if pending_mac == mac {
                let _ = tx.send(CommissionResult {
                    mac,
                    success: status == 0,
                    message: None,
                });
            } else {
                self.pending_decommission = Some((pending_mac, tx));
            }
        }
    }
}

impl Default for CommissioningFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> NodeMac {
        NodeMac([0xAA, 0, 0, 0, 0, b])
    }

    #[test]
    fn start_scan_requires_production_mode() {
        let mut fsm = CommissioningFsm::new();
        assert!(fsm.start_scan("discovery-psk").is_ok());
        assert_eq!(fsm.mode(), Mode::Discovery);
        assert!(fsm.start_scan("discovery-psk").is_err());
    }

    #[test]
    fn commission_round_trip_scenario() {
        let mut fsm = CommissioningFsm::new();
        fsm.start_scan("discovery-psk").unwrap();

        fsm.add_discovered_node(mac(1), DeviceType::Relay, "2.0.0".into(), false, -50, 1_000);
        let results = fsm.scan_results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].commissioned);

        let production_psk = [7u8; 32];
        let plant_id = [9u8; 32];
        let (payload, rx) = fsm
            .begin_commission(mac(1), Some("r1".to_string()), &production_psk, &plant_id)
            .unwrap();
        assert_eq!(payload.target_mac, mac(1).0);
        assert_eq!(&payload.network_id[..6], crate::mesh::PRODUCTION_MESH_ID.as_bytes());
        assert_eq!(&payload.node_name[..2], b"r1");

        fsm.complete_commission(mac(1), 0);
        let result = rx.try_recv().unwrap();
        assert!(result.success);
    }

    #[test]
    fn stray_ack_for_unknown_mac_does_not_resolve_pending_waiter() {
        let mut fsm = CommissioningFsm::new();
        fsm.start_scan("discovery-psk").unwrap();
        let (_, rx) = fsm
            .begin_commission(mac(1), None, &[0u8; 32], &[0u8; 32])
            .unwrap();
        fsm.complete_commission(mac(2), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn identify_builds_a_bare_target_mac_payload() {
        let fsm = CommissioningFsm::new();
        assert_eq!(fsm.identify(mac(4)), mac(4).0.to_vec());
    }

    #[test]
    fn scan_results_respect_capacity() {
        let mut fsm = CommissioningFsm::new();
        fsm.capacity = 1;
        fsm.start_scan("discovery-psk").unwrap();
        fsm.add_discovered_node(mac(1), DeviceType::Relay, "1.0.0".into(), false, -40, 0);
        fsm.add_discovered_node(mac(2), DeviceType::Relay, "1.0.0".into(), false, -40, 0);
        assert_eq!(fsm.scan_results().len(), 1);
    }
}

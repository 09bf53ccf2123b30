//! Mesh router: owns the mesh as fixed root, validates and classifies
//! received frames, and exposes the send/broadcast API. Runs only on the
//! root. Dispatch to the node registry, commissioning FSM, OTA
//! orchestrator, and event bus is performed by the caller (the top-level
//! gateway) against the `Dispatch` this module classifies -- keeping the
//! classification itself pure and unit-testable.

use crate::codec::{self, DecodeError, Frame, MsgType};
use crate::hw::{MeshTransport, TransportError};
use crate::node::NodeMac;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const PRODUCTION_MESH_ID: &str = "OMNIAP";
pub const DISCOVERY_MESH_ID: &str = "OMNIDS";

/// Fixed PSK for the discovery mesh. Unlike the production PSK (persisted
/// per-installation in the config store), discovery has to be joinable by
/// any factory-fresh node, so it is not configurable.
pub const DISCOVERY_PSK: &str = "omniapi-discovery-psk";

#[derive(Debug, Default)]
pub struct MeshStats {
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub send_errors: AtomicU64,
}

/// The classified outcome of a single received frame, per the receive
/// dispatch table. Self-originated echoes and unknown types resolve to
/// `Drop`.
#[derive(Debug, Clone)]
pub enum Dispatch {
    HeartbeatAck(codec::HeartbeatAckPayload),
    NodeAnnounceCommissioned(codec::NodeAnnouncePayload),
    NodeAnnounceUncommissioned(codec::NodeAnnouncePayload),
    ScanResponse(codec::ScanResponsePayload),
    CommissionAck(codec::AckPayload),
    DecommissionAck(codec::AckPayload),
    OtaRequest(codec::OtaRequestPayload),
    OtaComplete(codec::OtaCompletePayload),
    OtaFailed(codec::OtaFailedPayload),
    OtaAck(codec::OtaAckPayload),
    RelayStatus { mac: NodeMac, channel: u8, state: u8 },
    LedStatus { mac: NodeMac, on: u8, r: u8, g: u8, b: u8, brightness: u8, effect_id: u8 },
    SensorData { mac: NodeMac, sensor_type: u8, value: i32, unit: u8 },
    Drop,
}

/// Decode a raw frame and classify it per the receive dispatch rules.
/// Protocol errors (bad magic/length/version) bubble up as `DecodeError`
/// so the caller can log-and-drop per the error-class-1 policy; payload
/// shape mismatches inside an otherwise-valid frame classify as `Drop`
/// (unknown/malformed payloads are also silently dropped).
pub fn classify(buf: &[u8], from: NodeMac) -> Result<Dispatch, DecodeError> {
    let frame: Frame = codec::decode(buf)?;
    Ok(classify_frame(&frame, from))
}

fn classify_frame(frame: &Frame, from: NodeMac) -> Dispatch {
    match frame.msg_type {
        MsgType::HeartbeatAck => match codec::HeartbeatAckPayload::decode(&frame.payload) {
            Ok(p) => Dispatch::HeartbeatAck(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::NodeAnnounce => match codec::NodeAnnouncePayload::decode(&frame.payload) {
            Ok(p) if p.commissioned => Dispatch::NodeAnnounceCommissioned(p),
            Ok(p) => Dispatch::NodeAnnounceUncommissioned(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::ScanResponse => match codec::ScanResponsePayload::decode(&frame.payload) {
            Ok(p) => Dispatch::ScanResponse(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::CommissionAck => match codec::AckPayload::decode(&frame.payload) {
            Ok(p) => Dispatch::CommissionAck(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::DecommissionAck => match codec::AckPayload::decode(&frame.payload) {
            Ok(p) => Dispatch::DecommissionAck(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::OtaRequest => match codec::OtaRequestPayload::decode(&frame.payload) {
            Ok(p) => Dispatch::OtaRequest(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::OtaComplete => match codec::OtaCompletePayload::decode(&frame.payload) {
            Ok(p) => Dispatch::OtaComplete(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::OtaFailed => match codec::OtaFailedPayload::decode(&frame.payload) {
            Ok(p) => Dispatch::OtaFailed(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::OtaAck => match codec::OtaAckPayload::decode(&frame.payload) {
            Ok(p) => Dispatch::OtaAck(p),
            Err(_) => Dispatch::Drop,
        },
        MsgType::RelayStatus if frame.payload.len() >= 2 => Dispatch::RelayStatus {
            mac: from,
            channel: frame.payload[0],
            state: frame.payload[1],
        },
        MsgType::LedStatus if frame.payload.len() >= 6 => Dispatch::LedStatus {
            mac: from,
            on: frame.payload[0],
            r: frame.payload[1],
            g: frame.payload[2],
            b: frame.payload[3],
            brightness: frame.payload[4],
            effect_id: frame.payload[5],
        },
        MsgType::SensorData if frame.payload.len() >= 12 => Dispatch::SensorData {
            mac: from,
            sensor_type: frame.payload[6],
            value: i32::from_le_bytes([
                frame.payload[7],
                frame.payload[8],
                frame.payload[9],
                frame.payload[10],
            ]),
            unit: frame.payload[11],
        },
        // Self-originated types are dropped if echoed back.
        MsgType::Heartbeat | MsgType::ScanRequest => Dispatch::Drop,
        _ => Dispatch::Drop,
    }
}

pub struct MeshRouter {
    transport: Arc<dyn MeshTransport>,
    stats: Arc<MeshStats>,
}

impl MeshRouter {
    pub fn new(transport: Arc<dyn MeshTransport>) -> Self {
        MeshRouter {
            transport,
            stats: Arc::new(MeshStats::default()),
        }
    }

    pub async fn init(&self) -> Result<(), TransportError> {
        self.transport.init().await
    }

    pub async fn start(&self) -> Result<(), TransportError> {
        self.transport.start(PRODUCTION_MESH_ID, "").await
    }

    /// Teardown-then-restart switch used for commissioning mode changes.
    /// This is a heavy operation and must be sequenced on a single task
    /// to avoid re-entry -- callers serialize through the commissioning
    /// FSM, which owns the only caller.
    pub async fn start_with_id(&self, mesh_id: &str, psk: &str) -> Result<(), TransportError> {
        self.transport.stop().await.ok();
        self.transport.start(mesh_id, psk).await
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        self.transport.stop().await
    }

    pub async fn send(&self, mac: NodeMac, bytes: &[u8]) -> Result<(), TransportError> {
        let result = self.transport.send(mac, bytes).await;
        if result.is_err() {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Iterates the routing table and unicasts to each; succeeds if at
    /// least one unicast succeeded.
    pub async fn broadcast(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let table = self.transport.routing_table();
        let mut ok = 0usize;
        for mac in table {
            if self.send(mac, bytes).await.is_ok() {
                ok += 1;
            }
        }
        if ok == 0 && !self.transport.routing_table().is_empty() {
            return Err(TransportError::SendFailed);
        }
        Ok(ok)
    }

    pub fn is_node_reachable(&self, mac: &NodeMac) -> bool {
        self.transport.routing_table().contains(mac)
    }

    pub fn get_routing_table(&self) -> Vec<NodeMac> {
        self.transport.routing_table()
    }

    pub fn get_stats(&self) -> Arc<MeshStats> {
        self.stats.clone()
    }

    /// Blocks until the next received frame or child connect/disconnect
    /// notification. Drained by the RX pump task.
    pub async fn recv(&self) -> Option<crate::hw::MeshEvent> {
        let event = self.transport.recv().await;
        if matches!(event, Some(crate::hw::MeshEvent::FrameReceived { .. })) {
            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;

    fn mac(b: u8) -> NodeMac {
        NodeMac([0, 0, 0, 0, 0, b])
    }

    #[test]
    fn heartbeat_ack_classifies_to_registry_update() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload.push(1);
        payload.push(2);
        payload.push(2);
        payload.push((-60i8) as u8);
        payload.extend_from_slice(&0x00010203u32.to_le_bytes());
        payload.extend_from_slice(&120u32.to_le_bytes());
        let wire = encode(MsgType::HeartbeatAck, 0, &payload).unwrap();

        match classify(&wire, mac(6)).unwrap() {
            Dispatch::HeartbeatAck(p) => assert_eq!(p.mesh_layer, 2),
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    #[test]
    fn commissioned_node_announce_classifies_differently_from_uncommissioned() {
        let mk = |commissioned: u8| {
            let mut payload = Vec::new();
            payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
            payload.push(1);
            payload.push(0);
            payload.extend_from_slice(&1u32.to_le_bytes());
            payload.push(commissioned);
            encode(MsgType::NodeAnnounce, 0, &payload).unwrap()
        };

        match classify(&mk(1), mac(6)).unwrap() {
            Dispatch::NodeAnnounceCommissioned(_) => {}
            other => panic!("expected commissioned announce, got {other:?}"),
        }
        match classify(&mk(0), mac(6)).unwrap() {
            Dispatch::NodeAnnounceUncommissioned(_) => {}
            other => panic!("expected uncommissioned announce, got {other:?}"),
        }
    }

    #[test]
    fn self_originated_heartbeat_is_dropped() {
        let wire = encode(MsgType::Heartbeat, 0, &[]).unwrap();
        assert!(matches!(classify(&wire, mac(1)).unwrap(), Dispatch::Drop));
    }

    #[test]
    fn unknown_message_type_is_dropped() {
        let wire = encode(MsgType::Unknown(0x99), 0, &[1, 2, 3]).unwrap();
        assert!(matches!(classify(&wire, mac(1)).unwrap(), Dispatch::Drop));
    }

    #[test]
    fn malformed_frame_surfaces_as_decode_error() {
        let mut wire = encode(MsgType::Heartbeat, 0, &[]).unwrap();
        wire[0] = 0;
        assert!(classify(&wire, mac(1)).is_err());
    }
}

//! Framed binary mesh protocol: 8-byte header + up to 200 bytes of payload.
//! Decoding is explicit field-wise little-endian reads, never a packed
//! derive-macro struct over the wire -- a 16-bit magic makes header-level
//! probing cheap without relying on in-memory layout.

use thiserror::Error;

pub const MAGIC: u16 = 0x4F50;
pub const PROTOCOL_VERSION: u8 = 0x02;
pub const HEADER_LEN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame shorter than header")]
    TooShort,
    #[error("bad magic")]
    BadMagic,
    #[error("bad protocol version")]
    BadVersion,
    #[error("declared payload length out of bounds")]
    BadLength,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload exceeds {MAX_PAYLOAD_LEN} bytes")]
    PayloadTooLarge,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadMismatch {
    #[error("payload length {0} does not match expected shape for this message type")]
    WrongLength(usize),
}

/// System / discovery / control / OTA message type space, partitioned by
/// nibble per the wire spec. Unknown bytes decode to `MsgType::Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Heartbeat,
    HeartbeatAck,
    Ping,
    Reboot,
    FactoryReset,
    NodeAnnounce,
    ScanRequest,
    ScanResponse,
    Commission,
    CommissionAck,
    Decommission,
    DecommissionAck,
    Identify,
    RelayCmd,
    RelayStatus,
    LedCmd,
    LedStatus,
    SensorData,
    OtaAvailable,
    OtaRequest,
    OtaData,
    OtaComplete,
    OtaFailed,
    OtaAbort,
    OtaBegin,
    OtaAck,
    OtaEnd,
    ConfigSet,
    Error,
    Unknown(u8),
}

impl MsgType {
    pub fn code(self) -> u8 {
        match self {
            MsgType::Heartbeat => 0x01,
            MsgType::HeartbeatAck => 0x02,
            MsgType::Ping => 0x03,
            MsgType::Reboot => 0x04,
            MsgType::FactoryReset => 0x05,
            MsgType::NodeAnnounce => 0x07,
            MsgType::ScanRequest => 0x10,
            MsgType::ScanResponse => 0x11,
            MsgType::Commission => 0x12,
            MsgType::CommissionAck => 0x13,
            MsgType::Decommission => 0x14,
            MsgType::DecommissionAck => 0x15,
            MsgType::Identify => 0x16,
            MsgType::RelayCmd => 0x20,
            MsgType::RelayStatus => 0x21,
            MsgType::LedCmd => 0x22,
            MsgType::LedStatus => 0x23,
            MsgType::SensorData => 0x30,
            MsgType::OtaAvailable => 0x40,
            MsgType::OtaRequest => 0x41,
            MsgType::OtaData => 0x42,
            MsgType::OtaComplete => 0x43,
            MsgType::OtaFailed => 0x44,
            MsgType::OtaAbort => 0x45,
            MsgType::OtaBegin => 0x46,
            MsgType::OtaAck => 0x47,
            MsgType::OtaEnd => 0x48,
            MsgType::ConfigSet => 0x60,
            MsgType::Error => 0xF0,
            MsgType::Unknown(b) => b,
        }
    }

    pub fn from_code(b: u8) -> MsgType {
        match b {
            0x01 => MsgType::Heartbeat,
            0x02 => MsgType::HeartbeatAck,
            0x03 => MsgType::Ping,
            0x04 => MsgType::Reboot,
            0x05 => MsgType::FactoryReset,
            0x07 => MsgType::NodeAnnounce,
            0x10 => MsgType::ScanRequest,
            0x11 => MsgType::ScanResponse,
            0x12 => MsgType::Commission,
            0x13 => MsgType::CommissionAck,
            0x14 => MsgType::Decommission,
            0x15 => MsgType::DecommissionAck,
            0x16 => MsgType::Identify,
            0x20 => MsgType::RelayCmd,
            0x21 => MsgType::RelayStatus,
            0x22 => MsgType::LedCmd,
            0x23 => MsgType::LedStatus,
            0x30 => MsgType::SensorData,
            0x40 => MsgType::OtaAvailable,
            0x41 => MsgType::OtaRequest,
            0x42 => MsgType::OtaData,
            0x43 => MsgType::OtaComplete,
            0x44 => MsgType::OtaFailed,
            0x45 => MsgType::OtaAbort,
            0x46 => MsgType::OtaBegin,
            0x47 => MsgType::OtaAck,
            0x48 => MsgType::OtaEnd,
            0x60 => MsgType::ConfigSet,
            0xF0 => MsgType::Error,
            other => MsgType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub msg_type: MsgType,
    pub seq: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

/// Encode a frame. Fails only if the payload exceeds the wire cap.
pub fn encode(msg_type: MsgType, seq: u8, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(PROTOCOL_VERSION);
    out.push(msg_type.code());
    out.push(seq);
    out.push(0); // flags, reserved
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a frame from a received buffer. `buf` may be longer than the
/// frame (the caller owns re-framing); only the declared payload_len bytes
/// are consumed.
pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::TooShort);
    }
    let magic = u16::from_le_bytes([buf[0], buf[1]]);
    if magic != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = buf[2];
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::BadVersion);
    }
    let msg_type = MsgType::from_code(buf[3]);
    let seq = buf[4];
    let flags = buf[5];
    let payload_len = u16::from_le_bytes([buf[6], buf[7]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN || buf.len() < HEADER_LEN + payload_len {
        return Err(DecodeError::BadLength);
    }
    let payload = buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
    Ok(Frame {
        version,
        msg_type,
        seq,
        flags,
        payload,
    })
}

/// Read a fixed-size MAC out of a payload slice at `offset`.
pub fn read_mac(buf: &[u8], offset: usize) -> Result<[u8; 6], PayloadMismatch> {
    buf.get(offset..offset + 6)
        .and_then(|s| s.try_into().ok())
        .ok_or(PayloadMismatch::WrongLength(buf.len()))
}

pub fn read_u32_le(buf: &[u8], offset: usize) -> Result<u32, PayloadMismatch> {
    buf.get(offset..offset + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(PayloadMismatch::WrongLength(buf.len()))
}

pub fn read_u16_le(buf: &[u8], offset: usize) -> Result<u16, PayloadMismatch> {
    buf.get(offset..offset + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or(PayloadMismatch::WrongLength(buf.len()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatAckPayload {
    pub mac: [u8; 6],
    pub device_type: u8,
    pub status: u8,
    pub mesh_layer: u8,
    pub rssi: i8,
    pub fw_version: u32,
    pub uptime: u32,
}

impl HeartbeatAckPayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 18 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        Ok(Self {
            mac: read_mac(buf, 0)?,
            device_type: buf[6],
            status: buf[7],
            mesh_layer: buf[8],
            rssi: buf[9] as i8,
            fw_version: read_u32_le(buf, 10)?,
            uptime: read_u32_le(buf, 14)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAnnouncePayload {
    pub mac: [u8; 6],
    pub device_type: u8,
    pub capabilities: u8,
    pub fw_version: u32,
    pub commissioned: bool,
}

impl NodeAnnouncePayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 13 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        Ok(Self {
            mac: read_mac(buf, 0)?,
            device_type: buf[6],
            capabilities: buf[7],
            fw_version: read_u32_le(buf, 8)?,
            commissioned: buf[12] != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResponsePayload {
    pub mac: [u8; 6],
    pub device_type: u8,
    pub fw_version: u32,
    pub commissioned: bool,
    pub rssi: i8,
}

impl ScanResponsePayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 13 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        Ok(Self {
            mac: read_mac(buf, 0)?,
            device_type: buf[6],
            fw_version: read_u32_le(buf, 7)?,
            commissioned: buf[11] != 0,
            rssi: buf.get(12).copied().ok_or(PayloadMismatch::WrongLength(buf.len()))? as i8,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionPayload {
    pub target_mac: [u8; 6],
    pub network_id: [u8; 6],
    pub network_key: [u8; 32],
    pub plant_id: [u8; 32],
    pub node_name: [u8; 32],
}

impl CommissionPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 6 + 32 + 32 + 32);
        out.extend_from_slice(&self.target_mac);
        out.extend_from_slice(&self.network_id);
        out.extend_from_slice(&self.network_key);
        out.extend_from_slice(&self.plant_id);
        out.extend_from_slice(&self.node_name);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub mac: [u8; 6],
    pub status: u8,
}

impl AckPayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 7 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        Ok(Self {
            mac: read_mac(buf, 0)?,
            status: buf[6],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaAvailablePayload {
    pub device_type: u8,
    pub fw_version: u32,
    pub total_size: u32,
    pub sha256: [u8; 32],
    pub chunk_size: u16,
}

impl OtaAvailablePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + 4 + 32 + 2);
        out.push(self.device_type);
        out.extend_from_slice(&self.fw_version.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.sha256);
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaRequestPayload {
    pub mac: [u8; 6],
    pub offset: u32,
    pub length: u16,
}

impl OtaRequestPayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 12 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        Ok(Self {
            mac: read_mac(buf, 0)?,
            offset: read_u32_le(buf, 6)?,
            length: read_u16_le(buf, 10)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaDataPayload {
    pub offset: u32,
    pub length: u16,
    pub last_chunk: bool,
    pub data: Vec<u8>,
}

impl OtaDataPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.data.len());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.push(self.last_chunk as u8);
        out.extend_from_slice(&self.data);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaCompletePayload {
    pub mac: [u8; 6],
    pub new_version: u32,
}

impl OtaCompletePayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 10 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        Ok(Self {
            mac: read_mac(buf, 0)?,
            new_version: read_u32_le(buf, 6)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaFailedPayload {
    pub mac: [u8; 6],
    pub error: u8,
    pub msg: String,
}

impl OtaFailedPayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 7 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        let msg_bytes = &buf[7..buf.len().min(39)];
        let msg = String::from_utf8_lossy(msg_bytes)
            .trim_end_matches('\0')
            .to_string();
        Ok(Self {
            mac: read_mac(buf, 0)?,
            error: buf[6],
            msg,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaBeginPayload {
    pub target: [u8; 6],
    pub total_size: u32,
    pub chunk_size: u16,
    pub total_chunks: u16,
    pub crc32: u32,
}

impl OtaBeginPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 4 + 2 + 2 + 4);
        out.extend_from_slice(&self.target);
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        out.extend_from_slice(&self.total_chunks.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaAckPayload {
    pub mac: [u8; 6],
    pub chunk_index: u16,
    pub status: u8,
}

impl OtaAckPayload {
    pub fn decode(buf: &[u8]) -> Result<Self, PayloadMismatch> {
        if buf.len() < 9 {
            return Err(PayloadMismatch::WrongLength(buf.len()));
        }
        Ok(Self {
            mac: read_mac(buf, 0)?,
            chunk_index: read_u16_le(buf, 6)?,
            status: buf[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaEndPayload {
    pub target: [u8; 6],
    pub total_chunks: u16,
    pub crc32: u32,
}

impl OtaEndPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 2 + 4);
        out.extend_from_slice(&self.target);
        out.extend_from_slice(&self.total_chunks.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_any_payload_under_cap() {
        for len in [0usize, 1, 180, 200] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let wire = encode(MsgType::HeartbeatAck, 7, &payload).unwrap();
            let frame = decode(&wire).unwrap();
            assert_eq!(frame.msg_type, MsgType::HeartbeatAck);
            assert_eq!(frame.seq, 7);
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode(MsgType::OtaData, 0, &payload),
            Err(EncodeError::PayloadTooLarge)
        );
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert_eq!(decode(&[0x50, 0x4F, 0x02]), Err(DecodeError::TooShort));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut wire = encode(MsgType::Heartbeat, 0, &[]).unwrap();
        wire[0] = 0xFF;
        assert_eq!(decode(&wire), Err(DecodeError::BadMagic));
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut wire = encode(MsgType::Heartbeat, 0, &[]).unwrap();
        wire[2] = 0x01;
        assert_eq!(decode(&wire), Err(DecodeError::BadVersion));
    }

    #[test]
    fn decode_rejects_length_exceeding_cap() {
        let mut wire = encode(MsgType::Heartbeat, 0, &[]).unwrap();
        wire[6] = 0xFF;
        wire[7] = 0xFF;
        assert_eq!(decode(&wire), Err(DecodeError::BadLength));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let mut wire = encode(MsgType::Heartbeat, 0, &[1, 2, 3]).unwrap();
        wire.truncate(wire.len() - 1);
        assert_eq!(decode(&wire), Err(DecodeError::BadLength));
    }

    #[test]
    fn heartbeat_ack_payload_decodes_scenario_values() {
        // mac=01:02:03:04:05:06, device_type=0x01, status=0x02, layer=2,
        // rssi=-60, fw=0x00010203, uptime=120
        let mut payload = Vec::new();
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload.push(0x01);
        payload.push(0x02);
        payload.push(2);
        payload.push((-60i8) as u8);
        payload.extend_from_slice(&0x00010203u32.to_le_bytes());
        payload.extend_from_slice(&120u32.to_le_bytes());

        let parsed = HeartbeatAckPayload::decode(&payload).unwrap();
        assert_eq!(parsed.mac, [1, 2, 3, 4, 5, 6]);
        assert_eq!(parsed.mesh_layer, 2);
        assert_eq!(parsed.rssi, -60);
        assert_eq!(parsed.fw_version, 0x00010203);
        assert_eq!(parsed.uptime, 120);
    }

    #[test]
    fn unknown_message_type_round_trips_as_unknown() {
        assert_eq!(MsgType::from_code(0x99).code(), 0x99);
    }
}

//! Broadcast-pull OTA: fetch -> verify -> advertise -> serve chunks on
//! demand -> collect completions. Homogeneous rollout by device type; the
//! firmware buffer lives in RAM because arbitrary random-access chunk
//! requests from many nodes must be served.

use crate::codec::{OtaAvailablePayload, OtaDataPayload};
use crate::node::{DeviceType, NodeMac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub const CHUNK_SIZE: u16 = 180;
pub const JOB_DEADLINE: Duration = Duration::from_secs(600);
pub const INACTIVITY_RESYNC: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastOtaError {
    #[error("download incomplete")]
    DownloadIncomplete,
    #[error("SHA256 mismatch")]
    Sha256Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Downloading,
    Advertising,
    Distributing,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct ParticipantStatus {
    pub received_bytes: u32,
    pub completed: bool,
    pub failed: bool,
    pub error_code: Option<u8>,
}

pub struct StartJobInputs {
    pub url: String,
    pub version: String,
    pub version_packed: u32,
    pub sha256_hex: String,
    pub total_size: u32,
    pub device_type: DeviceType,
    pub targets: Vec<NodeMac>,
}

pub struct BroadcastPullJob {
    pub inputs: StartJobInputs,
    pub state: JobState,
    pub firmware: Option<Vec<u8>>,
    pub participants: BTreeMap<NodeMac, ParticipantStatus>,
    pub failure_reason: Option<String>,
    pub last_activity_ms: u64,
}

impl BroadcastPullJob {
    pub fn new(inputs: StartJobInputs, now: u64) -> Self {
        BroadcastPullJob {
            inputs,
            state: JobState::Downloading,
            firmware: None,
            participants: BTreeMap::new(),
            failure_reason: None,
            last_activity_ms: now,
        }
    }

    fn fail(&mut self, reason: &str) {
        self.state = JobState::Failed;
        self.failure_reason = Some(reason.to_string());
        self.firmware = None;
    }

    /// Applies the fully-downloaded buffer: rejects on size mismatch,
    /// verifies SHA-256 byte-wise, and only then advances the state past
    /// `Downloading`.
    pub fn apply_downloaded(&mut self, bytes: Vec<u8>) -> Result<(), BroadcastOtaError> {
        if bytes.len() as u32 != self.inputs.total_size {
            self.fail("Download incomplete");
            return Err(BroadcastOtaError::DownloadIncomplete);
        }
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let digest_hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        if digest_hex != self.inputs.sha256_hex.to_lowercase() {
            self.fail("SHA256 mismatch");
            return Err(BroadcastOtaError::Sha256Mismatch);
        }
        self.firmware = Some(bytes);
        self.state = JobState::Advertising;
        Ok(())
    }

    pub fn sha256(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        let hex = &self.inputs.sha256_hex;
        for i in 0..32 {
            if let Ok(b) = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16) {
                out[i] = b;
            }
        }
        out
    }

    pub fn advertisement(&mut self) -> OtaAvailablePayload {
        self.state = JobState::Distributing;
        OtaAvailablePayload {
            device_type: self.inputs.device_type.code(),
            fw_version: self.inputs.version_packed,
            total_size: self.inputs.total_size,
            sha256: self.sha256(),
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Registers the requesting node on first sight (subject to a bounded
    /// participant list) and replies with the clamped chunk.
    pub fn handle_request(
        &mut self,
        mac: NodeMac,
        offset: u32,
        length: u16,
        now: u64,
        max_participants: usize,
    ) -> Option<OtaDataPayload> {
        let firmware = self.firmware.as_ref()?;
        if !self.participants.contains_key(&mac) && self.participants.len() >= max_participants {
            return None;
        }
        self.participants.entry(mac).or_default();
        self.last_activity_ms = now;

        let remaining = self.inputs.total_size.saturating_sub(offset);
        let clamped = length.min(CHUNK_SIZE).min(remaining as u16);
        let start = offset as usize;
        let end = (start + clamped as usize).min(firmware.len());
        let data = firmware.get(start..end)?.to_vec();
        let last_chunk = offset + clamped as u32 >= self.inputs.total_size;
        Some(OtaDataPayload {
            offset,
            length: clamped,
            last_chunk,
            data,
        })
    }

    pub fn mark_completed(&mut self, mac: NodeMac) {
        self.participants.entry(mac).or_default().completed = true;
    }

    pub fn mark_failed(&mut self, mac: NodeMac, error_code: u8) {
        let entry = self.participants.entry(mac).or_default();
        entry.failed = true;
        entry.error_code = Some(error_code);
    }

    /// When `completed + failed >= participants`, transition to
    /// `Complete` and free the firmware buffer.
    pub fn maybe_finish(&mut self) -> bool {
        if self.participants.is_empty() {
            return false;
        }
        let done = self
            .participants
            .values()
            .filter(|p| p.completed || p.failed)
            .count();
        if done >= self.participants.len() && self.state == JobState::Distributing {
            self.state = JobState::Complete;
            self.firmware = None;
            true
        } else {
            false
        }
    }

    pub fn abort(&mut self) {
        self.state = JobState::Aborted;
        self.firmware = None;
    }

    pub fn needs_inactivity_resync(&self, now: u64) -> bool {
        self.state == JobState::Distributing
            && now.saturating_sub(self.last_activity_ms) as u128 >= INACTIVITY_RESYNC.as_millis()
    }

    pub fn summary(&self) -> (usize, usize, usize) {
        let completed = self.participants.values().filter(|p| p.completed).count();
        let failed = self.participants.values().filter(|p| p.failed).count();
        (completed, failed, self.participants.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> NodeMac {
        NodeMac([0, 0, 0, 0, 0, b])
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn job_with(firmware: Vec<u8>, wrong_hash: bool) -> BroadcastPullJob {
        let sha = if wrong_hash {
            "0".repeat(64)
        } else {
            sha256_hex(&firmware)
        };
        let inputs = StartJobInputs {
            url: "http://example/fw.bin".into(),
            version: "1.0.0".into(),
            version_packed: 0x010000,
            sha256_hex: sha,
            total_size: firmware.len() as u32,
            device_type: DeviceType::Relay,
            targets: vec![],
        };
        BroadcastPullJob::new(inputs, 0)
    }

    #[test]
    fn sha_gated_advance_scenario() {
        let firmware = vec![0xABu8; 4096];
        let mut job = job_with(firmware.clone(), false);
        job.apply_downloaded(firmware).unwrap();
        assert_eq!(job.state, JobState::Advertising);
    }

    #[test]
    fn sha_mismatch_fails_without_advertising() {
        let firmware = vec![0xABu8; 4096];
        let mut job = job_with(firmware.clone(), true);
        let err = job.apply_downloaded(firmware).unwrap_err();
        assert_eq!(err, BroadcastOtaError::Sha256Mismatch);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("SHA256 mismatch"));
        assert!(job.firmware.is_none());
    }

    #[test]
    fn chunk_requests_are_clamped_to_180_and_remaining_size() {
        let firmware = vec![0x11u8; 4096];
        let mut job = job_with(firmware.clone(), false);
        job.apply_downloaded(firmware).unwrap();
        job.advertisement();

        let reply = job.handle_request(mac(1), 0, 180, 10, 64).unwrap();
        assert_eq!(reply.offset, 0);
        assert_eq!(reply.length, 180);
        assert!(!reply.last_chunk);

        let reply = job.handle_request(mac(1), 4020, 180, 20, 64).unwrap();
        assert_eq!(reply.length, 76);
        assert!(reply.last_chunk);
    }

    #[test]
    fn job_completes_when_all_participants_terminal_and_frees_buffer() {
        let firmware = vec![0x22u8; 16];
        let mut job = job_with(firmware.clone(), false);
        job.apply_downloaded(firmware).unwrap();
        job.advertisement();
        job.handle_request(mac(1), 0, 16, 0, 64);
        job.mark_completed(mac(1));
        assert!(job.maybe_finish());
        assert_eq!(job.state, JobState::Complete);
        assert!(job.firmware.is_none());
    }
}

//! Targeted-push OTA: stage the incoming image on the blob store, then
//! in a background task step a single node through begin -> data+ack ->
//! end. Runs against any `BlobStore` impl; the shipped binary wires it to
//! the file-backed store so a multi-megabyte image never sits in RAM.

use crate::codec::{OtaAckPayload, OtaBeginPayload, OtaDataPayload, OtaEndPayload};
use crate::node::NodeMac;
use thiserror::Error;

pub const DEFAULT_RETRY_BUDGET: u32 = 3;
pub const CHUNK_SIZE: u32 = 180;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushOtaError {
    #[error("chunk ack CRC error")]
    CrcError,
    #[error("chunk ack write error")]
    WriteError,
    #[error("node aborted the transfer")]
    Aborted,
    #[error("retry budget exhausted")]
    RetriesExhausted,
    #[error("ack index precedes the last acknowledged chunk")]
    OutOfOrderAck,
    #[error("chunk ack timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    Starting,
    Sending,
    Finishing,
    Complete,
    Failed,
    Aborted,
}

/// Ack status codes the node reports, per the mesh wire spec's implicit
/// `OtaAck.status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    CrcError,
    WriteError,
    Abort,
}

impl AckStatus {
    pub fn from_code(b: u8) -> AckStatus {
        match b {
            1 => AckStatus::CrcError,
            2 => AckStatus::WriteError,
            3 => AckStatus::Abort,
            _ => AckStatus::Ok,
        }
    }
}

pub struct PushOtaJob {
    pub target: NodeMac,
    pub total_size: u32,
    pub chunk_size: u32,
    pub total_chunks: u16,
    pub crc32: u32,
    pub state: PushState,
    pub next_chunk: u16,
    pub retries_used: u32,
    pub retry_budget: u32,
    pub bytes_sent: u32,
}

impl PushOtaJob {
    pub fn new(target: NodeMac, total_size: u32, crc32: u32, retry_budget: u32) -> Self {
        let total_chunks = ((total_size + CHUNK_SIZE - 1) / CHUNK_SIZE).max(1) as u16;
        PushOtaJob {
            target,
            total_size,
            chunk_size: CHUNK_SIZE,
            total_chunks,
            crc32,
            state: PushState::Idle,
            next_chunk: 0,
            retries_used: 0,
            retry_budget,
            bytes_sent: 0,
        }
    }

    pub fn begin_message(&mut self) -> OtaBeginPayload {
        self.state = PushState::Starting;
        OtaBeginPayload {
            target: self.target.0,
            total_size: self.total_size,
            chunk_size: self.chunk_size as u16,
            total_chunks: self.total_chunks,
            crc32: self.crc32,
        }
    }

    /// Builds the `OtaData` frame for the current chunk index, given the
    /// chunk bytes read from staging by the caller.
    pub fn data_message(&mut self, chunk_bytes: Vec<u8>) -> OtaDataPayload {
        self.state = PushState::Sending;
        let offset = self.next_chunk as u32 * self.chunk_size;
        let last_chunk = self.next_chunk + 1 == self.total_chunks;
        let length = chunk_bytes.len() as u16;
        OtaDataPayload {
            offset,
            length,
            last_chunk,
            data: chunk_bytes,
        }
    }

    /// Applies an incoming ack. Rejects acks whose index precedes the
    /// last acknowledged chunk (progress must be monotone in offset).
    /// On `CrcError`/`WriteError` the caller should retry the same chunk
    /// up to the retry budget, then abort.
    pub fn apply_ack(&mut self, ack: OtaAckPayload) -> Result<bool, PushOtaError> {
        if ack.chunk_index < self.next_chunk {
            return Err(PushOtaError::OutOfOrderAck);
        }
        match AckStatus::from_code(ack.status) {
            AckStatus::Ok => {
                self.bytes_sent = (self.bytes_sent + self.chunk_size).min(self.total_size);
                self.next_chunk += 1;
                self.retries_used = 0;
                Ok(self.next_chunk >= self.total_chunks)
            }
            AckStatus::CrcError => self.retry(PushOtaError::CrcError),
            AckStatus::WriteError => self.retry(PushOtaError::WriteError),
            AckStatus::Abort => {
                self.state = PushState::Aborted;
                Err(PushOtaError::Aborted)
            }
        }
    }

    /// Called when the per-chunk ack timer expires with nothing received.
    /// Consumes retry budget the same way a `CrcError`/`WriteError` ack
    /// does; `Ok(())` means the caller should resend the current chunk,
    /// `Err(RetriesExhausted)` means the job has failed outright.
    pub fn ack_timeout(&mut self) -> Result<(), PushOtaError> {
        self.retry(PushOtaError::Timeout).map(|_| ())
    }

    fn retry(&mut self, err: PushOtaError) -> Result<bool, PushOtaError> {
        self.retries_used += 1;
        if self.retries_used > self.retry_budget {
            self.state = PushState::Failed;
            return Err(PushOtaError::RetriesExhausted);
        }
        Err(err)
    }

    pub fn end_message(&mut self) -> OtaEndPayload {
        self.state = PushState::Finishing;
        OtaEndPayload {
            target: self.target.0,
            total_chunks: self.total_chunks,
            crc32: self.crc32,
        }
    }

    pub fn complete(&mut self) {
        self.state = PushState::Complete;
    }

    pub fn fail(&mut self) {
        self.state = PushState::Failed;
    }

    pub fn progress(&self) -> f32 {
        if self.total_size == 0 {
            return 1.0;
        }
        self.bytes_sent as f32 / self.total_size as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> NodeMac {
        NodeMac([0, 0, 0, 0, 0, b])
    }

    #[test]
    fn acks_must_be_monotone_in_offset() {
        let mut job = PushOtaJob::new(mac(1), 360, 0xDEADBEEF, DEFAULT_RETRY_BUDGET);
        job.begin_message();
        job.data_message(vec![0u8; 180]);
        job.apply_ack(OtaAckPayload {
            mac: mac(1).0,
            chunk_index: 0,
            status: 0,
        })
        .unwrap();
        // Chunk 0 already acked; a repeat is out of order relative to
        // next_chunk = 1.
        let err = job
            .apply_ack(OtaAckPayload {
                mac: mac(1).0,
                chunk_index: 0,
                status: 0,
            })
            .unwrap_err();
        assert_eq!(err, PushOtaError::OutOfOrderAck);
    }

    #[test]
    fn crc_error_retries_then_fails_after_budget_exhausted() {
        let mut job = PushOtaJob::new(mac(1), 180, 0, 2);
        job.begin_message();
        job.data_message(vec![0u8; 180]);
        let bad_ack = OtaAckPayload {
            mac: mac(1).0,
            chunk_index: 0,
            status: 1,
        };
        assert_eq!(job.apply_ack(bad_ack).unwrap_err(), PushOtaError::CrcError);
        assert_eq!(job.apply_ack(bad_ack).unwrap_err(), PushOtaError::CrcError);
        assert_eq!(
            job.apply_ack(bad_ack).unwrap_err(),
            PushOtaError::RetriesExhausted
        );
        assert_eq!(job.state, PushState::Failed);
    }

    #[test]
    fn abort_status_aborts_immediately_without_consuming_retry_budget() {
        let mut job = PushOtaJob::new(mac(1), 180, 0, DEFAULT_RETRY_BUDGET);
        job.begin_message();
        job.data_message(vec![0u8; 180]);
        let err = job
            .apply_ack(OtaAckPayload {
                mac: mac(1).0,
                chunk_index: 0,
                status: 3,
            })
            .unwrap_err();
        assert_eq!(err, PushOtaError::Aborted);
        assert_eq!(job.state, PushState::Aborted);
    }

    #[test]
    fn completes_after_last_chunk_acked() {
        let mut job = PushOtaJob::new(mac(1), 180, 0, DEFAULT_RETRY_BUDGET);
        job.begin_message();
        job.data_message(vec![0u8; 180]);
        let done = job
            .apply_ack(OtaAckPayload {
                mac: mac(1).0,
                chunk_index: 0,
                status: 0,
            })
            .unwrap();
        assert!(done);
        assert_eq!(job.progress(), 1.0);
    }
}

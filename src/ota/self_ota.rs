//! Self-OTA writer: streams incoming firmware bytes straight to the
//! inactive flash partition with a header sanity check, then finalizes
//! and switches the boot pointer. The caller is expected to restart
//! after `end()` succeeds.

use crate::hw::FlashPartition;
use thiserror::Error;

/// Real images begin with this magic byte; a different first byte aborts
/// immediately rather than writing garbage to flash.
pub const IMAGE_MAGIC_BYTE: u8 = 0xE9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelfOtaError {
    #[error("self-OTA already active")]
    AlreadyActive,
    #[error("expected size exceeds partition size")]
    TooLarge,
    #[error("first byte is not the firmware image magic")]
    BadMagic,
    #[error("no self-OTA in progress")]
    NotActive,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SelfOtaState {
    Idle,
    Writing,
}

pub struct SelfOtaWriter<F: FlashPartition> {
    flash: F,
    state: SelfOtaState,
    expected_size: u64,
    written: u64,
    header_checked: bool,
}

impl<F: FlashPartition> SelfOtaWriter<F> {
    pub fn new(flash: F) -> Self {
        SelfOtaWriter {
            flash,
            state: SelfOtaState::Idle,
            expected_size: 0,
            written: 0,
            header_checked: false,
        }
    }

    pub fn begin(&mut self, expected_size: u64) -> Result<(), SelfOtaError> {
        if self.state == SelfOtaState::Writing {
            return Err(SelfOtaError::AlreadyActive);
        }
        if expected_size > self.flash.partition_size() {
            return Err(SelfOtaError::TooLarge);
        }
        self.state = SelfOtaState::Writing;
        self.expected_size = expected_size;
        self.written = 0;
        self.header_checked = false;
        Ok(())
    }

    /// On the first call, inspects the first header byte for the image
    /// magic; a non-matching byte aborts the write.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), SelfOtaError> {
        if self.state != SelfOtaState::Writing {
            return Err(SelfOtaError::NotActive);
        }
        if !self.header_checked {
            self.header_checked = true;
            if bytes.first() != Some(&IMAGE_MAGIC_BYTE) {
                self.abort();
                return Err(SelfOtaError::BadMagic);
            }
        }
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Seals the partition and switches the boot pointer.
    pub fn end(&mut self) -> Result<(), SelfOtaError> {
        if self.state != SelfOtaState::Writing {
            return Err(SelfOtaError::NotActive);
        }
        self.flash
            .set_boot_partition("next")
            .map_err(|_| SelfOtaError::NotActive)?;
        self.state = SelfOtaState::Idle;
        Ok(())
    }

    /// Idempotent: aborting an already-idle writer is a no-op.
    pub fn abort(&mut self) {
        self.state = SelfOtaState::Idle;
        self.written = 0;
        self.header_checked = false;
    }

    pub fn is_active(&self) -> bool {
        self.state == SelfOtaState::Writing
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFlash {
        partition_size: u64,
    }

    impl FlashPartition for FakeFlash {
        fn set_boot_partition(&self, _slot: &str) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn partition_size(&self) -> u64 {
            self.partition_size
        }
    }

    #[test]
    fn begin_rejects_when_already_active() {
        let mut writer = SelfOtaWriter::new(FakeFlash { partition_size: 1024 });
        writer.begin(100).unwrap();
        assert_eq!(writer.begin(50).unwrap_err(), SelfOtaError::AlreadyActive);
    }

    #[test]
    fn begin_rejects_when_expected_size_exceeds_partition() {
        let mut writer = SelfOtaWriter::new(FakeFlash { partition_size: 100 });
        assert_eq!(writer.begin(200).unwrap_err(), SelfOtaError::TooLarge);
    }

    #[test]
    fn write_aborts_on_bad_magic_byte() {
        let mut writer = SelfOtaWriter::new(FakeFlash { partition_size: 1024 });
        writer.begin(4).unwrap();
        let err = writer.write(&[0x00, 0x01, 0x02, 0x03]).unwrap_err();
        assert_eq!(err, SelfOtaError::BadMagic);
        assert!(!writer.is_active());
    }

    #[test]
    fn write_accepts_matching_magic_and_end_seals_partition() {
        let mut writer = SelfOtaWriter::new(FakeFlash { partition_size: 1024 });
        writer.begin(4).unwrap();
        writer.write(&[IMAGE_MAGIC_BYTE, 0x01, 0x02, 0x03]).unwrap();
        writer.end().unwrap();
        assert!(!writer.is_active());
    }

    #[test]
    fn abort_is_idempotent() {
        let mut writer = SelfOtaWriter::new(FakeFlash { partition_size: 1024 });
        writer.abort();
        writer.abort();
        assert!(!writer.is_active());
    }
}

//! Seams for everything declared out of scope in the purpose & scope
//! section: the mesh transport, PHY drivers, NVS, flash, the monotonic
//! clock, and the status LED. Each is a narrow, object-safe trait injected
//! at construction into the top-level gateway object -- never a process-
//! wide static.

use crate::node::NodeMac;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed")]
    SendFailed,
    #[error("transport not started")]
    NotStarted,
}

/// Events the mesh transport hands to the router: received frames and
/// child connect/disconnect notifications.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    FrameReceived { from: NodeMac, bytes: Vec<u8> },
    ChildConnected(NodeMac),
    ChildDisconnected(NodeMac),
}

/// The one seam the mesh router (component 4.4) is generic over. A real
/// implementation drives actual radio hardware; tests and the host build
/// use an in-memory stand-in.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn init(&self) -> Result<(), TransportError>;
    async fn start(&self, mesh_id: &str, psk: &str) -> Result<(), TransportError>;
    async fn stop(&self) -> Result<(), TransportError>;
    async fn send(&self, mac: NodeMac, bytes: &[u8]) -> Result<(), TransportError>;
    async fn broadcast(&self, bytes: &[u8]) -> Result<usize, TransportError>;
    fn routing_table(&self) -> Vec<NodeMac>;

    /// Blocks until the next received frame or child connect/disconnect
    /// notification. Returns `None` once the transport is permanently
    /// stopped (its event source closed) so the RX pump can exit cleanly.
    async fn recv(&self) -> Option<MeshEvent>;
}

#[derive(Debug, Clone, Copy)]
pub enum PhyEvent {
    LinkUp,
    LinkDown,
    GotIp(Ipv4Addr),
    LostIp,
}

/// One instance per uplink (ethernet, wifi-sta). The supervisor subscribes
/// to the event stream; it never polls hardware state directly.
#[async_trait]
pub trait UplinkPhy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Blocks until the next link/IP transition. Returns `None` once the
    /// PHY's event source is permanently closed.
    async fn recv(&self) -> Option<PhyEvent>;
}

/// Raw byte get/set/erase by string key, plus `erase_all`. The persisted
/// config store is built on top of this for the embedded target; the host
/// build in this repo backs `ConfigStore` with a file directly instead,
/// since there is no NVS partition to model off-device.
pub trait NvsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&mut self, key: &str, value: &[u8]);
    fn erase(&mut self, key: &str);
    fn erase_all(&mut self);
}

/// The abstraction called for by the OTA staging design note: a large
/// blob that can be appended to and read back in arbitrary ranges without
/// necessarily holding it all in RAM.
#[async_trait]
pub trait BlobStore: Send + Sync {
    type Handle: Send + Sync + Clone;

    async fn begin(&self, expected_size: u64) -> Self::Handle;
    async fn append(&self, handle: &Self::Handle, bytes: &[u8]) -> Result<(), anyhow::Error>;
    async fn read_range(
        &self,
        handle: &Self::Handle,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, anyhow::Error>;
    async fn finish(&self, handle: &Self::Handle) -> Result<(), anyhow::Error>;
    async fn discard(&self, handle: &Self::Handle);
}

pub trait FlashPartition: Send + Sync {
    fn set_boot_partition(&self, slot: &str) -> Result<(), anyhow::Error>;
    fn partition_size(&self) -> u64;
}

impl<T: FlashPartition + ?Sized> FlashPartition for Arc<T> {
    fn set_boot_partition(&self, slot: &str) -> Result<(), anyhow::Error> {
        (**self).set_boot_partition(slot)
    }
    fn partition_size(&self) -> u64 {
        (**self).partition_size()
    }
}

/// Every "timeout"/"last_seen" computation is relative to this, not
/// wall-clock time, so tests can inject a fake clock.
pub trait MonotonicClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    Boot,
    Searching,
    Connected,
    Error,
    Ota,
    Scanning,
}

pub trait StatusLed: Send + Sync {
    fn set_pattern(&self, pattern: LedPattern);
}

/// No-op LED used where no physical indicator is wired up (tests, and any
/// build without a driver injected).
pub struct NullStatusLed;

impl StatusLed for NullStatusLed {
    fn set_pattern(&self, _pattern: LedPattern) {}
}

#[derive(Debug, Clone)]
pub struct WifiScanResult {
    pub ssid: String,
    pub rssi: i8,
    pub secure: bool,
}

/// Wi-Fi AP-STA control, the seam captive provisioning (4.9) needs:
/// start/stop the self-AP and scan for nearby networks while it is up.
/// Genuinely external hardware, out of scope to implement for real here.
#[async_trait]
pub trait ApRadio: Send + Sync {
    async fn start_ap(&self, ssid: &str, psk: &str, ip: Ipv4Addr) -> Result<(), TransportError>;
    async fn stop_ap(&self) -> Result<(), TransportError>;
    async fn scan(&self) -> Result<Vec<WifiScanResult>, TransportError>;
}

/// Schedules a process/device restart after a short grace delay, long
/// enough for an in-flight HTTP response to reach the caller.
pub trait RestartControl: Send + Sync {
    fn schedule_restart(&self, delay_ms: u64);
}

/// Host-build stand-in: sleeps on a detached task, then exits the
/// process. A real embedded target resets the MCU instead.
pub struct ProcessRestart;

impl RestartControl for ProcessRestart {
    fn schedule_restart(&self, delay_ms: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            std::process::exit(0);
        });
    }
}

/// Host-build stand-in for the mesh radio: never delivers a frame and
/// never accepts a routing-table entry. Exercises every code path above
/// the transport boundary without pretending to drive real hardware.
pub struct NullMeshTransport;

#[async_trait]
impl MeshTransport for NullMeshTransport {
    async fn init(&self) -> Result<(), TransportError> {
        Ok(())
    }
    async fn start(&self, _mesh_id: &str, _psk: &str) -> Result<(), TransportError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }
    async fn send(&self, _mac: NodeMac, _bytes: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::NotStarted)
    }
    async fn broadcast(&self, _bytes: &[u8]) -> Result<usize, TransportError> {
        Ok(0)
    }
    fn routing_table(&self) -> Vec<NodeMac> {
        Vec::new()
    }
    async fn recv(&self) -> Option<MeshEvent> {
        std::future::pending().await
    }
}

/// Host-build stand-in for an uplink PHY with no real link hardware
/// behind it: never reports a transition.
pub struct NullUplinkPhy(pub &'static str);

#[async_trait]
impl UplinkPhy for NullUplinkPhy {
    fn name(&self) -> &'static str {
        self.0
    }
    async fn recv(&self) -> Option<PhyEvent> {
        std::future::pending().await
    }
}

/// Host-build stand-in for the AP-STA radio: the self-AP and WiFi scan
/// are genuinely out of scope hardware on a host build, so this reports
/// an always-empty scan and succeeds on start/stop without touching any
/// real interface.
pub struct NullApRadio;

#[async_trait]
impl ApRadio for NullApRadio {
    async fn start_ap(&self, _ssid: &str, _psk: &str, _ip: Ipv4Addr) -> Result<(), TransportError> {
        Ok(())
    }
    async fn stop_ap(&self) -> Result<(), TransportError> {
        Ok(())
    }
    async fn scan(&self) -> Result<Vec<WifiScanResult>, TransportError> {
        Ok(Vec::new())
    }
}

/// Host-build stand-in for the inactive flash partition: the "next
/// partition" is a plain file and "boot partition" selection is just the
/// file's content, fine for exercising the self-OTA writer without real
/// flash hardware.
pub struct FileFlashPartition {
    marker_path: std::path::PathBuf,
    size: u64,
}

impl FileFlashPartition {
    pub fn new(marker_path: std::path::PathBuf, size: u64) -> Self {
        FileFlashPartition { marker_path, size }
    }
}

impl FlashPartition for FileFlashPartition {
    fn set_boot_partition(&self, slot: &str) -> Result<(), anyhow::Error> {
        std::fs::write(&self.marker_path, slot)?;
        Ok(())
    }

    fn partition_size(&self) -> u64 {
        self.size
    }
}

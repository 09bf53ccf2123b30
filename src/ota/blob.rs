//! "Large blob store" abstraction called for by the OTA staging design
//! note: `begin/append/read_range/finish/discard`, with a RAM backend
//! (used by broadcast-pull, which must service arbitrary random-access
//! requests from many nodes) and a filesystem backend (used by
//! targeted-push, which streams straight to the inactive flash
//! partition's stand-in on a host build).

use crate::hw::BlobStore;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct RamHandle(Arc<Mutex<Vec<u8>>>);

#[derive(Default)]
pub struct RamBlobStore;

#[async_trait]
impl BlobStore for RamBlobStore {
    type Handle = RamHandle;

    async fn begin(&self, expected_size: u64) -> Self::Handle {
        RamHandle(Arc::new(Mutex::new(Vec::with_capacity(expected_size as usize))))
    }

    async fn append(&self, handle: &Self::Handle, bytes: &[u8]) -> Result<(), anyhow::Error> {
        handle.0.lock().await.extend_from_slice(bytes);
        Ok(())
    }

    async fn read_range(
        &self,
        handle: &Self::Handle,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, anyhow::Error> {
        let buf = handle.0.lock().await;
        let offset = offset as usize;
        let end = (offset + len).min(buf.len());
        if offset > buf.len() {
            anyhow::bail!("read_range offset past end of blob");
        }
        Ok(buf[offset..end].to_vec())
    }

    async fn finish(&self, _handle: &Self::Handle) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn discard(&self, handle: &Self::Handle) {
        handle.0.lock().await.clear();
    }
}

impl RamHandle {
    pub async fn len(&self) -> usize {
        self.0.lock().await.len()
    }
}

#[derive(Clone)]
pub struct FileHandle {
    path: PathBuf,
}

/// Streams straight to a file rather than holding the image in RAM --
/// the host-build stand-in for the inactive flash partition.
pub struct FileBlobStore {
    staging_dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(staging_dir: PathBuf) -> Self {
        FileBlobStore { staging_dir }
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    type Handle = FileHandle;

    async fn begin(&self, _expected_size: u64) -> Self::Handle {
        tokio::fs::create_dir_all(&self.staging_dir).await.ok();
        let path = self
            .staging_dir
            .join(format!("ota-staging-{}.bin", uuid_like()));
        tokio::fs::File::create(&path).await.ok();
        FileHandle { path }
    }

    async fn append(&self, handle: &Self::Handle, bytes: &[u8]) -> Result<(), anyhow::Error> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&handle.path)
            .await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn read_range(
        &self,
        handle: &Self::Handle,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, anyhow::Error> {
        let mut file = tokio::fs::File::open(&handle.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn finish(&self, _handle: &Self::Handle) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn discard(&self, handle: &Self::Handle) {
        tokio::fs::remove_file(&handle.path).await.ok();
    }
}

/// A process-unique, non-cryptographic identifier for staging file names.
/// Not a real UUID implementation -- no extra dependency is justified for
/// a filename suffix.
fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", std::process::id(), n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ram_store_round_trips_and_clamps_read_range() {
        let store = RamBlobStore::default();
        let handle = store.begin(10).await;
        store.append(&handle, b"hello").await.unwrap();
        store.append(&handle, b"world").await.unwrap();
        let all = store.read_range(&handle, 0, 100).await.unwrap();
        assert_eq!(all, b"helloworld");
        let slice = store.read_range(&handle, 5, 3).await.unwrap();
        assert_eq!(slice, b"wor");
    }

    #[tokio::test]
    async fn file_store_persists_appended_bytes() {
        let dir = std::env::temp_dir().join(format!("omni-gateway-blob-test-{}", std::process::id()));
        let store = FileBlobStore::new(dir.clone());
        let handle = store.begin(5).await;
        store.append(&handle, b"abcde").await.unwrap();
        let readback = store.read_range(&handle, 0, 5).await.unwrap();
        assert_eq!(readback, b"abcde");
        store.discard(&handle).await;
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}

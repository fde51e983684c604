//! Volume-scoped entry point of the client.

use crate::cluster::{
    DataNodeConnector, DataNodePool, HttpMetadataClient, HttpVolumeManagerClient, MemoryCluster,
    MetadataService, VolumeManager,
};
use crate::config::ClientConfig;
use crate::file::{CFile, WriteContext};
use crate::flush::FlushTracker;
use crate::replica::ReplicaReader;
use crate::types::{ChunkDescriptor, InodeInfo, OpenFlags, OpenMode, VolumeId, VolumeInfo};
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// The collaborators a client talks to.
#[derive(Clone)]
pub struct Backends {
    pub metadata: Arc<dyn MetadataService>,
    pub volumes: Arc<dyn VolumeManager>,
    pub connector: Arc<dyn DataNodeConnector>,
}

impl Backends {
    /// HTTP clients for the addresses in `config`, sharing one connection
    /// pool.
    pub fn http(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let pool = DataNodePool::with_connect_timeout(Duration::from_millis(
            config.connect_timeout_ms,
        ))?;
        let client = pool.client().clone();

        Ok(Self {
            metadata: Arc::new(HttpMetadataClient::new(client.clone(), &config.metadata_addr)),
            volumes: Arc::new(HttpVolumeManagerClient::new(
                client,
                &config.volume_manager_addr,
            )),
            connector: Arc::new(pool),
        })
    }

    pub fn memory(cluster: Arc<MemoryCluster>) -> Self {
        Self {
            metadata: cluster.clone(),
            volumes: cluster.clone(),
            connector: cluster,
        }
    }

    /// Register a volume with the volume manager, then give it an empty
    /// namespace on the metadata service.
    pub async fn create_volume(&self, name: &str, space_quota_gb: u32) -> Result<VolumeId> {
        let volume_id = self.volumes.create_volume(name, space_quota_gb).await?;
        self.metadata.create_namespace(&volume_id).await?;
        tracing::info!("Created volume {} ({}, {} GB)", volume_id, name, space_quota_gb);
        Ok(volume_id)
    }

    pub async fn volume_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        self.volumes.volume_info(volume_id).await
    }
}

/// A mounted volume.
///
/// Every write handle opened here reports its queued chunks to one shared
/// [`FlushTracker`], so [`Cfs::wait_flushes`] can hold the process until all
/// background flushes are done.
pub struct Cfs {
    volume_id: VolumeId,
    backends: Backends,
    tracker: Arc<FlushTracker>,
    config: ClientConfig,
}

impl Cfs {
    pub fn new(volume_id: impl Into<VolumeId>, backends: Backends, config: ClientConfig) -> Self {
        Self {
            volume_id: volume_id.into(),
            backends,
            tracker: Arc::new(FlushTracker::new()),
            config,
        }
    }

    pub fn connect(config: ClientConfig, volume_id: impl Into<VolumeId>) -> Result<Self> {
        let backends = Backends::http(&config)?;
        Ok(Self::new(volume_id, backends, config))
    }

    /// Share a flush tracker with other `Cfs` instances.
    pub fn with_tracker(mut self, tracker: Arc<FlushTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn tracker(&self) -> &Arc<FlushTracker> {
        &self.tracker
    }

    pub async fn create_dir(&self, path: &str) -> Result<()> {
        self.backends.metadata.create_dir(path, &self.volume_id).await
    }

    pub async fn stat(&self, path: &str) -> Result<InodeInfo> {
        self.backends.metadata.stat(path, &self.volume_id).await
    }

    pub async fn list(&self, path: &str) -> Result<Vec<InodeInfo>> {
        self.backends.metadata.list(path, &self.volume_id).await
    }

    pub async fn delete_dir(&self, path: &str) -> Result<()> {
        self.backends.metadata.delete_dir(path, &self.volume_id).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.backends.metadata.rename(from, to, &self.volume_id).await
    }

    pub async fn create_file(&self, path: &str) -> Result<()> {
        self.backends.metadata.create_file(path, &self.volume_id).await
    }

    pub async fn allocate_chunk(&self, path: &str) -> Result<ChunkDescriptor> {
        self.backends.metadata.allocate_chunk(path, &self.volume_id).await
    }

    pub async fn get_file_chunks(&self, path: &str) -> Result<Vec<ChunkDescriptor>> {
        self.backends
            .metadata
            .get_file_chunks(path, &self.volume_id)
            .await
    }

    /// Drop every replica of every chunk of `path`, then the file itself.
    /// Replica deletions are best effort; only the metadata call decides
    /// the outcome.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let chunks = self.get_file_chunks(path).await?;

        for chunk in &chunks {
            for block in &chunk.blocks {
                let result = match self.backends.connector.connect(block).await {
                    Ok(node) => node.delete_chunk(chunk.chunk_id, block.block_id).await,
                    Err(error) => Err(error),
                };

                if let Err(error) = result {
                    tracing::warn!(
                        "Failed to delete replica. path={} chunk={} block={} addr={} error={}",
                        path,
                        chunk.chunk_id,
                        block.block_id,
                        block.address(),
                        error
                    );
                }
            }
        }

        self.backends
            .metadata
            .delete_file(path, &self.volume_id)
            .await
    }

    /// Open `path` according to `flags`:
    /// - read-only: serve the chunks committed right now;
    /// - append without create: keep filling the last chunk;
    /// - anything else: replace the file with an empty one.
    pub async fn open_file(&self, path: &str, flags: OpenFlags) -> Result<CFile> {
        let mode = flags.mode();
        tracing::debug!("Opening {} with flags {:#o} as {:?}", path, flags.0, mode);

        match mode {
            OpenMode::Read => {
                let chunks = self.get_file_chunks(path).await?;
                Ok(CFile::open_read(
                    path,
                    self.volume_id.clone(),
                    flags,
                    chunks,
                    ReplicaReader::new(self.backends.connector.clone()),
                ))
            }
            OpenMode::Append => {
                let chunks = self.get_file_chunks(path).await?;
                let size: u64 = chunks.iter().map(|chunk| chunk.chunk_size).sum();
                let tail = chunks.last().cloned();
                Ok(self.open_writer(path, flags, size, tail))
            }
            OpenMode::CreateTruncate => {
                if let Err(error) = self.delete_file(path).await {
                    tracing::debug!("No previous {} to replace: {}", path, error);
                }
                self.create_file(path).await?;
                Ok(self.open_writer(path, flags, 0, None))
            }
        }
    }

    fn open_writer(
        &self,
        path: &str,
        flags: OpenFlags,
        size: u64,
        tail: Option<ChunkDescriptor>,
    ) -> CFile {
        CFile::open_write(
            path,
            self.volume_id.clone(),
            flags,
            size,
            tail,
            WriteContext {
                metadata: self.backends.metadata.clone(),
                connector: self.backends.connector.clone(),
                tracker: self.tracker.clone(),
                chunk_capacity: self.config.chunk_capacity,
                queue_depth: self.config.flush_queue_depth,
                transfer_unit: self.config.transfer_unit,
            },
        )
    }

    /// Wait until every chunk queued by any handle of this `Cfs` is
    /// committed or given up on.
    pub async fn wait_flushes(&self) {
        self.tracker.wait_idle().await;
        let failed = self.tracker.failed();
        if failed > 0 {
            tracing::warn!("{} chunk flushes of volume {} failed", failed, self.volume_id);
        }
    }

    pub async fn create_volume(&self, name: &str, space_quota_gb: u32) -> Result<VolumeId> {
        self.backends.create_volume(name, space_quota_gb).await
    }

    pub async fn volume_info(&self) -> Result<VolumeInfo> {
        self.backends.volume_info(&self.volume_id).await
    }

    /// Copy a local file into the volume, `buffer_size` bytes per write.
    pub async fn put_local(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        buffer_size: usize,
    ) -> Result<u64> {
        let mut source = tokio::fs::File::open(local.as_ref()).await?;
        let file = self.open_file(remote, OpenFlags::create_truncate()).await?;

        let mut buffer = vec![0u8; buffer_size.max(1)];
        let mut copied = 0u64;
        loop {
            let n = source.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            file.write(&buffer[..n]).await?;
            copied += n as u64;
        }

        file.close().await?;
        tracing::info!(
            "Copied {} bytes from {} to {}",
            copied,
            local.as_ref().display(),
            remote
        );
        Ok(copied)
    }

    /// Copy a file of the volume to a local path.
    pub async fn get_local(&self, remote: &str, local: impl AsRef<Path>) -> Result<u64> {
        let mut file = self.open_file(remote, OpenFlags::read_only()).await?;
        let copied = file.read_to_file(local.as_ref(), 0, 0).await?;
        tracing::info!(
            "Copied {} bytes from {} to {}",
            copied,
            remote,
            local.as_ref().display()
        );
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CfsError;
    use crate::error::Status;

    async fn mounted() -> (Arc<MemoryCluster>, Cfs) {
        let cluster = MemoryCluster::new(3, 2);
        let backends = Backends::memory(cluster.clone());
        let volume_id = backends.create_volume("test", 10).await.unwrap();
        let config = ClientConfig {
            chunk_capacity: 4096,
            transfer_unit: 1024,
            ..ClientConfig::default()
        };
        (cluster, Cfs::new(volume_id, backends, config))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 17 % 253) as u8).collect()
    }

    #[tokio::test]
    async fn test_create_volume_creates_namespace() {
        let (_cluster, cfs) = mounted().await;

        let info = cfs.volume_info().await.unwrap();
        assert_eq!(info.name, "test");
        assert_eq!(info.space_quota_gb, 10);
        assert!(cfs.stat("/").await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_namespace_statuses_pass_through() {
        let (_cluster, cfs) = mounted().await;

        cfs.create_dir("/a").await.unwrap();
        let error = cfs.create_dir("/a").await.unwrap_err();
        assert_eq!(error.code(), 17);

        let error = cfs.create_dir("/missing/b").await.unwrap_err();
        assert!(matches!(
            error,
            CfsError::Status {
                status: Status::NotFound,
                ..
            }
        ));

        cfs.create_file("/a/f").await.unwrap();
        assert_eq!(cfs.delete_dir("/a").await.unwrap_err().code(), 1);

        cfs.rename("/a", "/b").await.unwrap();
        let names: Vec<String> = cfs
            .list("/b")
            .await
            .unwrap()
            .into_iter()
            .map(|inode| inode.name)
            .collect();
        assert_eq!(names, vec!["f".to_string()]);
    }

    #[tokio::test]
    async fn test_write_then_read_through_open_file() {
        let (_cluster, cfs) = mounted().await;
        let data = payload(10_000);

        let writer = cfs.open_file("/f", OpenFlags::create_truncate()).await.unwrap();
        writer.write(&data).await.unwrap();
        writer.close().await.unwrap();

        let mut reader = cfs.open_file("/f", OpenFlags::read_only()).await.unwrap();
        assert_eq!(reader.file_size(), 10_000);
        let mut out = Vec::new();
        reader.read_to(&mut out, 0, 0).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(cfs.stat("/f").await.unwrap().size, 10_000);
    }

    #[tokio::test]
    async fn test_create_truncate_replaces_existing_file() {
        let (cluster, cfs) = mounted().await;

        let writer = cfs.open_file("/f", OpenFlags::create_truncate()).await.unwrap();
        writer.write(&payload(5000)).await.unwrap();
        writer.close().await.unwrap();
        let old_blocks: usize = cluster.nodes().iter().map(|node| node.block_count()).sum();
        assert_eq!(old_blocks, 4);

        let writer = cfs
            .open_file("/f", OpenFlags(OpenFlags::RDWR))
            .await
            .unwrap();
        assert!(!writer.is_read_only());
        writer.write(b"new").await.unwrap();
        writer.close().await.unwrap();

        let mut out = Vec::new();
        let mut reader = cfs.open_file("/f", OpenFlags::read_only()).await.unwrap();
        reader.read_to(&mut out, 0, 0).await.unwrap();
        assert_eq!(out, b"new");
        let blocks: usize = cluster.nodes().iter().map(|node| node.block_count()).sum();
        assert_eq!(blocks, 2);
    }

    #[tokio::test]
    async fn test_append_continues_last_chunk() {
        let (cluster, cfs) = mounted().await;
        let first = payload(3000);
        let second = payload(2000);

        let writer = cfs.open_file("/f", OpenFlags::create_truncate()).await.unwrap();
        writer.write(&first).await.unwrap();
        writer.close().await.unwrap();

        let appender = cfs.open_file("/f", OpenFlags::append()).await.unwrap();
        assert_eq!(appender.file_size(), 3000);
        appender.write(&second).await.unwrap();
        appender.close().await.unwrap();

        let sizes: Vec<u64> = cfs
            .get_file_chunks("/f")
            .await
            .unwrap()
            .iter()
            .map(|chunk| chunk.chunk_size)
            .collect();
        assert_eq!(sizes, vec![4096, 904]);
        assert_eq!(cluster.allocations(), 2);

        let mut out = Vec::new();
        let mut reader = cfs.open_file("/f", OpenFlags::read_only()).await.unwrap();
        reader.read_to(&mut out, 0, 0).await.unwrap();
        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_append_to_empty_file_allocates() {
        let (_cluster, cfs) = mounted().await;
        cfs.create_file("/empty").await.unwrap();

        let appender = cfs.open_file("/empty", OpenFlags::append()).await.unwrap();
        appender.write(b"abc").await.unwrap();
        appender.close().await.unwrap();

        assert_eq!(cfs.stat("/empty").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_open_missing_file_for_read_fails() {
        let (_cluster, cfs) = mounted().await;
        let error = cfs
            .open_file("/nope", OpenFlags::read_only())
            .await
            .err()
            .unwrap();
        assert_eq!(error.code(), 2);
    }

    #[tokio::test]
    async fn test_delete_file_removes_replicas_even_when_one_node_is_down() {
        let (cluster, cfs) = mounted().await;
        let writer = cfs.open_file("/f", OpenFlags::create_truncate()).await.unwrap();
        writer.write(&payload(100)).await.unwrap();
        writer.close().await.unwrap();

        let chunk = cfs.get_file_chunks("/f").await.unwrap()[0].clone();
        let down = cluster.node_by_address(&chunk.blocks[0].address()).unwrap().clone();
        let up = cluster.node_by_address(&chunk.blocks[1].address()).unwrap().clone();
        down.set_unreachable(true);

        cfs.delete_file("/f").await.unwrap();

        assert!(up.block(chunk.chunk_id, chunk.blocks[1].block_id).is_none());
        assert!(down.block(chunk.chunk_id, chunk.blocks[0].block_id).is_some());
        assert_eq!(cfs.stat("/f").await.unwrap_err().code(), 2);
    }

    #[tokio::test]
    async fn test_wait_flushes_covers_every_handle() {
        let (cluster, cfs) = mounted().await;
        for node in cluster.nodes() {
            node.pause_writes();
        }

        let first = cfs.open_file("/a", OpenFlags::create_truncate()).await.unwrap();
        let second = cfs.open_file("/b", OpenFlags::create_truncate()).await.unwrap();
        first.write(&payload(4096)).await.unwrap();
        second.write(&payload(4096)).await.unwrap();
        assert_eq!(cfs.tracker().pending(), 2);

        let cfs = Arc::new(cfs);
        let waiting = {
            let cfs = cfs.clone();
            tokio::spawn(async move { cfs.wait_flushes().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        for node in cluster.nodes() {
            node.resume_writes();
        }
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.syncs(), 2);
        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_and_get_local() {
        let (_cluster, cfs) = mounted().await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.bin");
        let target = dir.path().join("out.bin");
        let data = payload(9_999);
        tokio::fs::write(&source, &data).await.unwrap();

        assert_eq!(cfs.put_local(&source, "/copy", 1000).await.unwrap(), 9_999);
        assert_eq!(cfs.get_local("/copy", &target).await.unwrap(), 9_999);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
    }
}

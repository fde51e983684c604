//! Collaborators of the client: the metadata service, the volume manager and
//! the data nodes holding chunk replicas.
//!
//! Each is an async trait so the file handle can run against the HTTP
//! clients in [`http`] or the in-process cluster in [`memory`].

pub mod http;
pub mod memory;
pub mod pool;

use crate::types::{BlockLocation, ChunkDescriptor, InodeInfo, VolumeId, VolumeInfo};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::sync::Arc;

pub use http::{HttpDataNode, HttpMetadataClient, HttpVolumeManagerClient};
pub use memory::MemoryCluster;
pub use pool::DataNodePool;

/// Stream of byte buffers coming from or going to a data node.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Path namespace and chunk bookkeeping, scoped by volume.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn create_namespace(&self, volume_id: &str) -> Result<()>;

    async fn create_dir(&self, path: &str, volume_id: &str) -> Result<()>;

    async fn stat(&self, path: &str, volume_id: &str) -> Result<InodeInfo>;

    async fn list(&self, path: &str, volume_id: &str) -> Result<Vec<InodeInfo>>;

    async fn delete_dir(&self, path: &str, volume_id: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str, volume_id: &str) -> Result<()>;

    async fn create_file(&self, path: &str, volume_id: &str) -> Result<()>;

    async fn delete_file(&self, path: &str, volume_id: &str) -> Result<()>;

    /// Append a fresh, empty chunk to the file and return its replica group.
    async fn allocate_chunk(&self, path: &str, volume_id: &str) -> Result<ChunkDescriptor>;

    async fn get_file_chunks(&self, path: &str, volume_id: &str) -> Result<Vec<ChunkDescriptor>>;

    /// Persist the committed size of a chunk previously allocated to `path`.
    async fn sync_chunk(&self, path: &str, volume_id: &str, chunk: &ChunkDescriptor)
    -> Result<()>;
}

#[async_trait]
pub trait VolumeManager: Send + Sync {
    async fn create_volume(&self, name: &str, space_quota_gb: u32) -> Result<VolumeId>;

    async fn volume_info(&self, volume_id: &str) -> Result<VolumeInfo>;
}

/// One data node. Every call names the chunk and the block scoping the
/// replica on that node.
#[async_trait]
pub trait DataNode: Send + Sync {
    async fn read_chunk(&self, chunk_id: u64, block_id: u64, offset: u64, len: u64)
    -> Result<Bytes>;

    async fn stream_read_chunk(
        &self,
        chunk_id: u64,
        block_id: u64,
        offset: u64,
        len: u64,
    ) -> Result<ByteStream>;

    /// Append the pieces of `data`, in arrival order, to the replica's content.
    async fn write_chunk_stream(&self, chunk_id: u64, block_id: u64, data: ByteStream)
    -> Result<()>;

    async fn delete_chunk(&self, chunk_id: u64, block_id: u64) -> Result<()>;
}

/// Hands out a data node client for a replica's address.
#[async_trait]
pub trait DataNodeConnector: Send + Sync {
    async fn connect(&self, block: &BlockLocation) -> Result<Arc<dyn DataNode>>;
}

use crate::cluster::{DataNode, DataNodeConnector};
use crate::types::ChunkDescriptor;
use crate::{CfsError, Result};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// One server-streamed request, buffers joined in arrival order.
    Stream,
    /// One request, one reply.
    Single,
}

/// Reads a byte range of one chunk from the first replica that answers.
#[derive(Clone)]
pub struct ReplicaReader {
    connector: Arc<dyn DataNodeConnector>,
}

impl ReplicaReader {
    pub fn new(connector: Arc<dyn DataNodeConnector>) -> Self {
        Self { connector }
    }

    /// Streaming read of `len` bytes at `offset` inside `chunk`.
    pub async fn read_range(&self, chunk: &ChunkDescriptor, offset: u64, len: u64) -> Result<Bytes> {
        self.read_with(ReadMode::Stream, chunk, offset, len).await
    }

    /// Single request/response read of `len` bytes at `offset` inside `chunk`.
    pub async fn read_once(&self, chunk: &ChunkDescriptor, offset: u64, len: u64) -> Result<Bytes> {
        self.read_with(ReadMode::Single, chunk, offset, len).await
    }

    async fn read_with(
        &self,
        mode: ReadMode,
        chunk: &ChunkDescriptor,
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        let mut attempts = 0;

        for block in &chunk.blocks {
            attempts += 1;

            let result = match self.connector.connect(block).await {
                Ok(node) => match mode {
                    ReadMode::Stream => {
                        stream_from(node.as_ref(), chunk.chunk_id, block.block_id, offset, len)
                            .await
                    }
                    ReadMode::Single => {
                        node.read_chunk(chunk.chunk_id, block.block_id, offset, len)
                            .await
                    }
                },
                Err(error) => Err(error),
            };

            match result {
                Ok(bytes) if bytes.len() as u64 == len => {
                    tracing::debug!(
                        "Read chunk {} from {} (offset={} len={} mode={:?})",
                        chunk.chunk_id,
                        block.address(),
                        offset,
                        len,
                        mode
                    );
                    return Ok(bytes);
                }
                Ok(bytes) => {
                    return Err(CfsError::Protocol(format!(
                        "short reply from {} for chunk {}: expected {} bytes, got {}",
                        block.address(),
                        chunk.chunk_id,
                        len,
                        bytes.len()
                    )));
                }
                Err(error) if error.is_transport() => {
                    tracing::warn!(
                        "Replica read failed, trying next replica. chunk={} block={} addr={} error={}",
                        chunk.chunk_id,
                        block.block_id,
                        block.address(),
                        error
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Err(CfsError::ReplicasExhausted {
            chunk_id: chunk.chunk_id,
            offset,
            len,
            attempts,
        })
    }
}

async fn stream_from(
    node: &dyn DataNode,
    chunk_id: u64,
    block_id: u64,
    offset: u64,
    len: u64,
) -> Result<Bytes> {
    let mut stream = node
        .stream_read_chunk(chunk_id, block_id, offset, len)
        .await?;

    let mut buffer = BytesMut::with_capacity(len as usize);
    while let Some(piece) = stream.next().await {
        buffer.extend_from_slice(&piece?);
    }

    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCluster, MetadataService};

    async fn seeded(data: &[u8]) -> (Arc<MemoryCluster>, ChunkDescriptor) {
        let cluster = MemoryCluster::new(3, 3);
        cluster.create_namespace("vol").await.unwrap();
        let chunks = cluster
            .seed_file("/f", "vol", &[data.len() as u64], data)
            .unwrap();
        (cluster, chunks[0].clone())
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_stream_read_joins_pieces() {
        let data = payload(200 * 1024);
        let (cluster, chunk) = seeded(&data).await;
        let reader = ReplicaReader::new(cluster.clone());

        let bytes = reader.read_range(&chunk, 1000, 150 * 1024).await.unwrap();
        assert_eq!(&bytes[..], &data[1000..1000 + 150 * 1024]);
    }

    #[tokio::test]
    async fn test_falls_back_to_second_replica() {
        let data = payload(4096);
        let (cluster, chunk) = seeded(&data).await;
        let first = cluster.node_by_address(&chunk.blocks[0].address()).unwrap().clone();
        let second = cluster.node_by_address(&chunk.blocks[1].address()).unwrap().clone();
        first.set_unreachable(true);

        let reader = ReplicaReader::new(cluster.clone());
        let streamed = reader.read_range(&chunk, 0, 4096).await.unwrap();
        let single = reader.read_once(&chunk, 10, 100).await.unwrap();

        assert_eq!(&streamed[..], &data[..]);
        assert_eq!(&single[..], &data[10..110]);
        assert_eq!(first.reads(), 0);
        assert_eq!(second.reads(), 2);
    }

    #[tokio::test]
    async fn test_protocol_error_does_not_fall_back() {
        let data = payload(1024);
        let (cluster, chunk) = seeded(&data).await;
        let first = cluster.node_by_address(&chunk.blocks[0].address()).unwrap().clone();
        let second = cluster.node_by_address(&chunk.blocks[1].address()).unwrap().clone();
        first.set_corrupt(true);

        let reader = ReplicaReader::new(cluster.clone());
        let error = reader.read_once(&chunk, 0, 1024).await.unwrap_err();

        assert!(matches!(error, CfsError::Protocol(_)));
        assert_eq!(second.reads(), 0);
    }

    #[tokio::test]
    async fn test_all_replicas_down_is_exhausted() {
        let data = payload(64);
        let (cluster, chunk) = seeded(&data).await;
        for node in cluster.nodes() {
            node.set_unreachable(true);
        }

        let reader = ReplicaReader::new(cluster.clone());
        let error = reader.read_range(&chunk, 0, 64).await.unwrap_err();
        assert!(matches!(
            error,
            CfsError::ReplicasExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_short_reply_is_protocol_error() {
        let data = payload(64);
        let (cluster, chunk) = seeded(&data).await;
        let reader = ReplicaReader::new(cluster.clone());

        let error = reader.read_once(&chunk, 32, 64).await.unwrap_err();
        assert!(matches!(error, CfsError::Protocol(_)));
    }
}

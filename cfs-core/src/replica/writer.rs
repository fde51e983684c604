use crate::cluster::{DataNodeConnector, MetadataService};
use crate::flush::FlushScope;
use crate::types::ChunkDescriptor;
use crate::{CfsError, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A filled chunk waiting to be written to its replicas.
#[derive(Debug, Clone)]
pub struct FlushJob {
    /// Descriptor carrying the final committed size.
    pub chunk: ChunkDescriptor,
    pub data: Bytes,
}

/// Flush worker of one write handle.
///
/// Jobs are handled strictly in queue order: the buffer goes to every
/// replica, then the chunk size is committed to the metadata service.
pub struct ReplicaWriter {
    path: String,
    volume_id: String,
    metadata: Arc<dyn MetadataService>,
    connector: Arc<dyn DataNodeConnector>,
    flushes: FlushScope,
    transfer_unit: usize,
}

impl ReplicaWriter {
    pub fn new(
        path: impl Into<String>,
        volume_id: impl Into<String>,
        metadata: Arc<dyn MetadataService>,
        connector: Arc<dyn DataNodeConnector>,
        flushes: FlushScope,
        transfer_unit: usize,
    ) -> Self {
        Self {
            path: path.into(),
            volume_id: volume_id.into(),
            metadata,
            connector,
            flushes,
            transfer_unit: transfer_unit.max(1),
        }
    }

    pub fn spawn(self, receiver: mpsc::Receiver<FlushJob>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(receiver))
    }

    /// Consume jobs until every sender is gone. A failed commit stops the
    /// worker; the failed job and everything still queued are released from
    /// the tracker as abandoned.
    pub async fn run(self, mut receiver: mpsc::Receiver<FlushJob>) -> Result<()> {
        while let Some(job) = receiver.recv().await {
            self.write_replicas(&job).await;

            if let Err(error) = self
                .metadata
                .sync_chunk(&self.path, &self.volume_id, &job.chunk)
                .await
            {
                tracing::error!(
                    "Chunk commit failed, stopping flush worker. path={} chunk={} size={} error={}",
                    self.path,
                    job.chunk.chunk_id,
                    job.chunk.chunk_size,
                    error
                );

                // Chunks that will never commit are released as failed;
                // left pending they would hang every wait on the trackers.
                receiver.close();
                let mut abandoned = 1;
                while receiver.recv().await.is_some() {
                    abandoned += 1;
                }
                self.flushes.abandoned(abandoned);

                return Err(CfsError::FlushFailed {
                    path: self.path.clone(),
                    chunk_id: job.chunk.chunk_id,
                    source: Box::new(error),
                });
            }

            tracing::debug!(
                "Committed chunk {} of {} ({} bytes)",
                job.chunk.chunk_id,
                self.path,
                job.chunk.chunk_size
            );
            self.flushes.committed();
        }

        Ok(())
    }

    // Replica failures are logged and skipped, never retried: the commit
    // below still records the chunk.
    async fn write_replicas(&self, job: &FlushJob) {
        for block in &job.chunk.blocks {
            let result = match self.connector.connect(block).await {
                Ok(node) => {
                    node.write_chunk_stream(job.chunk.chunk_id, block.block_id, self.pieces(&job.data))
                        .await
                }
                Err(error) => Err(error),
            };

            if let Err(error) = result {
                tracing::warn!(
                    "Replica write failed. path={} chunk={} block={} addr={} error={}",
                    self.path,
                    job.chunk.chunk_id,
                    block.block_id,
                    block.address(),
                    error
                );
            }
        }
    }

    fn pieces(&self, data: &Bytes) -> crate::cluster::ByteStream {
        let pieces: Vec<Result<Bytes>> = (0..data.len())
            .step_by(self.transfer_unit)
            .map(|start| Ok(data.slice(start..(start + self.transfer_unit).min(data.len()))))
            .collect();
        futures_util::stream::iter(pieces).boxed()
    }
}

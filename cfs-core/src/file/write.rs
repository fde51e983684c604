use super::{ActiveChunk, CFile, HandleState, WriteInner, WriteState, not_writable};
use crate::replica::FlushJob;
use crate::{CfsError, Result};
use std::sync::atomic::Ordering;

impl CFile {
    /// Append `data` to the file.
    ///
    /// Bytes are buffered in the active chunk; every chunk that fills up is
    /// queued for flushing and a new one is allocated on the next byte. When
    /// the flush queue is full this waits for the worker to catch up.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let HandleState::Write(state) = &self.state else {
            return Err(not_writable(&self.path));
        };

        let mut inner = state.inner.lock().await;
        if inner.sender.is_none() {
            return Err(CfsError::NotAllowed(format!("{} is closed", self.path)));
        }

        let mut written = 0;
        while written < data.len() {
            if inner.active.free == 0 {
                let chunk = state
                    .metadata
                    .allocate_chunk(&self.path, &self.volume_id)
                    .await?;
                tracing::debug!(
                    "Allocated chunk {} for {} on {} replicas",
                    chunk.chunk_id,
                    self.path,
                    chunk.blocks.len()
                );
                inner.active = ActiveChunk::bind(chunk, state.capacity);
            }

            let take = (data.len() - written).min(inner.active.free as usize);
            inner
                .active
                .buffer
                .extend_from_slice(&data[written..written + take]);
            inner.active.free -= take as u64;
            written += take;
            state.size.fetch_add(take as u64, Ordering::SeqCst);

            if inner.active.free == 0 {
                self.queue_active(state, &mut inner).await?;
            }
        }

        Ok(written)
    }

    /// Queue whatever the active chunk holds, then wait until every chunk
    /// this handle queued so far is committed.
    pub async fn flush(&self) -> Result<()> {
        let HandleState::Write(state) = &self.state else {
            return Err(not_writable(&self.path));
        };

        {
            let mut inner = state.inner.lock().await;
            if inner.sender.is_none() {
                return self.join_worker(&mut inner).await;
            }
            self.queue_active(state, &mut inner).await?;
        }

        state.flushes.handle().wait_idle().await;
        if state.flushes.handle().failed() > 0 {
            let mut inner = state.inner.lock().await;
            inner.sender = None;
            return self.join_worker(&mut inner).await;
        }
        Ok(())
    }

    /// Queue the last partial chunk, stop accepting writes and wait for the
    /// flush worker to drain.
    pub async fn close(&self) -> Result<()> {
        let HandleState::Write(state) = &self.state else {
            return Ok(());
        };

        let mut inner = state.inner.lock().await;
        let queued = if inner.sender.is_some() {
            self.queue_active(state, &mut inner).await
        } else {
            Ok(())
        };

        // dropping the only sender ends the worker once the queue is empty
        inner.sender = None;
        self.join_worker(&mut inner).await?;
        queued
    }

    async fn queue_active(&self, state: &WriteState, inner: &mut WriteInner) -> Result<()> {
        if inner.active.buffer.is_empty() {
            return Ok(());
        }
        let Some(mut chunk) = inner.active.chunk.take() else {
            return Ok(());
        };

        chunk.chunk_size = inner.active.committed_size();
        let data = inner.active.buffer.split().freeze();
        inner.active = ActiveChunk::default();

        let Some(sender) = inner.sender.as_ref() else {
            return Err(CfsError::NotAllowed(format!("{} is closed", self.path)));
        };

        tracing::debug!(
            "Queueing chunk {} of {} for flush ({} bytes)",
            chunk.chunk_id,
            self.path,
            chunk.chunk_size
        );

        state.flushes.enqueued();
        if sender.send(FlushJob { chunk, data }).await.is_err() {
            // the worker stopped on a failed commit; close reports why
            state.flushes.abandoned(1);
            inner.sender = None;
            return Err(CfsError::NotAllowed(format!(
                "flush worker for {} has stopped",
                self.path
            )));
        }
        Ok(())
    }

    /// Wait for the flush worker to end and keep its error. Once the worker
    /// has failed, every call reports that failure.
    async fn join_worker(&self, inner: &mut WriteInner) -> Result<()> {
        if let Some(worker) = inner.worker.take() {
            let result = match worker.await {
                Ok(result) => result,
                Err(error) => Err(error.into()),
            };
            if let Err(error) = result {
                inner.failure = Some(error);
            }
        }

        match &inner.failure {
            Some(error) => Err(replay_failure(&self.path, error)),
            None => Ok(()),
        }
    }
}

/// Rebuild a stored worker error. Collaborator statuses are kept so the
/// numeric code survives; anything else is carried as text.
fn replay_failure(path: &str, error: &CfsError) -> CfsError {
    match error {
        CfsError::FlushFailed {
            chunk_id, source, ..
        } => CfsError::FlushFailed {
            path: path.to_string(),
            chunk_id: *chunk_id,
            source: Box::new(match &**source {
                CfsError::Status { op, status } => CfsError::status(*op, *status),
                other => CfsError::Internal(other.to_string()),
            }),
        },
        other => CfsError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::WriteContext;
    use super::*;
    use crate::cluster::{MemoryCluster, MetadataService};
    use crate::flush::FlushTracker;
    use crate::replica::ReplicaReader;
    use crate::types::{ChunkDescriptor, OpenFlags};
    use std::sync::Arc;
    use std::time::Duration;

    const CAPACITY: u64 = 1024;

    async fn cluster() -> Arc<MemoryCluster> {
        let cluster = MemoryCluster::new(3, 2);
        cluster.create_namespace("vol").await.unwrap();
        cluster.create_file("/f", "vol").await.unwrap();
        cluster
    }

    fn writer(cluster: &Arc<MemoryCluster>, tracker: &Arc<FlushTracker>) -> CFile {
        writer_with_tail(cluster, tracker, 0, None)
    }

    fn writer_with_tail(
        cluster: &Arc<MemoryCluster>,
        tracker: &Arc<FlushTracker>,
        size: u64,
        tail: Option<ChunkDescriptor>,
    ) -> CFile {
        CFile::open_write(
            "/f",
            "vol",
            OpenFlags::create_truncate(),
            size,
            tail,
            WriteContext {
                metadata: cluster.clone(),
                connector: cluster.clone(),
                tracker: tracker.clone(),
                chunk_capacity: CAPACITY,
                queue_depth: 16,
                transfer_unit: 256,
            },
        )
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn read_back(cluster: &Arc<MemoryCluster>) -> Vec<u8> {
        let chunks = cluster.get_file_chunks("/f", "vol").await.unwrap();
        let mut file = CFile::open_read(
            "/f",
            "vol",
            OpenFlags::read_only(),
            chunks,
            ReplicaReader::new(cluster.clone()),
        );
        let mut out = Vec::new();
        file.read_to(&mut out, 0, 0).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_write_allocates_one_chunk_per_capacity() {
        let cluster = cluster().await;
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        let data = payload(2 * CAPACITY as usize + 100);
        assert_eq!(file.write(&data).await.unwrap(), data.len());
        assert_eq!(cluster.allocations(), 3);
        file.close().await.unwrap();

        let sizes: Vec<u64> = cluster
            .committed_chunks("/f", "vol")
            .iter()
            .map(|chunk| chunk.chunk_size)
            .collect();
        assert_eq!(sizes, vec![CAPACITY, CAPACITY, 100]);
        assert_eq!(read_back(&cluster).await, data);
    }

    #[tokio::test]
    async fn test_small_writes_fill_chunks_before_allocating() {
        let cluster = cluster().await;
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        let data = payload(3000);
        for piece in data.chunks(100) {
            file.write(piece).await.unwrap();
        }
        assert_eq!(cluster.allocations(), 3);
        assert_eq!(file.file_size(), 3000);

        file.close().await.unwrap();
        assert_eq!(read_back(&cluster).await, data);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_exact_fill_does_not_allocate_spare_chunk() {
        let cluster = cluster().await;
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        file.write(&payload(CAPACITY as usize)).await.unwrap();
        file.close().await.unwrap();

        assert_eq!(cluster.allocations(), 1);
        assert_eq!(cluster.syncs(), 1);
    }

    #[tokio::test]
    async fn test_append_fills_tail_chunk_first() {
        let cluster = cluster().await;
        let first = payload(700);
        let tail = cluster
            .seed_file("/f", "vol", &[700], &first)
            .unwrap()
            .pop();
        let tracker = Arc::new(FlushTracker::new());
        let file = writer_with_tail(&cluster, &tracker, 700, tail);

        let more = payload(500);
        file.write(&more).await.unwrap();
        file.close().await.unwrap();

        let sizes: Vec<u64> = cluster
            .committed_chunks("/f", "vol")
            .iter()
            .map(|chunk| chunk.chunk_size)
            .collect();
        assert_eq!(sizes, vec![CAPACITY, 176]);
        assert_eq!(cluster.allocations(), 1);

        let mut expected = first;
        expected.extend_from_slice(&more);
        assert_eq!(read_back(&cluster).await, expected);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_writer_until_flushes_resume() {
        let cluster = cluster().await;
        for node in cluster.nodes() {
            node.pause_writes();
        }
        let tracker = Arc::new(FlushTracker::new());
        let file = Arc::new(writer(&cluster, &tracker));

        // one chunk in the worker and sixteen queued; the next one must wait
        let data = payload(18 * CAPACITY as usize);
        let writing = {
            let file = file.clone();
            let data = data.clone();
            tokio::spawn(async move { file.write(&data).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writing.is_finished());
        assert_eq!(cluster.syncs(), 0);

        for node in cluster.nodes() {
            node.resume_writes();
        }
        let written = tokio::time::timeout(Duration::from_secs(5), writing)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(written, data.len());

        file.close().await.unwrap();
        assert_eq!(cluster.syncs(), 18);
        assert_eq!(read_back(&cluster).await, data);
    }

    #[tokio::test]
    async fn test_close_waits_for_queued_flushes() {
        let cluster = cluster().await;
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        file.write(&payload(5 * CAPACITY as usize + 1)).await.unwrap();
        file.close().await.unwrap();

        assert_eq!(tracker.pending(), 0);
        assert_eq!(cluster.syncs(), 6);
        assert!(file.write(b"late").await.is_err());
        file.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_commits_partial_chunk() {
        let cluster = cluster().await;
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        file.write(b"hello").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(cluster.committed_chunks("/f", "vol")[0].chunk_size, 5);
        assert_eq!(tracker.pending(), 0);
        file.close().await.unwrap();
        assert_eq!(cluster.syncs(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces_on_close() {
        let cluster = cluster().await;
        cluster.set_fail_sync(true);
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        file.write(&payload(2 * CAPACITY as usize)).await.ok();
        let error = file.close().await.unwrap_err();

        assert!(matches!(error, CfsError::FlushFailed { .. }));
        assert_eq!(tracker.pending(), 0);
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_failing_until_close() {
        let cluster = cluster().await;
        cluster.set_fail_sync(true);
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        file.write(b"hello").await.unwrap();
        let first = file.flush().await.unwrap_err();
        assert!(matches!(first, CfsError::FlushFailed { .. }));
        assert_eq!(first.code(), 1);

        let again = file.flush().await.unwrap_err();
        assert!(matches!(again, CfsError::FlushFailed { .. }));
        assert_eq!(again.code(), 1);

        let closed = file.close().await.unwrap_err();
        assert!(matches!(closed, CfsError::FlushFailed { .. }));
        assert_eq!(closed.code(), 1);
        assert!(file.close().await.is_err());

        let sizes: Vec<u64> = cluster
            .committed_chunks("/f", "vol")
            .iter()
            .map(|chunk| chunk.chunk_size)
            .collect();
        assert_eq!(sizes, vec![0]);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_waits_for_paused_replicas() {
        let cluster = cluster().await;
        for node in cluster.nodes() {
            node.pause_writes();
        }
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);
        file.write(b"held").await.unwrap();

        let mut flushing = tokio_test::task::spawn(file.flush());
        tokio_test::assert_pending!(flushing.poll());
        // let the worker reach the paused data node
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio_test::assert_pending!(flushing.poll());
        assert_eq!(cluster.syncs(), 0);

        for node in cluster.nodes() {
            node.resume_writes();
        }
        tokio::time::timeout(Duration::from_secs(5), flushing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.syncs(), 1);
        file.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_allocation_failure_is_returned() {
        let cluster = cluster().await;
        cluster.delete_file("/f", "vol").await.unwrap();
        let tracker = Arc::new(FlushTracker::new());
        let file = writer(&cluster, &tracker);

        let error = file.write(b"x").await.unwrap_err();
        assert_eq!(error.code(), 2);
        file.close().await.unwrap();
    }
}

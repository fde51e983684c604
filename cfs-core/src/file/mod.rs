//! Open file handles.
//!
//! A handle is either read-only, serving byte ranges out of the chunk list
//! captured at open, or a writer that fills one chunk at a time and hands
//! full chunks to a background flush worker.

mod read;
mod write;

use crate::cluster::{DataNodeConnector, MetadataService};
use crate::flush::{FlushScope, FlushTracker};
use crate::locator::{self, ByteRange, ChunkSpan};
use crate::replica::{FlushJob, ReplicaReader, ReplicaWriter};
use crate::types::{ChunkDescriptor, OpenFlags};
use crate::{CfsError, Result};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub struct CFile {
    path: String,
    volume_id: String,
    flags: OpenFlags,
    state: HandleState,
}

enum HandleState {
    Read(ReadState),
    Write(WriteState),
}

struct ReadState {
    chunks: Vec<ChunkDescriptor>,
    size: u64,
    reader: ReplicaReader,
    cursor: u64,
    cached: Option<CachedChunk>,
}

/// Whole-chunk copy kept by `read_cached` between calls.
struct CachedChunk {
    index: usize,
    data: Bytes,
}

impl ReadState {
    fn locate(&self, range: ByteRange) -> Result<Option<ChunkSpan>> {
        let sizes: Vec<u64> = self.chunks.iter().map(|chunk| chunk.chunk_size).collect();
        locator::locate(&sizes, range.offset, range.length)
    }
}

/// Everything a write handle needs from the `Cfs` that opens it.
pub(crate) struct WriteContext {
    pub metadata: Arc<dyn MetadataService>,
    pub connector: Arc<dyn DataNodeConnector>,
    pub tracker: Arc<FlushTracker>,
    pub chunk_capacity: u64,
    pub queue_depth: usize,
    pub transfer_unit: usize,
}

struct WriteState {
    metadata: Arc<dyn MetadataService>,
    flushes: FlushScope,
    capacity: u64,
    size: AtomicU64,
    inner: Mutex<WriteInner>,
}

/// State guarded by the handle's write lock. The lock is held for a whole
/// `write`, including any allocation and any wait on a full flush queue.
struct WriteInner {
    active: ActiveChunk,
    sender: Option<mpsc::Sender<FlushJob>>,
    worker: Option<JoinHandle<Result<()>>>,
    /// Error that stopped the flush worker, reported by every later flush
    /// and close.
    failure: Option<CfsError>,
}

/// The chunk currently being filled.
///
/// `base + buffer.len() + free` equals the chunk capacity while a chunk is
/// bound; `base` is what the chunk already held when an append handle bound
/// to it.
#[derive(Debug, Default)]
struct ActiveChunk {
    chunk: Option<ChunkDescriptor>,
    base: u64,
    buffer: BytesMut,
    free: u64,
}

impl ActiveChunk {
    fn bind(chunk: ChunkDescriptor, capacity: u64) -> Self {
        let base = chunk.chunk_size;
        Self {
            chunk: Some(chunk),
            base,
            buffer: BytesMut::new(),
            free: capacity.saturating_sub(base),
        }
    }

    fn committed_size(&self) -> u64 {
        self.base + self.buffer.len() as u64
    }
}

impl CFile {
    pub(crate) fn open_read(
        path: impl Into<String>,
        volume_id: impl Into<String>,
        flags: OpenFlags,
        chunks: Vec<ChunkDescriptor>,
        reader: ReplicaReader,
    ) -> Self {
        let size: u64 = chunks.iter().map(|chunk| chunk.chunk_size).sum();
        Self {
            path: path.into(),
            volume_id: volume_id.into(),
            flags,
            state: HandleState::Read(ReadState {
                chunks,
                size,
                reader,
                cursor: 0,
                cached: None,
            }),
        }
    }

    /// Start a write handle and its flush worker. `tail` is the chunk an
    /// append handle keeps filling; it is ignored when already full.
    pub(crate) fn open_write(
        path: impl Into<String>,
        volume_id: impl Into<String>,
        flags: OpenFlags,
        size: u64,
        tail: Option<ChunkDescriptor>,
        context: WriteContext,
    ) -> Self {
        let path = path.into();
        let volume_id = volume_id.into();
        let flushes = FlushScope::new(context.tracker);

        let (sender, receiver) = mpsc::channel(context.queue_depth.max(1));
        let worker = ReplicaWriter::new(
            path.clone(),
            volume_id.clone(),
            context.metadata.clone(),
            context.connector,
            flushes.clone(),
            context.transfer_unit,
        )
        .spawn(receiver);

        let active = match tail {
            Some(chunk) if chunk.chunk_size < context.chunk_capacity => {
                ActiveChunk::bind(chunk, context.chunk_capacity)
            }
            _ => ActiveChunk::default(),
        };

        Self {
            path,
            volume_id,
            flags,
            state: HandleState::Write(WriteState {
                metadata: context.metadata,
                flushes,
                capacity: context.chunk_capacity,
                size: AtomicU64::new(size),
                inner: Mutex::new(WriteInner {
                    active,
                    sender: Some(sender),
                    worker: Some(worker),
                    failure: None,
                }),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.state, HandleState::Read(_))
    }

    /// Size as seen by this handle: the committed size for readers, bytes
    /// accepted so far for writers.
    pub fn file_size(&self) -> u64 {
        match &self.state {
            HandleState::Read(state) => state.size,
            HandleState::Write(state) => state.size.load(Ordering::SeqCst),
        }
    }

    /// Read cursor of a reader; writers are always at the end of their data.
    pub fn position(&self) -> u64 {
        match &self.state {
            HandleState::Read(state) => state.cursor,
            HandleState::Write(state) => state.size.load(Ordering::SeqCst),
        }
    }
}

fn not_readable(path: &str) -> CfsError {
    CfsError::NotAllowed(format!("{} is not open read-only", path))
}

fn not_writable(path: &str) -> CfsError {
    CfsError::NotAllowed(format!("{} is open read-only", path))
}

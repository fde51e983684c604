//! In-process implementation of every collaborator.
//!
//! Keeps namespaces, chunk lists and block contents in memory and can be
//! told to misbehave (unreachable nodes, slow or corrupt replies, failing
//! commits) so the data paths can be exercised without a real cluster.

use super::{ByteStream, DataNode, DataNodeConnector, MetadataService, VolumeManager};
use crate::error::Status;
use crate::types::{BlockLocation, ChunkDescriptor, InodeInfo, VolumeId, VolumeInfo};
use crate::{CfsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

const STREAM_PIECE: usize = 64 * 1024;
const DATA_NODE_PORT: u16 = 7000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn name_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[derive(Debug, Clone)]
enum Entry {
    Dir {
        modified_at: chrono::DateTime<chrono::Utc>,
    },
    File {
        chunks: Vec<ChunkDescriptor>,
        modified_at: chrono::DateTime<chrono::Utc>,
    },
}

impl Entry {
    fn inode(&self, path: &str) -> InodeInfo {
        match self {
            Entry::Dir { modified_at } => InodeInfo {
                name: name_of(path).to_string(),
                is_dir: true,
                size: 0,
                modified_at: *modified_at,
            },
            Entry::File {
                chunks,
                modified_at,
            } => InodeInfo {
                name: name_of(path).to_string(),
                is_dir: false,
                size: chunks.iter().map(|chunk| chunk.chunk_size).sum(),
                modified_at: *modified_at,
            },
        }
    }
}

#[derive(Default)]
struct Namespaces {
    volumes: HashMap<VolumeId, VolumeInfo>,
    // volume -> path -> entry
    trees: HashMap<VolumeId, BTreeMap<String, Entry>>,
}

impl Namespaces {
    fn tree(&mut self, volume_id: &str) -> Result<&mut BTreeMap<String, Entry>> {
        self.trees
            .get_mut(volume_id)
            .ok_or(CfsError::status("namespace lookup", Status::NotFound))
    }
}

/// An in-memory data node addressed as `host:port`.
pub struct MemoryDataNode {
    address: String,
    blocks: Mutex<HashMap<(u64, u64), Vec<u8>>>,
    read_delays: Mutex<HashMap<u64, Duration>>,
    completed_reads: Arc<Mutex<Vec<u64>>>,
    unreachable: AtomicBool,
    corrupt: AtomicBool,
    fail_writes: AtomicBool,
    writes_paused: watch::Sender<bool>,
    reads: AtomicUsize,
    write_streams: AtomicUsize,
    max_piece_len: AtomicUsize,
}

impl MemoryDataNode {
    fn new(address: String, completed_reads: Arc<Mutex<Vec<u64>>>) -> Self {
        let (writes_paused, _) = watch::channel(false);
        Self {
            address,
            blocks: Mutex::new(HashMap::new()),
            read_delays: Mutex::new(HashMap::new()),
            completed_reads,
            unreachable: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes_paused,
            reads: AtomicUsize::new(0),
            write_streams: AtomicUsize::new(0),
            max_piece_len: AtomicUsize::new(0),
        }
    }

    /// Refuse every call as if the node could not be dialed.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Answer reads with a reply that cannot be decoded.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold every write stream until writes are resumed.
    pub fn pause_writes(&self) {
        self.writes_paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.writes_paused.send_replace(false);
    }

    pub fn set_read_delay(&self, chunk_id: u64, delay: Duration) {
        lock(&self.read_delays).insert(chunk_id, delay);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_streams(&self) -> usize {
        self.write_streams.load(Ordering::SeqCst)
    }

    pub fn max_piece_len(&self) -> usize {
        self.max_piece_len.load(Ordering::SeqCst)
    }

    pub fn block(&self, chunk_id: u64, block_id: u64) -> Option<Vec<u8>> {
        lock(&self.blocks).get(&(chunk_id, block_id)).cloned()
    }

    pub fn block_count(&self) -> usize {
        lock(&self.blocks).len()
    }

    fn ensure_reachable(&self, op: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CfsError::Transport(format!(
                "{} {}: connection refused",
                op, self.address
            )));
        }
        Ok(())
    }

    async fn delay_for(&self, chunk_id: u64) {
        let delay = lock(&self.read_delays).get(&chunk_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn slice(&self, op: &str, chunk_id: u64, block_id: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(CfsError::Protocol(format!(
                "{} {}: undecodable reply",
                op, self.address
            )));
        }

        let blocks = lock(&self.blocks);
        let data = blocks.get(&(chunk_id, block_id)).ok_or_else(|| {
            CfsError::Transport(format!(
                "{} {}: no block {} for chunk {}",
                op, self.address, block_id, chunk_id
            ))
        })?;

        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(len) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

#[async_trait]
impl DataNode for MemoryDataNode {
    async fn read_chunk(
        &self,
        chunk_id: u64,
        block_id: u64,
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        self.ensure_reachable("read_chunk")?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.delay_for(chunk_id).await;
        let data = self.slice("read_chunk", chunk_id, block_id, offset, len)?;
        lock(&self.completed_reads).push(chunk_id);
        Ok(Bytes::from(data))
    }

    async fn stream_read_chunk(
        &self,
        chunk_id: u64,
        block_id: u64,
        offset: u64,
        len: u64,
    ) -> Result<ByteStream> {
        self.ensure_reachable("stream_read_chunk")?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.delay_for(chunk_id).await;
        let data = Bytes::from(self.slice("stream_read_chunk", chunk_id, block_id, offset, len)?);
        lock(&self.completed_reads).push(chunk_id);

        let pieces: Vec<Result<Bytes>> = (0..data.len())
            .step_by(STREAM_PIECE)
            .map(|start| Ok(data.slice(start..(start + STREAM_PIECE).min(data.len()))))
            .collect();
        Ok(futures_util::stream::iter(pieces).boxed())
    }

    async fn write_chunk_stream(
        &self,
        chunk_id: u64,
        block_id: u64,
        mut data: ByteStream,
    ) -> Result<()> {
        self.ensure_reachable("write_chunk_stream")?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CfsError::Transport(format!(
                "write_chunk_stream {}: stream reset",
                self.address
            )));
        }

        let mut paused = self.writes_paused.subscribe();
        paused
            .wait_for(|paused| !*paused)
            .await
            .map_err(|error| CfsError::Transport(error.to_string()))?;

        let mut received = Vec::new();
        while let Some(piece) = data.next().await {
            let piece = piece?;
            self.max_piece_len.fetch_max(piece.len(), Ordering::SeqCst);
            received.extend_from_slice(&piece);
        }

        lock(&self.blocks)
            .entry((chunk_id, block_id))
            .or_default()
            .extend_from_slice(&received);
        self.write_streams.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_chunk(&self, chunk_id: u64, block_id: u64) -> Result<()> {
        self.ensure_reachable("delete_chunk")?;
        lock(&self.blocks).remove(&(chunk_id, block_id));
        Ok(())
    }
}

/// Metadata service, volume manager and a fixed set of data nodes.
pub struct MemoryCluster {
    namespaces: Mutex<Namespaces>,
    nodes: Vec<Arc<MemoryDataNode>>,
    replicas: usize,
    next_id: AtomicU64,
    next_node: AtomicUsize,
    completed_reads: Arc<Mutex<Vec<u64>>>,
    fail_sync: AtomicBool,
    allocations: AtomicUsize,
    syncs: AtomicUsize,
}

impl MemoryCluster {
    /// `node_count` data nodes named `dn-<i>`, each chunk replicated on
    /// `replicas` of them.
    pub fn new(node_count: usize, replicas: usize) -> Arc<Self> {
        let completed_reads = Arc::new(Mutex::new(Vec::new()));
        let nodes = (0..node_count)
            .map(|index| {
                Arc::new(MemoryDataNode::new(
                    format!("dn-{}:{}", index, DATA_NODE_PORT),
                    completed_reads.clone(),
                ))
            })
            .collect();

        Arc::new(Self {
            namespaces: Mutex::new(Namespaces::default()),
            nodes,
            replicas: replicas.clamp(1, node_count.max(1)),
            next_id: AtomicU64::new(1),
            next_node: AtomicUsize::new(0),
            completed_reads,
            fail_sync: AtomicBool::new(false),
            allocations: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        })
    }

    pub fn node(&self, index: usize) -> &Arc<MemoryDataNode> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Arc<MemoryDataNode>] {
        &self.nodes
    }

    pub fn node_by_address(&self, address: &str) -> Option<&Arc<MemoryDataNode>> {
        self.nodes.iter().find(|node| node.address == address)
    }

    /// Make every `sync_chunk` fail with `NotAllowed`.
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Chunk ids of finished data node reads, in completion order.
    pub fn completed_reads(&self) -> Vec<u64> {
        lock(&self.completed_reads).clone()
    }

    pub fn committed_chunks(&self, path: &str, volume_id: &str) -> Vec<ChunkDescriptor> {
        let namespaces = lock(&self.namespaces);
        match namespaces
            .trees
            .get(volume_id)
            .and_then(|tree| tree.get(path))
        {
            Some(Entry::File { chunks, .. }) => chunks.clone(),
            _ => Vec::new(),
        }
    }

    /// Store `data` as a file made of chunks of the given sizes, bypassing
    /// the write path.
    pub fn seed_file(
        &self,
        path: &str,
        volume_id: &str,
        chunk_sizes: &[u64],
        data: &[u8],
    ) -> Result<Vec<ChunkDescriptor>> {
        let total: u64 = chunk_sizes.iter().sum();
        if total != data.len() as u64 {
            return Err(CfsError::InvalidRequest(format!(
                "seed sizes add up to {} but data has {} bytes",
                total,
                data.len()
            )));
        }

        let mut chunks = Vec::with_capacity(chunk_sizes.len());
        let mut start = 0usize;
        for size in chunk_sizes {
            let mut chunk = self.new_chunk();
            chunk.chunk_size = *size;
            let end = start + *size as usize;
            for block in &chunk.blocks {
                if let Some(node) = self.node_by_address(&block.address()) {
                    lock(&node.blocks).insert((chunk.chunk_id, block.block_id), data[start..end].to_vec());
                }
            }
            start = end;
            chunks.push(chunk);
        }

        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        tree.insert(
            path.to_string(),
            Entry::File {
                chunks: chunks.clone(),
                modified_at: chrono::Utc::now(),
            },
        );
        Ok(chunks)
    }

    fn new_chunk(&self) -> ChunkDescriptor {
        let chunk_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let first = self.next_node.fetch_add(1, Ordering::SeqCst);
        let blocks = (0..self.replicas)
            .map(|replica| {
                let node = &self.nodes[(first + replica) % self.nodes.len()];
                let (host, port) = node
                    .address
                    .rsplit_once(':')
                    .map(|(host, port)| (host.to_string(), port.parse().unwrap_or(DATA_NODE_PORT)))
                    .unwrap_or_else(|| (node.address.clone(), DATA_NODE_PORT));
                BlockLocation::new(host, port, self.next_id.fetch_add(1, Ordering::SeqCst))
            })
            .collect();

        ChunkDescriptor {
            chunk_id,
            chunk_size: 0,
            blocks,
        }
    }
}

#[async_trait]
impl MetadataService for MemoryCluster {
    async fn create_namespace(&self, volume_id: &str) -> Result<()> {
        let mut namespaces = lock(&self.namespaces);
        if namespaces.trees.contains_key(volume_id) {
            return Err(CfsError::status("create_namespace", Status::AlreadyExists));
        }

        let mut tree = BTreeMap::new();
        tree.insert(
            "/".to_string(),
            Entry::Dir {
                modified_at: chrono::Utc::now(),
            },
        );
        namespaces.trees.insert(volume_id.to_string(), tree);
        Ok(())
    }

    async fn create_dir(&self, path: &str, volume_id: &str) -> Result<()> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        if tree.contains_key(path) {
            return Err(CfsError::status("create_dir", Status::AlreadyExists));
        }
        if !matches!(tree.get(parent_of(path)), Some(Entry::Dir { .. })) {
            return Err(CfsError::status("create_dir", Status::NotFound));
        }

        tree.insert(
            path.to_string(),
            Entry::Dir {
                modified_at: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    async fn stat(&self, path: &str, volume_id: &str) -> Result<InodeInfo> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        tree.get(path)
            .map(|entry| entry.inode(path))
            .ok_or(CfsError::status("stat", Status::NotFound))
    }

    async fn list(&self, path: &str, volume_id: &str) -> Result<Vec<InodeInfo>> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        match tree.get(path) {
            Some(Entry::Dir { .. }) => Ok(tree
                .iter()
                .filter(|(child, _)| child.as_str() != "/" && parent_of(child) == path)
                .map(|(child, entry)| entry.inode(child))
                .collect()),
            Some(entry @ Entry::File { .. }) => Ok(vec![entry.inode(path)]),
            None => Err(CfsError::status("list", Status::NotFound)),
        }
    }

    async fn delete_dir(&self, path: &str, volume_id: &str) -> Result<()> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        if !matches!(tree.get(path), Some(Entry::Dir { .. })) || path == "/" {
            return Err(CfsError::status("delete_dir", Status::NotFound));
        }
        if tree.keys().any(|child| child != "/" && parent_of(child) == path) {
            return Err(CfsError::status("delete_dir", Status::NotAllowed));
        }

        tree.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, volume_id: &str) -> Result<()> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        if tree.contains_key(to) {
            return Err(CfsError::status("rename", Status::NotAllowed));
        }
        let entry = tree
            .remove(from)
            .ok_or(CfsError::status("rename", Status::NotFound))?;

        let prefix = format!("{}/", from.trim_end_matches('/'));
        let nested: Vec<String> = tree
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in nested {
            if let Some(child) = tree.remove(&key) {
                let moved = format!("{}/{}", to.trim_end_matches('/'), &key[prefix.len()..]);
                tree.insert(moved, child);
            }
        }

        tree.insert(to.to_string(), entry);
        Ok(())
    }

    async fn create_file(&self, path: &str, volume_id: &str) -> Result<()> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        match tree.get(path) {
            Some(Entry::File { .. }) => {
                return Err(CfsError::status("create_file", Status::AlreadyExists));
            }
            Some(Entry::Dir { .. }) => {
                return Err(CfsError::status("create_file", Status::NotAllowed));
            }
            None => {}
        }
        if !matches!(tree.get(parent_of(path)), Some(Entry::Dir { .. })) {
            return Err(CfsError::status("create_file", Status::NotFound));
        }

        tree.insert(
            path.to_string(),
            Entry::File {
                chunks: Vec::new(),
                modified_at: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete_file(&self, path: &str, volume_id: &str) -> Result<()> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        match tree.get(path) {
            Some(Entry::File { .. }) => {
                tree.remove(path);
                Ok(())
            }
            Some(Entry::Dir { .. }) => Err(CfsError::status("delete_file", Status::NotAllowed)),
            None => Err(CfsError::status("delete_file", Status::NotFound)),
        }
    }

    async fn allocate_chunk(&self, path: &str, volume_id: &str) -> Result<ChunkDescriptor> {
        let chunk = self.new_chunk();
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        match tree.get_mut(path) {
            Some(Entry::File { chunks, .. }) => {
                chunks.push(chunk.clone());
                self.allocations.fetch_add(1, Ordering::SeqCst);
                Ok(chunk)
            }
            _ => Err(CfsError::status("allocate_chunk", Status::NotFound)),
        }
    }

    async fn get_file_chunks(&self, path: &str, volume_id: &str) -> Result<Vec<ChunkDescriptor>> {
        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        match tree.get(path) {
            Some(Entry::File { chunks, .. }) => Ok(chunks.clone()),
            _ => Err(CfsError::status("get_file_chunks", Status::NotFound)),
        }
    }

    async fn sync_chunk(
        &self,
        path: &str,
        volume_id: &str,
        chunk: &ChunkDescriptor,
    ) -> Result<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(CfsError::status("sync_chunk", Status::NotAllowed));
        }

        let mut namespaces = lock(&self.namespaces);
        let tree = namespaces.tree(volume_id)?;
        let Some(Entry::File {
            chunks,
            modified_at,
        }) = tree.get_mut(path)
        else {
            return Err(CfsError::status("sync_chunk", Status::NotFound));
        };

        let stored = chunks
            .iter_mut()
            .find(|stored| stored.chunk_id == chunk.chunk_id)
            .ok_or(CfsError::status("sync_chunk", Status::NotFound))?;
        stored.chunk_size = chunk.chunk_size;
        *modified_at = chrono::Utc::now();
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl VolumeManager for MemoryCluster {
    async fn create_volume(&self, name: &str, space_quota_gb: u32) -> Result<VolumeId> {
        let volume_id = ulid::Ulid::new().to_string();
        lock(&self.namespaces).volumes.insert(
            volume_id.clone(),
            VolumeInfo {
                volume_id: volume_id.clone(),
                name: name.to_string(),
                space_quota_gb,
                used_bytes: 0,
            },
        );
        Ok(volume_id)
    }

    async fn volume_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        let namespaces = lock(&self.namespaces);
        let mut info = namespaces
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or(CfsError::status("volume_info", Status::NotFound))?;

        info.used_bytes = namespaces
            .trees
            .get(volume_id)
            .map(|tree| {
                tree.values()
                    .map(|entry| match entry {
                        Entry::File { chunks, .. } => {
                            chunks.iter().map(|chunk| chunk.chunk_size).sum::<u64>()
                        }
                        Entry::Dir { .. } => 0,
                    })
                    .sum::<u64>()
            })
            .unwrap_or(0);
        Ok(info)
    }
}

#[async_trait]
impl DataNodeConnector for MemoryCluster {
    async fn connect(&self, block: &BlockLocation) -> Result<Arc<dyn DataNode>> {
        let address = block.address();
        let node = self
            .node_by_address(&address)
            .ok_or_else(|| CfsError::Transport(format!("no route to {}", address)))?;
        let node: Arc<dyn DataNode> = node.clone();
        Ok(node)
    }
}

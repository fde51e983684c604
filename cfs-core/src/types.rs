use serde::{Deserialize, Serialize};

/// Maximum capacity of one chunk.
pub const CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Size of one piece sent on a replica write stream.
pub const TRANSFER_UNIT: usize = 1024 * 1024;

/// Filled chunks a write handle may queue before writers block.
pub const FLUSH_QUEUE_DEPTH: usize = 16;

pub type VolumeId = String;

/// One replica of a chunk: the data node serving it and the block id that
/// scopes the replica inside the chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    pub host: String,
    pub port: u16,
    pub block_id: u64,
}

impl BlockLocation {
    pub fn new(host: impl Into<String>, port: u16, block_id: u64) -> Self {
        Self {
            host: host.into(),
            port,
            block_id,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_id: u64,
    /// Committed bytes, never more than `CHUNK_SIZE`.
    pub chunk_size: u64,
    /// Replica group, in preference order.
    pub blocks: Vec<BlockLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: VolumeId,
    pub name: String,
    pub space_quota_gb: u32,
    pub used_bytes: u64,
}

/// POSIX-style open flags. Bit values follow Linux so numeric flags coming
/// from a front end can be passed straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const RDONLY: u32 = 0;
    pub const WRONLY: u32 = 0o1;
    pub const RDWR: u32 = 0o2;
    pub const CREATE: u32 = 0o100;
    pub const TRUNC: u32 = 0o1000;
    pub const APPEND: u32 = 0o2000;

    pub fn read_only() -> Self {
        Self(Self::RDONLY)
    }

    pub fn write_only() -> Self {
        Self(Self::WRONLY)
    }

    pub fn create_truncate() -> Self {
        Self(Self::WRONLY | Self::CREATE | Self::TRUNC)
    }

    pub fn append() -> Self {
        Self(Self::WRONLY | Self::APPEND)
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn is_read_only(&self) -> bool {
        self.0 == Self::RDONLY
    }

    pub fn mode(&self) -> OpenMode {
        if self.is_read_only() {
            OpenMode::Read
        } else if self.contains(Self::APPEND) && !self.contains(Self::CREATE) {
            OpenMode::Append
        } else {
            OpenMode::CreateTruncate
        }
    }
}

/// The three open paths a handle can take. Read-write without append is not
/// a path of its own and ends up as `CreateTruncate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Append,
    CreateTruncate,
}

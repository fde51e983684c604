//! CFS Core - Client library for a distributed chunked file store
//!
//! Files live in volumes and are stored as ordered chunks of at most 64 MiB:
//! - chunk placement and the path namespace come from the metadata service
//! - every chunk is replicated on a group of data nodes
//! - reads fall back across replicas, writes are buffered per chunk and
//!   flushed in the background

pub mod cluster;
pub mod config;
pub mod error;
pub mod file;
pub mod flush;
pub mod fs;
pub mod locator;
pub mod replica;
pub mod types;

pub use cluster::{
    DataNode, DataNodeConnector, DataNodePool, MemoryCluster, MetadataService, VolumeManager,
};
pub use config::ClientConfig;
pub use error::{CfsError, Result, Status, check_status};
pub use file::CFile;
pub use flush::{FlushScope, FlushTracker};
pub use fs::{Backends, Cfs};
pub use locator::{ByteRange, ChunkSegment, ChunkSpan, locate, resolve_range};
pub use replica::{FlushJob, ReplicaReader, ReplicaWriter};
pub use types::{
    BlockLocation, CHUNK_SIZE, ChunkDescriptor, FLUSH_QUEUE_DEPTH, InodeInfo, OpenFlags, OpenMode,
    TRANSFER_UNIT, VolumeId, VolumeInfo,
};

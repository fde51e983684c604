pub mod reader;
pub mod writer;

pub use reader::ReplicaReader;
pub use writer::{FlushJob, ReplicaWriter};

use super::{ByteStream, DataNode, MetadataService, VolumeManager};
use crate::error::check_status;
use crate::types::{ChunkDescriptor, InodeInfo, VolumeId, VolumeInfo};
use crate::{CfsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header carrying the number of bytes a single-shot read returned.
pub const READ_SIZE_HEADER: &str = "x-cfs-read-size";

#[derive(Debug, Serialize)]
struct PathRequest<'a> {
    path: &'a str,
    volume_id: &'a str,
}

#[derive(Debug, Serialize)]
struct NamespaceRequest<'a> {
    volume_id: &'a str,
}

#[derive(Debug, Serialize)]
struct RenameRequest<'a> {
    from: &'a str,
    to: &'a str,
    volume_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SyncChunkRequest<'a> {
    path: &'a str,
    volume_id: &'a str,
    chunk: &'a ChunkDescriptor,
}

#[derive(Debug, Serialize)]
struct CreateVolumeRequest<'a> {
    name: &'a str,
    space_quota_gb: u32,
}

#[derive(Debug, Deserialize)]
struct Ack {
    ret: i32,
}

#[derive(Debug, Deserialize)]
struct StatAck {
    ret: i32,
    #[serde(default)]
    inode: Option<InodeInfo>,
}

#[derive(Debug, Deserialize)]
struct ListAck {
    ret: i32,
    #[serde(default)]
    inodes: Vec<InodeInfo>,
}

#[derive(Debug, Deserialize)]
struct ChunkAck {
    ret: i32,
    #[serde(default)]
    chunk: Option<ChunkDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ChunksAck {
    ret: i32,
    #[serde(default)]
    chunks: Vec<ChunkDescriptor>,
}

#[derive(Debug, Deserialize)]
struct CreateVolumeAck {
    ret: i32,
    #[serde(default)]
    volume_id: Option<VolumeId>,
}

#[derive(Debug, Deserialize)]
struct VolumeInfoAck {
    ret: i32,
    #[serde(default)]
    volume: Option<VolumeInfo>,
}

fn base_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr.trim_end_matches('/'))
    }
}

/// POST a JSON request to `{base}/v1/{op}` and decode the JSON ack.
///
/// Unreachable peers and non-success HTTP statuses are transport errors; a
/// body that does not decode is a protocol error.
async fn post_json<Req, Resp>(
    client: &reqwest::Client,
    base: &str,
    op: &'static str,
    request: &Req,
) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let url = format!("{}/v1/{}", base, op);
    let response = client
        .post(&url)
        .json(request)
        .send()
        .await
        .map_err(|error| CfsError::Transport(format!("{} {}: {}", op, url, error)))?;

    if !response.status().is_success() {
        return Err(CfsError::Transport(format!(
            "{} {}: status={}",
            op,
            url,
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|error| CfsError::Transport(format!("{} {}: {}", op, url, error)))?;

    serde_json::from_slice(&body)
        .map_err(|error| CfsError::Protocol(format!("{} {}: invalid ack: {}", op, url, error)))
}

fn missing_payload(op: &str) -> CfsError {
    CfsError::Protocol(format!("{} ack has ret=0 but no payload", op))
}

pub struct HttpMetadataClient {
    client: reqwest::Client,
    base: String,
}

impl HttpMetadataClient {
    pub fn new(client: reqwest::Client, addr: &str) -> Self {
        Self {
            client,
            base: base_url(addr),
        }
    }

    async fn call_ack<Req: Serialize + ?Sized>(&self, op: &'static str, request: &Req) -> Result<()> {
        let ack: Ack = post_json(&self.client, &self.base, op, request).await?;
        check_status(op, ack.ret)
    }
}

#[async_trait]
impl MetadataService for HttpMetadataClient {
    async fn create_namespace(&self, volume_id: &str) -> Result<()> {
        self.call_ack("create_namespace", &NamespaceRequest { volume_id })
            .await
    }

    async fn create_dir(&self, path: &str, volume_id: &str) -> Result<()> {
        self.call_ack("create_dir", &PathRequest { path, volume_id })
            .await
    }

    async fn stat(&self, path: &str, volume_id: &str) -> Result<InodeInfo> {
        let ack: StatAck = post_json(
            &self.client,
            &self.base,
            "stat",
            &PathRequest { path, volume_id },
        )
        .await?;
        check_status("stat", ack.ret)?;
        ack.inode.ok_or_else(|| missing_payload("stat"))
    }

    async fn list(&self, path: &str, volume_id: &str) -> Result<Vec<InodeInfo>> {
        let ack: ListAck = post_json(
            &self.client,
            &self.base,
            "list",
            &PathRequest { path, volume_id },
        )
        .await?;
        check_status("list", ack.ret)?;
        Ok(ack.inodes)
    }

    async fn delete_dir(&self, path: &str, volume_id: &str) -> Result<()> {
        self.call_ack("delete_dir", &PathRequest { path, volume_id })
            .await
    }

    async fn rename(&self, from: &str, to: &str, volume_id: &str) -> Result<()> {
        self.call_ack(
            "rename",
            &RenameRequest {
                from,
                to,
                volume_id,
            },
        )
        .await
    }

    async fn create_file(&self, path: &str, volume_id: &str) -> Result<()> {
        self.call_ack("create_file", &PathRequest { path, volume_id })
            .await
    }

    async fn delete_file(&self, path: &str, volume_id: &str) -> Result<()> {
        self.call_ack("delete_file", &PathRequest { path, volume_id })
            .await
    }

    async fn allocate_chunk(&self, path: &str, volume_id: &str) -> Result<ChunkDescriptor> {
        let ack: ChunkAck = post_json(
            &self.client,
            &self.base,
            "allocate_chunk",
            &PathRequest { path, volume_id },
        )
        .await?;
        check_status("allocate_chunk", ack.ret)?;
        ack.chunk.ok_or_else(|| missing_payload("allocate_chunk"))
    }

    async fn get_file_chunks(&self, path: &str, volume_id: &str) -> Result<Vec<ChunkDescriptor>> {
        let ack: ChunksAck = post_json(
            &self.client,
            &self.base,
            "get_file_chunks",
            &PathRequest { path, volume_id },
        )
        .await?;
        check_status("get_file_chunks", ack.ret)?;
        Ok(ack.chunks)
    }

    async fn sync_chunk(
        &self,
        path: &str,
        volume_id: &str,
        chunk: &ChunkDescriptor,
    ) -> Result<()> {
        self.call_ack(
            "sync_chunk",
            &SyncChunkRequest {
                path,
                volume_id,
                chunk,
            },
        )
        .await
    }
}

pub struct HttpVolumeManagerClient {
    client: reqwest::Client,
    base: String,
}

impl HttpVolumeManagerClient {
    pub fn new(client: reqwest::Client, addr: &str) -> Self {
        Self {
            client,
            base: base_url(addr),
        }
    }
}

#[async_trait]
impl VolumeManager for HttpVolumeManagerClient {
    async fn create_volume(&self, name: &str, space_quota_gb: u32) -> Result<VolumeId> {
        let ack: CreateVolumeAck = post_json(
            &self.client,
            &self.base,
            "create_volume",
            &CreateVolumeRequest {
                name,
                space_quota_gb,
            },
        )
        .await?;
        check_status("create_volume", ack.ret)?;
        ack.volume_id
            .ok_or_else(|| missing_payload("create_volume"))
    }

    async fn volume_info(&self, volume_id: &str) -> Result<VolumeInfo> {
        let ack: VolumeInfoAck = post_json(
            &self.client,
            &self.base,
            "volume_info",
            &NamespaceRequest { volume_id },
        )
        .await?;
        check_status("volume_info", ack.ret)?;
        ack.volume.ok_or_else(|| missing_payload("volume_info"))
    }
}

/// Client for one data node, reached at `http://host:port`.
pub struct HttpDataNode {
    client: reqwest::Client,
    base: String,
}

impl HttpDataNode {
    pub fn new(client: reqwest::Client, addr: &str) -> Self {
        Self {
            client,
            base: base_url(addr),
        }
    }

    fn block_url(&self, chunk_id: u64, block_id: u64) -> String {
        format!("{}/v1/chunks/{}/blocks/{}", self.base, chunk_id, block_id)
    }

    async fn send_checked(
        &self,
        op: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|error| CfsError::Transport(format!("{} {}: {}", op, self.base, error)))?;

        if !response.status().is_success() {
            return Err(CfsError::Transport(format!(
                "{} {}: status={}",
                op,
                self.base,
                response.status()
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl DataNode for HttpDataNode {
    async fn read_chunk(
        &self,
        chunk_id: u64,
        block_id: u64,
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        let request = self
            .client
            .get(self.block_url(chunk_id, block_id))
            .query(&[("offset", offset), ("length", len)]);
        let response = self.send_checked("read_chunk", request).await?;

        let read_size = response
            .headers()
            .get(READ_SIZE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                CfsError::Protocol(format!(
                    "read_chunk {}: missing or invalid {} header",
                    self.base, READ_SIZE_HEADER
                ))
            })?;

        let body = response
            .bytes()
            .await
            .map_err(|error| CfsError::Transport(format!("read_chunk {}: {}", self.base, error)))?;

        if body.len() as u64 != read_size {
            return Err(CfsError::Protocol(format!(
                "read_chunk {}: header says {} bytes, body has {}",
                self.base,
                read_size,
                body.len()
            )));
        }

        Ok(body)
    }

    async fn stream_read_chunk(
        &self,
        chunk_id: u64,
        block_id: u64,
        offset: u64,
        len: u64,
    ) -> Result<ByteStream> {
        let request = self
            .client
            .get(self.block_url(chunk_id, block_id))
            .query(&[("offset", offset), ("length", len)])
            .query(&[("stream", "true")]);
        let response = self.send_checked("stream_read_chunk", request).await?;

        let base = self.base.clone();
        let stream = response.bytes_stream().map(move |item| {
            item.map_err(|error| {
                CfsError::Transport(format!("stream_read_chunk {}: {}", base, error))
            })
        });

        Ok(stream.boxed())
    }

    async fn write_chunk_stream(
        &self,
        chunk_id: u64,
        block_id: u64,
        data: ByteStream,
    ) -> Result<()> {
        let request = self
            .client
            .put(self.block_url(chunk_id, block_id))
            .body(reqwest::Body::wrap_stream(data));
        let response = self.send_checked("write_chunk_stream", request).await?;

        let body = response.bytes().await.map_err(|error| {
            CfsError::Transport(format!("write_chunk_stream {}: {}", self.base, error))
        })?;
        let ack: Ack = serde_json::from_slice(&body).map_err(|error| {
            CfsError::Protocol(format!(
                "write_chunk_stream {}: invalid ack: {}",
                self.base, error
            ))
        })?;
        check_status("write_chunk_stream", ack.ret)
    }

    async fn delete_chunk(&self, chunk_id: u64, block_id: u64) -> Result<()> {
        let request = self.client.delete(self.block_url(chunk_id, block_id));
        let response = self.send_checked("delete_chunk", request).await?;

        let body = response
            .bytes()
            .await
            .map_err(|error| CfsError::Transport(format!("delete_chunk {}: {}", self.base, error)))?;
        let ack: Ack = serde_json::from_slice(&body).map_err(|error| {
            CfsError::Protocol(format!("delete_chunk {}: invalid ack: {}", self.base, error))
        })?;
        check_status("delete_chunk", ack.ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_adds_scheme_once() {
        assert_eq!(base_url("10.0.0.1:9000"), "http://10.0.0.1:9000");
        assert_eq!(base_url("http://meta:1/"), "http://meta:1");
        assert_eq!(base_url("https://meta:1"), "https://meta:1");
    }

    #[test]
    fn test_block_url_layout() {
        let node = HttpDataNode::new(reqwest::Client::new(), "dn1:7000");
        assert_eq!(node.block_url(5, 2), "http://dn1:7000/v1/chunks/5/blocks/2");
    }

    #[tokio::test]
    async fn test_unreachable_data_node_is_transport_error() {
        let node = HttpDataNode::new(reqwest::Client::new(), "127.0.0.1:1");
        let error = node.read_chunk(1, 1, 0, 10).await.unwrap_err();
        assert!(error.is_transport(), "unexpected error: {}", error);
    }
}

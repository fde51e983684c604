use super::{DataNode, DataNodeConnector, HttpDataNode};
use crate::types::BlockLocation;
use crate::{CfsError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Reusable data node clients keyed by peer address.
///
/// All clients share one `reqwest::Client`, so keep-alive connections to a
/// peer survive across reads and flushes instead of being dialed per call.
pub struct DataNodePool {
    client: reqwest::Client,
    nodes: RwLock<HashMap<String, Arc<HttpDataNode>>>,
}

impl DataNodePool {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|error| CfsError::Config(format!("failed to build HTTP client: {}", error)))?;
        Ok(Self::new(client))
    }

    /// The shared client, for collaborators that should reuse its
    /// connections.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Number of peers a client has been opened for.
    pub async fn peers(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn get(&self, address: &str) -> Arc<HttpDataNode> {
        if let Some(node) = self.nodes.read().await.get(address) {
            return node.clone();
        }

        let mut nodes = self.nodes.write().await;
        nodes
            .entry(address.to_string())
            .or_insert_with(|| {
                tracing::debug!("Opening data node client for {}", address);
                Arc::new(HttpDataNode::new(self.client.clone(), address))
            })
            .clone()
    }
}

#[async_trait]
impl DataNodeConnector for DataNodePool {
    async fn connect(&self, block: &BlockLocation) -> Result<Arc<dyn DataNode>> {
        let node: Arc<dyn DataNode> = self.get(&block.address()).await;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_reuses_client_per_address() {
        let pool = DataNodePool::new(reqwest::Client::new());

        let first = pool.get("10.0.0.1:9000").await;
        let again = pool.get("10.0.0.1:9000").await;
        let other = pool.get("10.0.0.2:9000").await;

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(pool.peers().await, 2);
    }

    #[tokio::test]
    async fn test_pool_built_with_timeout_starts_empty() {
        let pool = DataNodePool::with_connect_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(pool.peers().await, 0);

        let node = pool.get("127.0.0.1:1").await;
        assert!(node.read_chunk(1, 1, 0, 1).await.unwrap_err().is_transport());
        assert_eq!(pool.peers().await, 1);
    }

    #[tokio::test]
    async fn test_connect_keys_by_block_address() {
        let pool = DataNodePool::new(reqwest::Client::new());
        pool.connect(&BlockLocation::new("dn", 1, 1)).await.unwrap();
        pool.connect(&BlockLocation::new("dn", 1, 2)).await.unwrap();
        assert_eq!(pool.peers().await, 1);
    }
}

//! Kademlia-style routing table.
//!
//! Known nodes live in 256 k-buckets indexed by their log2 distance from
//! the local node ID. Each bucket keeps LRU order (most recently seen at the
//! back). Nodes that fail [`MAX_FAILURES`] liveness checks in a row are
//! dropped.

use std::collections::VecDeque;
use std::time::Instant;

use tos_bootnode_common::tokio::sync::RwLock;

use super::identity::{compare_distance, log2_distance, NodeId};
use super::messages::NodeInfo;

/// Number of k-buckets (one for each bit position).
pub const NUM_BUCKETS: usize = 256;

/// Default number of nodes per bucket (Kademlia k parameter).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Alpha parameter for parallel lookups.
pub const ALPHA: usize = 3;

/// Consecutive failures after which a node is removed.
pub const MAX_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub info: NodeInfo,
    pub last_seen: Instant,
    /// Consecutive failed liveness checks.
    pub fail_count: u32,
}

impl NodeEntry {
    fn new(info: NodeInfo) -> Self {
        Self {
            info,
            last_seen: Instant::now(),
            fail_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.fail_count = 0;
    }
}

/// Result of inserting a node into the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// Already known; moved to the back of its bucket.
    Updated,
    /// Bucket is full; carries the least recently seen node to ping.
    BucketFull(NodeInfo),
    SelfInsert,
}

#[derive(Debug)]
struct KBucket {
    nodes: VecDeque<NodeEntry>,
    capacity: usize,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|e| &e.info.node_id == node_id)
    }

    fn insert(&mut self, info: NodeInfo) -> InsertResult {
        if let Some(mut existing) = self.position(&info.node_id).and_then(|i| self.nodes.remove(i)) {
            existing.touch();
            existing.info = info;
            self.nodes.push_back(existing);
            return InsertResult::Updated;
        }

        if self.nodes.len() >= self.capacity {
            if let Some(oldest) = self.nodes.front() {
                return InsertResult::BucketFull(oldest.info.clone());
            }
        }

        self.nodes.push_back(NodeEntry::new(info));
        InsertResult::Inserted
    }
}

/// Kademlia-style routing table for node discovery.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<KBucket>>,
    bucket_size: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| RwLock::new(KBucket::new(bucket_size)))
            .collect();

        Self {
            local_id,
            buckets,
            bucket_size,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn bucket(&self, node_id: &NodeId) -> Option<&RwLock<KBucket>> {
        log2_distance(&self.local_id, node_id).map(|d| &self.buckets[d as usize])
    }

    pub async fn insert(&self, node: NodeInfo) -> InsertResult {
        match self.bucket(&node.node_id) {
            Some(bucket) => bucket.write().await.insert(node),
            None => InsertResult::SelfInsert,
        }
    }

    /// Mark a node as alive, moving it to the back of its bucket.
    pub async fn touch(&self, node_id: &NodeId) -> bool {
        let Some(bucket) = self.bucket(node_id) else {
            return false;
        };
        let mut bucket = bucket.write().await;
        match bucket.position(node_id).and_then(|i| bucket.nodes.remove(i)) {
            Some(mut entry) => {
                entry.touch();
                bucket.nodes.push_back(entry);
                true
            }
            None => false,
        }
    }

    /// Count a failed liveness check. Returns true if the node was removed.
    pub async fn record_failure(&self, node_id: &NodeId) -> bool {
        let Some(bucket) = self.bucket(node_id) else {
            return false;
        };
        let mut bucket = bucket.write().await;
        let Some(index) = bucket.position(node_id) else {
            return false;
        };
        let fail_count = {
            let entry = &mut bucket.nodes[index];
            entry.fail_count = entry.fail_count.saturating_add(1);
            entry.fail_count
        };
        if fail_count >= MAX_FAILURES {
            bucket.nodes.remove(index);
            return true;
        }
        false
    }

    pub async fn remove(&self, node_id: &NodeId) -> Option<NodeEntry> {
        let mut bucket = self.bucket(node_id)?.write().await;
        let index = bucket.position(node_id)?;
        bucket.nodes.remove(index)
    }

    /// Replace `oldest` by `node` if `oldest` is still the least recently
    /// seen entry of the bucket.
    pub async fn replace_oldest(&self, oldest: &NodeId, node: NodeInfo) -> bool {
        let Some(bucket) = self.bucket(oldest) else {
            return false;
        };
        let mut bucket = bucket.write().await;
        if bucket.nodes.front().map(|e| &e.info.node_id) != Some(oldest) {
            return false;
        }
        bucket.nodes.pop_front();
        bucket.insert(node);
        true
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<NodeEntry> {
        let bucket = self.bucket(node_id)?.read().await;
        bucket.nodes.iter().find(|e| &e.info.node_id == node_id).cloned()
    }

    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.get(node_id).await.is_some()
    }

    /// Up to `count` nodes accepted by `filter`, sorted by XOR distance to
    /// the target.
    pub async fn closest<F>(&self, target: &NodeId, count: usize, filter: F) -> Vec<NodeInfo>
    where
        F: Fn(&NodeInfo) -> bool,
    {
        let mut candidates = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            candidates.extend(
                bucket
                    .nodes
                    .iter()
                    .filter(|e| filter(&e.info))
                    .map(|e| e.info.clone()),
            );
        }

        candidates.sort_by(|a, b| compare_distance(target, &a.node_id, &b.node_id));
        candidates.truncate(count);
        candidates
    }

    pub async fn all_nodes(&self) -> Vec<NodeEntry> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            nodes.extend(bucket.read().await.nodes.iter().cloned());
        }
        nodes
    }

    pub async fn len(&self) -> usize {
        let mut count = 0usize;
        for bucket in &self.buckets {
            count = count.saturating_add(bucket.read().await.nodes.len());
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

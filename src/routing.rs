//! # Routing Table (XOR-Metric k-Buckets)
//!
//! One [`HashTable`] per local identity. Peers live in 160 buckets indexed
//! by the highest-order bit in which their identifier differs from the
//! origin's: bucket 0 covers the far half of the keyspace, bucket 159 the
//! nearest neighbors.
//!
//! Bucket order convention: least-recently-seen at the head, most recent at
//! the tail. A bucket holds at most [`MAX_CONTACTS`] entries; when a full
//! bucket receives a new peer the head is pinged and evicted only if it
//! fails to answer (see the add-node path in `dht`).
//!
//! The bucket array sits behind a single async mutex. The eviction ping
//! suspends while holding it, which serializes all structural mutations of
//! one table.

use std::cmp::Ordering;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::contact::{Address, Contact};
use crate::id::{self, bucket_index, distance_cmp, NodeId, ID_BITS};

/// Bucket capacity (the Kademlia `k`). Matches the identifier width in
/// bytes, so a full response carries at most one bucket's worth of peers.
pub const MAX_CONTACTS: usize = 20;

/// Fan-out of each iterative lookup round (the Kademlia `alpha`).
pub const PARALLEL_CALLS: usize = 3;

/// A routing table entry: a peer plus the time we last heard from it.
#[derive(Clone, Debug)]
pub struct RouteNode {
    id: NodeId,
    contact: Contact,
    last_seen: Instant,
}

impl RouteNode {
    /// Wrap a contact. Returns `None` for contacts without an identifier;
    /// those cannot be placed in a bucket.
    pub fn new(contact: Contact) -> Option<Self> {
        contact.id.map(|id| Self {
            id,
            contact,
            last_seen: Instant::now(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// One k-bucket: ordered peers plus its refresh clock.
#[derive(Debug)]
pub(crate) struct Bucket {
    pub(crate) nodes: Vec<RouteNode>,
    pub(crate) last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    pub(crate) fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id() == id)
    }

    /// Move `id` to the tail and refresh its last-seen time.
    pub(crate) fn promote(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.id() == id) {
            let mut node = self.nodes.remove(pos);
            node.touch();
            self.nodes.push(node);
            true
        } else {
            false
        }
    }
}

/// Per-identity routing table.
pub struct HashTable {
    origin: Contact,
    origin_id: NodeId,
    pub(crate) buckets: Mutex<Vec<Bucket>>,
}

impl HashTable {
    pub fn new(id: NodeId, address: Address) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(Bucket::new());
        }
        Self {
            origin: Contact::new(id, address),
            origin_id: id,
            buckets: Mutex::new(buckets),
        }
    }

    /// The local contact this table is keyed by.
    pub fn origin(&self) -> &Contact {
        &self.origin
    }

    pub fn origin_id(&self) -> &NodeId {
        &self.origin_id
    }

    pub async fn total_nodes(&self) -> usize {
        let buckets = self.buckets.lock().await;
        buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub async fn total_nodes_in_bucket(&self, index: usize) -> usize {
        let buckets = self.buckets.lock().await;
        buckets[index].nodes.len()
    }

    /// Entries in bucket `index` strictly closer to `key` than the origin is.
    pub async fn nodes_closer_than(&self, index: usize, key: &NodeId) -> Vec<Contact> {
        let own_distance = self.origin_id.xor_distance(key);
        let buckets = self.buckets.lock().await;
        buckets[index]
            .nodes
            .iter()
            .filter(|n| distance_cmp(&n.id().xor_distance(key), &own_distance) == Ordering::Less)
            .map(|n| n.contact().clone())
            .collect()
    }

    pub async fn node_exists_in_bucket(&self, index: usize, id: &NodeId) -> bool {
        let buckets = self.buckets.lock().await;
        buckets[index].contains(id)
    }

    /// Promote `id` to the tail of its bucket, refreshing its last-seen time.
    pub async fn mark_seen(&self, id: &NodeId) -> bool {
        let index = bucket_index(&self.origin_id, id);
        let mut buckets = self.buckets.lock().await;
        buckets[index].promote(id)
    }

    pub async fn reset_refresh_time(&self, index: usize) {
        let mut buckets = self.buckets.lock().await;
        buckets[index].last_refresh = Instant::now();
    }

    pub async fn refresh_time(&self, index: usize) -> Instant {
        let buckets = self.buckets.lock().await;
        buckets[index].last_refresh
    }

    /// A random identifier that would land in bucket `index` of this table.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        id::random_id_in_bucket(&self.origin_id, index)
    }

    /// Up to `count` known peers nearest `key`, excluding `exclude`,
    /// as a route set ordered by distance to `key`.
    pub async fn closest_contacts(
        &self,
        count: usize,
        key: &NodeId,
        exclude: &[NodeId],
    ) -> RouteSet {
        let buckets = self.buckets.lock().await;
        let mut nodes = Vec::new();
        for bucket in buckets.iter() {
            for node in &bucket.nodes {
                if exclude.contains(node.id()) {
                    continue;
                }
                nodes.push(node.clone());
            }
        }
        drop(buckets);

        let mut set = RouteSet::from_nodes(*key, nodes);
        set.truncate(count);
        set
    }
}

/// A mutable, target-ordered set of route nodes.
///
/// The ordering key (XOR distance to `target`) is fixed at construction.
/// Sorting is stable, so equal-distance entries keep insertion order.
#[derive(Clone, Debug)]
pub struct RouteSet {
    target: NodeId,
    nodes: Vec<RouteNode>,
}

impl RouteSet {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            nodes: Vec::new(),
        }
    }

    pub fn from_nodes(target: NodeId, nodes: Vec<RouteNode>) -> Self {
        let mut set = Self { target, nodes };
        set.sort();
        set
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node nearest the target, if any.
    pub fn first(&self) -> Option<&RouteNode> {
        self.nodes.first()
    }

    pub fn nodes(&self) -> &[RouteNode] {
        &self.nodes
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.nodes.iter().map(|n| n.contact().clone()).collect()
    }

    /// Merge contacts into the set and re-sort. Contacts without an
    /// identifier and identifiers already present are skipped.
    pub fn extend<I>(&mut self, contacts: I)
    where
        I: IntoIterator<Item = Contact>,
    {
        for contact in contacts {
            let Some(node) = RouteNode::new(contact) else {
                continue;
            };
            if self.nodes.iter().any(|n| n.id() == node.id()) {
                continue;
            }
            self.nodes.push(node);
        }
        self.sort();
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.id() == id) {
            self.nodes.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn sort(&mut self) {
        let target = self.target;
        self.nodes
            .sort_by(|a, b| distance_cmp(&a.id().xor_distance(&target), &b.id().xor_distance(&target)));
    }

    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }
}

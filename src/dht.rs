//! # DHT Engine
//!
//! The overlay engine: per-identity routing tables, the iterative lookup
//! state machine, the inbound message dispatcher, and the maintenance
//! timers, all over an injected transport and storage backend.
//!
//! ## Public Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `listen` | Run the transport, dispatcher, and timers until stopped |
//! | `bootstrap` | Join the network through the configured seeds |
//! | `store(data)` | Publish a value; returns its base58 key |
//! | `get(key)` | Fetch a value, locally or via iterative find-value |
//! | `find_node(key)` | Resolve an identifier to a reachable contact |
//! | `remote_procedure_call` | Invoke a named procedure on a peer |
//! | `disconnect` | Stop the transport and all background loops |
//!
//! ## Structure
//!
//! [`Dht`] is a cheap-to-clone handle over shared engine state. The
//! dispatcher serves peer queries serially; every handler first records the
//! sender in the routing table. Lookups run α-parallel rounds with
//! per-future and per-round deadlines and converge when a round brings no
//! node closer to the target. A one-second tick drives bucket refresh,
//! replication of published values, and the expiration sweep.
//!
//! ## Multi-Identity
//!
//! One process may participate under several identifiers sharing a single
//! transport. Each identity owns a routing table; a [`RoutingContext`]
//! selects the table an operation runs against and is derived per inbound
//! message from the receiver identifier.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::contact::{Contact, Origin};
use crate::error::DhtError;
use crate::id::{bucket_index, NodeId, ID_BITS};
use crate::messages::{Message, Payload};
use crate::pending::ResponseFuture;
use crate::routing::{HashTable, RouteNode, MAX_CONTACTS, PARALLEL_CALLS};
use crate::rpc::RpcRegistry;
use crate::storage::{self, Key, Storage};
use crate::transport::Transport;

/// Saturation point for the density-scaled expiration deadline.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Engine configuration. All durations default per the overlay protocol.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Seeds used to join the network. A seed without an identifier is
    /// pinged first; its identity is learned from the reply.
    pub bootstrap_nodes: Vec<Contact>,

    /// Time-to-live of a stored value from its publication date.
    pub expiration_time: Duration,

    /// Idle time after which a bucket is re-explored.
    pub refresh_time: Duration,

    /// Interval between re-publications of locally published values.
    pub replicate_time: Duration,

    /// Interval after which the original publisher must republish a value.
    /// Tracked in configuration but not yet enforced.
    pub republish_time: Duration,

    /// How long the full-bucket eviction ping waits for the incumbent.
    pub ping_timeout: Duration,

    /// Deadline for any awaited response.
    pub message_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            expiration_time: Duration::from_secs(86410),
            refresh_time: Duration::from_secs(3600),
            replicate_time: Duration::from_secs(3600),
            republish_time: Duration::from_secs(86400),
            ping_timeout: Duration::from_secs(1),
            message_timeout: Duration::from_secs(10),
        }
    }
}

/// Selects which identity (and therefore which routing table) an operation
/// runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingContext {
    index: usize,
}

/// What an iteration is trying to accomplish; drives the request type and
/// the termination behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IterateKind {
    FindNode,
    FindValue,
    Store,
    Bootstrap,
}

struct DhtInner {
    tables: Vec<HashTable>,
    origin: Origin,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    rpc: RpcRegistry,
    config: DhtConfig,
}

/// Handle to the overlay engine. Clones share state.
#[derive(Clone)]
pub struct Dht {
    inner: Arc<DhtInner>,
}

impl Dht {
    /// Assemble an engine from its collaborators. One routing table is
    /// created per origin identity.
    pub fn new(
        storage: Arc<dyn Storage>,
        origin: Origin,
        transport: Arc<dyn Transport>,
        rpc: RpcRegistry,
        config: DhtConfig,
    ) -> Self {
        let tables = origin
            .ids()
            .iter()
            .map(|id| HashTable::new(*id, origin.address()))
            .collect();
        Self {
            inner: Arc::new(DhtInner {
                tables,
                origin,
                transport,
                storage,
                rpc,
                config,
            }),
        }
    }

    /// The context of the first configured identity.
    pub fn default_context(&self) -> RoutingContext {
        RoutingContext { index: 0 }
    }

    /// The context for one of our identities, if `id` is ours.
    pub fn context_for(&self, id: &NodeId) -> Option<RoutingContext> {
        self.inner
            .origin
            .position(id)
            .map(|index| RoutingContext { index })
    }

    fn table(&self, ctx: &RoutingContext) -> &HashTable {
        &self.inner.tables[ctx.index]
    }

    /// Number of peers in the context's routing table.
    pub async fn num_nodes(&self, ctx: &RoutingContext) -> usize {
        self.table(ctx).total_nodes().await
    }

    /// Base58 identifier of the context's identity.
    pub fn origin_id(&self, ctx: &RoutingContext) -> String {
        self.table(ctx).origin_id().to_base58()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Run the engine: spawns the dispatcher, the maintenance timers, and
    /// the disconnect watcher, then blocks in the transport's receive loop
    /// until it stops or fails.
    ///
    /// Panics if called twice; the engine owns the transport's inbound
    /// stream.
    pub async fn listen(&self) -> Result<(), DhtError> {
        let inbound = self
            .inner
            .transport
            .take_inbound()
            .expect("listen may only be called once per transport");

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch_messages(inbound).await });

        let timers = self.clone();
        tokio::spawn(async move { timers.run_timers().await });

        let watcher = self.clone();
        tokio::spawn(async move {
            let mut stopped = watcher.inner.transport.stopped();
            while stopped.changed().await.is_ok() {
                if *stopped.borrow() {
                    watcher.inner.transport.close();
                    break;
                }
            }
        });

        self.inner.transport.start().await.map_err(DhtError::from)
    }

    /// Stop the transport; every background loop observes the signal and
    /// exits at its next suspension point.
    pub fn disconnect(&self) {
        self.inner.transport.stop();
    }

    /// Join the network through the configured seeds. Seeds without an
    /// identifier are pinged and inserted once they reply; identified seeds
    /// are inserted directly. The first identity that acquired a neighbor
    /// then runs a bootstrap iteration toward its own identifier.
    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        if self.inner.config.bootstrap_nodes.is_empty() {
            return Ok(());
        }

        let mut futures = Vec::new();
        for index in 0..self.inner.tables.len() {
            let ctx = RoutingContext { index };
            let ht = self.table(&ctx);
            for seed in &self.inner.config.bootstrap_nodes {
                if seed.id.is_none() {
                    let ping = Message::ping(ht.origin().clone(), seed.clone());
                    match self.inner.transport.send_request(ping).await {
                        Ok(future) => futures.push(future),
                        Err(e) => {
                            debug!(seed = %seed.address, error = %e, "seed ping failed")
                        }
                    }
                } else if let Some(node) = RouteNode::new(seed.clone()) {
                    self.add_node(&ctx, node).await;
                }
            }
        }

        // Collect seed replies; each reply names the identity it answered.
        let message_timeout = self.inner.config.message_timeout;
        let mut join = JoinSet::new();
        for mut future in futures {
            join.spawn(async move {
                match timeout(message_timeout, future.result()).await {
                    Ok(result) => result,
                    Err(_) => {
                        future.cancel();
                        None
                    }
                }
            });
        }
        while let Some(joined) = join.join_next().await {
            let Ok(Some(response)) = joined else { continue };
            let Some(receiver_id) = response.receiver.id else {
                continue;
            };
            let Some(ctx) = self.context_for(&receiver_id) else {
                continue;
            };
            if let Some(node) = RouteNode::new(response.sender.clone()) {
                self.add_node(&ctx, node).await;
            }
        }

        for index in 0..self.inner.tables.len() {
            let ctx = RoutingContext { index };
            if self.num_nodes(&ctx).await > 0 {
                let origin_id = *self.table(&ctx).origin_id();
                self.iterate(&ctx, IterateKind::Bootstrap, &origin_id, None)
                    .await?;
                return Ok(());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // User operations
    // ------------------------------------------------------------------

    /// Publish `data` on the network. Returns the base58 key under which it
    /// can be retrieved.
    pub async fn store(&self, ctx: &RoutingContext, data: Vec<u8>) -> Result<String, DhtError> {
        let key = storage::key_for(&data);
        let expiration = self.expiration_time(ctx, &key).await;
        let replication = Instant::now() + self.inner.config.replicate_time;
        self.inner
            .storage
            .store(key, data.clone(), replication, expiration, true)?;

        let target = NodeId::from_bytes(key);
        self.iterate(ctx, IterateKind::Store, &target, Some(data))
            .await?;
        Ok(target.to_base58())
    }

    /// Fetch the value for a base58 key, serving from the local store when
    /// possible and falling back to an iterative find-value.
    pub async fn get(&self, ctx: &RoutingContext, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        let target = NodeId::from_base58(key)?;
        if let Some(value) = self.inner.storage.retrieve(target.as_bytes()) {
            return Ok(Some(value));
        }
        let (value, _) = self
            .iterate(ctx, IterateKind::FindValue, &target, None)
            .await?;
        Ok(value)
    }

    /// Resolve a base58 identifier to a contact: ourselves, a routing-table
    /// entry, or the exact match of an iterative find-node.
    pub async fn find_node(
        &self,
        ctx: &RoutingContext,
        key: &str,
    ) -> Result<Option<Contact>, DhtError> {
        let target = NodeId::from_base58(key)?;
        let ht = self.table(ctx);

        if ht.origin_id() == &target {
            return Ok(Some(ht.origin().clone()));
        }

        let local = ht.closest_contacts(1, &target, &[]).await;
        if let Some(first) = local.first() {
            if first.id() == &target {
                return Ok(Some(first.contact().clone()));
            }
        }

        debug!(target = %target, "node not in routing table, iterating");
        let (_, closest) = self
            .iterate(ctx, IterateKind::FindNode, &target, None)
            .await?;
        if let Some(first) = closest.as_deref().and_then(|nodes| nodes.first()) {
            if first.id == Some(target) {
                return Ok(Some(first.clone()));
            }
        }
        Ok(None)
    }

    /// Invoke `method` on the node identified by the base58 `target`,
    /// locating it first. A local target is invoked in-process.
    pub async fn remote_procedure_call(
        &self,
        ctx: &RoutingContext,
        target: &str,
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>, DhtError> {
        let target_node = self
            .find_node(ctx, target)
            .await?
            .ok_or(DhtError::NodeNotFound)?;
        let ht = self.table(ctx);

        if target_node.id.as_ref() == Some(ht.origin_id()) {
            return self.inner.rpc.invoke(ht.origin(), method, &args);
        }

        let msg = Message::request(
            ht.origin().clone(),
            target_node,
            Payload::RpcRequest {
                method: method.to_string(),
                args,
            },
        );
        let mut future = self.inner.transport.send_request(msg).await?;
        match timeout(self.inner.config.message_timeout, future.result()).await {
            Ok(Some(response)) => {
                if let Some(node) = RouteNode::new(response.sender.clone()) {
                    self.add_node(ctx, node).await;
                }
                match response.payload {
                    Payload::RpcResponse {
                        success,
                        result,
                        error,
                    } => {
                        if success {
                            Ok(result)
                        } else {
                            Err(DhtError::Handler(error))
                        }
                    }
                    other => {
                        trace!(kind = other.kind(), "unexpected rpc response payload");
                        Err(DhtError::ChannelClosed)
                    }
                }
            }
            Ok(None) => Err(DhtError::ChannelClosed),
            Err(_) => {
                future.cancel();
                Err(DhtError::Timeout)
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing table maintenance
    // ------------------------------------------------------------------

    /// Record a peer in the context's routing table.
    ///
    /// Known peers are promoted to the tail of their bucket. A full bucket
    /// pings its least-recently-seen entry while holding the table lock:
    /// the incumbent survives by answering within the ping timeout and the
    /// newcomer is dropped; otherwise the incumbent is evicted and the
    /// newcomer appended at the tail.
    async fn add_node(&self, ctx: &RoutingContext, node: RouteNode) {
        let ht = self.table(ctx);
        if node.id() == ht.origin_id() {
            return;
        }

        let index = bucket_index(ht.origin_id(), node.id());
        let mut buckets = ht.buckets.lock().await;
        let bucket = &mut buckets[index];

        if bucket.promote(node.id()) {
            return;
        }
        if bucket.nodes.len() < MAX_CONTACTS {
            bucket.nodes.push(node);
            return;
        }

        let head = bucket.nodes[0].contact().clone();
        let ping = Message::ping(ht.origin().clone(), head);
        match self.inner.transport.send_request(ping).await {
            Err(e) => {
                debug!(bucket = index, error = %e, "eviction ping send failed");
                bucket.nodes.remove(0);
                bucket.nodes.push(node);
            }
            Ok(mut future) => {
                match timeout(self.inner.config.ping_timeout, future.result()).await {
                    Ok(Some(_)) => {
                        // Incumbent answered; it becomes the most recent.
                        let head_id = *bucket.nodes[0].id();
                        bucket.promote(&head_id);
                    }
                    Ok(None) | Err(_) => {
                        future.cancel();
                        trace!(bucket = index, "evicting unresponsive head");
                        bucket.nodes.remove(0);
                        bucket.nodes.push(node);
                    }
                }
            }
        }
    }

    /// Expiration deadline for `key`, scaled by routing-table density near
    /// it: keys in well-populated regions get the plain TTL, keys in sparse
    /// regions effectively never expire.
    async fn expiration_time(&self, ctx: &RoutingContext, key: &Key) -> Instant {
        let ht = self.table(ctx);
        let key_id = NodeId::from_bytes(*key);
        let bucket = bucket_index(&key_id, ht.origin_id());

        let mut total = 0;
        for i in 0..bucket {
            total += ht.total_nodes_in_bucket(i).await;
        }
        let closer = ht.nodes_closer_than(bucket, &key_id).await.len();
        let score = (total + closer).max(1);

        let now = Instant::now();
        if score > MAX_CONTACTS {
            return now + self.inner.config.expiration_time;
        }

        // Integer division, then the multiplier over the nanosecond count
        // read back as seconds; both inherited from the protocol.
        let multiplier = ((MAX_CONTACTS / score) as f64).exp();
        let seconds = (self.inner.config.expiration_time.as_nanos() as f64 * multiplier) as u64;
        now.checked_add(Duration::from_secs(seconds))
            .unwrap_or(now + FAR_FUTURE)
    }

    // ------------------------------------------------------------------
    // Iterative lookup
    // ------------------------------------------------------------------

    /// The α-parallel closest-first search loop shared by find-node,
    /// find-value, store, and bootstrap. Returns the found value (find-value
    /// hit) and/or the closest nodes seen, depending on the kind.
    async fn iterate(
        &self,
        ctx: &RoutingContext,
        kind: IterateKind,
        target: &NodeId,
        data: Option<Vec<u8>>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<Contact>>), DhtError> {
        let ht = self.table(ctx);
        let mut route_set = ht.closest_contacts(PARALLEL_CALLS, target, &[]).await;
        if route_set.is_empty() {
            return Ok((None, None));
        }
        let mut closest_id = *route_set.first().expect("route set checked non-empty").id();

        if kind == IterateKind::Bootstrap {
            let bucket = bucket_index(target, ht.origin_id());
            ht.reset_refresh_time(bucket).await;
        }

        let mut contacted: HashSet<NodeId> = HashSet::new();
        let mut query_rest = false;

        loop {
            // Contact the closest α uncontacted nodes (all of them once
            // query_rest is on).
            let mut selected = Vec::new();
            for node in route_set.nodes() {
                if !query_rest && selected.len() >= PARALLEL_CALLS {
                    break;
                }
                if contacted.contains(node.id()) {
                    continue;
                }
                selected.push(node.contact().clone());
            }

            let mut futures = Vec::new();
            let mut unreachable = Vec::new();
            for receiver in selected {
                let receiver_id = receiver.id.expect("route nodes carry identifiers");
                contacted.insert(receiver_id);

                let payload = match kind {
                    IterateKind::FindValue => Payload::FindValueRequest {
                        target: *target.as_bytes(),
                    },
                    _ => Payload::FindNodeRequest { target: *target },
                };
                let msg = Message::request(ht.origin().clone(), receiver, payload);
                match self.inner.transport.send_request(msg).await {
                    Ok(future) => futures.push(future),
                    Err(e) => {
                        // Unreachable now; it stays in the routing table in
                        // case it comes back.
                        debug!(error = %e, "send failed, dropping peer from route set");
                        unreachable.push(receiver_id);
                    }
                }
            }
            for id in &unreachable {
                route_set.remove(id);
            }

            for response in self.collect_responses(futures).await {
                if let Some(node) = RouteNode::new(response.sender.clone()) {
                    self.add_node(ctx, node).await;
                }
                if response.error.is_some() {
                    if let Some(id) = response.sender.id {
                        route_set.remove(&id);
                    }
                    continue;
                }
                match response.payload {
                    Payload::FindNodeResponse { closest } => {
                        if closest.first().and_then(|c| c.id.as_ref()) == Some(target) {
                            return Ok((None, Some(closest)));
                        }
                        route_set.extend(closest);
                    }
                    Payload::FindValueResponse { value, closest } => {
                        route_set.extend(closest);
                        if let Some(found) = value {
                            return Ok((Some(found), None));
                        }
                    }
                    other => {
                        trace!(kind = other.kind(), "unexpected payload in iteration")
                    }
                }
            }

            if !query_rest && route_set.is_empty() {
                return Ok((None, None));
            }

            route_set.sort();
            let Some(first) = route_set.first() else {
                return Ok((None, None));
            };

            if *first.id() == closest_id || query_rest {
                // No round brought us closer; finish per kind.
                match kind {
                    IterateKind::Bootstrap => {
                        if !query_rest {
                            query_rest = true;
                            continue;
                        }
                        return Ok((None, Some(route_set.contacts())));
                    }
                    IterateKind::FindNode | IterateKind::FindValue => {
                        return Ok((None, Some(route_set.contacts())));
                    }
                    IterateKind::Store => {
                        let data = data.unwrap_or_default();
                        for node in route_set.nodes().iter().take(MAX_CONTACTS) {
                            let msg = Message::request(
                                ht.origin().clone(),
                                node.contact().clone(),
                                Payload::StoreRequest { data: data.clone() },
                            );
                            match self.inner.transport.send_request(msg).await {
                                // Store is fire-and-forget; drop the future.
                                Ok(future) => future.cancel(),
                                Err(e) => {
                                    debug!(error = %e, "store send failed")
                                }
                            }
                        }
                        return Ok((None, None));
                    }
                }
            }
            closest_id = *first.id();
        }
    }

    /// Await one round of responses. Each future gets `MessageTimeout`, and
    /// the round as a whole gets the same deadline; anything resolving
    /// after the round deadline is discarded with the join set.
    async fn collect_responses(&self, futures: Vec<ResponseFuture>) -> Vec<Message> {
        if futures.is_empty() {
            return Vec::new();
        }
        let message_timeout = self.inner.config.message_timeout;

        let mut join = JoinSet::new();
        for mut future in futures {
            join.spawn(async move {
                match timeout(message_timeout, future.result()).await {
                    Ok(result) => result,
                    Err(_) => {
                        future.cancel();
                        None
                    }
                }
            });
        }

        let mut responses = Vec::new();
        let round = async {
            while let Some(joined) = join.join_next().await {
                if let Ok(Some(msg)) = joined {
                    responses.push(msg);
                }
            }
        };
        let _ = timeout(message_timeout, round).await;
        responses
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    async fn dispatch_messages(self, mut inbound: mpsc::Receiver<Message>) {
        let mut stopped = self.inner.transport.stopped();
        loop {
            tokio::select! {
                _ = stopped.changed() => {
                    if *stopped.borrow() {
                        break;
                    }
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    if !msg.is_for(&self.inner.origin) {
                        trace!(kind = msg.payload.kind(), "dropping message for another node");
                        continue;
                    }
                    let ctx = match &msg.receiver.id {
                        Some(id) => self
                            .context_for(id)
                            .expect("accepted message maps to a local identity"),
                        None => self.default_context(),
                    };
                    self.handle_message(&ctx, msg).await;
                }
            }
        }
        debug!("dispatcher stopped");
    }

    async fn handle_message(&self, ctx: &RoutingContext, msg: Message) {
        trace!(
            kind = msg.payload.kind(),
            from = %msg.sender.address,
            "inbound request"
        );
        match msg.payload.clone() {
            Payload::PingRequest => self.process_ping(ctx, &msg).await,
            Payload::FindNodeRequest { target } => {
                self.process_find_node(ctx, &msg, target).await
            }
            Payload::FindValueRequest { target } => {
                self.process_find_value(ctx, &msg, target).await
            }
            Payload::StoreRequest { data } => self.process_store(ctx, &msg, data).await,
            Payload::RpcRequest { method, args } => {
                self.process_rpc(ctx, &msg, method, args).await
            }
            other => {
                trace!(kind = other.kind(), "ignoring unexpected inbound payload")
            }
        }
    }

    async fn respond(&self, ctx: &RoutingContext, inbound: &Message, payload: Payload) {
        let reply = Message::response(inbound, self.table(ctx).origin().clone(), payload);
        if let Err(e) = self
            .inner
            .transport
            .send_response(inbound.request_id, reply)
            .await
        {
            warn!(
                kind = inbound.payload.kind(),
                to = %inbound.sender.address,
                error = %e,
                "failed to send response"
            );
        }
    }

    async fn record_sender(&self, ctx: &RoutingContext, msg: &Message) {
        if let Some(node) = RouteNode::new(msg.sender.clone()) {
            self.add_node(ctx, node).await;
        }
    }

    async fn process_ping(&self, ctx: &RoutingContext, msg: &Message) {
        self.respond(ctx, msg, Payload::PingResponse).await;
    }

    async fn process_find_node(&self, ctx: &RoutingContext, msg: &Message, target: NodeId) {
        self.record_sender(ctx, msg).await;
        let exclude: Vec<NodeId> = msg.sender.id.into_iter().collect();
        let closest = self
            .table(ctx)
            .closest_contacts(MAX_CONTACTS, &target, &exclude)
            .await;
        self.respond(
            ctx,
            msg,
            Payload::FindNodeResponse {
                closest: closest.contacts(),
            },
        )
        .await;
    }

    async fn process_find_value(&self, ctx: &RoutingContext, msg: &Message, target: Key) {
        self.record_sender(ctx, msg).await;
        match self.inner.storage.retrieve(&target) {
            Some(value) => {
                self.respond(
                    ctx,
                    msg,
                    Payload::FindValueResponse {
                        value: Some(value),
                        closest: Vec::new(),
                    },
                )
                .await;
            }
            None => {
                let target_id = NodeId::from_bytes(target);
                let exclude: Vec<NodeId> = msg.sender.id.into_iter().collect();
                let closest = self
                    .table(ctx)
                    .closest_contacts(MAX_CONTACTS, &target_id, &exclude)
                    .await;
                self.respond(
                    ctx,
                    msg,
                    Payload::FindValueResponse {
                        value: None,
                        closest: closest.contacts(),
                    },
                )
                .await;
            }
        }
    }

    async fn process_store(&self, ctx: &RoutingContext, msg: &Message, data: Vec<u8>) {
        self.record_sender(ctx, msg).await;
        let key = storage::key_for(&data);
        let expiration = self.expiration_time(ctx, &key).await;
        let replication = Instant::now() + self.inner.config.replicate_time;
        if let Err(e) = self
            .inner
            .storage
            .store(key, data, replication, expiration, false)
        {
            warn!(key = %hex::encode(&key[..8]), error = %e, "failed to store value");
        }
    }

    async fn process_rpc(
        &self,
        ctx: &RoutingContext,
        msg: &Message,
        method: String,
        args: Vec<Vec<u8>>,
    ) {
        self.record_sender(ctx, msg).await;
        let payload = match self.inner.rpc.invoke(&msg.sender, &method, &args) {
            Ok(result) => Payload::RpcResponse {
                success: true,
                result,
                error: String::new(),
            },
            Err(e) => Payload::RpcResponse {
                success: false,
                result: Vec::new(),
                error: e.to_string(),
            },
        };
        self.respond(ctx, msg, payload).await;
    }

    // ------------------------------------------------------------------
    // Maintenance timers
    // ------------------------------------------------------------------

    async fn run_timers(self) {
        let mut stopped = self.inner.transport.stopped();
        let mut ticker = interval(Duration::from_secs(1));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stopped.changed() => {
                    if *stopped.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_maintenance().await;
                }
            }
        }
        debug!("timer loop stopped");
    }

    /// One maintenance pass: refresh idle buckets, republish owned values,
    /// sweep expired entries. Per-bucket and per-key failures are logged
    /// and skipped.
    async fn run_maintenance(&self) {
        let keys = self.inner.storage.keys_ready_to_replicate();

        for index in 0..self.inner.tables.len() {
            let ctx = RoutingContext { index };
            let ht = self.table(&ctx);

            for bucket in 0..ID_BITS {
                if ht.refresh_time(bucket).await.elapsed() > self.inner.config.refresh_time {
                    let target = ht.random_id_in_bucket(bucket);
                    if let Err(e) = self
                        .iterate(&ctx, IterateKind::Bootstrap, &target, None)
                        .await
                    {
                        debug!(bucket, error = %e, "bucket refresh failed");
                    }
                }
            }

            for key in &keys {
                let Some(value) = self.inner.storage.retrieve(key) else {
                    continue;
                };
                let target = NodeId::from_bytes(*key);
                if let Err(e) = self
                    .iterate(&ctx, IterateKind::Store, &target, Some(value))
                    .await
                {
                    debug!(key = %hex::encode(&key[..8]), error = %e, "replication failed");
                }
            }
        }

        self.inner.storage.expire_keys();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Address;
    use crate::id::ID_LENGTH;
    use crate::storage::MemoryStorage;
    use crate::transport::UdpTransport;

    async fn engine_with(config: DhtConfig, origin_id: NodeId) -> Dht {
        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0")
                .await
                .expect("bind loopback"),
        );
        let origin = Origin::new(vec![origin_id], transport.local_address());
        let storage = Arc::new(MemoryStorage::new(config.replicate_time));
        Dht::new(storage, origin, transport, RpcRegistry::default(), config)
    }

    /// The UDP discard port: sends succeed, nothing ever answers.
    fn dead_contact(id: NodeId) -> Contact {
        Contact::new(id, Address::new("127.0.0.1:9").unwrap())
    }

    fn id_with(bytes: &[(usize, u8)]) -> NodeId {
        let mut id = [0u8; ID_LENGTH];
        for (pos, value) in bytes {
            id[*pos] = *value;
        }
        NodeId::from_bytes(id)
    }

    /// Place a contact straight into its bucket, bypassing the eviction
    /// protocol.
    async fn insert_direct(dht: &Dht, ctx: &RoutingContext, contact: Contact) {
        let ht = dht.table(ctx);
        let node = RouteNode::new(contact).expect("contact has an id");
        let index = bucket_index(ht.origin_id(), node.id());
        let mut buckets = ht.buckets.lock().await;
        buckets[index].nodes.push(node);
    }

    /// Pack the keyspace around `key` so its density score exceeds the
    /// bucket capacity: the origin differs from the key only in the last
    /// bit, making every inserted peer count toward the score.
    async fn dense_engine_for(key: Key, config: DhtConfig) -> Dht {
        let mut origin_bytes = key;
        origin_bytes[ID_LENGTH - 1] ^= 1;
        let dht = engine_with(config, NodeId::from_bytes(origin_bytes)).await;
        let ctx = dht.default_context();
        for i in 0..=(MAX_CONTACTS as u8) {
            let mut bytes = origin_bytes;
            bytes[0] ^= i + 1;
            insert_direct(&dht, &ctx, dead_contact(NodeId::from_bytes(bytes))).await;
        }
        dht
    }

    #[tokio::test]
    async fn expiration_scales_with_keyspace_density() {
        let config = DhtConfig {
            expiration_time: Duration::from_secs(60),
            ..Default::default()
        };
        let key = storage::key_for(b"density probe");

        // Empty table: score 1, deadline saturates far past the plain TTL.
        let mut origin_bytes = key;
        origin_bytes[ID_LENGTH - 1] ^= 1;
        let sparse = engine_with(config.clone(), NodeId::from_bytes(origin_bytes)).await;
        let ctx = sparse.default_context();
        let sparse_deadline = sparse.expiration_time(&ctx, &key).await;
        assert!(sparse_deadline > Instant::now() + Duration::from_secs(3600));

        // Dense keyspace: the plain TTL applies.
        let dense = dense_engine_for(key, config).await;
        let ctx = dense.default_context();
        let dense_deadline = dense.expiration_time(&ctx, &key).await;
        let now = Instant::now();
        assert!(dense_deadline > now + Duration::from_secs(58));
        assert!(dense_deadline < now + Duration::from_secs(62));
    }

    #[tokio::test]
    async fn stored_values_expire_after_their_deadline() {
        let config = DhtConfig {
            expiration_time: Duration::from_secs(2),
            message_timeout: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let data = b"soon gone".to_vec();
        let key = storage::key_for(&data);
        let dht = dense_engine_for(key, config).await;
        let ctx = dht.default_context();

        let listener = dht.clone();
        tokio::spawn(async move {
            let _ = listener.listen().await;
        });

        let key_b58 = dht.store(&ctx, data.clone()).await.expect("store");
        assert_eq!(dht.get(&ctx, &key_b58).await.expect("get"), Some(data));

        // The sweep runs every second; the entry is gone after its 2 s TTL
        // and the miss falls through to an iterative find-value.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(dht.get(&ctx, &key_b58).await.expect("get"), None);
        dht.disconnect();
    }

    #[tokio::test]
    async fn full_bucket_evicts_unresponsive_head() {
        let config = DhtConfig {
            ping_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let dht = engine_with(config, id_with(&[])).await;
        let ctx = dht.default_context();

        // Twenty unreachable peers, all in bucket 0.
        let mut ids = Vec::new();
        for i in 0..MAX_CONTACTS as u8 {
            let id = id_with(&[(0, 0x80 + i)]);
            ids.push(id);
            insert_direct(&dht, &ctx, dead_contact(id)).await;
        }
        assert_eq!(dht.num_nodes(&ctx).await, MAX_CONTACTS);

        let newcomer = id_with(&[(0, 0x80), (1, 0xff)]);
        dht.add_node(&ctx, RouteNode::new(dead_contact(newcomer)).unwrap())
            .await;

        let ht = dht.table(&ctx);
        let buckets = ht.buckets.lock().await;
        let bucket_ids: Vec<NodeId> = buckets[0].nodes.iter().map(|n| *n.id()).collect();
        assert_eq!(bucket_ids.len(), MAX_CONTACTS);
        assert!(!bucket_ids.contains(&ids[0]), "head should be evicted");
        assert_eq!(bucket_ids.last(), Some(&newcomer), "newcomer joins at tail");
    }

    #[tokio::test]
    async fn full_bucket_keeps_responsive_head() {
        let config = DhtConfig {
            ping_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let a = engine_with(config, id_with(&[])).await;
        let ctx = a.default_context();
        let a_runner = a.clone();
        tokio::spawn(async move {
            let _ = a_runner.listen().await;
        });

        // B answers pings; its identity lands in A's bucket 0.
        let b = engine_with(DhtConfig::default(), id_with(&[(0, 0x80)])).await;
        let b_contact = b.table(&b.default_context()).origin().clone();
        let b_id = *b.table(&b.default_context()).origin_id();
        let b_runner = b.clone();
        tokio::spawn(async move {
            let _ = b_runner.listen().await;
        });

        insert_direct(&a, &ctx, b_contact).await;
        for i in 1..MAX_CONTACTS as u8 {
            insert_direct(&a, &ctx, dead_contact(id_with(&[(0, 0x80 + i)]))).await;
        }

        let newcomer = id_with(&[(0, 0xa0), (1, 0xff)]);
        a.add_node(&ctx, RouteNode::new(dead_contact(newcomer)).unwrap())
            .await;

        let ht = a.table(&ctx);
        let buckets = ht.buckets.lock().await;
        let bucket_ids: Vec<NodeId> = buckets[0].nodes.iter().map(|n| *n.id()).collect();
        assert_eq!(bucket_ids.len(), MAX_CONTACTS);
        assert!(!bucket_ids.contains(&newcomer), "newcomer is dropped");
        assert_eq!(bucket_ids.last(), Some(&b_id), "responder moves to tail");

        a.disconnect();
        b.disconnect();
    }

    #[tokio::test]
    async fn add_node_places_entries_in_their_buckets() {
        let dht = engine_with(DhtConfig::default(), id_with(&[])).await;
        let ctx = dht.default_context();

        for i in 1..=50u8 {
            let id = id_with(&[(0, i), (1, i.wrapping_mul(7))]);
            dht.add_node(&ctx, RouteNode::new(dead_contact(id)).unwrap())
                .await;
        }

        let ht = dht.table(&ctx);
        let buckets = ht.buckets.lock().await;
        let mut seen = HashSet::new();
        for (index, bucket) in buckets.iter().enumerate() {
            assert!(bucket.nodes.len() <= MAX_CONTACTS);
            for node in &bucket.nodes {
                assert_eq!(bucket_index(ht.origin_id(), node.id()), index);
                assert!(seen.insert(*node.id()), "ids unique across buckets");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn re_adding_a_known_peer_promotes_it() {
        let dht = engine_with(DhtConfig::default(), id_with(&[])).await;
        let ctx = dht.default_context();

        let a = id_with(&[(0, 0x81)]);
        let b = id_with(&[(0, 0x82)]);
        let c = id_with(&[(0, 0x83)]);
        for id in [a, b, c] {
            dht.add_node(&ctx, RouteNode::new(dead_contact(id)).unwrap())
                .await;
        }
        dht.add_node(&ctx, RouteNode::new(dead_contact(a)).unwrap())
            .await;

        let ht = dht.table(&ctx);
        let buckets = ht.buckets.lock().await;
        let bucket_ids: Vec<NodeId> = buckets[0].nodes.iter().map(|n| *n.id()).collect();
        assert_eq!(bucket_ids, vec![b, c, a]);
    }

    #[tokio::test]
    async fn iterate_with_an_empty_table_returns_nothing() {
        let dht = engine_with(DhtConfig::default(), id_with(&[])).await;
        let ctx = dht.default_context();

        let (value, closest) = dht
            .iterate(&ctx, IterateKind::FindNode, &NodeId::random(), None)
            .await
            .expect("iterate");
        assert!(value.is_none());
        assert!(closest.is_none());
    }
}

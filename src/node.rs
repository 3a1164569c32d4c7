use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::identifier::{Contact, Distance, Key, NodeID};
use crate::core::routing_table::{InsertResult, RoutingTable};
use crate::core::storage::{Storage, Value};
use crate::core::{ALPHA, K, NUM_BUCKETS};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::lookup::{LookupKind, LookupOutcome, Shortlist};
use crate::protocol::{Envelope, Payload, RpcKind};

/// The well-known bootstrap peer's fixed identifier.
pub const RENDEZVOUS_ID: &str = "00000000000000000000000000000000ffffffff";

/// Where the rendezvous node lives in the reference deployment.
pub const RENDEZVOUS_ADDR: &str = "10.0.8.3:8080";

const BOOTSTRAP_RETRY: Duration = Duration::from_secs(1);
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// A running DHT node: routing table, value store, and the dispatcher bound
/// to its UDP socket. Clones are cheap handles onto the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    me: Contact,
    routing_table: Mutex<RoutingTable>,
    storage: Mutex<Storage>,
    dispatcher: Dispatcher,
}

impl Node {
    /// Bind `local_addr` and join the network through `rendezvous`, if any.
    /// A node whose own address equals the rendezvous address self-elects as
    /// the rendezvous (taking its fixed ID) and skips the join.
    pub async fn init(
        local_addr: SocketAddr,
        rendezvous: Option<SocketAddr>,
    ) -> anyhow::Result<Node> {
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let local_addr = socket.local_addr()?;

        let node_id = match rendezvous {
            Some(addr) if addr == local_addr => NodeID::from_hex(RENDEZVOUS_ID)?,
            _ => NodeID::random(),
        };
        let me = Contact::new(node_id, local_addr);
        info!(id = %node_id.short_hex(), addr = %local_addr, "node starting");

        let node = Node {
            inner: Arc::new(NodeInner {
                me,
                routing_table: Mutex::new(RoutingTable::new(me)),
                storage: Mutex::new(Storage::new()),
                dispatcher: Dispatcher::new(Arc::clone(&socket)),
            }),
        };

        tokio::spawn(node.clone().recv_loop(socket));
        tokio::spawn(node.clone().sweep_loop());
        tokio::spawn(node.clone().refresh_loop());

        if let Some(addr) = rendezvous {
            if addr != local_addr {
                node.join(addr).await?;
            }
        }
        Ok(node)
    }

    /// Our own identity and address.
    pub fn contact(&self) -> Contact {
        self.inner.me
    }

    /// PING a peer; `true` when it answers within the RPC timeout.
    pub async fn ping(&self, peer: &Contact) -> bool {
        match self
            .inner
            .dispatcher
            .call(peer.address, RpcKind::Ping, self.inner.me, Payload::empty())
            .await
        {
            Ok(_) => true,
            Err(err) => {
                debug!(peer = %peer.node_id.short_hex(), %err, "ping failed");
                false
            }
        }
    }

    /// Hash `value`, place it on the K closest nodes, and return its key.
    pub async fn store(&self, value: &[u8]) -> anyhow::Result<Key> {
        if value.is_empty() {
            anyhow::bail!("refusing to store an empty value");
        }
        let key = NodeID::hash_of(value);
        let targets = self.node_lookup(key).await;

        // the storing node keeps a copy as well, so a one-node network works
        self.inner.storage.lock().await.insert(key, value.to_vec());

        let mut stores = JoinSet::new();
        for peer in targets {
            let node = self.clone();
            let value = value.to_vec();
            stores.spawn(async move {
                let payload = Payload::with_key_value(key, value);
                let outcome = node
                    .inner
                    .dispatcher
                    .call(peer.address, RpcKind::Store, node.inner.me, payload)
                    .await;
                (peer, outcome)
            });
        }
        while let Some(joined) = stores.join_next().await {
            if let Ok((peer, Err(err))) = joined {
                warn!(peer = %peer.node_id.short_hex(), %err, "store not acknowledged, dropping peer");
                self.remove_contact(peer.node_id).await;
            }
        }
        Ok(key)
    }

    /// Fetch the value stored under `key`. A local hit answers immediately
    /// without touching the network; a remote hit is cached locally and
    /// pushed to the nearest probed peer that missed it.
    pub async fn find_value(&self, key: Key) -> Option<Value> {
        if let Some(value) = self.inner.storage.lock().await.serve(&key) {
            return Some(value);
        }

        match self.lookup(key, LookupKind::Value).await {
            LookupOutcome::Value {
                value,
                nearest_miss,
            } => {
                self.inner.storage.lock().await.insert(key, value.clone());
                if let Some(peer) = nearest_miss {
                    let payload = Payload::with_key_value(key, value.clone());
                    if let Err(err) = self
                        .inner
                        .dispatcher
                        .call(peer.address, RpcKind::Store, self.inner.me, payload)
                        .await
                    {
                        debug!(peer = %peer.node_id.short_hex(), %err, "cache push failed");
                    }
                }
                Some(value)
            }
            LookupOutcome::Closest(_) => None,
        }
    }

    /// Iteratively converge on the K closest known contacts to `target`.
    pub async fn node_lookup(&self, target: NodeID) -> Vec<Contact> {
        match self.lookup(target, LookupKind::Node).await {
            LookupOutcome::Closest(contacts) => contacts,
            LookupOutcome::Value { .. } => unreachable!("node lookups never yield a value"),
        }
    }

    /// The α-parallel convergence loop shared by node- and value-lookups.
    ///
    /// Rounds are serial; within a round up to α probes are in flight at
    /// once and their results merge in arrival order. The loop ends when a
    /// round brings nothing closer than the best contact seen so far, or
    /// when every shortlist entry has been probed.
    async fn lookup(&self, target: NodeID, kind: LookupKind) -> LookupOutcome {
        let seed = {
            let table = self.inner.routing_table.lock().await;
            table.find_closest(&target, ALPHA)
        };
        let mut shortlist = Shortlist::new(self.inner.me.node_id, target, seed);
        let mut closest = Distance::MAX;

        loop {
            let wave = shortlist.next_unprobed(ALPHA);
            if wave.is_empty() {
                break;
            }

            let mut in_flight = JoinSet::new();
            for peer in wave {
                shortlist.mark_probed(peer.node_id);
                let node = self.clone();
                in_flight.spawn(async move {
                    let request_kind = match kind {
                        LookupKind::Node => RpcKind::FindNode,
                        LookupKind::Value => RpcKind::FindValue,
                    };
                    let reply = node
                        .inner
                        .dispatcher
                        .call(
                            peer.address,
                            request_kind,
                            node.inner.me,
                            Payload::with_key(target),
                        )
                        .await;
                    (peer, reply)
                });
            }

            let mut progress = false;
            while let Some(joined) = in_flight.join_next().await {
                let Ok((peer, reply)) = joined else { continue };
                match reply {
                    Ok(envelope) => {
                        self.add_contact(peer).await;

                        if kind == LookupKind::Value {
                            if let Some(value) = envelope.payload.value {
                                // first value wins; outstanding probes become no-ops
                                return LookupOutcome::Value {
                                    value,
                                    nearest_miss: shortlist.nearest_non_holder(),
                                };
                            }
                            shortlist.record_non_holder(peer);
                        }

                        shortlist.merge(envelope.payload.contacts.unwrap_or_default());
                        if let Some(best) = shortlist.closest_distance() {
                            if best < closest {
                                closest = best;
                                progress = true;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(peer = %peer.node_id.short_hex(), %err, "lookup probe failed");
                        shortlist.remove(peer.node_id);
                        self.remove_contact(peer.node_id).await;
                    }
                }
            }

            if !progress {
                break;
            }
        }

        LookupOutcome::Closest(shortlist.into_entries())
    }

    /// Offer a freshly observed peer to the routing table. A full bucket
    /// costs a liveness probe of its least-recently-seen entry: if that one
    /// still answers it keeps its slot and the newcomer is dropped.
    pub async fn add_contact(&self, peer: Contact) {
        let result = {
            let mut table = self.inner.routing_table.lock().await;
            table.try_insert(peer)
        };
        if let InsertResult::Full { lru } = result {
            // no lock is held while the probe is in flight
            let alive = self.ping(&lru).await;
            let mut table = self.inner.routing_table.lock().await;
            table.resolve_probe(lru, peer, alive);
        }
    }

    async fn remove_contact(&self, id: NodeID) {
        self.inner.routing_table.lock().await.remove_contact(id);
    }

    /// Whether `id` is currently in the routing table.
    pub async fn knows(&self, id: NodeID) -> bool {
        self.inner.routing_table.lock().await.contains(id)
    }

    /// Whether the local store currently holds an unexpired value for `key`.
    pub async fn has_local(&self, key: Key) -> bool {
        self.inner.storage.lock().await.contains(&key)
    }

    /// Ping the rendezvous node until it answers, add it, look our own ID up
    /// to meet our neighbours, then warm the buckets we learned about.
    async fn join(&self, rendezvous_addr: SocketAddr) -> anyhow::Result<()> {
        let assumed = Contact::new(NodeID::from_hex(RENDEZVOUS_ID)?, rendezvous_addr);
        let seed = loop {
            match self
                .inner
                .dispatcher
                .call(
                    rendezvous_addr,
                    RpcKind::Ping,
                    self.inner.me,
                    Payload::empty(),
                )
                .await
            {
                Ok(reply) => {
                    info!("rendezvous node is live, joining network");
                    // prefer the identity it advertises over the conventional one
                    break match reply.sender {
                        Some(sender) => Contact::new(sender.node_id, rendezvous_addr),
                        None => assumed,
                    };
                }
                Err(err) => {
                    warn!(%err, "rendezvous node is not live");
                    sleep(BOOTSTRAP_RETRY).await;
                }
            }
        };

        self.add_contact(seed).await;
        self.node_lookup(self.inner.me.node_id).await;
        self.refresh_buckets(false).await;
        Ok(())
    }

    /// Node-lookup on a random ID inside each bucket. At join time only the
    /// buckets that already hold a contact are worth aiming at; the periodic
    /// pass walks the full range.
    async fn refresh_buckets(&self, include_empty: bool) {
        let indexes: Vec<usize> = if include_empty {
            (1..NUM_BUCKETS).collect()
        } else {
            let table = self.inner.routing_table.lock().await;
            table
                .non_empty_buckets()
                .into_iter()
                .filter(|&i| i >= 1)
                .collect()
        };
        for index in indexes {
            let target = self.inner.me.node_id.refresh_id_in_bucket(index);
            self.node_lookup(target).await;
        }
    }

    /// Read datagrams forever, resolving replies and spawning a handler task
    /// per inbound request so a slow probe never stalls the socket.
    async fn recv_loop(self, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; 8192];
        loop {
            let (len, src_addr) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(%err, "recv failed");
                    continue;
                }
            };
            let envelope = match Envelope::decode(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(err) => {
                    debug!(%src_addr, %err, "dropping undecodable datagram");
                    continue;
                }
            };
            if let Some(request) = self.inner.dispatcher.route(envelope) {
                let node = self.clone();
                tokio::spawn(async move {
                    node.handle_request(request, src_addr).await;
                });
            }
        }
    }

    /// Serve one inbound request and reply on the shared socket.
    async fn handle_request(&self, request: Envelope, src_addr: SocketAddr) {
        // routing tables warm up passively: the sender goes in first,
        // under the address we actually saw it at
        if let Some(sender) = request.sender {
            self.add_contact(Contact::new(sender.node_id, src_addr)).await;
        }
        let Some(request_id) = request.id else {
            debug!(%src_addr, "request without an id dropped");
            return;
        };

        let reply_payload = match request.kind {
            RpcKind::Ping => Payload::empty(),
            RpcKind::Store => {
                let (Some(key), Some(value)) = (request.payload.key, request.payload.value) else {
                    debug!(%src_addr, "store without key and value dropped");
                    return;
                };
                self.inner.storage.lock().await.insert(key, value);
                Payload::empty()
            }
            RpcKind::FindNode => {
                let Some(target) = request.payload.key else {
                    debug!(%src_addr, "find_node without a target dropped");
                    return;
                };
                Payload::with_contacts(self.closest_for_reply(&target).await)
            }
            RpcKind::FindValue => {
                let Some(key) = request.payload.key else {
                    debug!(%src_addr, "find_value without a key dropped");
                    return;
                };
                let held = self.inner.storage.lock().await.serve(&key);
                match held {
                    Some(value) => Payload::with_value(value),
                    None => Payload::with_contacts(self.closest_for_reply(&key).await),
                }
            }
            // replies are routed to waiters, never here
            RpcKind::Ok => return,
        };

        let reply = Envelope::reply(request_id, self.inner.me, reply_payload);
        if let Err(err) = self.inner.dispatcher.send(src_addr, &reply).await {
            debug!(%src_addr, %err, "reply send failed");
        }
    }

    async fn closest_for_reply(&self, target: &NodeID) -> Vec<Contact> {
        self.inner.routing_table.lock().await.find_closest(target, K)
    }

    /// Periodically reap expired records from the value store.
    async fn sweep_loop(self) {
        let period = {
            let storage = self.inner.storage.lock().await;
            storage.ttl() / 2
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let evicted = self.inner.storage.lock().await.remove_expired();
            if evicted > 0 {
                debug!(evicted, "expired records swept");
            }
        }
    }

    /// Hourly pass over every bucket to keep routing state from going stale.
    async fn refresh_loop(self) {
        let mut ticker = interval(BUCKET_REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the join already warmed the table; skip the immediate first tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refresh_buckets(true).await;
        }
    }
}

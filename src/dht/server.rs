//! The DHT node's event loop: dispatches inbound KRPC packets, answers
//! queries, correlates responses to outbound queries, and runs periodic
//! routing-table maintenance.
//!
//! Everything here runs on a single task. There is no internal locking:
//! the loop in [`Server::run`] owns `&mut self` for the whole of its
//! lifetime, and every `.await` point is an explicit suspension the reader
//! can see (a `tokio::select!` branch), not a hidden yield inside a mutex
//! guard.
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use super::id::NodeId;
use super::krpc::{self, Packet, ProtocolError, Query, Response};
use super::node::{self, Node as RoutingNode};
use super::peer::{Peer, PeerIndex};
use super::routing::{RoutingTable, K};
use super::token::TokenTable;
use super::transaction::{PendingQuery, TransactionTable};
use super::transport::{Transport, TransportError};
use crate::config::Config;

/// How many `find_node` queries to fire at each bootstrap node once it
/// resolves, each with a different random target, to populate the routing
/// table faster than a single query would.
const BOOTSTRAP_QUERIES_PER_NODE: usize = 5;

/// How long outbound issuance pauses after the transport signals local
/// bandwidth exhaustion, before the next send is attempted.
const BACKPRESSURE_PAUSE: Duration = Duration::from_secs(1);

/// A peer this node learned about via `announce_peer`, emitted to whoever
/// is using this DHT node to locate peers for a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAnnounced {
    pub info_hash: NodeId,
    pub peer: SocketAddrV4,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] std::io::Error),
}

/// A running Mainline DHT node.
pub struct Server {
    config: Config,
    transport: Transport,
    local_id: NodeId,
    routing_table: RoutingTable,
    peers: PeerIndex,
    transactions: TransactionTable,
    tokens: TokenTable,
    events: mpsc::Sender<PeerAnnounced>,
}

impl Server {
    /// Binds the UDP socket and constructs a fresh server with a randomly
    /// generated local id. Returns the server paired with the receiving end
    /// of its announced-peer event channel.
    pub async fn bind(config: Config) -> Result<(Self, mpsc::Receiver<PeerAnnounced>), ServerError> {
        let transport = Transport::bind(config.address, config.port)
            .await
            .map_err(ServerError::Bind)?;
        let local_id = NodeId::random();
        let (tx, rx) = mpsc::channel(1024);
        let max_routing_table_size = config.max_routing_table_size;
        let server = Self {
            config,
            transport,
            local_id,
            routing_table: RoutingTable::new(local_id, max_routing_table_size),
            peers: PeerIndex::new(),
            transactions: TransactionTable::new(),
            tokens: TokenTable::new(),
            events: tx,
        };
        Ok((server, rx))
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn routing_table_len(&self) -> usize {
        self.routing_table.len()
    }

    /// Runs the event loop until `shutdown` reports `true`.
    ///
    /// Each iteration suspends at exactly one of: a datagram arriving, the
    /// maintenance tick firing, or a shutdown signal — never inside a
    /// handler.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.bootstrap().await;

        let mut maintenance = interval(self.config.maintenance_interval);
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                result = self.transport.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from, Instant::now()).await,
                        Err(err) => warn!(%err, "udp recv failed"),
                    }
                }
                _ = maintenance.tick() => {
                    self.run_maintenance(Instant::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    #[instrument(skip(self, bytes), fields(%from), level = "debug")]
    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddrV4, now: Instant) {
        // Port 0 can't be a real reply address; silently drop rather than
        // ever dialogue with an unreachable source.
        if from.port() == 0 {
            return;
        }
        match krpc::classify_and_parse(bytes) {
            Ok(Packet::Query { transaction_id, query }) => {
                self.on_query(transaction_id, query, from, now).await;
            }
            Ok(Packet::Response { transaction_id, response }) => {
                self.on_response(transaction_id, response, from, now).await;
            }
            Ok(Packet::Error { error, .. }) => {
                debug!(?error, "peer reported a protocol error");
            }
            Ok(Packet::MalformedQuery { transaction_id }) => {
                debug!(%from, "replying with protocol error to malformed query");
                let error = ProtocolError::new(ProtocolError::PROTOCOL, "Protocol Error");
                let bytes = krpc::encode_error(&transaction_id, &error);
                self.send(&bytes, from, "failed to send protocol error reply").await;
            }
            Err(err) => {
                // Genuinely undecodable bencode: we don't even have a
                // transaction id to reply to, and replying to noise would
                // just be free amplification. Drop silently.
                debug!(%err, "dropping unparseable datagram");
            }
        }
    }

    async fn on_query(
        &mut self,
        transaction_id: Vec<u8>,
        query: Query,
        from: SocketAddrV4,
        now: Instant,
    ) {
        if node::is_valid_addr(&from) {
            self.routing_table.add(query.querying_id(), from, now);
        }

        // Spoofing only changes the `id` a find_node reply carries; every
        // other query still answers as our true local id.
        let mut reply_id = self.local_id;

        let reply = match &query {
            Query::Ping { .. } => Ok(Response::Ping { id: self.local_id }),
            Query::FindNode { id: querier_id, target } => {
                let nodes = self
                    .routing_table
                    .closest_nodes(target, K)
                    .into_iter()
                    .map(|n| (n.id, n.addr))
                    .collect();
                if self.config.enable_neighbor_spoofing {
                    reply_id = NodeId::spoof_neighbor(&self.local_id, querier_id);
                }
                Ok(Response::FindNode {
                    id: reply_id,
                    nodes,
                })
            }
            Query::GetPeers { info_hash, .. } => {
                let values = self.peers.get_peers(info_hash, now);
                let token = self.tokens.issue(from, now);
                if values.is_empty() {
                    let nodes = self
                        .routing_table
                        .closest_nodes(info_hash, K)
                        .into_iter()
                        .map(|n| (n.id, n.addr))
                        .collect();
                    Ok(Response::GetPeers {
                        id: self.local_id,
                        token,
                        nodes,
                        values: Vec::new(),
                    })
                } else {
                    Ok(Response::GetPeers {
                        id: self.local_id,
                        token,
                        nodes: Vec::new(),
                        values: values.into_iter().map(|p| p.addr).collect(),
                    })
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => {
                // A crawler (enable_neighbor_spoofing) accepts announces
                // without a token; a plain/strict node requires one minted
                // by a prior get_peers to this address.
                let token_ok =
                    self.config.enable_neighbor_spoofing || self.tokens.validate(token, from, now);
                if token_ok {
                    let announced_port = if *implied_port { from.port() } else { *port };
                    let peer_addr = SocketAddrV4::new(*from.ip(), announced_port);
                    self.peers.announce(*info_hash, Peer::new(peer_addr), now);
                    let _ = self
                        .events
                        .try_send(PeerAnnounced {
                            info_hash: *info_hash,
                            peer: peer_addr,
                        });
                    Ok(Response::AnnouncePeer { id: self.local_id })
                } else {
                    Err(ProtocolError::new(ProtocolError::PROTOCOL, "Bad token"))
                }
            }
        };

        let bytes = match reply {
            Ok(response) => krpc::encode_response(&transaction_id, &reply_id, &response),
            Err(error) => krpc::encode_error(&transaction_id, &error),
        };
        self.send(&bytes, from, "failed to reply to query").await;
    }

    /// Sends `bytes` to `target`, pausing outbound issuance for
    /// [`BACKPRESSURE_PAUSE`] if the transport signals local bandwidth
    /// exhaustion rather than treating it like any other send failure.
    async fn send(&self, bytes: &[u8], target: SocketAddrV4, context: &'static str) {
        match self.transport.send_to(bytes, target).await {
            Ok(()) => {}
            Err(TransportError::Backpressure(signal)) => {
                warn!(?signal, %target, "send backpressure, pausing outbound issuance");
                tokio::time::sleep(BACKPRESSURE_PAUSE).await;
            }
            Err(err) => warn!(%err, %target, "{context}"),
        }
    }

    async fn on_response(
        &mut self,
        transaction_id: Vec<u8>,
        payload: krpc::ResponsePayload,
        from: SocketAddrV4,
        now: Instant,
    ) {
        let Ok(tid): Result<[u8; 2], _> = transaction_id.as_slice().try_into() else {
            debug!("response carried a non-2-byte transaction id, ignoring");
            return;
        };
        let Some((expected, target_id)) = self.transactions.take(&tid, from) else {
            debug!(%from, "response to unknown or already-resolved transaction");
            return;
        };

        if node::is_valid_addr(&from) {
            self.routing_table.add(payload.id, from, now);
        }

        let response = payload.into_response(expected);
        match response {
            Response::FindNode { nodes, .. } => {
                self.learn_nodes(nodes, now);
            }
            Response::GetPeers { nodes, values, .. } => {
                self.learn_nodes(nodes, now);
                if !values.is_empty() {
                    if let Some(info_hash) = target_id {
                        for peer in values {
                            let _ = self.events.try_send(PeerAnnounced {
                                info_hash,
                                peer,
                            });
                        }
                    }
                }
            }
            Response::Ping { .. } | Response::AnnouncePeer { .. } => {}
        }
    }

    /// Folds newly-learned nodes from a `find_node`/`get_peers` response
    /// into the routing table, skipping ourselves and anything unroutable.
    fn learn_nodes(&mut self, nodes: Vec<(NodeId, SocketAddrV4)>, now: Instant) {
        for (id, addr) in nodes {
            if id != self.local_id && node::is_valid_addr(&addr) {
                self.routing_table.add(id, addr, now);
            }
        }
    }

    /// Joins the DHT (or rejoins, if the routing table has gone empty) by
    /// querying every configured bootstrap node for nodes near our own id.
    #[instrument(skip(self))]
    async fn bootstrap(&mut self) {
        if !self.routing_table.is_empty() {
            return;
        }
        let bootstrap_nodes = self.config.bootstrap_nodes.clone();
        for node in &bootstrap_nodes {
            let host_port = format!("{}:{}", node.host, node.port);
            match tokio::net::lookup_host(&host_port).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let std::net::SocketAddr::V4(addr) = addr {
                            for _ in 0..BOOTSTRAP_QUERIES_PER_NODE {
                                self.send_find_node(addr, NodeId::random()).await;
                            }
                        }
                    }
                }
                Err(err) => warn!(%err, host = %host_port, "failed to resolve bootstrap node"),
            }
        }
    }

    /// Pings every node that's gone quiet for 15-20 minutes and drops every
    /// node that's been quiet for 20+, then reaps expired bookkeeping
    /// entries. Bootstraps again first if the table has gone empty.
    #[instrument(skip(self))]
    async fn run_maintenance(&mut self, now: Instant) {
        self.bootstrap().await;

        let unheard = self.routing_table.unheard_nodes(now);
        for node in unheard {
            self.send_ping(node.addr).await;
        }

        let evicted = self.routing_table.remove_offline_nodes(now);
        if evicted > 0 {
            debug!(evicted, "evicted offline nodes");
        }

        let stale_targets = self
            .routing_table
            .stale_bucket_targets(now, self.config.maintenance_interval);
        for target in stale_targets {
            let closest = self.routing_table.closest_nodes(&target, 1);
            if let Some(node) = closest.into_iter().next() {
                self.send_find_node(node.addr, target).await;
            }
        }

        self.transactions.sweep_expired(now);
        self.tokens.rotate_if_due(now);
        self.peers.sweep_expired(now);
    }

    async fn send_ping(&mut self, target: SocketAddrV4) {
        let now = Instant::now();
        let tid = self.transactions.begin(PendingQuery::Ping, target, None, now);
        let query = Query::Ping { id: self.local_id };
        let bytes = krpc::encode_query(&tid, &self.local_id, &query);
        self.send(&bytes, target, "failed to send ping").await;
    }

    async fn send_find_node(&mut self, target: SocketAddrV4, want: NodeId) {
        let now = Instant::now();
        let tid = self
            .transactions
            .begin(PendingQuery::FindNode, target, Some(want), now);
        let query = Query::FindNode {
            id: self.local_id,
            target: want,
        };
        let bytes = krpc::encode_query(&tid, &self.local_id, &query);
        self.send(&bytes, target, "failed to send find_node").await;
    }

    /// Looks up peers for `info_hash` by querying the `count` closest known
    /// nodes; any peers already known locally are returned immediately
    /// without a network round-trip.
    #[instrument(skip(self))]
    pub async fn get_peers(&mut self, info_hash: NodeId, count: usize) -> Vec<SocketAddrV4> {
        let now = Instant::now();
        let local = self.peers.get_peers(&info_hash, now);
        if !local.is_empty() {
            return local.into_iter().map(|p| p.addr).collect();
        }
        let closest: Vec<RoutingNode> = self.routing_table.closest_nodes(&info_hash, count);
        for node in closest {
            let tid = self
                .transactions
                .begin(PendingQuery::GetPeers, node.addr, Some(info_hash), now);
            let query = Query::GetPeers {
                id: self.local_id,
                info_hash,
            };
            let bytes = krpc::encode_query(&tid, &self.local_id, &query);
            self.send(&bytes, node.addr, "failed to send get_peers").await;
        }
        Vec::new()
    }
}

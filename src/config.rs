//! Startup configuration.
//!
//! A thin CLI-flags-to-struct layer (`clap`'s derive API): no config-file
//! loading, secrets management, or hot reload is attempted here — those
//! remain a deployment concern outside this crate.
use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

/// Default UDP port for the Mainline DHT.
pub const DEFAULT_PORT: u16 = 6881;

/// A well-known `(hostname, port)` pair used to join the DHT at cold start.
/// The node id behind each of these is unknown until first contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapNode {
    pub host: String,
    pub port: u16,
}

impl BootstrapNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

fn default_bootstrap_nodes() -> Vec<BootstrapNode> {
    vec![
        BootstrapNode::new("router.bittorrent.com", 6881),
        BootstrapNode::new("dht.transmissionbt.com", 6881),
        BootstrapNode::new("router.utorrent.com", 6881),
    ]
}

/// Command-line flags for `dhtd`.
///
/// [`Config`] is built from this once at startup and handed by reference to
/// every component; there is no process-wide mutable configuration
/// singleton.
#[derive(Debug, Parser)]
#[command(name = "dhtd", about = "A Mainline BitTorrent DHT node")]
pub struct Args {
    /// Bind address for the UDP socket.
    #[arg(long, default_value = "0.0.0.0")]
    pub address: Ipv4Addr,

    /// Bind port for the UDP socket.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Upper bound on the total number of nodes the routing table will hold.
    #[arg(long, default_value_t = 10_000)]
    pub max_routing_table_size: usize,

    /// Period, in seconds, of the maintenance tick (bootstrap/refresh/evict).
    #[arg(long, default_value_t = 300)]
    pub maintenance_interval_seconds: u64,

    /// Timeout, in seconds, handed off to the (out-of-scope) metadata
    /// fetcher. Carried through for downstream consumers only.
    #[arg(long, default_value_t = 100)]
    pub metadata_fetch_timeout_seconds: u64,

    /// Crawler mode: answer `find_node` with a node id chosen to make the
    /// querier insert us into buckets close to itself.
    #[arg(long, default_value_t = false)]
    pub enable_neighbor_spoofing: bool,

    /// Additional `host:port` bootstrap nodes (repeatable). Extends, not
    /// replaces, the built-in defaults.
    #[arg(long = "bootstrap-node", value_parser = parse_bootstrap_node)]
    pub extra_bootstrap_nodes: Vec<BootstrapNode>,

    /// Tracing filter directive (e.g. `info`, `dhtd=debug`). Overridden by
    /// the `RUST_LOG` environment variable when it's set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn parse_bootstrap_node(s: &str) -> Result<BootstrapNode, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port in {s:?}"))?;
    Ok(BootstrapNode::new(host, port))
}

/// Resolved runtime configuration, built once from [`Args`].
#[derive(Debug, Clone)]
pub struct Config {
    pub address: Ipv4Addr,
    pub port: u16,
    pub max_routing_table_size: usize,
    pub maintenance_interval: Duration,
    pub metadata_fetch_timeout: Duration,
    pub enable_neighbor_spoofing: bool,
    pub bootstrap_nodes: Vec<BootstrapNode>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            max_routing_table_size: 10_000,
            maintenance_interval: Duration::from_secs(300),
            metadata_fetch_timeout: Duration::from_secs(100),
            enable_neighbor_spoofing: false,
            bootstrap_nodes: default_bootstrap_nodes(),
            log_level: "info".to_string(),
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let mut bootstrap_nodes = default_bootstrap_nodes();
        bootstrap_nodes.extend(args.extra_bootstrap_nodes);
        Self {
            address: args.address,
            port: args.port,
            max_routing_table_size: args.max_routing_table_size,
            maintenance_interval: Duration::from_secs(args.maintenance_interval_seconds),
            metadata_fetch_timeout: Duration::from_secs(args.metadata_fetch_timeout_seconds),
            enable_neighbor_spoofing: args.enable_neighbor_spoofing,
            bootstrap_nodes,
            log_level: args.log_level,
        }
    }
}

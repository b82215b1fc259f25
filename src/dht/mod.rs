//! Mainline BitTorrent DHT: a Kademlia-style distributed hash table run
//! over UDP (BEP-5). This module owns the node id space, the bucket-based
//! routing table, the KRPC wire protocol, and the server event loop that
//! ties them together. BEP-9/10 metadata exchange and the TCP peer-wire
//! protocol are out of scope; this crate only speaks the DHT dialect.
pub mod compact;
pub mod id;
pub mod krpc;
pub mod node;
pub mod peer;
pub mod routing;
pub mod server;
pub mod token;
pub mod transaction;
pub mod transport;

pub use id::NodeId;
pub use server::{PeerAnnounced, Server, ServerError};

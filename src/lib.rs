//! Library root for dhtd.
//!
//! Re-exports the core modules: the bencoding codec, startup configuration,
//! and the `dht` engine itself (node id space, routing table, KRPC, and the
//! server event loop).
pub mod bencode;
pub mod config;
pub mod dht;

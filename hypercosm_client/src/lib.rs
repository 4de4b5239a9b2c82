//! `hypercosm_client`
//!
//! The client:
//! - Upgrades a TCP connection to TLS and exchanges session nonces
//! - Runs the remote-object protocol layer (framed, correlated RPC)
//! - Hosts a minimal root object the server can introspect
//! - Subscribes to the world-entity feed through typed proxies
//! - Resolves asset payloads through a persistent deduplicating cache
//! - Hands engine-touching work to a single-consumer per-tick dispatcher

pub mod cache;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod objects;
pub mod proxy;
pub mod session;
pub mod transport;

pub use connection::Connection;

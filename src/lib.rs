//! mirror-node: edge agent for a federated file-distribution cluster
//!
//! The node authenticates to a central coordinator, pulls the authoritative
//! object manifest, downloads and verifies whatever is missing into a local
//! content-addressed store, and then keeps a persistent session open,
//! announcing itself and reporting served traffic in periodic heartbeats.
//!
//! - `credentials`: challenge/HMAC token handshake and refresh
//! - `manifest`: zstd + schema-encoded object list
//! - `storage`: sharded on-disk store with digest verification
//! - `download`: worker pool that brings the store in line with the manifest
//! - `cache`: read-through buffer cache for serving
//! - `session`: coordinator session state machine
//! - `server`: HTTP serving surface

pub mod cache;
pub mod certs;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod credentials;
pub mod download;
pub mod error;
pub mod manifest;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod storage;

pub use error::{NodeError, Result};

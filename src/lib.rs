//! src/lib.rs
//!
//! Piko: a reverse proxy for services with no public address. This crate
//! wires together a Scuttlebutt-style gossip engine, a cluster registry
//! built on top of it, a per-endpoint upstream tunnel-pool manager, the
//! tunnel session layer agents dial into, and the downstream HTTP/TCP
//! request router, behind a single `App`.

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod gossip;
pub mod registry;
pub mod router;
pub mod tunnel;
pub mod upstream;

pub use app::App;
pub use config::Config;
pub use error::Error;

//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Gossip(#[from] crate::gossip::Error),

    #[error(transparent)]
    Tunnel(#[from] crate::tunnel::Error),

    #[error(transparent)]
    Router(#[from] crate::router::Error),

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("API server error: {0}")]
    ApiServer(#[from] axum::Error),
}

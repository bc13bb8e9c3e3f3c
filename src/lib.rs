//! vndbkit - async client for the VNDB TCP protocol.
//!
//! Commands go through a shared rate limiter and a bounded pool of logged-in
//! sessions. Server-side throttling is waited out and retried transparently.
//! Sessions run over plain TCP or, with [`ClientConfig::tls`], over TLS.
//!
//! ```no_run
//! # async fn run() -> vndbkit::Result<()> {
//! let config = vndbkit::ClientConfig::new("myapp").max_connections(4);
//! let client = vndbkit::connect(config).await?;
//!
//! let stats = client.stats().await?;
//! println!("{:?} users", stats.users);
//!
//! let response = client.query("get vn basic (id = 17)").await?;
//! client.close().await;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
pub mod wire;

pub use client::{query_once, Client};
pub use config::{ClientConfig, Credentials, RateInterval};
pub use error::{Result, VndbError};
pub use wire::{
    Command, DbStats, PoolStatus, Response, ResultSet, ServerError, ServerErrorKind, WireError,
};

/// Create a pooled client.
pub async fn connect(config: ClientConfig) -> Result<Client> {
    Client::connect(config).await
}

//! chatlink - resilient live channel client library
//!
//! This library gives an interactive client a live duplex channel to a
//! backend, keeps a session's state synchronized over it, and renders
//! execution progress as a paced text stream.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `channel`: connection lifecycle, reconnect, heartbeat, correlated requests
//! - `sync`: optimistic session state, flushing and remote merges
//! - `stream`: execution event filtering, formatting and paced reveal
//! - `client`: a single handle wiring the three together
//! - `config`: configuration management and validation
//! - `error`: error types and result aliases
//! - `logging`: tracing subscriber setup
//! - `metrics`: channel, sync and stream instrumentation
//! - `cli` / `commands`: command-line interface and its handlers
//!
//! # Example
//!
//! ```no_run
//! use chatlink::{Config, LiveClient};
//! use chatlink::sync::Mutation;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/chatlink.yaml")?;
//!     config.validate()?;
//!
//!     let client = LiveClient::new(config)?;
//!     client.init(None).await?;
//!     client.engine().mutate(Mutation::set("view", json!("list"))).await?;
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod stream;
pub mod sync;

// Re-export commonly used types
pub use channel::{ChannelEvent, ConnectionManager, ConnectionStatus};
pub use client::LiveClient;
pub use config::Config;
pub use error::{ChatlinkError, Result};
pub use stream::{ExecutionStreamFormatter, StreamUpdate};
pub use sync::{SyncEngine, SyncStatus};

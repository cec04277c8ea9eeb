//! Client session state and its synchronization with the remote store
//!
//! - [`session`]: the snapshot, the pending change log and merge rules
//! - [`engine`]: debounced, retried flushing and remote push handling
//! - [`backend`]: the remote session operations over the live channel
//! - [`http`]: the same operations over point-to-point HTTP
//! - [`store`]: local persistence across restarts

pub mod backend;
pub mod engine;
pub mod http;
pub mod session;
pub mod store;

pub use backend::{ChannelBackend, ChatMessage, SessionBackend};
pub use engine::{FlushOutcome, SyncEngine, SyncEvent};
pub use http::HttpBackend;
pub use session::{Change, MergeOutcome, Mutation, Session, Snapshot, SyncStatus};
pub use store::SessionStore;

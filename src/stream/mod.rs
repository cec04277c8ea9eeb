//! Execution event streaming
//!
//! Typed events from the channel are filtered, formatted and revealed at a
//! human pace by [`ExecutionStreamFormatter`].

pub mod event;
pub mod filter;
pub mod format;
pub mod formatter;

pub use event::{EventKind, ExecutionEvent};
pub use format::{FormatRule, FormatTable, Fragment};
pub use formatter::{ExecutionStreamFormatter, StreamState, StreamUpdate};

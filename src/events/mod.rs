//! Per-run event log: persisted, strictly ordered, fanned out live.

mod stream;
mod types;

pub use stream::{EventStream, RunSubscription};
pub use types::{messages, EventLevel, RunEvent};

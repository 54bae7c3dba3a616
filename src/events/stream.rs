//! Persist-then-fanout event stream.
//!
//! Every event is committed to the store first and only then broadcast,
//! so subscribers never observe an event that a rollback could retract.
//! Live subscription catches up on history before switching to the feed;
//! the per-run sequence number dedups the seam between the two.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::store::{Store, StoreResult};

use super::types::{EventLevel, RunEvent};

/// Buffered events in the broadcast channel before lagging subscribers
/// start losing the oldest entries.
const CHANNEL_CAPACITY: usize = 1_024;

/// Event stream handle. Cheap to clone; clones share the feed.
#[derive(Clone)]
pub struct EventStream {
    store: Store,
    sender: broadcast::Sender<RunEvent>,
}

impl EventStream {
    #[must_use]
    pub fn new(store: Store) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, sender }
    }

    /// Append one event: store transaction first, broadcast second.
    pub async fn emit(
        &self,
        run_id: &str,
        level: EventLevel,
        message: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<RunEvent> {
        let event = self
            .store
            .append_event(run_id, level, message, &metadata)
            .await?;

        // Fan-out is best-effort: no subscribers is normal, the log in
        // the store is the durable record.
        if self.sender.receiver_count() > 0 {
            if let Err(e) = self.sender.send(event.clone()) {
                warn!(run_id, "event fan-out failed: {e}");
            }
        }

        debug!(run_id, seq = event.seq, message, "event appended");
        Ok(event)
    }

    /// Subscribe to one run: historical events plus the live feed.
    ///
    /// The receiver is registered before history is read, so an event
    /// committed between the two shows up in both; `next()` drops the
    /// duplicate by sequence number.
    pub async fn subscribe_run(&self, run_id: &str) -> StoreResult<RunSubscription> {
        let receiver = self.sender.subscribe();
        let history = self.store.events_for_run(run_id).await?;
        let caught_up_seq = history.last().map_or(0, |e| e.seq);

        Ok(RunSubscription {
            run_id: run_id.to_string(),
            history: history.into(),
            receiver,
            last_seq: caught_up_seq,
        })
    }

    /// Firehose of committed events across all runs (live only).
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A per-run subscription: drains history, then the live feed.
pub struct RunSubscription {
    run_id: String,
    history: std::collections::VecDeque<RunEvent>,
    receiver: broadcast::Receiver<RunEvent>,
    last_seq: i64,
}

impl RunSubscription {
    /// Next event in order, or `None` once the live feed closes.
    pub async fn next(&mut self) -> Option<RunEvent> {
        if let Some(event) = self.history.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.run_id != self.run_id {
                        continue;
                    }
                    // Drop anything already served from history
                    if event.seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = event.seq;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        run_id = %self.run_id,
                        missed,
                        "subscriber lagged; events dropped from live feed"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

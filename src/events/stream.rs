//! Resumable tailing of the persisted event log.
//!
//! The store is the queue, so tailing is a bounded-interval poll over
//! `events_after`, yielding batches in id order. When the log is idle a
//! synthetic heartbeat item (never persisted) keeps downstream connections
//! alive. The event `id` is the only durable resume cursor.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tracing::warn;

use crate::jobs::JobEvent;
use crate::store::{EventScope, JobStore};

const BATCH_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(JobEvent),
    /// Synthetic keep-alive; not persisted, carries no id.
    Heartbeat,
}

#[derive(Debug, Clone)]
pub struct TailConfig {
    pub poll_interval: Duration,
    pub heartbeat_every: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            heartbeat_every: Duration::from_secs(15),
        }
    }
}

/// Lazy, cancellable, potentially infinite sequence of events with
/// `id > since`. Dropping the stream stops the poll loop.
pub fn tail_events(
    store: Arc<dyn JobStore>,
    scope: EventScope,
    since: u64,
    config: TailConfig,
) -> impl Stream<Item = StreamItem> {
    async_stream::stream! {
        let mut cursor = since;
        let mut last_activity = tokio::time::Instant::now();
        loop {
            match store.events_after(scope, cursor, BATCH_SIZE) {
                Ok(events) if !events.is_empty() => {
                    for event in events {
                        cursor = event.id;
                        yield StreamItem::Event(event);
                    }
                    last_activity = tokio::time::Instant::now();
                    // A full batch may have more behind it; poll again
                    // without sleeping.
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Event tail query failed"),
            }

            if last_activity.elapsed() >= config.heartbeat_every {
                last_activity = tokio::time::Instant::now();
                yield StreamItem::Heartbeat;
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    }
}

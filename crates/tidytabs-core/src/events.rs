//! Tab lifecycle events and the debounced refresh path.
//!
//! The host publishes [`TabEvent`]s onto an [`EventBus`]; the controller
//! subscribes and reacts. Lifecycle notifications (created, removed,
//! updated) only refresh the duplicate-count indicator, funneled through a
//! [`Debouncer`] so a burst of tab churn becomes one refresh. An explicit
//! [`TabEvent::RunRequested`] is the only event that starts a full
//! reconciliation run.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::tabs::{Tab, TabId};

/// Default bus capacity before slow subscribers start lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default quiet window for coalescing indicator refreshes
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// A host-side tab lifecycle notification, or an explicit run trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabEvent {
    /// A tab appeared.
    Created { tab: Tab },
    /// A tab went away.
    Removed { tab: TabId },
    /// A tab changed URL, title, or position.
    Updated { tab: Tab },
    /// The user asked for a reconciliation run.
    RunRequested,
}

impl TabEvent {
    /// Whether this event only feeds the indicator refresh.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::RunRequested)
    }
}

/// Broadcast fanout for [`TabEvent`]s.
///
/// Bounded so a stalled subscriber lags and skips ahead instead of growing
/// an unbounded queue.
pub struct EventBus {
    sender: broadcast::Sender<TabEvent>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event to every subscriber.
    ///
    /// Returns the number of subscribers that received it; an event with no
    /// subscribers is silently dropped.
    pub fn publish(&self, event: TabEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Open a new subscription starting at the current tail.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TabEvent> {
        self.sender.subscribe()
    }
}

/// Coalesces bursts of pokes into single action invocations.
///
/// After the first poke the worker waits out the quiet window, drains every
/// poke that arrived meanwhile, and runs the action once. Dropping the
/// debouncer stops the worker after pending work drains.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    /// Spawn the worker task and return the handle to poke it.
    pub fn spawn<F, Fut>(window: Duration, mut action: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let worker = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(window).await;

                let mut coalesced = 0usize;
                while rx.try_recv().is_ok() {
                    coalesced += 1;
                }
                if coalesced > 0 {
                    debug!(coalesced, "debounce window absorbed extra pokes");
                }

                action().await;
            }
        });

        (Self { tx }, worker)
    }

    /// Request a refresh. Cheap and non-blocking; bursts coalesce.
    pub fn poke(&self) {
        let _ = self.tx.send(());
    }
}

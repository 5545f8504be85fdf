//! In-process event bus for run lifecycle events.
//!
//! The bus is the channel collaborators (CLI, UI server) observe a run
//! through. Publishing is fire-and-forget: delivery is at-most-once per
//! subscriber, in publish order, and a publish with zero subscribers is
//! discarded. Every consumer therefore subscribes before triggering the
//! action that produces the event it waits for.

use specter_common::{Error, Result, TestStatus};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::registry::Snapshot;

/// Default buffer capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 256;

/// Events published by a run session
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Dispatch began
    Start,

    /// A record changed status
    TestUpdated { test_id: String, status: TestStatus },

    /// Pending + running reached zero; carries the final snapshot.
    /// Fires exactly once per run cycle.
    Stop { snapshot: Snapshot },

    /// All workers have terminated; the session is done. Carries the final
    /// snapshot so report persistence can hang off this event.
    Shutdown { snapshot: Snapshot },

    /// The extraction step produced the inventory
    ExtractSuccess,

    /// The extraction step failed; the run aborts
    ExtractFail { reason: String },
}

/// In-process fan-out event bus
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// A send error only means there are zero receivers; that is the
    /// documented fire-and-forget case, so it is ignored.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Await the first event matching `predicate`, then unsubscribe.
    ///
    /// Dropping the returned subscription cancels it. The subscription is
    /// registered before this call returns, so publishing right after
    /// `subscribe_once` cannot race past it.
    pub fn subscribe_once<F>(&self, predicate: F) -> Subscription
    where
        F: Fn(&RunEvent) -> bool + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if predicate(&event) => {
                        let _ = tx.send(event);
                        break;
                    }
                    Ok(_) => continue,
                    // A lagged subscriber keeps waiting; only future events
                    // can match a single-shot subscription anyway.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task, receiver: rx }
    }
}

/// Cancellable single-shot subscription returned by
/// [`EventBus::subscribe_once`].
pub struct Subscription {
    task: JoinHandle<()>,
    receiver: oneshot::Receiver<RunEvent>,
}

impl Subscription {
    /// Wait for the matching event.
    pub async fn wait(mut self) -> Result<RunEvent> {
        (&mut self.receiver)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_discarded() {
        let bus = EventBus::default();
        // Does not error, does not panic
        bus.publish(RunEvent::Start);
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(RunEvent::Start);
        bus.publish(RunEvent::TestUpdated {
            test_id: "a/b/c".into(),
            status: TestStatus::Running,
        });

        assert!(matches!(rx.recv().await.unwrap(), RunEvent::Start));
        assert!(matches!(
            rx.recv().await.unwrap(),
            RunEvent::TestUpdated { .. }
        ));
    }

    #[tokio::test]
    async fn test_subscribe_once_fires_on_first_match_only() {
        let bus = EventBus::default();
        let once = bus.subscribe_once(|e| matches!(e, RunEvent::ExtractSuccess));

        bus.publish(RunEvent::Start);
        bus.publish(RunEvent::ExtractSuccess);
        bus.publish(RunEvent::ExtractSuccess);

        assert!(matches!(once.wait().await.unwrap(), RunEvent::ExtractSuccess));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_cancelled() {
        let bus = EventBus::default();
        let once = bus.subscribe_once(|_| true);
        drop(once);
        // The matcher task is aborted; publishing must not hang or panic.
        bus.publish(RunEvent::Start);
    }
}

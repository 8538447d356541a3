//! Broadcast wake-up for every delivery worker.
//!
//! Purely a liveness aid: a refresh makes idle workers re-poll their channel
//! now instead of at their next poll interval.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RefreshCoordinator {
    generation: Arc<watch::Sender<u64>>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        RefreshCoordinator {
            generation: Arc::new(watch::Sender::new(0)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Wakes every subscribed worker.
    pub fn trigger(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
        debug!(
            generation = *self.generation.borrow(),
            workers = self.generation.receiver_count(),
            "refresh broadcast"
        );
    }
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_is_woken() {
        let refresh = RefreshCoordinator::new();
        let mut a = refresh.subscribe();
        let mut b = refresh.subscribe();

        refresh.trigger();

        a.changed().await.unwrap();
        b.changed().await.unwrap();
        assert_eq!(*a.borrow(), 1);
    }

    #[test]
    fn trigger_without_subscribers_is_fine() {
        RefreshCoordinator::new().trigger();
    }
}

//! Shard liveness timers
//!
//! Each armed timer is a sleeping task that posts a [`TimerExpired`] back to
//! the coordinator loop. Dropping an [`ArmedTimer`] aborts its task, and every
//! timer carries a generation so an expiry that was already queued when the
//! timer was replaced is recognized as stale.

use crate::ids::ShardId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Expiry notice for one shard's timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerExpired {
    pub shard_id: ShardId,
    pub generation: u64,
}

/// A pending single-shot timer. Aborted on drop.
#[derive(Debug)]
pub struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

impl ArmedTimer {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Source of armed timers sharing one expiry channel
#[derive(Debug)]
pub struct TimerQueue {
    tx: mpsc::UnboundedSender<TimerExpired>,
    next_generation: u64,
}

impl TimerQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerExpired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_generation: 0,
            },
            rx,
        )
    }

    /// Schedule an expiry for `shard_id` after `after`
    pub fn arm(&mut self, shard_id: ShardId, after: Duration) -> ArmedTimer {
        // Generations are unique across shards, so a shard deleted and
        // re-created can never match an expiry queued for its predecessor.
        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(TimerExpired {
                shard_id,
                generation,
            });
        });

        ArmedTimer { generation, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_duration() {
        let (mut queue, mut rx) = TimerQueue::new();
        let timer = queue.arm(ShardId::from(1), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.shard_id, ShardId::from(1));
        assert_eq!(expired.generation, timer.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let (mut queue, mut rx) = TimerQueue::new();
        let first = queue.arm(ShardId::from("a"), Duration::from_secs(1));
        drop(first);
        let second = queue.arm(ShardId::from("a"), Duration::from_secs(3));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.generation, second.generation());
        assert!(rx.try_recv().is_err());
    }
}

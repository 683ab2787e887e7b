//! Delay queue for directive expiries.
//!
//! A single task owns a min-heap of `(fire time, generation, key)`. Re-arming
//! or cancelling a key bumps or drops its generation, so stale heap entries are
//! skipped when they surface instead of being searched for and removed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::directive::DirectiveKey;
use super::error::{ReconcileError, ReconcileResult};

#[derive(Debug)]
enum Command {
    Arm { key: DirectiveKey, at: Instant },
    Cancel(DirectiveKey),
}

/// Handle to the expiry task. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ExpiryScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl ExpiryScheduler {
    /// Start the expiry task. Due keys are sent on `fired` exactly once per arm.
    pub fn spawn(
        fired: mpsc::UnboundedSender<DirectiveKey>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, fired, shutdown));
        (Self { commands: tx }, handle)
    }

    /// Arm (or re-arm) the one-shot expiry of `key` at `expiry`.
    pub fn arm(&self, key: DirectiveKey, expiry: DateTime<Utc>) -> ReconcileResult<()> {
        let delay = (expiry - Utc::now()).to_std().unwrap_or_default();
        self.commands
            .send(Command::Arm {
                key,
                at: Instant::now() + delay,
            })
            .map_err(|_| ReconcileError::SchedulerStopped)
    }

    pub fn cancel(&self, key: DirectiveKey) -> ReconcileResult<()> {
        self.commands
            .send(Command::Cancel(key))
            .map_err(|_| ReconcileError::SchedulerStopped)
    }
}

/// Stale heap entries tolerated before the heap is rebuilt from live ones.
const COMPACT_SLACK: usize = 64;

#[derive(Default)]
struct DelayQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, DirectiveKey)>>,
    live: HashMap<DirectiveKey, u64>,
    next_generation: u64,
}

impl DelayQueue {
    fn arm(&mut self, key: DirectiveKey, at: Instant) {
        self.next_generation += 1;
        self.live.insert(key, self.next_generation);
        self.heap.push(Reverse((at, self.next_generation, key)));
        self.compact();
    }

    fn cancel(&mut self, key: &DirectiveKey) {
        self.live.remove(key);
        self.compact();
    }

    /// Superseded and cancelled entries stay in the heap until they surface;
    /// drop them once they outnumber the live ones.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + COMPACT_SLACK {
            return;
        }
        let live = &self.live;
        self.heap
            .retain(|Reverse((_, generation, key))| live.get(key) == Some(generation));
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        // Drop cancelled entries so an idle queue does not wake up for nothing.
        while let Some(Reverse((at, generation, key))) = self.heap.peek() {
            if self.live.get(key) == Some(generation) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Instant) -> Vec<DirectiveKey> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, generation, key))) = self.heap.pop() else {
                break;
            };
            if self.live.get(&key) == Some(&generation) {
                self.live.remove(&key);
                due.push(key);
            }
        }
        due
    }

    fn len(&self) -> usize {
        self.live.len()
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    fired: mpsc::UnboundedSender<DirectiveKey>,
    shutdown: CancellationToken,
) {
    let mut queue = DelayQueue::default();

    loop {
        let deadline = queue.next_deadline();

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(armed = queue.len(), "expiry scheduler shutting down");
                break;
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Arm { key, at }) => queue.arm(key, at),
                    Some(Command::Cancel(key)) => queue.cancel(&key),
                    None => break,
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                for key in queue.pop_due(Instant::now()) {
                    debug!(?key, "directive expiry due");
                    if fired.send(key).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn key(n: u64) -> DirectiveKey {
        DirectiveKey::role(1, 2, n)
    }

    #[test]
    fn test_delay_queue_orders_by_deadline() {
        let mut queue = DelayQueue::default();
        let now = Instant::now();
        queue.arm(key(1), now + Duration::from_secs(3));
        queue.arm(key(2), now + Duration::from_secs(1));
        queue.arm(key(3), now + Duration::from_secs(2));

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        let due = queue.pop_due(now + Duration::from_secs(2));
        assert_eq!(due, vec![key(2), key(3)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_delay_queue_cancel_and_rearm() {
        let mut queue = DelayQueue::default();
        let now = Instant::now();
        queue.arm(key(1), now + Duration::from_secs(1));
        queue.arm(key(2), now + Duration::from_secs(1));
        queue.cancel(&key(1));
        // Re-arming replaces the earlier deadline
        queue.arm(key(2), now + Duration::from_secs(5));

        assert!(queue.pop_due(now + Duration::from_secs(2)).is_empty());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(queue.pop_due(now + Duration::from_secs(5)), vec![key(2)]);
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_delay_queue_compacts_superseded_entries() {
        let mut queue = DelayQueue::default();
        let now = Instant::now();
        // A later live entry keeps stale ones from surfacing at the top.
        queue.arm(key(1), now + Duration::from_secs(1));
        for i in 0..1_000u64 {
            queue.arm(key(2), now + Duration::from_secs(3_600 + i));
            queue.arm(key(3), now + Duration::from_secs(60));
            queue.cancel(&key(3));
        }

        assert!(queue.heap.len() <= 2 * queue.len() + COMPACT_SLACK);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_due(now + Duration::from_secs(1)), vec![key(1)]);
        assert_eq!(
            queue.next_deadline(),
            Some(now + Duration::from_secs(3_600 + 999))
        );
    }

    #[tokio::test]
    async fn test_scheduler_fires_once() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (scheduler, handle) = ExpiryScheduler::spawn(fired_tx, shutdown.clone());

        scheduler
            .arm(key(1), Utc::now() + ChronoDuration::milliseconds(20))
            .unwrap();
        scheduler
            .arm(key(2), Utc::now() + ChronoDuration::milliseconds(20))
            .unwrap();
        scheduler.cancel(key(2)).unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), fired_rx.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(key(1)));

        // Nothing else is due
        let more = tokio::time::timeout(Duration::from_millis(100), fired_rx.recv()).await;
        assert!(more.is_err());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(scheduler.arm(key(3), Utc::now()).is_err());
    }

    #[tokio::test]
    async fn test_past_expiry_fires_immediately() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (scheduler, _handle) = ExpiryScheduler::spawn(fired_tx, shutdown.clone());

        scheduler
            .arm(key(7), Utc::now() - ChronoDuration::minutes(5))
            .unwrap();
        let fired = tokio::time::timeout(Duration::from_secs(1), fired_rx.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(key(7)));
        shutdown.cancel();
    }
}

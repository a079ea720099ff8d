//! Work queues between stages.
//!
//! ## Contract
//!
//! * **Grouped FIFO.** Each message carries a group key. Within a group,
//!   messages are delivered in order and at most one is in flight at a time;
//!   different groups are delivered independently. The pipeline uses one
//!   group per page.
//! * **Deduplication.** A publish whose dedup token was already seen inside
//!   the deduplication window is accepted but dropped.
//! * **At-least-once.** A received message stays in flight until acked. A
//!   nack, or a visibility timeout expiring, makes it deliverable again.
//!   Messages received too many times move to a dead-letter list.

use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A message as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub group_key: String,
    pub dedup_token: String,
    pub body: String,
}

/// A received message plus the handle needed to ack or nack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: String,
    pub message: QueueMessage,
    /// 1 on first delivery.
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Enqueued,
    /// Same dedup token seen inside the window; nothing was added.
    Deduplicated,
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Deliverable now.
    pub visible: usize,
    /// Waiting out a redelivery delay.
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

impl QueueDepth {
    /// Messages that will still be delivered at some point.
    pub fn outstanding(&self) -> usize {
        self.visible + self.delayed + self.in_flight
    }
}

/// Queue contract used by every stage.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: QueueMessage) -> Result<PublishOutcome, QueueError>;

    /// Receive up to `max` deliverable messages. Never blocks waiting for work.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Remove a processed message.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;

    /// Hand a message back for redelivery after `delay`.
    async fn nack(&self, receipt: &str, delay: Duration) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    message: QueueMessage,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Entry>,
    in_flight: HashMap<String, (Entry, Instant)>,
    busy_groups: HashSet<String>,
    seen_tokens: HashMap<String, Instant>,
    dead_letters: Vec<QueueMessage>,
    next_receipt: u64,
}

impl QueueState {
    /// Return in-flight messages whose visibility timeout expired.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((entry, _)) = self.in_flight.remove(&receipt) {
                warn!(
                    "visibility timeout expired for group {}, redelivering",
                    entry.message.group_key
                );
                self.busy_groups.remove(&entry.message.group_key);
                self.requeue(entry);
            }
        }
    }

    /// Put an entry back ahead of later messages of the same group.
    fn requeue(&mut self, entry: Entry) {
        let pos = self
            .ready
            .iter()
            .position(|e| e.message.group_key == entry.message.group_key);
        match pos {
            Some(i) => self.ready.insert(i, entry),
            None => self.ready.push_back(entry),
        }
    }
}

/// In-process queue with grouped FIFO, dedup window, visibility timeout and
/// a dead-letter list.
///
/// Uses Tokio's clock, so tests running with a paused clock can step through
/// redelivery delays instantly.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    dedup_window: Duration,
    visibility_timeout: Duration,
    max_receives: u32,
}

impl InMemoryQueue {
    /// Defaults: 5 minute dedup window, 15 minute visibility timeout,
    /// 10 receives before dead-lettering.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            dedup_window: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(900),
            max_receives: 10,
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_receives(mut self, n: u32) -> Self {
        self.max_receives = n.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages that exceeded the receive limit.
    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable(format!("queue '{}' lock poisoned", self.name)))
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn publish(&self, message: QueueMessage) -> Result<PublishOutcome, QueueError> {
        let now = Instant::now();
        let window = self.dedup_window;
        let mut state = self.lock()?;

        state
            .seen_tokens
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        if state.seen_tokens.contains_key(&message.dedup_token) {
            debug!("[{}] deduplicated {}", self.name, message.dedup_token);
            return Ok(PublishOutcome::Deduplicated);
        }

        state.seen_tokens.insert(message.dedup_token.clone(), now);
        state.ready.push_back(Entry {
            message,
            receive_count: 0,
            visible_at: now,
        });
        Ok(PublishOutcome::Enqueued)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        state.reclaim_expired(now);

        let mut picked_groups: HashSet<String> = HashSet::new();
        let mut picked: Vec<usize> = Vec::new();
        for (i, entry) in state.ready.iter().enumerate() {
            if picked.len() >= max {
                break;
            }
            let group = &entry.message.group_key;
            // First message of a group blocks the rest of that group.
            if picked_groups.contains(group) || state.busy_groups.contains(group) {
                continue;
            }
            picked_groups.insert(group.clone());
            if entry.visible_at <= now {
                picked.push(i);
            }
        }

        let mut deliveries = Vec::with_capacity(picked.len());
        for i in picked.into_iter().rev() {
            let Some(mut entry) = state.ready.remove(i) else {
                continue;
            };
            entry.receive_count += 1;
            state.next_receipt += 1;
            let receipt = format!("{}-{}", self.name, state.next_receipt);
            state.busy_groups.insert(entry.message.group_key.clone());
            deliveries.push(Delivery {
                receipt: receipt.clone(),
                message: entry.message.clone(),
                receive_count: entry.receive_count,
            });
            state
                .in_flight
                .insert(receipt, (entry, now + self.visibility_timeout));
        }
        deliveries.reverse();
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let (entry, _) = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        state.busy_groups.remove(&entry.message.group_key);
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay: Duration) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let (mut entry, _) = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        state.busy_groups.remove(&entry.message.group_key);

        if entry.receive_count >= self.max_receives {
            warn!(
                "[{}] {} received {} times, moving to dead letters",
                self.name, entry.message.dedup_token, entry.receive_count
            );
            state.dead_letters.push(entry.message);
        } else {
            entry.visible_at = now + delay;
            state.requeue(entry);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        state.reclaim_expired(now);
        let visible = state.ready.iter().filter(|e| e.visible_at <= now).count();
        Ok(QueueDepth {
            visible,
            delayed: state.ready.len() - visible,
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead_letters.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(group: &str, token: &str) -> QueueMessage {
        QueueMessage {
            group_key: group.into(),
            dedup_token: token.into(),
            body: format!("{{\"token\":\"{token}\"}}"),
        }
    }

    #[tokio::test]
    async fn duplicate_tokens_collapse() {
        let q = InMemoryQueue::new("q");
        assert_eq!(q.publish(msg("g1", "t1")).await.unwrap(), PublishOutcome::Enqueued);
        assert_eq!(
            q.publish(msg("g1", "t1")).await.unwrap(),
            PublishOutcome::Deduplicated
        );
        assert_eq!(q.depth().await.unwrap().visible, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_window_expires() {
        let q = InMemoryQueue::new("q").with_dedup_window(Duration::from_secs(10));
        q.publish(msg("g1", "t1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(q.publish(msg("g1", "t1")).await.unwrap(), PublishOutcome::Enqueued);
    }

    #[tokio::test]
    async fn distinct_groups_are_delivered_together() {
        let q = InMemoryQueue::new("q");
        for i in 0..5 {
            q.publish(msg(&format!("g{i}"), &format!("t{i}"))).await.unwrap();
        }
        let batch = q.receive(10).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].message.group_key, "g0");
    }

    #[tokio::test]
    async fn one_in_flight_per_group() {
        let q = InMemoryQueue::new("q");
        q.publish(msg("g", "a")).await.unwrap();
        q.publish(msg("g", "b")).await.unwrap();

        let first = q.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message.dedup_token, "a");
        assert!(q.receive(10).await.unwrap().is_empty());

        q.ack(&first[0].receipt).await.unwrap();
        let second = q.receive(10).await.unwrap();
        assert_eq!(second[0].message.dedup_token, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_after_delay_in_group_order() {
        let q = InMemoryQueue::new("q");
        q.publish(msg("g", "a")).await.unwrap();
        q.publish(msg("g", "b")).await.unwrap();

        let d = q.receive(1).await.unwrap().remove(0);
        q.nack(&d.receipt, Duration::from_secs(30)).await.unwrap();

        // Head of group is delayed, so the group is blocked.
        assert!(q.receive(10).await.unwrap().is_empty());
        assert_eq!(q.depth().await.unwrap().delayed, 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = q.receive(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message.dedup_token, "a");
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn exhausted_receives_dead_letter() {
        let q = InMemoryQueue::new("q").with_max_receives(2);
        q.publish(msg("g", "a")).await.unwrap();
        for _ in 0..2 {
            let d = q.receive(1).await.unwrap().remove(0);
            q.nack(&d.receipt, Duration::ZERO).await.unwrap();
        }
        let depth = q.depth().await.unwrap();
        assert_eq!(depth.outstanding(), 0);
        assert_eq!(depth.dead_lettered, 1);
        assert_eq!(q.dead_letters()[0].dedup_token, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_timeout_redelivers_unacked() {
        let q = InMemoryQueue::new("q").with_visibility_timeout(Duration::from_secs(5));
        q.publish(msg("g", "a")).await.unwrap();
        let _lost = q.receive(1).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let again = q.receive(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn unknown_receipt_is_an_error() {
        let q = InMemoryQueue::new("q");
        assert!(matches!(
            q.ack("nope").await.unwrap_err(),
            QueueError::UnknownReceipt(_)
        ));
    }
}

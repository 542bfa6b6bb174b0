//! Shared state-change notification queue
//!
//! Every committed transition publishes one [`StateChangeNotification`] onto a
//! bounded ring buffer owned by the dispatcher. Publishing never blocks: when
//! the buffer is full the oldest entry is evicted and counted as dropped. A
//! slow or absent observer therefore loses history but can never stall an
//! agent. Observers that need every notification must drain faster than the
//! agents transition.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use troupe_core::StateChangeNotification;

/// Bounded, drop-oldest notification buffer
#[derive(Debug)]
pub struct NotificationQueue {
    buffer: Mutex<VecDeque<StateChangeNotification>>,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    available: Notify,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            available: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StateChangeNotification>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a notification, evicting the oldest one when full
    pub fn publish(&self, notification: StateChangeNotification) {
        {
            let mut buffer = self.lock();
            if buffer.len() == self.capacity {
                buffer.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(
                        "Notification queue full (capacity {}), {} notifications dropped so far",
                        self.capacity,
                        dropped
                    );
                }
            }
            buffer.push_back(notification);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.available.notify_waiters();
    }

    fn pop(&self) -> Option<StateChangeNotification> {
        self.lock().pop_front()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wake every receiver; once drained they return `None`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Publishing half handed to each agent's state machine
#[derive(Debug, Clone)]
pub struct StateNotifier {
    queue: Arc<NotificationQueue>,
}

impl StateNotifier {
    pub fn new(queue: Arc<NotificationQueue>) -> Self {
        Self { queue }
    }

    pub fn publish(&self, notification: StateChangeNotification) {
        self.queue.publish(notification);
    }
}

/// Receiving handle onto the shared queue
///
/// All handles returned by the dispatcher read from the same queue, so two
/// receivers compete for entries rather than each seeing every one.
#[derive(Debug, Clone)]
pub struct StateChangeReceiver {
    queue: Arc<NotificationQueue>,
}

impl StateChangeReceiver {
    pub fn new(queue: Arc<NotificationQueue>) -> Self {
        Self { queue }
    }

    /// Wait for the next notification; `None` once the queue is closed and empty
    pub async fn recv(&self) -> Option<StateChangeNotification> {
        loop {
            let notified = self.queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(notification) = self.queue.pop() {
                return Some(notification);
            }
            if self.queue.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<StateChangeNotification> {
        self.queue.pop()
    }

    /// Take everything currently buffered
    pub fn drain(&self) -> Vec<StateChangeNotification> {
        self.queue.lock().drain(..).collect()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Whether both handles read from the same queue
    pub fn same_queue(&self, other: &StateChangeReceiver) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use troupe_core::{AgentId, AgentType};

    fn note(to: &str) -> StateChangeNotification {
        StateChangeNotification {
            agent_id: AgentId::new("coder-001"),
            agent_type: AgentType::Coder,
            from_state: "WAITING".to_string(),
            to_state: to.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let queue = NotificationQueue::new(3);
        let notifier = StateNotifier::new(Arc::clone(&queue));
        for i in 0..5 {
            notifier.publish(note(&format!("S{}", i)));
        }

        let receiver = StateChangeReceiver::new(queue.clone());
        let seen: Vec<_> = receiver.drain().into_iter().map(|n| n.to_state).collect();
        assert_eq!(seen, vec!["S2", "S3", "S4"]);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.published(), 5);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let queue = NotificationQueue::new(4);
        let receiver = StateChangeReceiver::new(Arc::clone(&queue));
        let notifier = StateNotifier::new(Arc::clone(&queue));

        let waiter = tokio::spawn(async move { receiver.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.publish(note("PLANNING"));

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.to_state, "PLANNING");
    }

    #[tokio::test]
    async fn test_close_ends_receivers_after_drain() {
        let queue = NotificationQueue::new(4);
        let receiver = StateChangeReceiver::new(Arc::clone(&queue));
        queue.publish(note("PLANNING"));
        queue.close();

        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = NotificationQueue::new(0);
        queue.publish(note("PLANNING"));
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.len(), 1);
    }
}

//! Process-wide event fan-out
//!
//! Every subscriber owns a bounded queue. Publishing appends to each live
//! queue under one short critical section and never waits for consumers.
//! When a queue is full its oldest event is discarded and counted. A
//! subscription that has been dropped is noticed on the next publish, when
//! delivery to it fails, and its registry slot is released then.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::event::Event;

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panic while holding the lock cannot leave a queue half-updated
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SubscriberQueue {
    events: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    hub_closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, event: Arc<Event>) {
        {
            let mut events = lock(&self.events);
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<Event>> {
        lock(&self.events).pop_front()
    }
}

struct Slot {
    id: u64,
    queue: Weak<SubscriberQueue>,
}

struct HubInner {
    subscribers: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    published: AtomicU64,
    capacity: usize,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for slot in subscribers.iter() {
            if let Some(queue) = slot.queue.upgrade() {
                queue.hub_closed.store(true, Ordering::Release);
                queue.notify.notify_one();
            }
        }
    }
}

/// Fan-out point for [`Event`]s. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventHub {
    /// Create a hub whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register a subscriber. It receives every event published after this call.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::with_capacity(self.inner.capacity.min(64))),
            notify: Notify::new(),
            capacity: self.inner.capacity,
            dropped: AtomicU64::new(0),
            hub_closed: AtomicBool::new(false),
        });

        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.push(Slot {
            id,
            queue: Arc::downgrade(&queue),
        });
        debug!(subscriber = id, total = subscribers.len(), "Subscriber registered");

        Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every live subscriber. Returns the number of
    /// subscribers it was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let kind = event.kind();
        let mut delivered = 0;

        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|slot| match slot.queue.upgrade() {
            Some(queue) => {
                queue.push(Arc::clone(&event));
                delivered += 1;
                true
            }
            None => {
                debug!(subscriber = slot.id, "Subscriber gone, releasing slot");
                false
            }
        });
        drop(subscribers);

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        trace!(event = kind, delivered, "Published event");
        delivered
    }

    /// Remove a subscriber immediately instead of waiting for the next publish
    pub fn unsubscribe(&self, subscription: Subscription) {
        let id = subscription.id;
        lock(&self.inner.subscribers).retain(|slot| slot.id != id);
        debug!(subscriber = id, "Subscriber removed");
    }

    /// Registered subscribers, including dropped ones not yet cleaned up
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Total publish calls
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

/// Receiving end of a hub subscription. Dropping it unsubscribes lazily.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once the hub is gone and
    /// everything queued before that has been received.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.hub_closed.load(Ordering::Acquire) || self.hub.strong_count() == 0 {
                return self.queue.pop();
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.queue.pop()
    }

    /// Events currently queued
    pub fn len(&self) -> usize {
        lock(&self.queue.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn up(n: u8) -> Event {
        Event::DeviceUp {
            device_id: DeviceId::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))),
            ts: Utc::now(),
        }
    }

    fn host(event: &Event) -> u8 {
        match event.device_id() {
            DeviceId::Ip(IpAddr::V4(v4)) => v4.octets()[3],
            other => panic!("unexpected id {other}"),
        }
    }

    #[test]
    fn test_fan_out_exactly_once() {
        let hub = EventHub::new(16);
        let mut subs: Vec<_> = (0..5).map(|_| hub.subscribe()).collect();

        assert_eq!(hub.publish(up(1)), 5);

        for sub in subs.iter_mut() {
            assert_eq!(sub.len(), 1);
            assert_eq!(host(&sub.try_recv().unwrap()), 1);
            assert!(sub.try_recv().is_none());
        }
        assert_eq!(hub.published(), 1);
    }

    #[test]
    fn test_no_replay_for_late_subscriber() {
        let hub = EventHub::new(16);
        hub.publish(up(1));
        let mut late = hub.subscribe();
        hub.publish(up(2));
        assert_eq!(host(&late.try_recv().unwrap()), 2);
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest_only_for_slow_subscriber() {
        let hub = EventHub::new(3);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for n in 1..=5 {
            hub.publish(up(n));
            assert_eq!(host(&fast.try_recv().unwrap()), n);
        }

        assert_eq!(slow.dropped(), 2);
        assert_eq!(fast.dropped(), 0);
        let kept: Vec<u8> = std::iter::from_fn(|| slow.try_recv()).map(|e| host(&e)).collect();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    #[test]
    fn test_dropped_subscriber_cleaned_up_lazily() {
        let hub = EventHub::new(4);
        let keep = hub.subscribe();
        let gone = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(gone);
        assert_eq!(hub.subscriber_count(), 2);

        assert_eq!(hub.publish(up(1)), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(keep.len(), 1);
    }

    #[test]
    fn test_unsubscribe_is_immediate() {
        let hub = EventHub::new(4);
        let sub = hub.subscribe();
        let _other = hub.subscribe();
        hub.unsubscribe(sub);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish(up(1)), 1);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub = EventHub::new(4);
        let mut sub = hub.subscribe();

        let publisher = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(up(9));
        });

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("recv timed out")
            .expect("hub closed");
        assert_eq!(host(&event), 9);
    }

    #[tokio::test]
    async fn test_recv_drains_then_ends_when_hub_dropped() {
        let hub = EventHub::new(4);
        let mut sub = hub.subscribe();
        hub.publish(up(1));
        drop(hub);

        assert_eq!(host(&sub.recv().await.unwrap()), 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_publishers_and_subscribers() {
        let hub = EventHub::new(1024);
        let mut subs: Vec<_> = (0..8).map(|_| hub.subscribe()).collect();

        let mut producers = tokio::task::JoinSet::new();
        for p in 0..4u8 {
            let hub = hub.clone();
            producers.spawn(async move {
                for n in 0..50u8 {
                    hub.publish(up(p * 50 + n));
                    tokio::task::yield_now().await;
                }
            });
        }
        // subscribers registering mid-stream must not disturb delivery
        let mut late = Vec::new();
        for _ in 0..4 {
            late.push(hub.subscribe());
            tokio::task::yield_now().await;
        }
        while producers.join_next().await.is_some() {}

        for sub in subs.iter_mut() {
            assert_eq!(sub.len(), 200);
            assert_eq!(sub.dropped(), 0);
        }
        for sub in &late {
            assert!(sub.len() <= 200);
        }
        assert_eq!(hub.published(), 200);
    }
}

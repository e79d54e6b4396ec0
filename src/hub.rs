// 4.0 hub.rs: per-market fan-out. one registry of bounded subscriber channels per team.
// 4.1 publish never blocks: a full channel counts as a miss, and `overflow_limit` consecutive
//     misses disconnect that subscriber with HubError::Overflow. others are unaffected.
// 4.2 after unsubscribe() returns nothing more is handed to that subscriber, buffered or not.

use serde::Serialize;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::TeamId;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // subscription whose handler is running on this thread, if any
    static DELIVERING: Cell<Option<SubscriptionId>> = const { Cell::new(None) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Message as delivered to subscribers. `sequence` is per team and gap-free at the source,
/// so a subscriber that sees a jump knows it lost messages.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub team_id: TeamId,
    pub sequence: u64,
    #[serde(flatten)]
    pub event: T,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("subscriber fell behind, {missed} consecutive messages dropped")]
    Overflow { missed: u32 },

    #[error("market fault: {reason}")]
    Upstream { reason: String },

    #[error("market {0} is closed")]
    Closed(TeamId),
}

#[derive(Debug)]
pub enum SubscriptionEvent<T> {
    Message(Envelope<T>),
    /// Terminal. nothing follows.
    Failed(HubError),
    /// Terminal. the market was torn down.
    Completed,
}

#[derive(Debug)]
enum Termination {
    Completed,
    Failed(HubError),
}

#[derive(Debug, Default)]
struct SubscriberShared {
    cancelled: AtomicBool,
    // held while a handler runs, so unsubscribe can wait out an in-flight delivery
    gate: Mutex<()>,
    // set before the sender is dropped
    termination: Mutex<Option<Termination>>,
}

struct Slot<T> {
    tx: mpsc::Sender<Envelope<T>>,
    shared: Arc<SubscriberShared>,
    missed: u32,
}

struct Registry<T> {
    slots: HashMap<SubscriptionId, Slot<T>>,
    sequence: u64,
    closed: bool,
}

struct HubInner<T> {
    team_id: TeamId,
    registry: Mutex<Registry<T>>,
    buffer: usize,
    overflow_limit: u32,
}

trait Detach: Send + Sync {
    fn detach(&self, id: SubscriptionId);
}

impl<T: Send> Detach for HubInner<T> {
    fn detach(&self, id: SubscriptionId) {
        if lock(&self.registry).slots.remove(&id).is_some() {
            debug!(team = %self.team_id, subscription = %id, "unsubscribed");
        }
    }
}

/// What a publish did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub sequence: u64,
    pub delivered: usize,
    pub disconnected: Vec<SubscriptionId>,
}

pub struct SubscriptionHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for SubscriptionHub<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + 'static> SubscriptionHub<T> {
    pub fn new(team_id: TeamId, buffer: usize, overflow_limit: u32) -> Self {
        Self {
            inner: Arc::new(HubInner {
                team_id,
                registry: Mutex::new(Registry {
                    slots: HashMap::new(),
                    sequence: 0,
                    closed: false,
                }),
                buffer: buffer.max(1),
                overflow_limit: overflow_limit.max(1),
            }),
        }
    }

    pub fn team_id(&self) -> TeamId {
        self.inner.team_id
    }

    /// Register a subscriber. it sees every message published from now on, no history.
    pub fn subscribe(&self) -> Result<Subscription<T>, HubError> {
        let mut registry = lock(&self.inner.registry);
        if registry.closed {
            return Err(HubError::Closed(self.inner.team_id));
        }

        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let shared = Arc::new(SubscriberShared::default());
        registry.slots.insert(
            id,
            Slot {
                tx,
                shared: Arc::clone(&shared),
                missed: 0,
            },
        );
        drop(registry);

        let hub: Weak<dyn Detach> = Arc::downgrade(&self.inner) as Weak<dyn Detach>;
        debug!(team = %self.inner.team_id, subscription = %id, "subscribed");
        Ok(Subscription {
            team_id: self.inner.team_id,
            rx,
            handle: UnsubscribeHandle { id, shared, hub },
            done: false,
        })
    }

    /// Hand `event` to every registered subscriber. None once the hub is closed.
    pub fn publish(&self, event: T) -> Option<PublishReport> {
        let mut registry = lock(&self.inner.registry);
        if registry.closed {
            return None;
        }
        registry.sequence += 1;
        let envelope = Envelope {
            team_id: self.inner.team_id,
            sequence: registry.sequence,
            event,
        };

        let limit = self.inner.overflow_limit;
        let mut report = PublishReport {
            sequence: envelope.sequence,
            ..PublishReport::default()
        };
        let mut overflowed = Vec::new();
        let mut gone = Vec::new();

        for (id, slot) in registry.slots.iter_mut() {
            if slot.shared.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            match slot.tx.try_send(envelope.clone()) {
                Ok(()) => {
                    slot.missed = 0;
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    slot.missed += 1;
                    if slot.missed >= limit {
                        overflowed.push((*id, slot.missed));
                    }
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }

        for id in gone {
            registry.slots.remove(&id);
        }
        for (id, missed) in overflowed {
            if let Some(slot) = registry.slots.remove(&id) {
                warn!(team = %self.inner.team_id, subscription = %id, missed, "disconnecting slow subscriber");
                *lock(&slot.shared.termination) = Some(Termination::Failed(HubError::Overflow { missed }));
                report.disconnected.push(id);
            }
        }
        Some(report)
    }

    /// Upstream fault: every current subscriber gets `Failed` once and is completed.
    /// The hub stays open for new subscribers.
    pub fn fail(&self, reason: &str) -> usize {
        self.terminate_all(|| Termination::Failed(HubError::Upstream { reason: reason.to_string() }), false)
    }

    /// Teardown: every subscriber gets `Completed`, later subscribes are refused.
    pub fn close(&self) -> usize {
        self.terminate_all(|| Termination::Completed, true)
    }

    fn terminate_all(&self, termination: impl Fn() -> Termination, close: bool) -> usize {
        let mut registry = lock(&self.inner.registry);
        registry.closed |= close;
        let slots: Vec<Slot<T>> = registry.slots.drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            *lock(&slot.shared.termination) = Some(termination());
        }
        // senders drop here, after every termination is in place
        slots.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.registry).slots.len()
    }

    pub fn last_sequence(&self) -> u64 {
        lock(&self.inner.registry).sequence
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.registry).closed
    }
}

/// Cancels one subscription. Cheap to clone, safe to call from any thread, idempotent.
#[derive(Clone)]
pub struct UnsubscribeHandle {
    id: SubscriptionId,
    shared: Arc<SubscriberShared>,
    hub: Weak<dyn Detach>,
}

impl fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsubscribeHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl UnsubscribeHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Blocks only while a handler for this subscription is mid-call on another thread.
    /// Calling it from inside that handler returns immediately.
    pub fn unsubscribe(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(self.id);
        }
        let inside_handler = DELIVERING.with(|current| current.get() == Some(self.id));
        if !inside_handler {
            drop(lock(&self.shared.gate));
        }
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    team_id: TeamId,
    rx: mpsc::Receiver<Envelope<T>>,
    handle: UnsubscribeHandle,
    done: bool,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("team_id", &self.team_id)
            .field("id", &self.handle.id)
            .field("done", &self.done)
            .finish()
    }
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.handle.id
    }

    pub fn team_id(&self) -> TeamId {
        self.team_id
    }

    pub fn handle(&self) -> UnsubscribeHandle {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }

    /// Next message, then at most one terminal event, then None forever.
    /// Returns None right away once unsubscribed, even if messages were buffered.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent<T>> {
        if self.done {
            return None;
        }
        let next = self.rx.recv().await;
        let cancelled = self.handle.is_cancelled();

        match next {
            Some(envelope) if !cancelled => Some(SubscriptionEvent::Message(envelope)),
            Some(_) => {
                self.done = true;
                None
            }
            None => {
                self.done = true;
                if cancelled {
                    return None;
                }
                match lock(&self.handle.shared.termination).take() {
                    Some(Termination::Completed) => Some(SubscriptionEvent::Completed),
                    Some(Termination::Failed(error)) => Some(SubscriptionEvent::Failed(error)),
                    None => None,
                }
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

/// Run `deliver` for every event of `subscription` on its own task.
/// A handler call never starts after the returned handle's `unsubscribe()` has returned.
pub fn drive<T, F>(mut subscription: Subscription<T>, mut deliver: F) -> (UnsubscribeHandle, JoinHandle<()>)
where
    T: Send + 'static,
    F: FnMut(SubscriptionEvent<T>) + Send + 'static,
{
    let handle = subscription.handle();
    let id = handle.id;
    let shared = Arc::clone(&handle.shared);

    let task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let _gate = lock(&shared.gate);
            if shared.cancelled.load(Ordering::SeqCst) {
                break;
            }
            DELIVERING.with(|current| current.set(Some(id)));
            deliver(event);
            DELIVERING.with(|current| current.set(None));
        }
    });
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn hub(buffer: usize) -> SubscriptionHub<u32> {
        SubscriptionHub::new(TeamId::new(), buffer, 2)
    }

    async fn next_value(sub: &mut Subscription<u32>) -> Option<u32> {
        match sub.recv().await {
            Some(SubscriptionEvent::Message(envelope)) => Some(envelope.event),
            _ => None,
        }
    }

    #[tokio::test]
    async fn fans_out_in_publish_order() {
        let hub = hub(16);
        let mut a = hub.subscribe().unwrap();
        let mut b = hub.subscribe().unwrap();

        for value in 1..=5 {
            let report = hub.publish(value).unwrap();
            assert_eq!(report.delivered, 2);
        }

        for expected in 1..=5 {
            assert_eq!(next_value(&mut a).await, Some(expected));
            assert_eq!(next_value(&mut b).await, Some(expected));
        }
    }

    #[tokio::test]
    async fn no_history_for_late_subscribers() {
        let hub = hub(16);
        hub.publish(1);
        let mut late = hub.subscribe().unwrap();
        hub.publish(2);

        match late.recv().await {
            Some(SubscriptionEvent::Message(envelope)) => {
                assert_eq!(envelope.event, 2);
                assert_eq!(envelope.sequence, 2);
            }
            other => panic!("unexpected {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn unsubscribe_drops_buffered_messages() {
        let hub = hub(16);
        let mut sub = hub.subscribe().unwrap();
        hub.publish(1);
        hub.publish(2);

        sub.unsubscribe();
        sub.unsubscribe();
        hub.publish(3);

        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected() {
        let hub = hub(1);
        let mut slow = hub.subscribe().unwrap();
        let mut fast = hub.subscribe().unwrap();

        let mut disconnected = Vec::new();
        for value in 1..=3 {
            let report = hub.publish(value).unwrap();
            disconnected.extend(report.disconnected);
            assert_eq!(next_value(&mut fast).await, Some(value));
        }

        assert_eq!(disconnected, vec![slow.id()]);
        assert_eq!(next_value(&mut slow).await, Some(1));
        assert!(matches!(
            slow.recv().await,
            Some(SubscriptionEvent::Failed(HubError::Overflow { missed: 2 }))
        ));
        assert!(slow.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn fail_reports_once_and_stays_open() {
        let hub = hub(4);
        let mut sub = hub.subscribe().unwrap();
        assert_eq!(hub.fail("boom"), 1);

        assert!(matches!(sub.recv().await, Some(SubscriptionEvent::Failed(HubError::Upstream { .. }))));
        assert!(sub.recv().await.is_none());
        assert!(hub.subscribe().is_ok());
    }

    #[tokio::test]
    async fn close_completes_and_refuses() {
        let hub = hub(4);
        let mut sub = hub.subscribe().unwrap();
        hub.publish(7).unwrap();
        assert_eq!(hub.close(), 1);
        assert!(hub.is_closed());

        assert_eq!(next_value(&mut sub).await, Some(7));
        assert!(matches!(sub.recv().await, Some(SubscriptionEvent::Completed)));
        assert!(matches!(hub.subscribe(), Err(HubError::Closed(_))));
        assert!(hub.publish(1).is_none());
        assert_eq!(hub.last_sequence(), 1);
    }

    #[tokio::test]
    async fn driven_handler_stops_at_unsubscribe() {
        let hub = hub(64);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let (handle, task) = drive(hub.subscribe().unwrap(), move |event| {
            if let SubscriptionEvent::Message(_) = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        hub.publish(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.unsubscribe();
        let after = seen.load(Ordering::SeqCst);
        for value in 2..10 {
            hub.publish(value);
        }
        task.await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn unsubscribe_inside_handler_does_not_deadlock() {
        let hub = hub(8);
        let sub = hub.subscribe().unwrap();
        let handle = sub.handle();
        let (_, task) = drive(sub, move |_| handle.unsubscribe());

        hub.publish(1);
        hub.publish(2);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }
}

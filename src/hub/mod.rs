//! EventHub - observer fan-out.
//!
//! ## Responsibilities
//!
//! - Observer registration (attach / detach) and the live observer count
//! - Delivering every published event to every attached observer
//! - Per-observer bandwidth accounting
//!
//! Each observer owns a bounded queue. A send that cannot complete within
//! `send_timeout` (stalled reader) or that hits a closed queue is a delivery
//! failure: the observer is detached after the publish iteration finishes.
//! A failing observer never prevents delivery to the others.
//!
//! `publish` calls are serialized, so each observer sees events in publish
//! order. The observer set is never mutated while a publish is iterating it.

mod event;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;

pub use event::{DoorLockedEvent, DoorUnlockedEvent, FrameEvent, OutboundEvent};

/// Opaque observer identity, used for removal and accounting only.
pub type ObserverId = u64;

#[derive(Clone, Debug, PartialEq)]
pub struct HubConfig {
    /// Per-observer queue depth (serialized events).
    pub queue_depth: usize,
    /// Upper bound for handing one event to one observer.
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_depth: 8,
            send_timeout: Duration::from_millis(500),
        }
    }
}

/// Failed delivery to one observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    Closed(ObserverId),
    TimedOut(ObserverId),
}

impl DeliveryError {
    pub fn observer(&self) -> ObserverId {
        match self {
            DeliveryError::Closed(id) | DeliveryError::TimedOut(id) => *id,
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Closed(id) => write!(f, "observer {} closed its queue", id),
            DeliveryError::TimedOut(id) => write!(f, "observer {} timed out", id),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Receiving side handed to an attached observer.
pub struct Observer {
    pub id: ObserverId,
    pub rx: mpsc::Receiver<Arc<str>>,
}

/// Outcome of one publish.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub delivered: usize,
    pub failures: Vec<DeliveryError>,
}

/// Per-observer delivery statistics.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ObserverStats {
    pub id: ObserverId,
    pub label: String,
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub connected_secs: u64,
}

struct ObserverEntry {
    tx: mpsc::Sender<Arc<str>>,
    label: String,
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    attached_at: Instant,
}

impl ObserverEntry {
    fn account(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct EventHub {
    observers: RwLock<HashMap<ObserverId, Arc<ObserverEntry>>>,
    publish_order: Mutex<()>,
    next_id: AtomicU64,
    count_tx: watch::Sender<usize>,
    config: HubConfig,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            observers: RwLock::new(HashMap::new()),
            publish_order: Mutex::new(()),
            next_id: AtomicU64::new(1),
            count_tx,
            config,
        }
    }

    /// Register an observer. `greeting`, when given, is the first event in its queue.
    pub async fn attach(&self, label: impl Into<String>, greeting: Option<&OutboundEvent>) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let entry = Arc::new(ObserverEntry {
            tx,
            label: label.into(),
            bytes_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            attached_at: Instant::now(),
        });

        if let Some(event) = greeting {
            match event.to_envelope_json() {
                Ok(json) => {
                    let len = json.len();
                    if entry.tx.try_send(Arc::from(json)).is_ok() {
                        entry.account(len);
                    }
                }
                Err(err) => log::error!("EventHub: failed to serialize greeting: {}", err),
            }
        }

        // announced under the write lock: the watched count always matches the set
        let count = {
            let mut observers = self.observers.write().await;
            observers.insert(id, Arc::clone(&entry));
            let count = observers.len();
            self.count_tx.send_replace(count);
            count
        };
        log::info!(
            "EventHub: observer {} ({}) attached, {} total",
            id,
            entry.label,
            count
        );
        Observer { id, rx }
    }

    /// Remove an observer. Returns false when it was not attached.
    pub async fn detach(&self, id: ObserverId) -> bool {
        let (removed, count) = {
            let mut observers = self.observers.write().await;
            let removed = observers.remove(&id);
            let count = observers.len();
            if removed.is_some() {
                self.count_tx.send_replace(count);
            }
            (removed, count)
        };
        let Some(entry) = removed else {
            return false;
        };
        log::info!(
            "EventHub: observer {} ({}) detached after {}s, sent {} messages / {} bytes, {} remaining",
            id,
            entry.label,
            entry.attached_at.elapsed().as_secs(),
            entry.messages_sent.load(Ordering::Relaxed),
            entry.bytes_sent.load(Ordering::Relaxed),
            count
        );
        true
    }

    /// Deliver `event` to every attached observer.
    pub async fn publish(&self, event: &OutboundEvent) -> PublishReport {
        let json: Arc<str> = match event.to_envelope_json() {
            Ok(json) => Arc::from(json),
            Err(err) => {
                log::error!("EventHub: failed to serialize {} event: {}", event.kind(), err);
                return PublishReport::default();
            }
        };

        let _order = self.publish_order.lock().await;
        let report = {
            let observers = self.observers.read().await;
            let timeout = self.config.send_timeout;
            let sends = observers.iter().map(|(id, entry)| {
                let json = Arc::clone(&json);
                async move {
                    let len = json.len();
                    match entry.tx.send_timeout(json, timeout).await {
                        Ok(()) => {
                            entry.account(len);
                            Ok(())
                        }
                        Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed(*id)),
                        Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::TimedOut(*id)),
                    }
                }
            });

            let mut report = PublishReport::default();
            for result in join_all(sends).await {
                match result {
                    Ok(()) => report.delivered += 1,
                    Err(err) => {
                        log::warn!("EventHub: {} delivery failed: {}", event.kind(), err);
                        report.failures.push(err);
                    }
                }
            }
            report
        };

        for failure in &report.failures {
            self.detach(failure.observer()).await;
        }
        report
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Live observer count; changes on every attach and detach.
    pub fn watch_observers(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    pub async fn observer_stats(&self) -> Vec<ObserverStats> {
        let observers = self.observers.read().await;
        let mut stats: Vec<ObserverStats> = observers
            .iter()
            .map(|(id, entry)| ObserverStats {
                id: *id,
                label: entry.label.clone(),
                bytes_sent: entry.bytes_sent.load(Ordering::Relaxed),
                messages_sent: entry.messages_sent.load(Ordering::Relaxed),
                connected_secs: entry.attached_at.elapsed().as_secs(),
            })
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::door::DoorStatus;

    fn status_event() -> OutboundEvent {
        OutboundEvent::DoorStatus(DoorStatus {
            is_unlocked: false,
            lock_duration_secs: 5,
            relock_in_ms: None,
            actuator: "test".into(),
        })
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let hub = EventHub::default();
        let mut first = hub.attach("one", None).await;
        let second = hub.attach("two", None).await;
        let mut third = hub.attach("three", None).await;
        drop(second.rx);

        let report = hub.publish(&status_event()).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures, vec![DeliveryError::Closed(second.id)]);
        assert_eq!(hub.observer_count().await, 2);

        assert!(first.rx.try_recv().is_ok());
        assert!(first.rx.try_recv().is_err());
        assert!(third.rx.try_recv().is_ok());
        assert!(third.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_observer_times_out() {
        let hub = EventHub::new(HubConfig {
            queue_depth: 1,
            send_timeout: Duration::from_millis(50),
        });
        let stalled = hub.attach("stalled", None).await;
        let mut live = hub.attach("live", None).await;

        assert_eq!(hub.publish(&status_event()).await.delivered, 2);
        assert!(live.rx.try_recv().is_ok());

        let report = hub.publish(&status_event()).await;
        assert_eq!(report.failures, vec![DeliveryError::TimedOut(stalled.id)]);
        assert!(live.rx.try_recv().is_ok());
        assert_eq!(hub.observer_count().await, 1);
    }

    #[tokio::test]
    async fn greeting_is_first_and_counted() {
        let hub = EventHub::default();
        let mut observer = hub.attach("viewer", Some(&status_event())).await;
        let greeting = observer.rx.try_recv().unwrap_or_else(|_| Arc::from(""));
        assert!(greeting.contains("\"door_status\""));

        let stats = hub.observer_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].messages_sent, 1);
        assert_eq!(stats[0].bytes_sent, greeting.len() as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn count_watch_settles_on_set_size_under_churn() {
        let hub = Arc::new(EventHub::default());
        let rx = hub.watch_observers();
        let anchor = hub.attach("anchor", None).await;

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..200 {
            let hub = Arc::clone(&hub);
            tasks.spawn(async move {
                let observer = hub.attach(format!("churn-{}", i), None).await;
                tokio::task::yield_now().await;
                hub.detach(observer.id).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(*rx.borrow(), 1);
        assert_eq!(hub.observer_count().await, 1);
        assert!(hub.detach(anchor.id).await);
        assert_eq!(*rx.borrow(), 0);
    }

    #[tokio::test]
    async fn count_watch_tracks_membership() {
        let hub = EventHub::default();
        let rx = hub.watch_observers();
        let observer = hub.attach("viewer", None).await;
        assert_eq!(*rx.borrow(), 1);
        assert!(hub.detach(observer.id).await);
        assert!(!hub.detach(observer.id).await);
        assert_eq!(*rx.borrow(), 0);
    }
}

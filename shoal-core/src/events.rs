//! Typed event dispatcher for loader telemetry.
//!
//! Subscribers register a closure per `EventKind`. Dispatch is synchronous
//! and happens on the loader task, so closures must be cheap.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::peer::PeerId;
use crate::request::{DownloadSource, RequestError};
use crate::stream::{SegmentKey, StreamId};

/// Discriminant used to subscribe to a family of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SegmentLoaded,
    SegmentError,
    SegmentAbort,
    SegmentStart,
    PeerConnect,
    PeerClose,
    PeerError,
    ChunkDownloaded,
    ChunkUploaded,
    TrackerError,
    TrackerWarning,
}

/// Telemetry emitted by the loader.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    SegmentLoaded {
        key: SegmentKey,
        bytes: u64,
        source: DownloadSource,
        peer: Option<PeerId>,
    },
    SegmentError {
        key: SegmentKey,
        error: RequestError,
        source: DownloadSource,
        peer: Option<PeerId>,
    },
    SegmentAbort {
        key: SegmentKey,
        source: Option<DownloadSource>,
        peer: Option<PeerId>,
    },
    SegmentStart {
        key: SegmentKey,
        source: DownloadSource,
        peer: Option<PeerId>,
    },
    PeerConnect {
        peer: PeerId,
        stream: StreamId,
    },
    PeerClose {
        peer: PeerId,
        stream: StreamId,
    },
    PeerError {
        peer: PeerId,
        stream: StreamId,
        reason: String,
    },
    ChunkDownloaded {
        bytes: u64,
        source: DownloadSource,
        peer: Option<PeerId>,
    },
    ChunkUploaded {
        bytes: u64,
        peer: PeerId,
    },
    TrackerError {
        reason: String,
    },
    TrackerWarning {
        reason: String,
    },
}

impl CoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoreEvent::SegmentLoaded { .. } => EventKind::SegmentLoaded,
            CoreEvent::SegmentError { .. } => EventKind::SegmentError,
            CoreEvent::SegmentAbort { .. } => EventKind::SegmentAbort,
            CoreEvent::SegmentStart { .. } => EventKind::SegmentStart,
            CoreEvent::PeerConnect { .. } => EventKind::PeerConnect,
            CoreEvent::PeerClose { .. } => EventKind::PeerClose,
            CoreEvent::PeerError { .. } => EventKind::PeerError,
            CoreEvent::ChunkDownloaded { .. } => EventKind::ChunkDownloaded,
            CoreEvent::ChunkUploaded { .. } => EventKind::ChunkUploaded,
            CoreEvent::TrackerError { .. } => EventKind::TrackerError,
            CoreEvent::TrackerWarning { .. } => EventKind::TrackerWarning,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Subscriber = Arc<dyn Fn(&CoreEvent) + Send + Sync>;

/// Mapping from event kind to subscriber closures.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, Subscriber)>>,
    next_id: u64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, subscriber: Subscriber) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, subscriber));
        id
    }

    /// Removes a subscription, returning whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for subscribers in self.subscribers.values_mut() {
            if let Some(index) = subscribers.iter().position(|(sub_id, _)| *sub_id == id) {
                subscribers.remove(index);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }

    fn subscribers_for(&self, kind: EventKind) -> Vec<Subscriber> {
        self.subscribers
            .get(&kind)
            .map(|subscribers| subscribers.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default()
    }
}

/// Shared dispatcher, written by handles and read by the loader task.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<EventDispatcher>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, subscriber: F) -> SubscriptionId
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        self.inner.write().subscribe(kind, Arc::new(subscriber))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.write().unsubscribe(id)
    }

    /// Calls every subscriber of the event's kind.
    ///
    /// The lock is released before subscribers run, so a subscriber may
    /// itself subscribe or unsubscribe.
    pub fn emit(&self, event: CoreEvent) {
        let subscribers = self.inner.read().subscribers_for(event.kind());
        for subscriber in subscribers {
            subscriber(&event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner.read().subscriber_count(kind)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn tracker_warning() -> CoreEvent {
        CoreEvent::TrackerWarning {
            reason: "slow".to_string(),
        }
    }

    #[test]
    fn test_emit_reaches_only_matching_kind() {
        let bus = EventBus::new();
        let warnings = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&warnings);
        bus.subscribe(EventKind::TrackerWarning, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&errors);
        bus.subscribe(EventKind::TrackerError, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(tracker_warning());

        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = bus.subscribe(EventKind::TrackerWarning, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(tracker_warning());

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(EventKind::TrackerWarning), 0);
    }

    #[test]
    fn test_subscriber_can_subscribe_during_dispatch() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        bus.subscribe(EventKind::TrackerWarning, move |_| {
            inner_bus.subscribe(EventKind::TrackerError, |_| {});
        });

        bus.emit(tracker_warning());

        assert_eq!(bus.subscriber_count(EventKind::TrackerError), 1);
    }
}

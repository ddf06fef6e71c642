// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Event Bus
//!
//! This module provides the event surface of the client: a named,
//! multi-subscriber channel carrying connection, channel, message and
//! shutdown lifecycle events. Subscribers are invoked synchronously in
//! registration order; a panicking subscriber is logged and skipped so the
//! remaining subscribers still observe the event.

use crate::driver::ReturnedMessage;
use crate::errors::AmqpError;
use crate::metrics::MetricsSnapshot;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::error;

/// Lifecycle events emitted by the client.
#[derive(Debug, Clone)]
pub enum Event {
    /// Start of any connect attempt
    Connecting,
    /// Successful connect
    Connected,
    /// Driver-reported connection error
    ConnectionError(AmqpError),
    /// Driver-reported connection close
    ConnectionClosed,
    /// All connect retries exhausted
    ConnectionFailed(AmqpError),
    /// Driver-reported channel error
    ChannelError(AmqpError),
    /// Channel closed
    ChannelClosed,
    /// Channel write buffer drained
    ChannelDrain,
    /// Broker returned an unroutable mandatory publish
    MessageReturned(ReturnedMessage),
    /// Periodic metrics emission, also fired on every counter update
    Metrics(MetricsSnapshot),
    /// Start of a reconnect cycle
    Reconnecting,
    /// Reconnect succeeded
    Reconnected,
    /// Reconnect retries exhausted
    ReconnectFailed(AmqpError),
    /// Broker flow control applied, with the broker-supplied reason
    Blocked(String),
    /// Broker flow control cleared
    Unblocked,
    /// Any error routed through the central error handler
    Error(AmqpError),
    /// Client fully shut down
    Closed,
}

impl Event {
    /// The name of this event, usable for kind-filtered subscriptions.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connecting => EventKind::Connecting,
            Event::Connected => EventKind::Connected,
            Event::ConnectionError(_) => EventKind::ConnectionError,
            Event::ConnectionClosed => EventKind::ConnectionClosed,
            Event::ConnectionFailed(_) => EventKind::ConnectionFailed,
            Event::ChannelError(_) => EventKind::ChannelError,
            Event::ChannelClosed => EventKind::ChannelClosed,
            Event::ChannelDrain => EventKind::ChannelDrain,
            Event::MessageReturned(_) => EventKind::MessageReturned,
            Event::Metrics(_) => EventKind::Metrics,
            Event::Reconnecting => EventKind::Reconnecting,
            Event::Reconnected => EventKind::Reconnected,
            Event::ReconnectFailed(_) => EventKind::ReconnectFailed,
            Event::Blocked(_) => EventKind::Blocked,
            Event::Unblocked => EventKind::Unblocked,
            Event::Error(_) => EventKind::Error,
            Event::Closed => EventKind::Closed,
        }
    }
}

/// Discriminant of [`Event`] used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    ConnectionError,
    ConnectionClosed,
    ConnectionFailed,
    ChannelError,
    ChannelClosed,
    ChannelDrain,
    MessageReturned,
    Metrics,
    Reconnecting,
    Reconnected,
    ReconnectFailed,
    Blocked,
    Unblocked,
    Error,
    Closed,
}

/// Handler invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifier returned by `subscribe`, usable with `unsubscribe`.
pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Ordered multicast of lifecycle events.
///
/// Emission is synchronous: every matching subscriber runs on the emitting
/// task, in registration order. Once sealed (after the terminating `Closed`
/// event), further emissions are dropped.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    sealed: AtomicBool,
}

impl EventBus {
    /// Registers a handler for every event.
    pub(crate) fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        self.register(None, handler)
    }

    /// Registers a handler for a single event kind.
    pub(crate) fn subscribe_kind(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.register(Some(kind), handler)
    }

    fn register(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .push(Subscriber { id, kind, handler });
        id
    }

    /// Removes a subscription; unknown ids are ignored.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .retain(|sub| sub.id != id);
    }

    /// Delivers the event to every matching subscriber in registration order.
    pub(crate) fn emit(&self, event: Event) {
        if self.sealed.load(Ordering::Acquire) {
            return;
        }

        let handlers: Vec<EventHandler> = {
            let subscribers = self.subscribers.read().expect("event bus lock poisoned");
            subscribers
                .iter()
                .filter(|sub| sub.kind.map_or(true, |kind| kind == event.kind()))
                .map(|sub| sub.handler.clone())
                .collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(event = ?event.kind(), "event subscriber panicked");
            }
        }
    }

    /// Emits the terminating event and drops everything after it.
    pub(crate) fn emit_closed_and_seal(&self) {
        self.emit(Event::Closed);
        self.sealed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<EventKind>>>) {
        let bus = Arc::new(EventBus::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(Arc::new(move |event| {
            sink.lock().unwrap().push(event.kind());
        }));
        (bus, seen)
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(Arc::new(move |_| order.lock().unwrap().push(tag)));
        }

        bus.emit(Event::Connected);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_later_ones() {
        let bus = EventBus::default();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe(Arc::new(|_| panic!("boom")));
        let flag = reached.clone();
        bus.subscribe(Arc::new(move |_| *flag.lock().unwrap() = true));

        bus.emit(Event::Connecting);
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn kind_filter_selects_matching_events() {
        let bus = EventBus::default();
        let hits = Arc::new(Mutex::new(0u32));

        let counter = hits.clone();
        bus.subscribe_kind(
            EventKind::Reconnected,
            Arc::new(move |_| *counter.lock().unwrap() += 1),
        );

        bus.emit(Event::Reconnecting);
        bus.emit(Event::Reconnected);
        bus.emit(Event::Connected);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (bus, seen) = recording_bus();
        let extra = {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |event| {
                seen.lock().unwrap().push(event.kind());
            }))
        };

        bus.unsubscribe(extra);
        bus.emit(Event::Connected);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn sealed_bus_drops_everything_after_closed() {
        let (bus, seen) = recording_bus();

        bus.emit_closed_and_seal();
        bus.emit(Event::Connected);
        bus.emit(Event::Error(AmqpError::not_connected("publish")));

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Closed]);
    }
}

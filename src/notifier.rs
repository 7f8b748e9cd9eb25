// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Received-Message Notifications
//!
//! Lets the embedding application observe every decoded message without
//! touching the broker API. Subscribers run synchronously, in registration
//! order, before the delivery is acknowledged.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tracing::warn;

/// Action tag carried by the notification fired for each received message.
pub const CONSUMER_RECEIVED: &str = "Consumer_Received";

/// Notification payload handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEvent {
    pub action: String,
    pub value: String,
}

impl ConsumerEvent {
    /// Event raised once per received delivery.
    pub fn received(text: &str) -> Self {
        ConsumerEvent {
            action: CONSUMER_RECEIVED.to_owned(),
            value: text.to_owned(),
        }
    }
}

/// Handle returned by [`EventNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&ConsumerEvent) + Send + Sync>;

/// Observer registry broadcasting [`ConsumerEvent`]s.
#[derive(Default)]
pub struct EventNotifier {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        EventNotifier::default()
    }

    /// Registers a subscriber.
    ///
    /// # Parameters
    /// * `subscriber` - Callback invoked with every event
    ///
    /// # Returns
    /// An id that can later be passed to [`EventNotifier::unsubscribe`]
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&ConsumerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Removes a subscriber. Returns `false` if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Invokes every subscriber with `event`.
    ///
    /// A subscriber that panics is logged and skipped; the others still run.
    /// Subscribers are called on a snapshot taken without holding the lock, so
    /// they may subscribe or unsubscribe from inside the callback.
    ///
    /// # Returns
    /// The number of subscribers that completed normally
    pub fn notify(&self, event: &ConsumerEvent) -> usize {
        let subscribers: Vec<(SubscriptionId, Subscriber)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut completed = 0;
        for (id, subscriber) in subscribers.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(()) => completed += 1,
                Err(_) => warn!(
                    subscription = id.0,
                    action = event.action.as_str(),
                    "event subscriber panicked"
                ),
            }
        }
        completed
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module implements what happens to a single delivery. It:
//! 1. Decodes the body as UTF-8
//! 2. Resolves the configured handler and invokes it with the text
//! 3. Broadcasts a received-message event to the host's subscribers
//! 4. Acks the delivery on success, or nacks it without requeue on failure
//!
//! Every failure local to one delivery (bad encoding, handler error, handler
//! panic, subscriber panic, ack transport error) is contained here so the
//! consume loop keeps running.

use crate::{
    config::AckMode,
    errors::AmqpError,
    handler::{HandlerError, HandlerResolver},
    notifier::{ConsumerEvent, EventNotifier},
    otel,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    Channel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, str::Utf8Error, sync::Arc};
use thiserror::Error;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// One message handed over by the broker.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub properties: AMQPProperties,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Delivery {
            delivery_tag,
            body: body.into(),
            ..Default::default()
        }
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            body: delivery.data,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
        }
    }
}

/// Why a delivery could not be processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("message body is not valid utf-8: {0}")]
    Decode(#[from] Utf8Error),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Leads to an ack.
    Success,
    /// Leads to a nack without requeue.
    Failure(DispatchFailure),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success)
    }
}

/// Records the terminal decision for a delivery with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledges exactly one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negatively acknowledges exactly one delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

/// Turns deliveries into handler calls, notifications and ack decisions.
pub struct DispatchPipeline {
    queue: String,
    capability: Option<String>,
    resolver: Arc<dyn HandlerResolver>,
    notifier: Arc<EventNotifier>,
    ack_mode: AckMode,
}

impl DispatchPipeline {
    /// Creates a new pipeline.
    ///
    /// # Parameters
    /// * `queue` - Queue the deliveries come from (used as span name)
    /// * `capability` - Handler name to resolve; `None` skips the handler step
    /// * `resolver` - Looks up the handler for every delivery
    /// * `notifier` - Receives one event per decoded delivery
    /// * `ack_mode` - Whether this pipeline records ack decisions itself
    pub fn new(
        queue: &str,
        capability: Option<String>,
        resolver: Arc<dyn HandlerResolver>,
        notifier: Arc<EventNotifier>,
        ack_mode: AckMode,
    ) -> Self {
        DispatchPipeline {
            queue: queue.to_owned(),
            capability,
            resolver,
            notifier,
            ack_mode,
        }
    }

    /// Processes a delivery and records its ack decision.
    ///
    /// Never fails: problems with the delivery become a
    /// [`DispatchOutcome::Failure`] and problems reaching the broker are
    /// logged.
    ///
    /// # Parameters
    /// * `acker` - Channel (or stand-in) to ack/nack on
    /// * `delivery` - The delivery to process
    ///
    /// # Returns
    /// The outcome that decided between ack and nack
    pub async fn dispatch<A>(&self, acker: &A, delivery: Delivery) -> DispatchOutcome
    where
        A: Acknowledger + ?Sized,
    {
        let (_, mut span) = otel::new_span(
            &delivery.properties,
            &global::tracer("amqp consumer"),
            &self.queue,
        );

        debug!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            queue = self.queue.as_str(),
            "received"
        );

        let outcome = self.process(&delivery).await;
        match &outcome {
            DispatchOutcome::Success => {
                debug!(delivery_tag = delivery.delivery_tag, "message successfully processed");
                span.set_status(Status::Ok);
            }
            DispatchOutcome::Failure(cause) => {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    body = %String::from_utf8_lossy(&delivery.body),
                    error = %cause,
                    "failure to process message, removing it from queue"
                );
                span.record_error(cause);
                span.set_status(Status::Error {
                    description: Cow::from(cause.to_string()),
                });
            }
        }

        if let Err(err) = self
            .acknowledge(acker, delivery.delivery_tag, &outcome)
            .await
        {
            error!(
                error = err.to_string(),
                delivery_tag = delivery.delivery_tag,
                "failure to record ack decision"
            );
            span.record_error(&err);
        }

        outcome
    }

    /// Decodes the body, runs the handler and notifies subscribers.
    ///
    /// Subscribers are notified whenever the body decoded, whatever the handler
    /// returned.
    pub async fn process(&self, delivery: &Delivery) -> DispatchOutcome {
        let text = match std::str::from_utf8(&delivery.body) {
            Ok(text) => text,
            Err(err) => return DispatchOutcome::Failure(err.into()),
        };

        let outcome = self.invoke_handler(text).await;

        self.notifier.notify(&ConsumerEvent::received(text));

        outcome
    }

    /// Acks on success and nacks without requeue on failure. Does nothing when
    /// the broker auto-acknowledges.
    pub async fn acknowledge<A>(
        &self,
        acker: &A,
        delivery_tag: u64,
        outcome: &DispatchOutcome,
    ) -> Result<(), AmqpError>
    where
        A: Acknowledger + ?Sized,
    {
        if self.ack_mode == AckMode::Auto {
            return Ok(());
        }

        match outcome {
            DispatchOutcome::Success => acker.ack(delivery_tag).await,
            DispatchOutcome::Failure(_) => acker.nack(delivery_tag, false).await,
        }
    }

    async fn invoke_handler(&self, text: &str) -> DispatchOutcome {
        let Some(name) = self.capability.as_deref() else {
            return DispatchOutcome::Success;
        };

        let Some(handler) = self.resolver.resolve(name) else {
            debug!(capability = name, "no handler resolved, skipping");
            return DispatchOutcome::Success;
        };

        match AssertUnwindSafe(handler.handle(text)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Success,
            Ok(Err(err)) => DispatchOutcome::Failure(err.into()),
            Err(payload) => DispatchOutcome::Failure(DispatchFailure::Panicked(panic_message(
                payload.as_ref(),
            ))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerRegistry, MessageHandler, MockHandlerResolver, MockMessageHandler};
    use mockall::predicate::eq;
    use std::sync::Mutex;

    struct PanickingHandler;

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle(&self, _text: &str) -> Result<(), HandlerError> {
            panic!("handler bug")
        }
    }

    fn pipeline_with(
        capability: Option<&str>,
        resolver: Arc<dyn HandlerResolver>,
        notifier: Arc<EventNotifier>,
    ) -> DispatchPipeline {
        DispatchPipeline::new(
            "orders",
            capability.map(str::to_owned),
            resolver,
            notifier,
            AckMode::Manual,
        )
    }

    fn handler_returning(result: Result<(), HandlerError>) -> Arc<dyn MessageHandler> {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .returning(move |_| result.clone());
        Arc::new(handler)
    }

    fn recording_notifier() -> (Arc<EventNotifier>, Arc<Mutex<Vec<String>>>) {
        let notifier = Arc::new(EventNotifier::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.subscribe(move |event| sink.lock().unwrap().push(event.value.clone()));
        (notifier, seen)
    }

    #[tokio::test]
    async fn successful_handler_acks_once() {
        let registry = HandlerRegistry::new().register("OrderService", handler_returning(Ok(())));
        let pipeline = pipeline_with(
            Some("OrderService"),
            Arc::new(registry),
            Arc::new(EventNotifier::new()),
        );

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));
        acker.expect_nack().never();

        let outcome = pipeline.dispatch(&acker, Delivery::new(7, "order-1")).await;

        assert_eq!(outcome, DispatchOutcome::Success);
    }

    #[tokio::test]
    async fn failing_handler_nacks_without_requeue() {
        let registry = HandlerRegistry::new().register(
            "OrderService",
            handler_returning(Err(HandlerError::new("unknown order"))),
        );
        let pipeline = pipeline_with(
            Some("OrderService"),
            Arc::new(registry),
            Arc::new(EventNotifier::new()),
        );

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(3), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = pipeline.dispatch(&acker, Delivery::new(3, "order-1")).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Failure(DispatchFailure::Handler(HandlerError::new("unknown order")))
        );
    }

    #[tokio::test]
    async fn without_handler_the_message_is_notified_and_acked() {
        let (notifier, seen) = recording_notifier();
        let pipeline = pipeline_with(None, Arc::new(HandlerRegistry::new()), notifier);

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));
        acker.expect_nack().never();

        let outcome = pipeline.dispatch(&acker, Delivery::new(1, b"hello".to_vec())).await;

        assert!(outcome.is_success());
        assert_eq!(*seen.lock().unwrap(), vec!["hello"]);
    }

    #[tokio::test]
    async fn unresolved_capability_counts_as_success() {
        let pipeline = pipeline_with(
            Some("NotRegistered"),
            Arc::new(HandlerRegistry::new()),
            Arc::new(EventNotifier::new()),
        );

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|_| Ok(()));

        assert!(pipeline.dispatch(&acker, Delivery::new(1, "hello")).await.is_success());
    }

    #[tokio::test]
    async fn malformed_utf8_is_nacked_without_notification() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().never();
        let registry = HandlerRegistry::new().register("OrderService", Arc::new(handler));
        let (notifier, seen) = recording_notifier();
        let pipeline = pipeline_with(Some("OrderService"), Arc::new(registry), notifier);

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(9), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = pipeline.dispatch(&acker, Delivery::new(9, vec![0xFF, 0xFE])).await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Failure(DispatchFailure::Decode(_))
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_nacked() {
        let registry = HandlerRegistry::new().register("OrderService", Arc::new(PanickingHandler));
        let pipeline = pipeline_with(
            Some("OrderService"),
            Arc::new(registry),
            Arc::new(EventNotifier::new()),
        );

        let mut acker = MockAcknowledger::new();
        acker
            .expect_nack()
            .with(eq(4), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = pipeline.dispatch(&acker, Delivery::new(4, "boom")).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Failure(DispatchFailure::Panicked("handler bug".to_owned()))
        );
    }

    #[tokio::test]
    async fn failed_handler_still_notifies_subscribers() {
        let registry = HandlerRegistry::new().register(
            "OrderService",
            handler_returning(Err(HandlerError::new("rejected"))),
        );
        let (notifier, seen) = recording_notifier();
        let pipeline = pipeline_with(Some("OrderService"), Arc::new(registry), notifier);

        let outcome = pipeline.process(&Delivery::new(2, "order-2")).await;

        assert!(!outcome.is_success());
        assert_eq!(*seen.lock().unwrap(), vec!["order-2"]);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_the_ack() {
        let notifier = Arc::new(EventNotifier::new());
        notifier.subscribe(|_| panic!("host bug"));
        let pipeline = pipeline_with(None, Arc::new(HandlerRegistry::new()), notifier);

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().with(eq(5)).times(1).returning(|_| Ok(()));

        assert!(pipeline.dispatch(&acker, Delivery::new(5, "hello")).await.is_success());
    }

    #[tokio::test]
    async fn handler_is_resolved_for_every_delivery() {
        let mut resolver = MockHandlerResolver::new();
        resolver
            .expect_resolve()
            .withf(|name| name == "OrderService")
            .times(2)
            .returning(|_| Some(handler_returning(Ok(()))));
        let pipeline = pipeline_with(
            Some("OrderService"),
            Arc::new(resolver),
            Arc::new(EventNotifier::new()),
        );

        assert!(pipeline.process(&Delivery::new(1, "a")).await.is_success());
        assert!(pipeline.process(&Delivery::new(2, "b")).await.is_success());
    }

    #[tokio::test]
    async fn auto_ack_mode_records_no_decision() {
        let pipeline = DispatchPipeline::new(
            "orders",
            Some("OrderService".to_owned()),
            Arc::new(HandlerRegistry::new().register(
                "OrderService",
                handler_returning(Err(HandlerError::new("rejected"))),
            )),
            Arc::new(EventNotifier::new()),
            AckMode::Auto,
        );

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker.expect_nack().never();

        let outcome = pipeline.dispatch(&acker, Delivery::new(1, "a")).await;

        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn ack_transport_failure_is_logged_not_raised() {
        let pipeline = pipeline_with(
            None,
            Arc::new(HandlerRegistry::new()),
            Arc::new(EventNotifier::new()),
        );

        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError("channel closed".into())));

        assert!(pipeline.dispatch(&acker, Delivery::new(1, "a")).await.is_success());
    }
}

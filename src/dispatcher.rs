// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module subscribes to the configured queue and feeds the resulting
//! delivery stream to the [`DispatchPipeline`]. Deliveries are handled strictly
//! one after another: the next delivery is only pulled once the previous one
//! has its ack decision recorded.

use crate::{
    config::AckMode,
    consumer::{Acknowledger, Delivery, DispatchPipeline},
    errors::AmqpError,
};
use futures_util::{Stream, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use std::{fmt::Display, sync::Arc};
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Why a consume session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The broker side of the stream went away (channel or connection lost).
    StreamClosed,
    /// The host asked the consumer to stop.
    Shutdown,
}

/// Summary of a finished consume session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub handled: u64,
}

/// Subscribes a single queue on a channel and drives its deliveries.
pub struct RabbitMQDispatcher {
    channel: Channel,
    queue: String,
    ack_mode: AckMode,
    pipeline: Arc<DispatchPipeline>,
}

impl RabbitMQDispatcher {
    /// Creates a new RabbitMQ dispatcher.
    ///
    /// # Parameters
    /// * `channel` - An open channel with the queue already declared
    /// * `queue` - Queue to consume from
    /// * `ack_mode` - Manual acknowledgment or broker auto-ack
    /// * `pipeline` - Processing applied to each delivery
    pub fn new(
        channel: Channel,
        queue: &str,
        ack_mode: AckMode,
        pipeline: Arc<DispatchPipeline>,
    ) -> Self {
        RabbitMQDispatcher {
            channel,
            queue: queue.to_owned(),
            ack_mode,
            pipeline,
        }
    }

    /// Registers a consumer on the queue.
    ///
    /// # Returns
    /// The broker's delivery stream, or `BindingConsumerError`
    pub async fn subscribe(&self) -> Result<lapin::Consumer, AmqpError> {
        let consumer_tag = consumer_tag(&self.queue);

        match self
            .channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.ack_mode == AckMode::Auto,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(
                    self.queue.clone(),
                    err.to_string(),
                ))
            }
            Ok(c) => {
                debug!(
                    queue = self.queue.as_str(),
                    consumer_tag = consumer_tag.as_str(),
                    "consumer created"
                );
                Ok(c)
            }
        }
    }

    /// Consumes `consumer` until the stream ends or `shutdown` is notified.
    pub async fn consume_blocking(
        &self,
        consumer: lapin::Consumer,
        shutdown: &Notify,
    ) -> SessionReport {
        let deliveries = consumer.map(|result| result.map(Delivery::from));
        drive(deliveries, &self.pipeline, &self.channel, shutdown).await
    }
}

/// Generates a consumer tag unique to this subscription.
pub fn consumer_tag(queue: &str) -> String {
    format!("{}-{}", queue, Uuid::new_v4())
}

/// Pulls deliveries one at a time and dispatches each before pulling the next.
///
/// The shutdown signal is only observed while waiting for a delivery, so a
/// delivery that has been received always reaches its ack decision. Stream
/// errors are logged and skipped.
///
/// # Parameters
/// * `deliveries` - Ordered delivery stream
/// * `pipeline` - Processing applied to each delivery
/// * `acker` - Where ack decisions are recorded
/// * `shutdown` - Stops the loop between deliveries
///
/// # Returns
/// Why the loop stopped and how many deliveries it handled
pub async fn drive<S, E, A>(
    deliveries: S,
    pipeline: &DispatchPipeline,
    acker: &A,
    shutdown: &Notify,
) -> SessionReport
where
    S: Stream<Item = Result<Delivery, E>>,
    E: Display,
    A: Acknowledger + ?Sized,
{
    let mut deliveries = std::pin::pin!(deliveries);
    let mut handled = 0;

    loop {
        let next = tokio::select! {
            _ = shutdown.notified() => {
                debug!(handled, "shutdown requested, stopping consumer");
                return SessionReport { end: SessionEnd::Shutdown, handled };
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                pipeline.dispatch(acker, delivery).await;
                handled += 1;
            }
            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
            None => {
                warn!(handled, "consumer stream ended");
                return SessionReport {
                    end: SessionEnd::StreamClosed,
                    handled,
                };
            }
        }
    }
}

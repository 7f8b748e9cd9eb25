// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! Attaches to a single durable queue, receives deliveries one at a time
//! (prefetch of one, manual acknowledgment), hands each decoded message to a
//! pluggable handler, notifies host subscribers and acks or nacks the delivery
//! depending on the outcome. Connection loss is recovered by reconnecting at a
//! fixed interval.

mod otel;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod notifier;
pub mod queue;

pub use client::{ConsumerState, RabbitMQConsumer};
pub use config::{
    AckMode, AttributeSource, ConsumerPolicy, EndpointConfig, EnvAttributes, StaticAttributes,
};
pub use consumer::{Acknowledger, Delivery, DispatchFailure, DispatchOutcome, DispatchPipeline};
pub use errors::AmqpError;
pub use handler::{HandlerError, HandlerRegistry, HandlerResolver, MessageHandler};
pub use notifier::{ConsumerEvent, EventNotifier, SubscriptionId, CONSUMER_RECEIVED};

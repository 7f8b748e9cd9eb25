// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Consumer
//!
//! This module provides the error types used across the consumer. `AmqpError`
//! covers every broker-facing operation (connecting, opening a channel, applying
//! flow control, declaring the queue, subscribing, acknowledging). Failures that
//! belong to a single delivery are modelled separately in
//! [`DispatchFailure`](crate::consumer::DispatchFailure) and never surface here.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Every variant carries the broker client's error message so the caller can
/// log or display it without holding on to the underlying `lapin::Error`.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer on queue `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),
}

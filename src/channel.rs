// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module owns the broker connection and the single channel derived from
//! it. Opening a session connects, creates the channel, limits the broker to one
//! unacknowledged delivery for this consumer and declares the target queue.
//! Closing is idempotent and safe from any state, including a session that
//! failed half-way through opening.

use crate::{
    config::{ConsumerPolicy, EndpointConfig},
    errors::AmqpError,
    queue::QueueDefinition,
};
use lapin::{
    options::BasicQosOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, warn};

/// Maximum number of unacknowledged deliveries outstanding for the consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Owns exactly one connection and, while open, exactly one channel.
#[derive(Default)]
pub struct ConnectionManager {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager::default()
    }

    /// Opens a fresh session for `config`, closing any previous one first.
    ///
    /// The steps are, in order:
    /// 1. Close the prior channel and connection
    /// 2. Connect to the broker URI
    /// 3. Create one channel
    /// 4. Apply a per-consumer prefetch of [`PREFETCH_COUNT`]
    /// 5. Declare the queue as durable, non-exclusive and not auto-deleted
    ///
    /// If any step fails, whatever was opened is closed again before the error
    /// is returned.
    ///
    /// # Parameters
    /// * `config` - Broker URI and queue name
    /// * `policy` - Consumer policy (used for the connection name)
    ///
    /// # Returns
    /// The open channel on success, or an error describing the failed step
    pub async fn open(
        &mut self,
        config: &EndpointConfig,
        policy: &ConsumerPolicy,
    ) -> Result<Channel, AmqpError> {
        self.close().await;

        match self.try_open(config, policy).await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }

    async fn try_open(
        &mut self,
        config: &EndpointConfig,
        policy: &ConsumerPolicy,
    ) -> Result<Channel, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &policy.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match Connection::connect(config.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        conn.on_error(|err| {
            warn!(error = err.to_string(), "amqp connection lost");
        });
        debug!("amqp connected");

        let channel = conn.create_channel().await;
        self.connection = Some(conn);

        debug!("creating amqp channel...");
        let channel = match channel {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        self.channel = Some(channel.clone());
        debug!(channel_id = channel.id(), "channel created");

        if let Err(err) = channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let queue = QueueDefinition::new(config.queue()).durable();
        match channel
            .queue_declare(queue.name(), queue.declare_options(), queue.arguments())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue.name(),
                    "failure to declare queue"
                );
                Err(AmqpError::DeclareQueueError(
                    queue.name().to_owned(),
                    err.to_string(),
                ))
            }
            _ => {
                debug!(queue = queue.name(), "queue declared");
                Ok(channel)
            }
        }
    }

    /// Closes the channel and then the connection.
    ///
    /// Each resource is only closed when it reports itself as connected, and
    /// close failures are logged rather than returned, so this can be called any
    /// number of times from any state.
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                debug!(channel_id = channel.id(), "closing amqp channel");
                if let Err(err) = channel.close(200, "consumer shutdown").await {
                    warn!(error = err.to_string(), "failure to close the channel");
                }
            }
        }

        if let Some(conn) = self.connection.take() {
            if conn.status().connected() {
                debug!("closing amqp connection");
                if let Err(err) = conn.close(200, "consumer shutdown").await {
                    warn!(error = err.to_string(), "failure to close the connection");
                }
            }
        }
    }

    /// Whether both the connection and its channel are currently usable.
    pub fn is_open(&self) -> bool {
        let conn_open = self
            .connection
            .as_ref()
            .is_some_and(|c| c.status().connected());
        let channel_open = self
            .channel
            .as_ref()
            .is_some_and(|c| c.status().connected());

        conn_open && channel_open
    }
}

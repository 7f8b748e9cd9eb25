// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! This module resolves the endpoint a consumer attaches to and the policy it
//! runs with. The endpoint is a pair of opaque strings (broker URI and queue
//! name) supplied at construction; empty values fall back to a named-attribute
//! lookup through an [`AttributeSource`]. An endpoint that is still incomplete
//! after the fallback keeps the consumer idle instead of failing.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, time::Duration};

/// Attribute holding the broker URI.
pub const ATTR_CONNECTION_STRING: &str = "ConnectionString";
/// Attribute holding the queue name.
pub const ATTR_QUEUE_NAME: &str = "QueueName";
/// Attribute holding the name of the handler capability to resolve.
pub const ATTR_BROKER_SERVICE: &str = "BrokerService";

/// Interval between reconnection attempts when recovery is enabled.
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Named-attribute lookup used to fill in configuration the host left empty.
pub trait AttributeSource: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn attribute(&self, key: &str) -> Option<String>;
}

/// Reads attributes from environment variables.
///
/// The attribute key is converted to screaming snake case and prefixed, so with
/// the prefix `RABBITMQ_` the key `ConnectionString` is read from
/// `RABBITMQ_CONNECTION_STRING`.
#[derive(Debug, Clone, Default)]
pub struct EnvAttributes {
    prefix: String,
}

impl EnvAttributes {
    pub fn new(prefix: &str) -> Self {
        EnvAttributes {
            prefix: prefix.to_owned(),
        }
    }

    /// Name of the environment variable backing `key`.
    pub fn var_name(&self, key: &str) -> String {
        let mut name = self.prefix.clone();
        for (i, ch) in key.chars().enumerate() {
            if ch.is_uppercase() && i > 0 {
                name.push('_');
            }
            name.extend(ch.to_uppercase());
        }
        name
    }
}

impl AttributeSource for EnvAttributes {
    fn attribute(&self, key: &str) -> Option<String> {
        env::var(self.var_name(key)).ok()
    }
}

/// In-memory attribute map, typically loaded from a JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticAttributes {
    values: HashMap<String, String>,
}

impl StaticAttributes {
    /// Parses a flat JSON object such as
    /// `{"ConnectionString": "amqp://localhost:5672/%2f", "QueueName": "orders"}`.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Adds or replaces an attribute.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl AttributeSource for StaticAttributes {
    fn attribute(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Broker URI and queue name a consumer attaches to.
///
/// Immutable once resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointConfig {
    uri: String,
    queue: String,
}

impl EndpointConfig {
    /// Resolves the endpoint, substituting any empty argument with the matching
    /// attribute from `attrs`.
    ///
    /// # Parameters
    /// * `connection_string` - Broker URI, possibly empty
    /// * `queue_name` - Queue name, possibly empty
    /// * `attrs` - Fallback lookup keyed `ConnectionString` / `QueueName`
    ///
    /// # Returns
    /// The resolved endpoint; either value may still be empty
    pub fn resolve(connection_string: &str, queue_name: &str, attrs: &dyn AttributeSource) -> Self {
        EndpointConfig {
            uri: fallback(connection_string, attrs, ATTR_CONNECTION_STRING),
            queue: fallback(queue_name, attrs, ATTR_QUEUE_NAME),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Both the URI and the queue name are present.
    pub fn is_complete(&self) -> bool {
        !self.uri.is_empty() && !self.queue.is_empty()
    }
}

fn fallback(value: &str, attrs: &dyn AttributeSource, key: &str) -> String {
    if !value.is_empty() {
        return value.to_owned();
    }
    attrs.attribute(key).unwrap_or_default()
}

/// Name of the handler capability configured under `BrokerService`, if any.
pub fn capability_name(attrs: &dyn AttributeSource) -> Option<String> {
    attrs
        .attribute(ATTR_BROKER_SERVICE)
        .filter(|name| !name.is_empty())
}

/// How deliveries are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The consumer acks or nacks every delivery explicitly.
    #[default]
    Manual,
    /// The broker considers a delivery acknowledged as soon as it is sent.
    /// Failed deliveries are lost and prefetch no longer throttles the consumer.
    Auto,
}

/// Runtime policy of a consumer.
///
/// The default is the hardened setup: manual acknowledgment with automatic
/// reconnection every [`DEFAULT_RECOVERY_INTERVAL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerPolicy {
    pub(crate) ack_mode: AckMode,
    pub(crate) recovery_interval: Option<Duration>,
    pub(crate) connection_name: Option<String>,
}

impl Default for ConsumerPolicy {
    fn default() -> Self {
        ConsumerPolicy {
            ack_mode: AckMode::Manual,
            recovery_interval: Some(DEFAULT_RECOVERY_INTERVAL),
            connection_name: None,
        }
    }
}

impl ConsumerPolicy {
    /// Lets the broker auto-acknowledge deliveries.
    pub fn auto_ack(mut self) -> Self {
        self.ack_mode = AckMode::Auto;
        self
    }

    /// Disables reconnection; a lost connection requires a new `initialize`.
    pub fn without_recovery(mut self) -> Self {
        self.recovery_interval = None;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = Some(interval);
        self
    }

    /// Name reported to the broker for the connection.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn recovery_interval(&self) -> Option<Duration> {
        self.recovery_interval
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives the decoded text of one delivery. Handlers are looked up
//! by capability name through a [`HandlerResolver`] every time a delivery
//! arrives, so the resolver decides whether instances are shared or rebuilt.

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Failure reported by a handler for one message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failure: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }
}

/// Processes the text body of a delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. Returning an error rejects the delivery without
    /// requeueing it.
    async fn handle(&self, text: &str) -> Result<(), HandlerError>;
}

/// Resolves a handler from a capability name.
#[cfg_attr(test, automock)]
pub trait HandlerResolver: Send + Sync {
    /// Returns the handler registered for `name`, or `None` when nothing is
    /// configured under that name.
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageHandler>>;
}

/// Resolver backed by a fixed map of named handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers `handler` under `name`, replacing any previous registration.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(mut self, name: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(name.to_owned(), handler);
        self
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(name).cloned()
    }
}

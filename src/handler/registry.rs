//! Handler registry for dispatching messages by id.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use crate::error::{GofastError, Result};
use crate::message::{check_user_id, Incoming, Message};
use crate::stream::Stream;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a received message.
    fn call(&self, incoming: Incoming, stream: Stream) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes the message before calling the handler.
pub struct TypedHandler<F, M, Fut>
where
    F: Fn(M, Stream) -> Fut + Send + Sync + 'static,
    M: Message,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(M) -> Fut>,
}

impl<F, M, Fut> TypedHandler<F, M, Fut>
where
    F: Fn(M, Stream) -> Fut + Send + Sync + 'static,
    M: Message,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, M, Fut> Handler for TypedHandler<F, M, Fut>
where
    F: Fn(M, Stream) -> Fut + Send + Sync + 'static,
    M: Message,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, incoming: Incoming, stream: Stream) -> BoxFuture<'static, HandlerResult> {
        // On a decode error the stream drops here, finishing the exchange.
        let msg: M = match incoming.decode() {
            Ok(m) => m,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        Box::pin((self.handler)(msg, stream))
    }
}

/// Registry mapping message ids to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u64, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to messages of type `M`, replacing any previous
    /// handler for `M::ID`.
    ///
    /// Fails with [`GofastError::ReservedMessageId`] for engine ids.
    pub fn register<M, F, Fut>(&mut self, handler: F) -> Result<()>
    where
        M: Message,
        F: Fn(M, Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        check_user_id(M::ID)?;
        self.handlers
            .insert(M::ID, Box::new(TypedHandler::new(handler)));
        Ok(())
    }

    /// True if a handler is subscribed to `msg_id`.
    pub fn contains(&self, msg_id: u64) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    /// Get a handler by message id.
    pub fn get(&self, msg_id: u64) -> Option<&dyn Handler> {
        self.handlers.get(&msg_id).map(|h| h.as_ref())
    }

    /// Subscribed message ids.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.handlers.keys().copied()
    }

    /// Number of subscribed message types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a message to its handler.
    pub async fn dispatch(&self, incoming: Incoming, stream: Stream) -> Result<()> {
        let handler = self
            .get(incoming.msg_id)
            .ok_or(GofastError::NotSubscribed(incoming.msg_id))?;
        handler.call(incoming, stream).await
    }
}

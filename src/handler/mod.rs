//! Handler module - typed message handlers keyed by message id.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps message ids to handlers
//! - [`Handler`] / [`TypedHandler`] - decode then call user code
//!
//! # Example
//!
//! ```
//! use gofast::handler::HandlerRegistry;
//! use gofast::{Message, Stream};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping(String);
//!
//! impl Message for Ping {
//!     const ID: u64 = 100;
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry
//!     .register(|ping: Ping, mut stream: Stream| async move {
//!         stream.response(&Ping(ping.0.replace("ping", "pong")), true).await
//!     })
//!     .unwrap();
//! assert!(registry.contains(100));
//! ```

mod registry;

pub use registry::{BoxFuture, Handler, HandlerRegistry, HandlerResult, TypedHandler};

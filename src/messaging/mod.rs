//! # Messaging
//!
//! Lane queues for the distributed backend. Each message names one execution; a
//! received message is leased to a single consumer until acked, released or its
//! visibility timeout elapses.

pub mod database;
pub mod errors;
pub mod in_memory;
pub mod message;
pub mod provider;

pub use database::DatabaseQueue;
pub use errors::MessagingError;
pub use in_memory::InMemoryQueue;
pub use message::{ExecutionMessage, QueuedMessage};
pub use provider::QueueProvider;

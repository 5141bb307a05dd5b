//! # Services
//!
//! Read-side facades for presentation layers.

pub mod query_service;

pub use query_service::QueryService;

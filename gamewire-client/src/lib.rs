//! # gamewire-client
//!
//! Client library for gamewire.
//!
//! This crate provides:
//! - An async framed connection to the event-loop listener
//! - Request/reply helpers that flatten arguments and materialize replies
//! - Heartbeat filtering

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;

//! Tether - resilient broker messaging
//!
//! Adapters over an AMQP-style broker built around a reconnecting
//! session factory: producers buffer and replay sends across outages,
//! consumers re-apply their subscriptions on every fresh connection.

pub mod bus;
pub mod codec;
pub mod config;
pub mod registry;
pub mod retry;

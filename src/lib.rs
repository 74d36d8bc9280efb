//! # pubsim
//!
//! `pubsim` is an in-memory publish/subscribe broker that mimics a managed
//! Pub/Sub service closely enough to test client code against it: topics,
//! subscriptions with ack deadlines and retention, pull and streaming-pull
//! delivery, seek, and fault injection.
//!
//! ## Core Modules
//!
//! - `broker`: the [`Broker`] and the per-topic and per-subscription state it manages.
//! - `protocol`: the resources and request/response types of the RPC surface.
//! - `config`: settings loading and declarative pre-provisioning.
//! - `utils`: errors, logging, clocks and list paging.

pub mod broker;
pub mod config;
pub mod protocol;
pub mod utils;

pub use broker::{Broker, BrokerBuilder, CallContext, Method, Reaction, Reactor};
pub use utils::{Code, Error, Result};

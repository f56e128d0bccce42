//! # Peril
//!
//! `peril` is a typed publish/subscribe layer over an AMQP broker, plus the
//! handlers and command-line glue of the Peril game built on top of it.
//!
//! ## Core Modules
//!
//! - `pubsub`: queue topology, payload codecs, subscriptions and publishing.
//! - `transport`: the broker operations the pub/sub layer needs, implemented
//!   for `lapin` and for an in-memory broker.
//! - `routing`: exchange names, routing keys and message types.
//! - `handlers`: game handlers that settle deliveries and publish follow-ups.
//! - `config`: loading settings from files and the environment.
//! - `utils`: error types and logging setup.

pub mod config;
pub mod handlers;
pub mod pubsub;
pub mod routing;
pub mod transport;
pub mod utils;

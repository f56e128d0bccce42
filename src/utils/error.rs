//! The `error` module defines the error types used across `peril`.
//!
//! Each layer gets its own enum so a failure names where it came from:
//! the transport (broker I/O), topology setup, payload encoding, or the
//! subscribe/publish operations built on top of them.

use std::fmt;

/// Failures reported by the broker connection or a channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),

    #[error("channel closed")]
    ChannelClosed,

    /// Rejection raised by a broker that is not `lapin`-backed
    /// (the in-memory broker reports 404-style failures through this).
    #[error("{0}")]
    Broker(String),
}

/// The step of queue setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyStep {
    ChannelOpen,
    QueueDeclare,
    QueueBind,
}

impl fmt::Display for TopologyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            TopologyStep::ChannelOpen => "channel open",
            TopologyStep::QueueDeclare => "queue declare",
            TopologyStep::QueueBind => "queue bind",
        };
        f.write_str(step)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("unknown queue type: {0}")]
    UnknownQueueType(String),

    #[error("{step} failed: {source}")]
    Step {
        step: TopologyStep,
        #[source]
        source: TransportError,
    },
}

impl TopologyError {
    pub fn step(step: TopologyStep) -> impl FnOnce(TransportError) -> Self {
        move |source| TopologyError::Step { step, source }
    }
}

/// Payload (de)serialization failures.
///
/// Decode failures are local to one delivery and never stop a subscription.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("decode failed: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors returned to callers of `subscribe_*` and `publish_*`.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("could not declare and bind queue: {0}")]
    Topology(#[from] TopologyError),

    #[error("could not set prefetch: {0}")]
    Prefetch(#[source] TransportError),

    #[error("could not consume messages: {0}")]
    Consume(#[source] TransportError),

    #[error("could not encode payload: {0}")]
    Encode(#[source] CodecError),

    #[error("could not publish message: {0}")]
    Publish(#[source] TransportError),
}

//! The `pubsub` module is the typed layer over the broker.
//!
//! - `topology`: queue declaration/binding with durability classes
//! - `codec`: JSON and binary payload encodings
//! - `dispatcher`: subscriptions and the consume loop
//! - `publish`: encode-and-publish helpers

pub mod codec;
pub mod dispatcher;
pub mod publish;
pub mod topology;

pub use codec::{BinaryCodec, Codec, JsonCodec};
pub use dispatcher::{
    DispatchStats, DispatcherState, Handler, Subscription, SubscriptionHandle, subscribe_binary,
    subscribe_json,
};
pub use publish::{publish, publish_binary, publish_json};
pub use topology::{QueueBinding, SimpleQueueType, declare_and_bind};

/// Unacknowledged deliveries a subscription accepts before the broker
/// stops pushing.
pub const DEFAULT_PREFETCH: u16 = 10;

/// How a delivery is settled once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// Processed; remove from the queue.
    Ack,
    /// Failed for good; remove without redelivery (dead-lettered if configured).
    NackDiscard,
    /// Failed for now; put back at the head of the queue.
    NackRequeue,
}

//! The `transport` module describes the broker operations the pub/sub layer
//! relies on, independent of the client library that performs them.
//!
//! `Connector` opens channels; `AmqpChannel` is everything done on one
//! channel: queue declaration and binding, QoS, consuming, settling
//! deliveries and publishing. `amqp` implements both for `lapin`.
//! `memory` is an in-process test double with the same semantics, built for
//! tests or with the `memory-broker` feature.

pub mod amqp;
#[cfg(any(test, feature = "memory-broker"))]
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;

use futures_util::stream::BoxStream;

use crate::utils::error::TransportError;

/// Raw delivery handed to a consumer.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Identifier to ack or nack this delivery on its channel.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Flags passed to a queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Queue argument naming the exchange that receives discarded deliveries.
pub const DEAD_LETTER_ARGUMENT: &str = "x-dead-letter-exchange";

/// String-valued `x-` arguments attached to a queue declaration.
pub type QueueArguments = BTreeMap<String, String>;

/// Stream of deliveries from one consumer. Ends when the channel closes.
pub type Deliveries = BoxStream<'static, Result<Envelope, TransportError>>;

pub trait Connector: Send + Sync {
    type Channel: AmqpChannel;

    fn create_channel(&self) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}

pub trait AmqpChannel: Clone + Send + Sync + 'static {
    /// Declares `name` and returns the name the broker assigned.
    fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn basic_qos(&self, prefetch_count: u16)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    fn basic_consume(
        &self,
        queue: &str,
    ) -> impl Future<Output = Result<Deliveries, TransportError>> + Send;

    fn basic_ack(&self, delivery_tag: u64)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    fn basic_nack(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

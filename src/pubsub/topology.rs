//! Queue declaration and binding.
//!
//! A binding's durability class alone decides the declare flags, and every
//! queue is declared with a dead-letter exchange so discarded deliveries are
//! routed instead of dropped.

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::routing::DEAD_LETTER_EXCHANGE;
use crate::transport::{AmqpChannel, Connector, DEAD_LETTER_ARGUMENT, QueueArguments, QueueFlags};
use crate::utils::error::{TopologyError, TopologyStep};

/// Durability class of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleQueueType {
    /// Survives broker restarts, shared between connections.
    Durable,
    /// Lives in memory, exclusive to its connection, deleted with it.
    Transient,
}

impl From<SimpleQueueType> for QueueFlags {
    fn from(queue_type: SimpleQueueType) -> Self {
        match queue_type {
            SimpleQueueType::Durable => QueueFlags {
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
            SimpleQueueType::Transient => QueueFlags {
                durable: false,
                auto_delete: true,
                exclusive: true,
            },
        }
    }
}

impl FromStr for SimpleQueueType {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "durable" => Ok(SimpleQueueType::Durable),
            "transient" => Ok(SimpleQueueType::Transient),
            _ => Err(TopologyError::UnknownQueueType(s.to_string())),
        }
    }
}

impl TryFrom<u8> for SimpleQueueType {
    type Error = TopologyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SimpleQueueType::Durable),
            1 => Ok(SimpleQueueType::Transient),
            other => Err(TopologyError::UnknownQueueType(other.to_string())),
        }
    }
}

impl fmt::Display for SimpleQueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimpleQueueType::Durable => f.write_str("durable"),
            SimpleQueueType::Transient => f.write_str("transient"),
        }
    }
}

/// Where a queue lives and how it is attached to its exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub queue_type: SimpleQueueType,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        queue_type: SimpleQueueType,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            queue_type,
        }
    }

    /// Builds a binding from an untyped durability value, e.g. one read
    /// from configuration. Fails before anything reaches the broker.
    pub fn parse(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        queue_type: &str,
    ) -> Result<Self, TopologyError> {
        let queue_type = queue_type.parse()?;
        Ok(Self::new(exchange, queue, routing_key, queue_type))
    }

    pub fn flags(&self) -> QueueFlags {
        self.queue_type.into()
    }

    pub fn arguments(&self) -> QueueArguments {
        let mut arguments = QueueArguments::new();
        arguments.insert(
            DEAD_LETTER_ARGUMENT.to_string(),
            DEAD_LETTER_EXCHANGE.to_string(),
        );
        arguments
    }
}

/// Opens a channel for `binding`, declares its queue and binds it.
///
/// Returns the channel together with the queue name the broker confirmed.
pub async fn declare_and_bind<B: Connector>(
    conn: &B,
    binding: &QueueBinding,
) -> Result<(B::Channel, String), TopologyError> {
    let channel = conn
        .create_channel()
        .await
        .map_err(TopologyError::step(TopologyStep::ChannelOpen))?;

    let queue = channel
        .queue_declare(&binding.queue, binding.flags(), &binding.arguments())
        .await
        .map_err(TopologyError::step(TopologyStep::QueueDeclare))?;

    channel
        .queue_bind(&queue, &binding.exchange, &binding.routing_key)
        .await
        .map_err(TopologyError::step(TopologyStep::QueueBind))?;

    info!(
        queue = %queue,
        exchange = %binding.exchange,
        routing_key = %binding.routing_key,
        queue_type = %binding.queue_type,
        "queue declared and bound"
    );
    Ok((channel, queue))
}

//! In-memory broker used as a test double.
//!
//! `MemoryBroker` keeps exchanges, queues and bindings behind one lock and
//! implements `Connector`, handing out `MemoryChannel`s. It follows the AMQP
//! rules the pub/sub layer depends on:
//! - exchanges must exist before queues are bound or messages published
//!   (the default exchange `""` routes straight to the queue named by the key)
//! - binding keys match routing keys with topic semantics (`*` one word,
//!   `#` zero or more words); a literal key behaves like a direct binding
//! - a consumer never holds more unacknowledged deliveries than the
//!   prefetch count set on its channel (`0` means unlimited)
//! - requeued deliveries go back to the head of the queue flagged as
//!   redelivered; discarded ones are routed to the queue's
//!   `x-dead-letter-exchange` when one is configured
//! - closing a channel ends its consumers and returns their unacked
//!   deliveries to the queue; `disconnect` drops every exclusive and
//!   auto-delete queue
//!
//! Every publish and every settlement is recorded, and the records are never
//! trimmed, so tests can assert on them. Not meant for long-running use.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio::sync::{Notify, mpsc};
use tracing::trace;
use uuid::Uuid;

use super::{
    AmqpChannel, Connector, DEAD_LETTER_ARGUMENT, Deliveries, Envelope, QueueArguments, QueueFlags,
};
use crate::utils::error::TransportError;

/// A message accepted by `basic_publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub settlement: Settlement,
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub flags: QueueFlags,
    pub arguments: QueueArguments,
    pub ready: usize,
    pub unacked: usize,
    /// Highest number of unacked deliveries observed at once.
    pub max_unacked: usize,
    pub has_consumer: bool,
}

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Consumer {
    channel: u64,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Result<Envelope, TransportError>>,
}

#[derive(Debug)]
struct QueueState {
    flags: QueueFlags,
    arguments: QueueArguments,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    consumer: Option<Consumer>,
    max_unacked: usize,
}

impl QueueState {
    fn new(flags: QueueFlags, arguments: QueueArguments) -> Self {
        Self {
            flags,
            arguments,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumer: None,
            max_unacked: 0,
        }
    }

    /// Pushes ready messages to the consumer until its prefetch window is full.
    fn pump(&mut self, next_tag: &mut u64) {
        loop {
            let Some(consumer) = self.consumer.as_ref() else {
                return;
            };
            if consumer.prefetch != 0 && self.unacked.len() >= usize::from(consumer.prefetch) {
                return;
            }
            let Some(message) = self.ready.pop_front() else {
                return;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let envelope = Envelope {
                delivery_tag: tag,
                redelivered: message.redelivered,
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
            };
            if consumer.tx.send(Ok(envelope)).is_err() {
                // consumer went away; keep the message for the next one
                self.ready.push_front(message);
                self.consumer = None;
                return;
            }
            self.unacked.insert(tag, message);
            self.max_unacked = self.max_unacked.max(self.unacked.len());
        }
    }

    /// Drops the consumer and puts its unacked deliveries back at the head.
    fn release_consumer(&mut self) {
        self.consumer = None;
        let unacked = std::mem::take(&mut self.unacked);
        for (_, mut message) in unacked.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    prefetch: HashMap<u64, u16>,
    closed_channels: HashSet<u64>,
    next_channel: u64,
    next_tag: u64,
    disconnected: bool,
    fail_publishes: bool,
    published: Vec<Published>,
    settlements: Vec<SettlementRecord>,
}

impl State {
    fn ensure_open(&self, channel: u64) -> Result<(), TransportError> {
        if self.disconnected || self.closed_channels.contains(&channel) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> usize {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let mut seen = HashSet::new();
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
                .filter(|b| seen.insert(b.queue.clone()))
                .map(|b| b.queue.clone())
                .collect()
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
                queue.pump(&mut self.next_tag);
            }
        }
        targets.len()
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
    }

    fn settle(
        &mut self,
        channel: u64,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), TransportError> {
        self.ensure_open(channel)?;

        let owner = self.queues.iter().find_map(|(name, q)| {
            let consumed_here = q.consumer.as_ref().is_some_and(|c| c.channel == channel);
            (consumed_here && q.unacked.contains_key(&delivery_tag)).then(|| name.clone())
        });
        let Some(queue_name) = owner else {
            return Err(TransportError::Broker(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };

        let mut dead_letter = None;
        let redelivered;
        {
            let Some(queue) = self.queues.get_mut(&queue_name) else {
                return Err(TransportError::ChannelClosed);
            };
            let Some(mut message) = queue.unacked.remove(&delivery_tag) else {
                return Err(TransportError::ChannelClosed);
            };
            redelivered = message.redelivered;
            match settlement {
                Settlement::Ack => {}
                Settlement::Nack { requeue: true } => {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
                Settlement::Nack { requeue: false } => {
                    if let Some(dlx) = queue.arguments.get(DEAD_LETTER_ARGUMENT) {
                        dead_letter = Some((dlx.clone(), message));
                    }
                }
            }
            queue.pump(&mut self.next_tag);
        }

        if let Some((dlx, message)) = dead_letter {
            if self.exchanges.contains(&dlx) {
                self.route(&dlx, &message.routing_key, &message.payload);
            }
        }

        self.settlements.push(SettlementRecord {
            queue: queue_name,
            delivery_tag,
            redelivered,
            settlement,
        });
        Ok(())
    }
}

/// Matches an AMQP topic binding pattern against a routing key.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&head, tail)) => (word == "*" || word == head) && matches(rest, tail),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    settled: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an exchange. Exchanges are set up out of band, never by the
    /// pub/sub layer itself.
    pub fn declare_exchange(&self, name: &str) {
        self.state().exchanges.insert(name.to_string());
    }

    pub fn queue(&self, name: &str) -> Option<QueueSnapshot> {
        self.state().queues.get(name).map(|q| QueueSnapshot {
            flags: q.flags,
            arguments: q.arguments.clone(),
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            max_unacked: q.max_unacked,
            has_consumer: q.consumer.is_some(),
        })
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state().settlements.clone()
    }

    /// Resolves once at least `count` deliveries have been acked or nacked.
    pub async fn wait_for_settlements(&self, count: usize) {
        loop {
            let notified = self.inner.settled.notified();
            if self.state().settlements.len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Makes every subsequent publish fail until switched back.
    pub fn fail_publishes(&self, fail: bool) {
        self.state().fail_publishes = fail;
    }

    /// Simulates losing the connection: consumers receive an error and their
    /// streams end, exclusive and auto-delete queues disappear.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.disconnected = true;

        let mut doomed = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            if let Some(consumer) = queue.consumer.as_ref() {
                let _ = consumer.tx.send(Err(TransportError::ChannelClosed));
            }
            queue.release_consumer();
            if queue.flags.exclusive || queue.flags.auto_delete {
                doomed.push(name.clone());
            }
        }
        for name in doomed {
            state.remove_queue(&name);
        }
        drop(state);
        self.inner.settled.notify_waiters();
    }
}

impl Connector for MemoryBroker {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, TransportError> {
        let mut state = self.state();
        if state.disconnected {
            return Err(TransportError::ChannelClosed);
        }
        state.next_channel += 1;
        Ok(MemoryChannel {
            id: state.next_channel,
            broker: self.clone(),
        })
    }
}

/// Channel handed out by `MemoryBroker`. Clones share the same channel.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.broker.state().ensure_open(self.id).is_ok()
    }

    fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<(), TransportError> {
        self.broker
            .state()
            .settle(self.id, delivery_tag, settlement)?;
        self.broker.inner.settled.notify_waiters();
        Ok(())
    }
}

impl AmqpChannel for MemoryChannel {
    async fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<String, TransportError> {
        let mut state = self.broker.state();
        state.ensure_open(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.flags != flags || &existing.arguments != arguments {
                return Err(TransportError::Broker(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"
                )));
            }
            return Ok(name);
        }

        state
            .queues
            .insert(name.clone(), QueueState::new(flags, arguments.clone()));
        trace!(queue = %name, ?flags, "queue declared");
        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.ensure_open(self.id)?;

        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Broker(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Broker(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.ensure_open(self.id)?;
        state.prefetch.insert(self.id, prefetch_count);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<Deliveries, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state();
            state.ensure_open(self.id)?;

            let prefetch = state.prefetch.get(&self.id).copied().unwrap_or(0);
            let State {
                queues, next_tag, ..
            } = &mut *state;
            let Some(target) = queues.get_mut(queue) else {
                return Err(TransportError::Broker(format!(
                    "NOT_FOUND - no queue '{queue}'"
                )));
            };
            if target.consumer.is_some() {
                return Err(TransportError::Broker(format!(
                    "ACCESS_REFUSED - queue '{queue}' already has a consumer"
                )));
            }
            target.consumer = Some(Consumer {
                channel: self.id,
                prefetch,
                tx,
            });
            target.pump(next_tag);
        }

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.settle(delivery_tag, Settlement::Ack)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.settle(delivery_tag, Settlement::Nack { requeue })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.ensure_open(self.id)?;

        if state.fail_publishes {
            return Err(TransportError::Broker(
                "publish rejected by broker".to_string(),
            ));
        }
        if !exchange.is_empty() && !state.exchanges.contains(exchange) {
            return Err(TransportError::Broker(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        let routed = state.route(exchange, routing_key, &payload);
        trace!(exchange, routing_key, routed, "message published");
        state.published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: content_type.to_string(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.closed_channels.insert(self.id) {
            return Ok(());
        }

        let mut doomed = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.channel == self.id) {
                queue.release_consumer();
                if queue.flags.auto_delete {
                    doomed.push(name.clone());
                }
            }
        }
        for name in doomed {
            state.remove_queue(&name);
        }
        Ok(())
    }
}

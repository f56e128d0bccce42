//! Delivery dispatcher
//!
//! A `Subscription` ties a queue binding to a codec and a handler. Starting
//! it declares and binds the queue, caps unacknowledged deliveries with
//! `basic.qos`, opens a consumer and moves the consume loop onto its own
//! tokio task.
//!
//! The loop handles one delivery at a time, in the order the broker sent
//! them: decode, call the handler, settle with exactly one ack or nack.
//! - a payload that fails to decode is nacked without requeue, which routes
//!   it to the dead-letter exchange instead of redelivering it forever
//! - handler verdicts map to `basic.ack`, `basic.nack(requeue)` or
//!   `basic.nack(discard)`
//! - a channel error, a failed ack/nack, or the end of the delivery stream
//!   ends the loop and closes the channel; nothing reconnects here
//! - `SubscriptionHandle::shutdown` stops taking deliveries, lets the one in
//!   hand finish and settle, then closes the channel so prefetched but
//!   unhandled deliveries go back to the queue

use std::future::Future;
use std::marker::PhantomData;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::{BinaryCodec, Codec, JsonCodec};
use super::topology::{QueueBinding, SimpleQueueType, declare_and_bind};
use super::{AckType, DEFAULT_PREFETCH};
use crate::transport::{AmqpChannel, Connector, Deliveries};
use crate::utils::error::{PubSubError, TransportError};

/// Lifecycle of a subscription's consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    /// Terminal; the channel is gone.
    Closed,
}

/// Receives decoded messages and decides how each delivery is settled.
///
/// A handler must always resolve to a verdict. It runs inside the
/// subscription's task, so a slow handler only stalls its own queue.
pub trait Handler<T>: Send + 'static {
    fn handle(&mut self, message: T) -> impl Future<Output = AckType> + Send;
}

impl<T, F, Fut> Handler<T> for F
where
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckType> + Send,
{
    fn handle(&mut self, message: T) -> impl Future<Output = AckType> + Send {
        (self)(message)
    }
}

/// Counters for one run of the consume loop.
///
/// `discarded` counts every `NackDiscard`, decode failures included;
/// `decode_failures` is the subset the handler never saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub decode_failures: u64,
}

impl DispatchStats {
    fn record(&mut self, verdict: AckType) {
        match verdict {
            AckType::Ack => self.acked += 1,
            AckType::NackRequeue => self.requeued += 1,
            AckType::NackDiscard => self.discarded += 1,
        }
    }
}

pub struct Subscription<T, C, H> {
    pub binding: QueueBinding,
    pub codec: C,
    pub handler: H,
    pub prefetch: u16,
    _message: PhantomData<fn() -> T>,
}

impl<T, C, H> Subscription<T, C, H>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: Handler<T>,
{
    pub fn new(binding: QueueBinding, codec: C, handler: H) -> Self {
        Self {
            binding,
            codec,
            handler,
            prefetch: DEFAULT_PREFETCH,
            _message: PhantomData,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets up the queue and spawns the consume loop.
    ///
    /// Errors here are startup failures; once this returns `Ok` the loop
    /// only stops when its channel closes.
    pub async fn start<B: Connector>(self, conn: &B) -> Result<SubscriptionHandle, PubSubError> {
        let Subscription {
            binding,
            codec,
            handler,
            prefetch,
            ..
        } = self;
        let (channel, queue) = declare_and_bind(conn, &binding).await?;

        if let Err(e) = channel.basic_qos(prefetch).await {
            let _ = channel.close().await;
            return Err(PubSubError::Prefetch(e));
        }

        let deliveries = match channel.basic_consume(&queue).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let _ = channel.close().await;
                return Err(PubSubError::Consume(e));
            }
        };

        let (state_tx, state_rx) = watch::channel(DispatcherState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_queue = queue.clone();
        let task = tokio::spawn(async move {
            let _ = state_tx.send(DispatcherState::Running);
            let stats = dispatch(
                &task_queue,
                deliveries,
                shutdown_rx,
                &channel,
                codec,
                handler,
            )
            .await;
            if let Err(e) = channel.close().await {
                debug!(queue = %task_queue, error = %e, "channel close after consume loop failed");
            }
            let _ = state_tx.send(DispatcherState::Closed);
            stats
        });

        Ok(SubscriptionHandle {
            queue,
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a running subscription.
///
/// Dropping it does not stop the consume loop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    state: watch::Receiver<DispatcherState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<DispatchStats>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Asks the consume loop to stop before its next delivery. A handler
    /// already running is not interrupted.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stops the consume loop and waits for the delivery in hand to settle.
    pub async fn shutdown(self) -> DispatchStats {
        self.request_shutdown();
        self.closed().await
    }

    /// Waits until the consume loop has stopped and returns its counters.
    pub async fn closed(self) -> DispatchStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "consume loop panicked");
                DispatchStats::default()
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // sender gone means the handle was dropped; keep consuming
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The consume loop. Returns when the delivery stream ends, the channel
/// fails or shutdown is requested.
pub(crate) async fn dispatch<Ch, T, C, H>(
    queue: &str,
    mut deliveries: Deliveries,
    mut shutdown: watch::Receiver<bool>,
    channel: &Ch,
    codec: C,
    mut handler: H,
) -> DispatchStats
where
    Ch: AmqpChannel,
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: Handler<T>,
{
    let mut stats = DispatchStats::default();
    info!(queue, "consuming");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                info!(queue, "shutdown requested");
                break;
            }
            next = deliveries.next() => next,
        };
        let Some(next) = next else {
            break;
        };
        let envelope = match next {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(queue, error = %e, "delivery stream failed");
                break;
            }
        };

        let verdict = match codec.decode::<T>(&envelope.payload) {
            Ok(message) => handler.handle(message).await,
            Err(e) => {
                warn!(
                    queue,
                    delivery_tag = envelope.delivery_tag,
                    routing_key = %envelope.routing_key,
                    error = %e,
                    "could not decode message, discarding"
                );
                stats.decode_failures += 1;
                AckType::NackDiscard
            }
        };

        if let Err(e) = settle(channel, envelope.delivery_tag, verdict).await {
            error!(
                queue,
                delivery_tag = envelope.delivery_tag,
                ?verdict,
                error = %e,
                "could not settle delivery"
            );
            break;
        }
        stats.record(verdict);
        debug!(
            queue,
            delivery_tag = envelope.delivery_tag,
            redelivered = envelope.redelivered,
            ?verdict,
            "delivery settled"
        );
    }

    info!(queue, ?stats, "consume loop stopped");
    stats
}

async fn settle<Ch: AmqpChannel>(
    channel: &Ch,
    delivery_tag: u64,
    verdict: AckType,
) -> Result<(), TransportError> {
    match verdict {
        AckType::Ack => channel.basic_ack(delivery_tag).await,
        AckType::NackRequeue => channel.basic_nack(delivery_tag, true).await,
        AckType::NackDiscard => channel.basic_nack(delivery_tag, false).await,
    }
}

/// Subscribes with JSON payloads and the default prefetch.
pub async fn subscribe_json<B, T, H>(
    conn: &B,
    exchange: &str,
    queue: &str,
    routing_key: &str,
    queue_type: SimpleQueueType,
    handler: H,
) -> Result<SubscriptionHandle, PubSubError>
where
    B: Connector,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let binding = QueueBinding::new(exchange, queue, routing_key, queue_type);
    Subscription::new(binding, JsonCodec, handler)
        .start(conn)
        .await
}

/// Subscribes with binary payloads and the default prefetch.
pub async fn subscribe_binary<B, T, H>(
    conn: &B,
    exchange: &str,
    queue: &str,
    routing_key: &str,
    queue_type: SimpleQueueType,
    handler: H,
) -> Result<SubscriptionHandle, PubSubError>
where
    B: Connector,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let binding = QueueBinding::new(exchange, queue, routing_key, queue_type);
    Subscription::new(binding, BinaryCodec, handler)
        .start(conn)
        .await
}

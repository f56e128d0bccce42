use serde::Serialize;
use tracing::debug;

use super::codec::{BinaryCodec, Codec, JsonCodec};
use crate::transport::AmqpChannel;
use crate::utils::error::PubSubError;

/// Encodes `value` with `codec` and publishes it to `exchange` under `routing_key`.
///
/// Transport failures come straight back to the caller; nothing is retried.
pub async fn publish<Ch, C, T>(
    channel: &Ch,
    codec: C,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: AmqpChannel,
    C: Codec,
    T: Serialize,
{
    let payload = codec.encode(value).map_err(PubSubError::Encode)?;
    let size = payload.len();
    channel
        .basic_publish(exchange, routing_key, codec.content_type(), payload)
        .await
        .map_err(PubSubError::Publish)?;
    debug!(exchange, routing_key, size, "message published");
    Ok(())
}

pub async fn publish_json<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: AmqpChannel,
    T: Serialize,
{
    publish(channel, JsonCodec, exchange, routing_key, value).await
}

pub async fn publish_binary<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: AmqpChannel,
    T: Serialize,
{
    publish(channel, BinaryCodec, exchange, routing_key, value).await
}

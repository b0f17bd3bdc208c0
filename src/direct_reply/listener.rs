use super::ChannelId;
use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;
use std::future::Future;

/// A reply delivered on the direct reply-to pseudo-queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,

    /// The exchange the reply was published to - usually the default exchange.
    pub exchange: ShortString,

    /// The routing key of the reply: the `reply_to` address the requester advertised.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

// Direct reply-to consumers run in no-ack mode: the acker is dropped.
impl From<lapin::message::Delivery> for ReplyMessage {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

/// Implementers of `ReplyListener` process the replies delivered to borrowed channels.
///
/// # Outcome
///
/// Returning `Ok(())` hands the channel back to the pool for reuse.
/// Returning an error (or panicking) marks the channel as untrusted: it is cancelled and
/// closed, and the failure is logged. Failures never propagate past the consumer task.
///
/// # Implementors
///
/// Most of the time you will wrap an async closure with [`ClosureListener`].
#[async_trait::async_trait]
pub trait ReplyListener: Send + Sync + 'static {
    async fn on_message(&self, message: ReplyMessage, channel: ChannelId)
        -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<L> ReplyListener for Box<L>
where
    L: ReplyListener + ?Sized,
{
    async fn on_message(
        &self,
        message: ReplyMessage,
        channel: ChannelId,
    ) -> Result<(), anyhow::Error> {
        L::on_message(self, message, channel).await
    }
}

/// Wrapper type to turn an async closure into a [`ReplyListener`].
///
/// ```rust
/// use carrot_cake_direct_reply::direct_reply::{ChannelId, ClosureListener, ReplyMessage};
///
/// let listener = ClosureListener(|message: ReplyMessage, channel: ChannelId| async move {
///     println!("{} bytes on {channel}", message.data.len());
///     Ok::<_, anyhow::Error>(())
/// });
/// ```
pub struct ClosureListener<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> ReplyListener for ClosureListener<F>
where
    F: Fn(ReplyMessage, ChannelId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    async fn on_message(
        &self,
        message: ReplyMessage,
        channel: ChannelId,
    ) -> Result<(), anyhow::Error> {
        (self.0)(message, channel).await
    }
}

use super::{ChannelFault, ChannelId, ConsumerTag, ReplyMessage};
use futures_util::stream::BoxStream;
use lapin::BasicProperties;

/// The broker's well-known pseudo-queue for direct reply-to.
///
/// Publishing a request with `reply_to` set to this address routes the reply straight to the
/// channel that published it, as long as that channel is consuming from it.
pub const DIRECT_REPLY_TO_QUEUE: &str = "amq.rabbitmq.reply-to";

/// Outcome of an idempotent broker-side removal (consumer cancellation, channel closure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The consumer or channel was already gone. This is not an error.
    AlreadyAbsent,
}

/// Deliveries received by one consumer registration.
///
/// The stream ends when the consumer is cancelled or its channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<ReplyMessage, ChannelFault>>;

/// A consumer armed on a channel.
pub struct ConsumerRegistration {
    pub tag: ConsumerTag,
    pub deliveries: DeliveryStream,
}

/// Where a request is published to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    /// Publish straight to `queue` through the default exchange.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: queue.into(),
        }
    }
}

/// Supplies broker channels and the consumer primitives the registry needs.
///
/// [`LapinChannelSource`](super::LapinChannelSource) is the production implementation; tests
/// plug in an in-memory broker.
///
/// Implementations must treat `close_channel` and `cancel_consumer` as idempotent: closing an
/// unknown or already-closed channel, or cancelling an unknown consumer tag, returns
/// [`Removal::AlreadyAbsent`].
#[async_trait::async_trait]
pub trait ChannelSource: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<ChannelId, ChannelFault>;

    async fn close_channel(&self, channel: ChannelId) -> Result<Removal, ChannelFault>;

    /// Start consuming from `queue` on `channel`, in no-ack mode.
    async fn register_consumer(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<ConsumerRegistration, ChannelFault>;

    async fn cancel_consumer(
        &self,
        channel: ChannelId,
        tag: &ConsumerTag,
    ) -> Result<Removal, ChannelFault>;

    async fn publish(
        &self,
        channel: ChannelId,
        destination: &Destination,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), ChannelFault>;
}

/// assert it's object safe
type _CHECK = Box<dyn ChannelSource>;

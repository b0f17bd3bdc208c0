use super::RequestEnvelope;
use crate::direct_reply::{
    BorrowError, ChannelFault, ChannelId, ContainerError, DirectReplyContainer, Holder, ReleaseCause,
    ReplyListener, ReplyMessage, DIRECT_REPLY_TO_QUEUE,
};
use amq_protocol_types::ShortString;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Error returned by [`ReplyClient::send_and_receive`].
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("Failed to borrow a reply channel")]
    Borrow(#[from] BorrowError),
    #[error("Failed to publish the request")]
    Publish(#[source] ChannelFault),
    #[error("No reply was received within {0:?}")]
    ReplyTimeout(Duration),
    #[error("The reply did not match the pending request and was discarded")]
    ReplyDiscarded,
}

/// Synchronous request/reply on top of a [`DirectReplyContainer`].
///
/// `ReplyClient` installs its own listener on the container: replies are routed back to the
/// request waiting on the channel they were delivered to.
pub struct ReplyClient {
    container: Arc<DirectReplyContainer>,
    pending: Arc<PendingReplies>,
}

impl ReplyClient {
    /// Install the client's listener on a stopped `container`.
    ///
    /// The container still has to be started.
    pub fn new(container: Arc<DirectReplyContainer>) -> Result<Self, ContainerError> {
        let pending = Arc::new(PendingReplies::default());
        container.set_listener(Arc::clone(&pending))?;
        Ok(Self { container, pending })
    }

    pub fn container(&self) -> &Arc<DirectReplyContainer> {
        &self.container
    }

    /// Publish `envelope` and wait at most `reply_timeout` for its reply.
    ///
    /// `reply_to` is always set to the direct reply-to pseudo-queue; a correlation id is
    /// generated if the envelope does not carry one.
    ///
    /// On timeout the channel is cancelled and closed, so a late reply cannot reach the next
    /// request borrowing it. If the reply won the race, that release is a no-op. Dropping the
    /// returned future before the reply arrives releases the channel the same way.
    #[tracing::instrument(
        skip_all,
        name = "direct_reply_send_and_receive",
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key)
    )]
    pub async fn send_and_receive(
        &self,
        envelope: RequestEnvelope,
        reply_timeout: Duration,
    ) -> Result<ReplyMessage, RequestError> {
        let (envelope, correlation_id) = envelope
            .with_reply_to(DIRECT_REPLY_TO_QUEUE.into())
            .with_default_properties()
            .ensure_correlation_id();
        let holder = self.container.borrow().await?;

        let (sender, receiver) = oneshot::channel();
        self.pending
            .insert(holder.channel(), correlation_id.clone(), sender);
        let mut outstanding = OutstandingRequest {
            client: self,
            holder,
            correlation_id,
            cause: None,
            settled: false,
        };

        self.container
            .publish(
                &outstanding.holder,
                &envelope.destination(),
                envelope.properties,
                &envelope.payload,
            )
            .await
            .map_err(RequestError::Publish)?;

        match tokio::time::timeout(reply_timeout, receiver).await {
            // The consumer task releases the channel once the listener returns.
            Ok(Ok(reply)) => {
                outstanding.settled = true;
                Ok(reply)
            }
            Ok(Err(_)) => {
                outstanding.settled = true;
                Err(RequestError::ReplyDiscarded)
            }
            Err(_) => {
                outstanding.cause = Some(ReleaseCause::Timeout);
                Err(RequestError::ReplyTimeout(reply_timeout))
            }
        }
    }
}

/// A published request whose reply has not been handed over yet.
///
/// Unless `settled`, dropping it forgets the pending reply and releases the channel with
/// `cancel = true`.
struct OutstandingRequest<'a> {
    client: &'a ReplyClient,
    holder: Holder,
    correlation_id: ShortString,
    cause: Option<ReleaseCause>,
    settled: bool,
}

impl Drop for OutstandingRequest<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.client
            .pending
            .remove_if(self.holder.channel(), &self.correlation_id);
        self.client
            .container
            .release(&self.holder, true, self.cause.take());
    }
}

struct PendingReply {
    correlation_id: ShortString,
    sender: oneshot::Sender<ReplyMessage>,
}

/// Requests waiting for a reply, keyed by the channel they were published on.
#[derive(Default)]
struct PendingReplies(Mutex<HashMap<ChannelId, PendingReply>>);

impl PendingReplies {
    fn insert(
        &self,
        channel: ChannelId,
        correlation_id: ShortString,
        sender: oneshot::Sender<ReplyMessage>,
    ) {
        self.lock().insert(
            channel,
            PendingReply {
                correlation_id,
                sender,
            },
        );
    }

    /// Forget the request pending on `channel`, unless it has been replaced by a newer one.
    fn remove_if(&self, channel: ChannelId, correlation_id: &ShortString) {
        let mut pending = self.lock();
        if pending
            .get(&channel)
            .is_some_and(|p| &p.correlation_id == correlation_id)
        {
            pending.remove(&channel);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, PendingReply>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ReplyListener for Arc<PendingReplies> {
    async fn on_message(
        &self,
        message: ReplyMessage,
        channel: ChannelId,
    ) -> Result<(), anyhow::Error> {
        let pending = self.lock().remove(&channel);
        let Some(pending) = pending else {
            tracing::warn!(%channel, "Received a reply with no pending request");
            return Ok(());
        };
        let correlation_id = message.properties.correlation_id().as_ref();
        if correlation_id != Some(&pending.correlation_id) {
            anyhow::bail!(
                "Reply correlation id {:?} does not match the pending request {}",
                correlation_id.map(|id| id.as_str()),
                pending.correlation_id
            );
        }
        if pending.sender.send(message).is_err() {
            tracing::debug!(%channel, "The requester stopped waiting before the reply arrived");
        }
        Ok(())
    }
}

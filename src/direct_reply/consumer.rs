use super::{
    registry::ConsumerRegistry, ChannelId, DeliveryStream, Holder, ListenerFailure, ReleaseCause,
    ReplyListener, ReplyMessage,
};
use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// The delivery side of one borrow generation.
///
/// The registry arms a `DirectReplyConsumer` every time it hands out a channel.
/// It waits for the first delivery on the consumer registration, runs the listener on it and
/// then releases its own [`Holder`]:
/// - `release(holder, cancel = false, None)` if the listener succeeded;
/// - `release(holder, cancel = true, Some(cause))` if the listener failed or panicked, or if the
///   broker reported a fault on the consumer.
///
/// Exactly one release is issued per delivery, and a generation attributes at most one
/// delivery. If the holder has already been released by someone else (e.g. a caller that
/// timed out) the release is a no-op.
///
/// If the registration is cancelled before anything is delivered, the stream ends and the
/// consumer exits without releasing.
pub(super) struct DirectReplyConsumer {
    holder: Holder,
    registry: Arc<ConsumerRegistry>,
    listener: Arc<dyn ReplyListener>,
}

impl DirectReplyConsumer {
    pub(super) fn new(
        holder: Holder,
        registry: Arc<ConsumerRegistry>,
        listener: Arc<dyn ReplyListener>,
    ) -> Self {
        Self {
            holder,
            registry,
            listener,
        }
    }

    /// Listen for the reply as its own task, isolating listener failures from the caller.
    pub(super) fn spawn(self, deliveries: DeliveryStream) -> JoinHandle<()> {
        tokio::spawn(self.run(deliveries))
    }

    #[tracing::instrument(
        skip_all,
        name = "direct_reply_consume",
        fields(
            channel = %self.holder.channel(),
            consumer_tag = %self.holder.consumer_tag(),
            generation = self.holder.generation(),
        )
    )]
    async fn run(self, mut deliveries: DeliveryStream) {
        let Some(delivery) = deliveries.next().await else {
            tracing::debug!("Reply consumer cancelled before any delivery");
            return;
        };
        let _in_flight = self.registry.in_flight().enter();

        let failure = match delivery {
            Ok(message) => self
                .dispatch(message)
                .await
                .err()
                .map(ReleaseCause::ListenerFailure),
            Err(fault) => Some(ReleaseCause::ChannelFault(fault)),
        };
        self.registry
            .release(&self.holder, failure.is_some(), failure);
    }

    /// Run the listener, turning errors and panics into a [`ListenerFailure`].
    async fn dispatch(&self, message: ReplyMessage) -> Result<(), ListenerFailure> {
        let channel: ChannelId = self.holder.channel();
        match AssertUnwindSafe(self.listener.on_message(message, channel))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ListenerFailure::new(e)),
            Err(panic) => Err(ListenerFailure::panicked(panic)),
        }
    }
}

/// Counts work that `stop` has to wait for: deliveries being processed and channels being
/// cancelled/closed in the background.
#[derive(Default)]
pub(super) struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    pub(super) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    pub(super) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once nothing is in flight.
    pub(super) async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a concurrent drop cannot be missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(super) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

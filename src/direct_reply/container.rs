use super::{
    registry::ConsumerRegistry, BorrowError, ChannelFault, ChannelSource, ContainerError,
    Destination, DirectReplySettings, Holder, ReleaseCause, ReplyListener,
};
use lapin::BasicProperties;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Lifecycle of a [`DirectReplyContainer`].
///
/// `Stopped -> Running -> Stopping -> Stopped` are the only valid transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Running,
    Stopping,
}

/// A pool of channels consuming from the direct reply-to pseudo-queue.
///
/// `DirectReplyContainer` is the entrypoint for request/reply over RabbitMq without a
/// temporary queue per request: [`borrow`](Self::borrow) a channel, publish a request with
/// `reply_to` set to [`DIRECT_REPLY_TO_QUEUE`](super::DIRECT_REPLY_TO_QUEUE) on it, and the
/// reply is handed to your [`ReplyListener`] together with the channel it arrived on.
///
/// Once the listener is done, the channel is released automatically. Callers can release
/// it themselves too (e.g. after a timeout): whichever release comes second is a no-op.
///
/// # Lifecycle
///
/// 1. [`set_listener`](Self::set_listener) - only while stopped.
/// 2. [`start`](Self::start) - pre-warms channels and starts reclaiming idle ones.
/// 3. [`stop`](Self::stop) - closes every channel, waiting a grace period for replies being
///    processed. The container can be started again afterwards.
pub struct DirectReplyContainer {
    registry: Arc<ConsumerRegistry>,
    settings: DirectReplySettings,
    idle_reaper: Mutex<Option<JoinHandle<()>>>,
}

impl DirectReplyContainer {
    pub fn new(source: Arc<dyn ChannelSource>, settings: DirectReplySettings) -> Self {
        Self {
            registry: Arc::new(ConsumerRegistry::new(source)),
            settings,
            idle_reaper: Mutex::new(None),
        }
    }

    /// Install the listener replies are dispatched to.
    ///
    /// Fails with [`ContainerError::AlreadyRunning`] unless the container is stopped.
    pub fn set_listener<L: ReplyListener>(&self, listener: L) -> Result<(), ContainerError> {
        self.registry.set_listener(Arc::new(listener))
    }

    /// Start the container.
    ///
    /// Requires a listener. `prewarm_channels` channels are opened straight away; if that
    /// fails, the container is stopped again and the fault is returned.
    #[tracing::instrument(skip_all, name = "direct_reply_container_start")]
    pub async fn start(&self) -> Result<(), ContainerError> {
        self.registry
            .begin_running(self.settings.max_concurrent_channels)?;

        if let Err(fault) = self.registry.prewarm(self.settings.prewarm_channels).await {
            tracing::error!(error = %fault, "Failed to pre-warm reply channels");
            self.stop(Duration::ZERO).await;
            return Err(ContainerError::Prewarm(fault));
        }

        let registry = Arc::clone(&self.registry);
        let max_idle = self.settings.idle_timeout();
        let mut ticker = tokio::time::interval(self.settings.idle_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reaper = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let reaped = registry.reap_idle(max_idle).await;
                if reaped > 0 {
                    tracing::info!(reaped, "Closed idle reply channels");
                }
            }
        });
        *self
            .idle_reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        tracing::info!(
            max_concurrent_channels = self.settings.max_concurrent_channels,
            "Direct reply-to container started"
        );
        Ok(())
    }

    /// Stop the container, waiting at most `grace_period` for replies being processed.
    ///
    /// New borrows fail with [`BorrowError::ShuttingDown`] as soon as `stop` is called.
    /// When `stop` returns, every channel has been closed and every consumer cancelled.
    /// A `stop` issued while another one is in progress waits for it to complete.
    /// Calling `stop` on a stopped container is a no-op.
    ///
    /// The returned future must be driven to completion: dropping it leaves the container
    /// `Stopping`.
    #[tracing::instrument(skip(self), name = "direct_reply_container_stop")]
    pub async fn stop(&self, grace_period: Duration) {
        if !self.registry.begin_stopping() {
            self.registry.stopped().await;
            return;
        }
        if let Some(reaper) = self
            .idle_reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.abort();
        }
        self.registry.shut_down(grace_period).await;
        tracing::info!("Direct reply-to container stopped");
    }

    /// [`stop`](Self::stop) with the configured `shutdown_grace_period`.
    pub async fn shutdown(&self) {
        self.stop(self.settings.shutdown_grace_period()).await
    }

    /// Borrow a channel, waiting at most the configured `borrow_timeout` for capacity.
    pub async fn borrow(&self) -> Result<Holder, BorrowError> {
        self.registry.borrow(self.settings.borrow_timeout()).await
    }

    /// Borrow a channel, waiting at most `timeout` for capacity (forever if `None`).
    pub async fn borrow_with_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Holder, BorrowError> {
        self.registry.borrow(timeout).await
    }

    /// See [`ConsumerRegistry::release`].
    pub fn release(&self, holder: &Holder, cancel: bool, cause: Option<ReleaseCause>) {
        self.registry.release(holder, cancel, cause)
    }

    /// Publish on the channel borrowed by `holder`.
    ///
    /// Fails if `holder` has been released in the meantime.
    #[tracing::instrument(
        skip(self, holder, properties, body),
        name = "direct_reply_publish",
        fields(channel = %holder.channel()),
        level = tracing::Level::DEBUG
    )]
    pub async fn publish(
        &self,
        holder: &Holder,
        destination: &Destination,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), ChannelFault> {
        if self.registry.current_holder(holder.channel()).as_ref() != Some(holder) {
            return Err(anyhow::anyhow!(
                "The holder for {} has already been released",
                holder.channel()
            )
            .into());
        }
        self.registry
            .source()
            .publish(holder.channel(), destination, properties, body)
            .await
    }

    pub fn state(&self) -> ContainerState {
        self.registry.lifecycle()
    }

    /// The registry tracking the channels managed by the container.
    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &DirectReplySettings {
        &self.settings
    }
}

impl Drop for DirectReplyContainer {
    fn drop(&mut self) {
        if let Some(reaper) = self
            .idle_reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.abort();
        }
    }
}

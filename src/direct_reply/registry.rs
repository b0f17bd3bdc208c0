use super::{
    consumer::{DirectReplyConsumer, InFlight, InFlightGuard},
    container::ContainerState,
    BorrowError, ChannelFault, ChannelId, ChannelSource, ConsumerRegistration, ConsumerTag,
    ContainerError, Holder, ReleaseCause, Removal, ReplyListener, DIRECT_REPLY_TO_QUEUE,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// The authoritative in-use/free bookkeeping for reply channels.
///
/// Every channel known to the registry is either in use - bound to exactly one live
/// [`Holder`] - or free, waiting to be borrowed again. Never both.
///
/// All state transitions go through [`borrow`](Self::borrow), [`release`](Self::release) and
/// [`reap_idle`](Self::reap_idle). Both sets live behind a single mutex, so the "remove only
/// if the holder matches" check in `release` is atomic with the removal.
///
/// The number of channels in use is capped by a semaphore: a borrow takes a permit, a
/// release of the current holder gives it back.
pub struct ConsumerRegistry {
    source: Arc<dyn ChannelSource>,
    state: Mutex<RegistryState>,
    generations: AtomicU64,
    in_flight: Arc<InFlight>,
    /// Held for the whole of a reap, so that reaps never overlap.
    reaping: tokio::sync::Mutex<()>,
    stopped: Notify,
}

struct RegistryState {
    lifecycle: ContainerState,
    listener: Option<Arc<dyn ReplyListener>>,
    permits: Arc<Semaphore>,
    in_use: HashMap<ChannelId, Holder>,
    free: VecDeque<FreeChannel>,
    runtime: Option<Handle>,
}

/// A channel waiting to be borrowed again.
struct FreeChannel {
    channel: ChannelId,
    /// The consumer left armed by the previous generation, cancelled on the next borrow.
    armed: Option<ConsumerTag>,
    returned_at: Instant,
}

impl FreeChannel {
    fn idle_longer_than(&self, max_idle: Duration, now: Instant) -> bool {
        now.duration_since(self.returned_at) > max_idle
    }
}

/// A borrow in progress: the channel it took from the free list, or opened, before it is
/// bound to a holder.
///
/// Dropping a `PendingBorrow` that still owns a channel retires it. That covers both a failed
/// borrow and a borrowing future dropped by its caller. A pending borrow counts as in-flight
/// work, so `stop` waits for it.
struct PendingBorrow<'a> {
    registry: &'a ConsumerRegistry,
    channel: Option<ChannelId>,
    /// A consumer still armed on `channel` by a previous generation.
    armed: Option<ConsumerTag>,
    _in_flight: InFlightGuard,
}

impl<'a> PendingBorrow<'a> {
    fn new(registry: &'a ConsumerRegistry) -> Self {
        Self {
            registry,
            channel: None,
            armed: None,
            _in_flight: registry.in_flight.enter(),
        }
    }

    fn hold(&mut self, channel: ChannelId, armed: Option<ConsumerTag>) {
        self.channel = Some(channel);
        self.armed = armed;
    }

    /// Hand the channel over: dropping `self` no longer retires it.
    fn bind(&mut self) {
        self.channel = None;
        self.armed = None;
    }

    fn retire(&mut self) {
        if let Some(channel) = self.channel.take() {
            let runtime = self.registry.lock().runtime.clone();
            self.registry
                .retire_in_background(runtime, channel, self.armed.take());
        }
    }
}

impl Drop for PendingBorrow<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel {
            tracing::debug!(%channel, "Borrow abandoned before its consumer was armed");
        }
        self.retire();
    }
}

impl ConsumerRegistry {
    pub(super) fn new(source: Arc<dyn ChannelSource>) -> Self {
        Self {
            source,
            state: Mutex::new(RegistryState {
                lifecycle: ContainerState::Stopped,
                listener: None,
                permits: Arc::new(Semaphore::new(0)),
                in_use: HashMap::new(),
                free: VecDeque::new(),
                runtime: None,
            }),
            generations: AtomicU64::new(0),
            in_flight: Arc::new(InFlight::default()),
            reaping: tokio::sync::Mutex::new(()),
            stopped: Notify::new(),
        }
    }

    /// Borrow a channel with a freshly armed reply consumer.
    ///
    /// A free channel is reused if there is one, otherwise a new channel is opened. When
    /// `max_concurrent_channels` are already in use, `borrow` waits for a release - at most
    /// `timeout`, forever if `None` - and fails with [`BorrowError::CapacityExceeded`] after that.
    ///
    /// Dropping the returned future is safe at any point: a channel that was being prepared
    /// is closed and the capacity it reserved is given back.
    #[tracing::instrument(skip(self), name = "direct_reply_borrow")]
    pub async fn borrow(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Holder, BorrowError> {
        let permit = self.acquire_permit(timeout).await?;
        let mut pending = PendingBorrow::new(self);
        loop {
            let (channel, reused) = match self.pop_free()? {
                Some(free) => {
                    pending.hold(free.channel, free.armed.clone());
                    if let Some(stale) = free.armed {
                        self.cancel(free.channel, &stale).await;
                        pending.armed = None;
                    }
                    (free.channel, true)
                }
                None => {
                    let channel = self
                        .source
                        .open_channel()
                        .await
                        .map_err(BorrowError::ChannelFault)?;
                    pending.hold(channel, None);
                    (channel, false)
                }
            };

            match self
                .source
                .register_consumer(channel, DIRECT_REPLY_TO_QUEUE)
                .await
            {
                Ok(registration) => {
                    pending.bind();
                    return self.activate(channel, registration, permit);
                }
                Err(fault) => {
                    tracing::warn!(%channel, error = %fault, "Failed to arm a reply consumer");
                    pending.retire();
                    if !reused {
                        return Err(BorrowError::ChannelFault(fault));
                    }
                }
            }
        }
    }

    /// Release a borrowed channel.
    ///
    /// If `holder` is not the current holder of its channel - the channel was released
    /// already, possibly borrowed again since - this is a no-op.
    ///
    /// Otherwise the channel leaves the in-use set. Without `cancel` and `cause` it goes back
    /// to the free list. With either, its consumer is cancelled and the channel is closed.
    ///
    /// `release` never blocks and never fails.
    pub fn release(&self, holder: &Holder, cancel: bool, cause: Option<ReleaseCause>) {
        let channel = holder.channel();
        let runtime = {
            let mut state = self.lock();
            if state.in_use.get(&channel) != Some(holder) {
                tracing::debug!(
                    %channel,
                    generation = holder.generation(),
                    "Ignoring release of a stale holder"
                );
                return;
            }
            state.in_use.remove(&channel);
            state.permits.add_permits(1);

            if !cancel && cause.is_none() && state.lifecycle == ContainerState::Running {
                state.free.push_back(FreeChannel {
                    channel,
                    armed: Some(holder.consumer_tag().clone()),
                    returned_at: Instant::now(),
                });
                tracing::debug!(%channel, generation = holder.generation(), "Reply channel returned to the pool");
                return;
            }
            state.runtime.clone()
        };

        match &cause {
            Some(cause) => {
                tracing::warn!(%channel, %cause, "Closing reply channel instead of reusing it")
            }
            None => tracing::debug!(%channel, "Closing released reply channel"),
        }
        self.retire_in_background(
            runtime,
            channel,
            Some(holder.consumer_tag().clone()),
        );
    }

    /// Close every free channel that has been idle for longer than `max_idle`.
    ///
    /// Returns how many channels were reclaimed. Concurrent calls, including the container's
    /// own reaper, run one after the other.
    #[tracing::instrument(skip(self), name = "direct_reply_reap_idle", level = tracing::Level::DEBUG)]
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let _reaping = self.reaping.lock().await;
        let (expired, runtime) = {
            let mut state = self.lock();
            let now = Instant::now();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = state
                .free
                .drain(..)
                .partition(|free| free.idle_longer_than(max_idle, now));
            state.free = kept;
            (expired, state.runtime.clone())
        };

        let reaped = expired.len();
        let handles: Vec<_> = expired
            .into_iter()
            .filter_map(|free| {
                tracing::debug!(channel = %free.channel, "Reclaiming idle reply channel");
                self.retire_in_background(runtime.clone(), free.channel, free.armed)
            })
            .collect();
        futures_util::future::join_all(handles).await;
        reaped
    }

    /// Number of channels currently borrowed.
    pub fn in_use_count(&self) -> usize {
        self.lock().in_use.len()
    }

    /// Number of channels waiting in the free list.
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Whether `channel` is currently borrowed.
    pub fn contains(&self, channel: ChannelId) -> bool {
        self.lock().in_use.contains_key(&channel)
    }

    /// Whether `channel` is waiting in the free list.
    pub fn is_free(&self, channel: ChannelId) -> bool {
        self.lock().free.iter().any(|free| free.channel == channel)
    }

    /// The live holder for `channel`, if it is borrowed.
    pub fn current_holder(&self, channel: ChannelId) -> Option<Holder> {
        self.lock().in_use.get(&channel).cloned()
    }

    pub(super) fn source(&self) -> &dyn ChannelSource {
        self.source.as_ref()
    }

    pub(super) fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    pub(super) fn lifecycle(&self) -> ContainerState {
        self.lock().lifecycle
    }

    pub(super) fn set_listener(&self, listener: Arc<dyn ReplyListener>) -> Result<(), ContainerError> {
        let mut state = self.lock();
        if state.lifecycle != ContainerState::Stopped {
            return Err(ContainerError::AlreadyRunning);
        }
        state.listener = Some(listener);
        Ok(())
    }

    /// `Stopped -> Running`, with `max_channels` borrow permits.
    pub(super) fn begin_running(&self, max_channels: usize) -> Result<(), ContainerError> {
        let mut state = self.lock();
        if state.lifecycle != ContainerState::Stopped {
            return Err(ContainerError::InvalidState {
                operation: "start",
                state: state.lifecycle,
            });
        }
        if state.listener.is_none() {
            return Err(ContainerError::ListenerNotSet);
        }
        state.lifecycle = ContainerState::Running;
        state.permits = Arc::new(Semaphore::new(max_channels));
        state.runtime = Handle::try_current().ok();
        Ok(())
    }

    /// Resolves once the registry is no longer `Stopping`.
    pub(super) async fn stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lifecycle() != ContainerState::Stopping {
                return;
            }
            notified.await;
        }
    }

    /// `Running -> Stopping`. Returns `false` if the registry was not running.
    ///
    /// Borrowers waiting for capacity are woken up and fail with
    /// [`BorrowError::ShuttingDown`].
    pub(super) fn begin_stopping(&self) -> bool {
        let mut state = self.lock();
        if state.lifecycle != ContainerState::Running {
            return false;
        }
        state.lifecycle = ContainerState::Stopping;
        state.permits.close();
        true
    }

    /// Open `count` channels and park them on the free list, without consumers.
    pub(super) async fn prewarm(&self, count: usize) -> Result<(), ChannelFault> {
        for _ in 0..count {
            let channel = self.source.open_channel().await?;
            self.lock().free.push_back(FreeChannel {
                channel,
                armed: None,
                returned_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Drain the registry while `Stopping`, then move to `Stopped`.
    ///
    /// Free channels are closed straight away. Consumers on borrowed channels are cancelled,
    /// so that nothing new is delivered, and deliveries already being processed get up to
    /// `grace` to release their channel. Whatever is still borrowed after that is closed.
    pub(super) async fn shut_down(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        let (free, borrowed, runtime) = {
            let mut state = self.lock();
            let borrowed: Vec<Holder> = state.in_use.values().cloned().collect();
            (
                std::mem::take(&mut state.free),
                borrowed,
                state.runtime.clone(),
            )
        };

        let mut handles: Vec<_> = free
            .into_iter()
            .filter_map(|free| self.retire_in_background(runtime.clone(), free.channel, free.armed))
            .collect();
        for holder in &borrowed {
            self.cancel(holder.channel(), holder.consumer_tag()).await;
        }

        if tokio::time::timeout_at(deadline, self.in_flight.drained())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.in_flight.count(),
                "Grace period elapsed with reply deliveries still in flight"
            );
        }

        let leftover: Vec<Holder> = {
            let mut state = self.lock();
            state.in_use.drain().map(|(_, holder)| holder).collect()
        };
        for holder in leftover {
            tracing::debug!(channel = %holder.channel(), "Force-closing borrowed reply channel");
            handles.extend(self.retire_in_background(
                runtime.clone(),
                holder.channel(),
                Some(holder.consumer_tag().clone()),
            ));
        }
        futures_util::future::join_all(handles).await;

        {
            let mut state = self.lock();
            state.free.clear();
            state.lifecycle = ContainerState::Stopped;
        }
        self.stopped.notify_waiters();
    }

    async fn acquire_permit(
        &self,
        timeout: Option<Duration>,
    ) -> Result<OwnedSemaphorePermit, BorrowError> {
        let permits = {
            let state = self.lock();
            if state.lifecycle != ContainerState::Running {
                return Err(BorrowError::ShuttingDown);
            }
            Arc::clone(&state.permits)
        };
        let acquire = permits.acquire_owned();
        let permit = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| BorrowError::CapacityExceeded(timeout))?,
            None => acquire.await,
        };
        permit.map_err(|_| BorrowError::ShuttingDown)
    }

    fn pop_free(&self) -> Result<Option<FreeChannel>, BorrowError> {
        let mut state = self.lock();
        if state.lifecycle != ContainerState::Running {
            return Err(BorrowError::ShuttingDown);
        }
        Ok(state.free.pop_front())
    }

    /// Publish the new holder and start listening for its reply.
    ///
    /// The holder must be in the in-use set before the consumer task starts: a reply could
    /// otherwise be processed, and released, before the registry knows about the borrow.
    fn activate(
        self: &Arc<Self>,
        channel: ChannelId,
        registration: ConsumerRegistration,
        permit: OwnedSemaphorePermit,
    ) -> Result<Holder, BorrowError> {
        let holder = Holder::new(
            channel,
            registration.tag,
            self.generations.fetch_add(1, Ordering::Relaxed) + 1,
        );
        let mut state = self.lock();
        let listener = match (state.lifecycle, state.listener.clone()) {
            (ContainerState::Running, Some(listener)) => listener,
            _ => {
                let runtime = state.runtime.clone();
                drop(state);
                self.retire_in_background(runtime, channel, Some(holder.consumer_tag().clone()));
                return Err(BorrowError::ShuttingDown);
            }
        };
        state.in_use.insert(channel, holder.clone());
        drop(state);
        permit.forget();

        DirectReplyConsumer::new(holder.clone(), Arc::clone(self), listener)
            .spawn(registration.deliveries);
        tracing::debug!(%channel, generation = holder.generation(), "Reply channel borrowed");
        Ok(holder)
    }

    /// Cancel `tag` and close `channel` on a background task tracked as in flight.
    fn retire_in_background(
        &self,
        runtime: Option<Handle>,
        channel: ChannelId,
        tag: Option<ConsumerTag>,
    ) -> Option<JoinHandle<()>> {
        let Some(runtime) = Handle::try_current().ok().or(runtime) else {
            tracing::error!(%channel, "No async runtime available to close the reply channel");
            return None;
        };
        let source = Arc::clone(&self.source);
        let guard = self.in_flight.enter();
        Some(runtime.spawn(async move {
            let _guard = guard;
            if let Some(tag) = tag {
                cancel_consumer(source.as_ref(), channel, &tag).await;
            }
            close_channel(source.as_ref(), channel).await;
        }))
    }

    async fn cancel(&self, channel: ChannelId, tag: &ConsumerTag) {
        cancel_consumer(self.source.as_ref(), channel, tag).await
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn cancel_consumer(source: &dyn ChannelSource, channel: ChannelId, tag: &ConsumerTag) {
    match source.cancel_consumer(channel, tag).await {
        Ok(Removal::Removed) => {}
        Ok(Removal::AlreadyAbsent) => {
            tracing::debug!(%channel, consumer_tag = %tag, "Reply consumer was already cancelled")
        }
        Err(e) => {
            tracing::warn!(%channel, consumer_tag = %tag, error = %e, "Failed to cancel reply consumer")
        }
    }
}

async fn close_channel(source: &dyn ChannelSource, channel: ChannelId) {
    match source.close_channel(channel).await {
        Ok(Removal::Removed) => {}
        Ok(Removal::AlreadyAbsent) => {
            tracing::debug!(%channel, "Reply channel was already closed")
        }
        Err(e) => tracing::warn!(%channel, error = %e, "Failed to close reply channel"),
    }
}

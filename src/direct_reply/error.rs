use super::container::ContainerState;
use std::any::Any;
use std::fmt;
use std::time::Duration;

/// The broker signalled that a channel, or a consumer on it, is unusable.
///
/// A channel that produced a `ChannelFault` is never handed out again: it is cancelled
/// and closed instead of being returned to the free list.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct ChannelFault(#[from] anyhow::Error);

impl From<lapin::Error> for ChannelFault {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}

impl From<crate::pool::Error> for ChannelFault {
    fn from(err: crate::pool::Error) -> Self {
        Self(err.into())
    }
}

/// Error returned when a reply channel cannot be borrowed.
#[derive(thiserror::Error, Debug)]
pub enum BorrowError {
    #[error("No reply channel became available within {0:?}")]
    CapacityExceeded(Duration),
    #[error("The direct reply-to container is not running")]
    ShuttingDown,
    #[error("Failed to prepare a reply channel")]
    ChannelFault(#[source] ChannelFault),
}

/// The reply listener returned an error, or panicked, while processing a delivery.
#[derive(thiserror::Error, Debug)]
#[error("The reply listener failed to process a message")]
pub struct ListenerFailure(#[source] anyhow::Error);

impl ListenerFailure {
    pub fn new(error: anyhow::Error) -> Self {
        Self(error)
    }

    pub(super) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".into());
        Self(anyhow::anyhow!("Reply listener panicked: {reason}"))
    }
}

/// Why a borrowed channel is released without being made available again.
#[derive(Debug)]
pub enum ReleaseCause {
    /// The listener failed while processing the reply delivered on the channel.
    ListenerFailure(ListenerFailure),
    /// The broker reported a fault on the channel or its consumer.
    ChannelFault(ChannelFault),
    /// The caller gave up waiting for a reply.
    Timeout,
}

impl fmt::Display for ReleaseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailure(e) => write!(f, "listener failure: {:#}", e.0),
            Self::ChannelFault(e) => write!(f, "channel fault: {e:#}"),
            Self::Timeout => write!(f, "timed out waiting for a reply"),
        }
    }
}

/// Errors raised by the lifecycle operations of [`DirectReplyContainer`](super::DirectReplyContainer).
#[derive(thiserror::Error, Debug)]
pub enum ContainerError {
    #[error("A reply listener must be set before starting the container")]
    ListenerNotSet,
    #[error("The reply listener can only be replaced while the container is stopped")]
    AlreadyRunning,
    #[error("Cannot {operation} a container that is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ContainerState,
    },
    #[error("Failed to pre-warm reply channels")]
    Prewarm(#[source] ChannelFault),
}

//! Request/reply over RabbitMq's [direct reply-to](https://www.rabbitmq.com/direct-reply-to.html)
//! pseudo-queue. Check out [`DirectReplyContainer`] as a starting point.
//!
//! A reply channel goes through a loop of borrow generations:
//!
//! ```text
//!        borrow -> Holder(gen N) -> reply delivered -> listener -> release(gen N)
//!          ^                                                           |
//!          +------------------------ free list <-----------------------+
//! ```
//!
//! Each borrow mints a new [`Holder`]. Releasing an old one after the channel has been
//! borrowed again is a no-op, which is what makes it safe for a caller to release a channel
//! on a timeout while the reply is being processed.
pub use configuration::DirectReplySettings;
pub use container::{ContainerState, DirectReplyContainer};
pub use error::{BorrowError, ChannelFault, ContainerError, ListenerFailure, ReleaseCause};
pub use holder::{ChannelId, ConsumerTag, Holder};
pub use lapin_source::LapinChannelSource;
pub use listener::{ClosureListener, ReplyListener, ReplyMessage};
pub use registry::ConsumerRegistry;
pub use source::{
    ChannelSource, ConsumerRegistration, DeliveryStream, Destination, Removal,
    DIRECT_REPLY_TO_QUEUE,
};

mod configuration;
mod consumer;
mod container;
mod error;
mod holder;
mod lapin_source;
mod listener;
mod registry;
mod source;

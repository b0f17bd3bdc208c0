//! `carrot-cake-direct-reply` pools RabbitMq channels for request/reply messaging over the
//! [direct reply-to](https://www.rabbitmq.com/direct-reply-to.html) pseudo-queue, built on
//! top of [`lapin`].
//!
//! Replies are delivered straight to the channel that published the request, so no
//! temporary queue has to be declared per request. The hard part is the channel lifecycle:
//! a channel is borrowed, handed to the consumer task that processes its reply and released
//! back to the pool - while the requester may release it at the same time (e.g. when it
//! gives up waiting). [`DirectReplyContainer`](crate::direct_reply::DirectReplyContainer)
//! makes those releases generation-aware and idempotent.
//!
//! [`ReplyClient`](crate::requests::ReplyClient) is the best starting point if you just want
//! to send a request and await its reply.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod direct_reply;
pub mod pool;
pub mod requests;

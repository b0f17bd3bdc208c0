//! Request/reply messaging on top of the direct reply-to container.
//! Check out [`ReplyClient`] as a starting point.
mod client;
mod envelope;

pub use client::{ReplyClient, RequestError};
pub use envelope::RequestEnvelope;

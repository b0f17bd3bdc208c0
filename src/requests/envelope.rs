use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString, Timestamp};
use lapin::BasicProperties;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::direct_reply::Destination;

/// A request to be sent via [`ReplyClient`](super::ReplyClient).
#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    // The body of the request - as a sequence of bytes.
    pub payload: Vec<u8>,
    // The name of the exchange the request is published to. Empty for the default exchange.
    pub exchange_name: String,
    // The routing key used to route the request to the responder's queue.
    pub routing_key: String,
    // AMQP properties attached to the request.
    // `reply_to` and `correlation_id` are set by the client.
    pub properties: BasicProperties,
}

impl RequestEnvelope {
    /// A request routed straight to `queue` through the default exchange.
    pub fn to_queue(queue: impl Into<String>) -> Self {
        Self::default().with_routing_key(queue.into())
    }

    pub fn with_payload(mut self, value: Vec<u8>) -> Self {
        self.payload = value;
        self
    }

    pub fn with_exchange_name(mut self, value: String) -> Self {
        self.exchange_name = value;
        self
    }

    pub fn with_routing_key(mut self, value: String) -> Self {
        self.routing_key = value;
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    pub fn with_priority(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_priority(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub(super) fn with_reply_to(self, value: ShortString) -> Self {
        self.props(|p| p.with_reply_to(value))
    }

    pub fn with_expiration(self, value: ShortString) -> Self {
        self.props(|p| p.with_expiration(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }

    pub fn destination(&self) -> Destination {
        Destination {
            exchange: self.exchange_name.clone(),
            routing_key: self.routing_key.clone(),
        }
    }

    /// The correlation id of the request, minting a UUID v4 if none was set.
    pub(super) fn ensure_correlation_id(self) -> (Self, ShortString) {
        match self.properties.correlation_id().clone() {
            Some(id) => (self, id),
            None => {
                let id: ShortString = Uuid::new_v4().to_string().into();
                (self.with_correlation_id(id.clone()), id)
            }
        }
    }

    /// Fill in `timestamp` and `message_id` when the caller left them empty.
    pub(super) fn with_default_properties(self) -> Self {
        let props = self.properties.clone();
        let props = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => {
                let ts = *props.timestamp();
                props.with_timestamp(ts.unwrap_or(now.as_secs()))
            }
            Err(_) => {
                tracing::warn!("System time is before 1970");
                props
            }
        };
        let message_id = props.message_id().clone();
        let props =
            props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));
        Self {
            properties: props,
            ..self
        }
    }
}

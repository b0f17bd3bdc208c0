use super::{
    ChannelFault, ChannelId, ChannelSource, ConsumerRegistration, ConsumerTag, Destination,
    Removal, ReplyMessage,
};
use crate::pool::ConnectionPool;
use amq_protocol_types::FieldTable;
use futures_util::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions},
    BasicProperties, Channel, ChannelState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// AMQP `reply-success`.
const REPLY_SUCCESS: u16 = 200;

/// [`ChannelSource`] backed by `lapin` channels opened on pooled connections.
///
/// Channel ids are assigned by `LapinChannelSource` itself: lapin's channel numbers are only
/// unique within a single connection.
pub struct LapinChannelSource {
    connections: ConnectionPool,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    last_id: AtomicU64,
}

impl LapinChannelSource {
    pub fn new(connections: ConnectionPool) -> Self {
        Self {
            connections,
            channels: Mutex::new(HashMap::new()),
            last_id: AtomicU64::new(0),
        }
    }

    /// The underlying lapin channel, e.g. to declare the queue requests are sent to.
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels().get(&id).cloned()
    }

    fn connected(&self, id: ChannelId) -> Result<Channel, ChannelFault> {
        match self.channel(id) {
            Some(channel) if is_connected(&channel) => Ok(channel),
            Some(channel) => Err(anyhow::anyhow!(
                "{id} is not in a healthy state {:?}",
                channel.status().state()
            )
            .into()),
            None => Err(anyhow::anyhow!("{id} is not open").into()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_connected(channel: &Channel) -> bool {
    matches!(channel.status().state(), ChannelState::Connected)
}

#[async_trait::async_trait]
impl ChannelSource for LapinChannelSource {
    #[tracing::instrument(skip(self), name = "rabbitmq_open_channel")]
    async fn open_channel(&self) -> Result<ChannelId, ChannelFault> {
        let connection = self
            .connections
            .get()
            .await
            .map_err(crate::pool::Error::from)?;
        let channel = connection.create_channel().await?;
        let id = ChannelId::new(self.last_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.channels().insert(id, channel);
        Ok(id)
    }

    #[tracing::instrument(skip(self), name = "rabbitmq_close_channel", level = tracing::Level::DEBUG)]
    async fn close_channel(&self, id: ChannelId) -> Result<Removal, ChannelFault> {
        let Some(channel) = self.channels().remove(&id) else {
            return Ok(Removal::AlreadyAbsent);
        };
        if !is_connected(&channel) {
            return Ok(Removal::AlreadyAbsent);
        }
        match channel.close(REPLY_SUCCESS, "OK").await {
            Ok(()) => Ok(Removal::Removed),
            Err(lapin::Error::InvalidChannelState(_)) => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self), name = "rabbitmq_register_consumer", level = tracing::Level::DEBUG)]
    async fn register_consumer(
        &self,
        id: ChannelId,
        queue: &str,
    ) -> Result<ConsumerRegistration, ChannelFault> {
        let channel = self.connected(id)?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("direct-reply-{}", Uuid::new_v4()),
                // The broker only accepts direct reply-to consumers in no-ack mode.
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let tag = ConsumerTag::from(consumer.tag().as_str());
        let deliveries = consumer
            .map(|delivery| {
                delivery
                    .map(ReplyMessage::from)
                    .map_err(ChannelFault::from)
            })
            .boxed();
        Ok(ConsumerRegistration { tag, deliveries })
    }

    #[tracing::instrument(skip(self), name = "rabbitmq_cancel_consumer", level = tracing::Level::DEBUG)]
    async fn cancel_consumer(
        &self,
        id: ChannelId,
        tag: &ConsumerTag,
    ) -> Result<Removal, ChannelFault> {
        let Some(channel) = self.channel(id).filter(is_connected) else {
            return Ok(Removal::AlreadyAbsent);
        };
        match channel
            .basic_cancel(tag.as_str(), BasicCancelOptions::default())
            .await
        {
            Ok(()) => Ok(Removal::Removed),
            Err(lapin::Error::InvalidChannelState(_)) => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self, properties, body), name = "rabbitmq_publish", level = tracing::Level::DEBUG)]
    async fn publish(
        &self,
        id: ChannelId,
        destination: &Destination,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), ChannelFault> {
        let channel = self.connected(id)?;
        // Reply channels do not use publisher confirms: awaiting the confirmation resolves
        // immediately with `NotRequested`.
        channel
            .basic_publish(
                &destination.exchange,
                &destination.routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}

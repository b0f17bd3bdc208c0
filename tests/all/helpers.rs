use carrot_cake_direct_reply::amqp::configuration::RabbitMqSettings;
use carrot_cake_direct_reply::amqp::BasicProperties;
use carrot_cake_direct_reply::direct_reply::{
    ChannelFault, ChannelId, ChannelSource, ClosureListener, ConsumerRegistration, ConsumerTag,
    Destination, DirectReplyContainer, DirectReplySettings, Removal, ReplyMessage,
    DIRECT_REPLY_TO_QUEUE,
};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn get_rabbitmq_settings() -> RabbitMqSettings {
    RabbitMqSettings {
        connection_name: Some("carrot-cake-direct-reply-tests".into()),
        ..RabbitMqSettings::default()
    }
}

/// A request captured by [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct Published {
    pub channel: ChannelId,
    pub destination: Destination,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

type Responder = Box<dyn Fn(&Published) -> Option<Vec<u8>> + Send + Sync>;

/// An in-process stand-in for RabbitMq's direct reply-to.
///
/// Like the real broker, it accepts a single reply consumer per channel.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    responder: Mutex<Option<Responder>>,
    latency: Mutex<Latency>,
}

#[derive(Default, Clone, Copy)]
struct Latency {
    register: Duration,
    close: Duration,
}

#[derive(Default)]
struct BrokerState {
    last_channel: u64,
    last_tag: u64,
    open: HashSet<ChannelId>,
    consumers: HashMap<ChannelId, Consumer>,
    cancelled: Vec<ConsumerTag>,
    closed: Vec<ChannelId>,
    published: Vec<Published>,
    fail_next_open: bool,
}

struct Consumer {
    tag: ConsumerTag,
    sender: mpsc::UnboundedSender<Result<ReplyMessage, ChannelFault>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply automatically to every request published with `reply_to` set to the pseudo-queue.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Published) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Deliver a reply to the consumer armed on `channel`.
    pub fn reply(&self, channel: ChannelId, body: &[u8]) -> bool {
        let properties = self
            .published_on(channel)
            .last()
            .and_then(|p| p.properties.correlation_id().clone())
            .map(|id| BasicProperties::default().with_correlation_id(id))
            .unwrap_or_default();
        self.deliver(channel, Ok(reply_message(properties, body)))
    }

    /// Deliver a reply that carries no correlation id.
    pub fn reply_uncorrelated(&self, channel: ChannelId, body: &[u8]) -> bool {
        self.deliver(channel, Ok(reply_message(BasicProperties::default(), body)))
    }

    /// Make the consumer armed on `channel` observe a broker-side fault.
    pub fn fault(&self, channel: ChannelId) -> bool {
        self.deliver(
            channel,
            Err(anyhow::anyhow!("CHANNEL_ERROR - simulated fault").into()),
        )
    }

    /// Make `register_consumer` take `delay` before it reaches the broker.
    pub fn delay_registrations(&self, delay: Duration) {
        self.latency.lock().unwrap().register = delay;
    }

    /// Make `close_channel` take `delay` before it reaches the broker.
    pub fn delay_closes(&self, delay: Duration) {
        self.latency.lock().unwrap().close = delay;
    }

    async fn lag(&self, pick: impl FnOnce(Latency) -> Duration) {
        let delay = pick(*self.latency.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn fail_next_open(&self) {
        self.state.lock().unwrap().fail_next_open = true;
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    pub fn active_consumers(&self) -> usize {
        self.state.lock().unwrap().consumers.len()
    }

    pub fn consumer_on(&self, channel: ChannelId) -> Option<ConsumerTag> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .get(&channel)
            .map(|c| c.tag.clone())
    }

    pub fn was_cancelled(&self, tag: &ConsumerTag) -> bool {
        self.state.lock().unwrap().cancelled.contains(tag)
    }

    pub fn was_closed(&self, channel: ChannelId) -> bool {
        self.state.lock().unwrap().closed.contains(&channel)
    }

    pub fn published_on(&self, channel: ChannelId) -> Vec<Published> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|p| p.channel == channel)
            .cloned()
            .collect()
    }

    fn deliver(&self, channel: ChannelId, item: Result<ReplyMessage, ChannelFault>) -> bool {
        let state = self.state.lock().unwrap();
        match state.consumers.get(&channel) {
            Some(consumer) => consumer.sender.send(item).is_ok(),
            None => false,
        }
    }
}

fn reply_message(properties: BasicProperties, body: &[u8]) -> ReplyMessage {
    ReplyMessage {
        delivery_tag: 1,
        exchange: "".into(),
        routing_key: DIRECT_REPLY_TO_QUEUE.into(),
        redelivered: false,
        properties,
        data: body.to_vec(),
    }
}

#[async_trait::async_trait]
impl ChannelSource for InMemoryBroker {
    async fn open_channel(&self) -> Result<ChannelId, ChannelFault> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_open) {
            return Err(anyhow::anyhow!("connection refused").into());
        }
        state.last_channel += 1;
        let channel = ChannelId::new(state.last_channel);
        state.open.insert(channel);
        Ok(channel)
    }

    async fn close_channel(&self, channel: ChannelId) -> Result<Removal, ChannelFault> {
        self.lag(|latency| latency.close).await;
        let mut state = self.state.lock().unwrap();
        if !state.open.remove(&channel) {
            return Ok(Removal::AlreadyAbsent);
        }
        if let Some(consumer) = state.consumers.remove(&channel) {
            state.cancelled.push(consumer.tag);
        }
        state.closed.push(channel);
        Ok(Removal::Removed)
    }

    async fn register_consumer(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<ConsumerRegistration, ChannelFault> {
        self.lag(|latency| latency.register).await;
        let mut state = self.state.lock().unwrap();
        if queue != DIRECT_REPLY_TO_QUEUE {
            return Err(anyhow::anyhow!("unexpected queue {queue}").into());
        }
        if !state.open.contains(&channel) {
            return Err(anyhow::anyhow!("{channel} is closed").into());
        }
        if state.consumers.contains_key(&channel) {
            return Err(anyhow::anyhow!(
                "PRECONDITION_FAILED - reply consumer already set on {channel}"
            )
            .into());
        }
        state.last_tag += 1;
        let tag = ConsumerTag::from(format!("amq.ctag-{}", state.last_tag));
        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.insert(
            channel,
            Consumer {
                tag: tag.clone(),
                sender,
            },
        );
        let deliveries = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();
        Ok(ConsumerRegistration { tag, deliveries })
    }

    async fn cancel_consumer(
        &self,
        channel: ChannelId,
        tag: &ConsumerTag,
    ) -> Result<Removal, ChannelFault> {
        let mut state = self.state.lock().unwrap();
        let armed = state
            .consumers
            .get(&channel)
            .is_some_and(|consumer| &consumer.tag == tag);
        if !armed {
            return Ok(Removal::AlreadyAbsent);
        }
        state.consumers.remove(&channel);
        state.cancelled.push(tag.clone());
        Ok(Removal::Removed)
    }

    async fn publish(
        &self,
        channel: ChannelId,
        destination: &Destination,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), ChannelFault> {
        let published = Published {
            channel,
            destination: destination.clone(),
            properties,
            body: body.to_vec(),
        };
        {
            let mut state = self.state.lock().unwrap();
            if !state.open.contains(&channel) {
                return Err(anyhow::anyhow!("{channel} is closed").into());
            }
            state.published.push(published.clone());
        }

        let replies_to_us = published
            .properties
            .reply_to()
            .as_ref()
            .is_some_and(|r| r.as_str() == DIRECT_REPLY_TO_QUEUE);
        let response = match self.responder.lock().unwrap().as_ref() {
            Some(responder) if replies_to_us => responder(&published),
            _ => None,
        };
        if let Some(body) = response {
            self.reply(channel, &body);
        }
        Ok(())
    }
}

pub fn settings(max_concurrent_channels: usize) -> DirectReplySettings {
    DirectReplySettings {
        max_concurrent_channels,
        borrow_timeout_millis: Some(1_000),
        shutdown_grace_period_seconds: 1,
        ..Default::default()
    }
}

/// A container on `broker` whose listener accepts every reply.
pub fn container(broker: &Arc<InMemoryBroker>, settings: DirectReplySettings) -> DirectReplyContainer {
    let container = DirectReplyContainer::new(broker.clone(), settings);
    container
        .set_listener(ClosureListener(|_: ReplyMessage, _: ChannelId| async {
            Ok::<_, anyhow::Error>(())
        }))
        .unwrap();
    container
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn eventually<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let outcome = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "condition not met within {timeout:?}");
}

/// Await `future`, panicking if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}

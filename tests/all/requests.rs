use crate::helpers::{eventually, settings, InMemoryBroker};
use carrot_cake_direct_reply::direct_reply::{ChannelId, DirectReplyContainer, DIRECT_REPLY_TO_QUEUE};
use carrot_cake_direct_reply::requests::{ReplyClient, RequestEnvelope, RequestError};
use fake::{Fake, Faker};
use std::sync::Arc;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(2);

async fn client(broker: &Arc<InMemoryBroker>) -> ReplyClient {
    let container = Arc::new(DirectReplyContainer::new(broker.clone(), settings(2)));
    let client = ReplyClient::new(container).unwrap();
    client.container().start().await.unwrap();
    client
}

#[tokio::test]
async fn the_reply_is_returned_to_the_requester() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.respond_with(|request| {
        let mut reply = b"re: ".to_vec();
        reply.extend_from_slice(&request.body);
        Some(reply)
    });
    let client = client(&broker).await;
    let payload: String = Faker.fake();

    // Act
    let reply = client
        .send_and_receive(
            RequestEnvelope::to_queue("rpc.requests").with_payload(payload.clone().into_bytes()),
            PATIENCE,
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(reply.data, format!("re: {payload}").into_bytes());

    let registry = client.container().registry();
    eventually(PATIENCE, || registry.in_use_count() == 0).await;
    assert_eq!(registry.free_count(), 1);
    client.container().stop(PATIENCE).await;
}

#[tokio::test]
async fn requests_advertise_the_pseudo_queue_and_a_correlation_id() {
    let broker = InMemoryBroker::new();
    broker.respond_with(|_| Some(b"pong".to_vec()));
    let client = client(&broker).await;

    let reply = client
        .send_and_receive(RequestEnvelope::to_queue("rpc.requests"), PATIENCE)
        .await
        .unwrap();

    let registry = client.container().registry();
    eventually(PATIENCE, || registry.free_count() == 1).await;
    let published = broker.published_on(ChannelId::new(1));
    assert_eq!(published.len(), 1);
    let request = &published[0];
    assert_eq!(request.destination.exchange, "");
    assert_eq!(request.destination.routing_key, "rpc.requests");
    assert_eq!(
        request.properties.reply_to().as_ref().map(|r| r.as_str()),
        Some(DIRECT_REPLY_TO_QUEUE)
    );
    assert!(request.properties.message_id().is_some());
    assert!(request.properties.correlation_id().is_some());
    assert_eq!(
        request.properties.correlation_id(),
        reply.properties.correlation_id()
    );
    client.container().stop(PATIENCE).await;
}

#[tokio::test]
async fn a_caller_provided_correlation_id_is_kept() {
    let broker = InMemoryBroker::new();
    broker.respond_with(|_| Some(b"pong".to_vec()));
    let client = client(&broker).await;
    let correlation_id: String = Faker.fake();

    let reply = client
        .send_and_receive(
            RequestEnvelope::to_queue("rpc.requests")
                .with_correlation_id(correlation_id.clone().into()),
            PATIENCE,
        )
        .await
        .unwrap();

    assert_eq!(
        reply.properties.correlation_id().as_ref().map(|c| c.as_str()),
        Some(correlation_id.as_str())
    );
    client.container().stop(PATIENCE).await;
}

#[tokio::test]
async fn consecutive_requests_reuse_the_same_channel() {
    let broker = InMemoryBroker::new();
    broker.respond_with(|_| Some(b"pong".to_vec()));
    let client = client(&broker).await;
    let registry = client.container().registry().clone();

    for _ in 0..3 {
        client
            .send_and_receive(RequestEnvelope::to_queue("rpc.requests"), PATIENCE)
            .await
            .unwrap();
        eventually(PATIENCE, || registry.in_use_count() == 0).await;
    }

    assert_eq!(broker.open_channels(), 1);
    assert_eq!(registry.free_count(), 1);
    client.container().stop(PATIENCE).await;
}

#[tokio::test]
async fn a_timed_out_request_closes_its_channel() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let registry = client.container().registry().clone();

    // Act
    let outcome = client
        .send_and_receive(
            RequestEnvelope::to_queue("rpc.requests"),
            Duration::from_millis(50),
        )
        .await;

    // Assert
    assert!(matches!(outcome, Err(RequestError::ReplyTimeout(_))));
    assert_eq!(registry.in_use_count(), 0);
    assert_eq!(registry.free_count(), 0);
    let channel = ChannelId::new(1);
    eventually(PATIENCE, || broker.was_closed(channel)).await;

    // A late reply has nowhere to go.
    assert!(!broker.reply(channel, b"too late"));

    // The next request gets a fresh channel.
    broker.respond_with(|_| Some(b"pong".to_vec()));
    let reply = client
        .send_and_receive(RequestEnvelope::to_queue("rpc.requests"), PATIENCE)
        .await
        .unwrap();
    assert_eq!(reply.data, b"pong");
    client.container().stop(PATIENCE).await;
}

#[tokio::test]
async fn an_abandoned_request_gives_its_channel_back() {
    // Arrange
    let broker = InMemoryBroker::new();
    let container = Arc::new(DirectReplyContainer::new(broker.clone(), settings(1)));
    let client = ReplyClient::new(container).unwrap();
    client.container().start().await.unwrap();
    let registry = client.container().registry().clone();

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        client.send_and_receive(RequestEnvelope::to_queue("rpc.requests"), PATIENCE),
    )
    .await;

    // Assert
    assert!(outcome.is_err());
    assert_eq!(registry.in_use_count(), 0);
    let channel = ChannelId::new(1);
    eventually(PATIENCE, || broker.was_closed(channel)).await;
    assert!(!broker.reply(channel, b"too late"));

    // The only permit is available again.
    broker.respond_with(|_| Some(b"pong".to_vec()));
    let reply = client
        .send_and_receive(RequestEnvelope::to_queue("rpc.requests"), PATIENCE)
        .await
        .unwrap();
    assert_eq!(reply.data, b"pong");
    client.container().stop(PATIENCE).await;
}

#[tokio::test]
async fn a_reply_for_another_request_is_discarded() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let registry = client.container().registry().clone();
    let channel = ChannelId::new(1);

    let request = tokio::spawn(async move {
        client
            .send_and_receive(RequestEnvelope::to_queue("rpc.requests"), PATIENCE)
            .await
    });
    eventually(PATIENCE, || !broker.published_on(channel).is_empty()).await;

    // A reply that does not carry the request's correlation id.
    assert!(broker.reply_uncorrelated(channel, b"stranger"));

    let outcome = request.await.unwrap();
    assert!(matches!(outcome, Err(RequestError::ReplyDiscarded)));
    eventually(PATIENCE, || broker.was_closed(channel)).await;
    assert_eq!(registry.in_use_count(), 0);
}

#[tokio::test]
async fn requests_fail_fast_when_the_container_is_stopped() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    client.container().stop(PATIENCE).await;

    let outcome = client
        .send_and_receive(RequestEnvelope::to_queue("rpc.requests"), PATIENCE)
        .await;

    assert!(matches!(outcome, Err(RequestError::Borrow(_))));
    assert!(broker.published_on(ChannelId::new(1)).is_empty());
}

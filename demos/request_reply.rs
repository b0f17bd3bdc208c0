use carrot_cake_direct_reply::amqp::configuration::RabbitMqSettings;
use carrot_cake_direct_reply::direct_reply::{
    DirectReplyContainer, DirectReplySettings, LapinChannelSource,
};
use carrot_cake_direct_reply::pool::connection_pool;
use carrot_cake_direct_reply::requests::{ReplyClient, RequestEnvelope, RequestError};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // First of all we build the configuration for our connection pool.
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image,
    // naming our connections so that they are easy to spot in the management UI.
    let settings = RabbitMqSettings {
        connection_name: Some("request-reply-demo".into()),
        ..RabbitMqSettings::default()
    };

    // Reply channels are multiplexed over a handful of connections.
    // A connection maps to an open TCP socket, while a channel is a "logical" connection
    // sharing it: we can afford one channel per in-flight request, not one connection.
    let connections = connection_pool(&settings, 2)?;

    // The container pools the channels consuming from the direct reply-to pseudo-queue.
    // `max_concurrent_channels` is, de facto, the maximum number of requests awaiting a
    // reply at the same time.
    let container = Arc::new(DirectReplyContainer::new(
        Arc::new(LapinChannelSource::new(connections)),
        DirectReplySettings {
            max_concurrent_channels: 8,
            prewarm_channels: 0,
            ..DirectReplySettings::default()
        },
    ));

    // The client installs its own listener on the container, routing each reply back to
    // the request waiting on the channel it was delivered to.
    let client = ReplyClient::new(container)?;
    client.container().start().await?;

    let request = RequestEnvelope::to_queue("hello-rpc")
        .with_payload("Hello world!".as_bytes().into())
        .with_content_type("text/plain".into());

    // There is no responder listening on `hello-rpc`: the broker drops the request and we
    // give up waiting after a second. The channel the request was sent on is closed, so a
    // late reply can never be mistaken for the reply to another request.
    let outcome = client
        .send_and_receive(request, Duration::from_secs(1))
        .await;
    assert!(matches!(outcome, Err(RequestError::ReplyTimeout(_))));

    // Close every channel, waiting for replies that are still being processed.
    client.container().shutdown().await;

    Ok(())
}

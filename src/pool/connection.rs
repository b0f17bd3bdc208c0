//! Implements [`Manager`] for [`Connection`].

use crate::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
use deadpool::managed::{self, Manager};
use lapin::{Connection, ConnectionState};

/// `ConnectionPool` hands out the connections reply channels are opened on.
pub type ConnectionPool = deadpool::managed::Pool<ConnectionFactory>;

/// Build a [`ConnectionPool`] for the broker described by `settings`.
///
/// No connection is established until the first channel is opened.
pub fn connection_pool(
    settings: &RabbitMqSettings,
    max_connections: usize,
) -> Result<ConnectionPool, super::Error> {
    let factory = ConnectionFactory::new_from_config(settings)?;
    ConnectionPool::builder(factory)
        .max_size(max_connections)
        .build()
        .map_err(|e| super::Error::from(anyhow::anyhow!("Failed to build connection pool: {e}")))
}

#[async_trait::async_trait]
impl Manager for ConnectionFactory {
    type Type = Connection;
    type Error = super::Error;

    async fn create(&self) -> Result<Connection, super::Error> {
        Ok(self.new_connection().await?)
    }

    async fn recycle(&self, obj: &mut Connection) -> managed::RecycleResult<super::Error> {
        match obj.status().state() {
            ConnectionState::Connected => Ok(()),
            state => {
                tracing::debug!(?state, "Discarding broken RabbitMQ connection");
                Err(managed::RecycleError::Message(format!(
                    "Connection is not in a healthy state {state:?}",
                )))
            }
        }
    }
}

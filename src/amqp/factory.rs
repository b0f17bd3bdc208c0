use crate::amqp::configuration::{RabbitMqSettings, RabbitMqTlsSettings};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;

/// Opens the connections reply channels are multiplexed over.
///
/// `ConnectionFactory` is the [`Manager`](deadpool::managed::Manager) behind
/// [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// Client-provided name, shown next to the connection in the management UI.
    connection_name: Option<String>,
    connect_timeout: Duration,
    /// Plain text connections if `None`.
    tls: Option<Arc<TlsConnector>>,
}

struct TlsConnector {
    connector: NativeTlsConnector,
    /// Expected CN on the server certificate.
    domain: String,
}

impl TlsConnector {
    fn from_settings(settings: &RabbitMqTlsSettings, host: &str) -> Result<Self, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = settings.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        let connector = builder
            .build()
            .context("TLS configuration for RabbitMQ failed")?;
        Ok(Self {
            connector,
            domain: settings.domain.clone().unwrap_or_else(|| host.to_owned()),
        })
    }
}

impl ConnectionFactory {
    /// Fails if the TLS settings cannot be turned into a connector, e.g. a malformed CA chain.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let uri = settings.amqp_uri();
        let tls = settings
            .tls
            .as_ref()
            .map(|tls| TlsConnector::from_settings(tls, &uri.authority.host))
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            uri,
            connection_name: settings.connection_name.clone(),
            connect_timeout: settings.connection_timeout(),
            tls,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect to the broker, over TLS if it was configured.
    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip(self),
        fields(host = %self.uri.authority.host, port = self.uri.authority.port, tls = self.is_tls())
    )]
    pub async fn new_connection(&self) -> Result<Connection, anyhow::Error> {
        let mut properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connect = async {
            match &self.tls {
                None => Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        };
        let connection = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .with_context(|| {
                format!("Timed out after {:?} while connecting to RabbitMQ", self.connect_timeout)
            })??;

        connection.on_error(|e| {
            tracing::warn!(error = ?e, "RabbitMQ connection broke, its reply channels are lost");
        });
        tracing::debug!("Connected to RabbitMQ");
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<TlsConnector>,
    ) -> Result<Connection, lapin::Error> {
        Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // The TLS handshake runs on top of a plain AMQP socket.
                let mut plain = uri.clone();
                plain.scheme = AMQPScheme::AMQP;
                plain
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
            }),
            properties,
        )
        .await
    }
}

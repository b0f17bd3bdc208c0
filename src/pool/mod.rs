//! Pooling for [`lapin::Connection`]s using [`deadpool`].
//!
//! Reply channels are cheap, connections are not: [`LapinChannelSource`] multiplexes every
//! channel it opens over the connections held in a [`ConnectionPool`], and broken
//! connections are disposed of and recreated on demand.
//!
//! ```rust
//! use carrot_cake_direct_reply::amqp::configuration::RabbitMqSettings;
//! use carrot_cake_direct_reply::amqp::ConnectionFactory;
//! use carrot_cake_direct_reply::pool::ConnectionPool;
//!
//! fn example() -> anyhow::Result<ConnectionPool> {
//!     let settings = RabbitMqSettings::default();
//!     let pool = ConnectionPool::builder(ConnectionFactory::new_from_config(&settings)?)
//!         .max_size(2)
//!         .build()?;
//!     Ok(pool)
//! }
//! ```
//!
//! [`LapinChannelSource`]: crate::direct_reply::LapinChannelSource

mod connection;
mod error;

pub use connection::{connection_pool, ConnectionPool};
pub use error::Error;

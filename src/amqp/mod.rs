//! Helpers for connecting to a RabbitMq broker.

pub mod configuration;
mod factory;
pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};

pub mod error;
pub mod lease;
pub mod manager;
pub mod transport;

#[cfg(feature = "memory-broker")]
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::*;
pub use lease::*;
pub use manager::*;
pub use transport::*;

#[cfg(feature = "memory-broker")]
pub use memory::*;

#[cfg(feature = "amqp")]
pub use amqp::*;

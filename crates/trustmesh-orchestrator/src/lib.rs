pub mod circuit_breaker;
pub mod config;
pub mod inbound;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod store;
pub mod ticket;

#[cfg(feature = "memory-store")]
pub mod memory;

pub use circuit_breaker::*;
pub use config::*;
pub use inbound::*;
pub use orchestrator::*;
pub use pool::*;
pub use queue::*;
pub use registry::*;
pub use store::*;
pub use ticket::*;

#[cfg(feature = "memory-store")]
pub use memory::*;

pub mod config;
pub mod runtime;
pub mod telemetry;

pub use config::NodeConfig;
pub use runtime::Node;

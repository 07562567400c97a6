pub mod eigentrust;
pub mod engine;
pub mod matrix;
pub mod store;

#[cfg(feature = "memory-store")]
pub mod memory;

pub use eigentrust::*;
pub use engine::*;
pub use matrix::*;
pub use store::*;

#[cfg(feature = "memory-store")]
pub use memory::*;

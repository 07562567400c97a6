pub mod engine;
pub mod error;
pub mod session;
pub mod tally;
pub mod weights;

pub use engine::*;
pub use error::*;
pub use session::*;
pub use tally::*;
pub use weights::*;

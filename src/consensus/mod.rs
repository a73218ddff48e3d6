pub mod engine;
pub mod message;
pub mod round;

pub use engine::*;
pub use message::*;
pub use round::*;

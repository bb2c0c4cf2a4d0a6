//! Message and topic definitions shared by the publish and command paths

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;

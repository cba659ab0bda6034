pub mod actor;
pub mod message;

pub use actor::{ActorRef, ActorRole};
pub use message::{OutgoingMessage, PayloadError};

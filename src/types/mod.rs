//! Public types for the Huginn API.

mod message;
mod request;
mod response;

pub use message::{Message, Role, last_user_message};
pub use request::{ModelTarget, PriorityClass, ProcessingRequest};
pub use response::{
    OutputKind, OutputUnit, SourceTag, TurnResponse, Validation, estimate_tokens,
};

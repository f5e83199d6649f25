pub mod config;
pub mod error;
pub mod message;

pub use error::{Error, Result};
pub use message::{Message, Role, SessionMode};

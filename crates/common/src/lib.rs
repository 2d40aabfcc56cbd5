//! Common types for the Gemini key-pool gateway

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

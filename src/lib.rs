pub mod auth;
mod error;
pub mod gateway;

pub use error::{RelayError, Result};

//! Logging and error handling utilities.

pub mod error;
pub mod logging;

pub use error::{Error, Result};

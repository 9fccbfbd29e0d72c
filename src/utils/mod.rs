//! The `utils` module collects the pieces shared by every other module:
//! the crate-wide error type and the tracing subscriber set-up.

pub mod error;
pub mod logging;

pub use error::{Result, StreamError};

//! The `utils` module collects pieces shared by every layer: the crate error
//! type and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{MessagingError, Result};

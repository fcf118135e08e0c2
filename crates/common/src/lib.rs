//! Cross-cutting types shared by the account-pool crates.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for the endpoint API token.

pub use secrecy::{ExposeSecret, SecretString};

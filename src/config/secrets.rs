//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers need not depend on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};

//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for etcd credentials.

pub use secrecy::{ExposeSecret, SecretString};

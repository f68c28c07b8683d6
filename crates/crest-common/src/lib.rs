//! # crest-common
//!
//! Shared foundation for the Crest server: configuration, the central error
//! type, domain models, the permission vocabulary, and validation helpers
//! used by every other crate in the workspace.

pub mod config;
pub mod error;
pub mod keys;
pub mod models;
pub mod permissions;
pub mod validation;

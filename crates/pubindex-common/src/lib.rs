//! pubindex Common Library
//!
//! Shared types, utilities, and error handling for the pubindex workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`PubindexError`] and the [`Result`] alias
//! - **Checksums**: SHA-256 helpers used for content digests and stable file names
//! - **Logging**: [`logging::LogConfig`] and subscriber initialization
//! - **Types**: identifiers shared between the worker and its collaborators
//!
//! # Example
//!
//! ```no_run
//! use pubindex_common::checksum::hashed_file_name;
//! use pubindex_common::types::ResourceId;
//!
//! let resource = ResourceId::new("3f9c2d1e").unwrap();
//! let name = hashed_file_name(resource.as_str(), "json");
//! assert!(name.ends_with(".json"));
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{PubindexError, Result};

//! Core domain types for recall.
//!
//! This crate defines the data model shared by the metadata store:
//! - Session identifiers and their validation
//! - Metadata documents and the deep-merge rules applied to them
//! - Configuration for the metadata backends and session locking

pub mod config;
pub mod error;
pub mod metadata;
pub mod session;

pub use error::{Error, Result};
pub use metadata::{Metadata, MetadataValue, SYSTEM_METADATA_KEY, merge};
pub use session::SessionId;

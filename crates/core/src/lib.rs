//! Core domain types and shared logic for the larder content cache.
//!
//! This crate defines the data model used across all other crates:
//! - File identities derived from remote URLs
//! - Freshness rules for stored copies
//! - Download statuses and their aggregation
//! - Package identities and the package status state machine
//! - Remote file descriptions and component links
//! - Configuration

pub mod config;
pub mod error;
pub mod file_id;
pub mod freshness;
pub mod hash;
pub mod package;
pub mod remote_file;
pub mod status;

pub use error::{Error, Result};
pub use file_id::FileId;
pub use freshness::Version;
pub use hash::ContentHash;
pub use package::{PackageId, PackageState};
pub use remote_file::{FileDescriptor, FileLink, FileMeta, RemoteFile};
pub use status::{DownloadStatus, aggregate};

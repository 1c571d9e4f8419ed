//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

/// Local storage for downloaded files.
///
/// Keys are relative, `/`-separated paths. Writes are atomic: a reader sees
/// either the previous content or the complete new content.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// Whether the storage can currently be written to.
    async fn is_available(&self) -> bool;

    /// Check if a file exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Start a streaming write. Nothing is visible under `key` until `finish`.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete a file. Returns false if it did not exist.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Absolute local path of a key.
    async fn local_path(&self, key: &str) -> StorageResult<PathBuf>;

    /// Get the backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Trait for streaming writes.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Bytes written so far.
    fn bytes_written(&self) -> u64;

    /// Finish the write and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the write, discarding partial data.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

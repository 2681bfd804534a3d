//! Error types for nfsync-engine.

use thiserror::Error;

use nfsync_core::StoreError;
use nfsync_providers::ProviderError;

/// Errors that escape a dispatch or an identifier's processing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A durable store could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The source provider failed outside of the per-page boundary.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

use thiserror::Error;

use crate::remote::RemoteError;

/// Failures of a sync round or of the engine's preconditions.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync engine not initialized: no authenticated session")]
    NotInitialized,

    #[error("sync already in progress")]
    AlreadySyncing,

    #[error("pull failed: {0}")]
    Pull(#[source] RemoteError),

    #[error("push failed: {0}")]
    Push(#[source] RemoteError),

    /// The backend rejected the push because it was based on a stale checkpoint
    #[error("push rejected by backend as conflicting: {0}")]
    PushConflict(String),

    /// A round ran and failed; carries the message recorded in the status store
    #[error("sync failed: {0}")]
    RoundFailed(String),

    #[error("local store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Failures that abort a migration as a whole.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration requires an authenticated session")]
    NoSession,

    /// Could not tell whether this device already holds data
    #[error("failed to inspect local store: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("failed to reset local store: {0:#}")]
    Reset(#[source] anyhow::Error),

    /// Every table fetch failed; nothing was imported
    #[error("could not reach the backend: {0}")]
    Unreachable(String),
}

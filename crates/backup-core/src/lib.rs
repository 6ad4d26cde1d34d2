use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use backup_common::{ClientError, DeletionPolicy, NamespacedRef};
use thiserror::Error;

// Re-export the common crate so consumers (like the binary) need one dependency
pub use backup_common as common;

pub mod config;
pub mod flock;
pub mod job;
pub mod kubectl;
pub mod label_sync;
pub mod lifecycle;
pub mod memory;
pub mod naming;
pub mod readiness;
pub mod rebind;
pub mod retention;
pub mod sweep;
pub mod test_utils;

/// Which step of the two-phase reclaim failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimStage {
    ResolveContent,
    PatchDeletionPolicy,
}

impl fmt::Display for ReclaimStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReclaimStage::ResolveContent => f.write_str("resolving bound content"),
            ReclaimStage::PatchDeletionPolicy => f.write_str("patching deletionPolicy"),
        }
    }
}

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("timeout exceeded while trying to acquire lock {} (waited {timeout:?})", .path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("lock file {} failed: {source}", .path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("listing snapshots in namespace {namespace} failed: {source}")]
    RetentionQuery {
        namespace: String,
        #[source]
        source: ClientError,
    },

    #[error("snapshot {snapshot} did not become ready after {attempts} attempts: {source}")]
    ReadinessTimeout {
        snapshot: NamespacedRef,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error("reclaim of snapshot {snapshot} aborted while {stage}: {source}")]
    ReclaimAborted {
        snapshot: NamespacedRef,
        stage: ReclaimStage,
        #[source]
        source: ClientError,
    },

    #[error("content {content} cannot be rebound: {reason}")]
    RebindPrecondition { content: String, reason: String },

    #[error("refusing to delete content {content}: deletionPolicy is {policy}, not Retain")]
    RebindUnsafeDelete {
        content: String,
        policy: DeletionPolicy,
    },

    #[error("snapshot {snapshot} cannot be restored: {reason}")]
    RestorePrecondition {
        snapshot: NamespacedRef,
        reason: String,
    },

    #[error("snapshot {0} is not bound to any content")]
    Unbound(NamespacedRef),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl BackupError {
    /// Soft failures are expected to clear up on a later run: the job runner
    /// logs them and exits non-zero without alerting.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            BackupError::LockTimeout { .. } | BackupError::ReadinessTimeout { .. }
        )
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, BackupError>;

pub use config::{BackupConfig, LabelConfig, LockConfig};
pub use flock::{FileLock, LockGuard};
pub use job::{BackupJob, DumpScriptProvider, JobOutcome, NoDump};
pub use kubectl::KubectlClient;
pub use label_sync::{LabelSyncer, SyncResult};
pub use lifecycle::{list_managed, SnapshotLifecycleController};
pub use memory::{ClientCall, InMemoryClient, Operation};
pub use readiness::RetryPolicy;
pub use rebind::{ContentRebinder, RebuiltContent};
pub use retention::{RetentionLabeler, RetentionPolicy};
pub use sweep::{ExpirySweeper, SweepReport};

//! One backup run: lock, pre-snapshot hook, labels, create, wait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use backup_common::{
    ClientError, Labels, NamespacedRef, ResourceClient, ResourceKind, VolumeSnapshot,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::BackupConfig;
use crate::flock::{shuffle_lock_file, FileLock, LockGuard};
use crate::lifecycle::SnapshotLifecycleController;
use crate::naming::{env_config_annotation, render_snapshot_name};
use crate::retention::RetentionLabeler;
use crate::Result;

/// Hook that runs after the claim check and before the snapshot is cut,
/// typically an application-consistent database dump.
#[async_trait]
pub trait DumpScriptProvider: Send + Sync {
    async fn before_snapshot(&self, config: &BackupConfig) -> Result<()>;
}

/// Default hook: nothing to dump.
pub struct NoDump;

#[async_trait]
impl DumpScriptProvider for NoDump {
    async fn before_snapshot(&self, _config: &BackupConfig) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub snapshot: NamespacedRef,
    pub labels: Labels,
    /// True only when readiness was waited for and confirmed.
    pub ready: bool,
    pub dry_run: bool,
}

pub struct BackupJob {
    config: BackupConfig,
    lifecycle: SnapshotLifecycleController,
    labeler: RetentionLabeler,
    dump: Arc<dyn DumpScriptProvider>,
    annotations: BTreeMap<String, String>,
}

impl BackupJob {
    pub fn new(config: BackupConfig, client: Arc<dyn ResourceClient>) -> Self {
        let lifecycle = SnapshotLifecycleController::new(client.clone()).dry_run(config.dry_run);
        Self {
            config,
            lifecycle,
            labeler: RetentionLabeler::new(client),
            dump: Arc::new(NoDump),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_dump_provider(mut self, dump: Arc<dyn DumpScriptProvider>) -> Self {
        self.dump = dump;
        self
    }

    /// Record these variables in the snapshot's env-config annotation.
    pub fn with_env(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.annotations = env_config_annotation(vars);
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    #[instrument(skip(self), fields(namespace = %self.config.namespace, pvc = %self.config.pvc_name))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<JobOutcome> {
        self.config.validate()?;

        let mut guard = self.lock().await?;
        let outcome = self.snapshot(now).await;

        // release explicitly so a failing unlock is reported, drop covers the error path
        if let Some(guard) = guard.as_mut() {
            if let Err(e) = guard.release() {
                warn!(error = %e, "Failed to release lock");
            }
        }
        outcome
    }

    async fn lock(&self) -> Result<Option<LockGuard>> {
        let lock = &self.config.lock;
        if !lock.enabled {
            return Ok(None);
        }
        let path = shuffle_lock_file(&lock.dir, lock.count);
        info!(path = %path.display(), timeout = ?lock.timeout, "Acquiring lock");
        let guard = FileLock::new(path)
            .with_timeout(lock.timeout)
            .acquire(self.config.dry_run)
            .await?;
        Ok(Some(guard))
    }

    async fn snapshot(&self, now: DateTime<Utc>) -> Result<JobOutcome> {
        let config = &self.config;
        let client = self.lifecycle.client();

        let claim_exists = client
            .exists(
                ResourceKind::PersistentVolumeClaim,
                Some(&config.namespace),
                &config.pvc_name,
            )
            .await?;
        if !claim_exists {
            return Err(ClientError::not_found(
                ResourceKind::PersistentVolumeClaim,
                Some(&config.namespace),
                &config.pvc_name,
            )
            .into());
        }

        self.dump.before_snapshot(config).await?;

        let labels = self
            .labeler
            .compute_labels(&config.namespace, &config.pvc_name, &config.label, now)
            .await?;
        let name = render_snapshot_name(&config.name_template, &config.pvc_name, &config.vs_rand, now);
        let snapshot = VolumeSnapshot::from_pvc(
            &config.namespace,
            &name,
            &config.pvc_name,
            config.class_name(),
            labels.clone(),
            self.annotations.clone(),
        );

        let created = self.lifecycle.create(&snapshot).await?;
        let reference = created.reference();

        let ready = if config.wait_until_ready && !config.dry_run {
            info!(snapshot = %reference, timeout = ?config.wait_timeout, "Waiting for snapshot to be ready");
            self.lifecycle
                .wait_until_ready(&reference, config.wait_timeout)
                .await?;
            true
        } else {
            false
        };

        Ok(JobOutcome {
            snapshot: reference,
            labels,
            ready,
            dry_run: config.dry_run,
        })
    }
}

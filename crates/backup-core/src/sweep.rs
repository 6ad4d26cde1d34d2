use backup_common::{LabelSelector, Scope, VolumeSnapshot};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::lifecycle::SnapshotLifecycleController;
use crate::retention::{DATE_FORMAT, LABEL_DELETE_AFTER, LABEL_RETAIN, RETAIN_DAYS};
use crate::Result;

/// Outcome counts of a sweep over many snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub changed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Prunes snapshots of the `days` policy once their `delete-after` date has passed.
pub struct ExpirySweeper {
    lifecycle: SnapshotLifecycleController,
    wait: bool,
}

impl ExpirySweeper {
    pub fn new(lifecycle: SnapshotLifecycleController) -> Self {
        Self {
            lifecycle,
            wait: false,
        }
    }

    /// Wait for each deletion to complete before moving on.
    pub fn wait_for_deletion(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Prune every snapshot whose `delete-after` is strictly before `today`.
    #[instrument(skip(self))]
    pub async fn sweep(&self, today: NaiveDate) -> Result<SweepReport> {
        let selector = LabelSelector::new().equals(LABEL_RETAIN, RETAIN_DAYS);
        let mut snapshots = self
            .lifecycle
            .client()
            .list_snapshots(&Scope::AllNamespaces, &selector)
            .await?;
        snapshots.sort_by_key(VolumeSnapshot::reference);

        let mut report = SweepReport::default();
        for vs in &snapshots {
            let snapshot = vs.reference();
            let Some(delete_after) = expiry_date(vs) else {
                warn!(%snapshot, "Missing or invalid {LABEL_DELETE_AFTER} label, skipping");
                report.skipped += 1;
                continue;
            };

            if delete_after >= today {
                report.unchanged += 1;
                continue;
            }

            match self.lifecycle.prune(&snapshot, self.wait).await {
                Ok(()) => {
                    info!(%snapshot, %delete_after, "Pruned expired snapshot");
                    report.changed += 1;
                }
                Err(e) => {
                    warn!(%snapshot, error = %e, "Pruning expired snapshot failed");
                    report.failed += 1;
                }
            }
        }

        info!(?report, "Delete-after sweep done");
        Ok(report)
    }
}

fn expiry_date(vs: &VolumeSnapshot) -> Option<NaiveDate> {
    let raw = vs.metadata.labels.get(LABEL_DELETE_AFTER)?;
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

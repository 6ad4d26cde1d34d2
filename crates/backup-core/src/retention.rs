//! Retention labels for new snapshots.
//!
//! Under the daily/weekly/monthly policy each period label may be held by
//! one snapshot per namespace. The check is list-then-decide, so two jobs
//! racing in the same period can both claim a label.

use std::sync::Arc;

use backup_common::{LabelSelector, Labels, ResourceClient, Scope};
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::LabelConfig;
use crate::{BackupError, Result};

pub const LABEL_PREFIX: &str = "backup-ns.sh/";
pub const LABEL_PVC: &str = "backup-ns.sh/pvc";
pub const LABEL_TYPE: &str = "backup-ns.sh/type";
pub const LABEL_POD: &str = "backup-ns.sh/pod";
pub const LABEL_RETAIN: &str = "backup-ns.sh/retain";
pub const LABEL_DAILY: &str = "backup-ns.sh/daily";
pub const LABEL_WEEKLY: &str = "backup-ns.sh/weekly";
pub const LABEL_MONTHLY: &str = "backup-ns.sh/monthly";
pub const LABEL_RETAIN_DAYS: &str = "backup-ns.sh/retain-days";
pub const LABEL_DELETE_AFTER: &str = "backup-ns.sh/delete-after";
pub const ANNOTATION_ENV_CONFIG: &str = "backup-ns.sh/env-config";

pub const RETAIN_DAILY_WEEKLY_MONTHLY: &str = "daily_weekly_monthly";
pub const RETAIN_DAYS: &str = "days";

/// Format of `delete-after` and the daily label.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "retain", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep while the snapshot holds a daily, weekly or monthly label.
    DailyWeeklyMonthly,
    /// Keep until `delete-after`, `count` days after creation.
    Days { count: u32 },
}

impl RetentionPolicy {
    pub fn label_value(&self) -> &'static str {
        match self {
            RetentionPolicy::DailyWeeklyMonthly => RETAIN_DAILY_WEEKLY_MONTHLY,
            RetentionPolicy::Days { .. } => RETAIN_DAYS,
        }
    }
}

/// Values of the three period labels for one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodKeys {
    pub daily: String,
    pub weekly: String,
    pub monthly: String,
}

impl PeriodKeys {
    /// The week is the ISO week, so it restarts at `w01` on the Monday of
    /// the first ISO week even if that falls in December.
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            daily: date.format(DATE_FORMAT).to_string(),
            weekly: format!("w{:02}", date.iso_week().week()),
            monthly: date.format("%Y-%m").to_string(),
        }
    }

    fn labeled(&self) -> [(&'static str, &str); 3] {
        [
            (LABEL_MONTHLY, self.monthly.as_str()),
            (LABEL_WEEKLY, self.weekly.as_str()),
            (LABEL_DAILY, self.daily.as_str()),
        ]
    }
}

/// `date + days`, saturating at the largest representable date.
pub fn delete_after(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX)
}

pub fn is_managed_label(key: &str) -> bool {
    key.starts_with(LABEL_PREFIX)
}

/// The subset of `labels` this tool owns.
pub fn managed_labels(labels: &Labels) -> Labels {
    labels
        .iter()
        .filter(|(key, _)| is_managed_label(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub struct RetentionLabeler {
    client: Arc<dyn ResourceClient>,
    strict: bool,
}

impl RetentionLabeler {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            strict: false,
        }
    }

    /// In strict mode a failed period lookup is returned as
    /// [`BackupError::RetentionQuery`] instead of skipping the label.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Labels for a new snapshot of `pvc_name` taken at `now`. Period
    /// boundaries are evaluated in UTC.
    #[instrument(skip(self, config), fields(policy = config.retain.label_value()))]
    pub async fn compute_labels(
        &self,
        namespace: &str,
        pvc_name: &str,
        config: &LabelConfig,
        now: DateTime<Utc>,
    ) -> Result<Labels> {
        let today = now.date_naive();
        let mut labels = Labels::new();
        labels.insert(LABEL_PVC.to_string(), pvc_name.to_string());
        labels.insert(LABEL_TYPE.to_string(), config.kind.clone());
        if !config.pod.is_empty() {
            labels.insert(LABEL_POD.to_string(), config.pod.clone());
        }
        labels.insert(
            LABEL_RETAIN.to_string(),
            config.retain.label_value().to_string(),
        );

        match config.retain {
            RetentionPolicy::DailyWeeklyMonthly => {
                let keys = PeriodKeys::for_date(today);
                for (key, value) in keys.labeled() {
                    if self.period_claimed(namespace, key, value).await? {
                        debug!(key, value, "Period already claimed");
                        continue;
                    }
                    labels.insert(key.to_string(), value.to_string());
                }
            }
            RetentionPolicy::Days { count } => {
                labels.insert(LABEL_RETAIN_DAYS.to_string(), count.to_string());
                labels.insert(
                    LABEL_DELETE_AFTER.to_string(),
                    delete_after(today, count).format(DATE_FORMAT).to_string(),
                );
            }
        }

        Ok(labels)
    }

    /// Whether a snapshot in `namespace` already carries `key=value`.
    /// Lookup failures count as claimed unless running strict.
    async fn period_claimed(&self, namespace: &str, key: &str, value: &str) -> Result<bool> {
        let selector = LabelSelector::new().equals(key, value);
        match self
            .client
            .list_snapshots(&Scope::Namespace(namespace.to_string()), &selector)
            .await
        {
            Ok(existing) => Ok(!existing.is_empty()),
            Err(source) if self.strict => Err(BackupError::RetentionQuery {
                namespace: namespace.to_string(),
                source,
            }),
            Err(e) => {
                warn!(
                    namespace,
                    selector = %selector,
                    error = %e,
                    "Could not check for existing snapshots, assuming the label is taken"
                );
                Ok(true)
            }
        }
    }
}

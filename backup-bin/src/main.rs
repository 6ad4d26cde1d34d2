use std::sync::Arc;

use backup_core::naming::collect_bak_env;
use backup_core::{BackupConfig, BackupJob, KubectlClient};
use chrono::Utc;
use color_eyre::eyre;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = KubectlClient::new();
    let mut config = BackupConfig::from_env();

    // Without an explicit namespace, follow the active kubeconfig context
    if std::env::var_os("BAK_NAMESPACE").is_none() {
        if let Some(namespace) = client.current_namespace().await {
            config.namespace = namespace;
        }
    }

    info!("Using config:\n{}", serde_json::to_string_pretty(&config)?);
    if config.dry_run {
        warn!("Dry run mode is active, write operations are skipped");
    }

    let job = BackupJob::new(config, Arc::new(client)).with_env(&collect_bak_env(std::env::vars()));

    match job.run(Utc::now()).await {
        Ok(outcome) => {
            info!(
                snapshot = %outcome.snapshot,
                ready = outcome.ready,
                dry_run = outcome.dry_run,
                "Backup finished"
            );
            Ok(())
        }
        Err(e) if e.is_soft() => {
            warn!(error = %e, "Backup did not complete");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Backup failed");
            Err(e.into())
        }
    }
}

pub(crate) mod detector;
pub(crate) mod keys;
pub(crate) mod logic;
pub(crate) mod pool;
pub(crate) mod stats;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AppConfig, StateBackend};
use crate::session::Session;
use crate::source::drive::DriveClient;
use crate::source::{Scope, SourceClient};
use crate::state::StateStore;
use crate::state::dynamo::DynamoStateStore;
use crate::state::local::LocalStateStore;
use crate::storage::ObjectStore;
use crate::storage::s3_upload::S3ObjectStore;
use crate::utils::retry::RetryPolicy;
use logic::BackupEngine;
pub use stats::RunSummary;

fn scopes(app_config: &AppConfig) -> Vec<Scope> {
    let source = &app_config.source;
    let mut scopes = Vec::with_capacity(source.shared_drives.len() + 1);
    if source.include_user_files {
        scopes.push(Scope::UserFiles);
    }
    scopes.extend(source.shared_drives.iter().cloned().map(Scope::SharedDrive));
    scopes
}

async fn open_state_store(app_config: &AppConfig, session: &Session) -> Result<Arc<dyn StateStore>> {
    Ok(match &app_config.state {
        StateBackend::DynamoDb { table } => {
            info!(table = %table, "Using DynamoDB state table");
            Arc::new(DynamoStateStore::new(&session.aws, table))
        }
        StateBackend::LocalFile { path } => Arc::new(
            LocalStateStore::open(path)
                .await
                .with_context(|| format!("Failed to open state file {}", path.display()))?,
        ),
    })
}

/// Public entry point for the backup process.
///
/// Builds the adapters from the session and runs the engine once for
/// `backup_date`.
pub async fn run_backup_flow(
    app_config: &AppConfig,
    session: &Session,
    backup_date: NaiveDate,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let s3_store = S3ObjectStore::new(&session.aws, &app_config.spaces_config);
    s3_store
        .check_bucket_access()
        .await
        .context("Destination bucket check failed")?;
    let store: Arc<dyn ObjectStore> = Arc::new(s3_store);

    let source: Arc<dyn SourceClient> = Arc::new(DriveClient::from_session(
        session,
        &app_config.source,
        RetryPolicy::from_engine(&app_config.engine),
    ));
    let state = open_state_store(app_config, session).await?;

    let scopes = scopes(app_config);
    info!(
        scopes = scopes.len(),
        bucket = %app_config.spaces_config.bucket_name,
        date = %backup_date,
        "Starting backup run"
    );

    let engine = Arc::new(BackupEngine::new(
        source,
        store,
        state,
        &app_config.engine,
        app_config.spaces_config.folder_prefix.clone(),
    ));
    let summary = engine
        .run(&scopes, backup_date, cancel)
        .await
        .context("Backup run could not start")?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scopes_follow_source_config() -> anyhow::Result<()> {
        let raw = serde_json::from_value(json!({
            "s3_storage": { "bucket_name": "backups" },
            "state": { "local_file": "state.json" },
            "source": {
                "include_user_files": false,
                "shared_drives": [
                    { "id": "d1", "name": "Finance" },
                    { "id": "d2", "name": "Legal" }
                ]
            }
        }))?;
        let app_config = AppConfig::from_raw(raw)?;

        let scopes = scopes(&app_config);
        let names: Vec<Option<&str>> = scopes.iter().map(Scope::shared_collection).collect();
        assert_eq!(names, vec![Some("Finance"), Some("Legal")]);
        Ok(())
    }
}

//! Scheduled workflow snapshot service.
//!
//! On every cron tick the service fetches all workflows from HubSpot,
//! upserts them, and broadcasts a `workflow:version` event for each
//! definition that changed. Manual syncs (CLI and API) reuse the same
//! sweep and single-workflow paths.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::api::Broadcaster;
use crate::error::{Error, Result};
use crate::hubspot::HubSpotClient;
use crate::metrics;
use crate::storage::{SnapshotType, SqliteStorage, StoredWorkflow, WorkflowVersion};

/// Outcome of one snapshot sweep.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSummary {
    pub workflows_seen: usize,
    pub versions_recorded: usize,
    pub failures: usize,
}

/// Periodic snapshot service.
pub struct SnapshotService {
    storage: SqliteStorage,
    hubspot: HubSpotClient,
    broadcaster: Arc<Broadcaster>,
    scheduler: Arc<Mutex<Option<JobScheduler>>>,
}

impl SnapshotService {
    pub fn new(
        storage: SqliteStorage,
        hubspot: HubSpotClient,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            storage,
            hubspot,
            broadcaster,
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the cron schedule.
    pub async fn start(&self, schedule: &str) -> Result<()> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Internal(format!("Failed to create scheduler: {}", e)))?;

        let storage = self.storage.clone();
        let hubspot = self.hubspot.clone();
        let broadcaster = Arc::clone(&self.broadcaster);

        let job = Job::new_async(schedule, move |_uuid, _lock| {
            let storage = storage.clone();
            let hubspot = hubspot.clone();
            let broadcaster = Arc::clone(&broadcaster);

            Box::pin(async move {
                info!("Scheduled snapshot sweep starting");
                match run_once(&storage, &hubspot, &broadcaster, SnapshotType::Scheduled).await {
                    Ok(summary) => {
                        info!(
                            workflows = summary.workflows_seen,
                            versions = summary.versions_recorded,
                            failures = summary.failures,
                            "Snapshot sweep finished"
                        );
                    }
                    Err(e) => {
                        error!("Snapshot sweep failed: {}", e);
                    }
                }
            })
        })
        .map_err(|e| Error::Config(format!("Invalid cron expression '{}': {}", schedule, e)))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| Error::Internal(format!("Failed to add snapshot job: {}", e)))?;
        scheduler
            .start()
            .await
            .map_err(|e| Error::Internal(format!("Failed to start scheduler: {}", e)))?;

        *self.scheduler.lock().await = Some(scheduler);
        info!("Snapshot scheduler started ({})", schedule);
        Ok(())
    }

    /// Stop the cron schedule gracefully.
    pub async fn stop(&self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| Error::Internal(format!("Failed to stop scheduler: {}", e)))?;
            info!("Snapshot scheduler stopped");
        }
        Ok(())
    }

    /// Run one full sweep now (manual sync).
    pub async fn run_once(&self, snapshot_type: SnapshotType) -> Result<SnapshotSummary> {
        run_once(&self.storage, &self.hubspot, &self.broadcaster, snapshot_type).await
    }

    /// Sync a single workflow by its HubSpot id.
    pub async fn sync_workflow(
        &self,
        hubspot_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<(StoredWorkflow, Option<WorkflowVersion>)> {
        sync_workflow(
            &self.storage,
            &self.hubspot,
            &self.broadcaster,
            hubspot_id,
            snapshot_type,
        )
        .await
    }
}

/// Fetch every workflow from HubSpot and snapshot the changed ones.
pub async fn run_once(
    storage: &SqliteStorage,
    hubspot: &HubSpotClient,
    broadcaster: &Broadcaster,
    snapshot_type: SnapshotType,
) -> Result<SnapshotSummary> {
    let started = Instant::now();
    let workflows = hubspot.list_workflows().await?;

    let mut summary = SnapshotSummary {
        workflows_seen: workflows.len(),
        ..Default::default()
    };

    for upstream in workflows {
        let definition = serde_json::to_string(&upstream.raw)?;
        match storage
            .upsert_workflow(&upstream.id, &upstream.name, &definition, snapshot_type, None)
            .await
        {
            Ok((workflow, Some(version))) => {
                summary.versions_recorded += 1;
                metrics::record_snapshot("recorded", &snapshot_type.to_string());
                broadcaster.version_created(&workflow.id, &workflow.name, version.version);
            }
            Ok((_, None)) => {
                metrics::record_snapshot("unchanged", &snapshot_type.to_string());
            }
            Err(e) => {
                summary.failures += 1;
                metrics::record_snapshot("failed", &snapshot_type.to_string());
                warn!("Failed to snapshot workflow {}: {}", upstream.id, e);
            }
        }
    }

    metrics::record_snapshot_run_duration(started.elapsed());
    Ok(summary)
}

/// Fetch and snapshot a single workflow.
pub async fn sync_workflow(
    storage: &SqliteStorage,
    hubspot: &HubSpotClient,
    broadcaster: &Broadcaster,
    hubspot_id: &str,
    snapshot_type: SnapshotType,
) -> Result<(StoredWorkflow, Option<WorkflowVersion>)> {
    let upstream = hubspot.get_workflow(hubspot_id).await?;
    let definition = serde_json::to_string(&upstream.raw)?;

    let (workflow, version) = storage
        .upsert_workflow(&upstream.id, &upstream.name, &definition, snapshot_type, None)
        .await?;

    if let Some(version) = &version {
        metrics::record_snapshot("recorded", &snapshot_type.to_string());
        broadcaster.version_created(&workflow.id, &workflow.name, version.version);
    } else {
        metrics::record_snapshot("unchanged", &snapshot_type.to_string());
    }

    Ok((workflow, version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: String) -> HubSpotClient {
        HubSpotClient::with_settings(
            base_url,
            "token".to_string(),
            Duration::from_secs(5),
            RetryPolicy {
                retries: 1,
                min_timeout: Duration::from_millis(1),
                factor: 1.0,
            },
            CircuitBreakerConfig::default(),
        )
        .unwrap()
    }

    async fn mock_workflow_list(server: &MockServer, workflows: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/automation/v3/workflows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "workflows": workflows
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_sweep_records_versions_and_broadcasts() {
        let server = MockServer::start().await;
        mock_workflow_list(
            &server,
            json!([
                {"id": 1, "name": "Lead routing", "rev": 1},
                {"id": 2, "name": "Onboarding", "rev": 1}
            ]),
        )
        .await;

        let storage = SqliteStorage::open_in_memory().unwrap();
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        let summary = run_once(
            &storage,
            &test_client(server.uri()),
            &broadcaster,
            SnapshotType::Scheduled,
        )
        .await
        .unwrap();

        assert_eq!(summary.workflows_seen, 2);
        assert_eq!(summary.versions_recorded, 2);
        assert_eq!(summary.failures, 0);

        // One workflow:version event per recorded version
        let mut versions_seen = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, crate::api::WsEvent::WorkflowVersion { .. }) {
                versions_seen += 1;
            }
        }
        assert_eq!(versions_seen, 2);
    }

    #[tokio::test]
    async fn test_unchanged_sweep_records_nothing() {
        let server = MockServer::start().await;
        mock_workflow_list(&server, json!([{"id": 1, "name": "Lead routing", "rev": 1}])).await;

        let storage = SqliteStorage::open_in_memory().unwrap();
        let broadcaster = Broadcaster::new();
        let client = test_client(server.uri());

        let first = run_once(&storage, &client, &broadcaster, SnapshotType::Scheduled)
            .await
            .unwrap();
        assert_eq!(first.versions_recorded, 1);

        let second = run_once(&storage, &client, &broadcaster, SnapshotType::Scheduled)
            .await
            .unwrap();
        assert_eq!(second.versions_recorded, 0);
    }

    #[tokio::test]
    async fn test_sync_single_workflow() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/automation/v3/workflows/7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": 7, "name": "Renewal", "rev": 3})),
            )
            .mount(&server)
            .await;

        let storage = SqliteStorage::open_in_memory().unwrap();
        let broadcaster = Broadcaster::new();

        let (workflow, version) = sync_workflow(
            &storage,
            &test_client(server.uri()),
            &broadcaster,
            "7",
            SnapshotType::Manual,
        )
        .await
        .unwrap();

        assert_eq!(workflow.hubspot_id, "7");
        let version = version.unwrap();
        assert_eq!(version.version, 1);
        assert_eq!(version.snapshot_type, SnapshotType::Manual);
    }
}

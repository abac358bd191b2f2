use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workflowguard::api::{create_router, AppState, Broadcaster};
use workflowguard::config::Config;
use workflowguard::hubspot::HubSpotClient;
use workflowguard::resilience::RateLimiter;
use workflowguard::shutdown::ShutdownCoordinator;
use workflowguard::snapshot::{self, SnapshotService};
use workflowguard::storage::{SnapshotType, SqliteStorage};
use workflowguard::telemetry::{self, OtelConfig};
use workflowguard::{diff, metrics};

#[derive(Parser)]
#[command(name = "workflowguard")]
#[command(about = "Snapshot, diff, and roll back HubSpot automation workflows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (API + snapshot scheduler)
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one snapshot pass over all HubSpot workflows
    Sync,
    /// Inspect stored workflows and their version history
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Database maintenance and checks
    Db {
        #[command(subcommand)]
        action: DbActions,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// List all stored workflows
    List,
    /// Show workflow details
    Show {
        /// Workflow ID or HubSpot ID
        id: String,
    },
    /// Show workflow version history
    History {
        /// Workflow ID or HubSpot ID
        id: String,
        /// Number of versions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Compare two stored versions field by field
    Compare {
        /// Workflow ID or HubSpot ID
        id: String,
        /// Older version number
        from: u32,
        /// Newer version number
        to: u32,
    },
    /// Roll back a workflow to a previous version (pushes to HubSpot)
    Rollback {
        /// Workflow ID or HubSpot ID
        id: String,
        /// Version number to roll back to
        version: u32,
    },
}

#[derive(Subcommand)]
enum DbActions {
    /// Run database health checks
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The server command wires logging through the telemetry layer; plain
    // commands get a simple fmt subscriber.
    if !matches!(cli.command, Commands::Serve { .. }) {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "workflowguard=info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    match cli.command {
        Commands::Serve { port } => cmd_serve(port).await?,
        Commands::Sync => cmd_sync().await?,
        Commands::Workflows { action } => match action {
            WorkflowActions::List => cmd_workflows_list().await?,
            WorkflowActions::Show { id } => cmd_workflows_show(&id).await?,
            WorkflowActions::History { id, limit } => cmd_workflows_history(&id, limit).await?,
            WorkflowActions::Compare { id, from, to } => {
                cmd_workflows_compare(&id, from, to).await?
            }
            WorkflowActions::Rollback { id, version } => {
                cmd_workflows_rollback(&id, version).await?
            }
        },
        Commands::Db { action } => match action {
            DbActions::Check => cmd_db_check().await?,
        },
    }

    Ok(())
}

// ============================================================================
// Shared setup
// ============================================================================

fn database_path(config: &Config) -> PathBuf {
    config
        .storage
        .database_path
        .clone()
        .unwrap_or_else(|| Config::data_dir().join("workflowguard.db"))
}

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let path = database_path(config);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStorage::open(&path)?)
}

/// Resolve a CLI workflow argument to a stored workflow, accepting either
/// the internal ID or the HubSpot ID.
async fn resolve_workflow(
    storage: &SqliteStorage,
    id: &str,
) -> anyhow::Result<workflowguard::storage::StoredWorkflow> {
    if let Some(workflow) = storage.get_workflow(id).await? {
        return Ok(workflow);
    }
    if let Some(workflow) = storage.get_workflow_by_hubspot_id(id).await? {
        return Ok(workflow);
    }
    anyhow::bail!("Workflow not found: {}", id)
}

// ============================================================================
// Server Command
// ============================================================================

async fn cmd_serve(port: Option<u16>) -> anyhow::Result<()> {
    let otel_config = OtelConfig::default();
    let tracer_provider = telemetry::init_telemetry(&otel_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    metrics::init_metrics();

    let mut config = Config::load();
    if let Some(port) = port {
        config.server.port = port;
    }

    let storage = get_storage(&config)?;
    let hubspot = HubSpotClient::new(&config.hubspot)?;
    let broadcaster = Arc::new(Broadcaster::new());
    let rate_limiter = Arc::new(RateLimiter::new());

    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.start_signal_listener();

    // Periodic purge keeps the per-client rate limit map bounded
    let purge_limiter = Arc::clone(&rate_limiter);
    let purge_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = tick.tick() => purge_limiter.purge_expired(),
                _ = purge_shutdown.wait_for_shutdown() => break,
            }
        }
    });

    let snapshot_service = SnapshotService::new(
        storage.clone(),
        hubspot.clone(),
        Arc::clone(&broadcaster),
    );
    snapshot_service.start(&config.snapshot.schedule).await?;

    let state = AppState {
        storage,
        hubspot,
        broadcaster,
        rate_limiter,
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("workflowguard server running on http://{}", addr);
    println!();
    println!("Snapshot schedule: {}", config.snapshot.schedule);
    println!();
    println!("API endpoints:");
    println!("  GET    /api/health");
    println!("  GET    /api/metrics");
    println!("  GET    /api/workflows");
    println!("  GET    /api/workflows/:id");
    println!("  POST   /api/workflows/:id/protect");
    println!("  DELETE /api/workflows/:id/protect");
    println!("  POST   /api/workflows/:id/sync");
    println!("  GET    /api/workflows/:id/versions");
    println!("  GET    /api/workflows/:id/compare?from=&to=");
    println!("  POST   /api/workflows/:id/rollback");
    println!("  GET    /api/audit");
    println!("  POST   /api/support");
    println!("  WS     /api/ws (live workflow updates)");
    println!();
    println!("Webhooks: POST /webhooks/billing");
    println!();
    println!("Press Ctrl+C to stop");

    let shutdown_wait = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_wait.wait_for_shutdown().await;
            println!("\nShutting down gracefully...");
        })
        .await?;

    snapshot_service.stop().await?;
    telemetry::shutdown_telemetry(tracer_provider);

    println!("Server stopped.");
    Ok(())
}

// ============================================================================
// Sync Command
// ============================================================================

async fn cmd_sync() -> anyhow::Result<()> {
    let config = Config::load();
    let storage = get_storage(&config)?;
    let hubspot = HubSpotClient::new(&config.hubspot)?;
    let broadcaster = Broadcaster::new();

    println!("Fetching workflows from HubSpot...");
    let summary =
        snapshot::run_once(&storage, &hubspot, &broadcaster, SnapshotType::Manual).await?;

    println!(
        "Done: {} workflow(s) seen, {} version(s) recorded, {} failure(s)",
        summary.workflows_seen, summary.versions_recorded, summary.failures
    );
    Ok(())
}

// ============================================================================
// Workflow Commands
// ============================================================================

async fn cmd_workflows_list() -> anyhow::Result<()> {
    let config = Config::load();
    let storage = get_storage(&config)?;
    let workflows = storage.list_workflows().await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        println!();
        println!("Fetch them with: workflowguard sync");
        return Ok(());
    }

    println!(
        "{:<30} {:<12} {:<10} {:<20}",
        "NAME", "HUBSPOT ID", "PROTECTED", "UPDATED"
    );
    println!("{}", "-".repeat(74));

    for wf in workflows {
        println!(
            "{:<30} {:<12} {:<10} {:<20}",
            wf.name,
            wf.hubspot_id,
            if wf.protected { "yes" } else { "no" },
            wf.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn cmd_workflows_show(id: &str) -> anyhow::Result<()> {
    let config = Config::load();
    let storage = get_storage(&config)?;
    let workflow = resolve_workflow(&storage, id).await?;
    let versions = storage.list_workflow_versions(&workflow.id).await?;

    println!("Workflow: {}", workflow.name);
    println!("  ID:         {}", workflow.id);
    println!("  HubSpot ID: {}", workflow.hubspot_id);
    println!("  Protected:  {}", if workflow.protected { "yes" } else { "no" });
    println!("  Versions:   {}", versions.len());
    println!("  Created:    {}", workflow.created_at.format("%Y-%m-%d %H:%M"));
    println!("  Updated:    {}", workflow.updated_at.format("%Y-%m-%d %H:%M"));

    if let Ok(definition) = serde_json::from_str::<Value>(&workflow.definition) {
        println!();
        println!("{}", serde_json::to_string_pretty(&definition)?);
    }

    Ok(())
}

async fn cmd_workflows_history(id: &str, limit: usize) -> anyhow::Result<()> {
    let config = Config::load();
    let storage = get_storage(&config)?;
    let workflow = resolve_workflow(&storage, id).await?;
    let versions = storage.list_workflow_versions(&workflow.id).await?;

    if versions.is_empty() {
        println!("No versions recorded for '{}'.", workflow.name);
        return Ok(());
    }

    println!("Version history for '{}':", workflow.name);
    println!(
        "{:<8} {:<10} {:<20} {:<12} {}",
        "VERSION", "TYPE", "CREATED", "BY", "CHANGELOG"
    );
    println!("{}", "-".repeat(70));

    for v in versions.iter().take(limit) {
        println!(
            "{:<8} {:<10} {:<20} {:<12} {}",
            v.version,
            v.snapshot_type.to_string(),
            v.created_at.format("%Y-%m-%d %H:%M"),
            v.created_by.as_deref().unwrap_or("-"),
            v.changelog.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

async fn cmd_workflows_compare(id: &str, from: u32, to: u32) -> anyhow::Result<()> {
    let config = Config::load();
    let storage = get_storage(&config)?;
    let workflow = resolve_workflow(&storage, id).await?;

    let from_version = storage
        .get_workflow_version(&workflow.id, from)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Version {} not found for '{}'", from, workflow.name))?;
    let to_version = storage
        .get_workflow_version(&workflow.id, to)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Version {} not found for '{}'", to, workflow.name))?;

    let old: Value = serde_json::from_str(&from_version.definition)?;
    let new: Value = serde_json::from_str(&to_version.definition)?;
    let report = diff::compare(&old, &new);

    if report.is_empty() {
        println!(
            "Versions {} and {} of '{}' are identical.",
            from, to, workflow.name
        );
        return Ok(());
    }

    println!(
        "Comparing '{}' v{} -> v{} ({} change(s)):",
        workflow.name,
        from,
        to,
        report.change_count()
    );
    for change in &report.added {
        println!(
            "  + {} = {}",
            change.path,
            change.new.as_ref().unwrap_or(&Value::Null)
        );
    }
    for change in &report.removed {
        println!(
            "  - {} (was {})",
            change.path,
            change.old.as_ref().unwrap_or(&Value::Null)
        );
    }
    for change in &report.changed {
        println!(
            "  ~ {}: {} -> {}",
            change.path,
            change.old.as_ref().unwrap_or(&Value::Null),
            change.new.as_ref().unwrap_or(&Value::Null)
        );
    }

    Ok(())
}

async fn cmd_workflows_rollback(id: &str, version: u32) -> anyhow::Result<()> {
    let config = Config::load();
    let storage = get_storage(&config)?;
    let hubspot = HubSpotClient::new(&config.hubspot)?;
    let workflow = resolve_workflow(&storage, id).await?;

    let target = storage
        .get_workflow_version(&workflow.id, version)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Version {} not found for '{}'", version, workflow.name))?;

    println!(
        "Rolling back '{}' to version {} ({})...",
        workflow.name,
        version,
        target.created_at.format("%Y-%m-%d %H:%M")
    );

    let definition: Value = serde_json::from_str(&target.definition)?;
    hubspot
        .update_workflow(&workflow.hubspot_id, &definition)
        .await?;

    let (workflow, recorded) = storage
        .rollback_workflow(&workflow.id, version, Some("cli"))
        .await?;
    storage
        .record_audit(
            "cli",
            "workflow.rollback",
            "workflow",
            Some(&workflow.id),
            serde_json::json!({
                "target_version": version,
                "recorded_version": recorded.version,
            }),
        )
        .await?;

    println!(
        "Rolled back '{}'; recorded as version {}.",
        workflow.name, recorded.version
    );
    Ok(())
}

// ============================================================================
// Database Commands
// ============================================================================

async fn cmd_db_check() -> anyhow::Result<()> {
    let config = Config::load();
    let path = database_path(&config);
    println!("Database: {}", path.display());

    let storage = get_storage(&config)?;
    let health = storage.check_health().await?;

    println!("  Journal mode:       {}", health.journal_mode);
    println!("  Busy timeout:       {} ms", health.busy_timeout_ms);
    println!(
        "  Foreign keys:       {}",
        if health.foreign_keys_enabled { "on" } else { "off" }
    );
    println!("  Integrity check:    {}", health.integrity_check);
    println!(
        "  Orphaned versions:  {}",
        health.orphaned_workflow_versions
    );

    if health.foreign_key_violations.is_empty() {
        println!("  FK violations:      none");
    } else {
        println!("  FK violations:");
        for violation in &health.foreign_key_violations {
            println!("    {}", violation);
        }
    }

    if health.integrity_check == "ok" && health.foreign_key_violations.is_empty() {
        println!();
        println!("Database is healthy.");
    } else {
        println!();
        println!("Database has problems; back up the file before repairing.");
    }

    Ok(())
}

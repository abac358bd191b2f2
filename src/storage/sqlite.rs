//! SQLite storage implementation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        Self::init_schema_sync(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            -- Wait up to 5 seconds when database is locked instead of failing immediately
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                hubspot_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                protected INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_versions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition TEXT NOT NULL,
                snapshot_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT,
                changelog TEXT,
                checksum TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE(workflow_id, version)
            );

            CREATE TABLE IF NOT EXISTS audit_logs (
                id TEXT PRIMARY KEY,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS support_tickets (
                id TEXT PRIMARY KEY,
                actor TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                actor TEXT NOT NULL UNIQUE,
                plan TEXT NOT NULL,
                status TEXT NOT NULL,
                trial_ends_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_workflow_versions_workflow
                ON workflow_versions(workflow_id, version DESC);
            CREATE INDEX IF NOT EXISTS idx_audit_logs_created
                ON audit_logs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_support_tickets_actor
                ON support_tickets(actor, created_at DESC);
            "#,
        )?;

        Self::repair_orphans(conn)?;
        Ok(())
    }

    fn repair_orphans(conn: &Connection) -> Result<()> {
        conn.execute(
            "DELETE FROM workflow_versions
             WHERE workflow_id NOT IN (SELECT id FROM workflows)",
            [],
        )?;
        Ok(())
    }

    // ========================================================================
    // Workflow operations
    // ========================================================================

    /// Insert or update a workflow by its HubSpot id.
    ///
    /// Records a new version row when the definition checksum differs from
    /// the latest stored version. Returns the effective workflow and the new
    /// version, if one was recorded.
    pub async fn upsert_workflow(
        &self,
        hubspot_id: &str,
        name: &str,
        definition: &str,
        snapshot_type: SnapshotType,
        created_by: Option<&str>,
    ) -> Result<(StoredWorkflow, Option<WorkflowVersion>)> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        let existing: Option<(String, bool, String)> = conn
            .query_row(
                "SELECT id, protected, created_at FROM workflows WHERE hubspot_id = ?1",
                [hubspot_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let workflow = if let Some((id, protected, created_at)) = existing {
            conn.execute(
                "UPDATE workflows SET name = ?1, definition = ?2, updated_at = ?3 WHERE id = ?4",
                params![name, definition, now.to_rfc3339(), id],
            )?;
            StoredWorkflow {
                id,
                hubspot_id: hubspot_id.to_string(),
                name: name.to_string(),
                definition: definition.to_string(),
                protected,
                created_at: parse_datetime_utc(&created_at).unwrap_or(now),
                updated_at: now,
            }
        } else {
            let workflow = StoredWorkflow {
                id: uuid::Uuid::new_v4().to_string(),
                hubspot_id: hubspot_id.to_string(),
                name: name.to_string(),
                definition: definition.to_string(),
                protected: false,
                created_at: now,
                updated_at: now,
            };
            conn.execute(
                "INSERT INTO workflows
                 (id, hubspot_id, name, definition, protected, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    workflow.id,
                    workflow.hubspot_id,
                    workflow.name,
                    workflow.definition,
                    workflow.protected,
                    workflow.created_at.to_rfc3339(),
                    workflow.updated_at.to_rfc3339(),
                ],
            )?;
            workflow
        };

        let version = Self::record_version_if_changed(
            &conn,
            &workflow,
            snapshot_type,
            created_by,
            None,
        )?;
        Ok((workflow, version))
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, hubspot_id, name, definition, protected, created_at, updated_at
             FROM workflows WHERE id = ?1",
        )?;

        let workflow = stmt.query_row([id], Self::row_to_workflow).optional()?;
        Ok(workflow)
    }

    pub async fn get_workflow_by_hubspot_id(
        &self,
        hubspot_id: &str,
    ) -> Result<Option<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, hubspot_id, name, definition, protected, created_at, updated_at
             FROM workflows WHERE hubspot_id = ?1",
        )?;

        let workflow = stmt
            .query_row([hubspot_id], Self::row_to_workflow)
            .optional()?;
        Ok(workflow)
    }

    pub async fn list_workflows(&self) -> Result<Vec<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, hubspot_id, name, definition, protected, created_at, updated_at
             FROM workflows ORDER BY name",
        )?;

        let workflows = stmt
            .query_map([], Self::row_to_workflow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workflows)
    }

    /// Toggle protection on a workflow.
    pub async fn set_protected(&self, id: &str, protected: bool) -> Result<StoredWorkflow> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workflows SET protected = ?1, updated_at = ?2 WHERE id = ?3",
            params![protected, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Workflow not found: {}", id)));
        }

        let mut stmt = conn.prepare(
            "SELECT id, hubspot_id, name, definition, protected, created_at, updated_at
             FROM workflows WHERE id = ?1",
        )?;
        let workflow = stmt
            .query_row([id], Self::row_to_workflow)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Workflow not found: {}", id)))?;
        Ok(workflow)
    }

    /// Count workflows marked protected (plan limits count these).
    pub async fn count_protected_workflows(&self) -> Result<u32> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflows WHERE protected = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u32)
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM workflows WHERE id = ?1", [id])?;
        Ok(())
    }

    // ========================================================================
    // Version operations
    // ========================================================================

    pub async fn list_workflow_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, workflow_name, version, definition, snapshot_type, created_at, created_by, changelog, checksum
             FROM workflow_versions
             WHERE workflow_id = ?1
             ORDER BY version DESC",
        )?;

        let versions = stmt
            .query_map([workflow_id], Self::row_to_workflow_version)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    pub async fn get_workflow_version(
        &self,
        workflow_id: &str,
        version: u32,
    ) -> Result<Option<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, workflow_name, version, definition, snapshot_type, created_at, created_by, changelog, checksum
             FROM workflow_versions
             WHERE workflow_id = ?1 AND version = ?2",
        )?;

        let record = stmt
            .query_row(params![workflow_id, version], Self::row_to_workflow_version)
            .optional()?;
        Ok(record)
    }

    /// Replace the live definition with a stored version's and record the
    /// change as a new version. History is append-only.
    pub async fn rollback_workflow(
        &self,
        workflow_id: &str,
        version: u32,
        created_by: Option<&str>,
    ) -> Result<(StoredWorkflow, WorkflowVersion)> {
        let conn = self.conn.lock().await;

        let mut wf_stmt = conn.prepare(
            "SELECT id, hubspot_id, name, definition, protected, created_at, updated_at
             FROM workflows WHERE id = ?1",
        )?;
        let mut workflow = wf_stmt
            .query_row([workflow_id], Self::row_to_workflow)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Workflow not found: {}", workflow_id)))?;

        let mut version_stmt = conn.prepare(
            "SELECT id, workflow_id, workflow_name, version, definition, snapshot_type, created_at, created_by, changelog, checksum
             FROM workflow_versions WHERE workflow_id = ?1 AND version = ?2",
        )?;
        let target = version_stmt
            .query_row(params![workflow_id, version], Self::row_to_workflow_version)
            .optional()?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "Workflow version not found: {} v{}",
                    workflow_id, version
                ))
            })?;

        workflow.definition = target.definition;
        workflow.updated_at = Utc::now();

        conn.execute(
            "UPDATE workflows SET definition = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                workflow.definition,
                workflow.updated_at.to_rfc3339(),
                workflow.id
            ],
        )?;

        let changelog = format!("Rollback to version {}", version);
        let recorded = Self::record_version_if_changed(
            &conn,
            &workflow,
            SnapshotType::Rollback,
            created_by,
            Some(changelog.as_str()),
        )?;

        // Rolling back to the current definition records nothing new; report
        // the latest version in that case so callers always get one.
        let new_version = match recorded {
            Some(v) => v,
            None => Self::latest_version(&conn, &workflow.id)?.ok_or_else(|| {
                Error::Storage(format!("No versions recorded for workflow {}", workflow.id))
            })?,
        };

        Ok((workflow, new_version))
    }

    fn latest_version(conn: &Connection, workflow_id: &str) -> Result<Option<WorkflowVersion>> {
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, workflow_name, version, definition, snapshot_type, created_at, created_by, changelog, checksum
             FROM workflow_versions
             WHERE workflow_id = ?1
             ORDER BY version DESC
             LIMIT 1",
        )?;
        let record = stmt
            .query_row([workflow_id], Self::row_to_workflow_version)
            .optional()?;
        Ok(record)
    }

    fn record_version_if_changed(
        conn: &Connection,
        workflow: &StoredWorkflow,
        snapshot_type: SnapshotType,
        created_by: Option<&str>,
        changelog: Option<&str>,
    ) -> Result<Option<WorkflowVersion>> {
        let checksum = definition_checksum(&workflow.definition);

        let latest: Option<(u32, String)> = conn
            .query_row(
                "SELECT version, checksum FROM workflow_versions
                 WHERE workflow_id = ?1
                 ORDER BY version DESC
                 LIMIT 1",
                [workflow.id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((_, latest_checksum)) = &latest {
            if latest_checksum == &checksum {
                return Ok(None);
            }
        }

        let next_version = latest.map(|(version, _)| version + 1).unwrap_or(1);
        let version = WorkflowVersion {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            version: next_version,
            definition: workflow.definition.clone(),
            snapshot_type,
            created_at: Utc::now(),
            created_by: created_by.map(|s| s.to_string()),
            changelog: changelog.map(|s| s.to_string()),
            checksum,
        };

        conn.execute(
            "INSERT INTO workflow_versions
             (id, workflow_id, workflow_name, version, definition, snapshot_type, created_at, created_by, changelog, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                version.id,
                version.workflow_id,
                version.workflow_name,
                version.version,
                version.definition,
                version.snapshot_type.to_string(),
                version.created_at.to_rfc3339(),
                version.created_by,
                version.changelog,
                version.checksum,
            ],
        )?;

        Ok(Some(version))
    }

    // ========================================================================
    // Audit log operations
    // ========================================================================

    pub async fn record_audit(
        &self,
        actor: &str,
        action: &str,
        entity_type: &str,
        entity_id: Option<&str>,
        details: serde_json::Value,
    ) -> Result<AuditLog> {
        let conn = self.conn.lock().await;
        let entry = AuditLog {
            id: uuid::Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.map(|s| s.to_string()),
            details,
            created_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO audit_logs (id, actor, action, entity_type, entity_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.actor,
                entry.action,
                entry.entity_type,
                entry.entity_id,
                serde_json::to_string(&entry.details).unwrap_or_default(),
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(entry)
    }

    pub async fn list_audit_logs(&self, limit: usize, offset: usize) -> Result<Vec<AuditLog>> {
        let conn = self.conn.lock().await;
        let limit = if limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            limit.min(MAX_QUERY_LIMIT)
        };

        let mut stmt = conn.prepare(
            "SELECT id, actor, action, entity_type, entity_id, details, created_at
             FROM audit_logs
             ORDER BY created_at DESC
             LIMIT ?1 OFFSET ?2",
        )?;

        let entries = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                let details_str: String = row.get(5)?;
                Ok(AuditLog {
                    id: row.get(0)?,
                    actor: row.get(1)?,
                    action: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    details: serde_json::from_str(&details_str)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ========================================================================
    // Support ticket operations
    // ========================================================================

    pub async fn create_ticket(
        &self,
        actor: &str,
        subject: &str,
        body: &str,
    ) -> Result<SupportTicket> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let ticket = SupportTicket {
            id: uuid::Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            status: TicketStatus::Open,
            created_at: now,
            updated_at: now,
        };

        conn.execute(
            "INSERT INTO support_tickets (id, actor, subject, body, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ticket.id,
                ticket.actor,
                ticket.subject,
                ticket.body,
                ticket.status.to_string(),
                ticket.created_at.to_rfc3339(),
                ticket.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(ticket)
    }

    pub async fn list_tickets(&self, actor: &str) -> Result<Vec<SupportTicket>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, actor, subject, body, status, created_at, updated_at
             FROM support_tickets
             WHERE actor = ?1
             ORDER BY created_at DESC",
        )?;

        let tickets = stmt
            .query_map([actor], Self::row_to_ticket)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    /// Fetch a ticket, distinguishing missing tickets from tickets owned by
    /// someone else.
    pub async fn get_ticket(&self, id: &str, actor: &str) -> Result<SupportTicket> {
        let conn = self.conn.lock().await;
        let ticket = Self::fetch_ticket(&conn, id)?;
        if ticket.actor != actor {
            return Err(Error::Forbidden(format!(
                "Ticket {} belongs to another user",
                id
            )));
        }
        Ok(ticket)
    }

    pub async fn update_ticket_status(
        &self,
        id: &str,
        actor: &str,
        status: TicketStatus,
    ) -> Result<SupportTicket> {
        let conn = self.conn.lock().await;
        let mut ticket = Self::fetch_ticket(&conn, id)?;
        if ticket.actor != actor {
            return Err(Error::Forbidden(format!(
                "Ticket {} belongs to another user",
                id
            )));
        }

        ticket.status = status;
        ticket.updated_at = Utc::now();
        conn.execute(
            "UPDATE support_tickets SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                ticket.status.to_string(),
                ticket.updated_at.to_rfc3339(),
                ticket.id
            ],
        )?;
        Ok(ticket)
    }

    fn fetch_ticket(conn: &Connection, id: &str) -> Result<SupportTicket> {
        let mut stmt = conn.prepare(
            "SELECT id, actor, subject, body, status, created_at, updated_at
             FROM support_tickets WHERE id = ?1",
        )?;
        stmt.query_row([id], Self::row_to_ticket)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Ticket not found: {}", id)))
    }

    // ========================================================================
    // Subscription operations
    // ========================================================================

    pub async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO subscriptions (id, actor, plan, status, trial_ends_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(actor) DO UPDATE SET
                plan = excluded.plan,
                status = excluded.status,
                trial_ends_at = excluded.trial_ends_at,
                updated_at = excluded.updated_at",
            params![
                subscription.id,
                subscription.actor,
                subscription.plan.to_string(),
                subscription.status,
                subscription.trial_ends_at.map(|t| t.to_rfc3339()),
                subscription.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_subscription(&self, actor: &str) -> Result<Option<Subscription>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, actor, plan, status, trial_ends_at, updated_at
             FROM subscriptions WHERE actor = ?1",
        )?;

        let subscription = stmt
            .query_row([actor], |row| {
                let plan_str: String = row.get(2)?;
                Ok(Subscription {
                    id: row.get(0)?,
                    actor: row.get(1)?,
                    plan: plan_str.parse().unwrap_or(Plan::Trial),
                    status: row.get(3)?,
                    trial_ends_at: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    updated_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                })
            })
            .optional()?;
        Ok(subscription)
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: i64 =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let busy_timeout_ms: i64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;

        let mut violations_stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let violations_iter = violations_stmt.query_map([], |row| {
            let table: String = row.get(0)?;
            let rowid: Option<i64> = row.get(1)?;
            let parent: String = row.get(2)?;
            let fk_id: i64 = row.get(3)?;
            Ok(format!(
                "table={} rowid={} parent={} fk_id={}",
                table,
                rowid
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                parent,
                fk_id
            ))
        })?;
        let foreign_key_violations = violations_iter.collect::<std::result::Result<Vec<_>, _>>()?;

        let orphaned_workflow_versions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_versions v
             LEFT JOIN workflows w ON w.id = v.workflow_id
             WHERE w.id IS NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseHealth {
            foreign_keys_enabled: foreign_keys_enabled == 1,
            integrity_check,
            foreign_key_violations,
            orphaned_workflow_versions: orphaned_workflow_versions.max(0) as u64,
            journal_mode,
            busy_timeout_ms,
        })
    }

    // ========================================================================
    // Row mappers
    // ========================================================================

    fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredWorkflow> {
        Ok(StoredWorkflow {
            id: row.get(0)?,
            hubspot_id: row.get(1)?,
            name: row.get(2)?,
            definition: row.get(3)?,
            protected: row.get(4)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
        })
    }

    fn row_to_workflow_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowVersion> {
        let snapshot_type_str: String = row.get(5)?;
        Ok(WorkflowVersion {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            version: row.get(3)?,
            definition: row.get(4)?,
            snapshot_type: snapshot_type_str.parse().unwrap_or(SnapshotType::Scheduled),
            created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            created_by: row.get(7)?,
            changelog: row.get(8)?,
            checksum: row.get(9)?,
        })
    }

    fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<SupportTicket> {
        let status_str: String = row.get(4)?;
        Ok(SupportTicket {
            id: row.get(0)?,
            actor: row.get(1)?,
            subject: row.get(2)?,
            body: row.get(3)?,
            status: status_str.parse().unwrap_or(TicketStatus::Open),
            created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
        })
    }
}

fn definition_checksum(definition: &str) -> String {
    let mut hasher = DefaultHasher::new();
    definition.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

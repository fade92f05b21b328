//! libSQL backend: async `WorkflowStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::WorkflowStore;
use crate::workflow::model::{WorkflowConfiguration, WorkflowDefinition, WorkflowType};

const WORKFLOW_COLUMNS: &str =
    "id, name, workflow_type, configuration, interval_secs, is_running, created_at, last_run_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    // Keeps the database handle alive alongside its connection.
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_workflows(
        &self,
        sql: &str,
        op: &str,
    ) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        // Rows that no longer decode are skipped so one bad definition
        // cannot hide the rest.
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut workflows = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_workflow(&row) {
                Ok(workflow) => workflows.push(workflow),
                Err(e) => {
                    let id: String = row.get(0).unwrap_or_default();
                    warn!(workflow_id = %id, error = %e, "Skipping undecodable workflow row");
                }
            }
        }
        Ok(workflows)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_workflow_type(s: &str) -> Result<WorkflowType, DatabaseError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| DatabaseError::Serialization(format!("unknown workflow type {s}: {e}")))
}

fn row_to_workflow(row: &libsql::Row) -> Result<WorkflowDefinition, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("workflow row parse: {e}"));

    let type_str: String = row.get(2).map_err(parse)?;
    let config_str: String = row.get(3).map_err(parse)?;
    let interval: i64 = row.get(4).map_err(parse)?;
    let running: i64 = row.get(5).map_err(parse)?;
    let created_str: String = row.get(6).map_err(parse)?;
    let last_run_str: Option<String> = row.get(7).ok();

    let configuration: WorkflowConfiguration = serde_json::from_str(&config_str)
        .map_err(|e| DatabaseError::Serialization(format!("workflow configuration: {e}")))?;

    Ok(WorkflowDefinition {
        id: row.get(0).map_err(parse)?,
        name: row.get(1).map_err(parse)?,
        workflow_type: parse_workflow_type(&type_str)?,
        configuration,
        interval_secs: u64::try_from(interval).map_err(|_| {
            DatabaseError::Serialization(format!("negative workflow interval {interval}"))
        })?,
        is_running: running != 0,
        created_at: parse_datetime(&created_str),
        last_run_at: last_run_str.as_deref().map(parse_datetime),
    })
}

fn interval_param(workflow: &WorkflowDefinition) -> Result<i64, DatabaseError> {
    i64::try_from(workflow.interval_secs).map_err(|_| {
        DatabaseError::Constraint(format!("interval {}s does not fit the store", workflow.interval_secs))
    })
}

fn config_json(workflow: &WorkflowDefinition) -> Result<String, DatabaseError> {
    serde_json::to_string(&workflow.configuration)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn not_found(id: &str) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "workflow".into(),
        id: id.into(),
    }
}

// ── WorkflowStore ───────────────────────────────────────────────────

#[async_trait]
impl WorkflowStore for LibSqlBackend {
    async fn create_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), DatabaseError> {
        let last_run: libsql::Value = match workflow.last_run_at {
            Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                "INSERT INTO workflows (id, name, workflow_type, configuration, interval_secs, is_running, created_at, last_run_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    workflow.id.clone(),
                    workflow.name.clone(),
                    workflow.workflow_type.as_str(),
                    config_json(workflow)?,
                    interval_param(workflow)?,
                    workflow.is_running as i64,
                    workflow.created_at.to_rfc3339(),
                    last_run,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    DatabaseError::Constraint(format!("workflow {} already exists", workflow.id))
                } else {
                    DatabaseError::Query(format!("create_workflow: {e}"))
                }
            })?;

        debug!(workflow_id = %workflow.id, "Workflow created");
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workflow: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_workflow(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_workflow: {e}"))),
        }
    }

    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE workflows SET name = ?1, workflow_type = ?2, configuration = ?3, interval_secs = ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    workflow.name.clone(),
                    workflow.workflow_type.as_str(),
                    config_json(workflow)?,
                    interval_param(workflow)?,
                    Utc::now().to_rfc3339(),
                    workflow.id.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_workflow: {e}")))?;

        if count == 0 {
            return Err(not_found(&workflow.id));
        }
        Ok(())
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM workflows WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_workflow: {e}")))?;
        Ok(count > 0)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        self.query_workflows(
            &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at ASC"),
            "list_workflows",
        )
        .await
    }

    async fn list_running(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        self.query_workflows(
            &format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE is_running = 1 ORDER BY created_at ASC"
            ),
            "list_running",
        )
        .await
    }

    async fn set_running(&self, id: &str, running: bool) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE workflows SET is_running = ?1, updated_at = ?2 WHERE id = ?3",
                params![running as i64, Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_running: {e}")))?;

        if count == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    async fn touch_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE workflows SET last_run_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_last_run: {e}")))?;

        if count == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::formatter::FormatterStrategy;
    use crate::workflow::model::{ProcessingMode, WorkflowSpec};

    fn definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(WorkflowSpec {
            name: name.into(),
            configuration: WorkflowConfiguration::TelegramToEmail {
                source_chat_id: None,
                allowed_users: vec!["ann".into()],
                to: "me@example.com".into(),
                prompt_template: "Summarize {content}".into(),
                processing: ProcessingMode::Batch { size: 4 },
                formatter: FormatterStrategy::GmailFormat,
            },
            interval_secs: 120,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_round_trips_definition() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let wf = definition("digest");
        db.create_workflow(&wf).await.unwrap();

        let loaded = db.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "digest");
        assert_eq!(loaded.configuration, wf.configuration);
        assert_eq!(loaded.workflow_type, WorkflowType::TelegramToEmail);
        assert_eq!(loaded.interval_secs, 120);
        assert!(!loaded.is_running);
        assert!(loaded.last_run_at.is_none());
    }

    #[tokio::test]
    async fn undecodable_rows_are_skipped_in_listings() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut good = definition("digest");
        good.is_running = true;
        db.create_workflow(&good).await.unwrap();
        db.conn()
            .execute(
                "INSERT INTO workflows (id, name, workflow_type, configuration, interval_secs, is_running, created_at, updated_at) VALUES ('bad', 'bad', 'TELEGRAM_TO_EMAIL', '{\"type\":\"SLACK\"}', 120, 1, ?1, ?1)",
                params![Utc::now().to_rfc3339()],
            )
            .await
            .unwrap();

        let running = db.list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, good.id);
        assert_eq!(db.list_workflows().await.unwrap().len(), 1);
        assert!(db.get_workflow("bad").await.is_err());
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(db.get_workflow("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_constraint_error() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let wf = definition("digest");
        db.create_workflow(&wf).await.unwrap();
        let err = db.create_workflow(&wf).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn update_leaves_runtime_fields_alone() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut wf = definition("digest");
        db.create_workflow(&wf).await.unwrap();
        db.set_running(&wf.id, true).await.unwrap();

        wf.name = "renamed".into();
        wf.is_running = false;
        db.update_workflow(&wf).await.unwrap();

        let loaded = db.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "renamed");
        assert!(loaded.is_running);
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let err = db.update_workflow(&definition("x")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn running_flags_and_last_run() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = definition("a");
        let b = definition("b");
        db.create_workflow(&a).await.unwrap();
        db.create_workflow(&b).await.unwrap();

        db.set_running(&b.id, true).await.unwrap();
        let running = db.list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);
        assert_eq!(db.list_workflows().await.unwrap().len(), 2);

        let at = Utc::now();
        db.touch_last_run(&b.id, at).await.unwrap();
        let loaded = db.get_workflow(&b.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_run_at.map(|t| t.timestamp()), Some(at.timestamp()));
    }

    #[tokio::test]
    async fn delete_reports_whether_removed() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let wf = definition("a");
        db.create_workflow(&wf).await.unwrap();
        assert!(db.delete_workflow(&wf.id).await.unwrap());
        assert!(!db.delete_workflow(&wf.id).await.unwrap());
    }

    #[tokio::test]
    async fn settings_upsert() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(db.get_setting("k").await.unwrap().is_none());
        db.set_setting("k", "one").await.unwrap();
        db.set_setting("k", "two").await.unwrap();
        assert_eq!(db.get_setting("k").await.unwrap().as_deref(), Some("two"));
    }
}

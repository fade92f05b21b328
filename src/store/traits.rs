//! Backend-agnostic persistence trait for workflow definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::workflow::model::WorkflowDefinition;

/// Durable store for workflow definitions and small settings.
///
/// `update_workflow` writes user-editable fields only; `is_running` and
/// `last_run_at` change through `set_running` and `touch_last_run`.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert a new definition.
    async fn create_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), DatabaseError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, DatabaseError>;

    /// Persist name, type, configuration and interval.
    /// Fails with `NotFound` for an unknown id.
    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), DatabaseError>;

    /// Returns whether a row was deleted.
    async fn delete_workflow(&self, id: &str) -> Result<bool, DatabaseError>;

    /// All workflows, oldest first.
    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError>;

    /// Workflows flagged as running, oldest first.
    async fn list_running(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError>;

    async fn set_running(&self, id: &str, running: bool) -> Result<(), DatabaseError>;

    async fn touch_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}

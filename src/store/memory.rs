//! In-memory `WorkflowStore` for unit tests that run on a paused clock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::traits::WorkflowStore;
use crate::workflow::model::WorkflowDefinition;

#[derive(Default)]
pub(crate) struct MemoryStore {
    workflows: Mutex<Vec<WorkflowDefinition>>,
    settings: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub(crate) fn snapshot(&self, id: &str) -> Option<WorkflowDefinition> {
        self.workflows
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.id == id)
            .cloned()
    }

    fn with_workflow<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut WorkflowDefinition) -> T,
    ) -> Result<T, DatabaseError> {
        let mut workflows = self.workflows.lock().unwrap();
        workflows
            .iter_mut()
            .find(|w| w.id == id)
            .map(f)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "workflow".into(),
                id: id.to_string(),
            })
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), DatabaseError> {
        let mut workflows = self.workflows.lock().unwrap();
        if workflows.iter().any(|w| w.id == workflow.id) {
            return Err(DatabaseError::Constraint(format!("duplicate id {}", workflow.id)));
        }
        workflows.push(workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, DatabaseError> {
        Ok(self.snapshot(id))
    }

    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), DatabaseError> {
        self.with_workflow(&workflow.id, |w| {
            w.name = workflow.name.clone();
            w.workflow_type = workflow.workflow_type;
            w.configuration = workflow.configuration.clone();
            w.interval_secs = workflow.interval_secs;
        })
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut workflows = self.workflows.lock().unwrap();
        let before = workflows.len();
        workflows.retain(|w| w.id != id);
        Ok(workflows.len() != before)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        Ok(self.workflows.lock().unwrap().clone())
    }

    async fn list_running(&self) -> Result<Vec<WorkflowDefinition>, DatabaseError> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.is_running)
            .cloned()
            .collect())
    }

    async fn set_running(&self, id: &str, running: bool) -> Result<(), DatabaseError> {
        self.with_workflow(id, |w| w.is_running = running)
    }

    async fn touch_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.with_workflow(id, |w| w.last_run_at = Some(at))
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.settings.lock().unwrap().get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.settings
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

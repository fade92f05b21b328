//! One bound Source + Processor + Destination triple.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::pipeline::message::{Message, Platform};
use crate::pipeline::traits::{Destination, Processor, Source};
use crate::workflow::command::{CommandInvoker, ConsolidatedCommand, SingleMessageCommand};
use crate::workflow::model::WorkflowExecutionResult;

/// Executable pipeline. Cheap to build; the runner makes one per run.
pub struct Workflow {
    label: String,
    source: Arc<dyn Source>,
    processor: Arc<dyn Processor>,
    destination: Arc<dyn Destination>,
    history: Option<Arc<CommandInvoker>>,
}

impl Workflow {
    pub fn new(
        source: Arc<dyn Source>,
        processor: Arc<dyn Processor>,
        destination: Arc<dyn Destination>,
    ) -> Self {
        Self {
            label: "adhoc".to_string(),
            source,
            processor,
            destination,
            history: None,
        }
    }

    /// Route processing through commands recorded in `history`.
    pub fn with_history(mut self, history: Arc<CommandInvoker>) -> Self {
        self.history = Some(history);
        self
    }

    /// Name used in log fields, usually the workflow id.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// fetch_one → process → send_one. Any panic collapses to `false`.
    pub async fn run(&self) -> bool {
        self.execute_single().await.success
    }

    /// fetch_many → process_batch → send_one. Any panic collapses to `false`.
    pub async fn run_batch(&self, batch_size: usize) -> bool {
        self.execute_batch(batch_size).await.success
    }

    /// Single-message execution with a detailed result.
    pub async fn execute_single(&self) -> WorkflowExecutionResult {
        self.guarded(async {
            let message = self.source.fetch_one().await;
            if message.is_empty() {
                debug!(workflow = %self.label, "No new message");
                return WorkflowExecutionResult::success("No new messages", 0);
            }

            let processed = self.process_one(message).await;
            self.deliver(processed, 1).await
        })
        .await
    }

    /// Batch execution with a detailed result. The whole batch is
    /// consolidated and delivered as one message.
    pub async fn execute_batch(&self, batch_size: usize) -> WorkflowExecutionResult {
        self.guarded(async {
            let fetched: Vec<Message> = self
                .source
                .fetch_many(batch_size.max(1))
                .await
                .into_iter()
                .filter(|m| !m.is_empty())
                .collect();
            if fetched.is_empty() {
                debug!(workflow = %self.label, "No new messages");
                return WorkflowExecutionResult::success("No new messages", 0);
            }

            let count = fetched.len();
            let merged = self.process_merged(fetched).await;
            self.deliver(merged, count).await
        })
        .await
    }

    async fn process_one(&self, message: Message) -> Message {
        let Some(history) = &self.history else {
            return self.processor.process(&message).await;
        };
        let command = Arc::new(SingleMessageCommand::new(message, Arc::clone(&self.processor)));
        history.execute(command.clone()).await;
        command
            .result()
            .or_else(|| command.failure())
            .unwrap_or_else(|| Message::error(Platform::System, "processing did not complete"))
    }

    async fn process_merged(&self, messages: Vec<Message>) -> Message {
        let Some(history) = &self.history else {
            return self.processor.process_batch(&messages).await;
        };
        let command = Arc::new(ConsolidatedCommand::new(messages, Arc::clone(&self.processor)));
        history.execute(command.clone()).await;
        command
            .result()
            .or_else(|| command.failure())
            .unwrap_or_else(|| Message::error(Platform::System, "processing did not complete"))
    }

    async fn deliver(&self, message: Message, count: usize) -> WorkflowExecutionResult {
        let processing_error = message.error_reason().map(str::to_string);
        if !self.destination.send_one(&message).await {
            return WorkflowExecutionResult::failure(
                format!("Delivery to {} failed", self.destination.name()),
                "destination rejected the payload",
            );
        }

        info!(
            workflow = %self.label,
            destination = self.destination.name(),
            count,
            "Workflow delivered"
        );
        let mut result = WorkflowExecutionResult::success(format!("Delivered {count} message(s)"), count);
        // Delivered, but what arrived was an error notice.
        result.error = processing_error;
        result
    }

    async fn guarded<F>(&self, run: F) -> WorkflowExecutionResult
    where
        F: std::future::Future<Output = WorkflowExecutionResult>,
    {
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                warn!(workflow = %self.label, "Workflow execution panicked");
                WorkflowExecutionResult::failure("Workflow execution panicked", "panic")
            }
        }
    }
}

//! Command layer: reversible units of processing work with a bounded
//! undo history.
//!
//! Commands wrap *processing* only. Destination sends are irreversible
//! and stay outside undo.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::pipeline::consolidate::{Consolidation, consolidate};
use crate::pipeline::message::Message;
use crate::pipeline::traits::Processor;

/// Default history cap.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// A side-effecting action that can be reversed.
#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(&self) -> bool;

    async fn undo(&self) -> bool;

    /// Re-apply a command that was just undone. Rolls back a partial
    /// `undo_all`.
    async fn redo(&self) -> bool {
        self.execute().await
    }

    /// Short text for logs.
    fn description(&self) -> String;
}

/// Poison-tolerant lock for command state.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Single ──────────────────────────────────────────────────────────

#[derive(Default)]
struct SingleState {
    snapshot: Option<Message>,
    result: Option<Message>,
    failure: Option<Message>,
    /// Output set aside by the last `undo`.
    undone: Option<Message>,
}

/// Processes one message.
pub struct SingleMessageCommand {
    message: Message,
    processor: Arc<dyn Processor>,
    state: Mutex<SingleState>,
}

impl SingleMessageCommand {
    pub fn new(message: Message, processor: Arc<dyn Processor>) -> Self {
        Self {
            message,
            processor,
            state: Mutex::new(SingleState::default()),
        }
    }

    /// The processed output, present between `execute` and `undo`.
    pub fn result(&self) -> Option<Message> {
        lock(&self.state).result.clone()
    }

    /// The error-content output of the last failed execution.
    pub fn failure(&self) -> Option<Message> {
        lock(&self.state).failure.clone()
    }

    pub fn was_executed(&self) -> bool {
        lock(&self.state).result.is_some()
    }
}

#[async_trait]
impl Command for SingleMessageCommand {
    async fn execute(&self) -> bool {
        lock(&self.state).snapshot = Some(self.message.clone());

        let output = self.processor.process(&self.message).await;
        if output.processed() == Some(false) {
            debug!(id = %self.message.id, reason = ?output.error_reason(), "Single command processing failed");
            lock(&self.state).failure = Some(output);
            return false;
        }
        let mut state = lock(&self.state);
        state.result = Some(output);
        state.failure = None;
        state.undone = None;
        true
    }

    async fn undo(&self) -> bool {
        let mut state = lock(&self.state);
        let Some(result) = state.result.take() else {
            return false;
        };
        state.undone = Some(result);
        state.snapshot = None;
        true
    }

    async fn redo(&self) -> bool {
        let mut state = lock(&self.state);
        if state.result.is_some() {
            return true;
        }
        let Some(result) = state.undone.take() else {
            return false;
        };
        state.result = Some(result);
        state.snapshot = Some(self.message.clone());
        true
    }

    fn description(&self) -> String {
        format!("process message {}", self.message.id)
    }
}

// ── Consolidated ────────────────────────────────────────────────────

#[derive(Default)]
struct ConsolidatedState {
    consolidation: Option<Consolidation>,
    result: Option<Message>,
    failure: Option<Message>,
    undone: Option<(Consolidation, Message)>,
}

/// Consolidates N messages and runs the processor once on the merge.
pub struct ConsolidatedCommand {
    messages: Vec<Message>,
    processor: Arc<dyn Processor>,
    state: Mutex<ConsolidatedState>,
}

impl ConsolidatedCommand {
    pub fn new(messages: Vec<Message>, processor: Arc<dyn Processor>) -> Self {
        Self {
            messages,
            processor,
            state: Mutex::new(ConsolidatedState::default()),
        }
    }

    pub fn result(&self) -> Option<Message> {
        lock(&self.state).result.clone()
    }

    pub fn failure(&self) -> Option<Message> {
        lock(&self.state).failure.clone()
    }

    /// The raw transcript, kept for audit even when processing failed.
    pub fn transcript(&self) -> Option<Message> {
        lock(&self.state)
            .consolidation
            .as_ref()
            .map(|c| c.message.clone())
    }
}

#[async_trait]
impl Command for ConsolidatedCommand {
    async fn execute(&self) -> bool {
        let merged = {
            let mut state = lock(&self.state);
            if state.result.is_some() {
                // Retry after success is a no-op.
                return true;
            }
            let Some(consolidation) = consolidate(&self.messages) else {
                warn!("Consolidated command has no messages");
                return false;
            };
            let merged = consolidation.message.clone();
            state.consolidation = Some(consolidation);
            merged
        };

        let output = self.processor.process(&merged).await;
        if output.processed() == Some(false) {
            debug!(reason = ?output.error_reason(), "Consolidated processing failed");
            lock(&self.state).failure = Some(output);
            return false;
        }
        let mut state = lock(&self.state);
        state.result = Some(output);
        state.failure = None;
        state.undone = None;
        true
    }

    async fn undo(&self) -> bool {
        let mut state = lock(&self.state);
        if state.result.is_none() {
            return false;
        }
        let (Some(consolidation), Some(result)) = (state.consolidation.take(), state.result.take())
        else {
            return false;
        };
        *state = ConsolidatedState {
            undone: Some((consolidation, result)),
            ..ConsolidatedState::default()
        };
        true
    }

    async fn redo(&self) -> bool {
        let mut state = lock(&self.state);
        if state.result.is_some() {
            return true;
        }
        let Some((consolidation, result)) = state.undone.take() else {
            return false;
        };
        state.consolidation = Some(consolidation);
        state.result = Some(result);
        true
    }

    fn description(&self) -> String {
        format!("process {} messages as one", self.messages.len())
    }
}

// ── Batch of singles ────────────────────────────────────────────────

/// Runs independent single commands in order.
pub struct BatchCommand {
    commands: Vec<Arc<SingleMessageCommand>>,
    applied: Mutex<Vec<usize>>,
    undone: Mutex<Vec<usize>>,
}

impl BatchCommand {
    pub fn new(messages: Vec<Message>, processor: Arc<dyn Processor>) -> Self {
        Self {
            commands: messages
                .into_iter()
                .map(|m| Arc::new(SingleMessageCommand::new(m, Arc::clone(&processor))))
                .collect(),
            applied: Mutex::new(Vec::new()),
            undone: Mutex::new(Vec::new()),
        }
    }

    /// Per-message outputs in input order; `None` where processing failed.
    pub fn results(&self) -> Vec<Option<Message>> {
        self.commands.iter().map(|c| c.result()).collect()
    }

    pub fn success_count(&self) -> usize {
        lock(&self.applied).len()
    }
}

#[async_trait]
impl Command for BatchCommand {
    /// True when every sub-command succeeded.
    async fn execute(&self) -> bool {
        let mut applied = Vec::new();
        for (i, command) in self.commands.iter().enumerate() {
            if command.execute().await {
                applied.push(i);
            }
        }
        let all = applied.len() == self.commands.len();
        debug!(succeeded = applied.len(), total = self.commands.len(), "Batch command finished");
        *lock(&self.applied) = applied;
        all
    }

    async fn undo(&self) -> bool {
        let applied = lock(&self.applied).clone();
        let mut all = true;
        let mut remaining = Vec::new();
        let mut undone = Vec::new();
        for &i in applied.iter().rev() {
            if self.commands[i].undo().await {
                undone.push(i);
            } else {
                all = false;
                remaining.push(i);
            }
        }
        remaining.reverse();
        *lock(&self.applied) = remaining;
        *lock(&self.undone) = undone;
        all
    }

    async fn redo(&self) -> bool {
        let undone = std::mem::take(&mut *lock(&self.undone));
        let mut all = true;
        let mut restored = Vec::new();
        for &i in undone.iter().rev() {
            if self.commands[i].redo().await {
                restored.push(i);
            } else {
                all = false;
            }
        }
        let mut applied = lock(&self.applied);
        applied.extend(restored);
        applied.sort_unstable();
        all
    }

    fn description(&self) -> String {
        format!("process {} messages individually", self.commands.len())
    }
}

// ── Invoker ─────────────────────────────────────────────────────────

/// Executes commands and keeps a bounded, serialized undo history.
pub struct CommandInvoker {
    history: AsyncMutex<VecDeque<Arc<dyn Command>>>,
    cap: usize,
}

impl Default for CommandInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl CommandInvoker {
    pub fn new(cap: usize) -> Self {
        Self {
            history: AsyncMutex::new(VecDeque::new()),
            cap: cap.max(1),
        }
    }

    /// Run a command. Successful commands join the history; panics count
    /// as failure.
    pub async fn execute(&self, command: Arc<dyn Command>) -> bool {
        let ok = match AssertUnwindSafe(command.execute()).catch_unwind().await {
            Ok(ok) => ok,
            Err(_) => {
                warn!(command = %command.description(), "Command panicked");
                false
            }
        };
        if !ok {
            return false;
        }

        let mut history = self.history.lock().await;
        history.push_back(command);
        while history.len() > self.cap {
            if let Some(evicted) = history.pop_front() {
                debug!(command = %evicted.description(), "Evicted from command history");
            }
        }
        true
    }

    /// Undo the newest command. A failed undo puts it back.
    pub async fn undo_last(&self) -> bool {
        let mut history = self.history.lock().await;
        let Some(command) = history.pop_back() else {
            return false;
        };
        if guarded_undo(command.as_ref()).await {
            info!(command = %command.description(), "Command undone");
            true
        } else {
            warn!(command = %command.description(), "Undo failed; keeping command in history");
            history.push_back(command);
            false
        }
    }

    /// Undo everything newest first. History is cleared only when every
    /// undo succeeds. On failure the commands already undone in this pass
    /// are re-applied, so history and command state are as they were.
    pub async fn undo_all(&self) -> bool {
        let mut history = self.history.lock().await;
        let mut undone: Vec<&Arc<dyn Command>> = Vec::new();
        for command in history.iter().rev() {
            if guarded_undo(command.as_ref()).await {
                undone.push(command);
                continue;
            }
            warn!(command = %command.description(), "Undo failed; rolling back");
            for done in undone.iter().rev() {
                if !guarded_redo(done.as_ref()).await {
                    warn!(command = %done.description(), "Redo failed during rollback");
                }
            }
            return false;
        }
        history.clear();
        true
    }

    pub async fn len(&self) -> usize {
        self.history.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.history.lock().await.is_empty()
    }

    /// Descriptions oldest first.
    pub async fn descriptions(&self) -> Vec<String> {
        self.history
            .lock()
            .await
            .iter()
            .map(|c| c.description())
            .collect()
    }
}

async fn guarded_undo(command: &dyn Command) -> bool {
    AssertUnwindSafe(command.undo())
        .catch_unwind()
        .await
        .unwrap_or(false)
}

async fn guarded_redo(command: &dyn Command) -> bool {
    AssertUnwindSafe(command.redo())
        .catch_unwind()
        .await
        .unwrap_or(false)
}

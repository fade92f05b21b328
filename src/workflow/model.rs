//! Persisted workflow definitions and per-run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, WorkflowError};
use crate::pipeline::factory::{DestinationConfig, SourceConfig};
use crate::pipeline::formatter::FormatterStrategy;

/// Interval floor; shorter schedules would hammer remote APIs.
pub const MIN_INTERVAL_SECS: u64 = 60;

/// Interval ceiling of 30 days. Keeps timer deadlines and the stored
/// `INTEGER` column in range.
pub const MAX_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

/// Batch size when a workflow asks for batching without a size.
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Which source feeds which destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    EmailToTelegram,
    TelegramToEmail,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailToTelegram => "EMAIL_TO_TELEGRAM",
            Self::TelegramToEmail => "TELEGRAM_TO_EMAIL",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single message per tick, or a consolidated batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Single,
    Batch {
        #[serde(default = "default_batch_size")]
        size: usize,
    },
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Concrete parameters for each workflow type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowConfiguration {
    EmailToTelegram {
        /// Empty accepts every sender.
        #[serde(default)]
        allowed_senders: Vec<String>,
        chat_id: String,
        #[serde(default)]
        prompt_template: String,
        #[serde(default)]
        processing: ProcessingMode,
        #[serde(default)]
        formatter: FormatterStrategy,
    },
    TelegramToEmail {
        #[serde(default)]
        source_chat_id: Option<String>,
        #[serde(default)]
        allowed_users: Vec<String>,
        to: String,
        #[serde(default)]
        prompt_template: String,
        #[serde(default)]
        processing: ProcessingMode,
        #[serde(default)]
        formatter: FormatterStrategy,
    },
}

impl WorkflowConfiguration {
    pub fn workflow_type(&self) -> WorkflowType {
        match self {
            Self::EmailToTelegram { .. } => WorkflowType::EmailToTelegram,
            Self::TelegramToEmail { .. } => WorkflowType::TelegramToEmail,
        }
    }

    pub fn source(&self) -> SourceConfig {
        match self {
            Self::EmailToTelegram {
                allowed_senders, ..
            } => SourceConfig::Email {
                allowed_senders: allowed_senders.clone(),
            },
            Self::TelegramToEmail {
                source_chat_id,
                allowed_users,
                ..
            } => SourceConfig::Telegram {
                chat_id: source_chat_id.clone(),
                allowed_users: allowed_users.clone(),
            },
        }
    }

    pub fn destination(&self) -> DestinationConfig {
        match self {
            Self::EmailToTelegram { chat_id, .. } => DestinationConfig::Telegram {
                chat_id: chat_id.clone(),
            },
            Self::TelegramToEmail { to, .. } => DestinationConfig::Email { to: to.clone() },
        }
    }

    pub fn prompt_template(&self) -> &str {
        match self {
            Self::EmailToTelegram {
                prompt_template, ..
            }
            | Self::TelegramToEmail {
                prompt_template, ..
            } => prompt_template,
        }
    }

    pub fn processing(&self) -> ProcessingMode {
        match self {
            Self::EmailToTelegram { processing, .. } | Self::TelegramToEmail { processing, .. } => {
                *processing
            }
        }
    }

    pub fn formatter(&self) -> FormatterStrategy {
        match self {
            Self::EmailToTelegram { formatter, .. } | Self::TelegramToEmail { formatter, .. } => {
                *formatter
            }
        }
    }

    /// Construction-time checks: target present, batch size sane, no
    /// custom formatter (persisted workflows cannot carry one).
    pub fn validate(&self) -> Result<(), WorkflowError> {
        self.destination().validate()?;
        if let ProcessingMode::Batch { size } = self.processing()
            && size == 0
        {
            return Err(ConfigError::invalid("processing.size", "must be at least 1").into());
        }
        if self.formatter() == FormatterStrategy::Custom {
            return Err(ConfigError::invalid(
                "formatter",
                "CUSTOM is only available to programmatic builders",
            )
            .into());
        }
        Ok(())
    }
}

/// A stored automation.
///
/// `is_running` and `last_run_at` belong to the runner and supervisor;
/// edits through `apply_update` never touch them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub configuration: WorkflowConfiguration,
    pub interval_secs: u64,
    pub is_running: bool,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// User-editable fields of a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub configuration: WorkflowConfiguration,
    pub interval_secs: u64,
}

impl WorkflowDefinition {
    /// Validate and create a stopped workflow with a fresh id.
    pub fn new(spec: WorkflowSpec) -> Result<Self, WorkflowError> {
        validate_spec(&spec)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name.trim().to_string(),
            workflow_type: spec.configuration.workflow_type(),
            configuration: spec.configuration,
            interval_secs: spec.interval_secs,
            is_running: false,
            created_at: Utc::now(),
            last_run_at: None,
        })
    }

    /// Replace the user-editable fields. The id is stable across edits.
    pub fn apply_update(&mut self, spec: WorkflowSpec) -> Result<(), WorkflowError> {
        validate_spec(&spec)?;
        self.name = spec.name.trim().to_string();
        self.workflow_type = spec.configuration.workflow_type();
        self.configuration = spec.configuration;
        self.interval_secs = spec.interval_secs;
        Ok(())
    }

    /// Check a loaded definition for consistency.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.configuration.workflow_type() != self.workflow_type {
            return Err(WorkflowError::TypeMismatch {
                id: self.id.clone(),
                expected: self.workflow_type.to_string(),
            });
        }
        self.configuration.validate()
    }

    /// Interval clamped to the floor, for rows written before validation
    /// existed or edited by hand.
    pub fn effective_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.interval_secs
                .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS),
        )
    }
}

/// Reject intervals outside `MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS`.
pub fn check_interval(secs: u64) -> Result<(), WorkflowError> {
    if secs < MIN_INTERVAL_SECS {
        return Err(WorkflowError::IntervalTooShort {
            secs,
            min: MIN_INTERVAL_SECS,
        });
    }
    if secs > MAX_INTERVAL_SECS {
        return Err(WorkflowError::IntervalTooLong {
            secs,
            max: MAX_INTERVAL_SECS,
        });
    }
    Ok(())
}

fn validate_spec(spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    if spec.name.trim().is_empty() {
        return Err(ConfigError::missing("name", "workflows need a name").into());
    }
    check_interval(spec.interval_secs)?;
    spec.configuration.validate()
}

/// Outcome of one workflow execution. Not persisted beyond `last_run_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowExecutionResult {
    pub success: bool,
    pub message: String,
    pub processed_count: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecutionResult {
    pub fn success(message: impl Into<String>, processed_count: usize) -> Self {
        Self {
            success: true,
            message: message.into(),
            processed_count,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            processed_count: 0,
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}

//! The standardized message that flows through every workflow.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known metadata keys.
pub mod keys {
    pub const PLATFORM: &str = "platform";
    pub const PROCESSED: &str = "processed";
    pub const ERROR: &str = "error";
    pub const EMPTY: &str = "empty";
    pub const SUBJECT: &str = "subject";
    pub const SOURCE_ID: &str = "source_id";
    pub const CONSOLIDATED: &str = "consolidated";
    pub const MESSAGE_COUNT: &str = "message_count";
    pub const PARTICIPANTS: &str = "participants";
    pub const TIME_RANGE: &str = "time_range";
}

/// Origin of a message, stored in the `platform` metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Email,
    Telegram,
    Consolidated,
    System,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Telegram => "telegram",
            Self::Consolidated => "consolidated",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable message value.
///
/// Sources create messages, processors derive new ones (never mutate), and
/// destinations consume them. `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// Create a message tagged with its platform.
    pub fn new(
        id: impl Into<String>,
        platform: Platform,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(keys::PLATFORM.to_string(), platform.as_str().to_string());
        Self {
            id: id.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            timestamp,
            metadata,
        }
    }

    /// Add a metadata entry (builder style).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The "nothing available" sentinel returned by sources instead of an error.
    pub fn empty(platform: Platform) -> Self {
        Self::new(
            format!("empty-{}", Uuid::new_v4()),
            platform,
            "",
            "",
            "",
            now_millis(),
        )
        .with_metadata(keys::EMPTY, "true")
    }

    /// An error-content message. Carries `processed=false` so destinations
    /// can still deliver (or discard) something visible.
    pub fn error(platform: Platform, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            format!("error-{}", Uuid::new_v4()),
            platform,
            "relayflow",
            "",
            format!("Error: {reason}"),
            now_millis(),
        )
        .with_metadata(keys::PROCESSED, "false")
        .with_metadata(keys::ERROR, reason)
    }

    /// Derive a processed copy carrying new content.
    pub fn derive(&self, content: impl Into<String>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert(keys::PROCESSED.to_string(), "true".to_string());
        metadata.insert(keys::SOURCE_ID.to_string(), self.id.clone());
        metadata.remove(keys::ERROR);
        Self {
            id: format!("processed-{}", self.id),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            content: content.into(),
            timestamp: self.timestamp,
            metadata,
        }
    }

    /// Derive an error copy of this message: keeps the routing fields and
    /// metadata, replaces the content with the failure text.
    pub fn derive_error(&self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut derived = self.derive(format!("Error: {reason}"));
        derived
            .metadata
            .insert(keys::PROCESSED.to_string(), "false".to_string());
        derived.metadata.insert(keys::ERROR.to_string(), reason);
        derived
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn platform(&self) -> &str {
        self.meta(keys::PLATFORM).unwrap_or("unknown")
    }

    pub fn is_empty(&self) -> bool {
        self.meta(keys::EMPTY) == Some("true")
    }

    pub fn is_consolidated(&self) -> bool {
        self.meta(keys::CONSOLIDATED) == Some("true")
    }

    /// `Some(false)` when a processor recorded a failure.
    pub fn processed(&self) -> Option<bool> {
        self.meta(keys::PROCESSED).map(|v| v == "true")
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.meta(keys::ERROR)
    }

    pub fn subject(&self) -> Option<&str> {
        self.meta(keys::SUBJECT)
    }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render epoch millis as `YYYY-MM-DD HH:MM:SS` UTC.
pub fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

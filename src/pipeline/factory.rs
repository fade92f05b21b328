//! Source and destination factories.
//!
//! Persisted workflows carry typed `SourceConfig`/`DestinationConfig`
//! values. The string-keyed `create(kind, map)` entry points exist for
//! loosely typed callers and convert to the typed form first.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channels::email::{EmailDestination, EmailSource, MailSender, Mailbox};
use crate::channels::telegram::{BotApi, TelegramDestination, TelegramSource};
use crate::error::ConfigError;
use crate::pipeline::formatter::{Formatter, FormatterStrategy, resolve_formatter};
use crate::pipeline::traits::{Destination, Source};
use crate::store::WorkflowStore;

/// Destination families, each with its own default formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Email,
    Telegram,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Telegram => "telegram",
        }
    }
}

impl std::str::FromStr for DestinationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" | "gmail" => Ok(Self::Email),
            "telegram" => Ok(Self::Telegram),
            other => Err(unsupported("destination", other)),
        }
    }
}

/// Typed source parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Email {
        /// Empty accepts every sender.
        #[serde(default)]
        allowed_senders: Vec<String>,
    },
    Telegram {
        /// Restrict to one chat.
        #[serde(default)]
        chat_id: Option<String>,
        #[serde(default)]
        allowed_users: Vec<String>,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Email { .. } => "email",
            Self::Telegram { .. } => "telegram",
        }
    }

    /// Parse a string-keyed map. Lists are comma separated.
    pub fn from_map(kind: &str, config: &HashMap<String, String>) -> Result<Self, ConfigError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "email" | "gmail" => Ok(Self::Email {
                allowed_senders: list(config, "allowed_senders"),
            }),
            "telegram" => Ok(Self::Telegram {
                chat_id: non_empty(config, "chat_id"),
                allowed_users: list(config, "allowed_users"),
            }),
            other => Err(unsupported("source", other)),
        }
    }
}

/// Typed destination parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    Email { to: String },
    Telegram { chat_id: String },
}

impl DestinationConfig {
    pub fn kind(&self) -> DestinationKind {
        match self {
            Self::Email { .. } => DestinationKind::Email,
            Self::Telegram { .. } => DestinationKind::Telegram,
        }
    }

    pub fn from_map(kind: &str, config: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let parsed = match kind.parse::<DestinationKind>()? {
            DestinationKind::Email => Self::Email {
                to: non_empty(config, "to")
                    .ok_or_else(|| ConfigError::missing("to", "email destinations need a recipient"))?,
            },
            DestinationKind::Telegram => Self::Telegram {
                chat_id: non_empty(config, "chat_id").ok_or_else(|| {
                    ConfigError::missing("chat_id", "telegram destinations need a chat id")
                })?,
            },
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject blank targets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Email { to } if !to.contains('@') => {
                Err(ConfigError::invalid("to", format!("not an email address: {to}")))
            }
            Self::Telegram { chat_id } if chat_id.trim().is_empty() => {
                Err(ConfigError::missing("chat_id", "telegram destinations need a chat id"))
            }
            _ => Ok(()),
        }
    }
}

fn unsupported(kind: &str, value: &str) -> ConfigError {
    ConfigError::UnsupportedType {
        kind: kind.into(),
        value: value.into(),
    }
}

fn non_empty(config: &HashMap<String, String>, key: &str) -> Option<String> {
    config
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn list(config: &HashMap<String, String>, key: &str) -> Vec<String> {
    config
        .get(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn backend_missing(kind: &str, env: &str) -> ConfigError {
    ConfigError::missing(env, format!("the {kind} backend is not configured"))
}

/// Builds sources over the configured backends.
#[derive(Clone, Default)]
pub struct SourceFactory {
    mailbox: Option<Arc<dyn Mailbox>>,
    bot: Option<Arc<dyn BotApi>>,
    settings: Option<Arc<dyn WorkflowStore>>,
}

impl SourceFactory {
    pub fn new(mailbox: Option<Arc<dyn Mailbox>>, bot: Option<Arc<dyn BotApi>>) -> Self {
        Self {
            mailbox,
            bot,
            settings: None,
        }
    }

    /// Settings store for source cursors such as the Telegram offset.
    pub fn with_settings(mut self, settings: Arc<dyn WorkflowStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Create a source from a type name and string-keyed config.
    pub fn create(
        &self,
        kind: &str,
        config: &HashMap<String, String>,
    ) -> Result<Arc<dyn Source>, ConfigError> {
        self.create_from_config(&SourceConfig::from_map(kind, config)?)
    }

    pub fn create_from_config(&self, config: &SourceConfig) -> Result<Arc<dyn Source>, ConfigError> {
        match config {
            SourceConfig::Email { allowed_senders } => {
                let mailbox = self
                    .mailbox
                    .clone()
                    .ok_or_else(|| backend_missing("email", "EMAIL_IMAP_HOST"))?;
                Ok(Arc::new(EmailSource::new(mailbox, allowed_senders.clone())))
            }
            SourceConfig::Telegram {
                chat_id,
                allowed_users,
            } => {
                let bot = self
                    .bot
                    .clone()
                    .ok_or_else(|| backend_missing("telegram", "TELEGRAM_BOT_TOKEN"))?;
                let mut source = TelegramSource::new(bot, chat_id.clone(), allowed_users.clone());
                if let Some(settings) = &self.settings {
                    source = source.with_settings(Arc::clone(settings));
                }
                Ok(Arc::new(source))
            }
        }
    }
}

/// Builds destinations over the configured backends.
#[derive(Clone, Default)]
pub struct DestinationFactory {
    mail_sender: Option<Arc<dyn MailSender>>,
    bot: Option<Arc<dyn BotApi>>,
}

impl DestinationFactory {
    pub fn new(mail_sender: Option<Arc<dyn MailSender>>, bot: Option<Arc<dyn BotApi>>) -> Self {
        Self { mail_sender, bot }
    }

    /// Create a destination from a type name and string-keyed config.
    /// An optional `formatter` key picks the strategy; it defaults to the
    /// destination's own formatter.
    pub fn create(
        &self,
        kind: &str,
        config: &HashMap<String, String>,
    ) -> Result<Arc<dyn Destination>, ConfigError> {
        let destination = DestinationConfig::from_map(kind, config)?;
        let strategy = config
            .get("formatter")
            .map(|s| FormatterStrategy::parse(s))
            .transpose()?
            .unwrap_or_default();
        self.create_from_config(&destination, strategy, None)
    }

    pub fn create_from_config(
        &self,
        config: &DestinationConfig,
        strategy: FormatterStrategy,
        custom: Option<Arc<dyn Formatter>>,
    ) -> Result<Arc<dyn Destination>, ConfigError> {
        let formatter = resolve_formatter(strategy, config.kind(), custom)?;
        self.create_with_formatter(config, formatter)
    }

    pub fn create_with_formatter(
        &self,
        config: &DestinationConfig,
        formatter: Arc<dyn Formatter>,
    ) -> Result<Arc<dyn Destination>, ConfigError> {
        config.validate()?;
        match config {
            DestinationConfig::Email { to } => {
                let sender = self
                    .mail_sender
                    .clone()
                    .ok_or_else(|| backend_missing("email", "EMAIL_SMTP_HOST"))?;
                Ok(Arc::new(EmailDestination::new(sender, to.clone(), formatter)))
            }
            DestinationConfig::Telegram { chat_id } => {
                let bot = self
                    .bot
                    .clone()
                    .ok_or_else(|| backend_missing("telegram", "TELEGRAM_BOT_TOKEN"))?;
                Ok(Arc::new(TelegramDestination::new(bot, chat_id.clone(), formatter)))
            }
        }
    }
}

//! Telegram adapter over the Bot API.
//!
//! `TelegramSource` polls `getUpdates` with a remembered offset so each
//! update is consumed once; `TelegramDestination` posts to a fixed chat.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::error::{ChannelError, ConfigError, PipelineError};
use crate::pipeline::formatter::Formatter;
use crate::pipeline::message::{Message, Platform};
use crate::pipeline::traits::{Destination, Source, fetched_or_empty};
use crate::store::WorkflowStore;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Settings key holding the next `getUpdates` offset. Confirmation is
/// per bot, so every source over the same bot shares it.
pub const UPDATE_OFFSET_KEY: &str = "telegram.update_offset";

/// Metadata key for the originating chat.
pub const CHAT_ID: &str = "chat_id";

/// Metadata key for the sender's @username, when present.
pub const USERNAME: &str = "username";

// ── Configuration ───────────────────────────────────────────────────

/// Bot configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
}

impl TelegramConfig {
    /// Build config from `TELEGRAM_*` variables.
    /// Returns `Ok(None)` when `TELEGRAM_BOT_TOKEN` is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") else {
            return Ok(None);
        };
        if token.trim().is_empty() {
            return Err(ConfigError::invalid("TELEGRAM_BOT_TOKEN", "must not be empty"));
        }

        Ok(Some(Self {
            bot_token: SecretString::from(token),
        }))
    }
}

// ── Bot API seam ────────────────────────────────────────────────────

/// A text message extracted from an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message_id: i64,
    pub chat_id: String,
    /// Numeric user id as a string.
    pub user_id: String,
    pub username: Option<String>,
    /// First name, falling back to the username.
    pub display_name: String,
    pub text: String,
    /// Epoch seconds as reported by Telegram.
    pub date: i64,
}

/// One entry from `getUpdates`. Non-text updates carry no message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<ChatMessage>,
}

#[async_trait]
pub trait BotApi: Send + Sync {
    /// Updates with id >= `offset`. Updates below it are confirmed and
    /// dropped by the server.
    async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>, ChannelError>;

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;
}

/// HTTP client for the Bot API.
pub struct TelegramBotApi {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramBotApi {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    /// Send a single chunk (≤4096 chars), Markdown first with plain fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(send_failed(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            )));
        }

        Ok(())
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason,
    }
}

fn fetch_failed(reason: String) -> ChannelError {
    ChannelError::FetchFailed {
        name: "telegram".into(),
        reason,
    }
}

#[async_trait]
impl BotApi for TelegramBotApi {
    async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>, ChannelError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message"]
        });

        let resp = self
            .client
            .post(self.api_url("getUpdates"))
            .json(&body)
            .timeout(timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChannelError::AuthFailed {
                name: "telegram".into(),
                reason: "bot token rejected".into(),
            });
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| fetch_failed(e.to_string()))?;
        if data.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            let description = data
                .get("description")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            return Err(fetch_failed(description.to_string()));
        }

        Ok(parse_updates(&data))
    }

    /// Splits long text to respect Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        tracing::debug!(chat_id = %chat_id, "Telegram message sent");
        Ok(())
    }
}

/// Extract updates from a `getUpdates` response body.
fn parse_updates(data: &serde_json::Value) -> Vec<Update> {
    let Some(results) = data.get("result").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|update| {
            let update_id = update.get("update_id").and_then(serde_json::Value::as_i64)?;
            Some(Update {
                update_id,
                message: update.get("message").and_then(parse_chat_message),
            })
        })
        .collect()
}

fn parse_chat_message(message: &serde_json::Value) -> Option<ChatMessage> {
    let text = message.get("text").and_then(serde_json::Value::as_str)?;
    let from = message.get("from");

    let username = from
        .and_then(|f| f.get("username"))
        .and_then(serde_json::Value::as_str)
        .map(String::from);
    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let display_name = from
        .and_then(|f| f.get("first_name"))
        .and_then(serde_json::Value::as_str)
        .map(String::from)
        .or_else(|| username.clone())
        .unwrap_or_else(|| "unknown".to_string());

    Some(ChatMessage {
        message_id: message
            .get("message_id")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default(),
        chat_id: message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(serde_json::Value::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_default(),
        user_id,
        username,
        display_name,
        text: text.to_string(),
        date: message
            .get("date")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default(),
    })
}

// ── Source / Destination ────────────────────────────────────────────

/// Reads bot messages as workflow input.
pub struct TelegramSource {
    bot: Arc<dyn BotApi>,
    /// Only messages from this chat, when set.
    chat_id: Option<String>,
    allowed_users: Vec<String>,
    /// Next update id to request; `None` until loaded from settings.
    offset: Mutex<Option<i64>>,
    settings: Option<Arc<dyn WorkflowStore>>,
}

impl TelegramSource {
    pub fn new(bot: Arc<dyn BotApi>, chat_id: Option<String>, allowed_users: Vec<String>) -> Self {
        Self {
            bot,
            chat_id,
            allowed_users,
            offset: Mutex::new(None),
            settings: None,
        }
    }

    /// Persist the update offset so a restart does not replay the last
    /// batch.
    pub fn with_settings(mut self, settings: Arc<dyn WorkflowStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    async fn load_offset(&self) -> i64 {
        let Some(settings) = &self.settings else {
            return 0;
        };
        match settings.get_setting(UPDATE_OFFSET_KEY).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "Ignoring malformed stored Telegram offset");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load Telegram offset");
                0
            }
        }
    }

    async fn save_offset(&self, offset: i64) {
        if let Some(settings) = &self.settings
            && let Err(e) = settings.set_setting(UPDATE_OFFSET_KEY, &offset.to_string()).await
        {
            tracing::warn!(error = %e, offset, "Could not persist Telegram offset");
        }
    }

    fn accepts(&self, message: &ChatMessage) -> bool {
        if let Some(chat) = &self.chat_id
            && chat != &message.chat_id
        {
            return false;
        }
        if self.allowed_users.is_empty() {
            return true;
        }
        let mut identities = vec![message.user_id.as_str()];
        if let Some(username) = message.username.as_deref() {
            identities.push(username);
        }
        check_user_allowed(&self.allowed_users, identities)
    }

    async fn poll(&self, count: usize) -> Result<Vec<Message>, ChannelError> {
        // Held across the request so concurrent polls never share an offset.
        let mut stored = self.offset.lock().await;
        let start = match *stored {
            Some(offset) => offset,
            None => self.load_offset().await,
        };
        let updates = self.bot.get_updates(start, Duration::ZERO).await?;
        let mut offset = start;

        let mut messages = Vec::new();
        for update in updates {
            if messages.len() >= count {
                // Leave the rest unconfirmed for the next tick.
                break;
            }
            offset = offset.max(update.update_id + 1);
            let Some(chat) = update.message else {
                continue;
            };
            if !self.accepts(&chat) {
                tracing::warn!(user_id = %chat.user_id, "Ignoring message from unauthorized user");
                continue;
            }
            messages.push(to_message(chat));
        }
        *stored = Some(offset);
        if offset != start {
            self.save_offset(offset).await;
        }
        Ok(messages)
    }
}

fn to_message(chat: ChatMessage) -> Message {
    let mut message = Message::new(
        format!("telegram-{}-{}", chat.chat_id, chat.message_id),
        Platform::Telegram,
        chat.display_name,
        "bot",
        chat.text,
        chat.date * 1000,
    )
    .with_metadata(CHAT_ID, chat.chat_id);
    if let Some(username) = chat.username {
        message = message.with_metadata(USERNAME, username);
    }
    message
}

#[async_trait]
impl Source for TelegramSource {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn fetch_one(&self) -> Message {
        self.fetch_many(1)
            .await
            .pop()
            .unwrap_or_else(|| Message::empty(Platform::Telegram))
    }

    async fn fetch_many(&self, count: usize) -> Vec<Message> {
        let result = self.poll(count.max(1)).await.map_err(PipelineError::from);
        fetched_or_empty(self.name(), Platform::Telegram, result)
    }
}

/// Delivers formatted payloads to one chat.
pub struct TelegramDestination {
    bot: Arc<dyn BotApi>,
    chat_id: String,
    formatter: Arc<dyn Formatter>,
}

impl TelegramDestination {
    pub fn new(bot: Arc<dyn BotApi>, chat_id: impl Into<String>, formatter: Arc<dyn Formatter>) -> Self {
        Self {
            bot,
            chat_id: chat_id.into(),
            formatter,
        }
    }
}

#[async_trait]
impl Destination for TelegramDestination {
    fn name(&self) -> &str {
        "telegram"
    }

    fn formatter(&self) -> &dyn Formatter {
        self.formatter.as_ref()
    }

    async fn deliver(&self, payload: &str) -> Result<(), ChannelError> {
        self.bot.send_message(&self.chat_id, payload).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Split a message into chunks that fit Telegram's character limit,
/// preferring newline then space boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&at| at > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::pipeline::formatter::TelegramFormatter;
    use crate::store::memory::MemoryStore;

    /// Bot that serves queued updates and records sends.
    #[derive(Default)]
    struct FakeBot {
        updates: StdMutex<Vec<Update>>,
        offsets: StdMutex<Vec<i64>>,
        sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl BotApi for FakeBot {
        async fn get_updates(&self, offset: i64, _timeout: Duration) -> Result<Vec<Update>, ChannelError> {
            self.offsets.lock().unwrap().push(offset);
            let mut updates = self.updates.lock().unwrap();
            updates.retain(|u| u.update_id >= offset);
            Ok(updates.clone())
        }

        async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push((chat_id.into(), text.into()));
            Ok(())
        }
    }

    fn update(id: i64, user: &str, text: &str) -> Update {
        Update {
            update_id: id,
            message: Some(ChatMessage {
                message_id: id * 10,
                chat_id: "42".into(),
                user_id: format!("{id}00"),
                username: Some(user.into()),
                display_name: user.into(),
                text: text.into(),
                date: 1_700_000_000 + id,
            }),
        }
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let chunks = split_message(&"a".repeat(5000), 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let chunks = split_message(&"é".repeat(3000), 4096);
        assert_eq!(chunks.concat(), "é".repeat(3000));
        assert!(chunks.iter().all(|c| c.len() <= 4096));
    }

    #[test]
    fn parse_updates_extracts_text_messages() {
        let data = serde_json::json!({
            "ok": true,
            "result": [
                {"update_id": 7, "message": {
                    "message_id": 3, "date": 1700000000, "text": "hi",
                    "chat": {"id": 99}, "from": {"id": 5, "first_name": "Ann", "username": "ann"}
                }},
                {"update_id": 8, "edited_message": {}}
            ]
        });
        let updates = parse_updates(&data);
        assert_eq!(updates.len(), 2);
        let msg = updates[0].message.as_ref().unwrap();
        assert_eq!(msg.chat_id, "99");
        assert_eq!(msg.display_name, "Ann");
        assert!(updates[1].message.is_none());
    }

    #[tokio::test]
    async fn source_advances_offset_and_leaves_overflow() {
        let bot = Arc::new(FakeBot::default());
        *bot.updates.lock().unwrap() = vec![update(1, "ann", "a"), update(2, "bob", "b"), update(3, "ann", "c")];
        let source = TelegramSource::new(bot.clone(), None, vec![]);

        let first = source.fetch_many(2).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].content, "a");
        assert_eq!(first[0].timestamp, 1_700_000_001_000);
        assert_eq!(first[0].meta(CHAT_ID), Some("42"));

        let second = source.fetch_many(2).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "c");

        let third = source.fetch_many(2).await;
        assert!(third[0].is_empty());
        assert_eq!(*bot.offsets.lock().unwrap(), vec![0, 3, 4]);
    }

    #[tokio::test]
    async fn offset_survives_a_new_source() {
        let bot = Arc::new(FakeBot::default());
        let settings = Arc::new(MemoryStore::default());
        *bot.updates.lock().unwrap() = vec![update(5, "ann", "a"), update(6, "bob", "b")];

        let first = TelegramSource::new(bot.clone(), None, vec![]).with_settings(settings.clone());
        assert_eq!(first.fetch_many(5).await.len(), 2);
        assert_eq!(
            settings.get_setting(UPDATE_OFFSET_KEY).await.unwrap().as_deref(),
            Some("7")
        );

        // A restarted process starts where the last one stopped.
        let second = TelegramSource::new(bot.clone(), None, vec![]).with_settings(settings);
        assert!(second.fetch_many(5).await[0].is_empty());
        assert_eq!(*bot.offsets.lock().unwrap(), vec![0, 7]);
    }

    #[tokio::test]
    async fn source_filters_unauthorized_users() {
        let bot = Arc::new(FakeBot::default());
        *bot.updates.lock().unwrap() = vec![update(1, "ann", "a"), update(2, "eve", "b")];
        let source = TelegramSource::new(bot, None, vec!["ann".into()]);

        let msgs = source.fetch_many(5).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].sender, "ann");
    }

    #[tokio::test]
    async fn destination_sends_formatted_payload() {
        let bot = Arc::new(FakeBot::default());
        let dest = TelegramDestination::new(bot.clone(), "42", Arc::new(TelegramFormatter));
        let msg = Message::new("m", Platform::Email, "ann", "me", "hello", 0);

        assert!(dest.send_one(&msg).await);
        let sent = bot.sent.lock().unwrap();
        assert_eq!(sent[0].0, "42");
        assert!(sent[0].1.contains("hello"));
    }
}

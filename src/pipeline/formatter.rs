//! Formatter strategy: renders messages into destination payloads.
//!
//! Each destination kind owns a default formatter. Email gets a subject
//! line plus an HTML body; Telegram gets compact Markdown.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::factory::DestinationKind;
use crate::pipeline::message::{Message, format_millis, keys};

/// Renders one message or a batch into a single payload string.
pub trait Formatter: Send + Sync {
    /// Formatter name for logging.
    fn name(&self) -> &str;

    fn format_one(&self, message: &Message) -> String;

    fn format_batch(&self, messages: &[Message]) -> String;
}

/// How a workflow picks its formatter at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormatterStrategy {
    /// The destination's default formatter.
    #[default]
    Auto,
    /// Force the email formatter regardless of destination.
    GmailFormat,
    /// Force the Telegram formatter regardless of destination.
    TelegramFormat,
    /// Use an injected formatter.
    Custom,
}

impl FormatterStrategy {
    /// Parse the config-map spelling (`auto`, `gmail`, `telegram`, `custom`).
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "gmail" | "gmail_format" | "email" => Ok(Self::GmailFormat),
            "telegram" | "telegram_format" => Ok(Self::TelegramFormat),
            "custom" => Ok(Self::Custom),
            other => Err(ConfigError::UnsupportedType {
                kind: "formatter".into(),
                value: other.into(),
            }),
        }
    }
}

/// Resolve the concrete formatter for a destination.
pub fn resolve_formatter(
    strategy: FormatterStrategy,
    destination: DestinationKind,
    custom: Option<Arc<dyn Formatter>>,
) -> Result<Arc<dyn Formatter>, ConfigError> {
    match strategy {
        FormatterStrategy::Auto => Ok(default_formatter(destination)),
        FormatterStrategy::GmailFormat => Ok(Arc::new(EmailFormatter)),
        FormatterStrategy::TelegramFormat => Ok(Arc::new(TelegramFormatter)),
        FormatterStrategy::Custom => custom.ok_or_else(|| {
            ConfigError::missing(
                "formatter",
                "CUSTOM formatter strategy requires an injected formatter",
            )
        }),
    }
}

/// Default formatter for a destination kind.
pub fn default_formatter(destination: DestinationKind) -> Arc<dyn Formatter> {
    match destination {
        DestinationKind::Email => Arc::new(EmailFormatter),
        DestinationKind::Telegram => Arc::new(TelegramFormatter),
    }
}

// ── Email ───────────────────────────────────────────────────────────

/// Structured rich-text formatter for email destinations.
///
/// Output starts with a `Subject: ...` line followed by an HTML body;
/// the email destination splits the two.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailFormatter;

impl Formatter for EmailFormatter {
    fn name(&self) -> &str {
        "email"
    }

    fn format_one(&self, message: &Message) -> String {
        let subject = message
            .subject()
            .map(|s| format!("[relayflow] {s}"))
            .unwrap_or_else(|| format!("[relayflow] Message from {}", display_sender(message)));

        let mut html = String::from("<div style=\"font-family:sans-serif\">\n");
        if message.processed() == Some(false) {
            html.push_str("<p style=\"color:#b00020\"><b>Processing failed</b></p>\n");
        }
        html.push_str(&format!(
            "<p><b>From:</b> {}<br><b>Received:</b> {} UTC</p>\n<hr>\n",
            escape_html(display_sender(message)),
            format_millis(message.timestamp),
        ));
        html.push_str(&format!("<div>{}</div>\n", html_paragraphs(&message.content)));
        html.push_str("</div>");

        format!("Subject: {subject}\n{html}")
    }

    fn format_batch(&self, messages: &[Message]) -> String {
        let subject = format!("[relayflow] Digest of {} messages", messages.len());

        let mut html = String::from("<div style=\"font-family:sans-serif\">\n<ol>\n");
        for message in messages {
            html.push_str(&format!(
                "<li><p><b>{}</b> <i>{} UTC</i></p><div>{}</div></li>\n",
                escape_html(display_sender(message)),
                format_millis(message.timestamp),
                html_paragraphs(&message.content),
            ));
        }
        html.push_str("</ol>\n</div>");

        format!("Subject: {subject}\n{html}")
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape and turn blank-line separated blocks into `<p>`, newlines into `<br>`.
fn html_paragraphs(text: &str) -> String {
    escape_html(text)
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("<p>{}</p>", p.trim().replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("")
}

// ── Telegram ────────────────────────────────────────────────────────

static MARKDOWN_SPECIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([_*\[`])").expect("static regex"));

/// Compact Markdown formatter for chat destinations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelegramFormatter;

impl Formatter for TelegramFormatter {
    fn name(&self) -> &str {
        "telegram"
    }

    fn format_one(&self, message: &Message) -> String {
        let mut out = String::new();
        if message.processed() == Some(false) {
            out.push_str("⚠️ *Processing failed*\n");
        }
        out.push_str(&format!("*{}*", escape_markdown(display_sender(message))));
        if let Some(subject) = message.subject() {
            out.push_str(&format!(" · {}", escape_markdown(subject)));
        }
        out.push_str(&format!("\n_{}_\n\n", format_millis(message.timestamp)));
        out.push_str(&escape_markdown(message.content.trim()));
        out
    }

    fn format_batch(&self, messages: &[Message]) -> String {
        let mut out = format!("*{} messages*\n", messages.len());
        for (i, message) in messages.iter().enumerate() {
            out.push_str(&format!(
                "\n{}. *{}* _{}_\n{}\n",
                i + 1,
                escape_markdown(display_sender(message)),
                format_millis(message.timestamp),
                escape_markdown(message.content.trim()),
            ));
        }
        out
    }
}

fn escape_markdown(text: &str) -> String {
    MARKDOWN_SPECIAL.replace_all(text, r"\$1").into_owned()
}

/// Sender for display. Consolidated messages list their participants.
fn display_sender(message: &Message) -> &str {
    if message.is_consolidated()
        && let Some(participants) = message.meta(keys::PARTICIPANTS)
    {
        return participants;
    }
    if message.sender.is_empty() {
        "unknown"
    } else {
        &message.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::message::Platform;

    fn msg(sender: &str, content: &str) -> Message {
        Message::new("m1", Platform::Email, sender, "me", content, 0)
    }

    struct Upper;

    impl Formatter for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn format_one(&self, message: &Message) -> String {
            message.content.to_uppercase()
        }
        fn format_batch(&self, messages: &[Message]) -> String {
            messages
                .iter()
                .map(|m| m.content.to_uppercase())
                .collect::<Vec<_>>()
                .join("|")
        }
    }

    #[test]
    fn auto_maps_destination_to_default() {
        let f = resolve_formatter(FormatterStrategy::Auto, DestinationKind::Email, None).unwrap();
        assert_eq!(f.name(), "email");
        let f =
            resolve_formatter(FormatterStrategy::Auto, DestinationKind::Telegram, None).unwrap();
        assert_eq!(f.name(), "telegram");
    }

    #[test]
    fn forced_strategies_ignore_destination() {
        let f = resolve_formatter(
            FormatterStrategy::TelegramFormat,
            DestinationKind::Email,
            None,
        )
        .unwrap();
        assert_eq!(f.name(), "telegram");
        let f = resolve_formatter(
            FormatterStrategy::GmailFormat,
            DestinationKind::Telegram,
            None,
        )
        .unwrap();
        assert_eq!(f.name(), "email");
    }

    #[test]
    fn custom_requires_injected_formatter() {
        let err = resolve_formatter(FormatterStrategy::Custom, DestinationKind::Email, None);
        assert!(err.is_err());

        let f = resolve_formatter(
            FormatterStrategy::Custom,
            DestinationKind::Email,
            Some(Arc::new(Upper)),
        )
        .unwrap();
        assert_eq!(f.format_one(&msg("a", "hi")), "HI");
    }

    #[test]
    fn strategy_parse_spellings() {
        assert_eq!(FormatterStrategy::parse("gmail").unwrap(), FormatterStrategy::GmailFormat);
        assert_eq!(
            FormatterStrategy::parse("TELEGRAM_FORMAT").unwrap(),
            FormatterStrategy::TelegramFormat
        );
        assert_eq!(FormatterStrategy::parse("").unwrap(), FormatterStrategy::Auto);
        assert!(FormatterStrategy::parse("fax").is_err());
    }

    #[test]
    fn email_format_has_subject_and_escaped_html() {
        let out = EmailFormatter.format_one(
            &msg("alice@example.com", "a < b\n\nsecond").with_metadata(keys::SUBJECT, "Plans"),
        );
        assert!(out.starts_with("Subject: [relayflow] Plans\n"));
        assert!(out.contains("a &lt; b"));
        assert!(out.contains("<p>second</p>"));
    }

    #[test]
    fn email_batch_lists_every_message() {
        let out = EmailFormatter.format_batch(&[msg("a", "one"), msg("b", "two")]);
        assert!(out.starts_with("Subject: [relayflow] Digest of 2 messages"));
        assert_eq!(out.matches("<li>").count(), 2);
    }

    #[test]
    fn telegram_escapes_markdown() {
        let out = TelegramFormatter.format_one(&msg("snake_case", "use *stars*"));
        assert!(out.contains(r"snake\_case"));
        assert!(out.contains(r"\*stars\*"));
    }

    #[test]
    fn telegram_flags_failed_processing() {
        let out = TelegramFormatter.format_one(&msg("a", "x").derive_error("timeout"));
        assert!(out.starts_with("⚠️"));
    }

    #[test]
    fn telegram_batch_numbers_entries() {
        let out = TelegramFormatter.format_batch(&[msg("a", "one"), msg("b", "two")]);
        assert!(out.starts_with("*2 messages*"));
        assert!(out.contains("1. *a*"));
        assert!(out.contains("2. *b*"));
    }
}

//! Consolidation: merge an ordered run of messages into one transcript.
//!
//! The transcript is the unit handed to the language model in batch mode,
//! so a batch of N messages costs one model call. It must stay readable on
//! its own: when processing fails, it is what the user ends up seeing.

use crate::pipeline::message::{Message, Platform, format_millis, keys, now_millis};

/// Prefix marking consolidated message ids.
pub const CONSOLIDATED_ID_PREFIX: &str = "consolidated-";

/// Metadata key recording the platform of the merged inputs.
pub const SOURCE_PLATFORM: &str = "source_platform";

/// Result of consolidating a non-empty message list.
#[derive(Debug, Clone)]
pub struct Consolidation {
    /// Distinct senders in first-seen order.
    pub participants: Vec<String>,
    /// (earliest, latest) timestamp in epoch millis.
    pub time_range: (i64, i64),
    /// Number of merged messages.
    pub message_count: usize,
    /// The synthetic transcript message.
    pub message: Message,
}

/// Merge `messages` (assumed chronological by fetch order) into one
/// synthetic message. Returns `None` for an empty list.
pub fn consolidate(messages: &[Message]) -> Option<Consolidation> {
    let first = messages.first()?;

    let mut participants: Vec<String> = Vec::new();
    for message in messages {
        if !participants.iter().any(|p| p == &message.sender) {
            participants.push(message.sender.clone());
        }
    }

    let min = messages.iter().map(|m| m.timestamp).min().unwrap_or(first.timestamp);
    let max = messages.iter().map(|m| m.timestamp).max().unwrap_or(first.timestamp);

    let content = render_transcript(messages, &participants, (min, max));
    let joined = participants.join(", ");

    let message = Message::new(
        consolidated_id(messages),
        Platform::Consolidated,
        joined.clone(),
        first.recipient.clone(),
        content,
        max,
    )
    .with_metadata(keys::CONSOLIDATED, "true")
    .with_metadata(keys::MESSAGE_COUNT, messages.len().to_string())
    .with_metadata(keys::PARTICIPANTS, joined)
    .with_metadata(keys::TIME_RANGE, format!("{min}..{max}"))
    .with_metadata(SOURCE_PLATFORM, first.platform().to_string());

    Some(Consolidation {
        participants,
        time_range: (min, max),
        message_count: messages.len(),
        message,
    })
}

/// Header block followed by one numbered `[time] sender: content` entry
/// per message, entries separated by blank lines.
fn render_transcript(messages: &[Message], participants: &[String], range: (i64, i64)) -> String {
    let mut out = String::new();
    out.push_str("Conversation transcript\n");
    out.push_str(&format!("Participants: {}\n", participants.join(", ")));
    out.push_str(&format!(
        "Time range: {} to {} UTC\n",
        format_millis(range.0),
        format_millis(range.1)
    ));
    out.push_str(&format!("Messages: {}\n", messages.len()));

    for (i, message) in messages.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. [{}] {}: {}\n",
            i + 1,
            format_millis(message.timestamp),
            message.sender,
            message.content.trim()
        ));
    }
    out
}

/// Time-derived id that cannot collide with any input id.
fn consolidated_id(messages: &[Message]) -> String {
    let mut id = format!("{CONSOLIDATED_ID_PREFIX}{}", now_millis());
    let mut suffix = 1;
    while messages.iter().any(|m| m.id == id) {
        id = format!("{CONSOLIDATED_ID_PREFIX}{}-{suffix}", now_millis());
        suffix += 1;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, sender: &str, ts: i64, content: &str) -> Message {
        Message::new(id, Platform::Telegram, sender, "me", content, ts)
    }

    #[test]
    fn empty_list_yields_none() {
        assert!(consolidate(&[]).is_none());
    }

    #[test]
    fn three_messages_two_participants() {
        let msgs = vec![
            msg("1", "A", 100, "hello"),
            msg("2", "B", 200, "hi A"),
            msg("3", "A", 150, "how are you"),
        ];
        let c = consolidate(&msgs).unwrap();

        assert_eq!(c.participants, vec!["A", "B"]);
        assert_eq!(c.time_range, (100, 200));
        assert_eq!(c.message_count, 3);
        assert_eq!(c.message.meta(keys::MESSAGE_COUNT), Some("3"));
        assert_eq!(c.message.meta(keys::PARTICIPANTS), Some("A, B"));
        assert_eq!(c.message.meta(keys::TIME_RANGE), Some("100..200"));
        assert!(c.message.is_consolidated());
        assert_eq!(c.message.meta(SOURCE_PLATFORM), Some("telegram"));
    }

    #[test]
    fn participants_follow_first_seen_order() {
        let msgs = vec![
            msg("1", "C", 5, "x"),
            msg("2", "A", 1, "x"),
            msg("3", "C", 3, "x"),
            msg("4", "B", 9, "x"),
            msg("5", "A", 2, "x"),
        ];
        let c = consolidate(&msgs).unwrap();
        assert_eq!(c.participants, vec!["C", "A", "B"]);
        assert_eq!(c.time_range, (1, 9));
    }

    #[test]
    fn transcript_is_numbered_and_blank_line_separated() {
        let msgs = vec![msg("1", "A", 0, "first"), msg("2", "B", 1000, "second")];
        let c = consolidate(&msgs).unwrap();
        let content = &c.message.content;

        assert!(content.starts_with("Conversation transcript\nParticipants: A, B\n"));
        assert!(content.contains("Messages: 2\n"));
        assert!(content.contains("\n\n1. [1970-01-01 00:00:00] A: first\n"));
        assert!(content.contains("\n\n2. [1970-01-01 00:00:01] B: second\n"));
    }

    #[test]
    fn id_is_prefixed_and_distinct_from_inputs() {
        let msgs = vec![msg("1", "A", 0, "x")];
        let c = consolidate(&msgs).unwrap();
        assert!(c.message.id.starts_with(CONSOLIDATED_ID_PREFIX));
        assert_ne!(c.message.id, "1");
    }

    #[test]
    fn single_message_still_consolidates() {
        let c = consolidate(&[msg("1", "A", 42, "solo")]).unwrap();
        assert_eq!(c.participants, vec!["A"]);
        assert_eq!(c.time_range, (42, 42));
    }
}

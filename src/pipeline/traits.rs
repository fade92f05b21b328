//! Source → Processor → Destination contracts.
//!
//! None of these surface errors to the orchestrator. Sources degrade to
//! the empty sentinel, processors to an error-content message, and
//! destinations to `false`. Backend-specific failures are logged at the
//! boundary where they are swallowed.

use async_trait::async_trait;

use crate::error::{ChannelError, PipelineError};
use crate::pipeline::formatter::Formatter;
use crate::pipeline::message::{Message, Platform};

/// Produces standardized messages from an external system.
#[async_trait]
pub trait Source: Send + Sync {
    /// Source name for logging (e.g. "email").
    fn name(&self) -> &str;

    /// Fetch the most recent message, or the empty sentinel.
    async fn fetch_one(&self) -> Message;

    /// Fetch up to `count` messages. An empty or failed fetch yields a
    /// single empty sentinel so downstream stages always get input.
    async fn fetch_many(&self, count: usize) -> Vec<Message>;
}

/// Transforms messages, typically with a language model.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Transform one message. Failures come back as an error-content
    /// message with `processed=false`.
    async fn process(&self, message: &Message) -> Message;

    /// Reduce N messages to exactly one, with a single underlying
    /// processing call. An empty input produces an error message.
    async fn process_batch(&self, messages: &[Message]) -> Message;
}

/// Delivers messages to an external system.
///
/// Implementors provide `formatter()` and `deliver()`; the send methods
/// carry the shared batching rule.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Destination name for logging (e.g. "telegram").
    fn name(&self) -> &str;

    /// Formatter used to render payloads.
    fn formatter(&self) -> &dyn Formatter;

    /// Perform exactly one underlying send of an already formatted payload.
    async fn deliver(&self, payload: &str) -> Result<(), ChannelError>;

    /// Format and deliver a single message.
    async fn send_one(&self, message: &Message) -> bool {
        let payload = self.formatter().format_one(message);
        match self.deliver(&payload).await {
            Ok(()) => {
                tracing::debug!(destination = self.name(), id = %message.id, "Message delivered");
                true
            }
            Err(e) => {
                tracing::error!(destination = self.name(), id = %message.id, error = %e, "Delivery failed");
                false
            }
        }
    }

    /// Deliver many messages. More than one message is rendered by the
    /// batch formatter and sent once; a single message uses `send_one`.
    async fn send_many(&self, messages: &[Message]) -> Vec<bool> {
        match messages {
            [] => Vec::new(),
            [single] => vec![self.send_one(single).await],
            _ => {
                let payload = self.formatter().format_batch(messages);
                let ok = match self.deliver(&payload).await {
                    Ok(()) => {
                        tracing::info!(
                            destination = self.name(),
                            count = messages.len(),
                            "Batch delivered as one payload"
                        );
                        true
                    }
                    Err(e) => {
                        tracing::error!(
                            destination = self.name(),
                            count = messages.len(),
                            error = %e,
                            "Batch delivery failed"
                        );
                        false
                    }
                };
                vec![ok; messages.len()]
            }
        }
    }
}

/// Convert a fallible fetch into the sentinel contract.
pub(crate) fn fetched_or_empty(
    source: &str,
    platform: Platform,
    result: Result<Vec<Message>, PipelineError>,
) -> Vec<Message> {
    match result {
        Ok(messages) if !messages.is_empty() => messages,
        Ok(_) => {
            tracing::debug!(source, "Nothing to fetch");
            vec![Message::empty(platform)]
        }
        Err(e) => {
            tracing::warn!(source, error = %e, "Fetch failed, returning empty message");
            vec![Message::empty(platform)]
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::pipeline::formatter::TelegramFormatter;

    /// Destination that records every payload handed to `deliver`.
    struct RecordingDestination {
        formatter: TelegramFormatter,
        payloads: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingDestination {
        fn new(fail: bool) -> Self {
            Self {
                formatter: TelegramFormatter,
                payloads: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl Destination for RecordingDestination {
        fn name(&self) -> &str {
            "recording"
        }

        fn formatter(&self) -> &dyn Formatter {
            &self.formatter
        }

        async fn deliver(&self, payload: &str) -> Result<(), ChannelError> {
            self.payloads.lock().unwrap().push(payload.to_string());
            if self.fail {
                Err(ChannelError::SendFailed {
                    name: "recording".into(),
                    reason: "offline".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn msg(i: i64) -> Message {
        Message::new(format!("m{i}"), Platform::Telegram, "bob", "me", format!("text {i}"), i)
    }

    #[tokio::test]
    async fn send_many_single_delegates_to_send_one() {
        let dest = RecordingDestination::new(false);
        let results = dest.send_many(&[msg(1)]).await;

        assert_eq!(results, vec![true]);
        let payloads = dest.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], dest.formatter.format_one(&msg(1)));
    }

    #[tokio::test]
    async fn send_many_five_sends_once() {
        let dest = RecordingDestination::new(false);
        let batch: Vec<Message> = (1..=5).map(msg).collect();
        let results = dest.send_many(&batch).await;

        assert_eq!(results, vec![true; 5]);
        let payloads = dest.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], dest.formatter.format_batch(&batch));
    }

    #[tokio::test]
    async fn send_many_empty_is_noop() {
        let dest = RecordingDestination::new(false);
        assert!(dest.send_many(&[]).await.is_empty());
        assert!(dest.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_returns_false() {
        let dest = RecordingDestination::new(true);
        assert!(!dest.send_one(&msg(1)).await);
        assert_eq!(dest.send_many(&[msg(1), msg(2)]).await, vec![false, false]);
    }

    #[test]
    fn fetched_or_empty_degrades_errors() {
        let out = fetched_or_empty(
            "email",
            Platform::Email,
            Err(PipelineError::Fetch("network down".into())),
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].is_empty());

        let out = fetched_or_empty("email", Platform::Email, Ok(vec![]));
        assert!(out[0].is_empty());

        let out = fetched_or_empty("email", Platform::Email, Ok(vec![msg(1)]));
        assert_eq!(out[0].id, "m1");
    }
}

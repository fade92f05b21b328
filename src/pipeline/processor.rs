//! Language-model processor.
//!
//! Renders a prompt template against a message and asks the model for a
//! rewrite. Every failure path still yields a message: the destination
//! stage always has something to deliver or discard.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use tracing::{debug, info, warn};

use crate::llm::{DEFAULT_LLM_TIMEOUT, LanguageModel};
use crate::pipeline::consolidate::consolidate;
use crate::pipeline::message::{Message, Platform};
use crate::pipeline::traits::Processor;

/// Prompt used when a workflow does not supply its own.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "Summarize the following message from {sender} \
in a few short sentences. Keep names, dates and any requested actions.\n\n{content}";

/// Prefix prepended to consolidated transcripts.
const BATCH_PREAMBLE: &str = "The text below is a transcript of several messages. \
Treat it as one conversation.\n\n";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(sender|content)\}").expect("static regex"));

/// Inputs longer than this are cut before prompting.
const MAX_PROMPT_CONTENT_CHARS: usize = 8000;

/// Processor backed by a `LanguageModel`.
pub struct LlmProcessor {
    model: Arc<dyn LanguageModel>,
    template: String,
    timeout: Duration,
}

impl LlmProcessor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            timeout: DEFAULT_LLM_TIMEOUT,
        }
    }

    /// Use a workflow-specific template. Blank templates keep the default.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        let template = template.into();
        if !template.trim().is_empty() {
            self.template = template;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render_prompt(&self, message: &Message) -> String {
        let content: String = message.content.chars().take(MAX_PROMPT_CONTENT_CHARS).collect();
        // One pass, so substituted text is never scanned for placeholders.
        let mut prompt = PLACEHOLDER
            .replace_all(&self.template, |caps: &Captures| match &caps[1] {
                "sender" => message.sender.clone(),
                _ => content.clone(),
            })
            .into_owned();
        if !self.template.contains("{content}") {
            // Templates without a placeholder still need the text.
            prompt = format!("{prompt}\n\n{content}");
        }
        if message.is_consolidated() {
            prompt = format!("{BATCH_PREAMBLE}{prompt}");
        }
        prompt
    }
}

#[async_trait]
impl Processor for LlmProcessor {
    async fn process(&self, message: &Message) -> Message {
        if message.is_empty() {
            debug!(id = %message.id, "Skipping empty message");
            return message.clone();
        }

        let prompt = self.render_prompt(message);
        let model = self.model.model_name().to_string();

        // The client enforces the deadline too; this bounds misbehaving
        // implementations of the trait.
        let outcome = tokio::time::timeout(
            self.timeout,
            self.model.generate(&prompt, self.timeout),
        )
        .await;

        match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                info!(id = %message.id, model = %model, "Message processed");
                message.derive(text.trim())
            }
            Ok(Ok(_)) => {
                warn!(id = %message.id, model = %model, "Model returned empty output");
                error_for(message, "language model returned no output")
            }
            Ok(Err(e)) => {
                warn!(id = %message.id, model = %model, error = %e, "Processing failed");
                error_for(message, &e.to_string())
            }
            Err(_) => {
                warn!(id = %message.id, model = %model, timeout = ?self.timeout, "Processing timed out");
                error_for(
                    message,
                    &format!("language model timed out after {}s", self.timeout.as_secs()),
                )
            }
        }
    }

    async fn process_batch(&self, messages: &[Message]) -> Message {
        let real: Vec<Message> = messages.iter().filter(|m| !m.is_empty()).cloned().collect();
        let Some(merged) = consolidate(&real) else {
            warn!(count = messages.len(), "Rejecting empty batch");
            return Message::error(Platform::System, "cannot process an empty batch");
        };

        info!(
            count = merged.message_count,
            participants = merged.participants.len(),
            "Processing consolidated batch"
        );
        self.process(&merged.message).await
    }
}

/// Error-content message. For consolidated input the transcript is kept
/// so the user still sees what arrived.
fn error_for(message: &Message, reason: &str) -> Message {
    let mut derived = message.derive_error(reason);
    if message.is_consolidated() {
        derived.content = format!("Error: {reason}\n\n{}", message.content);
    }
    derived
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::LlmError;
    use crate::pipeline::message::keys;

    /// Model that counts calls and echoes a canned reply.
    struct CountingModel {
        calls: AtomicUsize,
        reply: Result<String, ()>,
        delay: Option<Duration>,
    }

    impl CountingModel {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Ok(reply.to_string()),
                delay: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Err(()),
                delay: None,
            })
        }
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn generate(&self, prompt: &str, _timeout: Duration) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.reply {
                Ok(reply) => Ok(format!("{reply} ({} chars)", prompt.len())),
                Err(()) => Err(LlmError::RequestFailed {
                    model: "counting".into(),
                    reason: "offline".into(),
                }),
            }
        }
    }

    fn msg(i: i64, sender: &str) -> Message {
        Message::new(format!("m{i}"), Platform::Email, sender, "me", format!("body {i}"), i)
    }

    #[tokio::test]
    async fn process_derives_new_message() {
        let model = CountingModel::ok("summary");
        let processor = LlmProcessor::new(model.clone());
        let input = msg(1, "alice");

        let out = processor.process(&input).await;
        assert!(out.content.starts_with("summary"));
        assert_eq!(out.processed(), Some(true));
        assert_eq!(input.content, "body 1");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn process_batch_calls_model_once() {
        let model = CountingModel::ok("digest");
        let processor = LlmProcessor::new(model.clone());
        let batch: Vec<Message> = (1..=5).map(|i| msg(i, "bob")).collect();

        let out = processor.process_batch(&batch).await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert!(out.is_consolidated());
        assert_eq!(out.meta(keys::MESSAGE_COUNT), Some("5"));
    }

    #[tokio::test]
    async fn process_batch_empty_returns_error_message() {
        let model = CountingModel::ok("unused");
        let processor = LlmProcessor::new(model.clone());

        let out = processor.process_batch(&[]).await;
        assert_eq!(out.processed(), Some(false));
        assert!(out.content.contains("empty batch"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn model_failure_becomes_error_content() {
        let processor = LlmProcessor::new(CountingModel::failing());
        let out = processor.process(&msg(1, "alice")).await;
        assert_eq!(out.processed(), Some(false));
        assert!(out.content.starts_with("Error:"));
        assert_eq!(out.sender, "alice");
    }

    #[tokio::test]
    async fn failed_batch_keeps_transcript() {
        let processor = LlmProcessor::new(CountingModel::failing());
        let out = processor
            .process_batch(&[msg(1, "alice"), msg(2, "bob")])
            .await;
        assert_eq!(out.processed(), Some(false));
        assert!(out.content.contains("Conversation transcript"));
        assert!(out.content.contains("alice: body 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_times_out() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
            reply: Ok("late".into()),
            delay: Some(Duration::from_secs(120)),
        });
        let processor = LlmProcessor::new(model).with_timeout(Duration::from_secs(60));

        let out = processor.process(&msg(1, "alice")).await;
        assert_eq!(out.processed(), Some(false));
        assert!(out.content.contains("timed out"));
    }

    #[tokio::test]
    async fn empty_sentinel_passes_through() {
        let model = CountingModel::ok("unused");
        let processor = LlmProcessor::new(model.clone());
        let empty = Message::empty(Platform::Telegram);

        let out = processor.process(&empty).await;
        assert_eq!(out, empty);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn template_placeholders_are_filled() {
        let processor = LlmProcessor::new(CountingModel::ok("x"))
            .with_template("Translate from {sender}: {content}");
        let prompt = processor.render_prompt(&msg(3, "carol"));
        assert_eq!(prompt, "Translate from carol: body 3");
    }

    #[test]
    fn substituted_sender_is_not_expanded_again() {
        let processor =
            LlmProcessor::new(CountingModel::ok("x")).with_template("From {sender}: {content}");
        let prompt = processor.render_prompt(&msg(3, "{content}"));
        assert_eq!(prompt, "From {content}: body 3");
    }

    #[test]
    fn transcript_gets_preamble_without_placeholder() {
        let processor = LlmProcessor::new(CountingModel::ok("x")).with_template("Be brief.");
        let merged = consolidate(&[msg(1, "ann"), msg(2, "bob")]).unwrap().message;
        let prompt = processor.render_prompt(&merged);
        assert!(prompt.starts_with(BATCH_PREAMBLE));
        assert!(prompt.ends_with(&merged.content));
    }

    #[test]
    fn template_without_placeholder_appends_content() {
        let processor = LlmProcessor::new(CountingModel::ok("x")).with_template("Be brief.");
        let prompt = processor.render_prompt(&msg(3, "carol"));
        assert!(prompt.ends_with("body 3"));
    }
}

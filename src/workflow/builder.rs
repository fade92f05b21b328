//! Fluent workflow construction.

use std::sync::Arc;

use crate::error::WorkflowError;
use crate::pipeline::factory::{DestinationConfig, DestinationFactory};
use crate::pipeline::formatter::{Formatter, FormatterStrategy};
use crate::pipeline::traits::{Processor, Source};
use crate::workflow::workflow::Workflow;

/// Builds a `Workflow`, resolving the destination and its formatter at
/// `build()` time. Missing parts fail there, not at run time.
pub struct WorkflowBuilder {
    destinations: Arc<DestinationFactory>,
    label: Option<String>,
    source: Option<Arc<dyn Source>>,
    processor: Option<Arc<dyn Processor>>,
    destination: Option<DestinationConfig>,
    strategy: FormatterStrategy,
    custom_formatter: Option<Arc<dyn Formatter>>,
}

impl WorkflowBuilder {
    pub fn new(destinations: Arc<DestinationFactory>) -> Self {
        Self {
            destinations,
            label: None,
            source: None,
            processor: None,
            destination: None,
            strategy: FormatterStrategy::Auto,
            custom_formatter: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn destination(mut self, destination: DestinationConfig) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn formatter_strategy(mut self, strategy: FormatterStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Inject a formatter and switch the strategy to `Custom`.
    pub fn custom_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.custom_formatter = Some(formatter);
        self.strategy = FormatterStrategy::Custom;
        self
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let source = self.source.ok_or(WorkflowError::Incomplete("a source"))?;
        let processor = self.processor.ok_or(WorkflowError::Incomplete("a processor"))?;
        let destination_config = self
            .destination
            .ok_or(WorkflowError::Incomplete("a destination type"))?;

        let destination = self.destinations.create_from_config(
            &destination_config,
            self.strategy,
            self.custom_formatter,
        )?;

        tracing::debug!(
            source = source.name(),
            destination = destination.name(),
            formatter = destination.formatter().name(),
            "Workflow built"
        );

        let workflow = Workflow::new(source, processor, destination);
        Ok(match self.label {
            Some(label) => workflow.with_label(label),
            None => workflow,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::telegram::{BotApi, Update};
    use crate::error::{ChannelError, ConfigError};
    use crate::pipeline::message::Message;
    use crate::workflow::workflow::tests::{ListSource, UpperProcessor, msg};

    #[derive(Default)]
    struct RecordingBot {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BotApi for RecordingBot {
        async fn get_updates(&self, _offset: i64, _timeout: Duration) -> Result<Vec<Update>, ChannelError> {
            Ok(vec![])
        }

        async fn send_message(&self, _chat_id: &str, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Shout;

    impl Formatter for Shout {
        fn name(&self) -> &str {
            "shout"
        }
        fn format_one(&self, message: &Message) -> String {
            format!("!! {}", message.content)
        }
        fn format_batch(&self, messages: &[Message]) -> String {
            format!("!! {} messages", messages.len())
        }
    }

    fn telegram() -> DestinationConfig {
        DestinationConfig::Telegram {
            chat_id: "42".into(),
        }
    }

    fn factory(bot: Arc<RecordingBot>) -> Arc<DestinationFactory> {
        Arc::new(DestinationFactory::new(None, Some(bot)))
    }

    #[test]
    fn missing_parts_fail_fast() {
        let bot = Arc::new(RecordingBot::default());

        let err = WorkflowBuilder::new(factory(bot.clone()))
            .processor(Arc::new(UpperProcessor::default()))
            .destination(telegram())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkflowError::Incomplete("a source")));

        let err = WorkflowBuilder::new(factory(bot.clone()))
            .source(ListSource::new(vec![]))
            .destination(telegram())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkflowError::Incomplete("a processor")));

        let err = WorkflowBuilder::new(factory(bot))
            .source(ListSource::new(vec![]))
            .processor(Arc::new(UpperProcessor::default()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkflowError::Incomplete("a destination type")));
    }

    #[test]
    fn custom_strategy_without_formatter_fails() {
        let err = WorkflowBuilder::new(factory(Arc::new(RecordingBot::default())))
            .source(ListSource::new(vec![]))
            .processor(Arc::new(UpperProcessor::default()))
            .destination(telegram())
            .formatter_strategy(FormatterStrategy::Custom)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkflowError::Config(ConfigError::MissingRequired { .. })));
    }

    #[tokio::test]
    async fn custom_formatter_is_used() {
        let bot = Arc::new(RecordingBot::default());
        let workflow = WorkflowBuilder::new(factory(bot.clone()))
            .source(ListSource::new(vec![msg(1, "ann")]))
            .processor(Arc::new(UpperProcessor::default()))
            .destination(telegram())
            .custom_formatter(Arc::new(Shout))
            .build()
            .unwrap();

        assert!(workflow.run().await);
        assert_eq!(bot.sent.lock().unwrap()[0], "!! TEXT 1");
    }

    #[tokio::test]
    async fn run_batch_through_built_workflow_sends_once() {
        let bot = Arc::new(RecordingBot::default());
        let workflow = WorkflowBuilder::new(factory(bot.clone()))
            .label("wf-1")
            .source(ListSource::new(vec![msg(1, "A"), msg(2, "B"), msg(3, "A")]))
            .processor(Arc::new(UpperProcessor::default()))
            .destination(telegram())
            .build()
            .unwrap();

        assert_eq!(workflow.label(), "wf-1");
        assert!(workflow.run_batch(3).await);
        assert_eq!(bot.sent.lock().unwrap().len(), 1);
    }
}

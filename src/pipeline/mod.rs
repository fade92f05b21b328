//! Message pipeline: Source → Processor → Destination.
//!
//! Every stage degrades instead of failing: sources return the empty
//! sentinel, processors return error-content messages, destinations
//! return `false`. Only construction can fail.

pub mod consolidate;
pub mod factory;
pub mod formatter;
pub mod message;
pub mod processor;
pub mod traits;

pub use consolidate::{Consolidation, consolidate};
pub use factory::{DestinationConfig, DestinationFactory, DestinationKind, SourceConfig, SourceFactory};
pub use formatter::{EmailFormatter, Formatter, FormatterStrategy, TelegramFormatter};
pub use message::{Message, Platform};
pub use processor::LlmProcessor;
pub use traits::{Destination, Processor, Source};

//! relayflow: scheduled message workflows.
//!
//! A workflow wires a message source (mailbox, chat bot) through a
//! language-model processor to a destination, and repeats on an interval
//! under a supervisor that survives restarts and crashes.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod supervisor;
pub mod workflow;

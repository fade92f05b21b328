//! Workflow orchestration: definitions, the run pipeline, commands and
//! the per-workflow loop runner.

pub mod builder;
pub mod command;
pub mod model;
pub mod runner;
pub mod state;
#[allow(clippy::module_inception)]
pub mod workflow;

pub use builder::WorkflowBuilder;
pub use command::{BatchCommand, Command, CommandInvoker, ConsolidatedCommand, SingleMessageCommand};
pub use model::{
    ProcessingMode, WorkflowConfiguration, WorkflowDefinition, WorkflowExecutionResult,
    WorkflowSpec, WorkflowType,
};
pub use runner::{PipelineExecutor, WorkflowExecutor, WorkflowRunner};
pub use state::WorkflowState;
pub use workflow::Workflow;

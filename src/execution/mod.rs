//! Workflow Execution Module
//!
//! Runs the rules of a workflow in dependency order, in parallel where the
//! graph allows it, skipping rules whose previous outputs are still valid.
//!
//! # Architecture
//!
//! - [`manager`]: Sub-DAG selection and the scheduling loop
//! - [`runner`]: Execution of a single rule in its own session
//! - [`queue`]: FIFO without duplicates, used as the ready queue

pub mod manager;
pub mod queue;
pub mod runner;

pub use manager::{ManagerState, RuleSummary, RunReport, WorkflowManager};
pub use queue::UniqueQueue;
pub use runner::{ChannelObserver, RuleRunner, UnitEvent, UnitObserver};

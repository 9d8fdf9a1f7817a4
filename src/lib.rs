//! Ruleflow - Incremental Rule-Based Workflow Engine
//!
//! A workflow is a set of rules. Each rule applies a tool to named input and
//! output files and tables. Dependencies are never declared: a rule follows
//! another when it reads a file or table the other one writes.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Rule entity, YAML definitions, validation and the DAG
//! - [`execution`]: Workflow manager, scheduling loop and execution units
//! - [`tool`]: Tool trait, specifications and shell command tools
//! - [`storage`]: Execution history, user tables and filesystem probes
//! - [`monitoring`]: Execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ruleflow::{load_workflow, HistoryStore, WorkflowManager};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load rules and shell tools from YAML
//!     let loaded = load_workflow("ruleflow.yml")?;
//!     let store = Arc::new(HistoryStore::open(".ruleflow/history.json")?);
//!
//!     let mut manager = WorkflowManager::new(loaded.workflow, loaded.registry, store);
//!     manager.set_max_parallel(4);
//!     manager.set_working_dir("/data/analysis");
//!
//!     // Rules whose outputs are still valid are skipped
//!     let report = manager.run()?;
//!     println!("{} rules executed", report.rules.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod storage;
pub mod tool;
pub mod workflow;

// Re-export commonly used types
pub use error::{Result, RuleflowError};
pub use execution::{RunReport, WorkflowManager};
pub use storage::HistoryStore;
pub use tool::{FnTool, ShellTool, Tool, ToolRegistry, ToolSpec};
pub use workflow::model::{Rule, RuleStatus, Workflow};
pub use workflow::parser::{load_workflow, parse_workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Ruleflow";

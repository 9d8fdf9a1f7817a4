//! Workflow Definition Module
//!
//! Rules, the dependency graph inferred from them, and loading/validation of
//! workflow definitions.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Rule, Workflow)
//! - [`dag`]: Dependency graph built from rule inputs and outputs
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Rule content checks against tool specifications

pub mod dag;
pub mod model;
pub mod parser;
pub mod validator;

pub use dag::Dag;
pub use model::{Direction, FileRef, Readiness, Rule, RuleOption, RuleStatus, TableRef, Workflow};
pub use parser::{load_workflow, load_workflow_with, parse_workflow, parse_workflow_with, LoadedWorkflow};
pub use validator::{validate_content, validate_workflow};

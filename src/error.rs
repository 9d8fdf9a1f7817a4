//! Error Types
//!
//! Every failure the engine can surface to its caller. Configuration errors are
//! raised before any rule runs; `RuleFailed` and `Stalled` end a running
//! workflow.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum RuleflowError {
    /// Declared files/tables/options of a rule differ from its tool specification.
    #[error("Rule '{rule}' ({tool}): {detail}")]
    ContentMismatch {
        rule: String,
        tool: String,
        detail: String,
    },

    #[error("Rule '{rule}': required option '{option}' is missing")]
    MissingOption { rule: String, option: String },

    #[error("Rule '{rule}': option '{option}' expects {expected}, got '{value}'")]
    InvalidOptionValue {
        rule: String,
        option: String,
        expected: String,
        value: String,
    },

    #[error("Rule '{rule}' uses unknown tool '{tool}'")]
    UnknownTool { rule: String, tool: String },

    #[error("Duplicate rule name: '{0}'")]
    DuplicateRule(String),

    #[error("No rule named '{0}' in the workflow")]
    UnknownRule(String),

    #[error("Workflow contains a cycle: {}", .0.join(" -> "))]
    CyclicWorkflow(Vec<String>),

    #[error("Invalid workflow definition: {0}")]
    Definition(String),

    #[error("Rule '{rule}' ({tool}) failed: {message}")]
    RuleFailed {
        rule: String,
        tool: String,
        message: String,
    },

    #[error("Workflow stalled: rule '{rule}' is waiting for missing input(s): {}", .missing.join(", "))]
    Stalled { rule: String, missing: Vec<String> },

    #[error("History store error: {0}")]
    Store(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuleflowError {
    /// True for errors detected before execution starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ContentMismatch { .. }
                | Self::MissingOption { .. }
                | Self::InvalidOptionValue { .. }
                | Self::UnknownTool { .. }
                | Self::DuplicateRule(_)
                | Self::UnknownRule(_)
                | Self::CyclicWorkflow(_)
                | Self::Definition(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RuleflowError>;

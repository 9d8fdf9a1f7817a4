//! Tool Module
//!
//! A tool is the opaque body of a rule. The engine only knows what a tool
//! declares (its [`ToolSpec`]) and whether running it succeeded.
//!
//! - [`ToolSpec`]: Declared input/output keys and option constraints
//! - [`ToolContext`]: What a running tool can see and write
//! - [`ToolRegistry`]: Identifier to implementation lookup
//! - [`shell`]: Tools defined as bash command templates
//!
//! # Example
//!
//! ```
//! use ruleflow::tool::{FnTool, OptionConstraint, OptionKind, ToolRegistry, ToolSpec};
//!
//! let spec = ToolSpec::new()
//!     .input_file("source")
//!     .output_file("copy")
//!     .option("overwrite", OptionConstraint::optional(OptionKind::Bool));
//!
//! let copy = FnTool::new(spec, |ctx| {
//!     std::fs::copy(ctx.input_file("source")?, ctx.output_file("copy")?)?;
//!     Ok(())
//! });
//!
//! let mut registry = ToolRegistry::new();
//! registry.register("copy", copy);
//! assert!(registry.contains("copy"));
//! ```

pub mod shell;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::error::RuleflowError;
use crate::storage::probe::LocalFiles;
use crate::storage::session::{Entity, Session};
use crate::workflow::model::{Direction, Rule};

pub use shell::ShellTool;

/// Error type returned by tool bodies.
pub type ToolError = Box<dyn std::error::Error + Send + Sync>;

/// Value type an option must parse as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Int,
    Float,
    Bool,
    Str,
}

impl OptionKind {
    /// True if `value` can be read as this kind.
    pub fn accepts(&self, value: &str) -> bool {
        let value = value.trim();
        match self {
            Self::Int => value.parse::<i64>().is_ok(),
            Self::Float => value.parse::<f64>().is_ok(),
            Self::Bool => matches!(value.to_ascii_lowercase().as_str(), "true" | "false"),
            Self::Str => true,
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Str => "str",
        };
        f.write_str(name)
    }
}

/// Type and presence constraint on one option, e.g. `"int|required"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionConstraint {
    pub kind: OptionKind,
    pub required: bool,
}

impl OptionConstraint {
    pub fn optional(kind: OptionKind) -> Self {
        Self {
            kind,
            required: false,
        }
    }

    pub fn required(kind: OptionKind) -> Self {
        Self {
            kind,
            required: true,
        }
    }
}

impl FromStr for OptionConstraint {
    type Err = RuleflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut kind = None;
        let mut required = false;

        for token in s.split('|').map(|t| t.trim().to_ascii_lowercase()) {
            let parsed = match token.as_str() {
                "" => continue,
                "required" => {
                    required = true;
                    continue;
                }
                "int" => OptionKind::Int,
                "float" => OptionKind::Float,
                "bool" => OptionKind::Bool,
                "str" => OptionKind::Str,
                other => {
                    return Err(RuleflowError::Definition(format!(
                        "unknown option constraint '{}' in '{}'",
                        other, s
                    )))
                }
            };
            if kind.replace(parsed).is_some() {
                return Err(RuleflowError::Definition(format!(
                    "option constraint '{}' names more than one type",
                    s
                )));
            }
        }

        Ok(Self {
            kind: kind.unwrap_or(OptionKind::Str),
            required,
        })
    }
}

/// Everything a tool declares about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolSpec {
    pub input_files: BTreeSet<String>,
    pub output_files: BTreeSet<String>,
    pub input_tables: BTreeSet<String>,
    pub output_tables: BTreeSet<String>,
    pub options: BTreeMap<String, OptionConstraint>,
}

impl ToolSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_file(mut self, key: impl Into<String>) -> Self {
        self.input_files.insert(key.into());
        self
    }

    pub fn output_file(mut self, key: impl Into<String>) -> Self {
        self.output_files.insert(key.into());
        self
    }

    pub fn input_table(mut self, key: impl Into<String>) -> Self {
        self.input_tables.insert(key.into());
        self
    }

    pub fn output_table(mut self, key: impl Into<String>) -> Self {
        self.output_tables.insert(key.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, constraint: OptionConstraint) -> Self {
        self.options.insert(key.into(), constraint);
        self
    }

    pub fn files(&self, direction: Direction) -> &BTreeSet<String> {
        match direction {
            Direction::Input => &self.input_files,
            Direction::Output => &self.output_files,
        }
    }

    pub fn tables(&self, direction: Direction) -> &BTreeSet<String> {
        match direction {
            Direction::Input => &self.input_tables,
            Direction::Output => &self.output_tables,
        }
    }
}

/// The opaque behaviour behind a rule.
pub trait Tool: Send + Sync {
    /// Keys and options this tool expects on every rule using it.
    fn specification(&self) -> ToolSpec;

    /// Performs the tool's work. Table writes go through `ctx` and are
    /// committed only if this returns `Ok`.
    fn run(&self, ctx: &mut ToolContext<'_>) -> Result<(), ToolError>;
}

/// A tool built from a closure.
pub struct FnTool<F> {
    spec: ToolSpec,
    body: F,
}

impl<F> FnTool<F>
where
    F: Fn(&mut ToolContext<'_>) -> Result<(), ToolError> + Send + Sync,
{
    pub fn new(spec: ToolSpec, body: F) -> Self {
        Self { spec, body }
    }
}

impl<F> Tool for FnTool<F>
where
    F: Fn(&mut ToolContext<'_>) -> Result<(), ToolError> + Send + Sync,
{
    fn specification(&self) -> ToolSpec {
        self.spec.clone()
    }

    fn run(&self, ctx: &mut ToolContext<'_>) -> Result<(), ToolError> {
        (self.body)(ctx)
    }
}

/// Maps tool identifiers to implementations.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any previous one with the same identifier.
    pub fn register(&mut self, identifier: impl Into<String>, tool: impl Tool + 'static) {
        self.tools.insert(identifier.into(), Arc::new(tool));
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(identifier).cloned()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.tools.contains_key(identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// View of a rule handed to its tool while it runs.
pub struct ToolContext<'a> {
    rule: &'a Rule,
    session: &'a mut Session,
    files: &'a LocalFiles,
}

impl<'a> ToolContext<'a> {
    pub fn new(rule: &'a Rule, session: &'a mut Session, files: &'a LocalFiles) -> Self {
        Self {
            rule,
            session,
            files,
        }
    }

    pub fn rule(&self) -> &Rule {
        self.rule
    }

    pub fn rule_name(&self) -> &str {
        &self.rule.name
    }

    fn file(&self, direction: Direction, key: &str) -> Result<PathBuf, ToolError> {
        let file = self.rule.file(direction, key).ok_or_else(|| {
            format!(
                "rule '{}' has no {} file '{}'",
                self.rule.name, direction, key
            )
        })?;
        Ok(self.files.resolve(&file.path))
    }

    fn table(&self, direction: Direction, key: &str) -> Result<&'a str, ToolError> {
        let rule: &'a Rule = self.rule;
        let table = rule.table(direction, key).ok_or_else(|| {
            format!("rule '{}' has no {} table '{}'", rule.name, direction, key)
        })?;
        Ok(table.table_name.as_str())
    }

    /// Path of an input file, resolved against the working directory.
    pub fn input_file(&self, key: &str) -> Result<PathBuf, ToolError> {
        self.file(Direction::Input, key)
    }

    /// Path of an output file, resolved against the working directory.
    pub fn output_file(&self, key: &str) -> Result<PathBuf, ToolError> {
        self.file(Direction::Output, key)
    }

    /// Table name behind an input table key.
    pub fn input_table(&self, key: &str) -> Result<&'a str, ToolError> {
        self.table(Direction::Input, key)
    }

    /// Table name behind an output table key.
    pub fn output_table(&self, key: &str) -> Result<&'a str, ToolError> {
        self.table(Direction::Output, key)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.rule.option(key)
    }

    /// Reads an option as `T`; `Ok(None)` when the option is not set.
    ///
    /// A value that does not parse as written is retried in lowercase, so
    /// `True` reads as a `bool` just as it passes validation.
    pub fn option_as<T>(&self, key: &str) -> Result<Option<T>, ToolError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.option(key)
            .map(|raw| {
                let value = raw.trim();
                value
                    .parse::<T>()
                    .or_else(|e| value.to_ascii_lowercase().parse::<T>().map_err(|_| e))
                    .map_err(|e| {
                        ToolError::from(format!("option '{}' = '{}': {}", key, raw, e))
                    })
            })
            .transpose()
    }

    /// Committed rows of a table.
    pub fn rows(&self, table: &str) -> Result<Vec<Value>, ToolError> {
        Ok(self.session.store().rows(table)?)
    }

    /// Stages rows for one of the rule's output tables.
    pub fn insert_rows(&mut self, table: &str, rows: Vec<Value>) -> Result<(), ToolError> {
        self.ensure_output_table(table)?;
        self.session.add(Entity::Rows {
            table: table.to_string(),
            rows,
        });
        Ok(())
    }

    /// Stages removal of every row of one of the rule's output tables.
    pub fn clear_table(&mut self, table: &str) -> Result<(), ToolError> {
        self.ensure_output_table(table)?;
        self.session.add(Entity::ClearTable(table.to_string()));
        Ok(())
    }

    fn ensure_output_table(&self, table: &str) -> Result<(), ToolError> {
        if self
            .rule
            .tables_in(Direction::Output)
            .any(|t| t.table_name == table)
        {
            Ok(())
        } else {
            Err(format!(
                "rule '{}' cannot write table '{}': not a declared output",
                self.rule.name, table
            )
            .into())
        }
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.files.base_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::history::HistoryStore;
    use crate::storage::probe::TableProbe;
    use serde_json::json;

    #[test]
    fn test_option_constraint_parsing() {
        let c: OptionConstraint = "int".parse().unwrap();
        assert_eq!(c, OptionConstraint::optional(OptionKind::Int));

        let c: OptionConstraint = "required|float".parse().unwrap();
        assert_eq!(c, OptionConstraint::required(OptionKind::Float));

        let c: OptionConstraint = " Bool | REQUIRED ".parse().unwrap();
        assert_eq!(c, OptionConstraint::required(OptionKind::Bool));

        let c: OptionConstraint = "required".parse().unwrap();
        assert_eq!(c.kind, OptionKind::Str);
    }

    #[test]
    fn test_option_constraint_rejects_garbage() {
        assert!("integer".parse::<OptionConstraint>().is_err());
        assert!("int|float".parse::<OptionConstraint>().is_err());
    }

    #[test]
    fn test_option_kind_accepts() {
        assert!(OptionKind::Int.accepts("42"));
        assert!(OptionKind::Int.accepts(" -3 "));
        assert!(!OptionKind::Int.accepts("4.2"));
        assert!(OptionKind::Float.accepts("4.2"));
        assert!(OptionKind::Bool.accepts("True"));
        assert!(!OptionKind::Bool.accepts("yes"));
        assert!(OptionKind::Str.accepts("anything"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());

        registry.register("noop", FnTool::new(ToolSpec::new(), |_| Ok(())));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.identifiers().collect::<Vec<_>>(), vec!["noop"]);
    }

    #[test]
    fn test_context_accessors() {
        let store = Arc::new(HistoryStore::in_memory());
        let mut session = store.session();
        let files = LocalFiles::with_base_dir("/work");
        let rule = Rule::new("r", "t")
            .with_input_file("in", "data/in.txt")
            .with_output_file("out", "/abs/out.txt")
            .with_input_table("genes", "bio.models.Gene")
            .with_option("threads", "8");

        let ctx = ToolContext::new(&rule, &mut session, &files);
        assert_eq!(ctx.rule_name(), "r");
        assert_eq!(ctx.input_file("in").unwrap(), PathBuf::from("/work/data/in.txt"));
        assert_eq!(ctx.output_file("out").unwrap(), PathBuf::from("/abs/out.txt"));
        assert_eq!(ctx.input_table("genes").unwrap(), "Gene");
        assert!(ctx.output_file("in").is_err());
        assert_eq!(ctx.option_as::<u32>("threads").unwrap(), Some(8));
        assert_eq!(ctx.option_as::<u32>("missing").unwrap(), None);
        assert!(ctx.option_as::<bool>("threads").is_err());
    }

    #[test]
    fn test_validated_bool_options_read_as_bool() {
        let store = Arc::new(HistoryStore::in_memory());
        let mut session = store.session();
        let files = LocalFiles::new();
        let rule = Rule::new("r", "t")
            .with_option("verbose", "True")
            .with_option("strict", " FALSE ")
            .with_option("label", "Mixed Case");

        for value in ["True", " FALSE "] {
            assert!(OptionKind::Bool.accepts(value));
        }
        let ctx = ToolContext::new(&rule, &mut session, &files);
        assert_eq!(ctx.option_as::<bool>("verbose").unwrap(), Some(true));
        assert_eq!(ctx.option_as::<bool>("strict").unwrap(), Some(false));
        assert_eq!(
            ctx.option_as::<String>("label").unwrap().as_deref(),
            Some("Mixed Case")
        );
    }

    #[test]
    fn test_context_only_writes_declared_output_tables() {
        let store = Arc::new(HistoryStore::in_memory());
        let mut session = store.session();
        let files = LocalFiles::new();
        let rule = Rule::new("r", "t")
            .with_input_table("src", "models.Source")
            .with_output_table("dst", "models.Target");

        {
            let mut ctx = ToolContext::new(&rule, &mut session, &files);
            assert!(ctx.insert_rows("Source", vec![json!(1)]).is_err());
            ctx.insert_rows("Target", vec![json!(1), json!(2)]).unwrap();
        }
        session.commit().unwrap();

        assert_eq!(store.row_count("Target"), Some(2));
        assert_eq!(store.row_count("Source"), None);
    }
}

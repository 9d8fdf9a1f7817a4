//! Workflow Data Model
//!
//! Core data structures: rules, the files and tables they read and write, and
//! the workflow holding them.
//!
//! A rule never names the rules it depends on. Dependencies are inferred: rule
//! B follows rule A when one of A's outputs is one of B's inputs, either the
//! same file path or the same table model.
//!
//! # Example
//!
//! ```
//! use ruleflow::workflow::Rule;
//!
//! let sort = Rule::new("sort", "sort_lines")
//!     .with_input_file("raw", "data/raw.txt")
//!     .with_output_file("sorted", "work/sorted.txt");
//! let count = Rule::new("count", "count_lines")
//!     .with_input_file("lines", "work/sorted.txt")
//!     .with_output_file("total", "work/total.txt");
//!
//! assert!(count.follows(&sort));
//! assert!(!sort.follows(&count));
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleflowError};
use crate::storage::probe::{FileProbe, TableProbe};

/// Whether a file or table is read or written by a rule.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Lexically normalizes a path: drops `.` components and folds `..` into
/// the preceding component. The filesystem is not consulted.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last = normalized.components().next_back();
                let after_name = matches!(last, Some(Component::Normal(_)));
                let at_root = matches!(last, Some(Component::RootDir | Component::Prefix(_)));
                if after_name {
                    normalized.pop();
                } else if !at_root {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// Identity of a rule path: relative paths are taken under `base`.
fn resolved_path(path: &Path, base: Option<&Path>) -> PathBuf {
    match base {
        Some(dir) if path.is_relative() => normalize_path(&dir.join(path)),
        _ => normalize_path(path),
    }
}

/// A file read or written by a rule.
///
/// `mtime` and `size` are observations, filled by
/// [`Rule::set_observed_io_metadata`]; they are not part of equality.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileRef {
    /// Logical name within the rule (e.g. "reads")
    pub key: String,
    pub path: PathBuf,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl FileRef {
    /// Creates a file reference; the path is stored normalized, so
    /// `./work/a.txt` and `work/a.txt` are the same file.
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>, direction: Direction) -> Self {
        Self {
            key: key.into(),
            path: normalize_path(&path.into()),
            direction,
            mtime: None,
            size: None,
        }
    }
}

impl PartialEq for FileRef {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.path == other.path && self.direction == other.direction
    }
}

impl Eq for FileRef {}

impl Hash for FileRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.path.hash(state);
        self.direction.hash(state);
    }
}

/// A table read or written by a rule.
///
/// `model_path` identifies the data model (e.g. `genomics.models.Gene`);
/// `table_name` is the table holding its rows.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TableRef {
    pub key: String,
    pub model_path: String,
    pub table_name: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
}

impl TableRef {
    /// Creates a table reference; the table name is the last dotted segment
    /// of the model path.
    pub fn new(key: impl Into<String>, model_path: impl Into<String>, direction: Direction) -> Self {
        let model_path = model_path.into();
        let table_name = model_path
            .rsplit('.')
            .next()
            .unwrap_or(model_path.as_str())
            .to_string();
        Self {
            key: key.into(),
            model_path,
            table_name,
            direction,
            mtime: None,
        }
    }

    /// True if both references point at the same data model.
    pub fn same_model(&self, other: &TableRef) -> bool {
        self.model_path == other.model_path
    }
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.model_path == other.model_path
            && self.table_name == other.table_name
            && self.direction == other.direction
    }
}

impl Eq for TableRef {}

/// A parameter value given to a rule's tool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleOption {
    pub key: String,
    pub value: String,
}

/// Execution outcome of a rule.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    #[default]
    NotExecuted,
    Executed,
    /// Outputs from a previous execution were still valid
    AlreadyExecuted,
    /// Simulated run, no side effects
    Dry,
    Error,
    /// Outside the selected sub-DAG
    NotPlanned,
}

impl RuleStatus {
    /// True for the statuses that count as a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Executed | Self::AlreadyExecuted | Self::Dry)
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotExecuted => "NOT_EXECUTED",
            Self::Executed => "EXECUTED",
            Self::AlreadyExecuted => "ALREADY_EXECUTED",
            Self::Dry => "DRY",
            Self::Error => "ERROR",
            Self::NotPlanned => "NOT_PLANNED",
        };
        f.write_str(label)
    }
}

/// Result of the last readiness check on a rule's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Readiness {
    #[default]
    New,
    Ready,
    NotReady,
}

/// One step of a workflow: a tool applied to declared inputs and outputs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Rule {
    /// Unique within one workflow definition
    pub name: String,

    /// Identifier of the tool implementation in the registry
    pub tool: String,

    /// Execution this instance belongs to, once persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<u64>,

    #[serde(default)]
    pub files: Vec<FileRef>,

    #[serde(default)]
    pub tables: Vec<TableRef>,

    #[serde(default)]
    pub options: Vec<RuleOption>,

    #[serde(default)]
    pub status: RuleStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    readiness: Readiness,
}

impl Rule {
    /// Creates a rule with no inputs, outputs or options.
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            tool: tool.into().trim().to_string(),
            execution_id: None,
            files: Vec::new(),
            tables: Vec::new(),
            options: Vec::new(),
            status: RuleStatus::NotExecuted,
            started_at: None,
            finished_at: None,
            readiness: Readiness::New,
        }
    }

    pub fn with_input_file(mut self, key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.push(FileRef::new(key, path, Direction::Input));
        self
    }

    pub fn with_output_file(mut self, key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.push(FileRef::new(key, path, Direction::Output));
        self
    }

    pub fn with_input_table(mut self, key: impl Into<String>, model_path: impl Into<String>) -> Self {
        self.tables.push(TableRef::new(key, model_path, Direction::Input));
        self
    }

    pub fn with_output_table(mut self, key: impl Into<String>, model_path: impl Into<String>) -> Self {
        self.tables.push(TableRef::new(key, model_path, Direction::Output));
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push(RuleOption {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn files_in(&self, direction: Direction) -> impl Iterator<Item = &FileRef> {
        self.files.iter().filter(move |f| f.direction == direction)
    }

    pub fn tables_in(&self, direction: Direction) -> impl Iterator<Item = &TableRef> {
        self.tables.iter().filter(move |t| t.direction == direction)
    }

    pub fn file(&self, direction: Direction, key: &str) -> Option<&FileRef> {
        self.files_in(direction).find(|f| f.key == key)
    }

    pub fn table(&self, direction: Direction, key: &str) -> Option<&TableRef> {
        self.tables_in(direction).find(|t| t.key == key)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.key == key)
            .map(|o| o.value.as_str())
    }

    /// Keys of the files declared in one direction.
    pub fn file_keys(&self, direction: Direction) -> BTreeSet<String> {
        self.files_in(direction).map(|f| f.key.clone()).collect()
    }

    /// Keys of the tables declared in one direction.
    pub fn table_keys(&self, direction: Direction) -> BTreeSet<String> {
        self.tables_in(direction).map(|t| t.key.clone()).collect()
    }

    pub fn option_keys(&self) -> BTreeSet<String> {
        self.options.iter().map(|o| o.key.clone()).collect()
    }

    /// Wall time between start and finish, once both are recorded.
    pub fn run_duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// True if `other` produces something this rule consumes.
    ///
    /// Files match by normalized path, tables by model. This is the only
    /// source of edges in the workflow graph.
    pub fn follows(&self, other: &Rule) -> bool {
        self.follows_in(other, None)
    }

    /// Like [`Rule::follows`], with relative paths resolved under `base`, so
    /// a relative path and its absolute form name the same file.
    pub fn follows_in(&self, other: &Rule, base: Option<&Path>) -> bool {
        let by_file = self.files_in(Direction::Input).any(|input| {
            let input_path = resolved_path(&input.path, base);
            other
                .files_in(Direction::Output)
                .any(|output| resolved_path(&output.path, base) == input_path)
        });
        if by_file {
            return true;
        }
        self.tables_in(Direction::Input).any(|input| {
            other
                .tables_in(Direction::Output)
                .any(|output| output.same_model(input))
        })
    }

    /// Checks that every input file exists and every input table is non-empty.
    ///
    /// Updates the rule's readiness state.
    pub fn are_inputs_ready(&mut self, files: &dyn FileProbe, tables: &dyn TableProbe) -> bool {
        let ready = self.missing_inputs(files, tables).is_empty();
        self.readiness = if ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
        ready
    }

    /// Describes every input that is currently absent.
    pub fn missing_inputs(&self, files: &dyn FileProbe, tables: &dyn TableProbe) -> Vec<String> {
        let mut missing: Vec<String> = self
            .files_in(Direction::Input)
            .filter(|f| !files.exists(&f.path))
            .map(|f| format!("file '{}' ({})", f.path.display(), f.key))
            .collect();

        missing.extend(
            self.tables_in(Direction::Input)
                .filter(|t| tables.row_count(&t.table_name).unwrap_or(0) == 0)
                .map(|t| format!("table '{}' ({})", t.table_name, t.key)),
        );

        missing
    }

    /// Records current mtime/size of files and last modification of tables
    /// for one direction.
    pub fn set_observed_io_metadata(
        &mut self,
        direction: Direction,
        files: &dyn FileProbe,
        tables: &dyn TableProbe,
    ) {
        for file in self.files.iter_mut().filter(|f| f.direction == direction) {
            file.mtime = files.mtime(&file.path);
            file.size = files.size(&file.path);
        }
        for table in self.tables.iter_mut().filter(|t| t.direction == direction) {
            table.mtime = tables.last_modified(&table.table_name);
        }
    }

    /// True if both rules read the same inputs, observed at the same time.
    pub fn same_input_as(&self, other: &Rule) -> bool {
        let files_match = self.files_in(Direction::Input).count()
            == other.files_in(Direction::Input).count()
            && self.files_in(Direction::Input).all(|mine| {
                other.file(Direction::Input, &mine.key).is_some_and(|theirs| {
                    theirs.path == mine.path && theirs.mtime == mine.mtime
                })
            });

        let tables_match = self.tables_in(Direction::Input).count()
            == other.tables_in(Direction::Input).count()
            && self.tables_in(Direction::Input).all(|mine| {
                other.table(Direction::Input, &mine.key).is_some_and(|theirs| {
                    theirs.same_model(mine) && theirs.mtime == mine.mtime
                })
            });

        files_match && tables_match
    }

    /// Compares the newest recorded input against the oldest recorded output.
    ///
    /// Requires both directions to have been observed. A rule without outputs
    /// is never considered up to date.
    pub fn is_output_more_recent_than_input(&self) -> bool {
        let output_times: Vec<Option<DateTime<Utc>>> = self
            .files_in(Direction::Output)
            .map(|f| f.mtime)
            .chain(self.tables_in(Direction::Output).map(|t| t.mtime))
            .collect();

        if output_times.is_empty() || output_times.iter().any(Option::is_none) {
            return false;
        }
        let oldest_output = output_times.into_iter().flatten().min();

        let newest_input = self
            .files_in(Direction::Input)
            .map(|f| f.mtime)
            .chain(self.tables_in(Direction::Input).map(|t| t.mtime))
            .flatten()
            .max();

        match (newest_input, oldest_output) {
            (Some(input_time), Some(output_time)) => output_time >= input_time,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Checks that every output file exists and every output table has rows.
    pub fn output_exists(&self, files: &dyn FileProbe, tables: &dyn TableProbe) -> bool {
        self.files_in(Direction::Output).all(|f| files.exists(&f.path))
            && self
                .tables_in(Direction::Output)
                .all(|t| tables.row_count(&t.table_name).unwrap_or(0) > 0)
    }

    /// Output paths, used to create parent directories before running.
    pub fn output_paths(&self) -> Vec<&Path> {
        self.files_in(Direction::Output)
            .map(|f| f.path.as_path())
            .collect()
    }

    /// Resets execution state so the instance can be scheduled in a new run.
    pub fn reset_execution_state(&mut self) {
        self.execution_id = None;
        self.status = RuleStatus::NotExecuted;
        self.started_at = None;
        self.finished_at = None;
        self.readiness = Readiness::New;
    }
}

fn same_elements<T: PartialEq>(left: &[T], right: &[T]) -> bool {
    left.len() == right.len() && left.iter().all(|item| right.contains(item))
}

/// Structural equality: same tool, files, tables and options.
///
/// Name, status and observed metadata are ignored, so a rule from a previous
/// execution compares equal to the current one when nothing was edited.
impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.tool == other.tool
            && same_elements(&self.files, &other.files)
            && same_elements(&self.tables, &other.tables)
            && same_elements(&self.options, &other.options)
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tool.hash(state);
        let mut files: Vec<(&str, &Path, Direction)> = self
            .files
            .iter()
            .map(|f| (f.key.as_str(), f.path.as_path(), f.direction))
            .collect();
        files.sort();
        files.hash(state);
        let mut options: Vec<&RuleOption> = self.options.iter().collect();
        options.sort();
        options.hash(state);
    }
}

/// A complete workflow: its rules in definition order.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Workflow {
    pub rules: Vec<Rule>,

    /// Unique tool identifiers used (auto-populated)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl Workflow {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            tools: Vec::new(),
        }
    }

    /// Creates a workflow from rules, rejecting duplicate names.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let mut workflow = Self::new();
        for rule in rules {
            workflow.add_rule(rule)?;
        }
        Ok(workflow)
    }

    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(RuleflowError::DuplicateRule(rule.name));
        }
        self.rules.push(rule);
        self.refresh_tools();
        Ok(())
    }

    pub fn get_rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Position of a rule; this index is the rule's node id in the DAG.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    pub fn refresh_tools(&mut self) {
        let tool_set: BTreeSet<_> = self.rules.iter().map(|r| r.tool.clone()).collect();
        self.tools = tool_set.into_iter().collect();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::fs;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration as StdDuration;

    use crate::storage::probe::LocalFiles;
    use tempfile::tempdir;

    /// Table probe with fixed row counts.
    #[derive(Default)]
    struct FakeTables {
        rows: Mutex<HashMap<String, u64>>,
    }

    impl FakeTables {
        fn with(table: &str, rows: u64) -> Self {
            let fake = Self::default();
            fake.rows.lock().unwrap().insert(table.to_string(), rows);
            fake
        }
    }

    impl TableProbe for FakeTables {
        fn row_count(&self, table: &str) -> Option<u64> {
            self.rows.lock().unwrap().get(table).copied()
        }

        fn last_modified(&self, _table: &str) -> Option<DateTime<Utc>> {
            None
        }
    }

    #[test]
    fn test_rule_builder() {
        let rule = Rule::new(" align ", "aligner")
            .with_input_file("reads", "reads.fq")
            .with_output_file("bam", "out.bam")
            .with_input_table("genes", "bio.models.Gene")
            .with_option("threads", "4");

        assert_eq!(rule.name, "align");
        assert_eq!(rule.file_keys(Direction::Input).len(), 1);
        assert_eq!(rule.file_keys(Direction::Output).len(), 1);
        assert_eq!(rule.table(Direction::Input, "genes").unwrap().table_name, "Gene");
        assert_eq!(rule.option("threads"), Some("4"));
        assert_eq!(rule.status, RuleStatus::NotExecuted);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("./work/mid.txt")), PathBuf::from("work/mid.txt"));
        assert_eq!(normalize_path(Path::new("work/tmp/../mid.txt")), PathBuf::from("work/mid.txt"));
        assert_eq!(normalize_path(Path::new("/data/./x/../y")), PathBuf::from("/data/y"));
        assert_eq!(normalize_path(Path::new("../shared/a.txt")), PathBuf::from("../shared/a.txt"));
        assert_eq!(normalize_path(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(normalize_path(Path::new("a/..")), PathBuf::from("."));
    }

    #[test]
    fn test_file_ref_paths_are_normalized() {
        let plain = FileRef::new("in", "work/mid.txt", Direction::Input);
        let dotted = FileRef::new("in", "./work/mid.txt", Direction::Input);
        assert_eq!(plain, dotted);
        assert_eq!(dotted.path, PathBuf::from("work/mid.txt"));

        let producer = Rule::new("a", "t").with_output_file("o", "/run/work/mid.txt");
        let consumer = Rule::new("b", "t").with_input_file("i", "./work/mid.txt");
        assert!(!consumer.follows(&producer));
        assert!(consumer.follows_in(&producer, Some(Path::new("/run"))));
    }

    #[test]
    fn test_follows_by_file_path() {
        let a = Rule::new("a", "t").with_output_file("out", "x.txt");
        let b = Rule::new("b", "t").with_input_file("in", "x.txt");
        let c = Rule::new("c", "t").with_input_file("in", "y.txt");

        assert!(b.follows(&a));
        assert!(!a.follows(&b));
        assert!(!c.follows(&a));
    }

    #[test]
    fn test_follows_by_table_model() {
        let writer = Rule::new("w", "t").with_output_table("genes", "bio.models.Gene");
        let reader = Rule::new("r", "t").with_input_table("g", "bio.models.Gene");
        let other = Rule::new("o", "t").with_input_table("g", "bio.models.Protein");

        assert!(reader.follows(&writer));
        assert!(!other.follows(&writer));
    }

    #[test]
    fn test_structural_equality_ignores_name_and_status() {
        let mut first = Rule::new("first", "t")
            .with_input_file("in", "a.txt")
            .with_output_file("out", "b.txt")
            .with_option("n", "1");
        let second = Rule::new("second", "t")
            .with_option("n", "1")
            .with_output_file("out", "b.txt")
            .with_input_file("in", "a.txt");
        first.status = RuleStatus::Executed;

        assert_eq!(first, second);

        let mut set = HashSet::new();
        set.insert(first.clone());
        set.insert(second.clone());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_equality_detects_changed_option() {
        let a = Rule::new("a", "t").with_option("n", "1");
        let b = Rule::new("a", "t").with_option("n", "2");
        let c = Rule::new("a", "other").with_option("n", "1");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_inputs_ready_follows_filesystem() {
        let temp_dir = tempdir().unwrap();
        let input = temp_dir.path().join("input.txt");
        let files = LocalFiles::new();
        let tables = FakeTables::default();

        let mut rule = Rule::new("r", "t").with_input_file("in", &input);
        assert_eq!(rule.readiness(), Readiness::New);

        assert!(!rule.are_inputs_ready(&files, &tables));
        assert_eq!(rule.readiness(), Readiness::NotReady);

        fs::write(&input, "data").unwrap();
        assert!(rule.are_inputs_ready(&files, &tables));
        assert_eq!(rule.readiness(), Readiness::Ready);

        fs::remove_file(&input).unwrap();
        assert!(!rule.are_inputs_ready(&files, &tables));
    }

    #[test]
    fn test_inputs_ready_requires_non_empty_table() {
        let files = LocalFiles::new();
        let mut rule = Rule::new("r", "t").with_input_table("genes", "bio.Gene");

        assert!(!rule.are_inputs_ready(&files, &FakeTables::default()));
        assert!(!rule.are_inputs_ready(&files, &FakeTables::with("Gene", 0)));
        assert!(rule.are_inputs_ready(&files, &FakeTables::with("Gene", 3)));
    }

    #[test]
    fn test_missing_inputs_lists_each_input() {
        let rule = Rule::new("r", "t")
            .with_input_file("in", "/nonexistent/in.txt")
            .with_input_table("t", "models.T");
        let missing = rule.missing_inputs(&LocalFiles::new(), &FakeTables::default());

        assert_eq!(missing.len(), 2);
        assert!(missing[0].contains("/nonexistent/in.txt"));
        assert!(missing[1].contains("table 'T'"));
    }

    #[test]
    fn test_rule_without_inputs_is_ready() {
        let mut rule = Rule::new("r", "t").with_output_file("o", "o.txt");
        assert!(rule.are_inputs_ready(&LocalFiles::new(), &FakeTables::default()));
    }

    #[test]
    fn test_output_more_recent_than_input() {
        let temp_dir = tempdir().unwrap();
        let input = temp_dir.path().join("in.txt");
        let output = temp_dir.path().join("out.txt");
        let files = LocalFiles::new();
        let tables = FakeTables::default();

        fs::write(&input, "in").unwrap();
        thread::sleep(StdDuration::from_millis(20));
        fs::write(&output, "out").unwrap();

        let mut rule = Rule::new("r", "t")
            .with_input_file("in", &input)
            .with_output_file("out", &output);
        rule.set_observed_io_metadata(Direction::Input, &files, &tables);
        rule.set_observed_io_metadata(Direction::Output, &files, &tables);
        assert!(rule.is_output_more_recent_than_input());

        thread::sleep(StdDuration::from_millis(20));
        fs::write(&input, "newer").unwrap();
        rule.set_observed_io_metadata(Direction::Input, &files, &tables);
        assert!(!rule.is_output_more_recent_than_input());
    }

    #[test]
    fn test_output_not_recent_when_missing() {
        let files = LocalFiles::new();
        let tables = FakeTables::default();
        let mut rule = Rule::new("r", "t").with_output_file("out", "/nonexistent/out.txt");
        rule.set_observed_io_metadata(Direction::Output, &files, &tables);

        assert!(!rule.is_output_more_recent_than_input());
        assert!(!rule.output_exists(&files, &tables));
    }

    #[test]
    fn test_rule_without_outputs_never_up_to_date() {
        let rule = Rule::new("r", "t");
        assert!(!rule.is_output_more_recent_than_input());
    }

    #[test]
    fn test_same_input_as_compares_mtime() {
        let temp_dir = tempdir().unwrap();
        let input = temp_dir.path().join("in.txt");
        fs::write(&input, "v1").unwrap();
        let files = LocalFiles::new();
        let tables = FakeTables::default();

        let mut previous = Rule::new("r", "t").with_input_file("in", &input);
        previous.set_observed_io_metadata(Direction::Input, &files, &tables);

        let mut current = Rule::new("r", "t").with_input_file("in", &input);
        current.set_observed_io_metadata(Direction::Input, &files, &tables);
        assert!(current.same_input_as(&previous));

        thread::sleep(StdDuration::from_millis(20));
        fs::write(&input, "v2").unwrap();
        current.set_observed_io_metadata(Direction::Input, &files, &tables);
        assert!(!current.same_input_as(&previous));
    }

    #[test]
    fn test_same_input_as_rejects_different_paths() {
        let a = Rule::new("r", "t").with_input_file("in", "a.txt");
        let b = Rule::new("r", "t").with_input_file("in", "b.txt");
        assert!(!a.same_input_as(&b));
    }

    #[test]
    fn test_run_duration() {
        let mut rule = Rule::new("r", "t");
        assert!(rule.run_duration().is_none());

        let start = Utc::now();
        rule.started_at = Some(start);
        rule.finished_at = Some(start + Duration::milliseconds(250));
        assert_eq!(rule.run_duration(), Some(Duration::milliseconds(250)));
    }

    #[test]
    fn test_status_display_and_success() {
        assert_eq!(RuleStatus::AlreadyExecuted.to_string(), "ALREADY_EXECUTED");
        assert!(RuleStatus::Dry.is_success());
        assert!(!RuleStatus::Error.is_success());
        assert!(!RuleStatus::NotPlanned.is_success());
    }

    #[test]
    fn test_rule_serialization_keeps_metadata() {
        let mut rule = Rule::new("r", "t").with_input_file("in", "a.txt");
        rule.files[0].mtime = Some(Utc::now());
        rule.status = RuleStatus::Executed;

        let json = serde_json::to_string(&rule).unwrap();
        let loaded: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.files[0].mtime, rule.files[0].mtime);
        assert_eq!(loaded.status, RuleStatus::Executed);
        assert_eq!(loaded.readiness(), Readiness::New);
    }

    #[test]
    fn test_workflow_rejects_duplicate_names() {
        let mut workflow = Workflow::new();
        workflow.add_rule(Rule::new("a", "t")).unwrap();
        let err = workflow.add_rule(Rule::new("a", "u")).unwrap_err();
        assert!(matches!(err, RuleflowError::DuplicateRule(name) if name == "a"));
        assert_eq!(workflow.len(), 1);
    }

    #[test]
    fn test_workflow_tools_and_lookup() {
        let workflow = Workflow::from_rules(vec![
            Rule::new("a", "sort"),
            Rule::new("b", "count"),
            Rule::new("c", "sort"),
        ])
        .unwrap();

        assert_eq!(workflow.tools, vec!["count".to_string(), "sort".to_string()]);
        assert_eq!(workflow.index_of("c"), Some(2));
        assert!(workflow.get_rule("missing").is_none());
        assert!(!workflow.is_empty());
    }
}

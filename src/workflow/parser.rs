//! Workflow Parser
//!
//! Loads workflow definitions from YAML. A definition has an optional
//! `tools:` section declaring shell tools, and one `rule NAME:` entry per
//! rule, kept in file order:
//!
//! ```yaml
//! tools:
//!   wordcount:
//!     input: { file: [text] }
//!     output: { file: [counts] }
//!     params: { flags: "str" }
//!     command: "wc {option.flags} {input.text} > {output.counts}"
//!
//! rule count:
//!   tool: wordcount
//!   input:
//!     file: { text: data/in.txt }
//!   output:
//!     file: { counts: out/counts.txt }
//!   params: { flags: "-w" }
//! ```
//!
//! Tables are given as `KEY: model.path.TableName`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use super::model::{Rule, Workflow};
use super::validator::validate_workflow;
use crate::error::{Result, RuleflowError};
use crate::tool::{OptionConstraint, ShellTool, ToolRegistry, ToolSpec};

const TOOLS_KEY: &str = "tools";
const RULE_PREFIX: &str = "rule";

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct DeclaredKeys {
    #[serde(default)]
    file: Vec<String>,
    #[serde(default)]
    table: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ToolDefinition {
    #[serde(default)]
    input: DeclaredKeys,
    #[serde(default)]
    output: DeclaredKeys,
    #[serde(default)]
    params: BTreeMap<String, String>,
    command: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct BoundKeys {
    #[serde(default)]
    file: BTreeMap<String, String>,
    #[serde(default)]
    table: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RuleDefinition {
    tool: String,
    #[serde(default)]
    input: BoundKeys,
    #[serde(default)]
    output: BoundKeys,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

/// A parsed, validated workflow and the tools it runs with.
#[derive(Debug)]
pub struct LoadedWorkflow {
    pub workflow: Workflow,
    pub registry: ToolRegistry,
}

/// Loads a workflow file using only the shell tools it defines.
///
/// # Example
///
/// ```rust,no_run
/// use ruleflow::workflow::load_workflow;
///
/// fn main() -> ruleflow::Result<()> {
///     let loaded = load_workflow("ruleflow.yml")?;
///     println!("Loaded {} rules", loaded.workflow.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<LoadedWorkflow> {
    load_workflow_with(path, ToolRegistry::new())
}

/// Loads a workflow file on top of already-registered tools.
pub fn load_workflow_with(path: impl AsRef<Path>, registry: ToolRegistry) -> Result<LoadedWorkflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        RuleflowError::Definition(format!(
            "failed to read workflow file '{}': {}",
            path.display(),
            e
        ))
    })?;
    debug!("YAML content loaded ({} bytes)", content.len());

    parse_workflow_with(&content, registry)
}

pub fn parse_workflow(yaml: &str) -> Result<LoadedWorkflow> {
    parse_workflow_with(yaml, ToolRegistry::new())
}

/// Parses a definition, registers its shell tools, then validates every rule.
pub fn parse_workflow_with(yaml: &str, mut registry: ToolRegistry) -> Result<LoadedWorkflow> {
    let document: Mapping = if yaml.trim().is_empty() {
        Mapping::new()
    } else {
        serde_yaml::from_str::<Option<Mapping>>(yaml)?.unwrap_or_default()
    };

    let mut rule_entries = Vec::new();
    for (key, value) in document {
        let key = key.as_str().ok_or_else(|| {
            RuleflowError::Definition(format!("top-level keys must be strings, got {:?}", key))
        })?;

        if key == TOOLS_KEY {
            let tools: BTreeMap<String, ToolDefinition> = serde_yaml::from_value(value)?;
            for (identifier, definition) in tools {
                debug!("Registering shell tool '{}'", identifier);
                registry.register(identifier, shell_tool(definition)?);
            }
        } else {
            rule_entries.push((rule_name(key)?, value));
        }
    }

    let mut workflow = Workflow::new();
    for (name, value) in rule_entries {
        let definition: RuleDefinition = serde_yaml::from_value(value).map_err(|e| {
            RuleflowError::Definition(format!("rule '{}': {}", name, e))
        })?;
        workflow.add_rule(build_rule(&name, definition)?)?;
    }

    info!(
        "Parsed {} rules, {} tools available",
        workflow.len(),
        registry.len()
    );

    validate_workflow(&workflow, &registry)?;
    Ok(LoadedWorkflow { workflow, registry })
}

/// Extracts `NAME` from a `rule NAME` key.
fn rule_name(key: &str) -> Result<String> {
    match key.split_once(char::is_whitespace) {
        Some((RULE_PREFIX, name)) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        _ => Err(RuleflowError::Definition(format!(
            "unexpected top-level key '{}', expected 'tools' or 'rule NAME'",
            key
        ))),
    }
}

fn shell_tool(definition: ToolDefinition) -> Result<ShellTool> {
    let mut spec = ToolSpec::new();
    for key in definition.input.file {
        spec = spec.input_file(key);
    }
    for key in definition.output.file {
        spec = spec.output_file(key);
    }
    for key in definition.input.table {
        spec = spec.input_table(key);
    }
    for key in definition.output.table {
        spec = spec.output_table(key);
    }
    for (key, constraint) in definition.params {
        spec = spec.option(key, constraint.parse::<OptionConstraint>()?);
    }
    Ok(ShellTool::new(spec, definition.command))
}

fn build_rule(name: &str, definition: RuleDefinition) -> Result<Rule> {
    let mut rule = Rule::new(name, definition.tool);

    for (key, path) in definition.input.file {
        rule = rule.with_input_file(key, path);
    }
    for (key, path) in definition.output.file {
        rule = rule.with_output_file(key, path);
    }
    for (key, model) in definition.input.table {
        rule = rule.with_input_table(key, model);
    }
    for (key, model) in definition.output.table {
        rule = rule.with_output_table(key, model);
    }
    for (key, value) in definition.params {
        let value = scalar_to_string(name, &key, value)?;
        rule = rule.with_option(key, value);
    }

    Ok(rule)
}

fn scalar_to_string(rule: &str, key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(RuleflowError::Definition(format!(
            "rule '{}': option '{}' must be a scalar, got {:?}",
            rule, key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::FnTool;
    use crate::workflow::model::Direction;
    use tempfile::tempdir;

    const SORT_AND_COUNT: &str = r#"
tools:
  sort_lines:
    input: { file: [raw] }
    output: { file: [sorted] }
    params: { reverse: "bool" }
    command: sort {input.raw} > {output.sorted}
  count_lines:
    input: { file: [lines] }
    output: { table: [counts] }
    params: { min: "int|required" }
    command: wc -l {input.lines}

rule sort:
  tool: sort_lines
  input:
    file: { raw: data/raw.txt }
  output:
    file: { sorted: work/sorted.txt }
  params: { reverse: true }

rule count:
  tool: count_lines
  input:
    file: { lines: work/sorted.txt }
  output:
    table: { counts: stats.models.LineCount }
  params: { min: 3 }
"#;

    #[test]
    fn test_parse_rules_and_tools() {
        let loaded = parse_workflow(SORT_AND_COUNT).unwrap();
        let workflow = &loaded.workflow;

        assert_eq!(workflow.len(), 2);
        assert_eq!(workflow.rules[0].name, "sort");
        assert_eq!(workflow.rules[1].name, "count");
        assert_eq!(workflow.tools, vec!["count_lines", "sort_lines"]);
        assert!(loaded.registry.contains("sort_lines"));

        let count = &workflow.rules[1];
        assert_eq!(count.option("min"), Some("3"));
        assert_eq!(
            count.table(Direction::Output, "counts").unwrap().table_name,
            "LineCount"
        );
        assert_eq!(workflow.rules[0].option("reverse"), Some("true"));
        assert!(count.follows(&workflow.rules[0]));
    }

    #[test]
    fn test_rule_order_follows_file() {
        let yaml = r#"
tools:
  noop:
    command: "true"
rule zeta:
  tool: noop
rule alpha:
  tool: noop
"#;
        let loaded = parse_workflow(yaml).unwrap();
        let names: Vec<_> = loaded.workflow.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_unknown_top_level_key() {
        let err = parse_workflow("steps: []").unwrap_err();
        assert!(matches!(err, RuleflowError::Definition(_)));
        assert!(err.to_string().contains("steps"));
    }

    #[test]
    fn test_unknown_tool() {
        let yaml = "rule a:\n  tool: missing\n";
        assert!(matches!(
            parse_workflow(yaml),
            Err(RuleflowError::UnknownTool { .. })
        ));
    }

    #[test]
    fn test_pre_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "native",
            FnTool::new(ToolSpec::new().output_file("out"), |_| Ok(())),
        );
        let yaml = "rule a:\n  tool: native\n  output:\n    file: { out: a.txt }\n";

        let loaded = parse_workflow_with(yaml, registry).unwrap();
        assert_eq!(loaded.workflow.rules[0].tool, "native");
    }

    #[test]
    fn test_content_mismatch_is_rejected() {
        let yaml = r#"
tools:
  copy:
    input: { file: [src] }
    output: { file: [dst] }
    command: cp {input.src} {output.dst}
rule copy_it:
  tool: copy
  input:
    file: { source: a.txt }
  output:
    file: { dst: b.txt }
"#;
        assert!(matches!(
            parse_workflow(yaml),
            Err(RuleflowError::ContentMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_option_constraint() {
        let yaml = r#"
tools:
  t:
    params: { n: "integer" }
    command: "true"
"#;
        assert!(matches!(
            parse_workflow(yaml),
            Err(RuleflowError::Definition(_))
        ));
    }

    #[test]
    fn test_unknown_rule_field() {
        let yaml = r#"
tools:
  noop:
    command: "true"
rule a:
  tool: noop
  threads: 4
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(err.to_string().contains("rule 'a'"));
    }

    #[test]
    fn test_duplicate_rule_name() {
        let yaml = r#"
tools:
  noop:
    command: "true"
rule a:
  tool: noop
rule  a:
  tool: noop
"#;
        assert!(matches!(
            parse_workflow(yaml),
            Err(RuleflowError::DuplicateRule(_))
        ));
    }

    #[test]
    fn test_empty_document() {
        let loaded = parse_workflow("").unwrap();
        assert!(loaded.workflow.is_empty());
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let err = load_workflow("/nonexistent/path/ruleflow.yml").unwrap_err();
        assert!(err.to_string().contains("failed to read workflow file"));
    }

    #[test]
    fn test_load_workflow_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ruleflow.yml");
        fs::write(&path, SORT_AND_COUNT).unwrap();

        let loaded = load_workflow(&path).unwrap();
        assert_eq!(loaded.workflow.len(), 2);
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yml");
        fs::write(&path, "this is not valid yaml: [[[").unwrap();

        assert!(load_workflow(&path).is_err());
    }
}

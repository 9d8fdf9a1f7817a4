//! Workflow Validation
//!
//! Checks performed once, after loading and before any execution:
//! - Rule names are present and unique
//! - Every rule's tool is registered
//! - Declared file/table keys exactly match the tool specification
//! - Option values satisfy their declared constraints
//!
//! Cycle detection belongs to the DAG builder, see [`crate::workflow::dag`].

use std::collections::{BTreeSet, HashSet};

use log::{debug, info};

use super::model::{Direction, Rule, Workflow};
use crate::error::{Result, RuleflowError};
use crate::tool::{ToolRegistry, ToolSpec};

fn mismatch(rule: &Rule, detail: String) -> RuleflowError {
    RuleflowError::ContentMismatch {
        rule: rule.name.clone(),
        tool: rule.tool.clone(),
        detail,
    }
}

fn format_keys(keys: &BTreeSet<String>) -> String {
    if keys.is_empty() {
        return "none".to_string();
    }
    keys.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn check_keys(
    rule: &Rule,
    what: &str,
    declared: &BTreeSet<String>,
    found: BTreeSet<String>,
    found_count: usize,
) -> Result<()> {
    if found.len() != found_count {
        return Err(mismatch(rule, format!("{} declare the same key twice", what)));
    }
    if &found != declared {
        return Err(mismatch(
            rule,
            format!(
                "{}: tool expects [{}], rule declares [{}]",
                what,
                format_keys(declared),
                format_keys(&found)
            ),
        ));
    }
    Ok(())
}

/// Checks a rule's declared content against its tool specification.
///
/// Fails with `ContentMismatch` when file/table keys differ or an unknown
/// option is set, `MissingOption` when a required option is absent, and
/// `InvalidOptionValue` when a value does not parse as its declared type.
pub fn validate_content(rule: &Rule, spec: &ToolSpec) -> Result<()> {
    for direction in [Direction::Input, Direction::Output] {
        check_keys(
            rule,
            &format!("{} files", direction),
            spec.files(direction),
            rule.file_keys(direction),
            rule.files_in(direction).count(),
        )?;
        check_keys(
            rule,
            &format!("{} tables", direction),
            spec.tables(direction),
            rule.table_keys(direction),
            rule.tables_in(direction).count(),
        )?;
    }

    if rule.option_keys().len() != rule.options.len() {
        return Err(mismatch(rule, "an option is set twice".to_string()));
    }

    for option in &rule.options {
        let Some(constraint) = spec.options.get(&option.key) else {
            return Err(mismatch(
                rule,
                format!(
                    "unknown option '{}', tool accepts [{}]",
                    option.key,
                    format_keys(&spec.options.keys().cloned().collect())
                ),
            ));
        };
        if !constraint.kind.accepts(&option.value) {
            return Err(RuleflowError::InvalidOptionValue {
                rule: rule.name.clone(),
                option: option.key.clone(),
                expected: constraint.kind.to_string(),
                value: option.value.clone(),
            });
        }
    }

    for (key, constraint) in &spec.options {
        if constraint.required && rule.option(key).is_none() {
            return Err(RuleflowError::MissingOption {
                rule: rule.name.clone(),
                option: key.clone(),
            });
        }
    }

    debug!("Rule '{}' content matches tool '{}'", rule.name, rule.tool);
    Ok(())
}

/// Validates every rule of a workflow against the registry.
pub fn validate_workflow(workflow: &Workflow, registry: &ToolRegistry) -> Result<()> {
    info!("Validating workflow with {} rules", workflow.len());

    let mut seen: HashSet<&str> = HashSet::new();
    for rule in &workflow.rules {
        if rule.name.is_empty() {
            return Err(RuleflowError::Definition(
                "a rule has an empty name".to_string(),
            ));
        }
        if !seen.insert(rule.name.as_str()) {
            return Err(RuleflowError::DuplicateRule(rule.name.clone()));
        }

        let tool = registry
            .get(&rule.tool)
            .ok_or_else(|| RuleflowError::UnknownTool {
                rule: rule.name.clone(),
                tool: rule.tool.clone(),
            })?;
        validate_content(rule, &tool.specification())?;
    }

    info!(
        "Workflow validated: {} rules, {} tools",
        workflow.len(),
        workflow.tools.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{FnTool, OptionConstraint, OptionKind};

    fn spec() -> ToolSpec {
        ToolSpec::new()
            .input_file("reads")
            .output_file("aligned")
            .output_table("stats")
            .option("threads", OptionConstraint::required(OptionKind::Int))
            .option("ratio", OptionConstraint::optional(OptionKind::Float))
    }

    fn valid_rule() -> Rule {
        Rule::new("align", "aligner")
            .with_input_file("reads", "reads.fq")
            .with_output_file("aligned", "out.bam")
            .with_output_table("stats", "bio.models.Stats")
            .with_option("threads", "4")
    }

    #[test]
    fn test_valid_content() {
        assert!(validate_content(&valid_rule(), &spec()).is_ok());
        let with_ratio = valid_rule().with_option("ratio", "0.5");
        assert!(validate_content(&with_ratio, &spec()).is_ok());
    }

    #[test]
    fn test_missing_file_key() {
        let rule = Rule::new("align", "aligner")
            .with_output_file("aligned", "out.bam")
            .with_output_table("stats", "bio.models.Stats")
            .with_option("threads", "4");

        let err = validate_content(&rule, &spec()).unwrap_err();
        assert!(matches!(err, RuleflowError::ContentMismatch { .. }));
        assert!(err.to_string().contains("input files"));
    }

    #[test]
    fn test_extra_table_key() {
        let rule = valid_rule().with_input_table("extra", "bio.models.Extra");
        let err = validate_content(&rule, &spec()).unwrap_err();
        assert!(err.to_string().contains("input tables"));
    }

    #[test]
    fn test_key_in_wrong_direction() {
        let rule = Rule::new("align", "aligner")
            .with_output_file("reads", "reads.fq")
            .with_input_file("aligned", "out.bam")
            .with_output_table("stats", "bio.models.Stats")
            .with_option("threads", "4");
        assert!(matches!(
            validate_content(&rule, &spec()),
            Err(RuleflowError::ContentMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_key() {
        let rule = valid_rule().with_input_file("reads", "other.fq");
        let err = validate_content(&rule, &spec()).unwrap_err();
        assert!(err.to_string().contains("same key twice"));
    }

    #[test]
    fn test_missing_required_option() {
        let rule = Rule::new("align", "aligner")
            .with_input_file("reads", "reads.fq")
            .with_output_file("aligned", "out.bam")
            .with_output_table("stats", "bio.models.Stats");

        let err = validate_content(&rule, &spec()).unwrap_err();
        assert!(
            matches!(err, RuleflowError::MissingOption { ref option, .. } if option == "threads")
        );
    }

    #[test]
    fn test_wrong_option_type() {
        let rule = Rule::new("align", "aligner")
            .with_input_file("reads", "reads.fq")
            .with_output_file("aligned", "out.bam")
            .with_output_table("stats", "bio.models.Stats")
            .with_option("threads", "many");

        let err = validate_content(&rule, &spec()).unwrap_err();
        assert!(
            matches!(err, RuleflowError::InvalidOptionValue { ref expected, .. } if expected == "int")
        );
    }

    #[test]
    fn test_unknown_option() {
        let rule = valid_rule().with_option("colour", "red");
        let err = validate_content(&rule, &spec()).unwrap_err();
        assert!(err.to_string().contains("unknown option 'colour'"));
    }

    #[test]
    fn test_validate_workflow_unknown_tool() {
        let workflow = Workflow::from_rules(vec![valid_rule()]).unwrap();
        let registry = ToolRegistry::new();

        let err = validate_workflow(&workflow, &registry).unwrap_err();
        assert!(matches!(err, RuleflowError::UnknownTool { ref tool, .. } if tool == "aligner"));
    }

    #[test]
    fn test_validate_workflow_ok() {
        let workflow = Workflow::from_rules(vec![valid_rule()]).unwrap();
        let mut registry = ToolRegistry::new();
        registry.register("aligner", FnTool::new(spec(), |_| Ok(())));

        assert!(validate_workflow(&workflow, &registry).is_ok());
    }

    #[test]
    fn test_validate_workflow_duplicate_names() {
        let mut workflow = Workflow::new();
        workflow.rules.push(valid_rule());
        workflow.rules.push(valid_rule());
        let mut registry = ToolRegistry::new();
        registry.register("aligner", FnTool::new(spec(), |_| Ok(())));

        assert!(matches!(
            validate_workflow(&workflow, &registry),
            Err(RuleflowError::DuplicateRule(_))
        ));
    }
}

//! Shell Command Tools
//!
//! Tools defined in the workflow file as a bash command template, e.g.
//!
//! ```yaml
//! tools:
//!   sort_lines:
//!     input: { file: [raw] }
//!     output: { file: [sorted] }
//!     params: { reverse: "str" }
//!     command: sort {option.reverse} {input.raw} > {output.sorted}
//! ```
//!
//! # Placeholder Substitution
//!
//! - `{input.KEY}` / `{output.KEY}` - path of a file, or name of a table
//! - `{option.KEY}` - option value (empty when unset)
//! - `{input}` / `{output}` - every input / output file, space-separated

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use log::{debug, error, warn};
use tempfile::NamedTempFile;

use super::{Tool, ToolContext, ToolError, ToolSpec};
use crate::workflow::model::{Direction, Rule};

/// A tool that runs a bash command template.
#[derive(Debug, Clone)]
pub struct ShellTool {
    spec: ToolSpec,
    command: String,
}

impl ShellTool {
    pub fn new(spec: ToolSpec, command: impl Into<String>) -> Self {
        Self {
            spec,
            command: command.into().trim().to_string(),
        }
    }

    /// Substitutes the rule's files, tables and options into the template.
    pub fn render(&self, rule: &Rule) -> String {
        let mut text = self.command.clone();

        for option_key in self.spec.options.keys() {
            let placeholder = format!("{{option.{}}}", option_key);
            text = text.replace(&placeholder, rule.option(option_key).unwrap_or(""));
        }

        for direction in [Direction::Input, Direction::Output] {
            for file in rule.files_in(direction) {
                let placeholder = format!("{{{}.{}}}", direction, file.key);
                text = text.replace(&placeholder, &file.path.to_string_lossy());
            }
            for table in rule.tables_in(direction) {
                let placeholder = format!("{{{}.{}}}", direction, table.key);
                text = text.replace(&placeholder, &table.table_name);
            }

            let all_files = rule
                .files_in(direction)
                .map(|f| f.path.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            text = text.replace(&format!("{{{}}}", direction), &all_files);
        }

        text
    }
}

impl Tool for ShellTool {
    fn specification(&self) -> ToolSpec {
        self.spec.clone()
    }

    fn run(&self, ctx: &mut ToolContext<'_>) -> Result<(), ToolError> {
        let rule_name = ctx.rule_name().to_string();
        let command_text = self.render(ctx.rule());
        debug!("Rule '{}' command: {}", rule_name, command_text);

        let script = create_execution_script(&rule_name, &command_text)?;
        let output = execute_with_bash(script.path(), ctx.working_dir());

        let script_path = script.path().to_path_buf();
        if let Err(e) = script.close() {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }
        let output = output?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                debug!("Rule '{}' output:\n{}", rule_name, stdout);
            }
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Rule '{}' command exited with code {:?}",
            rule_name,
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }

        Err(format!(
            "command exited with code {:?}: {}",
            output.status.code(),
            stderr.trim()
        )
        .into())
    }
}

/// Writes the command into a bash script with `set -e`.
///
/// Every call gets its own file, removed when the returned handle is closed
/// or dropped.
fn create_execution_script(rule_name: &str, command_text: &str) -> Result<NamedTempFile, ToolError> {
    let script_dir = std::env::temp_dir().join("ruleflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let file_name: String = rule_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut script = tempfile::Builder::new()
        .prefix(&format!("rule_{}_", file_name))
        .suffix(".sh")
        .tempfile_in(&script_dir)?;

    writeln!(script, "#!/bin/bash")?;
    writeln!(script, "set -e")?;
    writeln!(script, "{}", command_text)?;
    script.flush()?;

    Ok(script)
}

fn execute_with_bash(
    script_path: &Path,
    working_dir: Option<&Path>,
) -> Result<std::process::Output, ToolError> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    Ok(cmd.output()?)
}

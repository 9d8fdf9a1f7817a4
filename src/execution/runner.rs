//! Rule Execution Unit
//!
//! Runs one rule once, on whichever thread calls [`RuleRunner::run`]:
//! - `dry`: outputs from a previous execution are still valid, the tool is
//!   not invoked and the rule becomes ALREADY_EXECUTED
//! - simulate: nothing is touched, the rule becomes DRY
//! - otherwise output directories are created, the tool runs in its own
//!   session, and the session is committed on success or rolled back on
//!   failure
//!
//! Subscribers are told how the unit ended through [`UnitEvent`]s.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info};

use crate::error::{Result, RuleflowError};
use crate::storage::history::HistoryStore;
use crate::storage::probe::LocalFiles;
use crate::tool::{Tool, ToolContext, ToolError};
use crate::workflow::model::{Direction, Rule, RuleStatus};

/// How a unit ended. Carries the rule with its final status and timestamps.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    Succeeded {
        index: usize,
        rule: Box<Rule>,
    },
    Failed {
        index: usize,
        rule: Box<Rule>,
        message: String,
    },
}

impl UnitEvent {
    pub fn index(&self) -> usize {
        match self {
            Self::Succeeded { index, .. } | Self::Failed { index, .. } => *index,
        }
    }
}

/// Receives unit completion events.
pub trait UnitObserver: Send {
    fn notify(&self, event: UnitEvent);
}

/// Forwards events to the scheduler thread.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<UnitEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<UnitEvent>) -> Self {
        Self { tx }
    }
}

impl UnitObserver for ChannelObserver {
    fn notify(&self, event: UnitEvent) {
        let index = event.index();
        if let Err(e) = self.tx.send(event) {
            error!("Failed to send completion of rule #{}: {}", index, e);
        }
    }
}

/// A single schedulable run of one rule.
pub struct RuleRunner {
    index: usize,
    rule: Rule,
    tool: Arc<dyn Tool>,
    dry: bool,
    simulate: bool,
    store: Arc<HistoryStore>,
    files: LocalFiles,
    observers: Vec<Box<dyn UnitObserver>>,
}

impl RuleRunner {
    pub fn new(
        index: usize,
        rule: Rule,
        tool: Arc<dyn Tool>,
        store: Arc<HistoryStore>,
        files: LocalFiles,
    ) -> Self {
        Self {
            index,
            rule,
            tool,
            dry: false,
            simulate: false,
            store,
            files,
            observers: Vec::new(),
        }
    }

    /// Marks the unit as already satisfied by a previous execution.
    pub fn with_dry(mut self, dry: bool) -> Self {
        self.dry = dry;
        self
    }

    pub fn with_simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    pub fn subscribe(&mut self, observer: Box<dyn UnitObserver>) {
        self.observers.push(observer);
    }

    /// Runs the unit and notifies subscribers. Consumes the unit, so it
    /// runs at most once.
    pub fn run(mut self) -> Result<Rule> {
        self.rule.started_at = Some(Utc::now());

        let outcome = if self.dry {
            info!("Rule '{}' already executed, skipping", self.rule.name);
            self.rule.status = RuleStatus::AlreadyExecuted;
            Ok(())
        } else if self.simulate {
            info!("[DRY RUN] Rule '{}' ({})", self.rule.name, self.rule.tool);
            self.rule.status = RuleStatus::Dry;
            Ok(())
        } else {
            self.execute()
        };

        self.rule.finished_at = Some(Utc::now());

        match outcome {
            Ok(()) => {
                if self.rule.status == RuleStatus::Executed {
                    self.rule
                        .set_observed_io_metadata(Direction::Output, &self.files, &*self.store);
                }
                debug!(
                    "Rule '{}' finished with status {}",
                    self.rule.name, self.rule.status
                );
                self.notify(UnitEvent::Succeeded {
                    index: self.index,
                    rule: Box::new(self.rule.clone()),
                });
                Ok(self.rule)
            }
            Err(message) => {
                self.rule.status = RuleStatus::Error;
                error!(
                    "Rule '{}' ({}) failed: {}",
                    self.rule.name, self.rule.tool, message
                );
                self.notify(UnitEvent::Failed {
                    index: self.index,
                    rule: Box::new(self.rule.clone()),
                    message: message.clone(),
                });
                Err(RuleflowError::RuleFailed {
                    rule: self.rule.name.clone(),
                    tool: self.rule.tool.clone(),
                    message,
                })
            }
        }
    }

    fn execute(&mut self) -> std::result::Result<(), String> {
        info!("Running rule '{}' ({})", self.rule.name, self.rule.tool);
        self.ensure_output_directories()
            .map_err(|e| format!("cannot create output directory: {}", e))?;

        let mut session = self.store.session();
        let result = {
            let mut ctx = ToolContext::new(&self.rule, &mut session, &self.files);
            let tool = &self.tool;
            panic::catch_unwind(AssertUnwindSafe(|| tool.run(&mut ctx)))
                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())))
        };

        match result {
            Ok(()) => {
                if let Err(e) = session.commit() {
                    session.rollback();
                    return Err(format!("commit failed: {}", e));
                }
                self.rule.status = RuleStatus::Executed;
                Ok(())
            }
            Err(e) => {
                session.rollback();
                Err(e.to_string())
            }
        }
    }

    fn ensure_output_directories(&self) -> std::io::Result<()> {
        for path in self.rule.output_paths() {
            let output_path = self.files.resolve(path);
            if let Some(parent) = output_path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                    debug!("Created directory: {}", parent.display());
                }
            }
        }
        Ok(())
    }

    fn notify(&self, event: UnitEvent) {
        for observer in &self.observers {
            observer.notify(event.clone());
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> ToolError {
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("tool panicked: {}", text).into()
}

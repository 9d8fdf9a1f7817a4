//! Workflow Manager
//!
//! Drives one execution of a workflow:
//! 1. Validates rules and builds the DAG (cycles abort here)
//! 2. Selects the sub-DAG between the optional start and end rules
//! 3. Runs rules as their predecessors complete, on at most
//!    `max_parallel` worker threads
//! 4. Records the execution as FINISHED or ERROR
//!
//! The scheduler thread owns all scheduling state. Workers report back over
//! an mpsc channel, so the ready queue, buffer and counters are never shared.
//!
//! A rule whose predecessors are done but whose inputs are missing waits in
//! a buffer and is retried each time another rule completes. When nothing is
//! running and no buffered rule has become ready, the run is stalled.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Duration;
use log::{debug, error, info, warn};

use super::queue::UniqueQueue;
use super::runner::{ChannelObserver, RuleRunner, UnitEvent};
use crate::error::{Result, RuleflowError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::storage::history::{ExecutionStatus, HistoryStore};
use crate::storage::probe::LocalFiles;
use crate::storage::session::Entity;
use crate::tool::ToolRegistry;
use crate::workflow::dag::Dag;
use crate::workflow::model::{Direction, Rule, RuleStatus, Workflow};
use crate::workflow::validator::validate_workflow;

/// Phase of the manager's current or last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Initial,
    BuildingDag,
    SelectingSubgraph,
    Executing,
    Finished,
    Failed,
}

/// Final status of one rule.
#[derive(Debug, Clone)]
pub struct RuleSummary {
    pub name: String,
    pub tool: String,
    pub status: RuleStatus,
    pub duration: Option<Duration>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: u64,
    pub status: ExecutionStatus,
    /// In definition order, including rules that were not planned
    pub rules: Vec<RuleSummary>,
    pub elapsed: std::time::Duration,
}

impl RunReport {
    pub fn count(&self, status: RuleStatus) -> usize {
        self.rules.iter().filter(|r| r.status == status).count()
    }

    pub fn rule(&self, name: &str) -> Option<&RuleSummary> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// Schedules and runs the rules of a workflow.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ruleflow::execution::WorkflowManager;
/// use ruleflow::storage::HistoryStore;
/// use ruleflow::workflow::load_workflow;
///
/// fn main() -> ruleflow::Result<()> {
///     let loaded = load_workflow("ruleflow.yml")?;
///     let store = Arc::new(HistoryStore::open(".ruleflow/history.json")?);
///
///     let mut manager = WorkflowManager::new(loaded.workflow, loaded.registry, store);
///     manager.set_max_parallel(4);
///     manager.set_until("report");
///
///     let report = manager.run()?;
///     println!("Execution #{} done", report.execution_id);
///     Ok(())
/// }
/// ```
pub struct WorkflowManager {
    workflow: Workflow,
    registry: ToolRegistry,
    store: Arc<HistoryStore>,
    start_from: Option<String>,
    until: Option<String>,
    force_all: bool,
    simulate: bool,
    max_parallel: usize,
    working_dir: Option<PathBuf>,
    timeline: ExecutionTimeline,
    state: ManagerState,
}

impl WorkflowManager {
    pub fn new(workflow: Workflow, registry: ToolRegistry, store: Arc<HistoryStore>) -> Self {
        Self {
            workflow,
            registry,
            store,
            start_from: None,
            until: None,
            force_all: false,
            simulate: false,
            max_parallel: 1,
            working_dir: None,
            timeline: ExecutionTimeline::new(),
            state: ManagerState::Initial,
        }
    }

    /// Restricts the run to this rule and everything downstream of it.
    pub fn set_start_from(&mut self, rule: impl Into<String>) {
        self.start_from = Some(rule.into());
    }

    /// Restricts the run to this rule and everything it depends on.
    pub fn set_until(&mut self, rule: impl Into<String>) {
        self.until = Some(rule.into());
    }

    /// Re-executes every rule even if a previous execution is still valid.
    pub fn set_force_all(&mut self, force_all: bool) {
        self.force_all = force_all;
    }

    /// Walks the workflow without running any tool.
    pub fn set_simulate(&mut self, simulate: bool) {
        self.simulate = simulate;
    }

    /// Sets the maximum number of rules running at once (at least 1).
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    /// Resolves relative rule paths and runs shell tools from this directory.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Removes every previous execution from the history.
    pub fn clear_history(&self) -> Result<()> {
        self.store.clear_history()
    }

    /// Full dependency graph of the workflow.
    ///
    /// Relative rule paths are resolved under the working directory, or the
    /// process's current directory when none is set.
    pub fn dag(&self) -> Result<Dag> {
        let base = match &self.working_dir {
            Some(dir) => Some(dir.clone()),
            None => std::env::current_dir().ok(),
        };
        Dag::build_in(&self.workflow.rules, base.as_deref())
    }

    /// Runs the workflow once.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - Every planned rule succeeded
    /// * `Err` - Configuration error, first rule failure, or stalled inputs
    pub fn run(&mut self) -> Result<RunReport> {
        let start_time = Instant::now();
        self.timeline = ExecutionTimeline::new();

        let result = self.run_execution(start_time);
        self.state = if result.is_ok() {
            ManagerState::Finished
        } else {
            ManagerState::Failed
        };
        result
    }

    fn run_execution(&mut self, start_time: Instant) -> Result<RunReport> {
        self.state = ManagerState::BuildingDag;
        validate_workflow(&self.workflow, &self.registry)?;
        for rule in &mut self.workflow.rules {
            rule.reset_execution_state();
        }
        let dag = self.dag()?;

        self.state = ManagerState::SelectingSubgraph;
        let planned = self.select_subgraph(&dag)?;
        for (index, rule) in self.workflow.rules.iter_mut().enumerate() {
            if !planned.contains(index) {
                debug!("Rule '{}' not planned", rule.name);
                rule.status = RuleStatus::NotPlanned;
            }
        }
        if planned.node_count() < dag.node_count() {
            info!(
                "Running {} of {} rules",
                planned.node_count(),
                dag.node_count()
            );
        }

        self.state = ManagerState::Executing;
        let mut execution = self.store.begin_execution()?;
        info!(
            "Starting execution #{} (max parallel: {}, force all: {}, dry run: {})",
            execution.id, self.max_parallel, self.force_all, self.simulate
        );

        let mut session = self.store.session();
        for index in planned.nodes() {
            let rule = &mut self.workflow.rules[index];
            rule.execution_id = Some(execution.id);
            session.add(Entity::Rule(Box::new(rule.clone())));
        }
        session.commit()?;

        let files = match &self.working_dir {
            Some(dir) => LocalFiles::with_base_dir(dir),
            None => LocalFiles::new(),
        };
        let (tx, rx) = channel();
        let scheduler = Scheduler {
            rules: &mut self.workflow.rules,
            registry: &self.registry,
            store: &self.store,
            dag: &planned,
            files,
            execution_id: execution.id,
            force_all: self.force_all,
            simulate: self.simulate,
            max_parallel: self.max_parallel,
            timeline: &mut self.timeline,
            ready: UniqueQueue::new(),
            buffer: Vec::new(),
            already_run: BTreeSet::new(),
            dispatched: BTreeSet::new(),
            running: 0,
            failure: None,
            tx,
            rx,
        };
        let outcome = scheduler.run();

        let status = if outcome.is_ok() {
            ExecutionStatus::Finished
        } else {
            ExecutionStatus::Error
        };
        execution.finish(status);
        let mut session = self.store.session();
        session.add(Entity::Execution(execution.clone()));
        match (session.commit(), outcome) {
            (Ok(()), Ok(())) => {}
            (Err(e), Ok(())) => return Err(e),
            (commit, Err(e)) => {
                if let Err(commit_err) = commit {
                    error!("Failed to record failed execution: {}", commit_err);
                }
                return Err(e);
            }
        }

        info!("Execution #{} finished", execution.id);
        Ok(self.report(execution.id, status, start_time))
    }

    fn select_subgraph(&self, dag: &Dag) -> Result<Dag> {
        let mut keep: BTreeSet<usize> = dag.nodes().collect();

        if let Some(name) = &self.start_from {
            let index = self
                .workflow
                .index_of(name)
                .ok_or_else(|| RuleflowError::UnknownRule(name.clone()))?;
            let downstream = dag.get_all_successors(index);
            keep.retain(|n| downstream.contains(n));
            info!("Starting from rule '{}'", name);
        }

        if let Some(name) = &self.until {
            let index = self
                .workflow
                .index_of(name)
                .ok_or_else(|| RuleflowError::UnknownRule(name.clone()))?;
            let upstream = dag.get_all_predecessors(index);
            keep.retain(|n| upstream.contains(n));
            info!("Running until rule '{}'", name);
        }

        Ok(dag.subgraph(&keep))
    }

    fn report(&self, execution_id: u64, status: ExecutionStatus, start_time: Instant) -> RunReport {
        RunReport {
            execution_id,
            status,
            rules: self
                .workflow
                .rules
                .iter()
                .map(|rule| RuleSummary {
                    name: rule.name.clone(),
                    tool: rule.tool.clone(),
                    status: rule.status,
                    duration: rule.run_duration(),
                })
                .collect(),
            elapsed: start_time.elapsed(),
        }
    }
}

/// Scheduling state of one execution, owned by the scheduler thread.
struct Scheduler<'m> {
    rules: &'m mut [Rule],
    registry: &'m ToolRegistry,
    store: &'m Arc<HistoryStore>,
    dag: &'m Dag,
    files: LocalFiles,
    execution_id: u64,
    force_all: bool,
    simulate: bool,
    max_parallel: usize,
    timeline: &'m mut ExecutionTimeline,

    ready: UniqueQueue<usize>,
    /// Rules whose inputs were missing when last examined, in arrival order
    buffer: Vec<usize>,
    already_run: BTreeSet<usize>,
    dispatched: BTreeSet<usize>,
    running: usize,
    failure: Option<RuleflowError>,
    tx: Sender<UnitEvent>,
    rx: Receiver<UnitEvent>,
}

impl Scheduler<'_> {
    fn run(mut self) -> Result<()> {
        self.execute_from(None);

        loop {
            if self.failure.is_none() {
                self.run_queue();
            }

            if self.running == 0 {
                if let Some(err) = self.failure.take() {
                    return Err(err);
                }
                if !self.ready.is_empty() {
                    continue;
                }
                if self.buffer.is_empty() {
                    info!("All {} planned rules completed", self.already_run.len());
                    return Ok(());
                }
                if !self.requeue_ready_buffered() {
                    return Err(self.stalled());
                }
                continue;
            }

            let event = self
                .rx
                .recv()
                .map_err(|e| RuleflowError::Scheduler(format!("completion channel closed: {}", e)))?;
            self.running -= 1;
            self.handle(event);
        }
    }

    /// Queues the not-yet-run successors of `node`, or the roots.
    fn execute_from(&mut self, node: Option<usize>) {
        for next in self.dag.successors(node) {
            if !self.already_run.contains(&next) {
                self.ready.push(next);
            }
        }
    }

    /// Dispatches queued rules until the queue is empty or the worker
    /// limit is reached.
    fn run_queue(&mut self) {
        while self.running < self.max_parallel {
            let Some(index) = self.ready.pop() else {
                break;
            };
            if self.already_run.contains(&index) || self.dispatched.contains(&index) {
                continue;
            }

            let predecessors_done = self
                .dag
                .predecessors(index)
                .iter()
                .all(|p| self.already_run.contains(p));
            if !predecessors_done {
                debug!(
                    "Rule '{}' waits for its predecessors",
                    self.rules[index].name
                );
                continue;
            }

            let inputs_ready = self.simulate
                || self.rules[index].are_inputs_ready(&self.files, &**self.store);
            if !inputs_ready {
                debug!("Rule '{}' inputs not ready, buffering", self.rules[index].name);
                if !self.buffer.contains(&index) {
                    self.buffer.push(index);
                }
                continue;
            }

            if let Err(e) = self.dispatch(index) {
                error!("Cannot dispatch rule '{}': {}", self.rules[index].name, e);
                self.failure = Some(e);
                return;
            }
        }
    }

    fn dispatch(&mut self, index: usize) -> Result<()> {
        let tool = {
            let rule = &self.rules[index];
            self.registry
                .get(&rule.tool)
                .ok_or_else(|| RuleflowError::UnknownTool {
                    rule: rule.name.clone(),
                    tool: rule.tool.clone(),
                })?
        };

        self.rules[index].execution_id = Some(self.execution_id);
        self.rules[index].set_observed_io_metadata(Direction::Input, &self.files, &**self.store);
        let dry = self.is_already_executed(index)?;

        let rule = self.rules[index].clone();
        let name = rule.name.clone();
        let mut unit = RuleRunner::new(index, rule, tool, Arc::clone(self.store), self.files.clone())
            .with_dry(dry)
            .with_simulate(self.simulate);
        unit.subscribe(Box::new(ChannelObserver::new(self.tx.clone())));

        self.timeline.add_event(name.as_str(), EventType::Started);
        thread::Builder::new()
            .name(format!("rule-{}", name))
            .spawn(move || {
                // The outcome reaches the scheduler through the observer.
                let _ = unit.run();
            })?;

        self.dispatched.insert(index);
        self.running += 1;
        Ok(())
    }

    /// True if an equal rule from another execution read the same inputs
    /// and its outputs are still present and newer than those inputs.
    fn is_already_executed(&mut self, index: usize) -> Result<bool> {
        if self.force_all {
            return Ok(false);
        }
        self.rules[index].set_observed_io_metadata(Direction::Output, &self.files, &**self.store);

        let rule = &self.rules[index];
        let execution_id = self.execution_id;
        let previous = self.store.query_rules(|p| {
            p.execution_id != Some(execution_id)
                && matches!(p.status, RuleStatus::Executed | RuleStatus::AlreadyExecuted)
                && p == rule
        })?;

        if !previous.iter().any(|p| rule.same_input_as(p)) {
            return Ok(false);
        }
        Ok(rule.output_exists(&self.files, &**self.store) && rule.is_output_more_recent_than_input())
    }

    fn handle(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Succeeded { index, rule } => {
                let event_type = if rule.status == RuleStatus::AlreadyExecuted {
                    EventType::Skipped
                } else {
                    EventType::Completed
                };
                self.timeline.add_event(rule.name.as_str(), event_type);
                self.rules[index] = *rule;
                self.already_run.insert(index);

                if let Err(e) = self.persist(index) {
                    error!("Failed to record rule '{}': {}", self.rules[index].name, e);
                    self.failure.get_or_insert(e);
                }
                if self.failure.is_some() {
                    return;
                }

                let buffered = std::mem::take(&mut self.buffer);
                self.ready.extend(buffered);
                self.execute_from(Some(index));
            }
            UnitEvent::Failed {
                index,
                rule,
                message,
            } => {
                self.timeline.add_event(rule.name.as_str(), EventType::Failed);
                let err = RuleflowError::RuleFailed {
                    rule: rule.name.clone(),
                    tool: rule.tool.clone(),
                    message,
                };
                self.rules[index] = *rule;

                if let Err(e) = self.persist(index) {
                    error!("Failed to record rule '{}': {}", self.rules[index].name, e);
                }
                if self.running > 0 {
                    warn!("Waiting for {} running rule(s) before stopping", self.running);
                }
                self.failure.get_or_insert(err);
            }
        }
    }

    fn persist(&self, index: usize) -> Result<()> {
        let mut session = self.store.session();
        session.add(Entity::Rule(Box::new(self.rules[index].clone())));
        session.commit()
    }

    /// Moves buffered rules whose inputs appeared back into the ready queue.
    fn requeue_ready_buffered(&mut self) -> bool {
        let mut requeued = false;
        for index in std::mem::take(&mut self.buffer) {
            if self.rules[index].are_inputs_ready(&self.files, &**self.store) {
                self.ready.push(index);
                requeued = true;
            } else {
                self.buffer.push(index);
            }
        }
        requeued
    }

    fn stalled(&self) -> RuleflowError {
        let Some(&index) = self.buffer.first() else {
            return RuleflowError::Scheduler("stalled with an empty buffer".to_string());
        };
        let rule = &self.rules[index];
        let missing = rule.missing_inputs(&self.files, &**self.store);
        error!(
            "Workflow stalled: {} rule(s) waiting, first is '{}'",
            self.buffer.len(),
            rule.name
        );
        RuleflowError::Stalled {
            rule: rule.name.clone(),
            missing,
        }
    }
}

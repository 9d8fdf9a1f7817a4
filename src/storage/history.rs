//! Execution History Store
//!
//! Persists every workflow execution, the rules run in it, and the user tables
//! tools write to. The whole store is one JSON document, rewritten on each
//! commit, e.g. `.ruleflow/history.json`.
//!
//! Access goes through an `RwLock`: queries share the read lock, commits take
//! the write lock and rewrite the file before releasing it, so a commit is
//! visible to every query issued after it returns.
//!
//! Several processes may share one history file. Every write holds an
//! exclusive lock on `<file>.lock`, re-reads the file, applies its change and
//! saves before unlocking, so execution ids stay unique and no process
//! erases another's records. Queries read this process's copy, refreshed on
//! each write.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fd_lock::RwLock as FileLock;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuleflowError};
use crate::storage::probe::TableProbe;
use crate::storage::session::{Entity, Session};
use crate::workflow::model::Rule;

/// Final state of a workflow execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Finished,
    Error,
}

/// One run of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
}

impl ExecutionRecord {
    /// Marks the execution as ended now.
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.finished_at = Some(Utc::now());
        self.status = status;
    }
}

/// Last time any row of a user table changed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TableModificationTime {
    pub table_name: String,
    pub modified_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct HistoryData {
    #[serde(default)]
    next_execution_id: u64,
    #[serde(default)]
    executions: Vec<ExecutionRecord>,
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    tables: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    modifications: BTreeMap<String, TableModificationTime>,
}

impl HistoryData {
    fn apply(&mut self, entity: Entity) {
        match entity {
            Entity::Execution(record) => {
                match self.executions.iter_mut().find(|e| e.id == record.id) {
                    Some(existing) => *existing = record,
                    None => self.executions.push(record),
                }
            }
            Entity::Rule(rule) => {
                let slot = self
                    .rules
                    .iter_mut()
                    .find(|r| r.execution_id == rule.execution_id && r.name == rule.name);
                match slot {
                    Some(existing) => *existing = *rule,
                    None => self.rules.push(*rule),
                }
            }
            Entity::Rows { table, rows } => {
                self.tables.entry(table.clone()).or_default().extend(rows);
                self.touch(table);
            }
            Entity::ClearTable(table) => {
                self.tables.insert(table.clone(), Vec::new());
                self.touch(table);
            }
        }
    }

    /// Stamps a table as modified now.
    fn touch(&mut self, table: String) {
        self.modifications.insert(
            table.clone(),
            TableModificationTime {
                table_name: table,
                modified_at: Utc::now(),
            },
        );
    }
}

/// Shared, transactional store of execution history and user tables.
#[derive(Debug)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    data: RwLock<HistoryData>,
}

impl HistoryStore {
    /// Creates a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(HistoryData::default()),
        }
    }

    /// Opens the store at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match load(&path)? {
            Some(data) => {
                info!(
                    "Loaded history from {} ({} previous executions)",
                    path.display(),
                    data.executions.len()
                );
                data
            }
            None => {
                debug!("No history at {}, starting empty", path.display());
                HistoryData::default()
            }
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// File backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Opens a new session on this store.
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HistoryData>> {
        self.data
            .read()
            .map_err(|_| RuleflowError::Store("history lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HistoryData>> {
        self.data
            .write()
            .map_err(|_| RuleflowError::Store("history lock poisoned".to_string()))
    }

    /// Applies staged entities atomically.
    ///
    /// If the file cannot be written the in-memory state is left untouched.
    pub(crate) fn apply(&self, entities: Vec<Entity>) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.update(|next| {
            for entity in entities {
                next.apply(entity);
            }
        })
    }

    /// Allocates and persists a new running execution.
    pub fn begin_execution(&self) -> Result<ExecutionRecord> {
        self.update(|next| {
            next.next_execution_id += 1;
            let record = ExecutionRecord {
                id: next.next_execution_id,
                started_at: Utc::now(),
                finished_at: None,
                status: ExecutionStatus::Running,
            };
            next.executions.push(record.clone());
            record
        })
    }

    pub fn executions(&self) -> Result<Vec<ExecutionRecord>> {
        Ok(self.read()?.executions.clone())
    }

    /// Returns persisted rules matching `filter`, oldest first.
    pub fn query_rules<F>(&self, filter: F) -> Result<Vec<Rule>>
    where
        F: Fn(&Rule) -> bool,
    {
        Ok(self
            .read()?
            .rules
            .iter()
            .filter(|r| filter(r))
            .cloned()
            .collect())
    }

    /// Committed rows of a table.
    pub fn rows(&self, table: &str) -> Result<Vec<Value>> {
        Ok(self.read()?.tables.get(table).cloned().unwrap_or_default())
    }

    /// Returns the modification record of a table, creating it when absent.
    pub fn get_or_create_modification(&self, table: &str) -> Result<TableModificationTime> {
        if let Some(existing) = self.read()?.modifications.get(table) {
            return Ok(existing.clone());
        }

        self.update(|next| {
            next.modifications
                .entry(table.to_string())
                .or_insert_with(|| TableModificationTime {
                    table_name: table.to_string(),
                    modified_at: Utc::now(),
                })
                .clone()
        })
    }

    /// Drops every past execution and rule record. Table data is kept.
    pub fn clear_history(&self) -> Result<()> {
        let removed = self.update(|next| {
            let removed = next.executions.len();
            next.executions.clear();
            next.rules.clear();
            removed
        })?;
        info!("Cleared {} previous executions from history", removed);
        Ok(())
    }

    /// Read-modify-write under both the in-process and the file lock.
    ///
    /// The change is applied to the latest saved state, or to this process's
    /// copy when nothing is saved yet.
    fn update<T>(&self, change: impl FnOnce(&mut HistoryData) -> T) -> Result<T> {
        let mut data = self.write()?;

        let Some(path) = &self.path else {
            let mut next = data.clone();
            let out = change(&mut next);
            *data = next;
            return Ok(out);
        };

        let mut lock = FileLock::new(open_lock_file(path)?);
        let _guard = lock.write()?;

        let mut next = match load(path)? {
            Some(saved) => saved,
            None => data.clone(),
        };
        let out = change(&mut next);
        self.save(&next)?;
        *data = next;
        Ok(out)
    }

    fn save(&self, data: &HistoryData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, path)?;

        debug!("Saved history to {}", path.display());
        Ok(())
    }
}

/// Reads a saved history, `None` when the file does not exist.
fn load(path: &Path) -> Result<Option<HistoryData>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Opens `<file>.lock` next to the history file, creating its directory.
fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut lock_name = path.as_os_str().to_os_string();
    lock_name.push(".lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(PathBuf::from(lock_name))?;
    Ok(file)
}

impl TableProbe for HistoryStore {
    fn row_count(&self, table: &str) -> Option<u64> {
        let data = self.data.read().ok()?;
        data.tables.get(table).map(|rows| rows.len() as u64)
    }

    fn last_modified(&self, table: &str) -> Option<DateTime<Utc>> {
        let data = self.data.read().ok()?;
        data.modifications.get(table).map(|m| m.modified_at)
    }
}

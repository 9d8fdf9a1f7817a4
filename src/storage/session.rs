//! Transactional Sessions
//!
//! A session stages writes and applies them to the [`HistoryStore`] in one
//! commit. Each execution unit owns its own session, so a failing tool only
//! discards its own staged rows.

use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::error::Result;
use crate::storage::history::{ExecutionRecord, HistoryStore, TableModificationTime};
use crate::workflow::model::Rule;

/// Something a session can stage for commit.
#[derive(Debug, Clone)]
pub enum Entity {
    /// Inserts or replaces an execution record (by id)
    Execution(ExecutionRecord),
    /// Inserts or replaces a rule record (by execution id and rule name)
    Rule(Box<Rule>),
    /// Appends rows to a user table
    Rows { table: String, rows: Vec<Value> },
    /// Removes every row of a user table
    ClearTable(String),
}

/// Unit of work over the history store.
#[derive(Debug)]
pub struct Session {
    store: Arc<HistoryStore>,
    pending: Vec<Entity>,
}

impl Session {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self {
            store,
            pending: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    /// Stages an entity; nothing is visible to others until [`commit`](Self::commit).
    pub fn add(&mut self, entity: Entity) {
        self.pending.push(entity);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Applies every staged entity atomically.
    pub fn commit(&mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.pending);
        if !staged.is_empty() {
            debug!("Committing {} staged change(s)", staged.len());
        }
        self.store.apply(staged)
    }

    /// Discards every staged entity.
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() {
            debug!("Rolling back {} staged change(s)", self.pending.len());
        }
        self.pending.clear();
    }

    pub fn query_rules<F>(&self, filter: F) -> Result<Vec<Rule>>
    where
        F: Fn(&Rule) -> bool,
    {
        self.store.query_rules(filter)
    }

    pub fn query_executions(&self) -> Result<Vec<ExecutionRecord>> {
        self.store.executions()
    }

    pub fn get_or_create_modification(&self, table: &str) -> Result<TableModificationTime> {
        self.store.get_or_create_modification(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::history::ExecutionStatus;
    use crate::storage::probe::TableProbe;
    use serde_json::json;

    #[test]
    fn test_commit_makes_rows_visible() {
        let store = Arc::new(HistoryStore::in_memory());
        let mut session = store.session();

        session.add(Entity::Rows {
            table: "T".into(),
            rows: vec![json!({"id": 1})],
        });
        assert!(session.has_pending());
        assert_eq!(store.row_count("T"), None);

        session.commit().unwrap();
        assert!(!session.has_pending());
        assert_eq!(store.row_count("T"), Some(1));
    }

    #[test]
    fn test_rollback_discards_staged_rows() {
        let store = Arc::new(HistoryStore::in_memory());
        let mut session = store.session();

        session.add(Entity::Rows {
            table: "T".into(),
            rows: vec![json!(1), json!(2)],
        });
        session.rollback();
        session.commit().unwrap();

        assert_eq!(store.row_count("T"), None);
    }

    #[test]
    fn test_sessions_see_each_others_commits() {
        let store = Arc::new(HistoryStore::in_memory());
        let mut writer = store.session();
        let reader = store.session();

        let mut rule = Rule::new("a", "t");
        rule.execution_id = Some(7);
        writer.add(Entity::Rule(Box::new(rule)));
        writer.commit().unwrap();

        let found = reader.query_rules(|r| r.execution_id == Some(7)).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_finished_execution_is_visible_to_queries() {
        let store = Arc::new(HistoryStore::in_memory());
        let mut session = store.session();

        let mut execution = store.begin_execution().unwrap();
        execution.finish(ExecutionStatus::Finished);
        session.add(Entity::Execution(execution.clone()));
        assert_eq!(
            session.query_executions().unwrap()[0].status,
            ExecutionStatus::Running
        );

        session.commit().unwrap();
        let executions = session.query_executions().unwrap();
        assert_eq!(executions, vec![execution]);
        assert!(executions[0].finished_at.is_some());
    }
}

//! Persistence Module
//!
//! Execution history, user tables, and the probes used to observe files and
//! tables.
//!
//! - [`history`]: JSON-backed store of executions, rules and tables
//! - [`session`]: Staged, atomically committed writes
//! - [`probe`]: File and table observation traits

pub mod history;
pub mod probe;
pub mod session;

pub use history::{ExecutionRecord, ExecutionStatus, HistoryStore, TableModificationTime};
pub use probe::{FileProbe, LocalFiles, TableProbe};
pub use session::{Entity, Session};

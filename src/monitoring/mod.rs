//! Run Monitoring Module
//!
//! - [`ExecutionTimeline`]: Rule dispatch/completion timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};

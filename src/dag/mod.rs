//! Task dependency graphs.
//!
//! A workflow's tasks form a directed acyclic graph. The builder rejects
//! cycles (reporting every cyclic component as an ordered path) and yields
//! a deterministic topological order from which workflow steps are planned.
//!
//! ```
//! use foreman::dag::{DagBuilder, TaskNode};
//!
//! let graph = DagBuilder::new(vec![
//!     TaskNode::new("schema", "Add schema", &[]),
//!     TaskNode::new("api", "Expose API", &["schema"]),
//!     TaskNode::new("docs", "Document API", &["api"]),
//! ])
//! .build()
//! .unwrap();
//! assert_eq!(graph.topological_order(), vec![0, 1, 2]);
//! ```

mod builder;
mod resolve;

pub use builder::{DagBuilder, TaskGraph, TaskIndex, TaskNode};
pub use resolve::{plan_steps, resolve_source, task_node};

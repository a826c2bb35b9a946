//! Repository inspection: heads, diff stats and checkpoint commits.

mod git;

pub use git::GitTracker;

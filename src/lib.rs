pub mod config;
#[cfg(unix)]
pub mod control;
pub mod dag;
pub mod db;
pub mod errors;
pub mod foreman_config;
pub mod lineage;
pub mod locks;
pub mod logging;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod promote;
pub mod runner;
pub mod supervisor;
pub mod tasks;
pub mod tracker;
pub mod wakeup;
pub mod worktree;

#[cfg(test)]
mod test_support;

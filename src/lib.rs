//! Mender library crate
//!
//! The agent loop (plan, execute, recover, verify, roll back) and the
//! collaborators it drives. The `mender` binary is a thin CLI over these
//! modules; the HTTP surface lives in [`server`].

pub mod budget;
pub mod config;
pub mod context;
pub mod diff;
pub mod engine;
pub mod error;
pub mod git_ops;
pub mod llm;
pub mod logging;
pub mod patch;
pub mod plan;
pub mod rate_limit;
pub mod research;
pub mod server;
pub mod shell;
pub mod usage;
pub mod util;
pub mod workspace;

#[cfg(test)]
mod test_support;

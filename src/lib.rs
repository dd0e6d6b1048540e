//! Agent Jobs — background workflow jobs driven by a pluggable step executor.

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod worker;
pub mod workflow;

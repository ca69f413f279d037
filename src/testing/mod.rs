//! Scenario test runner
//!
//! Reads YAML test scenarios, resolves their assets and runs them against
//! an emulator, printing a pass/fail report per scenario.

mod config;
mod runner;

pub use config::*;
pub use runner::{run_scenario, Harness, TestResult};

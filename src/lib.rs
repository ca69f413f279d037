//! functest - a functional-test harness for emulated guests
//!
//! Fetches and verifies kernel and disk assets into a content-addressed
//! cache, boots them under an emulator and drives the guest serial console
//! through ordered, fail-fast scenarios.

pub mod archive;
pub mod assets;
pub mod cli;
pub mod commands;
pub mod common;
pub mod console;
pub mod scenario;
pub mod testing;
pub mod vm;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use scenario::{Scenario, ScenarioContext, ScenarioOutcome, ScenarioStep};

//! insanity - distributed test runner
//!
//! Runs test instances, most of them in supervised worker processes,
//! drives their lifecycle over a private message bus, enforces timeouts
//! and aggregates their checklists into success percentages. Tests can be
//! composed into scenarios and observed by monitors.

pub mod bus;
pub mod cli;
pub mod commands;
pub mod common;
pub mod events;
pub mod monitor;
pub mod run;
pub mod scenario;
pub mod supervisor;
pub mod test;

// Re-export commonly used types
pub use common::{Error, Result};
pub use monitor::{Monitor, MonitorConfig, MonitorFactory};
pub use run::storage::Storage;
pub use run::{RunController, RunEvent, RunOptions, RunSummary, TestRun};
pub use scenario::{ScenarioPolicy, ScenarioType, SubTests};
pub use test::{
    ArgumentSet, CheckResult, LocalTestType, RemoteTestType, StopReason, TestFactory, TestReport,
    TestSchema,
};

//! Where a run reports its progress
//!
//! The run calls these hooks synchronously from its loop. Implementations
//! that do slow work should buffer it; errors are logged by the run and
//! never stop it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::environment::Environment;
use crate::common::{Error, Result};
use crate::test::TestReport;

/// Identity of a run as handed to storage
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub environment: Environment,
}

pub trait Storage {
    fn start_new_test_run(&mut self, run: &RunInfo, client_id: Option<&str>) -> Result<()>;

    fn end_test_run(&mut self, run: &RunInfo) -> Result<()>;

    fn new_test_started(&mut self, run: &RunInfo, test: &TestReport, iteration: u32) -> Result<()>;

    fn new_test_stopped(&mut self, run: &RunInfo, test: &TestReport, iteration: u32) -> Result<()>;

    fn new_test_finished(&mut self, run: &RunInfo, test: &TestReport) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStorage;

impl Storage for NullStorage {
    fn start_new_test_run(&mut self, _run: &RunInfo, _client_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn end_test_run(&mut self, _run: &RunInfo) -> Result<()> {
        Ok(())
    }

    fn new_test_started(&mut self, _run: &RunInfo, _test: &TestReport, _iteration: u32) -> Result<()> {
        Ok(())
    }

    fn new_test_stopped(&mut self, _run: &RunInfo, _test: &TestReport, _iteration: u32) -> Result<()> {
        Ok(())
    }

    fn new_test_finished(&mut self, _run: &RunInfo, _test: &TestReport) -> Result<()> {
        Ok(())
    }
}

/// Writes every call to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStorage;

impl Storage for LogStorage {
    fn start_new_test_run(&mut self, run: &RunInfo, client_id: Option<&str>) -> Result<()> {
        tracing::info!(run = %run.id, client = client_id.unwrap_or("-"), os = %run.environment.os_type, "test run started");
        Ok(())
    }

    fn end_test_run(&mut self, run: &RunInfo) -> Result<()> {
        tracing::info!(run = %run.id, "test run ended");
        Ok(())
    }

    fn new_test_started(&mut self, run: &RunInfo, test: &TestReport, iteration: u32) -> Result<()> {
        tracing::info!(run = %run.id, uuid = %test.uuid, test = test.name(), iteration, "test started");
        Ok(())
    }

    fn new_test_stopped(&mut self, run: &RunInfo, test: &TestReport, iteration: u32) -> Result<()> {
        tracing::info!(run = %run.id, uuid = %test.uuid, test = test.name(), iteration, "test stopped");
        Ok(())
    }

    fn new_test_finished(&mut self, run: &RunInfo, test: &TestReport) -> Result<()> {
        tracing::info!(
            run = %run.id,
            uuid = %test.uuid,
            test = test.name(),
            success = test.success_percentage,
            "test finished"
        );
        Ok(())
    }
}

/// One recorded storage call
#[derive(Debug, Clone)]
pub enum StorageCall {
    StartRun { run: Uuid, client_id: Option<String> },
    EndRun { run: Uuid },
    Started { test: Uuid, iteration: u32 },
    Stopped { test: Uuid, iteration: u32 },
    Finished(Box<TestReport>),
}

/// Keeps every call in memory; clones share the record
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    calls: Arc<Mutex<Vec<StorageCall>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Reports of the finished tests, in finishing order
    pub fn finished(&self) -> Vec<TestReport> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StorageCall::Finished(report) => Some(*report),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: StorageCall) -> Result<()> {
        self.calls
            .lock()
            .map_err(|_| Error::Internal("storage lock poisoned".to_string()))?
            .push(call);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn start_new_test_run(&mut self, run: &RunInfo, client_id: Option<&str>) -> Result<()> {
        self.record(StorageCall::StartRun {
            run: run.id,
            client_id: client_id.map(str::to_string),
        })
    }

    fn end_test_run(&mut self, run: &RunInfo) -> Result<()> {
        self.record(StorageCall::EndRun { run: run.id })
    }

    fn new_test_started(&mut self, _run: &RunInfo, test: &TestReport, iteration: u32) -> Result<()> {
        self.record(StorageCall::Started {
            test: test.uuid,
            iteration,
        })
    }

    fn new_test_stopped(&mut self, _run: &RunInfo, test: &TestReport, iteration: u32) -> Result<()> {
        self.record(StorageCall::Stopped {
            test: test.uuid,
            iteration,
        })
    }

    fn new_test_finished(&mut self, _run: &RunInfo, test: &TestReport) -> Result<()> {
        self.record(StorageCall::Finished(Box::new(test.clone())))
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    run: &'a RunInfo,
    client_id: Option<&'a str>,
    ended_at: DateTime<Utc>,
    tests: &'a [TestReport],
}

/// Collects finished tests and writes them as one JSON document at the end
#[derive(Debug)]
pub struct JsonReportStorage {
    path: PathBuf,
    client_id: Option<String>,
    tests: Vec<TestReport>,
}

impl JsonReportStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            client_id: None,
            tests: Vec::new(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Storage for JsonReportStorage {
    fn start_new_test_run(&mut self, _run: &RunInfo, client_id: Option<&str>) -> Result<()> {
        self.client_id = client_id.map(str::to_string);
        self.tests.clear();
        Ok(())
    }

    fn end_test_run(&mut self, run: &RunInfo) -> Result<()> {
        let report = JsonReport {
            run,
            client_id: self.client_id.as_deref(),
            ended_at: Utc::now(),
            tests: &self.tests,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&self.path, json).map_err(|e| Error::FileWrite {
            path: self.path.display().to_string(),
            error: e.to_string(),
        })?;
        tracing::info!(path = %self.path.display(), "report written");
        Ok(())
    }

    fn new_test_started(&mut self, _run: &RunInfo, _test: &TestReport, _iteration: u32) -> Result<()> {
        Ok(())
    }

    fn new_test_stopped(&mut self, _run: &RunInfo, _test: &TestReport, _iteration: u32) -> Result<()> {
        Ok(())
    }

    fn new_test_finished(&mut self, _run: &RunInfo, test: &TestReport) -> Result<()> {
        self.tests.push(test.clone());
        Ok(())
    }
}

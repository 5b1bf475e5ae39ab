//! Monitor hook contract and the built-in monitors
//!
//! Monitors attach to a test instance. They are set up before the test's
//! own setup (and can adjust its launch parameters and timeouts), started
//! and stopped with every iteration, and torn down after the test. Their
//! results are reported next to the test's own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::supervisor::LaunchConfig;
use crate::test::TestKind;

/// Results gathered by a monitor
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorResults {
    /// Declared checklist items and their descriptions
    declared: BTreeMap<String, String>,
    checklist: BTreeMap<String, bool>,
    extra_info: BTreeMap<String, Value>,
    output_files: BTreeMap<String, PathBuf>,
}

impl MonitorResults {
    /// Results for a monitor declaring the given checklist items
    pub fn declaring<'a>(items: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            declared: items
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    /// Mark a declared item; undeclared items are ignored
    pub fn validate(&mut self, item: &str, ok: bool) {
        if self.declared.contains_key(item) {
            self.checklist.entry(item.to_string()).or_insert(ok);
        } else {
            tracing::debug!(item, "monitor validated an undeclared item");
        }
    }

    pub fn extra_info(&mut self, key: &str, value: impl Into<Value>) {
        self.extra_info.insert(key.to_string(), value.into());
    }

    pub fn set_output_file(&mut self, name: &str, path: impl Into<PathBuf>) {
        self.output_files.insert(name.to_string(), path.into());
    }

    pub fn checklist(&self) -> &BTreeMap<String, bool> {
        &self.checklist
    }

    pub fn output_files(&self) -> &BTreeMap<String, PathBuf> {
        &self.output_files
    }

    /// 100 when nothing is declared
    pub fn success_percentage(&self) -> f64 {
        if self.declared.is_empty() {
            return 100.0;
        }
        let passed = self
            .declared
            .keys()
            .filter(|item| self.checklist.get(*item).copied().unwrap_or(false))
            .count();
        100.0 * passed as f64 / self.declared.len() as f64
    }
}

/// Final view of a monitor, stored with the test report
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub name: String,
    pub checklist: BTreeMap<String, bool>,
    pub extra_info: BTreeMap<String, Value>,
    pub output_files: BTreeMap<String, PathBuf>,
    pub success_percentage: f64,
}

/// What a monitor may adjust on the test it is attached to
pub struct MonitorHost<'a> {
    pub(crate) launch: Option<&'a mut LaunchConfig>,
    pub(crate) timeout: Duration,
    pub(crate) async_setup_timeout: Duration,
    pub(crate) output_dir: &'a Path,
}

impl MonitorHost<'_> {
    /// Launch parameters, for tests running in a worker process
    pub fn launch_config(&mut self) -> Option<&mut LaunchConfig> {
        self.launch.as_deref_mut()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn async_setup_timeout(&self) -> Duration {
        self.async_setup_timeout
    }

    pub fn set_async_setup_timeout(&mut self, timeout: Duration) {
        self.async_setup_timeout = timeout;
    }

    /// Directory for files the monitor produces
    pub fn output_dir(&self) -> &Path {
        self.output_dir
    }
}

pub trait Monitor {
    fn name(&self) -> &str;

    /// Returning false fails the test's setup
    fn set_up(&mut self, _host: &mut MonitorHost<'_>) -> bool {
        true
    }

    fn start(&mut self, _iteration: u32) -> bool {
        true
    }

    fn stop(&mut self) -> bool {
        true
    }

    fn prepare_tear_down(&mut self) {}

    fn tear_down(&mut self) -> bool {
        true
    }

    fn results(&self) -> &MonitorResults;

    fn report(&self) -> MonitorReport {
        let results = self.results();
        MonitorReport {
            name: self.name().to_string(),
            checklist: results.checklist.clone(),
            extra_info: results.extra_info.clone(),
            output_files: results.output_files.clone(),
            success_percentage: results.success_percentage(),
        }
    }
}

/// Kind of tests a monitor can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliesOn {
    AnyTest,
    RemoteTests,
}

impl AppliesOn {
    pub fn accepts(self, kind: TestKind) -> bool {
        match self {
            AppliesOn::AnyTest => true,
            AppliesOn::RemoteTests => kind == TestKind::Remote,
        }
    }
}

pub trait MonitorFactory {
    fn name(&self) -> &str;

    fn applies_on(&self) -> AppliesOn {
        AppliesOn::AnyTest
    }

    fn create(&self) -> Box<dyn Monitor>;
}

/// Registry of the built-in monitors, as written in run plans
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MonitorConfig {
    /// Add environment variables to the worker
    Environment { vars: BTreeMap<String, String> },
    /// Multiply the test and setup timeouts
    TimeoutScale { factor: f64 },
    /// Run the worker under a wrapper command
    Wrapper { command: Vec<String> },
}

impl MonitorConfig {
    pub fn into_factory(self) -> Arc<dyn MonitorFactory> {
        Arc::new(self)
    }
}

impl MonitorFactory for MonitorConfig {
    fn name(&self) -> &str {
        match self {
            MonitorConfig::Environment { .. } => "environment-monitor",
            MonitorConfig::TimeoutScale { .. } => "timeout-scale-monitor",
            MonitorConfig::Wrapper { .. } => "wrapper-monitor",
        }
    }

    fn applies_on(&self) -> AppliesOn {
        match self {
            MonitorConfig::TimeoutScale { .. } => AppliesOn::AnyTest,
            _ => AppliesOn::RemoteTests,
        }
    }

    fn create(&self) -> Box<dyn Monitor> {
        match self.clone() {
            MonitorConfig::Environment { vars } => Box::new(EnvironmentMonitor {
                vars,
                results: MonitorResults::declaring([(
                    "environment-applied",
                    "The variables were added to the worker environment",
                )]),
            }),
            MonitorConfig::TimeoutScale { factor } => Box::new(TimeoutScaleMonitor {
                factor,
                results: MonitorResults::default(),
            }),
            MonitorConfig::Wrapper { command } => Box::new(WrapperMonitor {
                command,
                results: MonitorResults::declaring([(
                    "wrapper-installed",
                    "The worker was launched under the wrapper",
                )]),
            }),
        }
    }
}

struct EnvironmentMonitor {
    vars: BTreeMap<String, String>,
    results: MonitorResults,
}

impl Monitor for EnvironmentMonitor {
    fn name(&self) -> &str {
        "environment-monitor"
    }

    fn set_up(&mut self, host: &mut MonitorHost<'_>) -> bool {
        let Some(launch) = host.launch_config() else {
            return false;
        };
        launch
            .env
            .extend(self.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.results.validate("environment-applied", true);
        self.results.extra_info(
            "environment",
            serde_json::to_value(&self.vars).unwrap_or(Value::Null),
        );
        true
    }

    fn results(&self) -> &MonitorResults {
        &self.results
    }
}

struct TimeoutScaleMonitor {
    factor: f64,
    results: MonitorResults,
}

impl Monitor for TimeoutScaleMonitor {
    fn name(&self) -> &str {
        "timeout-scale-monitor"
    }

    fn set_up(&mut self, host: &mut MonitorHost<'_>) -> bool {
        if !self.factor.is_finite() || self.factor <= 0.0 {
            tracing::error!(factor = self.factor, "invalid timeout scale");
            return false;
        }
        host.set_timeout(host.timeout().mul_f64(self.factor));
        host.set_async_setup_timeout(host.async_setup_timeout().mul_f64(self.factor));
        self.results.extra_info("timeout-factor", self.factor);
        true
    }

    fn results(&self) -> &MonitorResults {
        &self.results
    }
}

struct WrapperMonitor {
    command: Vec<String>,
    results: MonitorResults,
}

impl Monitor for WrapperMonitor {
    fn name(&self) -> &str {
        "wrapper-monitor"
    }

    fn set_up(&mut self, host: &mut MonitorHost<'_>) -> bool {
        if self.command.is_empty() {
            return false;
        }
        let Some(launch) = host.launch_config() else {
            return false;
        };
        let mut pre_args = self.command.clone();
        pre_args.append(&mut launch.pre_args);
        launch.pre_args = pre_args;
        self.results.validate("wrapper-installed", true);
        true
    }

    fn results(&self) -> &MonitorResults {
        &self.results
    }
}

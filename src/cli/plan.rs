//! Run plan files
//!
//! A plan declares remote test types, list scenarios built from them,
//! monitors, and the schedule of what to run with which arguments. Plans
//! are TOML or YAML, picked by file extension.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Error, Result};
use crate::monitor::{MonitorConfig, MonitorFactory};
use crate::run::TestRun;
use crate::scenario::ScenarioType;
use crate::test::checklist::ExpectedFailure;
use crate::test::schema::{args, CheckItemSpec};
use crate::test::{ArgumentSet, CommandTemplate, RemoteTestType, TestFactory, TestKind, TestSchema};

/// A complete plan as written on disk
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunPlan {
    /// Overrides of the configured run defaults
    #[serde(default)]
    pub run: PlanRunSettings,
    #[serde(default)]
    pub tests: Vec<TestDecl>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioDecl>,
    /// Monitors attached to every scheduled entry
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PlanRunSettings {
    pub max_concurrent: Option<usize>,
    pub working_dir: Option<PathBuf>,
    pub client_id: Option<String>,
}

/// A remote test type
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct TestDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Program and arguments of the worker; `{uuid}` is substituted
    pub command: Option<Vec<String>>,
    /// Shell command line of the worker, instead of `command`
    pub shell: Option<String>,
    /// Test timeout in seconds
    pub timeout: Option<f64>,
    /// Setup timeout in seconds
    pub setup_timeout: Option<f64>,
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgumentDecl>,
    #[serde(default)]
    pub checklist: BTreeMap<String, CheckItemDecl>,
    #[serde(default)]
    pub extra_infos: BTreeMap<String, String>,
    #[serde(default)]
    pub output_files: BTreeMap<String, OutputFileDecl>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ArgumentDecl {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub global: bool,
    pub default: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CheckItemDecl {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub global: bool,
    pub likely_error: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct OutputFileDecl {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub global: bool,
}

/// A scenario running declared tests one after another
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScenarioDecl {
    pub name: String,
    pub tests: Vec<String>,
    pub fatal_subtest_failure: Option<bool>,
}

/// One argument table, or a list of them
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ArgsDecl {
    One(BTreeMap<String, Value>),
    Many(Vec<BTreeMap<String, Value>>),
}

impl ArgsDecl {
    fn into_sets(self) -> Vec<ArgumentSet> {
        let tables = match self {
            ArgsDecl::One(table) => vec![table],
            ArgsDecl::Many(tables) => tables,
        };
        tables
            .into_iter()
            .map(|table| {
                table
                    .into_iter()
                    .fold(ArgumentSet::new(), |set, (key, value)| set.with(key, value))
            })
            .collect()
    }
}

/// Something to run
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    /// Name of a declared test or scenario
    pub test: String,
    pub args: Option<ArgsDecl>,
    /// Run every argument set as an iteration of a single instance
    #[serde(default)]
    pub iterate: bool,
    #[serde(default)]
    pub expected_failures: Vec<ExpectedFailure>,
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

/// Test types by name
#[derive(Default)]
pub struct TestRegistry {
    names: Vec<String>,
    factories: HashMap<String, Arc<dyn TestFactory>>,
    defaults: HashMap<String, ArgumentSet>,
    commands: HashMap<String, CommandTemplate>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn TestFactory>) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(Error::DuplicateTest(name.to_string()));
        }
        self.names.push(name.to_string());
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn TestFactory>> {
        self.factories
            .get(name)
            .ok_or_else(|| Error::UnknownTest(name.to_string()))
    }

    /// Registered types in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn TestFactory>)> {
        self.names
            .iter()
            .filter_map(|name| self.factories.get(name).map(|f| (name.as_str(), f)))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Worker command of a remote test type declared by a plan
    pub fn command(&self, name: &str) -> Option<&CommandTemplate> {
        self.commands.get(name)
    }

    fn set_defaults(&mut self, name: &str, defaults: ArgumentSet) {
        self.defaults.insert(name.to_string(), defaults);
    }

    fn defaults(&self, name: &str) -> Option<&ArgumentSet> {
        self.defaults.get(name)
    }
}

impl std::fmt::Debug for TestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRegistry").field("names", &self.names).finish()
    }
}

/// A schedule entry resolved against the registry
pub struct ResolvedEntry {
    pub name: String,
    pub factory: Arc<dyn TestFactory>,
    pub arguments: Vec<ArgumentSet>,
    pub iterate: bool,
    pub monitors: Vec<Arc<dyn MonitorFactory>>,
}

impl std::fmt::Debug for ResolvedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEntry")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("iterate", &self.iterate)
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

/// A validated plan, ready to be scheduled
#[derive(Debug)]
pub struct LoadedPlan {
    pub path: PathBuf,
    pub run: PlanRunSettings,
    pub registry: TestRegistry,
    pub entries: Vec<ResolvedEntry>,
}

impl LoadedPlan {
    /// Queue every entry on `run`
    pub fn schedule(&self, run: &mut TestRun) {
        for entry in &self.entries {
            if entry.iterate {
                run.add_iterated_test(entry.factory.clone(), entry.arguments.clone(), entry.monitors.clone());
            } else {
                run.add_test(entry.factory.clone(), entry.arguments.clone(), entry.monitors.clone());
            }
        }
    }

    /// Number of top-level instances the plan will create
    pub fn instance_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| if e.iterate { 1 } else { e.arguments.len() })
            .sum()
    }
}

/// Read, parse and validate a plan file
pub fn load(path: &Path) -> Result<LoadedPlan> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    let plan = parse(path, &content)?;
    resolve(path, plan)
}

/// Parse plan text, choosing the format from the extension of `path`
pub fn parse(path: &Path, content: &str) -> Result<RunPlan> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| Error::plan_parse(path, e)),
        "toml" => toml::from_str(content).map_err(|e| Error::plan_parse(path, e)),
        other => Err(Error::plan_parse(
            path,
            format!("unsupported plan format '.{}' (use .toml, .yaml or .yml)", other),
        )),
    }
}

/// Build the registry and resolve the schedule
pub fn resolve(path: &Path, plan: RunPlan) -> Result<LoadedPlan> {
    let mut registry = TestRegistry::new();

    for decl in plan.tests {
        let name = decl.name.clone();
        let factory = remote_test_type(path, decl)?;
        let command = factory.command().clone();
        registry.register(&name, Arc::new(factory))?;
        registry.commands.insert(name, command);
    }

    for decl in plan.scenarios {
        let tests = decl
            .tests
            .iter()
            .map(|name| registry.get(name).cloned())
            .collect::<Result<Vec<_>>>()?;
        registry.register(&decl.name, Arc::new(ScenarioType::list(&decl.name, tests)))?;
        if let Some(fatal) = decl.fatal_subtest_failure {
            registry.set_defaults(
                &decl.name,
                ArgumentSet::new().with(args::FATAL_SUBTEST_FAILURE, fatal),
            );
        }
    }

    let mut entries = Vec::with_capacity(plan.schedule.len());
    for entry in plan.schedule {
        let factory = registry.get(&entry.test)?.clone();

        let mut arguments = entry
            .args
            .map(ArgsDecl::into_sets)
            .unwrap_or_else(|| vec![ArgumentSet::new()]);
        if arguments.is_empty() {
            return Err(Error::plan_parse(
                path,
                format!("schedule entry '{}' has an empty argument list", entry.test),
            ));
        }
        if !entry.expected_failures.is_empty() {
            let patterns = serde_json::to_value(&entry.expected_failures)?;
            for set in &mut arguments {
                *set = set.clone().with(args::EXPECTED_FAILURES, patterns.clone());
            }
        }
        if let Some(defaults) = registry.defaults(&entry.test) {
            for set in &mut arguments {
                *set = defaults.merged(set);
            }
        }
        for set in &arguments {
            check_arguments(path, &entry.test, factory.schema(), set)?;
        }

        let monitors = plan
            .monitors
            .iter()
            .chain(entry.monitors.iter())
            .cloned()
            .map(MonitorConfig::into_factory)
            .collect();

        entries.push(ResolvedEntry {
            name: entry.test,
            factory,
            arguments,
            iterate: entry.iterate,
            monitors,
        });
    }

    Ok(LoadedPlan {
        path: path.to_path_buf(),
        run: plan.run,
        registry,
        entries,
    })
}

fn seconds(path: &Path, test: &str, what: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        Error::plan_parse(path, format!("test '{}' has an invalid {}: {}", test, what, value))
    })
}

fn remote_test_type(path: &Path, decl: TestDecl) -> Result<RemoteTestType> {
    let command = match (decl.command, decl.shell) {
        (Some(argv), None) if !argv.is_empty() => CommandTemplate::argv(argv),
        (None, Some(line)) => CommandTemplate::shell(line),
        (Some(_), Some(_)) => {
            return Err(Error::plan_parse(
                path,
                format!("test '{}' sets both command and shell", decl.name),
            ))
        }
        _ => {
            return Err(Error::plan_parse(
                path,
                format!("test '{}' needs a command or a shell line", decl.name),
            ))
        }
    };

    let mut schema = TestSchema::extending(TestSchema::remote(), decl.name.as_str())
        .description(decl.description);
    if let Some(timeout) = decl.timeout {
        schema = schema.timeout(seconds(path, &decl.name, "timeout", timeout)?);
    }
    if let Some(timeout) = decl.setup_timeout {
        schema = schema.async_setup_timeout(seconds(path, &decl.name, "setup_timeout", timeout)?);
    }
    for (name, arg) in &decl.arguments {
        schema = match (&arg.default, arg.global) {
            (_, true) => schema.global_argument(name, &arg.description),
            (Some(default), false) => schema.argument_with_default(name, &arg.description, default.clone()),
            (None, false) => schema.argument(name, &arg.description),
        };
    }
    for (name, item) in decl.checklist {
        schema = schema.check_item_spec(
            &name,
            CheckItemSpec {
                description: item.description,
                global: item.global,
                likely_error: item.likely_error,
            },
        );
    }
    for (key, description) in &decl.extra_infos {
        schema = schema.extra_info(key, description);
    }
    for (name, file) in &decl.output_files {
        schema = schema.output_file(name, &file.description, file.global);
    }

    Ok(RemoteTestType::new(schema.build(), command))
}

fn check_arguments(path: &Path, test: &str, schema: &TestSchema, set: &ArgumentSet) -> Result<()> {
    for key in set.keys() {
        if !schema.has_argument(key) {
            return Err(Error::plan_parse(
                path,
                format!("'{}' does not declare an argument named '{}'", test, key),
            ));
        }
    }
    Ok(())
}

/// Human-readable kind of a registered type
pub fn kind_label(kind: TestKind) -> &'static str {
    match kind {
        TestKind::Local => "local test",
        TestKind::Remote => "remote test",
        TestKind::Scenario => "scenario",
    }
}

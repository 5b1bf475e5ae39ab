//! Worker process launch and supervision
//!
//! Launching builds the command line from the test's launcher plus any
//! wrapper arguments monitors prepended, merges environment overrides into
//! the inherited environment, and applies stdio redirection. Shutdown
//! escalates: wait for a voluntary exit, send the graceful termination
//! signal, then force-kill, checking for exit between each step.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::common::config::SupervisorConfig;
use crate::common::{Error, Result};

/// How a worker process is started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Launcher {
    /// Program followed by its arguments
    Argv(Vec<String>),
    /// A command line run by the platform shell
    Shell(String),
}

/// Where a standard stream of the worker goes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Redirect {
    #[default]
    Inherit,
    Null,
    File(PathBuf),
}

impl Redirect {
    fn to_stdio(&self, append: bool) -> io::Result<Stdio> {
        Ok(match self {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::File(path) if append => std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?
                .into(),
            Redirect::File(path) => std::fs::File::open(path)?.into(),
        })
    }
}

/// Launch parameters monitors may adjust before the worker is spawned
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfig {
    /// Wrapper command prepended to the launcher (e.g. a tracing tool)
    pub pre_args: Vec<String>,
    /// Overrides merged on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            pre_args: Vec::new(),
            env: BTreeMap::new(),
            stdin: Redirect::Null,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
        }
    }
}

/// Program and arguments for a launcher once wrappers are applied
pub fn command_line(launcher: &Launcher, launch: &LaunchConfig) -> Result<(String, Vec<String>)> {
    let mut argv: Vec<String> = launch.pre_args.clone();
    match launcher {
        Launcher::Argv(args) => {
            if args.is_empty() {
                return Err(Error::EmptyLauncher);
            }
            argv.extend(args.iter().cloned());
        }
        Launcher::Shell(line) => {
            if line.trim().is_empty() {
                return Err(Error::EmptyLauncher);
            }
            argv.extend(shell_prefix());
            argv.push(line.clone());
        }
    }
    let program = argv.remove(0);
    Ok((program, argv))
}

#[cfg(unix)]
fn shell_prefix() -> [String; 2] {
    ["/bin/sh".to_string(), "-c".to_string()]
}

#[cfg(windows)]
fn shell_prefix() -> [String; 2] {
    ["cmd".to_string(), "/C".to_string()]
}

/// Spawn a worker process
///
/// `extra_env` is applied last, after the monitors' overrides.
pub fn spawn(
    launcher: &Launcher,
    launch: &LaunchConfig,
    cwd: &Path,
    extra_env: &[(&str, String)],
) -> Result<Child> {
    let (program, args) = command_line(launcher, launch)?;
    let spawn_failed = |source: io::Error| Error::SpawnFailed {
        program: program.clone(),
        source,
    };

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(cwd)
        .envs(&launch.env)
        .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(launch.stdin.to_stdio(false).map_err(spawn_failed)?)
        .stdout(launch.stdout.to_stdio(true).map_err(spawn_failed)?)
        .stderr(launch.stderr.to_stdio(true).map_err(spawn_failed)?);

    let child = cmd.spawn().map_err(spawn_failed)?;
    tracing::debug!(program = %program, pid = ?child.id(), "spawned worker");
    Ok(child)
}

/// Exit code of a finished process; negative signal numbers on Unix
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Grace periods of the shutdown escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub exit_grace: Duration,
    pub terminate_grace: Duration,
    pub kill_grace: Duration,
}

impl From<&SupervisorConfig> for ShutdownPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            exit_grace: Duration::from_millis(config.exit_grace_ms),
            terminate_grace: Duration::from_millis(config.terminate_grace_ms),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

/// A process the supervisor can poll and signal
#[async_trait]
pub trait Supervised: Send {
    /// Exit code if the process has already finished
    fn try_exit(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to terminate
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit, at most `within`
    async fn wait_exit(&mut self, within: Duration) -> Option<i32>;
}

#[async_trait]
impl Supervised for Child {
    fn try_exit(&mut self) -> io::Result<Option<i32>> {
        Ok(self.try_wait()?.map(exit_code))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.id() else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn terminate(&mut self) -> io::Result<()> {
        self.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.start_kill()
    }

    async fn wait_exit(&mut self, within: Duration) -> Option<i32> {
        match tokio::time::timeout(within, self.wait()).await {
            Ok(Ok(status)) => Some(exit_code(status)),
            Ok(Err(e)) => {
                tracing::debug!("waiting for worker failed: {}", e);
                None
            }
            Err(_) => None,
        }
    }
}

/// Bring a process down and return its exit code
///
/// Returns None when the process survived the forced kill, which most
/// likely leaves a zombie behind.
pub async fn shutdown<P: Supervised + ?Sized>(process: &mut P, policy: &ShutdownPolicy) -> Option<i32> {
    match process.try_exit() {
        Ok(Some(code)) => return Some(code),
        Ok(None) => {}
        Err(e) => tracing::debug!("polling worker failed: {}", e),
    }

    if let Some(code) = process.wait_exit(policy.exit_grace).await {
        return Some(code);
    }

    tracing::info!("worker still running, sending termination signal");
    if let Err(e) = process.terminate() {
        tracing::debug!("termination signal failed: {}", e);
    }
    if let Some(code) = process.wait_exit(policy.terminate_grace).await {
        return Some(code);
    }

    tracing::warn!("worker ignored termination signal, killing it");
    if let Err(e) = process.kill() {
        tracing::debug!("kill failed: {}", e);
    }
    if let Some(code) = process.wait_exit(policy.kill_grace).await {
        return Some(code);
    }

    tracing::warn!("worker survived kill, it is likely a zombie");
    None
}

//! Cross-platform bus addresses and configuration paths
//!
//! Unix/macOS: every test run listens on its own Unix domain socket under
//! $XDG_RUNTIME_DIR or /tmp. Windows: a namespaced pipe per run.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name used for runtime and configuration directories
const APP_NAME: &str = "insanity";

static BUS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory holding the private bus sockets of this user
///
/// - Unix: `$XDG_RUNTIME_DIR/insanity/` or `/tmp/insanity-<uid>/`
#[cfg(unix)]
pub fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME);
    }

    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
}

/// Allocate a fresh bus address for a test run
///
/// Unique per process and per call, so several runs can coexist.
#[cfg(unix)]
pub fn new_bus_address() -> String {
    let n = BUS_COUNTER.fetch_add(1, Ordering::Relaxed);
    runtime_dir()
        .join(format!("bus-{}-{}.sock", std::process::id(), n))
        .to_string_lossy()
        .into_owned()
}

#[cfg(windows)]
pub fn new_bus_address() -> String {
    let n = BUS_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-bus-{}-{}", APP_NAME, std::process::id(), n)
}

/// Ensure the socket directory exists with proper permissions
///
/// On Unix, creates the directory with mode 0700
#[cfg(unix)]
pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    let dir = runtime_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

#[cfg(windows)]
pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    Ok(PathBuf::new())
}

/// Remove a bus socket file if it exists
#[cfg(unix)]
pub fn remove_bus_socket(address: &str) -> io::Result<()> {
    let path = std::path::Path::new(address);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn remove_bus_socket(_address: &str) -> io::Result<()> {
    Ok(())
}

/// Get the configuration directory path
///
/// - Linux: `~/.config/insanity/`
/// - macOS: `~/Library/Application Support/insanity/`
/// - Windows: `%APPDATA%\insanity\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

/// Default working directory for runs when none is configured
pub fn default_working_dir() -> PathBuf {
    std::env::temp_dir().join(format!("{}-runs", APP_NAME))
}

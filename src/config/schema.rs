//! Configuration schema definitions for hostdrive.
//!
//! Every section is optional; an empty file yields the defaults.
//!
//! ```text
//! Config (root)
//! ├── HostConfig         - Which application to drive and how to detect readiness
//! ├── Preferences        - Persisted startup choice, executable, arguments, directory
//! ├── SessionConfig      - Keep-alive and connection timing
//! ├── DriverOptions      - Test commands run inside the host
//! └── properties         - Isolation overrides (AcadAttachToExisting, AcadExePath)
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::driver::DriverOptions;
use crate::process::HostSettings;

/// Root configuration structure for hostdrive.
///
/// # Example
///
/// ```
/// use hostdrive::config::{Config, StartupAction};
///
/// let config: Config = toml::from_str(r#"
///     [host]
///     process_name = "acad"
///
///     [preferences]
///     startup_action = "attach_to_existing"
/// "#).unwrap();
///
/// assert_eq!(config.preferences.startup_action, StartupAction::AttachToExisting);
/// assert_eq!(config.session.ping_interval_ms, 5000);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub preferences: Preferences,

    #[serde(default)]
    pub session: SessionConfig,

    /// Options handed to the test driver inside the host.
    #[serde(default)]
    pub driver: DriverOptions,

    /// Isolation override properties, merged under `--property` values.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Upper bound for every configured timeout or interval.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

impl Config {
    /// Checks the timing fields for values that cannot work.
    ///
    /// The watchdog must be positive and longer than the ping interval, or
    /// every session is shut down before it is used. Timeouts are capped at
    /// [`MAX_TIMEOUT`].
    pub fn validate(&self) -> Result<()> {
        let timings = [
            (
                "host.ready_poll_interval_ms",
                Duration::from_millis(self.host.ready_poll_interval_ms),
            ),
            (
                "host.ready_timeout_secs",
                Duration::from_secs(self.host.ready_timeout_secs),
            ),
            ("session.ping_interval_ms", self.session.ping_interval()),
            ("session.watchdog_timeout_ms", self.session.watchdog_timeout()),
            ("session.connect_timeout_secs", self.session.connect_timeout()),
        ];
        for (name, value) in timings {
            if value > MAX_TIMEOUT {
                bail!("{} exceeds the maximum of {:?}", name, MAX_TIMEOUT);
            }
        }

        if self.session.watchdog_timeout_ms == 0 {
            bail!("session.watchdog_timeout_ms must be greater than 0");
        }
        if self.session.ping_interval_ms == 0 {
            bail!("session.ping_interval_ms must be greater than 0");
        }
        if self.session.ping_interval_ms >= self.session.watchdog_timeout_ms {
            bail!(
                "session.ping_interval_ms ({}) must be less than session.watchdog_timeout_ms ({})",
                self.session.ping_interval_ms,
                self.session.watchdog_timeout_ms
            );
        }
        Ok(())
    }

    /// Readiness and timing parameters for host processes.
    pub fn host_settings(&self) -> HostSettings {
        HostSettings {
            plugin_path: self.host.plugin_path(),
            ready_poll_interval: Duration::from_millis(self.host.ready_poll_interval_ms),
            ready_timeout: Duration::from_secs(self.host.ready_timeout_secs),
            watchdog_timeout: self.session.watchdog_timeout(),
        }
    }
}

/// Settings describing the host application.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `process_name` | `"acad"` |
/// | `plugin_path` | the running hostdrive executable |
/// | `ready_poll_interval_ms` | 500 |
/// | `ready_timeout_secs` | 60 |
/// | `state_dir` | `.hostdrive` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Process name used to find running instances.
    #[serde(default = "default_process_name")]
    pub process_name: String,

    /// Module whose load marks the host ready.
    #[serde(default)]
    pub plugin_path: Option<PathBuf>,

    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Directory holding the most recently used executable record.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl HostConfig {
    /// The configured plugin, falling back to the current executable.
    pub fn plugin_path(&self) -> PathBuf {
        self.plugin_path
            .as_deref()
            .map(expand_path)
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("hostdrive"))
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            plugin_path: None,
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_timeout_secs: default_ready_timeout(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_process_name() -> String {
    "acad".to_string()
}

fn default_ready_poll_interval() -> u64 {
    500
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".hostdrive")
}

/// How a session obtains its host process when no override is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupAction {
    /// Adopt the single running instance.
    AttachToExisting,
    /// Launch the executable used last time.
    #[default]
    StartMostRecentlyUsed,
    /// Launch `user_specified_executable`.
    StartUserSpecified,
}

/// Persisted user preferences for starting the host.
///
/// ```toml
/// [preferences]
/// startup_action = "start_user_specified"
/// user_specified_executable = "~/apps/acad/acad"
/// command_line_arguments = "/nologo /b setup.scr"
/// working_directory = "~/drawings"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Preferences {
    #[serde(default)]
    pub startup_action: StartupAction,

    #[serde(default)]
    pub user_specified_executable: Option<String>,

    #[serde(default)]
    pub command_line_arguments: Option<String>,

    #[serde(default)]
    pub working_directory: Option<String>,
}

/// Keep-alive and connection timing for a remote session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// How often the controller pings the host.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// How long the host waits for a ping before shutting itself down.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_ms: u64,

    /// How long the controller waits for the host to connect back.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Start the host with debug logging.
    #[serde(default)]
    pub debug: bool,
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            watchdog_timeout_ms: default_watchdog_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            debug: false,
        }
    }
}

fn default_ping_interval() -> u64 {
    5_000
}

fn default_watchdog_timeout() -> u64 {
    120_000
}

fn default_connect_timeout() -> u64 {
    60
}

/// Expands a leading `~` in a configured path.
pub fn expand_path(path: impl AsRef<std::path::Path>) -> PathBuf {
    let raw = path.as_ref().to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}

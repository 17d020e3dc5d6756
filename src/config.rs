//! Configuration loading and schema definitions for hostdrive.
//!
//! Configuration is a TOML file (by default `hostdrive.toml`) describing the
//! host application, the persisted startup preferences, session timing and
//! the test driver commands. `hostdrive init` writes [`STARTER_CONFIG`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "hostdrive.toml";

/// Commented configuration written by `hostdrive init`.
pub const STARTER_CONFIG: &str = r#"# hostdrive configuration

[host]
# Name of the host application's process.
process_name = "acad"
# Module whose load marks the host ready. Defaults to the hostdrive binary.
# plugin_path = "/opt/hostdrive/bin/hostdrive"
ready_poll_interval_ms = 500
ready_timeout_secs = 60
state_dir = ".hostdrive"

[preferences]
# attach_to_existing | start_most_recently_used | start_user_specified
startup_action = "start_most_recently_used"
# user_specified_executable = "~/apps/acad/acad"
# command_line_arguments = "host"
# working_directory = "~"

[session]
ping_interval_ms = 5000
watchdog_timeout_ms = 120000
connect_timeout_secs = 60
debug = false

[driver]
# One test id per line.
discover_command = "echo example_test"
# {tests} is replaced by the space-separated test ids.
run_command = "echo running {tests}"

[properties]
# AcadAttachToExisting = "true"
# AcadExePath = "/opt/acad/acad"
"#;

/// Loads hostdrive configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
///
/// # Example
///
/// ```no_run
/// use hostdrive::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("hostdrive.toml"))?;
/// println!("Host process: {}", config.host.process_name);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads hostdrive configuration from a TOML string.
///
/// # Example
///
/// ```
/// use hostdrive::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [session]
///     ping_interval_ms = 200
///     watchdog_timeout_ms = 1000
/// "#)?;
///
/// assert_eq!(config.session.watchdog_timeout_ms, 1000);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.validate().context("Invalid config")?;

    Ok(config)
}

//! hostdrive: run tests inside a separate host application.
//!
//! A controller launches or attaches to a host process, asks it to connect
//! back over IPC, and drives a test driver living inside it.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Dispatch**: marshals work onto the host's main thread ([`dispatch`])
//! - **Liveness**: ping/timeout watchdog for abandoned sessions ([`liveness`])
//! - **Process**: launched or adopted host processes and the commands sent
//!   to them ([`process`])
//! - **Factory**: picks and validates the host from overrides and
//!   preferences ([`factory`])
//! - **Driver**: the test driver contract, the controller-side proxy and the
//!   host-side service ([`driver`])
//! - **Host**: the agent running inside the host process ([`host`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hostdrive::config::load_config;
//! use hostdrive::driver::remote::{ProxySettings, RemoteDriverProxy};
//! use hostdrive::driver::{TestDriver, TestPackage};
//! use hostdrive::factory::{IsolationOptions, ProcessFactory, RecentExecutables};
//! use hostdrive::process::ProcessServices;
//!
//! let config = load_config(std::path::Path::new("hostdrive.toml"))?;
//! let factory = ProcessFactory::new(
//!     config.host.process_name.clone(),
//!     config.host_settings(),
//!     ProcessServices::os(),
//!     Arc::new(config.preferences.clone()),
//!     Arc::new(RecentExecutables::load(&config.host.state_dir)),
//! );
//!
//! let mut proxy = RemoteDriverProxy::new(
//!     Arc::new(factory),
//!     IsolationOptions::from_pairs(config.properties.clone()),
//!     ProxySettings::from_session(&config.session),
//! );
//! proxy.initialize(&config.driver)?;
//! let tests = proxy.explore(&TestPackage::new("drawings"))?;
//! println!("Found {} tests", tests.len());
//! proxy.dispose();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod driver;
pub mod factory;
pub mod host;
pub mod ipc;
pub mod liveness;
pub mod process;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use dispatch::{DispatchError, DispatchQueue};
pub use driver::remote::RemoteDriverProxy;
pub use driver::{DriverError, TestCase, TestDriver, TestOutcome, TestResult};
pub use factory::{IsolationOptions, ProcessFactory};
pub use liveness::LivenessMonitor;
pub use process::{HostProcess, ProcessError};

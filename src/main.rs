//! hostdrive CLI - run tests inside a host application.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use hostdrive::config::{self, Config, STARTER_CONFIG, expand_path};
use hostdrive::driver::remote::{ProxySettings, RemoteDriverProxy};
use hostdrive::driver::{RunReport, TestDriver, TestOutcome, TestPackage};
use hostdrive::factory::{
    ATTACH_TO_EXISTING_PROPERTY, EXE_PATH_PROPERTY, IsolationOptions, ProcessFactory,
    RecentExecutables,
};
use hostdrive::host::{self, HostAgentOptions};
use hostdrive::process::{DEBUG_ENV_VAR, ProcessServices};

#[derive(Parser)]
#[command(name = "hostdrive")]
#[command(about = "Run tests inside a host application", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or attach to the host and run tests in it
    Run {
        /// Isolation override property (KEY=VALUE), may be repeated
        #[arg(short, long = "property")]
        properties: Vec<String>,

        /// Attach to the running host instead of launching one
        #[arg(long)]
        attach: bool,

        /// Host executable to launch
        #[arg(long)]
        exe: Option<PathBuf>,

        /// Test package name
        #[arg(long, default_value = "tests")]
        package: String,

        /// Test file handed to the driver, may be repeated
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// Test id to run, may be repeated (default: all explored tests)
        #[arg(short, long = "test")]
        tests: Vec<String>,

        /// Only explore tests, don't run them
        #[arg(long)]
        collect_only: bool,
    },

    /// Run the agent inside a host process
    Host {
        /// Directory for the command inbox
        #[arg(long)]
        inbox_dir: Option<PathBuf>,

        /// Exit if no session is requested within this many seconds
        #[arg(long, default_value_t = 120)]
        startup_timeout_secs: u64,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

struct RunArgs {
    properties: Vec<String>,
    attach: bool,
    exe: Option<PathBuf>,
    package: TestPackage,
    tests: Vec<String>,
    collect_only: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let debug_requested = std::env::var(DEBUG_ENV_VAR).is_ok_and(|v| v == "1");
    let log_level = if cli.verbose || debug_requested {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            properties,
            attach,
            exe,
            package,
            files,
            tests,
            collect_only,
        } => {
            let package = files
                .into_iter()
                .fold(TestPackage::new(package), TestPackage::with_file);
            run_tests(
                &cli.config,
                RunArgs {
                    properties,
                    attach,
                    exe,
                    package,
                    tests,
                    collect_only,
                },
            )
        }
        Commands::Host {
            inbox_dir,
            startup_timeout_secs,
        } => {
            let mut options = HostAgentOptions {
                startup_timeout: Duration::from_secs(startup_timeout_secs),
                ..Default::default()
            };
            if let Some(dir) = inbox_dir {
                options.inbox_dir = dir;
            }
            host::run_host(options)
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { force } => init_config(&cli.config, force),
    }
}

fn isolation_options(config: &Config, args: &RunArgs) -> Result<IsolationOptions> {
    let mut options = IsolationOptions::from_pairs(config.properties.clone());
    for raw in &args.properties {
        let (key, value) = IsolationOptions::parse_property(raw)?;
        options.add_property(key, value);
    }
    if args.attach {
        options.add_property(ATTACH_TO_EXISTING_PROPERTY, "true");
    }
    if let Some(exe) = &args.exe {
        options.add_property(EXE_PATH_PROPERTY, exe.to_string_lossy());
    }
    Ok(options)
}

fn run_tests(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let options = isolation_options(&config, &args)?;
    let recent = Arc::new(RecentExecutables::load(&expand_path(&config.host.state_dir)));
    let factory = ProcessFactory::new(
        config.host.process_name.clone(),
        config.host_settings(),
        ProcessServices::os(),
        Arc::new(config.preferences.clone()),
        recent.clone(),
    );

    let mut proxy = RemoteDriverProxy::new(
        Arc::new(factory),
        options,
        ProxySettings::from_session(&config.session),
    );
    let outcome = drive(&mut proxy, &config, &args, &recent);
    proxy.dispose();

    let Some(report) = outcome? else {
        return Ok(());
    };
    print_summary(&report);

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Runs the session; `None` when only collecting.
fn drive(
    proxy: &mut RemoteDriverProxy,
    config: &Config,
    args: &RunArgs,
    recent: &RecentExecutables,
) -> Result<Option<RunReport>> {
    proxy
        .initialize(&config.driver)
        .context("Failed to start the remote driver")?;

    if let Some(exe) = proxy.host_file_name() {
        if let Err(e) = recent.record(exe) {
            warn!("Failed to remember {}: {:#}", exe.display(), e);
        }
    }

    let tests = proxy.explore(&args.package)?;
    info!("Explored {} test(s)", tests.len());

    if args.collect_only {
        for test in &tests {
            println!("{}", test.id);
        }
        proxy.unload()?;
        return Ok(None);
    }

    let report = proxy.run(&args.package, &args.tests)?;
    proxy.unload()?;
    Ok(Some(report))
}

fn print_summary(report: &RunReport) {
    for result in &report.results {
        let status = match result.outcome {
            TestOutcome::Passed => "PASS",
            TestOutcome::Failed => "FAIL",
            TestOutcome::Skipped => "SKIP",
            TestOutcome::Error => "ERROR",
        };
        match &result.error_message {
            Some(message) => println!("{} {} ({})", status, result.test.id, message),
            None => println!("{} {}", status, result.test.id),
        }
    }

    println!();
    println!(
        "{} passed, {} failed, {} skipped in {:.2}s",
        report.passed(),
        report.failed(),
        report.skipped(),
        report.duration.as_secs_f64()
    );
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Host process: {}", config.host.process_name);
            println!("  Plugin: {}", config.host.plugin_path().display());
            println!("  Startup action: {:?}", config.preferences.startup_action);
            println!("  Ready timeout: {}s", config.host.ready_timeout_secs);
            println!("  Ping interval: {}ms", config.session.ping_interval_ms);
            println!("  Watchdog timeout: {}ms", config.session.watchdog_timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        eprintln!(
            "{} already exists. Use --force to overwrite.",
            config_path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(config_path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created {}", config_path.display());
    Ok(())
}

//! applyd - host networking convergence
//!
//! Applies the fragment directories under the base directory to the kernel,
//! one backend at a time, and stops at the first error.
//!
//! # Usage
//!
//! ```bash
//! applyd                               # Apply every backend
//! applyd apply --only ipset,iptables   # Apply selected backends
//! applyd save /etc/apply.d             # Dump live ipsets and firewall rules as fragments
//! applyd backends                      # List backends and their directories
//! applyd audit -n 50                   # Last 50 native commands that changed state
//! applyd -v --config ./applyd.json     # Debug logging with another config file
//! ```

use applyd::audit::AuditLog;
use applyd::config::{self, AppConfig};
use applyd::core::error::ToolErrorPattern;
use applyd::{Backend, Runtime, elevation};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tracing::Level;

shadow_rs::shadow!(build);

const LONG_VERSION: &str = shadow_rs::formatcp!(
    "{}\ncommit: {} ({})\nbuilt:  {}\nrustc:  {}",
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BRANCH,
    build::BUILD_TIME,
    build::RUST_VERSION,
);

#[derive(Parser)]
#[command(name = "applyd")]
#[command(
    about = "Converge host networking state to on-disk fragments",
    long_about = None
)]
#[command(version = build::PKG_VERSION, long_version = LONG_VERSION)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        default_value = config::DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,
    /// Root of the fragment directories (overrides the config file)
    #[arg(long, global = true, value_name = "DIR")]
    base_dir: Option<PathBuf>,
    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply fragment directories to the kernel (default)
    Apply {
        /// Only these backends, still applied in the fixed order
        #[arg(long, value_name = "BACKEND", value_delimiter = ',', num_args = 1..)]
        only: Vec<Backend>,
    },
    /// Write the live ipset, iptables and ip6tables state as fragment files
    Save {
        /// Directory receiving ipset/, iptables/ and ip6tables/
        dir: PathBuf,
    },
    /// List backends in application order
    Backends,
    /// Show the most recent audit log entries, newest first
    Audit {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => Level::WARN,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    init_logging(level, config.log_file.as_deref());

    let command = cli.command.unwrap_or(Commands::Apply { only: Vec::new() });
    match run(command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: Level, log_file: Option<&Path>) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if let Some(path) = log_file {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => {
                builder.with_writer(file).with_ansi(false).init();
                return;
            }
            Err(e) => eprintln!(
                "Cannot open log file {}: {e}; logging to stderr",
                path.display()
            ),
        }
    }
    builder.with_writer(std::io::stderr).init();
}

fn run(command: Commands, config: AppConfig) -> applyd::Result<()> {
    match command {
        Commands::Backends => {
            for backend in Backend::iter() {
                println!(
                    "  {:<10} {:<28} {}",
                    backend.as_ref(),
                    config.base_dir.join(backend.as_ref()).display(),
                    backend.description()
                );
            }
            Ok(())
        }
        Commands::Apply { only } => {
            warn_if_unprivileged(&config);
            let runtime = Runtime::from_config(config)?;
            if only.is_empty() {
                runtime.apply_all()
            } else {
                runtime.apply_only(&only)
            }
        }
        Commands::Audit { count } => {
            let Some(path) = config.audit_log else {
                return Err(applyd::Error::Config("no audit_log configured".to_string()));
            };
            for event in AuditLog::new(path).read_recent(count)? {
                let status = if event.success { "ok" } else { "FAILED" };
                println!(
                    "{} {:<9} {:<6} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.backend,
                    status,
                    event.command
                );
                if let Some(error) = event.error {
                    println!("    {}", error.trim());
                }
            }
            Ok(())
        }
        Commands::Save { dir } => {
            warn_if_unprivileged(&config);
            Runtime::from_config(config)?.save(&dir)?;
            println!(
                "✓ Saved ipset, iptables and ip6tables state to {}",
                dir.display()
            );
            Ok(())
        }
    }
}

fn warn_if_unprivileged(config: &AppConfig) {
    if !elevation::is_root() && config.elevation == elevation::ElevationMethod::None {
        tracing::warn!("Not running as root and no elevation configured");
    }
}

fn report(e: &applyd::Error) {
    eprintln!("Error: {e}");
    if let Some(output) = e.tool_output() {
        let translation = ToolErrorPattern::match_error(&output);
        eprintln!("\n{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  • {suggestion}");
        }
    }
}

//! Basecamp CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use basecamp::logs::{default_log_root, SetupLog};
use basecamp::orchestrator::{check, Orchestrator};
use basecamp::scheduler::{is_privileged, JobSpec, Launcher};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Unattended provisioning of the reporting toolchain.
#[derive(Debug, Parser)]
#[command(name = "basecamp", version, about)]
struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register and immediately start the detached provisioning job,
    /// then return without waiting.
    Launch {
        /// Install/target directory for the toolchain.
        install_dir: PathBuf,
    },

    /// Run the provisioning orchestrator in this process. This is what the
    /// registered job executes; it always exits 0 — read
    /// requirements_check.log for the verdict.
    Run {
        /// Install/target directory for the toolchain.
        install_dir: PathBuf,
    },

    /// Re-probe every component and package, rewrite the requirements
    /// report, and print it.
    Check {
        /// Install/target directory for the toolchain.
        install_dir: PathBuf,
    },
}

/// Initialize the tracing subscriber for logging.
///
/// Log level is controlled by:
/// 1. `--debug` flag sets level to DEBUG
/// 2. `RUST_LOG` environment variable (if set)
/// 3. Default is INFO
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("basecamp=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("basecamp=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    tracing::debug!("Basecamp starting with args: {:?}", cli);

    match cli.command {
        Commands::Launch { install_dir } => {
            let log = match SetupLog::open(&default_log_root()) {
                Ok(log) => log,
                Err(e) => {
                    eprintln!("Error: cannot open log root: {e}");
                    return ExitCode::from(1);
                }
            };

            if !is_privileged() {
                eprintln!("Error: launching the provisioning job requires elevation");
                return ExitCode::from(1);
            }

            let spec = match JobSpec::provisioning(&install_dir) {
                Ok(spec) => spec,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::from(1);
                }
            };

            match Launcher::system().launch(&spec, &log) {
                Ok(()) => {
                    println!("Provisioning job started; progress in {}", log.root().display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::from(1)
                }
            }
        }

        Commands::Run { install_dir } => {
            // Fire-and-forget: the job host does not observe exit codes, so
            // failure is reported only through the log files and report.
            Orchestrator::execute_detached(&install_dir);
            ExitCode::SUCCESS
        }

        Commands::Check { install_dir } => {
            let log = match SetupLog::open(&default_log_root()) {
                Ok(log) => log,
                Err(e) => {
                    eprintln!("Error: cannot open log root: {e}");
                    return ExitCode::from(1);
                }
            };

            match check(&install_dir, &log) {
                Ok(report) => {
                    print!("{}", report.render());
                    if report.overall_pass() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(1)
                    }
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::from(1)
                }
            }
        }
    }
}

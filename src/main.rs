//! loopguard - iteration control for long-running autonomous tasks
//!
//! Runs a command over and over under a circuit breaker, rate limiter and
//! exit detector until it reports that the task is done.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use loopguard::config::CONFIG_FILENAME;
use loopguard::r#loop::CommandExecutor;
use loopguard::{LoopConfig, LoopController, LoopError};

#[derive(Parser)]
#[command(name = "loopguard")]
#[command(version)]
#[command(about = "Drive a command in a guarded try-check-retry loop", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "LOOPGUARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in the guarded loop
    ///
    /// The command prints a JSON iteration report on stdout, e.g.
    /// {"change_count": 3, "next_task_count": 0, "exit_signal": true}
    Run {
        /// Maximum iterations
        #[arg(short, long, env = "LOOPGUARD_MAX_ITERATIONS")]
        max_iterations: Option<u32>,

        /// Iterations allowed per hour (0 disables rate limiting)
        #[arg(long, value_name = "PER_HOUR", env = "LOOPGUARD_RATE_LIMIT")]
        rate_limit: Option<u32>,

        /// Pause between iterations in seconds
        #[arg(long, value_name = "SECS")]
        cooldown: Option<u64>,

        /// Per-iteration timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Task text passed to the command on stdin and in LOOPGUARD_TASK
        #[arg(short, long, default_value = "")]
        task: String,

        /// Print the final state and metrics as JSON
        #[arg(long)]
        json: bool,

        /// Command to run each iteration
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,

    /// Write a default loopguard.toml into the project
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print which configuration file is in effect
    Path,
}

fn load_config(explicit: Option<&Path>, project: &Path) -> loopguard::Result<LoopConfig> {
    match explicit {
        Some(path) if !path.exists() => Err(LoopError::config_with_path(
            "configuration file not found",
            path.to_path_buf(),
        )),
        Some(path) => LoopConfig::load(path),
        None => LoopConfig::discover(project),
    }
}

fn config_source(explicit: Option<&Path>, project: &Path) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| LoopConfig::locate(project))
}

fn fail(err: &LoopError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), err);
    std::process::exit(err.exit_code());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            tracing_subscriber::EnvFilter::new("loopguard=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("loopguard=info,warn")
        }
    });

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    let explicit = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            max_iterations,
            rate_limit,
            cooldown,
            timeout,
            task,
            json,
            command,
        } => {
            let mut config = load_config(explicit, &project_path).unwrap_or_else(|e| fail(&e));

            if let Some(max) = max_iterations {
                config.max_iterations = max;
            }
            if let Some(per_hour) = rate_limit {
                config.rate_limit_per_hour = per_hour;
            }
            if let Some(secs) = cooldown {
                config.cooldown_secs = secs;
            }
            if let Some(secs) = timeout {
                config.iteration_timeout_secs = secs;
            }

            let executor = CommandExecutor::from_command_line(&command, project_path.clone())?;
            let controller = LoopController::new(config, executor).unwrap_or_else(|e| fail(&e));

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                });
            }

            let outcome = controller.run(&cancel, &task).await;
            let state = controller.state();
            let metrics = controller.metrics();

            if json {
                let report = serde_json::json!({
                    "ok": outcome.is_ok(),
                    "error": outcome.as_ref().err().map(ToString::to_string),
                    "state": state,
                    "metrics": metrics,
                    "breaker": controller.breaker().snapshot(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n{} Loop Summary", "Loop:".cyan().bold());
                println!("{}", "─".repeat(40));
                println!("   Phase: {}", state.phase);
                println!("   Iterations: {}", metrics.iterations);
                println!(
                    "   Successes: {}  Failures: {}",
                    metrics.successes, metrics.failures
                );
                println!("   Changes: {}", metrics.total_changes);
                println!("   Completion indicators: {}", state.completion_indicators);
                println!("   Breaker: {}", controller.breaker().state());
                println!("   Duration: {:.1}s", metrics.duration.as_secs_f64());
            }

            match outcome {
                Ok(()) => {
                    if !json {
                        println!("\n{} Task complete", "OK".green().bold());
                    }
                }
                Err(e) => fail(&e),
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                let config = load_config(explicit, &project_path).unwrap_or_else(|e| fail(&e));

                if json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    println!("{}", config.to_toml()?);
                }
            }

            ConfigAction::Validate => {
                match config_source(explicit, &project_path) {
                    Some(path) => match load_config(Some(&path), &project_path) {
                        Ok(_) => println!("{} {} is valid", "OK".green(), path.display()),
                        Err(e) => fail(&e),
                    },
                    None => println!(
                        "{} No configuration file found (using defaults)",
                        "Note:".yellow()
                    ),
                }
            }

            ConfigAction::Init { force } => {
                let path = explicit
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| project_path.join(CONFIG_FILENAME));

                if path.exists() && !force {
                    eprintln!(
                        "{} {} already exists (use --force to overwrite)",
                        "Error:".red().bold(),
                        path.display()
                    );
                    std::process::exit(1);
                }

                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, LoopConfig::default().to_toml()?)?;
                println!("{} Wrote {}", "OK".green().bold(), path.display());
            }

            ConfigAction::Path => match config_source(explicit, &project_path) {
                Some(path) => println!("{}", path.display()),
                None => println!("(defaults)"),
            },
        },
    }

    Ok(())
}

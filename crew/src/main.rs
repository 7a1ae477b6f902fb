//! crew CLI.
//!
//! Runs one research-and-writing task through the coordinator, with the worker
//! pool, retry policy and backend command taken from `crew.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::warn;

use crew::coordinator::{DispatchError, TaskCoordinator, TaskOutcome};
use crew::core::backoff::total_backoff;
use crew::exit_codes;
use crew::io::backend::CommandBackend;
use crew::io::config::{CrewConfig, DEFAULT_CONFIG_PATH, load_config, write_config};
use crew::io::prompt::{TemplateVars, parse_var};
use crew::logging;

#[derive(Parser)]
#[command(
    name = "crew",
    version,
    about = "Resilient task dispatch for a coordinator and its workers"
)]
struct Cli {
    /// Path to the crew config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Load the config and check it for errors.
    Validate,
    /// List each worker with its capability set.
    Roles,
    /// Run one task and print its result.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Task query; identical queries are answered from the cache.
    #[arg(long)]
    query: String,

    /// Task description handed to the backend.
    #[arg(long)]
    description: String,

    /// Instruction template variable, e.g. `--var subject=Acme`.
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var_arg)]
    vars: Vec<(String, String)>,

    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_var_arg(raw: &str) -> Result<(String, String), String> {
    parse_var(raw).map_err(|err| err.to_string())
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Validate => cmd_validate(&cli.config),
        Command::Roles => cmd_roles(&cli.config),
        Command::Run(args) => cmd_run(&cli.config, args),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &CrewConfig::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    let worst_case = total_backoff(
        cfg.retry.backoff_base,
        cfg.retry.max_attempts.saturating_sub(1),
        cfg.retry_policy().unit,
    );
    println!(
        "ok: {} workers, {} attempts, worst-case backoff {:?}",
        cfg.workers.len(),
        cfg.retry.max_attempts,
        worst_case
    );
    Ok(exit_codes::OK)
}

fn cmd_roles(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    for role in cfg.raw_roles() {
        let caps: Vec<&str> = role.capabilities().iter().map(|cap| cap.as_str()).collect();
        println!("{}: [{}]", role.kind(), caps.join(", "));
        if !role.instructions().is_empty() {
            println!("  {}", role.instructions());
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_run(path: &Path, args: RunArgs) -> Result<i32> {
    let cfg = load_config(path)?;
    let vars: TemplateVars = args.vars.into_iter().collect();
    let pool = cfg.worker_pool(&vars)?;
    let env = read_pass_env(&cfg.backend.pass_env);
    let backend = CommandBackend::from_config(&cfg.backend, env)?;
    let coordinator = TaskCoordinator::new(pool, backend, cfg.coordinator_settings());

    match coordinator.run_task(&args.query, &args.description) {
        Ok(outcome) => {
            print_outcome(&outcome, args.json)?;
            Ok(if outcome.is_success() {
                exit_codes::OK
            } else {
                exit_codes::EXHAUSTED
            })
        }
        Err(err @ DispatchError::CapabilityViolation(_)) => {
            if args.json {
                println!(
                    "{}",
                    json!({"status": "capability_violation", "error": err.to_string()})
                );
            } else {
                eprintln!("{err}");
            }
            Ok(exit_codes::CAPABILITY_VIOLATION)
        }
    }
}

/// Snapshot the forwarded environment once, at startup.
fn read_pass_env(names: &[String]) -> Vec<(String, String)> {
    names
        .iter()
        .filter_map(|name| match std::env::var(name) {
            Ok(value) => Some((name.clone(), value)),
            Err(_) => {
                warn!(name = %name, "forwarded environment variable is not set");
                None
            }
        })
        .collect()
}

fn print_outcome(outcome: &TaskOutcome, as_json: bool) -> Result<()> {
    if as_json {
        let value = match outcome {
            TaskOutcome::Cached(artifact) => json!({
                "status": "cached",
                "attempts": 0,
                "artifact": artifact.as_value(),
            }),
            TaskOutcome::Completed { artifact, attempts } => json!({
                "status": "completed",
                "attempts": attempts,
                "artifact": artifact.as_value(),
            }),
            TaskOutcome::Failed {
                attempts,
                last_error,
            } => json!({
                "status": "failed",
                "attempts": attempts,
                "error": last_error,
            }),
            TaskOutcome::Cancelled { attempts } => json!({
                "status": "cancelled",
                "attempts": attempts,
            }),
        };
        let mut payload = serde_json::to_string_pretty(&value).context("serialize outcome")?;
        payload.push('\n');
        print!("{payload}");
        return Ok(());
    }

    match outcome {
        TaskOutcome::Cached(artifact) | TaskOutcome::Completed { artifact, .. } => {
            println!("{artifact}");
        }
        TaskOutcome::Failed {
            attempts,
            last_error,
        } => {
            eprintln!("task failed after {attempts} attempts: {last_error}");
        }
        TaskOutcome::Cancelled { attempts } => {
            eprintln!("task cancelled after {attempts} attempts");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["crew", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_run_with_vars_and_global_config() {
        let cli = Cli::parse_from([
            "crew",
            "run",
            "--query",
            "Write a research proposal",
            "--description",
            "GenAI & ML use cases",
            "--var",
            "subject=Acme",
            "--config",
            "other.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.query, "Write a research proposal");
        assert_eq!(args.vars, vec![("subject".to_string(), "Acme".to_string())]);
        assert!(!args.json);
    }

    #[test]
    fn parse_run_rejects_malformed_var() {
        let result = Cli::try_parse_from([
            "crew",
            "run",
            "--query",
            "q",
            "--description",
            "d",
            "--var",
            "subject",
        ]);
        assert!(result.is_err());
    }
}

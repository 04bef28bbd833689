mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use devbox::orchestrator::StopOptions;
use devbox::{Error as DevboxError, Orchestrator, Parser as ConfigParser};
use output::UserOutput;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        let out = output::CliOutput;
        if let Some(err) = e.downcast_ref::<DevboxError>() {
            out.error(&format!("Error: {}", err));
            if let Some(suggestion) = err.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            out.error(&format!("Error: {:#}", e));
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let out = &output::CliOutput;

    // ── Tier 1: Commands that need no orchestrator ───────────────────
    if let Commands::Validate = cli.command {
        return commands::run_validate(cli.config.clone(), out);
    }

    // ── Load config ─────────────────────────────────────────────────
    let parser = ConfigParser::new();
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => parser.find_config_file()?,
    };
    let config = parser.load_config(&config_path)?;
    let work_dir = resolve_work_dir(cli.workdir.clone(), &config_path)?;

    // ── Tier 2: Commands that need the orchestrator ─────────────────
    let orchestrator = Orchestrator::builder()
        .config(config)
        .work_dir(work_dir)
        .build()
        .await?;

    let json = cli.json;
    let result = match cli.command {
        Commands::Create {
            name,
            image,
            password,
            token,
            memory,
            cpuset,
            cpus,
            shm_size,
            gpu,
            no_gpu,
            volumes,
        } => {
            let gpu = match (gpu, no_gpu) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let args = commands::CreateArgs {
                image,
                password,
                token,
                memory,
                cpuset,
                cpus,
                shm_size,
                gpu,
                volumes,
            };
            commands::run_create(&orchestrator, &name, args, json, out).await
        }
        Commands::Start { name } => commands::run_start(&orchestrator, &name, json, out).await,
        Commands::Stop {
            name,
            keep_history,
            message,
        } => {
            let options = StopOptions {
                keep_history,
                commit_message: message,
            };
            commands::run_stop(&orchestrator, &name, options, json, out).await
        }
        Commands::Delete {
            name,
            remove_snapshots,
        } => commands::run_delete(&orchestrator, &name, remove_snapshots, json, out).await,
        Commands::Status { name } => commands::run_status(&orchestrator, &name, json, out).await,
        Commands::List => commands::run_list(&orchestrator, json, out).await,
        Commands::Snapshot { name, message } => {
            commands::run_snapshot(&orchestrator, &name, &message, json, out).await
        }
        Commands::Snapshots { name } => {
            commands::run_snapshots(&orchestrator, name.as_deref(), json, out).await
        }
        Commands::Restore { name, tag } => {
            commands::run_restore(&orchestrator, &name, tag.as_deref(), json, out).await
        }
        Commands::Ports => commands::run_ports(&orchestrator, json, out),
        Commands::Reconcile => commands::run_reconcile(&orchestrator, json, out).await,
        // Handled in the first tier
        Commands::Validate => unreachable!("handled before the orchestrator is built"),
    };

    orchestrator.shutdown().await;
    result
}

/// Resolve the work directory from CLI `--workdir` or the config file's parent directory.
fn resolve_work_dir(
    workdir: Option<std::path::PathBuf>,
    config_path: &std::path::Path,
) -> anyhow::Result<std::path::PathBuf> {
    if let Some(workdir) = workdir {
        return Ok(workdir);
    }
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => Ok(std::env::current_dir()?),
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

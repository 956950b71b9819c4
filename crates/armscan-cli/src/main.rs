//! `armscan` – arm point extraction from recorded LiDAR + pose sessions.
//!
//! ```bash
//! # Replay a session and write the extracted point sets as JSON lines
//! armscan replay --metadata os-metadata.json --session bench.jsonl -o arm.jsonl
//!
//! # Write a default config to ~/.armscan/config.toml, then inspect it
//! armscan config init
//! armscan config show
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, `ARMSCAN_LOG_FORMAT=json`); stdout carries
//! only point-set JSON lines when no `--output` file is given.

mod config;
mod replay;
mod session;

use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use crate::replay::{ReplayReport, ReplayRequest};

/// Arm point extraction from LiDAR range images and 2-D poses
#[derive(Parser, Debug)]
#[command(name = "armscan")]
#[command(author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (default: ~/.armscan/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a recorded session through the fusion node
    Replay {
        /// Sensor calibration JSON, published before the session
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// JSON-lines file of recorded bus payloads
        #[arg(long)]
        session: PathBuf,

        /// Write point sets here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration (file + environment)
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let guard = armscan_runtime::init_tracing("armscan");
    if guard.is_exporting() {
        info!("exporting spans over OTLP");
    }

    let result = match cli.command {
        Commands::Replay {
            metadata,
            session,
            output,
        } => cmd_replay(cli.config, ReplayRequest { metadata, session }, output),
        Commands::Config(ConfigCommand::Init { force }) => cmd_config_init(cli.config, force),
        Commands::Config(ConfigCommand::Show) => cmd_config_show(cli.config),
    };

    // Flush pending spans before the exit status is reported.
    drop(guard);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn effective_config(path: Option<PathBuf>) -> config::Config {
    let (cfg, warning) = config::resolve(path.as_deref());
    if let Some(w) = warning {
        warn!(error = %w, "config unusable; using defaults");
        eprintln!("{}: {}", "Config error".yellow(), w);
    }
    cfg
}

fn cmd_replay(
    config_path: Option<PathBuf>,
    request: ReplayRequest,
    output: Option<PathBuf>,
) -> Result<(), String> {
    let cfg = effective_config(config_path);

    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(std::fs::File::create(path).map_err(|e| {
            format!("Failed to create output at {}: {}", path.display(), e)
        })?)),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start async runtime: {}", e))?;
    let report = runtime.block_on(async {
        let interrupt = async {
            if tokio::signal::ctrl_c().await.is_err() {
                // No signal handler: never interrupt.
                std::future::pending::<()>().await;
            }
            eprintln!();
            eprintln!("{}", "⚠  Ctrl-C received – stopping replay …".yellow().bold());
        };
        replay::run(&cfg, &request, &mut out, interrupt).await
    })?;

    print_report(&report, output.as_ref());
    Ok(())
}

fn cmd_config_init(path: Option<PathBuf>, force: bool) -> Result<(), String> {
    let path = path.unwrap_or_else(config::config_path);
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    config::save_to(&config::Config::default(), &path)?;
    eprintln!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

fn cmd_config_show(path: Option<PathBuf>) -> Result<(), String> {
    let cfg = effective_config(path);
    let raw = toml::to_string_pretty(&cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    print!("{raw}");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

fn print_report(report: &ReplayReport, output: Option<&PathBuf>) {
    let stats = &report.node.stats;
    eprintln!();
    eprintln!(
        "  {} Replayed {} event(s), wrote {} point set(s){}",
        "✓".green().bold(),
        report.replayed.to_string().bold(),
        report.written.to_string().bold(),
        output
            .map(|p| format!(" to {}", p.display()))
            .unwrap_or_default()
    );
    eprintln!("    poses                  {}", stats.poses);
    eprintln!("    range images           {}", stats.range_images);
    eprintln!("    emitted                {}", stats.emitted.to_string().green());
    eprintln!("    insufficient evidence  {}", stats.skipped_insufficient);
    eprintln!("    missing inputs         {}", stats.skipped_missing);
    eprintln!("    geometry not ready     {}", stats.skipped_not_ready);
    if stats.faults > 0 {
        eprintln!("    faults                 {}", stats.faults.to_string().red());
    }
    if report.node.metadata_errors > 0 {
        eprintln!(
            "    {} {} metadata document(s) rejected",
            "!".yellow(),
            report.node.metadata_errors
        );
    }
    if report.node.lagged > 0 {
        eprintln!(
            "    {} {} sensor event(s) lost to lag",
            "!".yellow(),
            report.node.lagged
        );
    }
}

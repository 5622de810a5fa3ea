//! runtrail CLI
//!
//! Thin wrapper around runtrail-core.
//!
//! ## Usage
//!
//! ```bash
//! # Log newline-delimited JSON payloads from stdin as one run
//! producer | runtrail --endpoint http://collector:8080 log --project demo
//!
//! # Drain working directories left behind by crashed runs
//! runtrail --spool ./spool recover
//!
//! # Show what is buffered on disk
//! runtrail inspect
//! ```

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use runtrail_core::collector::{self, Collector, MemoryCollector};
use runtrail_core::config::{AgentConfig, LogFormat};
use runtrail_core::logging::init_logging;
use runtrail_core::recovery::{inspect_workdir, list_workdirs, recover_orphans};
use runtrail_core::{Logger, RunOptions};
use serde_json::{Map, Value};
use tracing::warn;

/// Buffer run telemetry on disk and ship it to a collector
#[derive(Parser, Debug)]
#[command(name = "runtrail", version, about)]
struct Cli {
    /// Configuration file (default: $RUNTRAIL_CONFIG or <config dir>/runtrail/runtrail.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Collector base URL (overrides $RUNTRAIL_ENDPOINT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Write batches into this directory instead of sending them
    #[arg(long, global = true)]
    spool: Option<PathBuf>,

    /// Keep everything in memory; nothing leaves the process
    #[arg(long, global = true)]
    dry_run: bool,

    /// Directory holding run working directories
    #[arg(long, global = true)]
    temp_root: Option<PathBuf>,

    /// Diagnostic log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Diagnostic log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log newline-delimited JSON payloads read from stdin as one run
    Log(LogArgs),

    /// Drain working directories left by earlier processes
    Recover,

    /// Show buffered files under the temp root, or in one working directory
    Inspect {
        /// Working directory to inspect
        dir: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct LogArgs {
    #[arg(long)]
    project: String,

    #[arg(long)]
    entity: Option<String>,

    #[arg(long)]
    name: Option<String>,

    /// Repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,

    #[arg(long)]
    notes: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// Run configuration as a JSON object
    #[arg(long)]
    config_json: Option<String>,

    /// Do not capture stdout/stderr
    #[arg(long)]
    no_capture: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("runtrail: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli)?;
    if let Err(err) = init_logging(&config.logging) {
        eprintln!("runtrail: logging disabled: {err}");
    }

    match cli.command {
        Commands::Log(args) => cmd_log(config, cli.dry_run, args),
        Commands::Recover => cmd_recover(&config, cli.dry_run),
        Commands::Inspect { dir } => cmd_inspect(&config, dir.as_deref()),
    }
}

fn build_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = AgentConfig::load(path)?;
            config.apply_env();
            config
        }
        None => AgentConfig::load_default()?,
    };
    if let Some(endpoint) = &cli.endpoint {
        config.collector.endpoint = Some(endpoint.clone());
    }
    if let Some(spool) = &cli.spool {
        config.collector.spool_dir = Some(spool.clone());
    }
    if let Some(root) = &cli.temp_root {
        config.temp_root = Some(root.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate()?;
    Ok(config)
}

fn parse_run_config(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).context("--config-json is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--config-json must be a JSON object, got {other}"),
    }
}

fn cmd_log(config: AgentConfig, dry_run: bool, args: LogArgs) -> Result<ExitCode> {
    let mut options = RunOptions::new(args.project).config(parse_run_config(
        args.config_json.as_deref(),
    )?);
    options.entity = args.entity;
    options.name = args.name;
    options.notes = args.notes;
    options.description = args.description;
    options.tags = args.tags;
    if args.no_capture {
        options = options.capture_console(false);
    }

    let memory = dry_run.then(|| Arc::new(MemoryCollector::new()));
    let collector: Arc<dyn Collector> = match &memory {
        Some(memory) => memory.clone(),
        None => collector::from_config(&config.collector)?,
    };

    let logger = Logger::new(config, collector);
    let run_id = logger.init(options)?;

    let mut skipped = 0usize;
    for (index, line) in io::stdin().lock().lines().enumerate() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(payload) => {
                logger.log(&payload)?;
            }
            Err(err) => {
                skipped += 1;
                warn!(line = index + 1, error = %err, "Skipping stdin line that is not JSON");
            }
        }
    }

    let finished = logger.finish();
    println!("{run_id}");
    if let Some(memory) = memory {
        eprintln!(
            "dry run: {} batch(es), {} record(s)",
            memory.batches().len(),
            memory.record_count()
        );
    }
    finished?;
    Ok(if skipped == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn cmd_recover(config: &AgentConfig, dry_run: bool) -> Result<ExitCode> {
    let root = config.temp_root();
    if dry_run {
        // Report what a real pass would pick up, without draining anything.
        let pending: Vec<_> = list_workdirs(&root, &config.dir_prefix)
            .unwrap_or_default()
            .iter()
            .filter_map(|dir| inspect_workdir(dir).ok())
            .filter(|status| !status.owned)
            .collect();
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(ExitCode::SUCCESS);
    }

    let collector = collector::from_config(&config.collector)?;
    let report = recover_orphans(&root, &config.dir_prefix, None, collector.as_ref());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_inspect(config: &AgentConfig, dir: Option<&Path>) -> Result<ExitCode> {
    let statuses = match dir {
        Some(dir) => vec![
            inspect_workdir(dir).with_context(|| format!("cannot inspect {}", dir.display()))?,
        ],
        None => {
            let root = config.temp_root();
            let dirs = match list_workdirs(&root, &config.dir_prefix) {
                Ok(dirs) => dirs,
                Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(err) => {
                    return Err(err).with_context(|| format!("cannot read {}", root.display()));
                }
            };
            dirs.iter()
                .filter_map(|dir| inspect_workdir(dir).ok())
                .collect()
        }
    };
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(ExitCode::SUCCESS)
}

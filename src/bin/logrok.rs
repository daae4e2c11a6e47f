//! logrok CLI - Grok/Query/Aggregate log files.
//!
//! The record layout comes from a built-in log type (`-t`), an explicit
//! Apache `LogFormat` string (`-f`), or a `LogFormat` stanza pulled out of a
//! server config (`-C` + `-T`). One or more log files are ingested, then a
//! single query runs (`-q`) or the interactive shell starts.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;

use logrok::logformat;
use logrok::{LoGrok, LoadOptions};

/// Grok/Query/Aggregate log files.
#[derive(Parser)]
#[command(name = "logrok")]
#[command(version, about = "Grok/Query/Aggregate log files")]
struct Cli {
    /// Use a built-in log type.
    #[arg(
        short = 't',
        long = "type",
        value_name = "TYPE",
        group = "fmt",
        value_parser = [
            "apache-common",
            "apache-common-vhost",
            "ncsa-combined",
            "referer",
            "agent",
            "syslog",
        ]
    )]
    log_type: Option<String>,

    /// Log format (use apache LogFormat string).
    #[arg(short, long, group = "fmt")]
    format: Option<String>,

    /// Server config file in which to find a LogFormat string (requires -T).
    #[arg(short = 'C', long, group = "fmt", requires = "ctype")]
    config: Option<PathBuf>,

    /// Type-name for the LogFormat from the config file (only works with -C).
    #[arg(short = 'T', long, requires = "config")]
    ctype: Option<String>,

    /// Number of workers for log crunching (-1 means automatic).
    #[arg(short = 'j', long, default_value_t = -1)]
    processes: i64,

    /// Only process LINES lines of input.
    #[arg(short, long, value_name = "N")]
    lines: Option<usize>,

    /// Use the line-based interactive interface.
    #[arg(short, long, group = "mode")]
    interactive: bool,

    /// The query to run.
    #[arg(short, long, group = "mode")]
    query: Option<String>,

    /// Turn debugging on (you don't want this).
    #[arg(short, long)]
    debug: bool,

    /// Log(s) to parse/query.
    #[arg(required = true, value_name = "LOGFILE")]
    logfile: Vec<String>,
}

/// Resolve the LogFormat template from `-f`, `-C`/`-T`, or `-t` (default
/// apache-common).
fn resolve_format(cli: &Cli) -> Result<String> {
    if let Some(format) = &cli.format {
        return Ok(format.clone());
    }
    if let Some(config) = &cli.config {
        let ctype = cli
            .ctype
            .as_ref()
            .ok_or_else(|| anyhow!("-C/--config requires -T/--ctype"))?;
        let content = std::fs::read_to_string(config)
            .with_context(|| format!("reading {}", config.display()))?;
        return Ok(logformat::from_config(&content, ctype)?);
    }
    let name = cli.log_type.as_deref().unwrap_or("apache-common");
    logformat::preset(name).map(str::to_string).ok_or_else(|| {
        anyhow!(
            "unknown log type '{}'; known types: {}",
            name,
            logformat::PRESETS
                .iter()
                .map(|(n, _)| *n)
                .collect::<Vec<_>>()
                .join(", ")
        )
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if cli.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    let _ = logger.try_init();

    let format = resolve_format(&cli)?;
    let workers = usize::try_from(cli.processes).ok().filter(|&n| n > 0);

    let options = LoadOptions::new(format)
        .with_paths(cli.logfile)
        .with_lines(cli.lines)
        .with_workers(workers)
        .with_debug(cli.debug);
    let app = LoGrok::load(options)?;

    // A SIGINT during a stage cancels the running pipeline; at the shell
    // prompt the line editor handles ^C itself.
    let token = app.cancel_token();
    ctrlc::set_handler(move || token.cancel()).context("installing interrupt handler")?;

    if let Some(query) = &cli.query {
        app.query(query)?;
    } else {
        app.shell()?;
    }
    Ok(())
}

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::env::VarError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, info_span};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use zstack::layout::DEFAULT_CHUNK_EDGE;
use zstack::StackConfig;

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "ZSTACK_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Every worker's events go through one
/// non-blocking channel into a single stderr writer thread.
fn init_logging(log_format_override: Option<LogFormat>) -> Result<(LogFormat, WorkerGuard)> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(writer)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_writer(writer)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok((format, guard))
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "zstack",
    version,
    about = "Compile individual tiled images into a single volumetric tiled image"
)]
struct Cli {
    /// Folder with the tiled slice images.
    ///
    /// An `images` sub-folder is used instead when present.
    #[arg(long = "inp-dir", env = "ZSTACK_INP_DIR")]
    input_dir: PathBuf,

    /// Folder receiving the stacked volumes.
    #[arg(long = "out-dir", env = "ZSTACK_OUT_DIR")]
    output_dir: PathBuf,

    /// Filename pattern with numeric placeholders, e.g. `img_c{c}_z{zzz}.zvol`.
    #[arg(long = "file-pattern", env = "ZSTACK_FILE_PATTERN")]
    file_pattern: String,

    /// Pattern variable holding the z position.
    #[arg(long, default_value_t = 'z')]
    z_axis: char,

    /// Worker budget shared by all groups (defaults to available parallelism).
    #[arg(long, env = "ZSTACK_WORKERS", value_parser = clap::value_parser!(u32).range(1..))]
    workers: Option<u32>,

    /// Largest chunk edge moved by a single read/write.
    #[arg(long, default_value_t = DEFAULT_CHUNK_EDGE, value_parser = clap::value_parser!(usize))]
    chunk_size: usize,

    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `ZSTACK_LOG_FORMAT` > `human`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn into_config(self) -> StackConfig {
        let images = self.input_dir.join("images");
        let input_dir = if images.is_dir() {
            images
        } else {
            self.input_dir
        };

        StackConfig::new(input_dir, self.output_dir, self.file_pattern)
            .with_z_axis(self.z_axis)
            .with_workers(self.workers.map(|w| w as usize))
            .with_max_chunk_edge(self.chunk_size)
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse();
    let (log_format, _log_guard) = init_logging(cli.log_format)?;
    let config = cli.into_config();

    let run_span = info_span!("stack", log_format = log_format.as_str());
    let _run_guard = run_span.enter();
    let started = Instant::now();

    info!(input_dir = %config.input_dir.display(), "Input directory");
    info!(output_dir = %config.output_dir.display(), "Output directory");
    info!(file_pattern = %config.file_pattern, "File pattern");
    info!(
        max_workers = config.workers.unwrap_or_else(zstack::scheduler::default_capacity),
        "Worker budget"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("zstack-worker")
        .build()
        .context("failed to start async runtime")?;

    let report = match runtime.block_on(zstack::run(&config)) {
        Ok(report) => report,
        Err(err) if err.is_pre_job() => {
            return Err(anyhow::Error::new(err)
                .context("could not group input files; no job was started"));
        }
        Err(err) => return Err(anyhow::Error::new(err).context("stacking run failed")),
    };

    for failure in &report.failures {
        error!(job = %failure.job, error = %failure.error, "Group failed");
    }
    info!(
        groups = report.total(),
        succeeded = report.succeeded.len(),
        failed = report.failures.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Run complete"
    );
    Ok(report.is_success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_required_flags() {
        let cli = Cli::try_parse_from([
            "zstack",
            "--inp-dir",
            "/data/in",
            "--out-dir",
            "/data/out",
            "--file-pattern",
            "img_z{zz}.zvol",
            "--workers",
            "3",
            "--chunk-size",
            "1024",
        ])
        .unwrap();
        let config = cli.into_config();
        assert_eq!(config.output_dir, PathBuf::from("/data/out"));
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.max_chunk_edge, 1024);
        assert_eq!(config.z_axis, 'z');
    }

    #[test]
    fn test_cli_rejects_zero_workers() {
        let parsed = Cli::try_parse_from([
            "zstack",
            "--inp-dir",
            "a",
            "--out-dir",
            "b",
            "--file-pattern",
            "p_z{z}",
            "--workers",
            "0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse(" JSON ").unwrap(), LogFormat::Json);
        assert!(LogFormat::parse("xml").is_err());
    }
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::benchmark::BenchmarkRequest;
use crate::closure::FinishRequest;
use crate::error::{DubError, DubResult};
use crate::pipeline::{CancellationToken, RunRequest};
use crate::tuning::{DEFAULT_MAX_CANDIDATES, TuningRequest};

/// Global flag indicating that a shutdown signal has been received.
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Coordinates graceful Ctrl+C shutdown.
///
/// The handler sets a global flag that every [`CancellationToken`] observes
/// at segment and profile boundaries. An optional callback fires on signal
/// receipt, typically to cancel the command's own token so a waiting
/// subprocess is killed promptly.
///
/// ```rust,no_run
/// use franken_dub::cli::ShutdownController;
/// let _ = ShutdownController::install(None);
/// if ShutdownController::is_shutting_down() {
///     eprintln!("interrupted");
/// }
/// ```
pub struct ShutdownController;

impl ShutdownController {
    /// Install the Ctrl+C handler. Failure is non-fatal; callers log and go on.
    pub fn install(on_signal: Option<Box<dyn Fn() + Send + Sync + 'static>>) -> DubResult<()> {
        ctrlc::set_handler(move || {
            SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received (Ctrl+C)");
            if let Some(ref callback) = on_signal {
                callback();
            }
        })
        .map_err(|e| DubError::Io(std::io::Error::other(format!("ctrlc handler: {e}"))))?;
        Ok(())
    }

    #[must_use]
    pub fn is_shutting_down() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }

    /// The exit code the binary uses when interrupted.
    #[must_use]
    pub const fn signal_exit_code() -> i32 {
        130 // 128 + SIGINT
    }
}

#[derive(Debug, Parser)]
#[command(name = "franken_dub")]
#[command(about = "Duration-fitted TTS dubbing with profile benchmarking and auto-tuning")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a tts_input document from translation output.
    Prepare(PrepareArgs),
    /// Synthesize, fit and gate one input with one profile.
    Run(RunArgs),
    /// Run one input through several profiles and rank them.
    Benchmark(BenchmarkArgs),
    /// Generate espeak candidates around a base profile, benchmark and lock the best.
    Tune(TuneArgs),
    /// Copy the recommended profile of a benchmark report to a locked path.
    Lock(LockArgs),
    /// Render a benchmark report as markdown.
    Report(ReportArgs),
    /// Prepare, optionally tune, then run production with the strict gate on.
    Finish(FinishArgs),
}

impl Command {
    /// Token for this invocation, carrying the wall-clock budget when given.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        let timeout = match self {
            Self::Run(args) => args.timeout,
            Self::Benchmark(args) => args.timeout,
            Self::Tune(args) => args.timeout,
            Self::Finish(args) => args.timeout,
            Self::Prepare(_) | Self::Lock(_) | Self::Report(_) => None,
        };
        match timeout.and_then(|seconds| Duration::try_from_secs_f64(seconds).ok()) {
            Some(budget) if !budget.is_zero() => CancellationToken::with_deadline_from_now(budget),
            _ => CancellationToken::new(),
        }
    }
}

/// Non-negative seconds that fit in a [`Duration`].
fn parse_timeout_seconds(raw: &str) -> Result<f64, String> {
    let seconds: f64 = raw
        .trim()
        .parse()
        .map_err(|err| format!("`{raw}` is not a number: {err}"))?;
    Duration::try_from_secs_f64(seconds)
        .map(|_| seconds)
        .map_err(|_| format!("`{raw}` is not a representable number of seconds"))
}

#[derive(Debug, Clone, Args)]
pub struct PrepareArgs {
    /// Upstream translation_output JSON.
    #[arg(long)]
    pub translation_output: PathBuf,

    /// Where to write the tts_input JSON.
    #[arg(long)]
    pub output: PathBuf,

    /// Override the target language recorded upstream.
    #[arg(long)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// tts_input JSON.
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub output_dir: PathBuf,

    /// TOML override merged over the built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Fail the run on any quality flag outside the allow-list.
    #[arg(long)]
    pub strict: bool,

    /// Wall-clock budget for the whole run, in seconds.
    #[arg(long, value_parser = parse_timeout_seconds)]
    pub timeout: Option<f64>,
}

impl RunArgs {
    #[must_use]
    pub fn to_request(&self) -> RunRequest {
        RunRequest {
            tts_input_json: self.input.clone(),
            output_dir: self.output_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct BenchmarkArgs {
    #[arg(long)]
    pub input: PathBuf,

    /// Profile config; repeat for each profile.
    #[arg(long = "config", required = true)]
    pub configs: Vec<PathBuf>,

    #[arg(long)]
    pub output_dir: PathBuf,

    /// Profiles benchmarked concurrently.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    #[arg(long, value_parser = parse_timeout_seconds)]
    pub timeout: Option<f64>,
}

impl BenchmarkArgs {
    #[must_use]
    pub fn to_request(&self) -> BenchmarkRequest {
        BenchmarkRequest {
            tts_input_json: self.input.clone(),
            config_paths: self.configs.clone(),
            output_dir: self.output_dir.clone(),
            workers: self.workers,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct TuneArgs {
    #[arg(long)]
    pub input: PathBuf,

    /// Espeak profile the candidates are generated around.
    #[arg(long)]
    pub base_config: PathBuf,

    #[arg(long)]
    pub output_dir: PathBuf,

    /// Destination of the winning profile's config.
    #[arg(long)]
    pub locked_config: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_CANDIDATES)]
    pub max_candidates: usize,

    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    #[arg(long, value_parser = parse_timeout_seconds)]
    pub timeout: Option<f64>,
}

impl TuneArgs {
    #[must_use]
    pub fn to_request(&self) -> TuningRequest {
        TuningRequest {
            tts_input_json: self.input.clone(),
            base_config_path: self.base_config.clone(),
            output_dir: self.output_dir.clone(),
            locked_config_path: self.locked_config.clone(),
            max_candidates: self.max_candidates,
            workers: self.workers,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct LockArgs {
    /// profile_benchmark.json produced by `benchmark` or `tune`.
    #[arg(long)]
    pub report: PathBuf,

    #[arg(long)]
    pub output_config: PathBuf,

    /// Defaults to profile_selection.json next to the report.
    #[arg(long)]
    pub selection_report: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    #[arg(long)]
    pub report: PathBuf,

    /// Defaults to tuning_report.md next to the report.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct FinishArgs {
    /// tts_input JSON; regenerated first when --translation-output is given.
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub translation_output: Option<PathBuf>,

    #[arg(long)]
    pub language: Option<String>,

    #[arg(long)]
    pub base_config: PathBuf,

    #[arg(long)]
    pub locked_config: PathBuf,

    #[arg(long)]
    pub output_dir: PathBuf,

    /// Skip tuning and run with the existing locked config.
    #[arg(long)]
    pub no_auto_tune: bool,

    #[arg(long, default_value_t = DEFAULT_MAX_CANDIDATES)]
    pub max_candidates: usize,

    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    #[arg(long, value_parser = parse_timeout_seconds)]
    pub timeout: Option<f64>,
}

impl FinishArgs {
    #[must_use]
    pub fn to_request(&self) -> FinishRequest {
        FinishRequest {
            translation_output_json: self.translation_output.clone(),
            language: self.language.clone(),
            tts_input_json: self.input.clone(),
            base_config_path: self.base_config.clone(),
            locked_config_path: self.locked_config.clone(),
            output_dir: self.output_dir.clone(),
            auto_tune: !self.no_auto_tune,
            max_candidates: self.max_candidates,
            workers: self.workers,
        }
    }
}

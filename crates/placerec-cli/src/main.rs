//! `placerec` – run loop-closure detection over a recorded dataset.
//!
//! This binary:
//!
//! 1. Resolves parameters from `~/.placerec/config.toml`, `PLACEREC_*`
//!    environment variables and `-p Name=Value` flags, in that order.
//! 2. Opens the SQLite memory and feeds every snapshot of a JSON-lines
//!    dataset through the detector, optionally paced and repeated.
//! 3. Prints one line per cycle (admitted id, accepted loop, highest
//!    hypothesis, reactivations) and the heaviest weights every 100 cycles.
//! 4. Intercepts **Ctrl-C** to stop between cycles, then flushes memory.
//! 5. With `--exit-level`, stops after the first cycle that logs a warning
//!    or error at that level.
//!
//! Exit status is 1 on a startup failure, an integrity violation or an
//! exit-level event.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use colored::Colorize;
use tracing::{Level, info, warn};

use placerec_runtime::params::{PARAMETERS, Parameters, ParametersMap};
use placerec_runtime::{CycleReport, ExitTrigger, LoopDetector, read_snapshots};
use placerec_types::PlaceError;

const PROGRESS_EVERY: u64 = 100;

/// Appearance-based loop-closure detection over recorded place snapshots.
#[derive(Parser, Debug)]
#[command(name = "placerec", version)]
struct Args {
    /// JSON-lines file with one snapshot per line.
    #[arg(required_unless_present = "default_params")]
    dataset: Option<PathBuf>,

    /// Per-cycle time budget in milliseconds (0 = unlimited).
    #[arg(short = 't', long = "time-threshold", value_name = "MS")]
    time_threshold: Option<f64>,

    /// Feed snapshots at this rate; 0 runs as fast as possible.
    #[arg(long, default_value = "0", value_parser = parse_rate)]
    rate_hz: f64,

    /// Number of passes over the dataset.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    repeat: u32,

    /// Skip this many snapshots at the start of each pass.
    #[arg(long, default_value = "0")]
    start_at: usize,

    /// Parameter override, repeatable.
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE", value_parser = parse_key_val)]
    params: Vec<(String, String)>,

    /// Print every parameter with its default and exit.
    #[arg(long)]
    default_params: bool,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stop the run after the first cycle that logs at this level or above.
    #[arg(long, value_enum, value_name = "LEVEL")]
    exit_level: Option<ExitLevel>,

    /// SQLite database path, or `:memory:`. Overrides the config file.
    #[arg(long)]
    database: Option<String>,

    /// Write the effective database and parameters back to the config file.
    #[arg(long)]
    save_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExitLevel {
    Warn,
    Error,
}

impl From<ExitLevel> for Level {
    fn from(level: ExitLevel) -> Self {
        match level {
            ExitLevel::Warn => Level::WARN,
            ExitLevel::Error => Level::ERROR,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.default_params {
        print_default_params();
        return ExitCode::SUCCESS;
    }

    let telemetry =
        placerec_runtime::init_tracing("placerec", &args.log_level, args.exit_level.map(Level::from));

    match run(args, telemetry.exit_trigger()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, exit: Option<ExitTrigger>) -> Result<(), String> {
    let exit_reason = || exit.as_ref().and_then(ExitTrigger::tripped);

    // ── Configuration ─────────────────────────────────────────────────────
    let mut cfg = match config::load().map_err(|e| e.to_string())? {
        Some(cfg) => {
            info!(path = %config::config_path().display(), "config loaded");
            cfg
        }
        None => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg).map_err(|e| e.to_string())?;
            cfg
        }
    };
    let params = resolve_parameters(&cfg, &args).map_err(|e| e.to_string())?;
    if let Some(database) = &args.database {
        cfg.database = database.clone();
    }
    if args.save_config {
        cfg.parameters.extend(
            args.params
                .iter()
                .map(|(k, v)| (k.clone(), toml::Value::String(v.clone()))),
        );
        config::save(&cfg).map_err(|e| e.to_string())?;
        println!(
            "  {} Config saved to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        );
    }

    // ── Dataset ───────────────────────────────────────────────────────────
    let Some(dataset) = &args.dataset else {
        return Err("no dataset given".to_string());
    };
    let snapshots = read_snapshots(dataset).map_err(|e| e.to_string())?;
    if args.start_at >= snapshots.len() {
        warn!(
            start_at = args.start_at,
            available = snapshots.len(),
            "start offset is past the end of the dataset"
        );
    }
    println!(
        "  {} snapshots from {}, {} pass(es), database {}",
        snapshots.len().to_string().bold(),
        dataset.display().to_string().bold(),
        args.repeat,
        cfg.database.bold()
    );

    // ── Detector ──────────────────────────────────────────────────────────
    let mut detector = LoopDetector::open(&params, &cfg.database).map_err(|e| e.to_string())?;
    if let Some(reason) = exit_reason() {
        return Err(format!("exit level reached during startup: {reason}"));
    }

    let stop = detector.stop_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping after this cycle …".yellow().bold());
        stop.request_stop();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will abort without flushing");
    }

    let inputs = (0..args.repeat).flat_map(|_| snapshots.iter().skip(args.start_at).cloned());
    let mut pacer = Pacer::new(args.rate_hz);
    let started = Instant::now();
    let cycle_stop = detector.stop_flag();
    let outcome = detector.run(inputs, |report| {
        print_cycle(report);
        if exit_reason().is_some() {
            cycle_stop.request_stop();
            return;
        }
        pacer.wait();
    });

    let summary = match outcome {
        Ok(summary) => summary,
        Err(e @ PlaceError::IntegrityViolation { .. }) => {
            // Inconsistent memory is not written back.
            return Err(e.to_string());
        }
        Err(e) => {
            if let Err(close) = detector.close() {
                warn!(error = %close, "flush after failure did not complete");
            }
            return Err(e.to_string());
        }
    };

    detector.close().map_err(|e| e.to_string())?;

    let stats = detector.tiers().stats();
    println!();
    println!(
        "  {} {} cycles in {:.1}s{}",
        "✓".green().bold(),
        summary.cycles,
        started.elapsed().as_secs_f64(),
        if summary.stopped { " (stopped)".yellow().to_string() } else { String::new() }
    );
    println!(
        "    loop closures {}  evictions {}  reactivations {}  timing violations {}  storage errors {}",
        summary.loop_closures.to_string().bold(),
        stats.evictions,
        stats.reactivations,
        summary.timing_violations,
        stats.storage_errors
    );
    match exit_reason() {
        Some(reason) => Err(format!("exit level reached: {reason}")),
        None => Ok(()),
    }
}

/// Layer config file, `-t` and `-p` overrides, then validate.
fn resolve_parameters(cfg: &config::Config, args: &Args) -> Result<Parameters, PlaceError> {
    let mut map: ParametersMap = cfg.parameter_map();
    map.extend(args.params.iter().cloned());
    if let Some(ms) = args.time_threshold {
        map.insert("Rtabmap/TimeThreshold".to_string(), ms.to_string());
    }
    Parameters::from_map(&map)
}

/// A rate in Hz whose period fits a [`Duration`]; `0` disables pacing.
fn parse_rate(raw: &str) -> Result<f64, String> {
    let hz: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{raw}` is not a number"))?;
    if !hz.is_finite() || hz < 0.0 {
        return Err(format!("rate must be a finite, non-negative number, got `{raw}`"));
    }
    if hz > 0.0 && Duration::try_from_secs_f64(1.0 / hz).is_err() {
        return Err(format!("rate `{raw}` is too small to pace"));
    }
    Ok(hz)
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in `{raw}`"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

/// `cycle 12  id 12  loop 3  high 3 (p=0.912)  reactivated 2  ws 30  4.1ms`;
/// `loop 0` and `high 0` mean none.
fn cycle_line(report: &CycleReport) -> String {
    let (high, mass) = report
        .hypothesis
        .best
        .map_or((0, 0.0), |(id, mass)| (id.0, mass));
    format!(
        "cycle {}  id {}  loop {}  high {} (p={:.3})  reactivated {}  ws {}  {:.1}ms",
        report.cycle,
        report.id,
        report.loop_closure.map_or(0, |id| id.0),
        high,
        mass,
        report.reactivated.len(),
        report.working_set,
        report.elapsed.as_secs_f64() * 1000.0,
    )
}

fn print_cycle(report: &CycleReport) {
    let line = cycle_line(report);
    if report.loop_closure.is_some() {
        println!("  {} {}", "loop".green().bold(), line.bold());
    } else if report.timing_violation.is_some() {
        println!("  {} {}", "late".yellow(), line);
    } else {
        println!("  {} {}", "·".dimmed(), line);
    }
    if report.cycle % PROGRESS_EVERY == 0 {
        let heaviest: Vec<String> = {
            let mut w: Vec<_> = report.weights.iter().collect();
            w.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            w.into_iter().take(5).map(|(id, w)| format!("{id}:{w}")).collect()
        };
        println!("    {} [{}]", "heaviest".dimmed(), heaviest.join(" "));
    }
}

fn print_default_params() {
    println!("{}", "Parameters (name, default, meaning):".bold());
    for (name, default, meaning) in PARAMETERS {
        println!("  {:<28} {:<8} {}", name.cyan(), default, meaning.dimmed());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pacing
// ─────────────────────────────────────────────────────────────────────────────

/// Sleeps between cycles to hold a fixed input rate.
struct Pacer {
    period: Option<Duration>,
    next: Instant,
}

impl Pacer {
    fn new(rate_hz: f64) -> Self {
        let period = (rate_hz > 0.0)
            .then(|| Duration::try_from_secs_f64(1.0 / rate_hz).ok())
            .flatten();
        Self {
            period,
            next: Instant::now(),
        }
    }

    fn wait(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        self.next += period;
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
        } else {
            // Running behind; do not try to catch up.
            self.next = now;
        }
    }
}

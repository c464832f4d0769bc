//! histoscore-bench: CLI tool for scoring images and inspecting the pipeline.
//!
//! Runs the scoring pipeline on one or more image files with a
//! configurable profile, printing the diagnostic result and per-stage
//! timing. Useful for:
//!
//! - Checking how a profile scores a set of reference images
//! - Tuning feature cutoffs, criterion ranges, and tier weights
//! - Measuring per-stage durations to identify bottlenecks
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin histoscore-bench -- [OPTIONS] <IMAGE_PATH>...
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use histoscore_pipeline::diagnostics::{AnalysisDiagnostics, Clock, DiagnosticsRecorder};
use histoscore_pipeline::{DiagnosticResult, Pipeline, PipelineConfig, RawImage, Stage, TracingObserver};
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;

/// Score stained tissue images and report per-stage diagnostics.
///
/// Every image is analysed with the same pipeline. Images are processed
/// in parallel; output keeps the order given on the command line.
#[derive(Parser)]
#[command(name = "histoscore-bench", version)]
struct Cli {
    /// Paths to the input images (PNG, JPEG, BMP, TIFF, WebP).
    #[arg(required_unless_present = "print_default_config")]
    images: Vec<PathBuf>,

    /// Pipeline config as a JSON file.
    #[arg(long, conflicts_with = "config_json")]
    config: Option<PathBuf>,

    /// Pipeline config as a JSON string.
    ///
    /// The JSON must be a valid `PipelineConfig` serialization; omitted
    /// sections take their defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Print the built-in config as JSON and exit.
    #[arg(long)]
    print_default_config: bool,

    /// Number of runs per image for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Worker threads for batch analysis (0 = one per core).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Output results and diagnostics as JSON instead of a report.
    #[arg(long)]
    json: bool,

    /// Log filter, overriding `RUST_LOG` (e.g. `debug`,
    /// `histoscore_pipeline=trace`).
    #[arg(long)]
    log_level: Option<String>,
}

/// Load the pipeline config from `--config`, `--config-json`, or the
/// built-in default.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }
    if let Some(ref path) = cli.config {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        return serde_json::from_str(&text)
            .map_err(|e| format!("Error parsing {}: {e}", path.display()));
    }
    Ok(PipelineConfig::default())
}

/// Install the stderr `tracing` subscriber.
fn init_logging(level: Option<&str>) {
    let filter = level.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        EnvFilter::new,
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything measured for one image.
struct ImageReport {
    path: PathBuf,
    result: DiagnosticResult,
    diagnostics: Vec<AnalysisDiagnostics>,
}

/// Decode one image and analyse it `runs` times.
fn analyze_image(pipeline: &Pipeline, path: &Path, runs: usize) -> Result<ImageReport, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    let image = RawImage::decode(&bytes).map_err(|e| format!("{}: {e}", path.display()))?;
    tracing::info!(
        image = %path.display(),
        bytes = bytes.len(),
        width = image.width(),
        height = image.height(),
        "decoded image"
    );

    let mut diagnostics = Vec::with_capacity(runs);
    let mut last = None;
    for run in 0..runs {
        let span = tracing::debug_span!("run", image = %path.display(), run = run + 1);
        let _entered = span.enter();
        let mut observer = (TracingObserver, DiagnosticsRecorder::new(&StdClock));
        let result = pipeline
            .analyze_observed(&image, &mut observer)
            .map_err(|e| format!("{}: pipeline error: {e}", path.display()))?;
        diagnostics.push(observer.1.finish());
        last = Some(result);
    }
    let result = last.ok_or_else(|| format!("{}: no runs completed", path.display()))?;
    Ok(ImageReport {
        path: path.to_path_buf(),
        result,
        diagnostics,
    })
}

/// Analyse every image on a pool of `threads` workers.
fn analyze_batch(
    pipeline: &Pipeline,
    paths: &[PathBuf],
    runs: usize,
    threads: usize,
) -> Result<Vec<Result<ImageReport, String>>, String> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| format!("Error building thread pool: {e}"))?;
    Ok(pool.install(|| {
        paths
            .par_iter()
            .map(|path| analyze_image(pipeline, path, runs))
            .collect()
    }))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    if cli.print_default_config {
        return match serde_json::to_string_pretty(&PipelineConfig::default()) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error serializing config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = match Pipeline::new(&config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("Images: {}", cli.images.len());
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let reports = match analyze_batch(&pipeline, &cli.images, cli.runs, cli.threads) {
        Ok(r) => r,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let mut failed = false;
    let mut json_reports = Vec::new();
    for report in reports {
        let report = match report {
            Ok(r) => r,
            Err(msg) => {
                eprintln!("{msg}");
                failed = true;
                continue;
            }
        };
        if cli.json {
            json_reports.push(serde_json::json!({
                "image": report.path.display().to_string(),
                "result": report.result,
                "diagnostics": report.diagnostics,
            }));
        } else {
            print_report(&report);
            if report.diagnostics.len() > 1 {
                print_multi_run_summary(&report.diagnostics);
            }
            println!();
        }
    }

    if cli.json {
        match serde_json::to_string_pretty(&json_reports) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing results: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Print one image's result and the diagnostics of its last run.
fn print_report(report: &ImageReport) {
    let result = &report.result;
    println!("{}\n{}", report.path.display(), "=".repeat(60));
    println!(
        "Label: {} (rank {})  |  Score: {:.4}  |  Confidence: {:.4}",
        result.label(),
        result.label_rank(),
        result.final_score(),
        result.confidence(),
    );
    for (tier, score) in result.tiers() {
        println!(
            "  tier {tier:<14} weight={:.2} score={:.4} confidence={:.4}",
            score.weight, score.score, score.confidence,
        );
    }
    println!();
    println!(
        "{:<24} {:<14} {:>8} {:>11}",
        "Category", "Tier", "Score", "Confidence"
    );
    println!("{}", "-".repeat(60));
    for (name, category) in result.categories() {
        println!(
            "{name:<24} {:<14} {:>8.4} {:>11.4}",
            category.tier,
            category.score,
            category.confidence,
        );
    }
    for record in result.insufficient() {
        println!("  insufficient: {record}");
    }
    if let Some(last) = report.diagnostics.last() {
        println!();
        println!("{}", last.report());
    }
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[AnalysisDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    for stage in Stage::ALL {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(|d| d.stage_duration(stage))
            .map(|dur| dur.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{:<24} {stage_mean:>10.3}ms", stage.title());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn images_are_optional_when_printing_config() {
        let cli = Cli::try_parse_from(["histoscore-bench", "--print-default-config"]).unwrap();
        assert!(cli.images.is_empty());
        assert!(Cli::try_parse_from(["histoscore-bench"]).is_err());
    }

    #[test]
    fn config_json_overrides_defaults() {
        let cli = Cli::try_parse_from([
            "histoscore-bench",
            "--config-json",
            r#"{"ensemble": {"morphometric_weight": 0.5, "pattern_weight": 0.5}}"#,
            "slide.png",
        ])
        .unwrap();
        let config = config_from_cli(&cli).unwrap();
        assert!((config.ensemble.pattern_weight - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_config_json_is_reported() {
        let cli =
            Cli::try_parse_from(["histoscore-bench", "--config-json", "{", "slide.png"]).unwrap();
        let err = config_from_cli(&cli).unwrap_err();
        assert!(err.contains("--config-json"), "{err}");
    }

    #[test]
    fn missing_image_is_an_error_not_a_panic() {
        let pipeline = Pipeline::new(&PipelineConfig::default()).unwrap();
        let reports = analyze_batch(
            &pipeline,
            &[PathBuf::from("/nonexistent/slide.png")],
            1,
            1,
        )
        .unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_err());
    }
}

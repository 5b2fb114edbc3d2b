use covmeld_core::config::{CovmeldConfig, MemLimit, resolve_tool};
use covmeld_core::profile::{ProfileExport, ProfilePipeline};
use covmeld_core::replay::{ReplayStatus, SeedReplayer};
use covmeld_core::seed::{discover_seeds, write_timestamps};
use covmeld_core::series::{MergedSeries, TrialSeries};
use covmeld_core::stats::{bootstrap_mean, coverage_auc, region_percent_estimate};
use covmeld_core::store::TrialStore;
use covmeld_core::{afl, profile};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage replay, merge and aggregation for fuzzing trials", long_about = None)]
struct Cli {
    /// Path to a covmeld TOML configuration file.
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// Logging filter (e.g. `warn`, `info`, `covmeld_core=debug`).
    #[clap(short, long, global = true, default_value = "warn")]
    log: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a directory of seeds through a trace generator and store
    /// per-seed coverage.
    Replay {
        /// Directory of seed files to replay.
        #[clap(short, long)]
        input: PathBuf,
        /// Path the coverage store is written to.
        #[clap(short, long)]
        output: PathBuf,
        /// Keep raw traces in this directory instead of scratch space.
        #[clap(short = 's', long)]
        traces: Option<PathBuf>,
        /// Per-seed timeout in milliseconds.
        #[clap(short, long)]
        timeout: Option<u64>,
        /// Memory limit for the target (AFL notation, e.g. `200M`, `2G`).
        #[clap(short, long)]
        memory: Option<String>,
        /// Sink target program output.
        #[clap(short, long)]
        quiet: bool,
        /// Parallel replay workers.
        #[clap(short, long)]
        jobs: Option<usize>,
        /// Instrumented target program.
        target: PathBuf,
        /// Target arguments; `@@` is replaced with the seed path.
        #[clap(required = true, trailing_var_arg = true)]
        target_args: Vec<String>,
    },
    /// Write the timestamps table for a fuzzer output directory.
    Timestamps {
        /// Path to the output CSV file.
        #[clap(short, long)]
        output: PathBuf,
        /// Fuzzer output directory (contains queue/crashes/hangs).
        out_dir: PathBuf,
    },
    /// Generate, merge and export coverage profiles for one trial.
    MergeCov {
        /// Number of parallel jobs.
        #[clap(short, long)]
        jobs: Option<usize>,
        /// Fuzzer output directory; every `queue/` underneath is replayed.
        #[clap(short, long)]
        input: PathBuf,
        /// Destination for the coverage export JSON.
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Per-seed timeout in seconds.
        #[clap(short, long)]
        timeout: Option<u64>,
        /// Export full per-file detail instead of the summary (requires
        /// --output).
        #[clap(long)]
        full: bool,
        /// Profile-instrumented target program.
        target: PathBuf,
        /// Target arguments; `@@` is replaced with the seed path.
        #[clap(required = true, trailing_var_arg = true)]
        target_args: Vec<String>,
    },
    /// Merge several trials' coverage-over-time data into one monotonic
    /// table.
    MergeSeries {
        /// Path to the merged CSV.
        #[clap(short, long)]
        output: PathBuf,
        /// Intended trial length in hours.
        #[clap(long)]
        trial_len_hours: Option<f64>,
        /// Subdirectory of each trial holding per-seed region JSON files.
        #[clap(long, default_value = "llvm_cov")]
        cov_dir: String,
        /// Trial directories, each with a timestamps.csv.
        #[clap(required = true)]
        trials: Vec<PathBuf>,
    },
    /// Bootstrapped mean AUC over a set of AFL plot_data files.
    Auc {
        /// Coverage percentile (as a fraction 0 < p <= 1).
        #[clap(short, long)]
        percentile: Option<f64>,
        /// Path to plot_data file(s).
        #[clap(required = true)]
        plot_data: Vec<PathBuf>,
    },
    /// Bootstrapped mean region coverage over exported coverage JSON files.
    CovStats {
        /// Coverage export JSON file(s), one per trial.
        #[clap(required = true)]
        jsons: Vec<PathBuf>,
    },
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config_file {
        Some(path) => CovmeldConfig::load_from_file(path)?,
        None => {
            let default_path = PathBuf::from("covmeld.toml");
            if default_path.exists() {
                info!(config = %default_path.display(), "loading default config file");
                CovmeldConfig::load_from_file(&default_path)?
            } else {
                CovmeldConfig::default()
            }
        }
    };

    match cli.command {
        Command::Replay {
            input,
            output,
            traces,
            timeout,
            memory,
            quiet,
            jobs,
            target,
            target_args,
        } => run_replay(
            &config, input, output, traces, timeout, memory, quiet, jobs, target, target_args,
        ),
        Command::Timestamps { output, out_dir } => run_timestamps(out_dir, output),
        Command::MergeCov {
            jobs,
            input,
            output,
            timeout,
            full,
            target,
            target_args,
        } => run_merge_cov(&config, jobs, input, output, timeout, full, target, target_args),
        Command::MergeSeries {
            output,
            trial_len_hours,
            cov_dir,
            trials,
        } => run_merge_series(&config, output, trial_len_hours, &cov_dir, trials),
        Command::Auc {
            percentile,
            plot_data,
        } => run_auc(&config, percentile, plot_data),
        Command::CovStats { jsons } => run_cov_stats(&config, jsons),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_replay(
    config: &CovmeldConfig,
    input: PathBuf,
    output: PathBuf,
    traces: Option<PathBuf>,
    timeout: Option<u64>,
    memory: Option<String>,
    quiet: bool,
    jobs: Option<usize>,
    target: PathBuf,
    target_args: Vec<String>,
) -> Result<(), anyhow::Error> {
    let mut settings = config.replay.clone();
    if let Some(timeout_ms) = timeout {
        settings.timeout_ms = timeout_ms;
    }
    if let Some(memory) = memory {
        settings.mem_limit = Some(memory.parse::<MemLimit>()?);
    }
    if let Some(jobs) = jobs {
        settings.jobs = jobs;
    }
    settings.quiet = settings.quiet || quiet;

    // Tool resolution is a startup-time check: fail before any work begins.
    let tool = resolve_tool(&config.tools.replay_tool)?;

    // Traces go to the caller's directory when requested, otherwise to
    // scratch space that is removed afterwards.
    let scratch;
    let trace_dir = match traces {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Cannot create trace directory {dir:?}"))?;
            dir
        }
        None => {
            scratch = tempfile::TempDir::new_in(profile::scratch_root())?;
            scratch.path().to_path_buf()
        }
    };

    let mut seeds = Vec::new();
    for entry in std::fs::read_dir(&input)
        .with_context(|| format!("Cannot read input directory {input:?}"))?
    {
        let path = entry?.path();
        if path.is_file() {
            seeds.push(path);
        }
    }
    seeds.sort();
    info!(seeds = seeds.len(), "replaying seeds");

    let replayer = SeedReplayer::new(tool, target, target_args, &settings, trace_dir);
    let results = replayer.replay_batch(&seeds)?;

    let mut store = TrialStore::new();
    let mut timeouts = 0usize;
    let mut failures = 0usize;
    let mut empty = 0usize;
    for (seed, result) in &results {
        match result {
            Ok(obs) if obs.status == ReplayStatus::TimedOut => timeouts += 1,
            Ok(obs) if obs.is_empty() => empty += 1,
            Ok(obs) => store.record(&input, seed, obs)?,
            Err(_) => failures += 1,
        }
    }

    store.save(&output)?;
    println!(
        "stored coverage for {} of {} seeds ({} timed out, {} empty, {} failed)",
        store.len(),
        results.len(),
        timeouts,
        empty,
        failures
    );
    Ok(())
}

fn run_timestamps(out_dir: PathBuf, output: PathBuf) -> Result<(), anyhow::Error> {
    let records = discover_seeds(&out_dir)?;
    let outf = std::fs::File::create(&output)
        .with_context(|| format!("Cannot create output file {output:?}"))?;
    write_timestamps(&records, outf)?;
    println!("wrote {} timestamps to {}", records.len(), output.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_merge_cov(
    config: &CovmeldConfig,
    jobs: Option<usize>,
    input: PathBuf,
    output: Option<PathBuf>,
    timeout: Option<u64>,
    full: bool,
    target: PathBuf,
    target_args: Vec<String>,
) -> Result<(), anyhow::Error> {
    let mut settings = config.pipeline.clone();
    if let Some(jobs) = jobs {
        settings.jobs = jobs;
    }
    if let Some(timeout_secs) = timeout {
        settings.timeout_secs = Some(timeout_secs);
    }

    let merge_tool = resolve_tool(&config.tools.merge_tool)?;
    let export_tool = resolve_tool(&config.tools.export_tool)?;

    let export = ProfileExport {
        summary_only: !full,
        output,
    };
    // Surface a full-without-destination misconfiguration before replaying.
    export.validate()?;

    let pipeline = ProfilePipeline::new(merge_tool, export_tool, target, target_args, &settings);
    let summary = pipeline.run(&input, &export)?;

    println!("region coverage: {:.02}%", summary.percent());
    Ok(())
}

fn run_merge_series(
    config: &CovmeldConfig,
    output: PathBuf,
    trial_len_hours: Option<f64>,
    cov_dir: &str,
    trials: Vec<PathBuf>,
) -> Result<(), anyhow::Error> {
    let trial_len_hours = trial_len_hours.unwrap_or(config.series.trial_len_hours);

    let mut series = Vec::with_capacity(trials.len());
    for trial_dir in &trials {
        info!(trial = %trial_dir.display(), "loading trial coverage");
        let trial = TrialSeries::from_trial_dir(trial_dir, cov_dir)
            .with_context(|| format!("Failed to load trial {trial_dir:?}"))?;
        series.push(trial);
    }

    info!("merging coverage");
    let merged = MergedSeries::merge(&series, Duration::from_secs_f64(trial_len_hours * 3600.0));

    info!(output = %output.display(), "saving coverage data");
    let outf = std::fs::File::create(&output)
        .with_context(|| format!("Cannot create output file {output:?}"))?;
    merged.write_csv(outf)?;
    println!(
        "merged {} trials over {} time points into {}",
        series.len(),
        merged.times().len(),
        output.display()
    );
    Ok(())
}

fn run_auc(
    config: &CovmeldConfig,
    percentile: Option<f64>,
    plot_data: Vec<PathBuf>,
) -> Result<(), anyhow::Error> {
    let percentile = percentile.unwrap_or(config.stats.percentile);
    let num_files = plot_data.len();

    let mut aucs = Vec::new();
    for path in &plot_data {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() == 0 => {
                warn!(file = %path.display(), "empty plot_data file, excluding");
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(file = %path.display(), error = %e, "unreadable plot_data, excluding");
                continue;
            }
        }
        let points = match std::fs::File::open(path).map_err(afl::AflError::from).and_then(afl::read_plot_data) {
            Ok(points) => points,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "unreadable plot_data, excluding");
                continue;
            }
        };
        let curve: Vec<(f64, f64)> = points.iter().map(|p| (p.unix_time, p.map_size)).collect();
        match coverage_auc(&curve, percentile) {
            Ok(auc) => aucs.push(auc),
            Err(e) => warn!(file = %path.display(), error = %e, "excluding from AUC set"),
        }
    }

    let stats = &config.stats;
    let estimate = bootstrap_mean(&aucs, stats.resamples, stats.alpha, stats.rng_seed)
        .with_context(|| {
            format!("No usable trials among {num_files} plot_data file(s)")
        })?;

    println!("mean AUC ({num_files} plot_data files)");
    println!("  {:.02} +/- {:.02}", estimate.mean, estimate.half_width());
    Ok(())
}

fn run_cov_stats(config: &CovmeldConfig, jsons: Vec<PathBuf>) -> Result<(), anyhow::Error> {
    let mut summaries = Vec::new();
    for path in &jsons {
        match profile::read_region_json(path) {
            Ok(summary) => summaries.push(summary),
            Err(e) => warn!(file = %path.display(), error = %e, "unable to read, skipping"),
        }
    }

    let stats = &config.stats;
    let estimate =
        region_percent_estimate(&summaries, stats.resamples, stats.alpha, stats.rng_seed)
            .with_context(|| format!("No usable summaries among {} file(s)", jsons.len()))?;

    println!("mean coverage ({} trials)", summaries.len());
    println!("  {:.02} +/- {:.02}", estimate.mean, estimate.half_width());
    Ok(())
}

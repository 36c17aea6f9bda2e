use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use permlint::invalidation::InvalidationEvent;
use permlint::{
    BatchOptions, PermlintError, SettingsLoader, ValidateOptions, ValidationResult, Validator,
    ValidatorSettings, get_rule_statistics, read_config_from_path,
};
use serde::Serialize;
use tracing::{Level, error, info, instrument};

mod errors;
mod report;
mod style;
mod tracing_init;

/// Exit status when a configuration has blocking findings.
const EXIT_INVALID: i32 = 1;
/// Exit status when permlint itself failed.
const EXIT_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "permlint")]
#[command(about = "Find conflicts in deny/allow/ask permission rules")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to ~/.permlint/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate one or more configuration files
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Only check structure and individual rules, skip conflict detection
        #[arg(long)]
        syntax_only: bool,

        /// Give up on conflict detection after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Number of parallel workers when validating several files
        #[arg(long)]
        workers: Option<usize>,

        /// Print cache and latency metrics afterwards
        #[arg(long)]
        metrics: bool,
    },

    /// Summarize the rules of a configuration file
    Stats {
        file: PathBuf,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file and re-validate it whenever it changes
    Watch { file: PathBuf },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileResult<'a> {
    path: &'a Path,
    result: &'a ValidationResult,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchOutput<'a> {
    results: Vec<FileResult<'a>>,
    success_count: usize,
    failure_count: usize,
    total_time: f64,
}

#[instrument(level = Level::TRACE)]
fn load_settings(path: Option<&Path>) -> Result<ValidatorSettings> {
    if let Some(explicit) = path
        && !explicit.exists()
    {
        return Err(PermlintError::NotFound(explicit.to_path_buf()).into());
    }
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| tracing_init::permlint_dir().map(|d| d.join("settings.json")));
    let mut loader = SettingsLoader::new();
    if let Some(path) = &path {
        loader = loader.with_file(path);
    }
    loader.load().context("failed to load permlint settings")
}

/// Validates the given files. Returns false if any of them is invalid.
#[instrument(level = Level::TRACE, skip(settings))]
fn run_validate(
    settings: ValidatorSettings,
    files: &[PathBuf],
    json: bool,
    syntax_only: bool,
    timeout_ms: Option<u64>,
    workers: Option<usize>,
    metrics: bool,
) -> Result<bool> {
    let validator = Validator::new(settings).context("failed to create validator")?;

    let mut options = ValidateOptions::new();
    options.skip_conflict_detection = syntax_only;
    options.timeout = timeout_ms.map(Duration::from_millis);

    let all_valid = if let [file] = files {
        let config = read_config_from_path(file)?;
        let result = validator.validate(&config, &options.clone().source_path(file));
        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print!("{}", report::render_result(file, &result));
        }
        result.is_valid
    } else {
        let configs = files
            .iter()
            .map(|file| read_config_from_path(file))
            .collect::<permlint::Result<Vec<_>>>()?;

        let mut batch_options = BatchOptions::new().validate(options);
        batch_options.workers = workers;
        let batch = validator.validate_batch(&configs, &batch_options);

        if json {
            let output = BatchOutput {
                results: files
                    .iter()
                    .zip(&batch.results)
                    .map(|(path, result)| FileResult { path, result })
                    .collect(),
                success_count: batch.success_count,
                failure_count: batch.failure_count,
                total_time: batch.total_time,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            for (file, result) in files.iter().zip(&batch.results) {
                print!("{}", report::render_result(file, result));
            }
            println!(
                "\n{} valid, {} invalid in {:.2} ms",
                batch.success_count, batch.failure_count, batch.total_time
            );
        }
        batch.failure_count == 0
    };

    if metrics {
        eprintln!("\n{}", validator.metrics().generate_report());
    }
    Ok(all_valid)
}

#[instrument(level = Level::TRACE)]
fn run_stats(file: &Path, json: bool) -> Result<()> {
    let config = read_config_from_path(file)?;
    let stats = get_rule_statistics(&config);
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", report::render_statistics(file, &stats));
    }
    Ok(())
}

/// Validates `file`, then re-validates on every confirmed change until the
/// process is interrupted.
#[instrument(level = Level::TRACE, skip(settings))]
fn run_watch(settings: ValidatorSettings, file: &Path) -> Result<()> {
    let validator = Validator::builder(settings)
        .track_files()
        .build()
        .context("failed to create validator")?;
    let invalidation = validator
        .invalidation()
        .context("file tracking requires the result cache to be enabled")?
        .clone();

    let print = |validator: &Validator| match validator.validate_file(file) {
        Ok(result) => print!("{}", report::render_result(file, &result)),
        Err(e) => errors::display_error(&anyhow::Error::new(e), false),
    };

    print(&validator);
    invalidation
        .watch(file)
        .with_context(|| format!("failed to watch {}", file.display()))?;
    let events = invalidation.subscribe();
    let _timer = invalidation.start()?;
    println!("{}", style::dim(&format!("watching {}", file.display())));

    for event in events {
        if let InvalidationEvent::FileChanged { path, kind, .. } = event {
            info!(path = %path.display(), kind = %kind, "re-validating");
            println!("\n{}", style::header(&format!("{} {}", path.display(), kind)));
            print(&validator);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    tracing_init::init_tracing(cli.verbose);
    info!(args = ?std::env::args(), "permlint started");

    let outcome = load_settings(cli.settings.as_deref()).and_then(|settings| match &cli.command {
        Commands::Validate {
            files,
            json,
            syntax_only,
            timeout_ms,
            workers,
            metrics,
        } => run_validate(
            settings,
            files,
            *json,
            *syntax_only,
            *timeout_ms,
            *workers,
            *metrics,
        ),
        Commands::Stats { file, json } => run_stats(file, *json).map(|()| true),
        Commands::Watch { file } => run_watch(settings, file).map(|()| true),
    });

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_INVALID),
        Err(e) => {
            error!(cmd = ?cli.command, "{:#}", e);
            errors::display_error(&e, cli.verbose);
            std::process::exit(EXIT_ERROR);
        }
    }
}

use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;

/// Directory holding permlint's log and default settings file.
pub fn permlint_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".permlint"))
}

pub fn init_tracing(verbose: bool) {
    // Log path: PERMLINT_LOG env var > ~/.permlint/permlint.log > stderr fallback.
    let log_path = std::env::var("PERMLINT_LOG").ok().unwrap_or_else(|| {
        permlint_dir()
            .map(|d| d.join("permlint.log"))
            .unwrap_or_else(|| PathBuf::from("permlint.log"))
            .to_string_lossy()
            .into_owned()
    });

    let log_file = std::path::Path::new(&log_path)
        .parent()
        .and_then(|parent| std::fs::create_dir_all(parent).ok())
        .and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .ok()
        });

    let file_level = if verbose { Level::TRACE } else { Level::DEBUG };
    let layer: Box<dyn Layer<_> + Send + Sync> = match log_file {
        Some(file) => tracing_subscriber::fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_filter(LevelFilter::from_level(file_level))
            .boxed(),
        None => {
            // Fallback to stderr if the log file can't be opened.
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_filter(LevelFilter::from_level(if verbose {
                    Level::DEBUG
                } else {
                    Level::INFO
                }))
                .boxed()
        }
    };

    tracing_subscriber::registry().with(layer).init()
}

//! Preprocessor - command line host
//!
//! Loads the item configuration, starts the preprocessing manager and feeds
//! it values read from stdin, one `<itemid> <value>` pair per line. Processed
//! values are printed to stdout as `<itemid>\t<type>\t<value>`; discovery
//! rule values are prefixed with `lld`.
//!
//! ```text
//! preprocessor [--workers N] [--log-file PATH] [config.toml]
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use preproc_rs::{
    config::{default_config_path, ManagerConfig, PreprocConfig},
    preprocessor::{ChannelSink, FlushedValue, Manager},
    types::{Value, ValueOpt},
};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long to wait for finished tasks between drains
const DRAIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "preprocessor")]
#[command(about = "Preprocess item values read from stdin")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    config: Option<PathBuf>,

    /// Number of worker threads, overriding the configuration
    #[arg(short, long, env = "PREPROC_WORKERS")]
    workers: Option<usize>,

    /// Also write logs to this file
    #[arg(long, env = "PREPROC_LOG_FILE")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = init_logging(&config.manager)?;

    tracing::info!("Starting preprocessor");

    let (sink, receivers) = ChannelSink::new(config.manager.sink_mode);
    let mut manager =
        Manager::new(&config.manager, Box::new(sink)).context("Failed to start preprocessing")?;

    for item in &config.items {
        manager.add_item(item.to_item());
    }
    tracing::info!("Loaded {} items", config.items.len());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read input")?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line) {
            Some((itemid, value)) => {
                if !manager.enqueue_value(itemid, value, Utc::now(), ValueOpt::default()) {
                    tracing::warn!("Unknown item {}", itemid);
                }
            }
            None => tracing::warn!("Skipping malformed input line: {:?}", line),
        }

        manager.drain();
        print_values(&receivers.history, "");
        print_values(&receivers.discovery, "lld\t");
    }

    while manager.stats().in_flight > 0 {
        manager.wait_finished(DRAIN_WAIT);
        manager.drain();
        print_values(&receivers.history, "");
        print_values(&receivers.discovery, "lld\t");
    }

    let stats = manager.stats();
    tracing::info!(
        "Shutting down: {} values queued, {} flushed",
        stats.queued,
        stats.flushed
    );
    manager.shutdown();

    Ok(())
}

fn load_config(args: &Args) -> Result<PreprocConfig> {
    let mut config = match &args.config {
        Some(path) => PreprocConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => default_config_path()
            .map(|path| PreprocConfig::load_or_default(path))
            .unwrap_or_default(),
    };

    if let Some(workers) = args.workers {
        config.manager.workers_num = workers;
    }
    if let Some(log_file) = &args.log_file {
        config.manager.log_file = Some(log_file.clone());
    }
    config.manager.validate()?;

    Ok(config)
}

fn init_logging(config: &ManagerConfig) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,preproc_rs=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Split `<itemid> <value>`; the value is everything after the first space
fn parse_line(line: &str) -> Option<(u64, Value)> {
    let (itemid, value) = match line.split_once(char::is_whitespace) {
        Some((itemid, value)) => (itemid, Value::from(value)),
        None => (line, Value::None),
    };
    Some((itemid.parse().ok()?, value))
}

fn print_values(rx: &crossbeam_channel::Receiver<FlushedValue>, prefix: &str) {
    for flushed in rx.try_iter() {
        println!(
            "{}{}\t{}\t{}",
            prefix,
            flushed.itemid,
            flushed.value.type_desc(),
            flushed.value
        );
    }
}

//! Command-line front end: submits URLs as one batch and follows it to the end.

mod progress;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;

use crate::{
    Batch, BatchId, BatchSnapshot, ConnectionType, DownloadBatchStatus, DownloadManager,
    EngineConfig, ThrottleConfig,
};

use progress::{BatchBars, print_summary};

const DEFAULT_TITLE: &str = "lite-dl batch";

/// Parsed command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub urls: Vec<String>,
    pub title: Option<String>,
    pub id: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub unmetered_only: bool,
    pub no_recovery: bool,
    pub throttle_ms: Option<u64>,
    pub concurrent: Option<usize>,
    pub verbose: bool,
    pub resume: bool,
    pub help: bool,
}

impl CliArgs {
    /// Applies the flags on top of a loaded or default configuration.
    #[must_use]
    pub fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(dir) = &self.download_dir {
            config = config.with_download_dir(dir);
        }
        if let Some(dir) = &self.state_dir {
            config = config.with_state_dir(dir);
        }
        if self.unmetered_only {
            config = config.with_connection_type(ConnectionType::UnmeteredOnly);
        }
        if self.no_recovery {
            config = config.with_network_recovery(false);
        }
        if let Some(interval_ms) = self.throttle_ms {
            config = config.with_throttle(ThrottleConfig::ByTime { interval_ms });
        }
        if let Some(n) = self.concurrent {
            config = config.with_max_concurrent_batches(n);
        }
        if self.verbose {
            config = config.with_verbose_logging(true);
        }
        config
    }

    fn batch(&self) -> Batch {
        let title = self.title.clone().unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let builder = match &self.id {
            Some(id) => Batch::with(id.as_str(), title),
            None => Batch::titled(title),
        };
        self.urls
            .iter()
            .fold(builder, |builder, url| builder.add_file(url))
            .build()
    }
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

/// Parses the arguments that follow the program name.
///
/// # Errors
///
/// Returns a message for unknown flags, missing values and unparsable numbers.
pub fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-t" | "--title" => parsed.title = Some(value(args, &mut i, "--title")?.to_string()),
            "--id" => parsed.id = Some(value(args, &mut i, "--id")?.to_string()),
            "-d" | "--dir" => parsed.download_dir = Some(value(args, &mut i, "--dir")?.into()),
            "--state-dir" => parsed.state_dir = Some(value(args, &mut i, "--state-dir")?.into()),
            "-c" | "--config" => parsed.config = Some(value(args, &mut i, "--config")?.into()),
            "--unmetered-only" => parsed.unmetered_only = true,
            "--no-recovery" => parsed.no_recovery = true,
            "--throttle-ms" => {
                let raw = value(args, &mut i, "--throttle-ms")?;
                parsed.throttle_ms = Some(
                    raw.parse()
                        .map_err(|_| format!("invalid --throttle-ms value: {raw}"))?,
                );
            }
            "-p" | "--concurrent" => {
                let raw = value(args, &mut i, "--concurrent")?;
                parsed.concurrent = Some(
                    raw.parse()
                        .map_err(|_| format!("invalid --concurrent value: {raw}"))?,
                );
            }
            "-v" | "--verbose" => parsed.verbose = true,
            "-r" | "--resume" => parsed.resume = true,
            "-h" | "--help" => parsed.help = true,
            arg if !arg.starts_with('-') => parsed.urls.push(arg.to_string()),
            other => return Err(format!("Unknown option: {other}")),
        }
        i += 1;
    }
    Ok(parsed)
}

pub fn print_usage() {
    eprintln!("Usage: lite-dl [OPTIONS] <url>...");
    eprintln!();
    eprintln!("Downloads the given URLs as one batch. Interrupted batches resume on the next run.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -t, --title <TITLE>     Batch title (default: {DEFAULT_TITLE})");
    eprintln!("      --id <ID>           Batch id (default: random)");
    eprintln!("  -d, --dir <DIR>         Download directory");
    eprintln!("      --state-dir <DIR>   Directory for stored batch state");
    eprintln!("  -c, --config <PATH>     Load settings from a TOML file");
    eprintln!("      --unmetered-only    Only download on unmetered connections");
    eprintln!("      --no-recovery       Do not resume automatically when the network returns");
    eprintln!("      --throttle-ms <N>   Report progress at most every N ms");
    eprintln!("  -p, --concurrent <N>    Batches downloaded at once (default: 1)");
    eprintln!("  -r, --resume            Continue every unfinished stored batch");
    eprintln!("  -v, --verbose           Debug logging");
    eprintln!("  -h, --help              Show this help");
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}

fn is_finished(snapshot: &BatchSnapshot) -> bool {
    snapshot.status.is_terminal()
}

/// Runs the command line front end with the process arguments.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the engine cannot
/// start, or the batch is rejected.
pub async fn run() -> crate::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("Error: {message}");
            print_usage();
            std::process::exit(2);
        }
    };
    if args.help || (args.urls.is_empty() && !args.resume) {
        print_usage();
        return Ok(());
    }

    let base = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let config = args.apply(base);
    init_logging(config.verbose_logging);

    let (tx, mut rx) = mpsc::unbounded_channel::<BatchSnapshot>();
    let manager = DownloadManager::builder(config)
        .with_callback(move |snapshot: &BatchSnapshot| {
            let _ = tx.send(snapshot.clone());
        })
        .build()
        .await?;

    let mut watched: HashSet<BatchId> = HashSet::new();
    if args.resume {
        for snapshot in manager.get_all_batch_statuses().await? {
            if !is_finished(&snapshot) {
                if snapshot.status == DownloadBatchStatus::Paused {
                    manager.resume(&snapshot.batch_id).await?;
                }
                watched.insert(snapshot.batch_id);
            }
        }
    }
    if !args.urls.is_empty() {
        match manager.submit(args.batch()).await {
            Ok(id) => {
                watched.insert(id);
            }
            Err(e) => {
                manager.shutdown().await;
                return Err(e);
            }
        }
    }
    if watched.is_empty() {
        println!("Nothing to download.");
        manager.shutdown().await;
        return Ok(());
    }
    info!("Following {} batch(es)", watched.len());

    let mut bars = BatchBars::new();
    let mut remaining = watched.clone();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bars.println("Interrupted, saving state...");
                break;
            }
            Some(snapshot) = rx.recv() => {
                if watched.contains(&snapshot.batch_id) {
                    bars.update(&snapshot);
                    if is_finished(&snapshot) {
                        remaining.remove(&snapshot.batch_id);
                    }
                }
            }
            _ = ticker.tick() => {
                // Throttled or removed batches never send a final update.
                let statuses = manager.get_all_batch_statuses().await?;
                remaining.retain(|id| {
                    statuses
                        .iter()
                        .any(|s| &s.batch_id == id && !is_finished(s))
                });
            }
        }
        if remaining.is_empty() {
            break;
        }
    }

    let finals: Vec<BatchSnapshot> = manager
        .get_all_batch_statuses()
        .await?
        .into_iter()
        .filter(|s| watched.contains(&s.batch_id))
        .collect();
    bars.clear();
    manager.shutdown().await;
    print_summary(&finals);
    Ok(())
}

//! Progress bars and summary for the command-line front end.

use std::collections::HashMap;

use console::style;
use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};

use crate::{BatchId, BatchSnapshot, DownloadBatchStatus, PauseReason};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━━╌")
}

/// Unknown sizes show as a spinner until every file size is known.
fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {bytes} - {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn describe(snapshot: &BatchSnapshot) -> String {
    let title = if snapshot.title.is_empty() {
        snapshot.batch_id.to_string()
    } else {
        snapshot.title.clone()
    };
    match (snapshot.status, snapshot.pause_reason) {
        (DownloadBatchStatus::Paused, Some(PauseReason::Network)) => {
            format!("{title} (waiting for network)")
        }
        (DownloadBatchStatus::Downloading, _) => snapshot.eta.map_or(title.clone(), |eta| {
            format!("{title} (eta {})", HumanDuration(eta))
        }),
        (status, _) => format!("{title} ({status})"),
    }
}

/// One bar per batch, updated from snapshots.
pub struct BatchBars {
    multi: MultiProgress,
    bars: HashMap<BatchId, ProgressBar>,
}

impl BatchBars {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    pub fn update(&mut self, snapshot: &BatchSnapshot) {
        let bar = self
            .bars
            .entry(snapshot.batch_id.clone())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::no_length());
                bar.set_style(spinner_style());
                bar
            });

        if let Some(total) = snapshot.bytes_total {
            if bar.length() != Some(total) {
                bar.set_length(total);
                bar.set_style(bar_style());
            }
        }
        bar.set_position(snapshot.bytes_downloaded);
        bar.set_message(describe(snapshot));

        match snapshot.status {
            DownloadBatchStatus::Completed => {
                bar.finish_with_message(format!("{} {}", style("✓").green(), describe(snapshot)));
            }
            DownloadBatchStatus::Error => {
                let reason = snapshot
                    .error
                    .map_or_else(|| "failed".to_string(), |kind| kind.to_string());
                bar.abandon_with_message(format!("{} {}: {reason}", style("✗").red(), describe(snapshot)));
            }
            DownloadBatchStatus::Deletion => bar.finish_and_clear(),
            _ => {}
        }
    }

    pub fn println(&self, line: impl AsRef<str>) {
        let _ = self.multi.println(line);
    }

    pub fn clear(&self) {
        let _ = self.multi.clear();
    }
}

/// Prints the final state of every watched batch.
pub fn print_summary(snapshots: &[BatchSnapshot]) {
    if snapshots.is_empty() {
        return;
    }

    println!("\n{SEPARATOR}");
    println!("Batches");
    println!("{SEPARATOR}");
    for snapshot in snapshots {
        let size = snapshot
            .bytes_total
            .map_or_else(|| "unknown size".to_string(), |total| HumanBytes(total).to_string());
        println!(
            "  {} [{}] {}/{size}",
            snapshot.batch_id,
            snapshot.status,
            HumanBytes(snapshot.bytes_downloaded),
        );
    }
    println!("{SEPARATOR}");
}

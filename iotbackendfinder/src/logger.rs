use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::pipeline::RunOutcome;

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum VerbosityLevel {
    Silent = 0,    // Only progress bar and final summary
    Summary = 1,   // Per-provider progress (default)
    Detailed = 2,  // Queries, pages, chased targets
    Debug = 3,     // Everything including HTTP client internals
}

impl VerbosityLevel {
    /// `--quiet` wins over any `-v` count
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        if quiet {
            VerbosityLevel::Silent
        } else {
            Self::from_verbose_count(verbose)
        }
    }

    pub fn from_verbose_count(count: u8) -> Self {
        match count {
            0 => VerbosityLevel::Summary,
            1 => VerbosityLevel::Detailed,
            2.. => VerbosityLevel::Debug,
        }
    }

    /// Default `EnvFilter` directive; `RUST_LOG` overrides it
    pub fn filter_directive(&self) -> &'static str {
        match self {
            VerbosityLevel::Silent => "iotbackendfinder=error",
            VerbosityLevel::Summary => "iotbackendfinder=info",
            VerbosityLevel::Detailed => "iotbackendfinder=debug",
            VerbosityLevel::Debug => "iotbackendfinder=trace,reqwest=debug",
        }
    }
}

/// Open `path` for appending, creating missing parent directories
pub fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr; with `log_file` set they are also appended to that file
/// without ANSI colors. A log file that cannot be opened is reported through
/// the stderr layer and skipped.
pub fn init_logging(verbosity: VerbosityLevel, log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let (file, open_error) = match log_file.map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_layer = file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Arc::new(file))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    if let Some(e) = open_error {
        warn!("{:#}. Continuing without file logging.", e);
    }
    Ok(())
}

/// Progress bar over `total` units (providers or export files)
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .unwrap_or_else(|_| {
                ProgressStyle::default_bar()
                    .template("{bar:40} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
            })
            .progress_chars("##-"),
    );
    pb
}

/// Print the end-of-run summary to stdout
pub fn print_run_summary(outcome: &RunOutcome, output_file: Option<&Path>) {
    // Clear any remaining progress bar artifacts
    print!("\x1b[2K\r");
    let _ = io::stdout().flush();

    println!("\n=== RUN SUMMARY ===");
    println!("Run Duration: {:.2}s", outcome.duration.as_secs_f64());

    if let Some(stats) = &outcome.bulk_stats {
        println!(
            "Export Lines: {} ({} records, {} malformed)",
            stats.lines, stats.records, stats.malformed
        );
    }

    println!("{:<12} {:<40} {:>8} {:>8} {:>9}", "Provider", "State", "Raw", "Kept", "Warnings");
    for report in &outcome.reports {
        println!(
            "{:<12} {:<40} {:>8} {:>8} {:>9}",
            report.provider,
            truncate(&report.state.to_string(), 40),
            report.raw_matches,
            report.matches.len(),
            report.warnings.len()
        );
    }

    let total = outcome.matches().len();
    println!("Total Matches: {}", total);
    println!("Warnings: {}", outcome.warning_count());
    if let Some(path) = output_file {
        println!("Results Exported: {}", path.display());
    }
    println!("===================\n");

    let failed = outcome.failed().count();
    if outcome.cancelled {
        println!("⚠️  Run cancelled. Re-run with --resume to continue where it stopped.");
    } else if failed > 0 {
        println!("⚠️  {} providers failed. Matches found so far were exported.", failed);
        for report in outcome.failed() {
            match &report.error {
                Some(error) => println!("   - {}: {}", report.provider, error),
                None => println!("   - {}: {}", report.provider, report.state),
            }
        }
    } else if total > 0 {
        println!("✅ Run completed successfully! Found {} matches.", total);
    } else {
        println!("✅ Run completed. No matches found.");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_from_count() {
        assert_eq!(VerbosityLevel::from_verbose_count(0), VerbosityLevel::Summary);
        assert_eq!(VerbosityLevel::from_verbose_count(1), VerbosityLevel::Detailed);
        assert_eq!(VerbosityLevel::from_verbose_count(2), VerbosityLevel::Debug);
        assert_eq!(VerbosityLevel::from_verbose_count(7), VerbosityLevel::Debug);
    }

    #[test]
    fn test_quiet_selects_silent() {
        assert_eq!(VerbosityLevel::from_flags(true, 0), VerbosityLevel::Silent);
        assert_eq!(VerbosityLevel::from_flags(true, 2), VerbosityLevel::Silent);
        assert_eq!(VerbosityLevel::from_flags(false, 1), VerbosityLevel::Detailed);
    }

    #[test]
    fn test_open_log_file_creates_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join("run.log");
        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "line").unwrap();
        assert!(path.exists());

        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let err = open_log_file(&blocker.join("run.log")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open log file"));
    }

    #[test]
    fn test_filter_directive_parses() {
        for level in [
            VerbosityLevel::Silent,
            VerbosityLevel::Summary,
            VerbosityLevel::Detailed,
            VerbosityLevel::Debug,
        ] {
            assert!(EnvFilter::try_new(level.filter_directive()).is_ok());
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("done", 40), "done");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }
}

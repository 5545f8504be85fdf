//! Specter CLI
//!
//! Headless entry point: optional extraction phase, inventory seeding,
//! dispatch to completion, summary output, orphan-image report, and the
//! persisted report artifact. Exit codes: 0 when every non-skipped test
//! succeeded, 1 when any test failed, 2 on process-fatal errors before
//! dispatch (bad config, duplicate test ids, extraction failure).

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use specter_runner::{
    inventory, report, snapshot_success, EventBus, RunEvent, RunSession, RunnerConfig,
};

mod output;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "specter")]
#[command(about = "Master/worker visual regression test runner")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "specter.toml")]
    config: PathBuf,

    /// Inventory file produced by the extraction step; overrides the
    /// configured path
    #[arg(long)]
    tests: Option<PathBuf>,

    /// Report directory; overrides the configured path
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Approved screenshots directory; overrides the configured path
    #[arg(long)]
    screen_dir: Option<PathBuf>,

    /// Worker binary; overrides the configured path
    #[arg(long, env = "SPECTER_WORKER_BINARY")]
    worker_binary: Option<PathBuf>,

    /// Only run tests whose id matches this pattern
    #[arg(short, long)]
    grep: Option<String>,

    /// Skip writing the report artifact
    #[arg(long)]
    no_report: bool,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Summary output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {}", e);
            std::process::exit(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = RunnerConfig::load(&cli.config)?;
    if let Some(tests) = cli.tests {
        config.tests_file = tests;
    }
    if let Some(report_dir) = cli.report_dir {
        config.report_dir = report_dir;
    }
    if let Some(screen_dir) = cli.screen_dir {
        config.screen_dir = screen_dir;
    }
    if let Some(worker_binary) = cli.worker_binary {
        config.worker_binary = worker_binary;
    }

    let bus = EventBus::default();

    // Process-fatal when it fails: nothing has been dispatched yet.
    inventory::run_extraction(&config, &bus).await?;

    let mut descriptors = inventory::load_inventory(&config.tests_file)?;
    if let Some(pattern) = &cli.grep {
        let regex = Regex::new(pattern).context("invalid grep pattern")?;
        let before = descriptors.len();
        descriptors = filter_tests(descriptors, &regex);
        info!("grep matched {} of {} tests", descriptors.len(), before);
    }

    let runnable = descriptors.iter().filter(|d| !d.skip).count() as u64;
    let session = RunSession::new(config.clone(), &descriptors, bus.clone())?;

    let progress = if cli.no_progress {
        None
    } else {
        Some(spawn_progress(&bus, runnable))
    };

    let snapshot = session.run_to_stop().await?;
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    output::print_summary(&snapshot, cli.format);

    // Advisory only: report orphans, never delete them.
    let orphans = report::reconcile_images(&config.screen_dir, &snapshot)?;
    if !orphans.is_empty() {
        println!("Unreferenced screenshots that can be freely removed:");
        for orphan in &orphans {
            println!("  {}", orphan);
        }
    }

    let final_snapshot = session.shutdown_and_wait().await?;
    if !cli.no_report {
        report::save_report(
            &config.report_dir,
            config.static_dir.as_deref(),
            &final_snapshot,
        )?;
    }
    session.join().await?;

    Ok(snapshot_success(&final_snapshot))
}

/// Keep only tests whose id matches the grep pattern.
fn filter_tests(
    mut descriptors: Vec<specter_common::TestDescriptor>,
    pattern: &Regex,
) -> Vec<specter_common::TestDescriptor> {
    descriptors.retain(|d| pattern.is_match(&d.id()));
    descriptors
}

/// Tick a progress bar off test-updated events until the run stops.
fn spawn_progress(bus: &EventBus, total: u64) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RunEvent::TestUpdated { test_id, status }) if status.is_terminal() => {
                    bar.set_message(test_id);
                    bar.inc(1);
                }
                Ok(RunEvent::Stop { .. }) => {
                    bar.finish_and_clear();
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use specter_common::TestDescriptor;

    fn descriptor(story: &str, browser: &str) -> TestDescriptor {
        TestDescriptor {
            story: story.to_string(),
            test: "t".to_string(),
            browser: browser.to_string(),
            skip: false,
            retries: None,
        }
    }

    #[test]
    fn test_filter_tests_by_id() {
        let descriptors = vec![
            descriptor("forms/button", "chromium"),
            descriptor("forms/input", "chromium"),
            descriptor("forms/button", "firefox"),
        ];

        let regex = Regex::new("button").unwrap();
        let filtered = filter_tests(descriptors.clone(), &regex);
        assert_eq!(filtered.len(), 2);

        let regex = Regex::new("firefox$").unwrap();
        let filtered = filter_tests(descriptors, &regex);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id(), "forms/button/t/firefox");
    }
}

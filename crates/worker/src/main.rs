//! Specter Worker
//!
//! One worker process drives one browser session. It reads `assign`
//! messages from stdin, one JSON document per line, executes each test, and
//! answers with exactly one `result` message on stdout. Logs go to stderr;
//! stdout carries nothing but wire messages.

use clap::Parser;
use specter_common::Message;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod capture;
mod compare;
mod execute;

use capture::PlaywrightCapture;
use compare::Comparator;
use execute::TestExecutor;

#[derive(Parser)]
#[command(name = "specter-worker")]
#[command(about = "Specter worker - executes visual regression tests in one browser")]
#[command(version)]
struct Cli {
    /// Worker id assigned by the orchestrator
    #[arg(long, default_value = "0")]
    worker_id: u32,

    /// Browser name this worker serves
    #[arg(long)]
    browser: String,

    /// Directory of approved screenshots
    #[arg(long, env = "SPECTER_SCREEN_DIR", default_value = "images")]
    screen_dir: PathBuf,

    /// Directory actual and diff images are written to
    #[arg(long, env = "SPECTER_REPORT_DIR", default_value = "report")]
    report_dir: PathBuf,

    /// Browser engine (chromium, firefox, webkit)
    #[arg(long, env = "SPECTER_BROWSER_KIND", default_value = "chromium")]
    kind: String,

    /// Storybook instance stories render from
    #[arg(long, env = "SPECTER_STORYBOOK_URL", default_value = "http://127.0.0.1:6006")]
    storybook_url: String,

    #[arg(long, env = "SPECTER_VIEWPORT_WIDTH", default_value = "1280")]
    viewport_width: u32,

    #[arg(long, env = "SPECTER_VIEWPORT_HEIGHT", default_value = "720")]
    viewport_height: u32,

    /// Percentage of differing pixels tolerated
    #[arg(long, env = "SPECTER_DIFF_THRESHOLD", default_value = "0.5")]
    diff_threshold: f64,

    /// Per-channel color tolerance
    #[arg(long, env = "SPECTER_PIXEL_TOLERANCE", default_value = "5")]
    pixel_tolerance: u8,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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

    info!(
        "specter-worker {} starting ({} / {})",
        cli.worker_id, cli.browser, cli.kind
    );

    let capture = PlaywrightCapture::new(
        cli.kind.clone(),
        cli.storybook_url.clone(),
        cli.viewport_width,
        cli.viewport_height,
    );
    let executor = TestExecutor::new(
        capture,
        Comparator::new(cli.pixel_tolerance, cli.diff_threshold),
        cli.screen_dir.clone(),
        cli.report_dir.clone(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match Message::decode(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };
        match message {
            Message::Assign { test } => {
                info!("executing {}", test.id());
                let result = executor.execute(&test).await;
                let encoded = result.encode()?;
                stdout.write_all(encoded.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Message::Shutdown => {
                info!("shutdown requested");
                break;
            }
            other => warn!("unexpected message: {:?}", other),
        }
    }

    info!("specter-worker {} exiting", cli.worker_id);
    Ok(())
}

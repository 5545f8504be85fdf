//! Test inventory - the inbound interface to the extraction collaborator.
//!
//! The extraction step (an external build) writes an ordered JSON array of
//! test descriptors; the runner consumes it exactly once at seeding time.
//! When an extraction command is configured, its outcome travels over the
//! event bus as `extract-success` / `extract-fail` and the run awaits that
//! single message before touching the inventory.

use specter_common::{Error, Result, TestDescriptor};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::bus::{EventBus, RunEvent};
use crate::config::RunnerConfig;

/// Load the inventory file: an ordered array of descriptor records, each
/// keyed by its browser name. Seeding order is file order.
pub fn load_inventory(path: &Path) -> Result<Vec<TestDescriptor>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Extraction(format!("cannot read inventory {}: {}", path.display(), e))
    })?;
    let descriptors: Vec<TestDescriptor> = serde_json::from_str(&content).map_err(|e| {
        Error::Extraction(format!("malformed inventory {}: {}", path.display(), e))
    })?;
    debug!(
        "loaded {} tests from {}",
        descriptors.len(),
        path.display()
    );
    Ok(descriptors)
}

/// Run the configured extraction command, if any, publishing its outcome on
/// the bus and awaiting it. A failure aborts the run before any test
/// executes.
pub async fn run_extraction(config: &RunnerConfig, bus: &EventBus) -> Result<()> {
    let Some(command_line) = config.extract_command.clone() else {
        return Ok(());
    };

    // Subscribe before triggering the producer; the bus does not persist.
    let outcome = bus.subscribe_once(|event| {
        matches!(
            event,
            RunEvent::ExtractSuccess | RunEvent::ExtractFail { .. }
        )
    });

    info!("running extraction: {}", command_line);
    let publisher = bus.clone();
    tokio::spawn(async move {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => publisher.publish(RunEvent::ExtractSuccess),
            Ok(status) => publisher.publish(RunEvent::ExtractFail {
                reason: format!("extraction exited with {}", status),
            }),
            Err(e) => publisher.publish(RunEvent::ExtractFail {
                reason: format!("failed to run extraction: {}", e),
            }),
        }
    });

    match outcome.wait().await? {
        RunEvent::ExtractSuccess => Ok(()),
        RunEvent::ExtractFail { reason } => Err(Error::Extraction(reason)),
        _ => Err(Error::Internal("extraction subscription yielded an unrelated event".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_inventory_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tests.json");
        std::fs::write(
            &path,
            r#"[
                {"story": "b/story", "test": "idle", "browser": "chromium"},
                {"story": "a/story", "test": "idle", "browser": "chromium", "skip": true},
                {"story": "a/story", "test": "hover", "browser": "firefox", "retries": 2}
            ]"#,
        )
        .unwrap();

        let descriptors = load_inventory(&path).unwrap();
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].id(), "b/story/idle/chromium");
        assert!(descriptors[1].skip);
        assert_eq!(descriptors[2].retries, Some(2));
    }

    #[test]
    fn test_missing_inventory_is_extraction_error() {
        let result = load_inventory(Path::new("/nonexistent/tests.json"));
        assert!(matches!(result, Err(Error::Extraction(_))));
    }

    #[tokio::test]
    async fn test_extraction_skipped_when_unconfigured() {
        let config = RunnerConfig::default();
        let bus = EventBus::default();
        assert!(run_extraction(&config, &bus).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extraction_success_and_failure() {
        let bus = EventBus::default();

        let mut config = RunnerConfig::default();
        config.extract_command = Some("true".to_string());
        assert!(run_extraction(&config, &bus).await.is_ok());

        config.extract_command = Some("false".to_string());
        let result = run_extraction(&config, &bus).await;
        assert!(matches!(result, Err(Error::Extraction(_))));
    }
}

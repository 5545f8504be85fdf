//! Per-test execution: capture, persist, compare, report.

use specter_common::{Error, ImageRef, Message, Result, TestDescriptor, TestStatus};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use crate::capture::BrowserCapture;
use crate::compare::Comparator;

/// Executes assigned tests one at a time
pub struct TestExecutor<C> {
    capture: C,
    comparator: Comparator,
    screen_dir: PathBuf,
    report_dir: PathBuf,
}

impl<C: BrowserCapture> TestExecutor<C> {
    pub fn new(
        capture: C,
        comparator: Comparator,
        screen_dir: PathBuf,
        report_dir: PathBuf,
    ) -> Self {
        Self {
            capture,
            comparator,
            screen_dir,
            report_dir,
        }
    }

    /// Run one assigned test to a single terminal result message. Every
    /// failure mode here is a per-test failure; crashes are what the
    /// orchestrator infers when this process dies instead of answering.
    pub async fn execute(&self, test: &TestDescriptor) -> Message {
        let started = Instant::now();
        let (status, images, error) = match self.run(test).await {
            Ok(outcome) => outcome,
            Err(e) => (TestStatus::Failed, BTreeMap::new(), Some(e.to_string())),
        };
        Message::Result {
            test_id: test.id(),
            status,
            images,
            error,
            duration_ms: Some(started.elapsed().as_millis() as u64),
        }
    }

    async fn run(
        &self,
        test: &TestDescriptor,
    ) -> Result<(TestStatus, BTreeMap<String, ImageRef>, Option<String>)> {
        // Expected lives under the screens dir, actual and diff under the
        // report dir, all sharing the story/test/browser layout.
        let expected_rel = format!("{}/{}/{}.png", test.story, test.test, test.browser);
        let actual_rel = format!("{}/{}/{}-actual.png", test.story, test.test, test.browser);
        let diff_rel = format!("{}/{}/{}-diff.png", test.story, test.test, test.browser);

        let png = self.capture.capture(test).await?;
        let actual_path = self.report_dir.join(&actual_rel);
        if let Some(parent) = actual_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&actual_path, &png)?;

        let mut image = ImageRef {
            expected: expected_rel.clone(),
            actual: actual_rel,
            diff: None,
        };

        let expected_path = self.screen_dir.join(&expected_rel);
        if !expected_path.exists() {
            let error = Error::ExpectedImageMissing(expected_rel).to_string();
            warn!("{}: {}", test.id(), error);
            let mut images = BTreeMap::new();
            images.insert(test.test.clone(), image);
            return Ok((TestStatus::Failed, images, Some(error)));
        }

        let outcome = self.comparator.compare_files(&expected_path, &actual_path)?;
        if let Some(diff_image) = &outcome.diff_image {
            let diff_path = self.report_dir.join(&diff_rel);
            if let Some(parent) = diff_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            diff_image
                .save(&diff_path)
                .map_err(|e| Error::Compare(e.to_string()))?;
            image.diff = Some(diff_rel);
        }

        let mut images = BTreeMap::new();
        images.insert(test.test.clone(), image);

        if outcome.matches {
            info!("{} passed", test.id());
            Ok((TestStatus::Success, images, None))
        } else {
            let error = format!("{:.2}% pixels differ", outcome.diff_percent);
            warn!("{}: {}", test.id(), error);
            Ok((TestStatus::Failed, images, Some(error)))
        }
    }
}

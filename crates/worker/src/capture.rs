//! Browser capture.
//!
//! The browser-automation protocol stays external: the worker only depends
//! on the [`BrowserCapture`] trait. The provided implementation generates a
//! small Playwright script per test and runs it under node, reading the
//! screenshot it produces.

use async_trait::async_trait;
use specter_common::{Error, Result, TestDescriptor};
use tokio::process::Command;
use tracing::debug;

/// Produces one screenshot for one test
#[async_trait]
pub trait BrowserCapture: Send + Sync {
    /// Render the story and return the screenshot as PNG bytes.
    async fn capture(&self, test: &TestDescriptor) -> Result<Vec<u8>>;
}

/// Playwright-backed capture: one node invocation per test
pub struct PlaywrightCapture {
    /// chromium, firefox or webkit
    kind: String,
    storybook_url: String,
    viewport_width: u32,
    viewport_height: u32,
}

impl PlaywrightCapture {
    pub fn new(
        kind: impl Into<String>,
        storybook_url: impl Into<String>,
        viewport_width: u32,
        viewport_height: u32,
    ) -> Self {
        Self {
            kind: kind.into(),
            storybook_url: storybook_url.into(),
            viewport_width,
            viewport_height,
        }
    }

    /// Storybook renders one story per page under iframe.html; the story id
    /// is the slugged story path.
    fn story_url(&self, test: &TestDescriptor) -> String {
        let story_id = test.story.replace('/', "--").replace(' ', "-").to_lowercase();
        format!("{}/iframe.html?id={}", self.storybook_url, story_id)
    }

    /// Build the per-test Playwright script.
    fn build_script(&self, test: &TestDescriptor, output: &str) -> String {
        format!(
            r#"
const {{ chromium, firefox, webkit }} = require('playwright');

(async () => {{
  const browser = await {kind}.launch({{ headless: true }});
  const context = await browser.newContext({{
    viewport: {{ width: {width}, height: {height} }}
  }});
  const page = await context.newPage();

  try {{
    await page.goto('{url}', {{ waitUntil: 'networkidle' }});
    await page.screenshot({{ path: '{output}', fullPage: false }});
    console.log(JSON.stringify({{ success: true }}));
  }} catch (error) {{
    console.error(JSON.stringify({{ success: false, error: error.message }}));
    process.exit(1);
  }} finally {{
    await browser.close();
  }}
}})();
"#,
            kind = self.kind,
            width = self.viewport_width,
            height = self.viewport_height,
            url = self.story_url(test),
            output = output,
        )
    }
}

#[async_trait]
impl BrowserCapture for PlaywrightCapture {
    async fn capture(&self, test: &TestDescriptor) -> Result<Vec<u8>> {
        let temp_dir = tempfile::tempdir()?;
        let shot_path = temp_dir.path().join("shot.png");
        let script = self.build_script(test, &shot_path.to_string_lossy());
        let script_path = temp_dir.path().join("capture.js");
        std::fs::write(&script_path, script)?;

        debug!("capturing {} via {}", test.id(), self.kind);

        let output = Command::new("node")
            .arg(&script_path)
            .current_dir(temp_dir.path())
            .output()
            .await
            .map_err(|e| Error::Capture(format!("failed to run node: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Capture(format!(
                "capture script failed for {}: {}",
                test.id(),
                stderr.trim()
            )));
        }

        std::fs::read(&shot_path).map_err(|e| {
            Error::Capture(format!("capture produced no screenshot: {}", e))
        })
    }
}

//! Runner configuration

use serde::{Deserialize, Serialize};
use specter_common::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// Configuration for one run session. Every field falls back to its
/// default, so a config file only states what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory holding the approved (expected) screenshots
    pub screen_dir: PathBuf,

    /// Directory the report artifact is written to
    pub report_dir: PathBuf,

    /// Static viewer assets copied next to the report data file, when set
    pub static_dir: Option<PathBuf>,

    /// Path to the inventory produced by the extraction step
    pub tests_file: PathBuf,

    /// Command that produces the inventory; run before seeding when set
    pub extract_command: Option<String>,

    /// Worker binary spawned once per pool slot
    pub worker_binary: PathBuf,

    /// Additional attempts allowed per test after the first failed one
    pub max_retries: u32,

    /// Seconds in-flight tests are awaited during shutdown
    pub shutdown_grace_secs: u64,

    /// Consecutive crashes before a worker stops being respawned
    pub worker_restart_limit: u32,

    /// Percentage of differing pixels tolerated before a screenshot fails
    pub diff_threshold: f64,

    /// Per-channel color tolerance for the pixel comparator
    pub pixel_tolerance: u8,

    /// Browser pools, keyed by the browser name tests reference
    pub browsers: HashMap<String, BrowserConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let mut browsers = HashMap::new();
        browsers.insert("chromium".to_string(), BrowserConfig::default());
        Self {
            screen_dir: PathBuf::from("images"),
            report_dir: PathBuf::from("report"),
            static_dir: None,
            tests_file: PathBuf::from("tests.json"),
            extract_command: None,
            worker_binary: PathBuf::from("specter-worker"),
            max_retries: 0,
            shutdown_grace_secs: 30,
            worker_restart_limit: 3,
            diff_threshold: 0.5,
            pixel_tolerance: 5,
            browsers,
        }
    }
}

/// Per-browser pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Worker pool size for this browser
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Browser engine driven by the worker
    #[serde(default)]
    pub kind: BrowserKind,

    #[serde(default = "default_viewport")]
    pub viewport: Viewport,

    /// Storybook instance stories are rendered from
    #[serde(default = "default_storybook_url")]
    pub storybook_url: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            kind: BrowserKind::default(),
            viewport: default_viewport(),
            storybook_url: default_storybook_url(),
        }
    }
}

fn default_limit() -> u32 {
    1
}

fn default_viewport() -> Viewport {
    Viewport { width: 1280, height: 720 }
}

fn default_storybook_url() -> String {
    "http://127.0.0.1:6006".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Browser engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.browsers.is_empty() {
            return Err(Error::InvalidConfig("no browsers configured".into()));
        }
        for (name, browser) in &self.browsers {
            if browser.limit == 0 {
                return Err(Error::InvalidConfig(format!(
                    "browser {} has a zero worker limit",
                    name
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.diff_threshold) {
            return Err(Error::InvalidConfig(format!(
                "diff_threshold {} outside 0..=100",
                self.diff_threshold
            )));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunnerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.browsers["chromium"].limit, 1);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RunnerConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: RunnerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.screen_dir, config.screen_dir);
        assert_eq!(parsed.browsers.len(), 1);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config = RunnerConfig::default();
        config.browsers.get_mut("chromium").unwrap().limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_browser_kind_from_toml() {
        let toml = r#"
            screen_dir = "images"
            report_dir = "report"
            tests_file = "tests.json"
            worker_binary = "specter-worker"
            max_retries = 2
            shutdown_grace_secs = 10
            worker_restart_limit = 3
            diff_threshold = 0.5
            pixel_tolerance = 5

            [browsers.ff]
            limit = 2
            kind = "firefox"
        "#;
        let config: RunnerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.browsers["ff"].kind, BrowserKind::Firefox);
        assert_eq!(config.browsers["ff"].limit, 2);
        assert_eq!(config.max_retries, 2);
    }
}

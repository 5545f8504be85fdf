//! Report assembly - the persisted, self-contained result artifact.
//!
//! The artifact is a directory of static viewer assets plus one generated
//! `data.js` whose evaluated body is exactly the final per-test snapshot.
//! The file works both ways: as a CommonJS module and as a plain script that
//! parks the data on the global object, so the same artifact opens directly
//! in a browser or loads programmatically.

use specter_common::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::registry::Snapshot;

/// Name of the generated data file inside the report directory
pub const DATA_FILE: &str = "data.js";

/// Global the browser-mode loader parks the snapshot on
const DATA_GLOBAL: &str = "__SPECTER_DATA__";

/// Render the dual-mode data module. Snapshot keys are sorted, so the output
/// is byte-stable for a given snapshot.
pub fn report_data_module(snapshot: &Snapshot) -> Result<String> {
    let payload = serde_json::to_string(snapshot)?;
    Ok(format!(
        r#"(function (root, factory) {{
  if (typeof module === 'object' && module.exports) {{
    module.exports = factory();
  }} else {{
    root.{DATA_GLOBAL} = factory();
  }}
}}(this, function () {{ return {payload} }}));
"#
    ))
}

/// Extract the snapshot back out of a data module. Programmatic loading for
/// consumers (and tests) that hold the artifact, not a browser.
pub fn parse_data_module(module: &str) -> Result<Snapshot> {
    let start = module
        .find("function () { return ")
        .map(|i| i + "function () { return ".len());
    let end = module.rfind(" }));");
    match (start, end) {
        (Some(start), Some(end)) if start < end => {
            Ok(serde_json::from_str(&module[start..end])?)
        }
        _ => Err(specter_common::Error::Protocol(
            "not a specter data module".into(),
        )),
    }
}

/// Write the report: copy static viewer assets (when configured), then
/// generate the data module. Returns the path of the data file.
pub fn save_report(
    report_dir: &Path,
    static_dir: Option<&Path>,
    snapshot: &Snapshot,
) -> Result<PathBuf> {
    std::fs::create_dir_all(report_dir)?;

    if let Some(static_dir) = static_dir {
        copy_statics(static_dir, report_dir)?;
    }

    let data_path = report_dir.join(DATA_FILE);
    std::fs::write(&data_path, report_data_module(snapshot)?)?;
    info!("report written to {}", data_path.display());
    Ok(data_path)
}

/// Copy the viewer's static files (top level only) into the report dir.
fn copy_statics(static_dir: &Path, report_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(static_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let target = report_dir.join(entry.file_name());
        std::fs::copy(entry.path(), &target)?;
        debug!("copied {} to report", entry.file_name().to_string_lossy());
    }
    Ok(())
}

/// Every image path referenced by any record's expected/actual/diff fields
pub fn referenced_images(snapshot: &Snapshot) -> HashSet<String> {
    let mut images = HashSet::new();
    for record in snapshot.values() {
        for image in record.images.values() {
            images.insert(image.expected.clone());
            images.insert(image.actual.clone());
            if let Some(diff) = &image.diff {
                images.insert(diff.clone());
            }
        }
    }
    images
}

/// Walk the screens directory and report every on-disk image no record
/// references - exactly once per path, in deterministic traversal order.
/// Advisory only: nothing is deleted here; cleanup is a human action.
pub fn reconcile_images(screen_dir: &Path, snapshot: &Snapshot) -> Result<Vec<String>> {
    if !screen_dir.exists() {
        return Ok(Vec::new());
    }
    let referenced = referenced_images(snapshot);
    let mut orphans = Vec::new();
    for entry in WalkDir::new(screen_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            specter_common::Error::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walk error")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(screen_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        if !referenced.contains(&relative) {
            orphans.push(relative);
        }
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use specter_common::{ImageRef, TestDescriptor, TestRecord, TestStatus};
    use std::collections::BTreeMap;

    fn snapshot_with(images: &[(&str, &str)]) -> Snapshot {
        let descriptor = TestDescriptor {
            story: "widgets/button".into(),
            test: "idle".into(),
            browser: "chromium".into(),
            skip: false,
            retries: None,
        };
        let mut record = TestRecord::new(descriptor);
        record.status = TestStatus::Success;
        for (name, expected) in images {
            record.images.insert(
                name.to_string(),
                ImageRef {
                    expected: expected.to_string(),
                    actual: format!("actual/{}", expected),
                    diff: None,
                },
            );
        }
        let mut snapshot = Snapshot::new();
        snapshot.insert(record.id(), record);
        snapshot
    }

    #[test]
    fn test_data_module_round_trip() {
        let snapshot = snapshot_with(&[("idle", "chromium/button/idle.png")]);
        let module = report_data_module(&snapshot).unwrap();

        // dual-mode wrapper present
        assert!(module.contains("module.exports = factory()"));
        assert!(module.contains("root.__SPECTER_DATA__ = factory()"));

        let parsed = parse_data_module(&module).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_data_module_is_deterministic() {
        let snapshot = snapshot_with(&[("idle", "chromium/button/idle.png")]);
        assert_eq!(
            report_data_module(&snapshot).unwrap(),
            report_data_module(&snapshot).unwrap()
        );
    }

    #[test]
    fn test_save_report_writes_data_and_statics() {
        let dir = tempfile::tempdir().unwrap();
        let static_dir = dir.path().join("static");
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(static_dir.join("index.html"), "<html></html>").unwrap();

        let report_dir = dir.path().join("report");
        let snapshot = snapshot_with(&[]);
        let data_path = save_report(&report_dir, Some(&static_dir), &snapshot).unwrap();

        assert!(data_path.exists());
        assert!(report_dir.join("index.html").exists());
    }

    #[test]
    fn test_reconcile_reports_only_orphans_once() {
        let dir = tempfile::tempdir().unwrap();
        let screens = dir.path().join("images");
        std::fs::create_dir_all(screens.join("chromium/button")).unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            std::fs::write(screens.join("chromium/button").join(name), b"png").unwrap();
        }

        let snapshot = snapshot_with(&[
            ("a", "chromium/button/a.png"),
            ("b", "chromium/button/b.png"),
        ]);

        let orphans = reconcile_images(&screens, &snapshot).unwrap();
        assert_eq!(orphans, vec!["chromium/button/c.png".to_string()]);

        // still on disk: reporting never deletes
        assert!(screens.join("chromium/button/c.png").exists());
    }

    #[test]
    fn test_reconcile_missing_dir_is_empty() {
        let snapshot = snapshot_with(&[]);
        let orphans =
            reconcile_images(Path::new("/nonexistent/screens"), &snapshot).unwrap();
        assert!(orphans.is_empty());
    }
}

//! Output formatting for the run summary

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use specter_common::TestStatus;
use specter_runner::Snapshot;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Per-status totals over a snapshot: (passed, failed, skipped)
pub fn totals(snapshot: &Snapshot) -> (usize, usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for record in snapshot.values() {
        match record.status {
            TestStatus::Success => passed += 1,
            TestStatus::Failed => failed += 1,
            TestStatus::Skipped => skipped += 1,
            _ => {}
        }
    }
    (passed, failed, skipped)
}

/// Print the final per-test summary in the requested format.
pub fn print_summary(snapshot: &Snapshot, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(vec!["Test", "Status", "Attempts", "Duration", "Error"]);
            for (test_id, record) in snapshot {
                table.add_row(vec![
                    test_id.clone(),
                    record.status.to_string(),
                    record.attempts.to_string(),
                    record
                        .duration_ms
                        .map(|ms| format!("{} ms", ms))
                        .unwrap_or_default(),
                    record.error.clone().unwrap_or_default(),
                ]);
            }
            println!("{table}");

            let (passed, failed, skipped) = totals(snapshot);
            let passed = format!("{} passed", passed).green();
            let failed_text = format!("{} failed", failed);
            let failed = if failed > 0 {
                failed_text.red()
            } else {
                failed_text.normal()
            };
            println!("{}, {}, {} skipped", passed, failed, skipped);
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(snapshot).unwrap_or_default()
            );
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(snapshot).unwrap_or_default());
        }
        OutputFormat::Plain => {
            for (test_id, record) in snapshot {
                match &record.error {
                    Some(error) => println!("{}: {} ({})", test_id, record.status, error),
                    None => println!("{}: {}", test_id, record.status),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specter_common::{TestDescriptor, TestRecord};

    fn record(story: &str, status: TestStatus) -> TestRecord {
        let mut record = TestRecord::new(TestDescriptor {
            story: story.to_string(),
            test: "t".to_string(),
            browser: "chromium".to_string(),
            skip: false,
            retries: None,
        });
        record.status = status;
        record
    }

    #[test]
    fn test_totals() {
        let mut snapshot = Snapshot::new();
        for (story, status) in [
            ("a", TestStatus::Success),
            ("b", TestStatus::Success),
            ("c", TestStatus::Failed),
            ("d", TestStatus::Skipped),
        ] {
            let r = record(story, status);
            snapshot.insert(r.id(), r);
        }
        assert_eq!(totals(&snapshot), (2, 1, 1));
    }
}

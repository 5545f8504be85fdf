//! Wire messages between the orchestrator and its worker processes.
//!
//! Workers speak newline-delimited JSON over stdio: one message per line,
//! discriminated by a `type` tag. The enum is closed on purpose — every
//! consumption site matches exhaustively, so a new message kind is a
//! compile-time-checked addition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{ImageRef, TestDescriptor, TestStatus};

/// A single message on the wire. Messages carry values only; no shared
/// mutable state ever crosses a process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Orchestrator -> worker: execute this test.
    Assign { test: TestDescriptor },

    /// Worker -> orchestrator: terminal outcome of the assigned test.
    Result {
        test_id: String,
        status: TestStatus,
        #[serde(default)]
        images: BTreeMap<String, ImageRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    /// A worker process died. Synthesized by the orchestrator when the
    /// process exits without delivering a result.
    Crash { worker_id: u32 },

    /// Orchestrator -> worker: finish up and exit.
    Shutdown,

    /// The extraction step produced the test inventory.
    ExtractSuccess,

    /// The extraction step failed; the run aborts before dispatch.
    ExtractFail { reason: String },
}

impl Message {
    /// Encode as a single JSON line (no trailing newline).
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line off the wire.
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| Error::Protocol(format!("bad message {:?}: {}", line, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TestDescriptor {
        TestDescriptor {
            story: "widgets/dialog".into(),
            test: "open".into(),
            browser: "chrome".into(),
            skip: false,
            retries: None,
        }
    }

    #[test]
    fn test_kind_tags() {
        let encoded = Message::Assign { test: descriptor() }.encode().unwrap();
        assert!(encoded.contains(r#""type":"assign""#));

        let encoded = Message::ExtractSuccess.encode().unwrap();
        assert!(encoded.contains(r#""type":"extract-success""#));

        let encoded = Message::ExtractFail { reason: "compile error".into() }
            .encode()
            .unwrap();
        assert!(encoded.contains(r#""type":"extract-fail""#));

        let encoded = Message::Shutdown.encode().unwrap();
        assert!(encoded.contains(r#""type":"shutdown""#));
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let mut images = BTreeMap::new();
        images.insert(
            "open".to_string(),
            ImageRef {
                expected: "chrome/dialog/open.png".into(),
                actual: "chrome/dialog/open-actual.png".into(),
                diff: Some("chrome/dialog/open-diff.png".into()),
            },
        );

        let messages = vec![
            Message::Assign { test: descriptor() },
            Message::Result {
                test_id: descriptor().id(),
                status: TestStatus::Failed,
                images,
                error: Some("2.31% pixels differ".into()),
                duration_ms: Some(1043),
            },
            Message::Crash { worker_id: 3 },
            Message::Shutdown,
            Message::ExtractSuccess,
            Message::ExtractFail { reason: "webpack exited 1".into() },
        ];

        for message in messages {
            let line = message.encode().unwrap();
            assert!(!line.contains('\n'));
            assert_eq!(Message::decode(&line).unwrap(), message);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode("not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"warp"}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_result_optional_fields_omitted() {
        let line = Message::Result {
            test_id: "a/b/c".into(),
            status: TestStatus::Success,
            images: BTreeMap::new(),
            error: None,
            duration_ms: None,
        }
        .encode()
        .unwrap();
        assert!(!line.contains("error"));
        assert!(!line.contains("duration_ms"));
    }
}

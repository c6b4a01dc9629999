//! QF-013: Append-only JSONL run journal.
//!
//! Written for humans and audits; the executor never reads it back.

use super::types::{ProvenanceEvent, TimestampedEvent};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::Path;

/// Default journal file name, relative to the pipeline directory.
pub const JOURNAL_FILE: &str = "pipeline_events.jsonl";

/// Current UTC time, RFC 3339 with second precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Append one event to the journal at `path`.
pub fn append_event(path: &Path, event: ProvenanceEvent) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create journal dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("cannot open journal {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qf013_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_qf013_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_qf013_append_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join(JOURNAL_FILE);
        append_event(
            &path,
            ProvenanceEvent::RunStarted {
                run_id: "r-1".into(),
                target: "full".into(),
                qtlflow_version: "0.3.0".into(),
            },
        )
        .unwrap();
        append_event(
            &path,
            ProvenanceEvent::TaskFailed {
                run_id: "r-1".into(),
                task: "run_mxqtl".into(),
                kind: "external-tool".into(),
                error: "stage 1 exited with code 2".into(),
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "run_started");
        assert_eq!(first["target"], "full");
        assert!(first["ts"].is_string());
        let second: TimestampedEvent = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(second.event, ProvenanceEvent::TaskFailed { ref task, .. } if task == "run_mxqtl"));
    }
}

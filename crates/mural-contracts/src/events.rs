use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `events.jsonl`.
///
/// Default fields are `type`, `batch_id`, `ts`; the caller payload is merged
/// last and can override them. One compact JSON object per line. The batch
/// runs strictly sequentially, so no locking is needed around appends.
#[derive(Debug)]
pub struct EventWriter {
    path: PathBuf,
    batch_id: String,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            batch_id: batch_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("batch_id".to_string(), Value::String(self.batch_id.clone()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "batch-123");

        let mut payload = EventPayload::new();
        payload.insert("output".to_string(), Value::String("out.png".to_string()));
        let emitted = writer.emit("batch_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("batch_started".to_string()));
        assert_eq!(parsed["batch_id"], Value::String("batch-123".to_string()));
        assert_eq!(parsed["output"], Value::String("out.png".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn emit_appends_lines_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "batch-123");

        writer.emit("item_started", EventPayload::new())?;
        writer.emit("item_completed", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["type"], Value::String("item_started".to_string()));
        assert_eq!(second["type"], Value::String("item_completed".to_string()));
        Ok(())
    }
}

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::session::Operation;

/// One line of `events.jsonl`. Image payloads never appear here; prompts are
/// recorded by length and digest only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    GenerationRequested {
        operation: Operation,
        model: String,
        client: String,
        image_count: usize,
        prompt_chars: usize,
        prompt_sha256: String,
    },
    GenerationFinished {
        operation: Operation,
        media_type: String,
        status: Option<String>,
        placements: usize,
        semantic_issue: Option<String>,
        finish_reason: Option<String>,
    },
    GenerationFailed {
        operation: Operation,
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_text: Option<String>,
    },
    /// Why the model stopped, when a response could not be interpreted.
    ModelDiagnostics {
        operation: Operation,
        finish_reason: Option<String>,
        block_reason: Option<String>,
    },
}

/// Session-scoped JSONL log. Clones share one lazily opened file handle.
#[derive(Debug, Clone)]
pub struct EventLog {
    session_id: Arc<str>,
    sink: Arc<Mutex<Sink>>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    file: Option<File>,
}

impl Sink {
    fn file(&mut self) -> anyhow::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open {}", self.path.display()))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .context("event log file unavailable")
    }
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            session_id: Arc::from(session_id.into()),
            sink: Arc::new(Mutex::new(Sink {
                path: path.into(),
                file: None,
            })),
        }
    }

    /// Appends `event` stamped with the session id and an RFC 3339 time.
    /// Returns the line as written.
    pub fn record(&self, event: &GenerationEvent) -> anyhow::Result<Value> {
        let Value::Object(mut line) = serde_json::to_value(event)? else {
            bail!("generation event did not serialize to an object");
        };
        line.insert(
            "session_id".to_string(),
            Value::String(self.session_id.to_string()),
        );
        line.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        let encoded = serde_json::to_string(&line)?;

        let mut sink = self
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let file = sink.file()?;
        writeln!(file, "{encoded}")?;
        file.flush()?;
        Ok(Value::Object(line))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn failed(message: &str) -> GenerationEvent {
        GenerationEvent::GenerationFailed {
            operation: Operation::Refine,
            kind: "invalid_request".to_string(),
            message: message.to_string(),
            raw_text: None,
        }
    }

    #[test]
    fn record_writes_tagged_line_with_session_and_time() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let log = EventLog::new(&path, "session-7");

        let written = log.record(&GenerationEvent::GenerationRequested {
            operation: Operation::Generate,
            model: "dryrun-image-1".to_string(),
            client: "dryrun".to_string(),
            image_count: 2,
            prompt_chars: 120,
            prompt_sha256: "ab".repeat(32),
        })?;

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed, written);
        assert_eq!(parsed["type"], json!("generation_requested"));
        assert_eq!(parsed["operation"], json!("generate"));
        assert_eq!(parsed["session_id"], json!("session-7"));
        assert_eq!(parsed["image_count"], json!(2));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn absent_raw_text_is_omitted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = EventLog::new(temp.path().join("events.jsonl"), "s");
        let written = log.record(&failed("empty instruction"))?;
        assert_eq!(written["type"], json!("generation_failed"));
        assert_eq!(written["operation"], json!("refine"));
        assert!(written.get("raw_text").is_none());
        Ok(())
    }

    #[test]
    fn clones_share_one_log_without_interleaving() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-7");

        let handles = (0..4)
            .map(|worker| {
                let log = log.clone();
                thread::spawn(move || -> anyhow::Result<()> {
                    for idx in 0..10 {
                        log.record(&failed(&format!("worker {worker} line {idx}")))?;
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 40);
        for line in lines {
            let parsed: Value = serde_json::from_str(line)?;
            assert_eq!(parsed["kind"], json!("invalid_request"));
        }
        Ok(())
    }
}

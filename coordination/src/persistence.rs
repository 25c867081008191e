//! Optional interaction sink.
//!
//! The coordinator hands every collected response to the sink after the
//! session lease is released. Sink errors are logged and otherwise ignored.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Error type for interaction sinks
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One worker's contribution to one coordination call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub session_id: String,
    pub query: String,
    pub worker_id: String,
    pub variant: String,
    pub response: String,
    pub confidence: f32,
    pub latency_ms: u64,
    /// Whether this response was chosen as primary
    pub primary: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Receives interaction records.
#[async_trait]
pub trait InteractionSink: Send + Sync {
    async fn record(&self, records: &[InteractionRecord]) -> Result<(), SinkError>;
}

pub type SharedSink = Arc<dyn InteractionSink>;

/// Keeps records in memory; useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryInteractionSink {
    records: Mutex<Vec<InteractionRecord>>,
}

impl MemoryInteractionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InteractionRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl InteractionSink for MemoryInteractionSink {
    async fn record(&self, records: &[InteractionRecord]) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(records);
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlInteractionSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlInteractionSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl InteractionSink for JsonlInteractionSink {
    async fn record(&self, records: &[InteractionRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(worker: &str, primary: bool) -> InteractionRecord {
        InteractionRecord {
            session_id: "s1".into(),
            query: "why does it explode".into(),
            worker_id: worker.into(),
            variant: worker.to_uppercase(),
            response: "lower the timestep".into(),
            confidence: 0.8,
            latency_ms: 42,
            primary,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_accumulates() {
        let sink = MemoryInteractionSink::new();
        sink.record(&[record("physics", true)]).await.unwrap();
        sink.record(&[record("debug", false)]).await.unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].primary);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlInteractionSink::new(dir.path().join("interactions.jsonl"));
        sink.record(&[record("physics", true), record("viz", false)])
            .await
            .unwrap();
        sink.record(&[]).await.unwrap();
        sink.record(&[record("debug", false)]).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: InteractionRecord = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last.worker_id, "debug");
    }

    #[tokio::test]
    async fn test_jsonl_sink_reports_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlInteractionSink::new(dir.path().join("missing").join("x.jsonl"));
        let err = sink.record(&[record("physics", true)]).await.unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
    }
}

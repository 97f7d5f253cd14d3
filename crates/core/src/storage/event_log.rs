use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Event log stored as gzip-compressed JSON Lines, one file per run.
///
/// Every append writes a self-contained gzip member, so files grow without
/// being rewritten and are read back with a multi-member decoder.
pub struct JsonlEventLog {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Format: <base>/runs/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId) -> PathBuf {
        self.base_path
            .join("runs")
            .join(format!("{}.jsonl.gz", run_id))
    }

    fn encode_member(event: &Event) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
        encoder.finish().context("Failed to finish compression")
    }

    fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
        let file = std::fs::File::open(path).context("Failed to open event log")?;
        let reader = std::io::BufReader::new(MultiGzDecoder::new(file));

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.context("Failed to read line from event log")?;
            if line.is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let path = self.event_log_path(&event.run_id);
        let member = Self::encode_member(&event)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create event log directory")?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("Failed to open event log file")?;
        file.write_all(&member)
            .await
            .context("Failed to write event log file")?;
        file.flush().await.context("Failed to flush event log file")?;
        Ok(())
    }

    async fn run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let path = self.event_log_path(&run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        Self::read_jsonl_gz(&path)
    }
}

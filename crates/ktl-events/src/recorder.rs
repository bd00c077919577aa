use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use ktl_types::{LogPayload, StreamEvent};

use crate::fabric::Observer;

/// Appends every stream event as one JSON line.
///
/// The transcript is the session record consumed by capture tooling and by
/// tests; events keep their emission order because the recorder runs on a
/// single delivery thread.
pub struct JsonlRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlRecorder {
    /// Open (or create) a transcript file in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create transcript dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open transcript {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, event: &StreamEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("failed to serialize event")?;
        writeln!(self.writer, "{line}")
            .with_context(|| format!("failed to write transcript {}", self.path.display()))?;
        Ok(())
    }
}

impl Observer for JsonlRecorder {
    fn name(&self) -> &str {
        "jsonl-recorder"
    }

    fn handle_deploy_event(&mut self, event: &StreamEvent) -> Result<()> {
        self.append(event)
    }

    fn observe_log(&mut self, event: &StreamEvent, _log: &LogPayload) -> Result<()> {
        self.append(event)
    }

    fn close(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Read a transcript back. Missing files read as empty.
pub fn read_transcript(path: &Path) -> Result<Vec<StreamEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file =
        File::open(path).with_context(|| format!("failed to open transcript {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read transcript {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: StreamEvent = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse transcript line: {line}"))?;
        events.push(event);
    }
    Ok(events)
}

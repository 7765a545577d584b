use crate::artifacts::{DefectRecord, Summary};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Append-only defect log, one JSON object per line.
///
/// The detection worker is the only writer. Every batch is written with a
/// single append, and readers only consider newline-terminated lines, so a
/// concurrent reader always observes a prefix of the committed history.
#[derive(Debug, Clone)]
pub struct DefectStore {
    path: PathBuf,
}

#[derive(Deserialize)]
struct SummaryEntry {
    frame_pos: u64,
    time: i64,
}

#[derive(Deserialize)]
struct FrameIndexEntry {
    frame_index: u64,
}

impl DefectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, records: &[DefectRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open defect log {:?}", self.path))?;
        self.drop_torn_tail(&mut file)?;
        file.write_all(&buf)
            .with_context(|| format!("Failed to append to defect log {:?}", self.path))?;
        file.sync_data()?;
        Ok(())
    }

    /// Cut off an unterminated last line left by an interrupted append, so the
    /// next entry starts on a fresh line.
    fn drop_torn_tail(&self, file: &mut File) -> Result<()> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }

        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(());
        }

        let mut content = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut content)?;
        let keep = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |end| end + 1);

        tracing::warn!(
            "Dropping {} bytes of an interrupted append from {:?}",
            content.len() - keep,
            self.path
        );
        file.set_len(keep as u64)
            .with_context(|| format!("Failed to truncate defect log {:?}", self.path))?;
        Ok(())
    }

    /// Parse every committed entry. A missing log reads as empty.
    pub fn read_entries<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read defect log {:?}", self.path))
            }
        };

        // Ignore a trailing line that is still being written.
        let committed = match content.iter().rposition(|&b| b == b'\n') {
            Some(end) => &content[..=end],
            None => return Ok(Vec::new()),
        };

        committed
            .split(|&b| b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
            .map(|(n, line)| {
                serde_json::from_slice(line).with_context(|| {
                    format!("Malformed entry on line {} of {:?}", n + 1, self.path)
                })
            })
            .collect()
    }

    pub fn read_all(&self) -> Result<Vec<DefectRecord>> {
        self.read_entries()
    }

    /// Source frame index of the last committed entry.
    pub fn last_frame_index(&self) -> Result<Option<u64>> {
        let entries: Vec<FrameIndexEntry> = self.read_entries()?;
        Ok(entries.last().map(|e| e.frame_index))
    }

    pub fn summarize(&self, session_id: &str, speed: f64) -> Result<Summary> {
        let entries: Vec<SummaryEntry> = self.read_entries()?;
        Ok(summarize_entries(session_id, speed, &entries))
    }
}

fn summarize_entries(session_id: &str, speed: f64, entries: &[SummaryEntry]) -> Summary {
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return Summary::empty(session_id, speed);
    };

    let captures = last.frame_pos + 1;
    Summary {
        session_id: session_id.to_string(),
        elapsed_time: last.time - first.time,
        captures,
        speed,
        position: captures as f64 * speed,
        defect_count: entries.len(),
    }
}

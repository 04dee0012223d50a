//! Durable history stores.
//!
//! The engine works with the in-memory store alone; `JsonlStore` keeps one
//! JSON-lines file per entity so histories survive a restart.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::history::HistoryEntry;

pub trait DurableStore: Send + Sync {
    /// Persisted entries for an entity, oldest first.
    fn load(&self, entity_id: &str) -> Result<Vec<HistoryEntry>>;
    fn append(&self, entity_id: &str, entry: &HistoryEntry) -> Result<()>;
    /// Forget an entity entirely.
    fn release(&self, _entity_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Session-only store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Vec<HistoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for InMemoryStore {
    fn load(&self, entity_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .entries
            .get(entity_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    fn append(&self, entity_id: &str, entry: &HistoryEntry) -> Result<()> {
        self.entries
            .entry(entity_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn release(&self, entity_id: &str) -> Result<()> {
        self.entries.remove(entity_id);
        Ok(())
    }
}

/// `<dir>/<sha256(entity)>.jsonl`, one `HistoryEntry` per line.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("creating store dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, entity_id: &str) -> PathBuf {
        let digest = Sha256::digest(entity_id.as_bytes());
        let mut name = String::with_capacity(70);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut name, "{:02x}", b);
        }
        name.push_str(".jsonl");
        self.dir.join(name)
    }
}

impl DurableStore for JsonlStore {
    fn load(&self, entity_id: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.path_for(entity_id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
        };

        let mut out = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(e) => out.push(e),
                // a torn final write should not lose the rest of the history
                Err(e) => tracing::warn!(target: "store", line = i + 1, error = %e, "skipping corrupt history line"),
            }
        }
        Ok(out)
    }

    fn append(&self, entity_id: &str, entry: &HistoryEntry) -> Result<()> {
        let path = self.path_for(entity_id);
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut line = Vec::new();
        // terminate a torn final write so this entry starts on its own line
        if f.metadata().with_context(|| format!("stat {}", path.display()))?.len() > 0 {
            let mut last = [0u8; 1];
            f.seek(SeekFrom::End(-1))
                .and_then(|_| f.read_exact(&mut last))
                .with_context(|| format!("reading tail of {}", path.display()))?;
            if last[0] != b'\n' {
                line.push(b'\n');
            }
        }
        serde_json::to_writer(&mut line, entry).context("serializing history entry")?;
        line.push(b'\n');
        f.write_all(&line)
            .with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }

    fn release(&self, entity_id: &str) -> Result<()> {
        let path = self.path_for(entity_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

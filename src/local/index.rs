//! Local Existence Index
//!
//! Records which block files the local tier holds, so restarts recover the
//! slot accounting without scanning the data directory. The persistent
//! implementation is an append-only JSON-lines journal:
//!
//! ```text
//!   {"op":"put","path":"blocks/3a/91/00000000000000070000000000000002"}
//!   {"op":"remove","path":"bitmaps/4"}
//! ```
//!
//! On open the journal is replayed and rewritten with only live entries.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Existence index contract
pub trait ExistenceIndex: Send + Sync {
    /// Record `path`; returns false if it was already present
    fn put(&self, path: &Path) -> Result<bool>;

    /// Check if `path` is recorded
    fn exists(&self, path: &Path) -> bool;

    /// Forget `path`; returns whether it was present
    fn remove(&self, path: &Path) -> Result<bool>;

    /// Number of recorded paths
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every recorded path
    fn paths(&self) -> Vec<PathBuf>;
}

// =============================================================================
// In-memory index
// =============================================================================

/// Volatile index for tests and throwaway nodes
#[derive(Default)]
pub struct MemoryIndex {
    paths: Mutex<HashSet<PathBuf>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExistenceIndex for MemoryIndex {
    fn put(&self, path: &Path) -> Result<bool> {
        Ok(self.paths.lock().insert(path.to_path_buf()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }

    fn remove(&self, path: &Path) -> Result<bool> {
        Ok(self.paths.lock().remove(path))
    }

    fn len(&self) -> usize {
        self.paths.lock().len()
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().iter().cloned().collect()
    }
}

// =============================================================================
// Journal index
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Put { path: PathBuf },
    Remove { path: PathBuf },
}

struct JournalState {
    live: HashSet<PathBuf>,
    writer: BufWriter<File>,
}

/// Persistent JSON-lines index
pub struct JournalIndex {
    journal: PathBuf,
    state: Mutex<JournalState>,
}

impl JournalIndex {
    /// Open (or create) the journal at `journal`, replaying and compacting it
    pub fn open(journal: impl AsRef<Path>) -> Result<Self> {
        let journal = journal.as_ref().to_path_buf();
        if let Some(parent) = journal.parent() {
            fs::create_dir_all(parent)?;
        }

        let live = Self::replay(&journal)?;
        Self::compact(&journal, &live)?;

        let file = OpenOptions::new().create(true).append(true).open(&journal)?;
        info!(
            "Opened local index {} ({} entries)",
            journal.display(),
            live.len()
        );
        Ok(Self {
            journal,
            state: Mutex::new(JournalState {
                live,
                writer: BufWriter::new(file),
            }),
        })
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal
    }

    fn replay(journal: &Path) -> Result<HashSet<PathBuf>> {
        let mut live = HashSet::new();
        let file = match File::open(journal) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(live),
            Err(e) => return Err(e.into()),
        };

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(JournalRecord::Put { path }) => {
                    live.insert(path);
                }
                Ok(JournalRecord::Remove { path }) => {
                    live.remove(&path);
                }
                // A torn final line from a crash is expected; skip it
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping bad index record"),
            }
        }
        Ok(live)
    }

    fn compact(journal: &Path, live: &HashSet<PathBuf>) -> Result<()> {
        let tmp = journal.with_extension(format!("compact-{}", uuid::Uuid::new_v4()));
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for path in live {
                let record = JournalRecord::Put { path: path.clone() };
                serde_json::to_writer(&mut out, &record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, journal)?;
        Ok(())
    }

    fn append(state: &mut JournalState, record: &JournalRecord) -> Result<()> {
        serde_json::to_writer(&mut state.writer, record)?;
        state.writer.write_all(b"\n")?;
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl ExistenceIndex for JournalIndex {
    fn put(&self, path: &Path) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live.contains(path) {
            return Ok(false);
        }
        Self::append(
            &mut state,
            &JournalRecord::Put {
                path: path.to_path_buf(),
            },
        )?;
        state.live.insert(path.to_path_buf());
        Ok(true)
    }

    fn exists(&self, path: &Path) -> bool {
        self.state.lock().live.contains(path)
    }

    fn remove(&self, path: &Path) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.live.contains(path) {
            return Ok(false);
        }
        Self::append(
            &mut state,
            &JournalRecord::Remove {
                path: path.to_path_buf(),
            },
        )?;
        state.live.remove(path);
        Ok(true)
    }

    fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().live.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_journal() -> PathBuf {
        std::env::temp_dir()
            .join(format!("strata-index-{}", uuid::Uuid::new_v4()))
            .join("index.jsonl")
    }

    #[test]
    fn test_memory_index() {
        let index = MemoryIndex::new();
        assert!(index.put(Path::new("a")).unwrap());
        assert!(!index.put(Path::new("a")).unwrap());
        assert!(index.exists(Path::new("a")));
        assert_eq!(index.len(), 1);
        assert!(index.remove(Path::new("a")).unwrap());
        assert!(index.is_empty());
    }

    #[test]
    fn test_journal_survives_reopen() {
        let journal = temp_journal();
        {
            let index = JournalIndex::open(&journal).unwrap();
            index.put(Path::new("blocks/aa/bb/1")).unwrap();
            index.put(Path::new("bitmaps/2")).unwrap();
            index.put(Path::new("metadata/3")).unwrap();
            index.remove(Path::new("bitmaps/2")).unwrap();
        }

        let index = JournalIndex::open(&journal).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.exists(Path::new("blocks/aa/bb/1")));
        assert!(!index.exists(Path::new("bitmaps/2")));

        // Compaction leaves one record per live entry
        let text = fs::read_to_string(&journal).unwrap();
        assert_eq!(text.lines().count(), 2);

        let _ = fs::remove_dir_all(journal.parent().unwrap());
    }

    #[test]
    fn test_journal_skips_torn_tail() {
        let journal = temp_journal();
        fs::create_dir_all(journal.parent().unwrap()).unwrap();
        fs::write(
            &journal,
            "{\"op\":\"put\",\"path\":\"metadata/1\"}\n{\"op\":\"put\",\"pa",
        )
        .unwrap();

        let index = JournalIndex::open(&journal).unwrap();
        assert_eq!(index.paths(), vec![PathBuf::from("metadata/1")]);

        let _ = fs::remove_dir_all(journal.parent().unwrap());
    }
}

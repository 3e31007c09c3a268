//! Rolling history of membership transitions.
//!
//! Entries are buffered in memory and flushed by the history writer loop into one JSON file
//! per flush (`<epoch_ms>.json`). The directory is pruned oldest-first once it exceeds its
//! byte budget.

use super::error::Result;
use super::types::{NodeId, NodeState};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HistoryEntry {
    NodeStateChange {
        name: String,
        display_name: String,
        uuid: NodeId,
        old_state: NodeState,
        state: NodeState,
    },
    NodeZoneChange {
        name: String,
        display_name: String,
        uuid: NodeId,
        old_zone: String,
        zone: String,
    },
    GroupAdd {
        name: String,
        display_name: String,
        uuid: NodeId,
        group: String,
    },
    GroupRemove {
        name: String,
        display_name: String,
        uuid: NodeId,
        group: String,
    },
}

/// One flushed batch, as served by `/agent/members/history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryBatch {
    /// Epoch seconds of the flush.
    pub date: u64,
    pub entries: Vec<HistoryEntry>,
}

pub struct HistoryLog {
    directory: Option<PathBuf>,
    pending: Mutex<Vec<HistoryEntry>>,
    max_bytes: u64,
}

impl HistoryLog {
    /// A history log writing into `directory`, or a memory-only one that drops entries on
    /// flush when no directory is configured.
    pub fn new(directory: Option<PathBuf>, max_bytes: u64) -> Result<Self> {
        if let Some(dir) = &directory {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            directory,
            pending: Mutex::new(Vec::new()),
            max_bytes,
        })
    }

    pub fn add(&self, entry: HistoryEntry) {
        self.pending.lock().push(entry);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Writes the buffered entries to a new file and prunes old files.
    pub fn flush(&self) -> Result<usize> {
        let entries = std::mem::take(&mut *self.pending.lock());
        if entries.is_empty() {
            return Ok(0);
        }
        let Some(dir) = &self.directory else {
            return Ok(0);
        };

        let mut stamp = now_ms();
        let mut path = dir.join(format!("{}.json", stamp));
        while path.exists() {
            stamp += 1;
            path = dir.join(format!("{}.json", stamp));
        }

        std::fs::write(&path, serde_json::to_vec(&entries)?)?;
        tracing::debug!("Saved {} history entries to {}", entries.len(), path.display());

        self.prune(dir)?;
        Ok(entries.len())
    }

    /// Recent batches, newest first until the byte budget is spent, returned oldest first.
    pub fn read(&self) -> Result<Vec<HistoryBatch>> {
        let Some(dir) = &self.directory else {
            return Ok(Vec::new());
        };

        let mut files = history_files(dir)?;
        files.reverse();

        let mut batches = Vec::new();
        let mut size = 0u64;
        for (stamp, path, len) in files {
            let raw = std::fs::read(&path)?;
            let entries: Vec<HistoryEntry> = match serde_json::from_slice(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!("Skipping unreadable history file {}: {}", path.display(), e);
                    continue;
                }
            };
            batches.push(HistoryBatch {
                date: stamp / 1000,
                entries,
            });
            size += len;
            if size > self.max_bytes {
                break;
            }
        }

        batches.reverse();
        Ok(batches)
    }

    fn prune(&self, dir: &Path) -> Result<()> {
        let files = history_files(dir)?;
        let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();

        for (_, path, len) in files {
            if total <= self.max_bytes {
                break;
            }
            std::fs::remove_file(&path)?;
            total -= len;
        }
        Ok(())
    }
}

/// `(stamp, path, size)` of every history file, oldest first.
fn history_files(dir: &Path) -> Result<Vec<(u64, PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stamp) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        files.push((stamp, path, entry.metadata()?.len()));
    }
    files.sort_by_key(|(stamp, _, _)| *stamp);
    Ok(files)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_change(uuid: &str) -> HistoryEntry {
        HistoryEntry::NodeStateChange {
            name: uuid.to_string(),
            display_name: String::new(),
            uuid: NodeId::from(uuid),
            old_state: NodeState::Alive,
            state: NodeState::Suspect,
        }
    }

    #[test]
    fn test_flush_then_read() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(Some(dir.path().to_path_buf()), 1024 * 1024).unwrap();

        log.add(state_change("a"));
        log.add(state_change("b"));
        assert_eq!(log.flush().unwrap(), 2);
        assert_eq!(log.pending_len(), 0);

        log.add(state_change("c"));
        log.flush().unwrap();

        let batches = log.read().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].entries.len(), 2);
        assert_eq!(batches[1].entries, vec![state_change("c")]);
    }

    #[test]
    fn test_flush_without_entries_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(Some(dir.path().to_path_buf()), 1024).unwrap();

        assert_eq!(log.flush().unwrap(), 0);
        assert!(log.read().unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_directory_under_budget() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(Some(dir.path().to_path_buf()), 400).unwrap();

        for i in 0..20 {
            log.add(state_change(&format!("node-{i}")));
            log.flush().unwrap();
        }

        let files = history_files(dir.path()).unwrap();
        let total: u64 = files.iter().map(|(_, _, len)| len).sum();
        assert!(total <= 400);
        assert!(!files.is_empty());

        // the newest entry survived
        let batches = log.read().unwrap();
        let last = batches.last().unwrap();
        assert_eq!(last.entries, vec![state_change("node-19")]);
    }

    #[test]
    fn test_entry_wire_format() {
        let entry = HistoryEntry::GroupAdd {
            name: "web-1".to_string(),
            display_name: String::new(),
            uuid: NodeId::from("u1"),
            group: "linux".to_string(),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "group-add");
        assert_eq!(json["group"], "linux");
    }
}

//! Durable storage for ledger state.
//!
//! The ledger writes through a [`LedgerStore`] before mutating its in-memory
//! indices, so a failed write leaves the ledger unchanged.

use crate::checkpoint::Checkpoint;
use crate::error::{LedgerError, Result};
use crate::event::LedgerEvent;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const EVENTS_FILE: &str = "events.jsonl";
const CHECKPOINTS_FILE: &str = "checkpoints.json";

/// Everything a store hands back on startup.
#[derive(Clone, Debug, Default)]
pub struct StoredState {
    pub events: Vec<LedgerEvent>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Trait for ledger persistence backends.
pub trait LedgerStore: Send + Sync {
    /// Read back all persisted events and checkpoints.
    fn load(&self) -> Result<StoredState>;

    /// Durably record one accepted event.
    fn append_event(&mut self, event: &LedgerEvent) -> Result<()>;

    /// Replace the persisted checkpoint list.
    fn write_checkpoints(&mut self, checkpoints: &[Checkpoint]) -> Result<()>;
}

/// Store that keeps nothing; state lives only in the ledger's memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryStore;

impl LedgerStore for MemoryStore {
    fn load(&self) -> Result<StoredState> {
        Ok(StoredState::default())
    }

    fn append_event(&mut self, _event: &LedgerEvent) -> Result<()> {
        Ok(())
    }

    fn write_checkpoints(&mut self, _checkpoints: &[Checkpoint]) -> Result<()> {
        Ok(())
    }
}

/// File-backed store: an append-only JSON-lines event journal plus a
/// checkpoint file replaced atomically on every write.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    journal: File,
}

impl FileStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        Ok(FileStore { dir, journal })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_events(&self) -> Result<Vec<LedgerEvent>> {
        let file = File::open(self.dir.join(EVENTS_FILE))?;
        let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);

        let mut events = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEvent>(line) {
                Ok(event) => events.push(event),
                // A torn final line is what an interrupted append leaves behind.
                Err(err) if index == last => {
                    tracing::warn!(line = index + 1, error = %err, "ignoring truncated journal entry");
                }
                Err(err) => {
                    return Err(LedgerError::Corrupt(format!(
                        "{}:{}: {}",
                        EVENTS_FILE,
                        index + 1,
                        err
                    )))
                }
            }
        }
        Ok(events)
    }

    fn load_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let path = self.dir.join(CHECKPOINTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|err| LedgerError::Corrupt(format!("{}: {}", CHECKPOINTS_FILE, err)))
    }
}

impl LedgerStore for FileStore {
    fn load(&self) -> Result<StoredState> {
        Ok(StoredState {
            events: self.load_events()?,
            checkpoints: self.load_checkpoints()?,
        })
    }

    fn append_event(&mut self, event: &LedgerEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.journal.write_all(&line)?;
        self.journal.sync_data()?;
        Ok(())
    }

    fn write_checkpoints(&mut self, checkpoints: &[Checkpoint]) -> Result<()> {
        let tmp = self.dir.join(format!("{CHECKPOINTS_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(checkpoints)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(CHECKPOINTS_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Hlc;
    use crate::crypto::AgentKeypair;
    use crate::event::{EventEnvelope, EventPayload};
    use crate::hash::Hasher;

    fn sample_event(keypair: &AgentKeypair, n: u64) -> LedgerEvent {
        LedgerEvent::seal(
            EventEnvelope {
                parents: Vec::new(),
                hlc: Hlc::new(n, 0),
                author: keypair.agent_id(),
                payload: EventPayload::node_created(format!("n{n}"), "concept"),
            },
            keypair,
        )
        .unwrap()
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = AgentKeypair::from_secret([9u8; 32]);
        let checkpoint = Checkpoint::new(
            0,
            Hasher::hash(b"e"),
            Hasher::hash(b"s"),
            Hlc::new(2, 0),
            2,
            &keypair,
        );

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.append_event(&sample_event(&keypair, 1)).unwrap();
            store.append_event(&sample_event(&keypair, 2)).unwrap();
            store.write_checkpoints(&[checkpoint.clone()]).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.events.len(), 2);
        assert_eq!(state.checkpoints, vec![checkpoint]);
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = AgentKeypair::from_secret([9u8; 32]);
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.append_event(&sample_event(&keypair, 1)).unwrap();
        }
        let mut journal = OpenOptions::new()
            .append(true)
            .open(dir.path().join(EVENTS_FILE))
            .unwrap();
        journal.write_all(b"{\"id\": \"abc").unwrap();

        let state = FileStore::open(dir.path()).unwrap().load().unwrap();
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = AgentKeypair::from_secret([9u8; 32]);
        std::fs::create_dir_all(dir.path()).unwrap();
        let good = serde_json::to_string(&sample_event(&keypair, 1)).unwrap();
        std::fs::write(
            dir.path().join(EVENTS_FILE),
            format!("not json\n{good}\n"),
        )
        .unwrap();

        let result = FileStore::open(dir.path()).unwrap().load();
        assert!(matches!(result, Err(LedgerError::Corrupt(_))));
    }
}

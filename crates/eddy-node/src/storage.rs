//! Content-addressed message store with an append-only JSON-lines log.
//!
//! [`DedupStore`] is the relay's memory of every entry it has admitted. An
//! entry is stored at most once per [`MsgId`]: repeated admissions of the
//! same id are no-ops, which is what makes flood re-delivery idempotent.
//!
//! # Durability
//!
//! When opened over a file, every admitted entry (including its `msg_id`) is
//! appended as one JSON line. The file is never rewritten or compacted. On
//! open, existing lines are replayed to rebuild the known-id set so a
//! restarted relay does not re-flood what it already stored. A failed append
//! is logged and counted; the entry stays admitted in memory.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eddy_core::error::RelayError;
use eddy_core::types::{MessageEntry, MsgId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

type Journal = Box<dyn Write + Send>;

struct StoreInner {
    /// Known ids mapped to their position in `log`.
    index: HashMap<MsgId, usize>,
    log: Vec<MessageEntry>,
    journal: Option<Journal>,
}

/// Dedup set, in-memory log, and optional durable journal behind one lock.
pub struct DedupStore {
    inner: Mutex<StoreInner>,
    path: Option<PathBuf>,
    persistence_failures: AtomicU64,
}

impl DedupStore {
    /// A store with no durable log.
    pub fn in_memory() -> Self {
        Self::with_journal(None, None, HashMap::new(), Vec::new())
    }

    /// Open (or create) the journal at `path`, replaying any existing lines.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::Persistence(format!(
                    "failed to create directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }

        let (index, log) = if path.exists() {
            replay(path)?
        } else {
            (HashMap::new(), Vec::new())
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                RelayError::Persistence(format!("failed to open '{}': {e}", path.display()))
            })?;

        info!(path = %path.display(), replayed = log.len(), "storage: message log opened");
        Ok(Self::with_journal(
            Some(Box::new(file)),
            Some(path.to_path_buf()),
            index,
            log,
        ))
    }

    fn with_journal(
        journal: Option<Journal>,
        path: Option<PathBuf>,
        index: HashMap<MsgId, usize>,
        log: Vec<MessageEntry>,
    ) -> Self {
        Self {
            inner: Mutex::new(StoreInner { index, log, journal }),
            path,
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Deterministic id over the canonical encoding of `entry`, ignoring `msg_id`.
    pub fn compute_id(entry: &MessageEntry) -> MsgId {
        entry.compute_id()
    }

    /// Admit `entry` unless its id is already known.
    ///
    /// The id is the one the entry carries, or the computed one for a fresh
    /// entry. Returns `None` without storing or logging anything for a
    /// duplicate; otherwise records the id, appends to the in-memory log and
    /// the journal, and returns the id.
    pub fn admit(&self, mut entry: MessageEntry) -> Option<MsgId> {
        let id = entry.id();
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&id) {
            debug!(msg_id = %id, "storage: duplicate entry ignored");
            return None;
        }
        let position = inner.log.len();
        inner.index.insert(id, position);
        entry.msg_id = Some(id);

        if let Some(journal) = inner.journal.as_mut() {
            let mut line = entry.to_json();
            line.push('\n');
            if let Err(e) = journal
                .write_all(line.as_bytes())
                .and_then(|()| journal.flush())
            {
                let failures = self.persistence_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(msg_id = %id, error = %e, failures, "storage: durable append failed");
            }
        }

        inner.log.push(entry);
        debug!(msg_id = %id, stored = inner.log.len(), "storage: entry admitted");
        Some(id)
    }

    pub fn contains(&self, id: &MsgId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// Look up a stored entry by id.
    pub fn get(&self, id: &MsgId) -> Option<MessageEntry> {
        let inner = self.inner.lock();
        let position = *inner.index.get(id)?;
        inner.log.get(position).cloned()
    }

    /// Snapshot of the in-memory log in admission order.
    pub fn entries(&self) -> Vec<MessageEntry> {
        self.inner.lock().log.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().log.is_empty()
    }

    /// Number of journal appends that failed since the store was opened.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Path of the durable journal, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Rebuild the id index and log from an existing journal.
fn replay(path: &Path) -> Result<(HashMap<MsgId, usize>, Vec<MessageEntry>), RelayError> {
    let file = File::open(path)
        .map_err(|e| RelayError::Persistence(format!("failed to read '{}': {e}", path.display())))?;
    let mut index = HashMap::new();
    let mut log = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| {
            RelayError::Persistence(format!("failed to read '{}': {e}", path.display()))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match MessageEntry::from_json(&line) {
            Ok(mut entry) => {
                let id = entry.id();
                if !index.contains_key(&id) {
                    index.insert(id, log.len());
                    entry.msg_id = Some(id);
                    log.push(entry);
                }
            }
            Err(e) => {
                warn!(path = %path.display(), line = lineno + 1, error = %e,
                    "storage: skipping malformed log line");
            }
        }
    }
    Ok((index, log))
}

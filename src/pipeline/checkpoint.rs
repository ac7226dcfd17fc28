//! Durable record of committed chapters.
//!
//! A checkpoint is written as one document on every commit, through a
//! temporary file and a rename, so readers only ever see the previous or the
//! next complete record. Loading validates internal consistency and refuses
//! to repair anything.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::pipeline::cache::CommittedResultCache;
use crate::pipeline::fingerprint::ChapterFingerprint;
use crate::pipeline::state::NarrativeSnapshot;

pub const CHECKPOINT_FORMAT: &str = "epub-bilingual.checkpoint.v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub ordinal: u32,
    pub fingerprint: ChapterFingerprint,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format: String,
    pub book_id: String,
    pub last_committed_ordinal: u32,
    pub snapshot_version: u64,
    /// One record per commit, in commit order.
    pub committed: Vec<CommitRecord>,
    pub cache: CommittedResultCache,
    /// Snapshot after the last commit; kept for inspection and replay verification.
    pub snapshot: NarrativeSnapshot,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn empty(book_id: impl Into<String>) -> Self {
        Self {
            format: CHECKPOINT_FORMAT.to_string(),
            book_id: book_id.into(),
            last_committed_ordinal: 0,
            snapshot_version: 0,
            committed: Vec::new(),
            cache: CommittedResultCache::new(),
            snapshot: NarrativeSnapshot::default(),
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn committed_fingerprints(&self) -> BTreeSet<&ChapterFingerprint> {
        self.committed.iter().map(|r| &r.fingerprint).collect()
    }

    /// The checkpoint that results from committing `record` with `snapshot`.
    ///
    /// Records at or after `record.ordinal` belong to a diverged earlier run and are dropped.
    #[must_use]
    pub fn advanced(
        &self,
        record: CommitRecord,
        cache: CommittedResultCache,
        snapshot: &NarrativeSnapshot,
    ) -> Self {
        let mut next = self.clone();
        next.committed
            .truncate(record.ordinal.saturating_sub(1) as usize);
        next.last_committed_ordinal = record.ordinal;
        next.snapshot_version = snapshot.version;
        next.committed.push(record);
        next.cache = cache;
        next.snapshot = snapshot.clone();
        next.updated_at = Utc::now();
        next
    }

    /// Internal consistency; `Err` carries the reason text.
    pub fn verify(&self) -> Result<(), String> {
        if self.format != CHECKPOINT_FORMAT {
            return Err(format!("unknown format {:?}", self.format));
        }
        if self.snapshot_version != self.committed.len() as u64 {
            return Err(format!(
                "snapshot version {} does not match {} committed chapters",
                self.snapshot_version,
                self.committed.len()
            ));
        }
        if self.snapshot.version != self.snapshot_version {
            return Err(format!(
                "stored snapshot has version {}, header says {}",
                self.snapshot.version, self.snapshot_version
            ));
        }
        for (i, rec) in self.committed.iter().enumerate() {
            let expected = i as u32 + 1;
            if rec.ordinal != expected {
                return Err(format!(
                    "commit #{expected} records ordinal {}",
                    rec.ordinal
                ));
            }
            if !self.cache.contains(&rec.fingerprint) {
                return Err(format!(
                    "chapter {} fingerprint {} has no cached result",
                    rec.ordinal,
                    rec.fingerprint.short()
                ));
            }
        }
        let last = self.committed.last().map(|r| r.ordinal).unwrap_or(0);
        if last != self.last_committed_ordinal {
            return Err(format!(
                "last committed ordinal {} but records end at {last}",
                self.last_committed_ordinal
            ));
        }
        Ok(())
    }
}

/// Where checkpoints live between runs.
pub trait CheckpointStore: Send + Sync {
    /// Where the checkpoint lives, for error reports.
    fn location(&self) -> PathBuf;
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;
    /// Must replace the previous checkpoint atomically.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn location(&self) -> PathBuf {
        self.path.clone()
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let cp: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        cp.verify().map_err(|reason| CheckpointError::Corrupt {
            path: self.path.clone(),
            reason,
        })?;
        Ok(Some(cp))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).map_err(|e| self.io_err(e))?;
        f.write_all(&bytes).map_err(|e| self.io_err(e))?;
        f.sync_all().map_err(|e| self.io_err(e))?;
        drop(f);
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

/// Keeps every saved checkpoint in memory; for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    saves: Mutex<Vec<Checkpoint>>,
    fail_next: Mutex<bool>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            saves: Mutex::new(vec![checkpoint]),
            fail_next: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn saves(&self) -> Vec<Checkpoint> {
        self.saves.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn latest(&self) -> Option<Checkpoint> {
        self.saves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Makes the next `save` fail with an IO error.
    pub fn fail_next_save(&self) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.latest())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut fail = self.fail_next.lock().unwrap_or_else(PoisonError::into_inner);
        if *fail {
            *fail = false;
            return Err(CheckpointError::Io {
                path: self.location(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
            });
        }
        self.saves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Checkpoint, CheckpointStore, CommitRecord, FileCheckpointStore};
    use crate::error::CheckpointError;
    use crate::ir::{Block, BlockKind, Chapter, ChapterKind};
    use crate::pipeline::cache::{CachedChapter, CommittedResultCache};
    use crate::pipeline::fingerprint::ChapterFingerprint;
    use crate::pipeline::state::{NarrativeDelta, NarrativeSnapshot};

    fn one_commit() -> Checkpoint {
        let chapter = Chapter {
            ordinal: 1,
            kind: ChapterKind::Narrative,
            title: None,
            blocks: vec![Block::new(0, BlockKind::Paragraph, "It was cold.")],
        };
        let fp = ChapterFingerprint::compute(&chapter, &NarrativeSnapshot::default(), "svc");
        let mut cache = CommittedResultCache::new();
        cache.insert(
            fp.clone(),
            CachedChapter {
                ordinal: 1,
                targets: vec!["Trời lạnh.".to_string()],
                delta: NarrativeDelta::default(),
            },
        );
        let snapshot = NarrativeSnapshot {
            version: 1,
            last_ordinal: 1,
            ..NarrativeSnapshot::default()
        };
        Checkpoint::empty("book").advanced(
            CommitRecord {
                ordinal: 1,
                fingerprint: fp,
            },
            cache,
            &snapshot,
        )
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path().join("state").join("checkpoint.json"));
        assert!(store.load().expect("load missing").is_none());

        let cp = one_commit();
        store.save(&cp).expect("save");
        let loaded = store.load().expect("load").expect("present");
        assert_eq!(loaded, cp);
        assert_eq!(loaded.committed_fingerprints().len(), 1);
        assert!(!dir.path().join("state").join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, b"{ not json").expect("write");
        let err = FileCheckpointStore::new(path).load().expect_err("corrupt");
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[test]
    fn inconsistent_records_are_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let mut cp = one_commit();
        cp.snapshot_version = 2;
        std::fs::write(&path, serde_json::to_vec(&cp).expect("encode")).expect("write");
        let err = FileCheckpointStore::new(path.clone()).load().expect_err("version");
        assert!(err.to_string().contains("does not match"));

        let mut cp = one_commit();
        cp.cache = CommittedResultCache::new();
        std::fs::write(&path, serde_json::to_vec(&cp).expect("encode")).expect("write");
        let err = FileCheckpointStore::new(path).load().expect_err("cache");
        assert!(err.to_string().contains("no cached result"));
    }
}

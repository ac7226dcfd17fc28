use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::characters::{CharacterContext, CharacterMergeEvent, CharacterProposal};
use crate::error::ConflictError;
use crate::terminology::{Glossary, TermApplyEvent, TermProposal};
use crate::textutil::truncate_chars;

/// Immutable view of the narrative state after `version` commits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeSnapshot {
    pub version: u64,
    /// Ordinal of the last chapter whose commit produced this snapshot.
    #[serde(default)]
    pub last_ordinal: u32,
    pub glossary: Glossary,
    pub characters: CharacterContext,
    pub summary: String,
    /// Hex SHA-256 chained over every commit since the empty state; `""` for the empty state.
    #[serde(default)]
    pub digest: String,
}

/// What one chapter contributes to the narrative state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeDelta {
    #[serde(default)]
    pub glossary_additions: Vec<TermProposal>,
    #[serde(default)]
    pub character_updates: Vec<CharacterProposal>,
    /// Replacement summary; `None` keeps the current one.
    #[serde(default)]
    pub summary: Option<String>,
}

/// A delta bound to the snapshot version it was computed against.
///
/// Only [`NarrativeStateStore::stage`] creates one, so every commit has passed the version check.
#[derive(Debug)]
pub struct StagedUpdate {
    chapter_ordinal: u32,
    base_version: u64,
    delta: NarrativeDelta,
}

impl StagedUpdate {
    #[must_use]
    pub fn chapter_ordinal(&self) -> u32 {
        self.chapter_ordinal
    }

    #[must_use]
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    #[must_use]
    pub fn delta(&self) -> &NarrativeDelta {
        &self.delta
    }
}

#[derive(Debug)]
pub struct CommitReport {
    pub snapshot: Arc<NarrativeSnapshot>,
    pub glossary_events: Vec<TermApplyEvent>,
    pub character_events: Vec<CharacterMergeEvent>,
}

impl NarrativeSnapshot {
    /// Pure successor computation; the store publishes the result.
    fn successor(
        &self,
        ordinal: u32,
        delta: &NarrativeDelta,
        summary_max_chars: usize,
    ) -> (NarrativeSnapshot, Vec<TermApplyEvent>, Vec<CharacterMergeEvent>) {
        let mut next = self.clone();
        let glossary_events = next
            .glossary
            .apply_additions(delta.glossary_additions.iter().cloned(), ordinal);
        let character_events = next
            .characters
            .merge(delta.character_updates.iter().cloned(), ordinal);
        if let Some(summary) = delta.summary.as_deref() {
            next.summary = truncate_chars(summary.trim(), summary_max_chars).to_string();
        }
        next.version = self.version + 1;
        next.last_ordinal = ordinal;
        next.digest = chain_digest(&self.digest, &next);
        (next, glossary_events, character_events)
    }
}

/// Digest of `next` given its predecessor's digest. Covers the full committed content,
/// so two lineages that reach the same version with different state never share a digest.
fn chain_digest(previous: &str, next: &NarrativeSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"NS1\n");
    update_field(&mut hasher, b"P:", previous.as_bytes());
    hasher.update(b"V:");
    hasher.update(next.version.to_le_bytes());
    hasher.update(b"O:");
    hasher.update(next.last_ordinal.to_le_bytes());
    // BTreeMap-backed, so the JSON is canonical.
    let glossary = serde_json::to_vec(&next.glossary).unwrap_or_default();
    let characters = serde_json::to_vec(&next.characters).unwrap_or_default();
    update_field(&mut hasher, b"G:", &glossary);
    update_field(&mut hasher, b"C:", &characters);
    update_field(&mut hasher, b"S:", next.summary.as_bytes());
    hex::encode(hasher.finalize())
}

fn update_field(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update(tag);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

/// Holder of the current snapshot. Commit is the only mutation.
pub struct NarrativeStateStore {
    current: RwLock<Arc<NarrativeSnapshot>>,
    summary_max_chars: usize,
}

impl NarrativeStateStore {
    #[must_use]
    pub fn new(summary_max_chars: usize) -> Self {
        Self::from_snapshot(NarrativeSnapshot::default(), summary_max_chars)
    }

    #[must_use]
    pub fn from_snapshot(snapshot: NarrativeSnapshot, summary_max_chars: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            summary_max_chars,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<NarrativeSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    #[must_use]
    pub fn summary_max_chars(&self) -> usize {
        self.summary_max_chars
    }

    pub fn stage(
        &self,
        chapter_ordinal: u32,
        version_used: u64,
        delta: NarrativeDelta,
    ) -> Result<StagedUpdate, ConflictError> {
        let current = self.version();
        if current != version_used {
            return Err(ConflictError {
                used: version_used,
                current,
            });
        }
        Ok(StagedUpdate {
            chapter_ordinal,
            base_version: version_used,
            delta,
        })
    }

    pub fn commit(&self, staged: StagedUpdate) -> Result<CommitReport, ConflictError> {
        self.commit_with(staged, |_| Ok::<(), ConflictError>(()))
    }

    /// Publishes `staged` only after `durable` accepted the successor snapshot.
    ///
    /// The write lock is held across `durable`, so a failing hook leaves the
    /// store exactly as it was.
    pub fn commit_with<E, F>(&self, staged: StagedUpdate, durable: F) -> Result<CommitReport, E>
    where
        E: From<ConflictError>,
        F: FnOnce(&NarrativeSnapshot) -> Result<(), E>,
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if guard.version != staged.base_version {
            return Err(ConflictError {
                used: staged.base_version,
                current: guard.version,
            }
            .into());
        }
        let (next, glossary_events, character_events) =
            guard.successor(staged.chapter_ordinal, &staged.delta, self.summary_max_chars);
        durable(&next)?;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        Ok(CommitReport {
            snapshot: next,
            glossary_events,
            character_events,
        })
    }

    pub fn discard(&self, staged: StagedUpdate) {
        drop(staged);
    }
}

#[cfg(test)]
mod tests {
    use super::{NarrativeDelta, NarrativeStateStore};
    use crate::characters::CharacterProposal;
    use crate::error::ConflictError;
    use crate::terminology::TermProposal;

    fn delta(term: (&str, &str), summary: &str) -> NarrativeDelta {
        NarrativeDelta {
            glossary_additions: vec![TermProposal::new(term.0, term.1)],
            character_updates: vec![CharacterProposal::new("Winston", "anh")],
            summary: Some(summary.to_string()),
        }
    }

    #[test]
    fn stage_rejects_stale_version() {
        let store = NarrativeStateStore::new(100);
        let staged = store
            .stage(1, 0, delta(("telescreen", "màn hình"), "one"))
            .expect("stage");
        let report = store.commit(staged).expect("commit");
        assert_eq!(report.snapshot.version, 1);
        assert_eq!(report.snapshot.last_ordinal, 1);

        let err = store
            .stage(2, 0, NarrativeDelta::default())
            .expect_err("stale");
        assert_eq!(err, ConflictError { used: 0, current: 1 });
    }

    #[test]
    fn commit_rechecks_version() {
        let store = NarrativeStateStore::new(100);
        let a = store.stage(1, 0, NarrativeDelta::default()).expect("stage a");
        let b = store.stage(2, 0, NarrativeDelta::default()).expect("stage b");
        store.commit(a).expect("commit a");
        assert!(store.commit(b).is_err());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn old_snapshots_stay_untouched() {
        let store = NarrativeStateStore::new(100);
        let before = store.snapshot();
        let staged = store
            .stage(1, 0, delta(("Party", "Đảng"), "summary"))
            .expect("stage");
        store.commit(staged).expect("commit");
        assert!(before.glossary.is_empty());
        assert_eq!(before.summary, "");
        assert_eq!(store.snapshot().glossary.len(), 1);
    }

    #[test]
    fn discard_and_failed_hook_leave_no_trace() {
        let store = NarrativeStateStore::new(100);
        let staged = store
            .stage(1, 0, delta(("Party", "Đảng"), "x"))
            .expect("stage");
        store.discard(staged);
        assert_eq!(store.version(), 0);

        let staged = store
            .stage(1, 0, delta(("Party", "Đảng"), "x"))
            .expect("stage");
        let res: Result<_, anyhow::Error> =
            store.commit_with(staged, |_| Err(anyhow::anyhow!("disk full")));
        assert!(res.is_err());
        assert_eq!(store.version(), 0);
        assert!(store.snapshot().glossary.is_empty());
    }

    #[test]
    fn digest_tracks_content_not_just_version() {
        let narrative = NarrativeStateStore::new(100);
        let staged = narrative
            .stage(1, 0, delta(("telescreen", "màn hình điện toán"), "one"))
            .expect("stage");
        narrative.commit(staged).expect("commit");

        let front = NarrativeStateStore::new(100);
        let staged = front.stage(1, 0, NarrativeDelta::default()).expect("stage");
        front.commit(staged).expect("commit");

        let (a, b) = (narrative.snapshot(), front.snapshot());
        assert_eq!(a.version, b.version);
        assert_eq!(a.digest.len(), 64);
        assert_ne!(a.digest, b.digest);

        let again = NarrativeStateStore::new(100);
        let staged = again
            .stage(1, 0, delta(("telescreen", "màn hình điện toán"), "one"))
            .expect("stage");
        again.commit(staged).expect("commit");
        assert_eq!(again.snapshot().digest, a.digest);
    }

    #[test]
    fn summary_is_replaced_and_bounded() {
        let store = NarrativeStateStore::new(5);
        let staged = store
            .stage(1, 0, delta(("a", "b"), "first summary"))
            .expect("stage");
        store.commit(staged).expect("commit");
        assert_eq!(store.snapshot().summary, "first");

        let keep = NarrativeDelta::default();
        let staged = store.stage(2, 1, keep).expect("stage");
        store.commit(staged).expect("commit");
        let snap = store.snapshot();
        assert_eq!(snap.summary, "first");
        assert_eq!(snap.version, 2);
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pipeline::fingerprint::ChapterFingerprint;
use crate::pipeline::state::{NarrativeDelta, NarrativeSnapshot};

/// Final output of one committed chapter attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedChapter {
    pub ordinal: u32,
    /// Edited Vietnamese text, one entry per source block.
    pub targets: Vec<String>,
    pub delta: NarrativeDelta,
}

/// Fingerprint-keyed committed results. Entries are never replaced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommittedResultCache {
    entries: BTreeMap<ChapterFingerprint, CachedChapter>,
}

impl CommittedResultCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, fingerprint: &ChapterFingerprint) -> Option<&CachedChapter> {
        self.entries.get(fingerprint)
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &ChapterFingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Returns `false` and keeps the existing entry when the fingerprint is already cached.
    pub fn insert(&mut self, fingerprint: ChapterFingerprint, entry: CachedChapter) -> bool {
        if self.entries.contains_key(&fingerprint) {
            return false;
        }
        self.entries.insert(fingerprint, entry);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{CachedChapter, CommittedResultCache};
    use crate::ir::{Block, BlockKind, Chapter, ChapterKind};
    use crate::pipeline::fingerprint::ChapterFingerprint;
    use crate::pipeline::state::{NarrativeDelta, NarrativeSnapshot};

    #[test]
    fn entries_are_immutable() {
        let chapter = Chapter {
            ordinal: 1,
            kind: ChapterKind::Narrative,
            title: None,
            blocks: vec![Block::new(0, BlockKind::Paragraph, "Hello there.")],
        };
        let fp = ChapterFingerprint::compute(&chapter, &NarrativeSnapshot::default(), "svc");
        let mut cache = CommittedResultCache::new();
        let first = CachedChapter {
            ordinal: 1,
            targets: vec!["Xin chào.".to_string()],
            delta: NarrativeDelta::default(),
        };
        assert!(cache.insert(fp.clone(), first.clone()));
        let second = CachedChapter {
            targets: vec!["Chào bạn.".to_string()],
            ..first.clone()
        };
        assert!(!cache.insert(fp.clone(), second));
        assert_eq!(cache.get(&fp), Some(&first));
        assert_eq!(cache.len(), 1);
    }
}

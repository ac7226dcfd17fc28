use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ir::Chapter;
use crate::pipeline::state::NarrativeSnapshot;

/// Content address of {source blocks, basis snapshot (version and digest), service configuration}.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChapterFingerprint(String);

impl ChapterFingerprint {
    /// Every field is length-prefixed so distinct inputs cannot collide by concatenation.
    #[must_use]
    pub fn compute(chapter: &Chapter, basis: &NarrativeSnapshot, service_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"FP2\n");
        update_field(&mut hasher, b"S:", service_id.as_bytes());
        hasher.update(b"V:");
        hasher.update(basis.version.to_le_bytes());
        update_field(&mut hasher, b"D:", basis.digest.as_bytes());
        update_field(&mut hasher, b"K:", chapter.kind.as_str().as_bytes());
        hasher.update(b"N:");
        hasher.update((chapter.blocks.len() as u64).to_le_bytes());
        for b in &chapter.blocks {
            hasher.update(b"B:");
            hasher.update((b.index as u64).to_le_bytes());
            update_field(&mut hasher, b"|", b.kind.tag().as_bytes());
            update_field(&mut hasher, b"|", b.source.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

fn update_field(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update(tag);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

impl fmt::Display for ChapterFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::ChapterFingerprint;
    use crate::ir::{Block, BlockKind, Chapter, ChapterKind};
    use crate::pipeline::state::NarrativeSnapshot;

    fn chapter(texts: &[&str]) -> Chapter {
        Chapter {
            ordinal: 1,
            kind: ChapterKind::Narrative,
            title: None,
            blocks: texts
                .iter()
                .enumerate()
                .map(|(i, t)| Block::new(i, BlockKind::Paragraph, *t))
                .collect(),
        }
    }

    fn at(version: u64, digest: &str) -> NarrativeSnapshot {
        NarrativeSnapshot {
            version,
            digest: digest.to_string(),
            ..NarrativeSnapshot::default()
        }
    }

    #[test]
    fn stable_for_identical_inputs() {
        let a = ChapterFingerprint::compute(&chapter(&["x", "y"]), &at(3, "d"), "svc");
        let b = ChapterFingerprint::compute(&chapter(&["x", "y"]), &at(3, "d"), "svc");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn sensitive_to_every_component() {
        let basis = at(3, "d");
        let base = ChapterFingerprint::compute(&chapter(&["x", "y"]), &basis, "svc");
        assert_ne!(base, ChapterFingerprint::compute(&chapter(&["x", "y"]), &at(4, "d"), "svc"));
        assert_ne!(base, ChapterFingerprint::compute(&chapter(&["x", "y"]), &at(3, "e"), "svc"));
        assert_ne!(base, ChapterFingerprint::compute(&chapter(&["x", "y"]), &basis, "svc2"));
        assert_ne!(base, ChapterFingerprint::compute(&chapter(&["xy"]), &basis, "svc"));
        assert_ne!(base, ChapterFingerprint::compute(&chapter(&["x", "y "]), &basis, "svc"));
        let mut front = chapter(&["x", "y"]);
        front.kind = ChapterKind::FrontMatter;
        assert_ne!(base, ChapterFingerprint::compute(&front, &basis, "svc"));
    }
}

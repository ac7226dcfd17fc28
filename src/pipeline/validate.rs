use crate::error::{MismatchError, MismatchReason, StaleDraft, ValidationStage};
use crate::ir::{Block, BlockKind, Chapter};
use crate::pipeline::invoker::DraftBlock;
use crate::pipeline::state::NarrativeSnapshot;
use crate::sentinels::ANY_MARKER_RE;

/// Prompt scaffolding that must never survive into block text.
const LEAK_LABELS: [&str; 4] = ["ORIGINAL:", "DRAFT:", "EDITED:", "INPUT:"];

/// Anything the validator can compare positionally.
pub trait AlignedBlock {
    fn position(&self) -> usize;
    fn kind(&self) -> BlockKind;
    fn text(&self) -> &str;
}

impl AlignedBlock for Block {
    fn position(&self) -> usize {
        self.index
    }
    fn kind(&self) -> BlockKind {
        self.kind
    }
    fn text(&self) -> &str {
        &self.source
    }
}

impl AlignedBlock for DraftBlock {
    fn position(&self) -> usize {
        self.index
    }
    fn kind(&self) -> BlockKind {
        self.kind
    }
    fn text(&self) -> &str {
        &self.text
    }
}

/// Checks count, order, kind, emptiness and leaked scaffolding, in that order of precedence
/// per position. Count is reported after all shared positions agree.
pub fn validate_alignment<S, C>(
    stage: ValidationStage,
    source: &[S],
    candidate: &[C],
) -> Result<(), MismatchError>
where
    S: AlignedBlock,
    C: AlignedBlock,
{
    let fail = |index: Option<usize>, reason: MismatchReason| MismatchError {
        stage,
        expected_count: source.len(),
        actual_count: candidate.len(),
        first_diverging_index: index,
        reason,
    };

    for (i, (s, c)) in source.iter().zip(candidate).enumerate() {
        if c.position() != s.position() {
            return Err(fail(Some(i), MismatchReason::Order { found: c.position() }));
        }
        if c.kind() != s.kind() {
            return Err(fail(
                Some(i),
                MismatchReason::Kind {
                    expected: s.kind(),
                    found: c.kind(),
                },
            ));
        }
        if !s.text().trim().is_empty() && c.text().trim().is_empty() {
            return Err(fail(Some(i), MismatchReason::Emptied));
        }
        if let Some(marker) = leaked_marker(s.text(), c.text()) {
            return Err(fail(Some(i), MismatchReason::Contaminated { marker }));
        }
    }
    if source.len() != candidate.len() {
        let at = source.len().min(candidate.len());
        return Err(fail(Some(at), MismatchReason::Count));
    }
    Ok(())
}

fn leaked_marker(source: &str, candidate: &str) -> Option<String> {
    if let Some(m) = ANY_MARKER_RE.find(candidate) {
        return Some(m.as_str().to_string());
    }
    LEAK_LABELS
        .iter()
        .find(|l| candidate.contains(*l) && !source.contains(*l))
        .map(|l| l.to_string())
}

/// After a snapshot conflict: does `current` carry entries that the draft made against
/// `basis` could not have seen but this chapter uses?
pub fn check_snapshot_currency(
    chapter: &Chapter,
    basis: &NarrativeSnapshot,
    current: &NarrativeSnapshot,
) -> Result<(), StaleDraft> {
    if basis.version == current.version || !chapter.kind.is_narrative() {
        return Ok(());
    }
    let text = chapter.source_text();
    let mut terms: Vec<String> = current
        .glossary
        .introduced_after(basis.last_ordinal, &text)
        .into_iter()
        .map(|e| e.source.clone())
        .collect();
    terms.extend(
        current
            .characters
            .changed_after(basis.last_ordinal, &text)
            .into_iter()
            .map(|c| c.name.clone()),
    );
    if terms.is_empty() {
        Ok(())
    } else {
        Err(StaleDraft { terms })
    }
}

use crate::characters::CharacterProposal;
use crate::error::InvokeError;
use crate::ir::{BlockKind, Chapter};
use crate::pipeline::state::NarrativeSnapshot;
use crate::terminology::TermProposal;

/// Candidate target text for one source block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DraftBlock {
    pub index: usize,
    pub kind: BlockKind,
    pub text: String,
}

impl DraftBlock {
    #[must_use]
    pub fn new(index: usize, kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            text: text.into(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TranslateRequest<'a> {
    pub chapter: &'a Chapter,
    pub snapshot: &'a NarrativeSnapshot,
    /// Rejection detail from the previous attempt, if any.
    pub feedback: Option<&'a str>,
    /// The previous attempt was refused on content-policy grounds.
    pub after_policy_rejection: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranslationDraft {
    pub blocks: Vec<DraftBlock>,
    pub glossary_additions: Vec<TermProposal>,
    pub character_updates: Vec<CharacterProposal>,
}

#[derive(Clone, Copy, Debug)]
pub struct EditRequest<'a> {
    pub chapter: &'a Chapter,
    pub draft: &'a [DraftBlock],
    pub snapshot: &'a NarrativeSnapshot,
    /// This chapter's proposals from the translation draft, not yet committed.
    pub glossary_additions: &'a [TermProposal],
    pub character_updates: &'a [CharacterProposal],
}

#[derive(Clone, Copy, Debug)]
pub struct SummaryRequest<'a> {
    pub chapter: &'a Chapter,
    pub previous: &'a str,
    pub max_chars: usize,
}

/// Stateless translation call. Must return one draft block per source block.
pub trait TranslationInvoker: Send + Sync {
    fn translate(&self, req: &TranslateRequest<'_>) -> Result<TranslationDraft, InvokeError>;
}

/// Stateless editing pass over a validated draft. Must preserve the block count.
pub trait EditorInvoker: Send + Sync {
    fn edit(&self, req: &EditRequest<'_>) -> Result<Vec<DraftBlock>, InvokeError>;
}

/// Produces the replacement story summary for a narrative chapter.
pub trait SummaryInvoker: Send + Sync {
    fn summarize(&self, req: &SummaryRequest<'_>) -> Result<String, InvokeError>;
}

/// The collaborators one chapter transaction needs, plus the identity of their configuration.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub translator: &'a dyn TranslationInvoker,
    pub editor: &'a dyn EditorInvoker,
    pub summarizer: &'a dyn SummaryInvoker,
    pub service_id: &'a str,
}

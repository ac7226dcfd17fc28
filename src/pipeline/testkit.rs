//! Scripted fakes for the transaction and book pipeline tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::characters::CharacterProposal;
use crate::error::InvokeError;
use crate::ir::{Block, BlockKind, Chapter, ChapterKind};
use crate::pipeline::invoker::{
    DraftBlock, EditRequest, EditorInvoker, Services, SummaryInvoker, SummaryRequest,
    TranslateRequest, TranslationDraft, TranslationInvoker,
};
use crate::terminology::TermProposal;

pub const TEST_SERVICE_ID: &str = "test-service";

pub fn chapter(ordinal: u32, texts: &[&str]) -> Chapter {
    Chapter {
        ordinal,
        kind: ChapterKind::Narrative,
        title: None,
        blocks: texts
            .iter()
            .enumerate()
            .map(|(i, t)| Block::new(i, BlockKind::Paragraph, *t))
            .collect(),
    }
}

pub fn front_matter(ordinal: u32, texts: &[&str]) -> Chapter {
    Chapter {
        kind: ChapterKind::FrontMatter,
        ..chapter(ordinal, texts)
    }
}

#[derive(Clone, Debug)]
pub enum Step {
    DropLastBlock,
    Fail(InvokeError),
    /// Sleep, then answer normally.
    Stall(Duration),
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Renders `vi:<source>` with known glossary terms substituted. Steps are consumed per call,
/// chapter-specific queues first.
#[derive(Default)]
pub struct ScriptedTranslator {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Step>>,
    chapter_scripts: Mutex<BTreeMap<u32, VecDeque<Step>>>,
    terms: Mutex<BTreeMap<u32, Vec<TermProposal>>>,
    characters: Mutex<BTreeMap<u32, Vec<CharacterProposal>>>,
    feedback: Mutex<Vec<Option<String>>>,
    policy_flags: Mutex<Vec<bool>>,
    glossary_seen: Mutex<Vec<(u32, Vec<String>)>>,
    versions_seen: Mutex<Vec<(u32, u64)>>,
}

impl ScriptedTranslator {
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        lock(&self.script).extend(steps);
    }

    pub fn script_chapter(&self, ordinal: u32, steps: impl IntoIterator<Item = Step>) {
        lock(&self.chapter_scripts)
            .entry(ordinal)
            .or_default()
            .extend(steps);
    }

    pub fn propose_term(&self, ordinal: u32, source: &str, target: &str) {
        lock(&self.terms)
            .entry(ordinal)
            .or_default()
            .push(TermProposal::new(source, target));
    }

    pub fn propose_character(&self, ordinal: u32, proposal: CharacterProposal) {
        lock(&self.characters)
            .entry(ordinal)
            .or_default()
            .push(proposal);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn feedback_seen(&self) -> Vec<Option<String>> {
        lock(&self.feedback).clone()
    }

    pub fn policy_flags(&self) -> Vec<bool> {
        lock(&self.policy_flags).clone()
    }

    /// `(ordinal, glossary sources visible in the snapshot)` per call.
    pub fn glossary_seen(&self) -> Vec<(u32, Vec<String>)> {
        lock(&self.glossary_seen).clone()
    }

    pub fn versions_seen(&self) -> Vec<(u32, u64)> {
        lock(&self.versions_seen).clone()
    }

    fn next_step(&self, ordinal: u32) -> Option<Step> {
        if let Some(step) = lock(&self.chapter_scripts)
            .get_mut(&ordinal)
            .and_then(VecDeque::pop_front)
        {
            return Some(step);
        }
        lock(&self.script).pop_front()
    }
}

impl TranslationInvoker for ScriptedTranslator {
    fn translate(&self, req: &TranslateRequest<'_>) -> Result<TranslationDraft, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ordinal = req.chapter.ordinal;
        lock(&self.feedback).push(req.feedback.map(str::to_string));
        lock(&self.policy_flags).push(req.after_policy_rejection);
        lock(&self.glossary_seen).push((
            ordinal,
            req.snapshot.glossary.entries().map(|e| e.source.clone()).collect(),
        ));
        lock(&self.versions_seen).push((ordinal, req.snapshot.version));

        let drop_last = match self.next_step(ordinal) {
            Some(Step::Fail(e)) => return Err(e),
            Some(Step::DropLastBlock) => true,
            Some(Step::Stall(d)) => {
                std::thread::sleep(d);
                false
            }
            None => false,
        };
        let mut blocks: Vec<DraftBlock> = req
            .chapter
            .blocks
            .iter()
            .map(|b| {
                let mut text = format!("vi:{}", b.source);
                for entry in req.snapshot.glossary.entries() {
                    text = text.replace(&entry.source, &entry.target);
                }
                DraftBlock::new(b.index, b.kind, text)
            })
            .collect();
        if drop_last {
            blocks.pop();
        }
        Ok(TranslationDraft {
            blocks,
            glossary_additions: lock(&self.terms).get(&ordinal).cloned().unwrap_or_default(),
            character_updates: lock(&self.characters)
                .get(&ordinal)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Returns the draft unchanged unless a step is queued.
#[derive(Default)]
pub struct EchoEditor {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Step>>,
}

impl EchoEditor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        lock(&self.script).extend(steps);
    }
}

impl EditorInvoker for EchoEditor {
    fn edit(&self, req: &EditRequest<'_>) -> Result<Vec<DraftBlock>, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut edited = req.draft.to_vec();
        match lock(&self.script).pop_front() {
            Some(Step::Fail(e)) => return Err(e),
            Some(Step::DropLastBlock) => {
                edited.pop();
            }
            Some(Step::Stall(d)) => std::thread::sleep(d),
            None => {}
        }
        Ok(edited)
    }
}

/// Appends one line per chapter to the previous summary.
#[derive(Default)]
pub struct LineSummarizer {
    calls: AtomicUsize,
}

impl LineSummarizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SummaryInvoker for LineSummarizer {
    fn summarize(&self, req: &SummaryRequest<'_>) -> Result<String, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let line = format!("ch{}: {} blocks", req.chapter.ordinal, req.chapter.blocks.len());
        if req.previous.is_empty() {
            Ok(line)
        } else {
            Ok(format!("{}\n{line}", req.previous))
        }
    }
}

#[derive(Default)]
pub struct Kit {
    pub translator: ScriptedTranslator,
    pub editor: EchoEditor,
    pub summarizer: LineSummarizer,
}

impl Kit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> Services<'_> {
        Services {
            translator: &self.translator,
            editor: &self.editor,
            summarizer: &self.summarizer,
            service_id: TEST_SERVICE_ID,
        }
    }

    pub fn total_calls(&self) -> usize {
        self.translator.calls() + self.editor.calls() + self.summarizer.calls()
    }
}

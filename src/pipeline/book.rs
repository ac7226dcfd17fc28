//! Book pipeline: commits chapters in strict ordinal order, optionally
//! preparing later chapters speculatively on worker threads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::ScopedJoinHandle;

use tracing::{error, info, warn};

use crate::error::{CheckpointError, FailureReason};
use crate::ir::Book;
use crate::pipeline::checkpoint::{Checkpoint, CheckpointStore};
use crate::pipeline::invoker::Services;
use crate::pipeline::memory::StateExport;
use crate::pipeline::state::{NarrativeSnapshot, NarrativeStateStore};
use crate::pipeline::transaction::{
    CancelFlag, ChapterTransaction, CommitLedger, CommittedChapter, PreparedChapter, RetryPolicy,
};
use crate::progress::ConsoleProgress;

#[derive(Clone, Debug)]
pub struct CommittedBook {
    pub source_id: String,
    /// One entry per chapter, in ordinal order.
    pub chapters: Vec<CommittedChapter>,
    pub snapshot: Arc<NarrativeSnapshot>,
}

impl CommittedBook {
    #[must_use]
    pub fn chapter(&self, ordinal: u32) -> Option<&CommittedChapter> {
        let idx = (ordinal as usize).checked_sub(1)?;
        self.chapters.get(idx)
    }

    #[must_use]
    pub fn replayed(&self) -> usize {
        self.chapters.iter().filter(|c| c.from_cache).count()
    }
}

/// The first chapter that could not complete. Chapters before it stay committed.
#[derive(Clone, Debug, PartialEq)]
pub struct AbortedAt {
    pub ordinal: u32,
    pub attempts: u32,
    pub reason: FailureReason,
    pub last_committed: u32,
}

#[derive(Clone, Debug)]
pub enum BookOutcome {
    Committed(CommittedBook),
    Aborted(AbortedAt),
}

type Speculation = Result<PreparedChapter, FailureReason>;

pub struct BookPipeline<'a> {
    services: Services<'a>,
    checkpoints: &'a dyn CheckpointStore,
    policy: RetryPolicy,
    summary_max_chars: usize,
    lookahead: usize,
    cancel: CancelFlag,
    progress: Option<&'a ConsoleProgress>,
    export: Option<StateExport>,
}

impl<'a> BookPipeline<'a> {
    pub fn new(services: Services<'a>, checkpoints: &'a dyn CheckpointStore) -> Self {
        Self {
            services,
            checkpoints,
            policy: RetryPolicy::default(),
            summary_max_chars: 4000,
            lookahead: 0,
            cancel: CancelFlag::new(),
            progress: None,
            export: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_summary_max_chars(mut self, max_chars: usize) -> Self {
        self.summary_max_chars = max_chars;
        self
    }

    /// Number of chapters beyond the commit point prepared concurrently.
    pub fn with_lookahead(mut self, chapters: usize) -> Self {
        self.lookahead = chapters;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: &'a ConsoleProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_state_export(mut self, export: StateExport) -> Self {
        self.export = Some(export);
        self
    }

    /// Runs every chapter to `Committed`, or stops at the first `Aborted` one.
    ///
    /// A stored checkpoint is resumed by replaying its cached chapters; only a
    /// foreign or unreadable checkpoint is an error.
    pub fn run(&self, book: &Book) -> Result<BookOutcome, CheckpointError> {
        let checkpoint = match self.checkpoints.load()? {
            Some(cp) if cp.book_id != book.source_id => {
                return Err(CheckpointError::ForeignBook {
                    path: self.checkpoints.location(),
                    expected: book.source_id.clone(),
                    found: cp.book_id,
                });
            }
            Some(cp) => {
                info!(
                    last_committed = cp.last_committed_ordinal,
                    version = cp.snapshot_version,
                    cached = cp.cache.len(),
                    "resuming from checkpoint"
                );
                cp
            }
            None => Checkpoint::empty(book.source_id.clone()),
        };
        let resume_point = checkpoint.last_committed_ordinal;
        let store = NarrativeStateStore::new(self.summary_max_chars);
        let mut ledger = CommitLedger::new(checkpoint, self.checkpoints);
        let total = book.len();
        let speculation = self.cancel.child();

        let outcome = std::thread::scope(|scope| {
            let mut inflight: BTreeMap<u32, ScopedJoinHandle<'_, Speculation>> = BTreeMap::new();
            let mut committed = Vec::with_capacity(total);

            for chapter in book.chapters() {
                let ordinal = chapter.ordinal;

                if self.lookahead > 0 && ordinal > resume_point {
                    let horizon = ordinal.saturating_add(self.lookahead as u32);
                    for ahead in book
                        .chapters()
                        .iter()
                        .filter(|c| c.ordinal > ordinal && c.ordinal <= horizon)
                    {
                        if inflight.contains_key(&ahead.ordinal) {
                            continue;
                        }
                        let basis = store.snapshot();
                        let services = self.services;
                        let policy = &self.policy;
                        let cancel = speculation.clone();
                        info!(ordinal = ahead.ordinal, basis = basis.version, "speculating");
                        let handle = scope.spawn(move || {
                            ChapterTransaction::new(ahead, services, policy, cancel).prepare(basis)
                        });
                        inflight.insert(ahead.ordinal, handle);
                    }
                }

                let speculative = inflight.remove(&ordinal).and_then(|h| match h.join() {
                    Ok(result) => Some(result),
                    Err(_) => {
                        warn!(ordinal, "speculative worker panicked; preparing inline");
                        None
                    }
                });

                let mut tx = ChapterTransaction::new(
                    chapter,
                    self.services,
                    &self.policy,
                    self.cancel.clone(),
                );
                match tx.run(&store, &mut ledger, speculative) {
                    Ok(done) => {
                        self.after_commit(&store, &done, total);
                        committed.push(done);
                    }
                    Err(aborted) => {
                        error!(
                            ordinal,
                            attempts = aborted.attempts,
                            reason = %aborted.reason,
                            "chapter aborted; halting"
                        );
                        if !inflight.is_empty() {
                            speculation.cancel();
                            info!(pending = inflight.len(), "cancelling speculative chapters");
                        }
                        return BookOutcome::Aborted(AbortedAt {
                            ordinal: aborted.ordinal,
                            attempts: aborted.attempts,
                            reason: aborted.reason,
                            last_committed: ordinal - 1,
                        });
                    }
                }
            }

            BookOutcome::Committed(CommittedBook {
                source_id: book.source_id.clone(),
                chapters: committed,
                snapshot: store.snapshot(),
            })
        });
        Ok(outcome)
    }

    fn after_commit(&self, store: &NarrativeStateStore, done: &CommittedChapter, total: usize) {
        if let Some(progress) = self.progress {
            let note = if done.from_cache { "cached" } else { "translated" };
            progress.progress_with_note("chapter", done.ordinal as usize, total, note);
        }
        if let Some(export) = &self.export {
            if let Err(e) = export.write(&store.snapshot()) {
                warn!(ordinal = done.ordinal, error = %format!("{e:#}"), "state export failed");
            }
        }
    }
}

//! Chapter transaction manager.
//!
//! Drives one chapter through
//! `Pending -> Translating -> ValidatingTranslation -> Editing -> ValidatingEdit -> Committing -> Committed`.
//! Nothing a chapter produces becomes visible before the commit barrier in
//! [`CommitLedger::commit`]; a failed attempt drops its drafts and staged update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{
    CheckpointError, ConflictError, FailureReason, InvokeError, ValidationStage,
};
use crate::ir::{Block, Chapter, ChapterState};
use crate::pipeline::cache::{CachedChapter, CommittedResultCache};
use crate::pipeline::checkpoint::{Checkpoint, CheckpointStore, CommitRecord};
use crate::pipeline::fingerprint::ChapterFingerprint;
use crate::pipeline::invoker::{
    DraftBlock, EditRequest, Services, SummaryRequest, TranslateRequest, TranslationDraft,
};
use crate::pipeline::state::{
    CommitReport, NarrativeDelta, NarrativeSnapshot, NarrativeStateStore, StagedUpdate,
};
use crate::pipeline::validate::{check_snapshot_currency, validate_alignment};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Whole-chapter attempts (`Failed -> Pending`) before the chapter is aborted.
    pub max_chapter_attempts: u32,
    /// Translate/validate rounds inside one attempt.
    pub max_validation_attempts: u32,
    /// Snapshot conflicts absorbed inside one attempt.
    pub max_conflict_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_chapter_attempts: 3,
            max_validation_attempts: 3,
            max_conflict_retries: 8,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(failed_attempts - 1)`, capped at `backoff_max`.
    #[must_use]
    pub fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

/// Cooperative cancellation. A child flag is also cancelled when any ancestor is.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelFlag>>,
}

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that can be cancelled on its own without touching `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

/// A validated translation + edit waiting for its commit turn.
#[derive(Clone, Debug)]
pub struct PreparedChapter {
    pub ordinal: u32,
    basis: Arc<NarrativeSnapshot>,
    draft: TranslationDraft,
    edited: Vec<DraftBlock>,
    transitions: Vec<ChapterState>,
}

impl PreparedChapter {
    #[must_use]
    pub fn basis_version(&self) -> u64 {
        self.basis.version
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedChapter {
    pub ordinal: u32,
    pub fingerprint: ChapterFingerprint,
    /// Source blocks with their committed target text filled in.
    pub blocks: Vec<Block>,
    pub from_cache: bool,
    /// Snapshot version published by this commit.
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AbortedChapter {
    pub ordinal: u32,
    pub attempts: u32,
    pub reason: FailureReason,
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Commit-side resources. Owned by the book pipeline; chapters commit through it one at a time.
pub struct CommitLedger<'s> {
    checkpoint: Checkpoint,
    sink: &'s dyn CheckpointStore,
}

impl<'s> CommitLedger<'s> {
    #[must_use]
    pub fn new(checkpoint: Checkpoint, sink: &'s dyn CheckpointStore) -> Self {
        Self { checkpoint, sink }
    }

    #[must_use]
    pub fn cache(&self) -> &CommittedResultCache {
        &self.checkpoint.cache
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// The commit barrier: publishes the snapshot, cache entry and checkpoint together or not at all.
    pub fn commit(
        &mut self,
        store: &NarrativeStateStore,
        staged: StagedUpdate,
        fingerprint: ChapterFingerprint,
        chapter: &Chapter,
        targets: Vec<String>,
        from_cache: bool,
    ) -> Result<CommittedChapter, CommitError> {
        let ordinal = staged.chapter_ordinal();
        let already_recorded = self
            .checkpoint
            .committed
            .get(ordinal.saturating_sub(1) as usize)
            .is_some_and(|r| r.ordinal == ordinal && r.fingerprint == fingerprint);
        let entry = CachedChapter {
            ordinal,
            targets: targets.clone(),
            delta: staged.delta().clone(),
        };

        let mut written: Option<Checkpoint> = None;
        let report: CommitReport = store.commit_with(staged, |next| -> Result<(), CommitError> {
            if already_recorded {
                return Ok(());
            }
            let mut cache = self.checkpoint.cache.clone();
            cache.insert(fingerprint.clone(), entry);
            let cp = self.checkpoint.advanced(
                CommitRecord {
                    ordinal,
                    fingerprint: fingerprint.clone(),
                },
                cache,
                next,
            );
            self.sink.save(&cp)?;
            written = Some(cp);
            Ok(())
        })?;
        if let Some(cp) = written {
            self.checkpoint = cp;
        }

        for ev in &report.glossary_events {
            debug!(ordinal, event = ?ev, "glossary");
        }
        for ev in &report.character_events {
            debug!(ordinal, event = ?ev, "characters");
        }

        let blocks = chapter
            .blocks
            .iter()
            .zip(targets)
            .map(|(b, t)| Block {
                target: Some(t),
                ..b.clone()
            })
            .collect();
        Ok(CommittedChapter {
            ordinal,
            fingerprint,
            blocks,
            from_cache,
            version: report.snapshot.version,
        })
    }
}

pub struct ChapterTransaction<'a> {
    chapter: &'a Chapter,
    services: Services<'a>,
    policy: &'a RetryPolicy,
    cancel: CancelFlag,
    state: ChapterState,
    history: Vec<ChapterState>,
    fingerprint: Option<ChapterFingerprint>,
    policy_rejections: u32,
}

impl<'a> ChapterTransaction<'a> {
    #[must_use]
    pub fn new(
        chapter: &'a Chapter,
        services: Services<'a>,
        policy: &'a RetryPolicy,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            chapter,
            services,
            policy,
            cancel,
            state: ChapterState::Pending,
            history: vec![ChapterState::Pending],
            fingerprint: None,
            policy_rejections: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> ChapterState {
        self.state
    }

    /// Every state entered so far, in order.
    #[must_use]
    pub fn history(&self) -> &[ChapterState] {
        &self.history
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&ChapterFingerprint> {
        self.fingerprint.as_ref()
    }

    fn enter(&mut self, next: ChapterState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        debug!(ordinal = self.chapter.ordinal, from = %self.state, to = %next, "transition");
        self.state = next;
        self.history.push(next);
    }

    fn check_cancel(&self) -> Result<(), FailureReason> {
        if self.cancel.is_cancelled() {
            Err(FailureReason::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs the chapter to `Committed`, or to `Aborted` once the attempt cap is spent.
    ///
    /// `speculative` is the outcome of a look-ahead [`prepare`](Self::prepare) done by
    /// another transaction for the same chapter; it stands in for the first attempt's work.
    pub fn run(
        &mut self,
        store: &NarrativeStateStore,
        ledger: &mut CommitLedger<'_>,
        mut speculative: Option<Result<PreparedChapter, FailureReason>>,
    ) -> Result<CommittedChapter, AbortedChapter> {
        let ordinal = self.chapter.ordinal;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let reason = match self.attempt(store, ledger, speculative.take()) {
                Ok(done) => return Ok(done),
                Err(reason) => reason,
            };

            self.enter(ChapterState::Failed);
            warn!(ordinal, attempt, error = %reason, "chapter attempt failed; drafts discarded");
            if matches!(reason, FailureReason::Invoke(InvokeError::ContentPolicy(_))) {
                self.policy_rejections += 1;
            }
            if reason.is_fatal() || attempt >= self.policy.max_chapter_attempts {
                self.enter(ChapterState::Aborted);
                return Err(AbortedChapter {
                    ordinal,
                    attempts: attempt,
                    reason,
                });
            }
            if reason.is_transient() {
                let delay = self.policy.backoff_delay(attempt);
                info!(ordinal, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                std::thread::sleep(delay);
            }
            self.enter(ChapterState::Pending);
        }
    }

    fn attempt(
        &mut self,
        store: &NarrativeStateStore,
        ledger: &mut CommitLedger<'_>,
        speculative: Option<Result<PreparedChapter, FailureReason>>,
    ) -> Result<CommittedChapter, FailureReason> {
        let mut conflicts = 0u32;
        let snapshot = loop {
            self.check_cancel()?;
            let snapshot = store.snapshot();
            let fingerprint =
                ChapterFingerprint::compute(self.chapter, &snapshot, self.services.service_id);
            self.fingerprint = Some(fingerprint.clone());

            let Some(hit) = ledger.cache().get(&fingerprint).cloned() else {
                break snapshot;
            };
            if hit.targets.len() != self.chapter.blocks.len() {
                warn!(
                    ordinal = self.chapter.ordinal,
                    fingerprint = fingerprint.short(),
                    "cached result does not fit chapter; recomputing"
                );
                break snapshot;
            }
            match self.replay_cached(store, ledger, &snapshot, fingerprint, hit) {
                Ok(done) => return Ok(done),
                Err(StageOutcome::Failed(reason)) => return Err(reason),
                Err(StageOutcome::Conflict(c)) => {
                    conflicts += 1;
                    if conflicts > self.policy.max_conflict_retries {
                        return Err(FailureReason::ConflictsExhausted {
                            retries: conflicts - 1,
                            last: c.to_string(),
                        });
                    }
                    debug!(ordinal = self.chapter.ordinal, conflicts, error = %c, "snapshot moved before replay");
                }
            }
        };

        let prepared = match speculative {
            Some(Ok(p)) => self.adopt(p),
            Some(Err(reason)) => return Err(reason),
            None => self.prepare(snapshot)?,
        };
        self.commit_prepared(prepared, store, ledger)
    }

    /// Commits a cache hit computed against `basis`. A moved snapshot comes back as a conflict.
    fn replay_cached(
        &mut self,
        store: &NarrativeStateStore,
        ledger: &mut CommitLedger<'_>,
        basis: &NarrativeSnapshot,
        fingerprint: ChapterFingerprint,
        hit: CachedChapter,
    ) -> Result<CommittedChapter, StageOutcome> {
        let ordinal = self.chapter.ordinal;
        let staged = store
            .stage(ordinal, basis.version, hit.delta)
            .map_err(StageOutcome::Conflict)?;
        let done = ledger
            .commit(store, staged, fingerprint, self.chapter, hit.targets, true)
            .map_err(|e| match e {
                CommitError::Conflict(c) => StageOutcome::Conflict(c),
                other => StageOutcome::Failed(commit_failure(other)),
            })?;
        info!(ordinal, fingerprint = done.fingerprint.short(), "replayed from cache");
        self.enter(ChapterState::Committed);
        Ok(done)
    }

    fn adopt(&mut self, prepared: PreparedChapter) -> PreparedChapter {
        for &s in prepared.transitions.iter().skip(1) {
            self.enter(s);
        }
        prepared
    }

    /// Translate, validate, edit and validate against `basis`. No shared state is touched.
    pub fn prepare(
        &mut self,
        basis: Arc<NarrativeSnapshot>,
    ) -> Result<PreparedChapter, FailureReason> {
        let start = self.history.len() - 1;
        let draft = self.translate_validated(&basis)?;
        let edited = self.edit_validated(&basis, &draft)?;
        Ok(PreparedChapter {
            ordinal: self.chapter.ordinal,
            basis,
            draft,
            edited,
            transitions: self.history[start..].to_vec(),
        })
    }

    fn translate_validated(
        &mut self,
        basis: &NarrativeSnapshot,
    ) -> Result<TranslationDraft, FailureReason> {
        let ordinal = self.chapter.ordinal;
        let mut feedback: Option<String> = None;
        let mut last_failure: Option<FailureReason> = None;
        for round in 1..=self.policy.max_validation_attempts.max(1) {
            self.check_cancel()?;
            self.enter(ChapterState::Translating);
            let req = TranslateRequest {
                chapter: self.chapter,
                snapshot: basis,
                feedback: feedback.as_deref(),
                after_policy_rejection: self.policy_rejections > 0,
            };
            let result = self.services.translator.translate(&req);
            self.enter(ChapterState::ValidatingTranslation);
            let mut draft = match result {
                Ok(d) => d,
                Err(InvokeError::Malformed(detail)) => {
                    warn!(ordinal, round, %detail, "unparseable translation");
                    feedback = Some(format!(
                        "The previous answer could not be read: {detail}.\nFollow the output format exactly."
                    ));
                    last_failure = Some(FailureReason::Invoke(InvokeError::Malformed(detail)));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match validate_alignment(
                ValidationStage::Translation,
                &self.chapter.blocks,
                &draft.blocks,
            ) {
                Ok(()) => {
                    if !self.chapter.kind.is_narrative() {
                        draft.glossary_additions.clear();
                        draft.character_updates.clear();
                    }
                    return Ok(draft);
                }
                Err(m) => {
                    warn!(ordinal, round, error = %m, "translation draft rejected");
                    feedback = Some(m.feedback());
                    last_failure = Some(m.into());
                }
            }
        }
        Err(last_failure.unwrap_or(FailureReason::Cancelled))
    }

    fn edit_validated(
        &mut self,
        basis: &NarrativeSnapshot,
        draft: &TranslationDraft,
    ) -> Result<Vec<DraftBlock>, FailureReason> {
        self.check_cancel()?;
        self.enter(ChapterState::Editing);
        let edited = self.services.editor.edit(&EditRequest {
            chapter: self.chapter,
            draft: &draft.blocks,
            snapshot: basis,
            glossary_additions: &draft.glossary_additions,
            character_updates: &draft.character_updates,
        })?;
        self.check_cancel()?;
        self.enter(ChapterState::ValidatingEdit);
        validate_alignment(ValidationStage::Edit, &draft.blocks, &edited)?;
        Ok(edited)
    }

    /// Re-check a prepared chapter against a snapshot that moved on since its basis.
    fn revalidate(
        &mut self,
        mut prepared: PreparedChapter,
        current: Arc<NarrativeSnapshot>,
    ) -> Result<PreparedChapter, FailureReason> {
        self.enter(ChapterState::ValidatingTranslation);
        validate_alignment(
            ValidationStage::Translation,
            &self.chapter.blocks,
            &prepared.draft.blocks,
        )?;
        match check_snapshot_currency(self.chapter, &prepared.basis, &current) {
            Ok(()) => {
                self.enter(ChapterState::ValidatingEdit);
                validate_alignment(ValidationStage::Edit, &prepared.draft.blocks, &prepared.edited)?;
                prepared.basis = current;
                Ok(prepared)
            }
            Err(stale) => {
                info!(ordinal = self.chapter.ordinal, %stale, "retranslating against newer snapshot");
                let draft = self.translate_validated(&current)?;
                let edited = self.edit_validated(&current, &draft)?;
                Ok(PreparedChapter {
                    ordinal: prepared.ordinal,
                    basis: current,
                    draft,
                    edited,
                    transitions: Vec::new(),
                })
            }
        }
    }

    fn commit_prepared(
        &mut self,
        mut prepared: PreparedChapter,
        store: &NarrativeStateStore,
        ledger: &mut CommitLedger<'_>,
    ) -> Result<CommittedChapter, FailureReason> {
        let ordinal = self.chapter.ordinal;
        let mut conflicts = 0u32;
        loop {
            self.check_cancel()?;
            self.enter(ChapterState::Committing);
            let current = store.snapshot();
            let conflict = if current.version != prepared.basis.version {
                ConflictError {
                    used: prepared.basis.version,
                    current: current.version,
                }
            } else {
                match self.stage_and_commit(&prepared, &current, store, ledger) {
                    Ok(done) => {
                        self.enter(ChapterState::Committed);
                        info!(
                            ordinal,
                            version = done.version,
                            fingerprint = done.fingerprint.short(),
                            "chapter committed"
                        );
                        return Ok(done);
                    }
                    Err(StageOutcome::Conflict(c)) => c,
                    Err(StageOutcome::Failed(reason)) => return Err(reason),
                }
            };

            conflicts += 1;
            if conflicts > self.policy.max_conflict_retries {
                return Err(FailureReason::ConflictsExhausted {
                    retries: conflicts - 1,
                    last: conflict.to_string(),
                });
            }
            debug!(ordinal, conflicts, error = %conflict, "snapshot moved; revalidating");
            prepared = self.revalidate(prepared, store.snapshot())?;
        }
    }

    fn stage_and_commit(
        &mut self,
        prepared: &PreparedChapter,
        current: &NarrativeSnapshot,
        store: &NarrativeStateStore,
        ledger: &mut CommitLedger<'_>,
    ) -> Result<CommittedChapter, StageOutcome> {
        let summary = if self.chapter.kind.is_narrative() {
            let text = self
                .services
                .summarizer
                .summarize(&SummaryRequest {
                    chapter: self.chapter,
                    previous: &current.summary,
                    max_chars: store.summary_max_chars(),
                })
                .map_err(|e| StageOutcome::Failed(e.into()))?;
            Some(text)
        } else {
            None
        };
        let delta = NarrativeDelta {
            glossary_additions: prepared.draft.glossary_additions.clone(),
            character_updates: prepared.draft.character_updates.clone(),
            summary,
        };
        let staged = store
            .stage(self.chapter.ordinal, current.version, delta)
            .map_err(StageOutcome::Conflict)?;
        let fingerprint =
            ChapterFingerprint::compute(self.chapter, current, self.services.service_id);
        self.fingerprint = Some(fingerprint.clone());
        let targets = prepared.edited.iter().map(|b| b.text.clone()).collect();
        ledger
            .commit(store, staged, fingerprint, self.chapter, targets, false)
            .map_err(|e| match e {
                CommitError::Conflict(c) => StageOutcome::Conflict(c),
                other => StageOutcome::Failed(commit_failure(other)),
            })
    }
}

#[derive(Debug)]
enum StageOutcome {
    Conflict(ConflictError),
    Failed(FailureReason),
}

fn commit_failure(e: CommitError) -> FailureReason {
    match e {
        CommitError::Conflict(c) => FailureReason::ConflictsExhausted {
            retries: 0,
            last: c.to_string(),
        },
        CommitError::Checkpoint(c) => FailureReason::Checkpoint(c.to_string()),
    }
}

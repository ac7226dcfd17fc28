//! Chat-model implementations of the three invoker traits.
//!
//! Each call is stateless: everything the model may use arrives through the
//! request snapshot, rendered into the prompt.

use tracing::{debug, warn};

use crate::characters::{CharacterContext, CharacterProposal, VI_PRONOUNS};
use crate::error::InvokeError;
use crate::ir::{Block, Chapter};
use crate::models::{ChatBackend, ChatRequest};
use crate::pipeline::invoker::{
    DraftBlock, EditRequest, EditorInvoker, SummaryInvoker, SummaryRequest, TranslateRequest,
    TranslationDraft, TranslationInvoker,
};
use crate::pipeline::prompts::{render_template, PromptSet};
use crate::pipeline::trace::TraceWriter;
use crate::sentinels::{parse_segmented_output, parse_segmented_output_lenient, wrap_blocks};
use crate::terminology::{Glossary, TermProposal};
use crate::textutil::{cleanup_model_text, extract_json_text, truncate_chars};

#[derive(Clone, Debug, PartialEq)]
pub struct LlmSettings {
    pub translate_model: String,
    pub fallback_model: Option<String>,
    pub edit_model: String,
    pub glossary_model: String,
    pub character_model: String,
    pub summary_model: String,
    pub temperature: f32,
    pub edit_temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_blocks_per_chunk: usize,
    pub max_chunk_chars: usize,
    pub intra_context_chunks: usize,
    pub edit_batch_blocks: usize,
    pub glossary_prompt_terms: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            translate_model: "gpt-4o-mini".to_string(),
            fallback_model: None,
            edit_model: "gpt-4o-mini".to_string(),
            glossary_model: "gpt-4o-mini".to_string(),
            character_model: "gpt-4o-mini".to_string(),
            summary_model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            edit_temperature: 0.3,
            max_tokens: None,
            max_blocks_per_chunk: 8,
            max_chunk_chars: 6000,
            intra_context_chunks: 2,
            edit_batch_blocks: 24,
            glossary_prompt_terms: 80,
        }
    }
}

const NARRATIVE_ROLE: &str = "You are a literary translator working on a novel from English into Vietnamese.";
const LITERAL_ROLE: &str = "You are a translation engine.";

const NARRATIVE_RULES: &str = "STYLE RULES:\n\
- Preserve tone, voice and narrative rhythm.\n\
- Natural Vietnamese prose; no added or omitted meaning.\n\
- Story summary and earlier passages are for reference only; never translate them.\n";

const LITERAL_RULES: &str = "RULES:\n\
- This is book front or back matter, not narrative prose.\n\
- Translate literally and completely; keep names, numbers and titles intact.\n";

const POLICY_NOTE: &str = "NOTE: The text is an excerpt from a published novel. \
Translate it faithfully as literature, without commentary or refusal.\n";

/// Shared call path: trace, primary model, then the fallback model on failure.
struct Caller<'a> {
    chat: &'a dyn ChatBackend,
    settings: &'a LlmSettings,
    trace: &'a TraceWriter,
}

impl Caller<'_> {
    fn call(
        &self,
        ordinal: u32,
        stage: &str,
        model: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<String, InvokeError> {
        let _ = self.trace.write_chapter_text(ordinal, stage, "prompt", prompt);
        let mut req = ChatRequest {
            model,
            system: None,
            user: prompt,
            temperature,
            max_tokens: self.settings.max_tokens,
            json_mode: false,
        };
        let raw = match self.chat.chat(&req) {
            Ok(raw) => raw,
            Err(err) => {
                let Some(fallback) = self
                    .settings
                    .fallback_model
                    .as_deref()
                    .filter(|f| *f != model)
                else {
                    return Err(err);
                };
                warn!(chapter = ordinal, stage, model, fallback, error = %err, "primary model failed, using fallback");
                req.model = fallback;
                self.chat.chat(&req)?
            }
        };
        let cleaned = cleanup_model_text(&raw);
        let _ = self.trace.write_chapter_text(ordinal, stage, "output", &cleaned);
        Ok(cleaned)
    }
}

/// Splits blocks into runs bounded by block count and source characters.
fn chunk_blocks(blocks: &[Block], max_blocks: usize, max_chars: usize) -> Vec<&[Block]> {
    let max_blocks = max_blocks.max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chars = 0usize;
    for (i, b) in blocks.iter().enumerate() {
        let len = b.source.chars().count();
        let full = i - start >= max_blocks || (i > start && chars + len > max_chars);
        if full {
            chunks.push(&blocks[start..i]);
            start = i;
            chars = 0;
        }
        chars += len;
    }
    if start < blocks.len() {
        chunks.push(&blocks[start..]);
    }
    chunks
}

fn marker_id(index: usize) -> usize {
    index + 1
}

pub struct LlmTranslator<'a> {
    caller: Caller<'a>,
    prompts: &'a PromptSet,
}

impl<'a> LlmTranslator<'a> {
    pub fn new(
        chat: &'a dyn ChatBackend,
        settings: &'a LlmSettings,
        prompts: &'a PromptSet,
        trace: &'a TraceWriter,
    ) -> Self {
        Self {
            caller: Caller {
                chat,
                settings,
                trace,
            },
            prompts,
        }
    }

    fn settings(&self) -> &LlmSettings {
        self.caller.settings
    }

    fn propose_terms(
        &self,
        chapter: &Chapter,
        glossary: &Glossary,
        chapter_text: &str,
    ) -> Result<Vec<TermProposal>, InvokeError> {
        let existing = glossary
            .entries()
            .map(|e| format!("- {} => {}", e.source, e.target))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = render_template(
            &self.prompts.glossary,
            &[("existing_terms", &existing), ("chapter_text", chapter_text)],
        );
        let s = self.settings();
        let raw = self
            .caller
            .call(chapter.ordinal, "glossary", &s.glossary_model, &prompt, 0.0)?;
        parse_term_proposals(&raw)
    }

    fn propose_characters(
        &self,
        chapter: &Chapter,
        characters: &CharacterContext,
        chapter_text: &str,
    ) -> Result<Vec<CharacterProposal>, InvokeError> {
        let existing = characters.render_lines();
        let pronouns = VI_PRONOUNS.join(", ");
        let prompt = render_template(
            &self.prompts.characters,
            &[
                ("existing_characters", &existing),
                ("pronouns", &pronouns),
                ("chapter_text", chapter_text),
            ],
        );
        let s = self.settings();
        let raw = self
            .caller
            .call(chapter.ordinal, "characters", &s.character_model, &prompt, 0.0)?;
        Ok(parse_character_lines(&raw))
    }

    #[allow(clippy::too_many_arguments)]
    fn translate_chunk(
        &self,
        req: &TranslateRequest<'_>,
        label: &str,
        blocks: &[Block],
        glossary: &Glossary,
        pronoun_rules: &str,
        intra_context: &str,
        out: &mut Vec<DraftBlock>,
    ) -> Result<(), InvokeError> {
        let s = self.settings();
        let chapter = req.chapter;
        let narrative = chapter.kind.is_narrative();

        let chunk_text = blocks
            .iter()
            .map(|b| b.source.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let terms = glossary.relevant_for_text(&chunk_text, s.glossary_prompt_terms);
        let glossary_rules = Glossary::render_for_prompt(&terms);

        let mut extra_rules = String::from(if narrative {
            NARRATIVE_RULES
        } else {
            LITERAL_RULES
        });
        if req.after_policy_rejection {
            extra_rules.push_str(POLICY_NOTE);
        }
        let feedback = req
            .feedback
            .map(|f| format!("PREVIOUS ATTEMPT WAS REJECTED, fix this:\n{f}\n\n"))
            .unwrap_or_default();
        let summary = if narrative && !req.snapshot.summary.trim().is_empty() {
            req.snapshot.summary.as_str()
        } else {
            "(none)"
        };
        let ids: Vec<usize> = blocks.iter().map(|b| marker_id(b.index)).collect();
        let wrapped = wrap_blocks(blocks.iter().map(|b| (marker_id(b.index), b.source.as_str())));
        let count = blocks.len().to_string();

        let prompt = render_template(
            &self.prompts.translate,
            &[
                ("role", if narrative { NARRATIVE_ROLE } else { LITERAL_ROLE }),
                ("extra_rules", &extra_rules),
                ("glossary_rules", &glossary_rules),
                ("pronoun_rules", if narrative { pronoun_rules } else { "" }),
                ("summary", summary),
                ("intra_context", intra_context),
                ("feedback", &feedback),
                ("block_count", &count),
                ("blocks", &wrapped),
            ],
        );
        let raw = self.caller.call(
            chapter.ordinal,
            &format!("translate.{label}"),
            &s.translate_model,
            &prompt,
            s.temperature,
        )?;

        match parse_segmented_output(&raw, &ids) {
            Ok(segs) => {
                out.extend(
                    blocks
                        .iter()
                        .zip(segs)
                        .map(|(b, text)| DraftBlock::new(b.index, b.kind, text)),
                );
                Ok(())
            }
            Err(err) if blocks.len() > 1 => {
                debug!(chapter = chapter.ordinal, label, error = %err, "splitting chunk after marker mismatch");
                let mid = blocks.len() / 2;
                self.translate_chunk(
                    req,
                    &format!("{label}a"),
                    &blocks[..mid],
                    glossary,
                    pronoun_rules,
                    intra_context,
                    out,
                )?;
                self.translate_chunk(
                    req,
                    &format!("{label}b"),
                    &blocks[mid..],
                    glossary,
                    pronoun_rules,
                    intra_context,
                    out,
                )
            }
            Err(err) => Err(InvokeError::Malformed(format!("{err:#}"))),
        }
    }
}

impl TranslationInvoker for LlmTranslator<'_> {
    fn translate(&self, req: &TranslateRequest<'_>) -> Result<TranslationDraft, InvokeError> {
        let chapter = req.chapter;
        let snapshot = req.snapshot;
        let s = self.settings();
        let narrative = chapter.kind.is_narrative();
        let chapter_text = chapter.source_text();

        let (glossary_additions, character_updates) = if narrative {
            (
                self.propose_terms(chapter, &snapshot.glossary, &chapter_text)?,
                self.propose_characters(chapter, &snapshot.characters, &chapter_text)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        // Committed state plus this chapter's own proposals, as the chapter would see it after commit.
        let mut glossary = snapshot.glossary.clone();
        glossary.apply_additions(glossary_additions.iter().cloned(), chapter.ordinal);
        let mut characters = snapshot.characters.clone();
        characters.merge(character_updates.iter().cloned(), chapter.ordinal);
        let pronoun_rules = characters.render_pronoun_rules();

        let mut blocks = Vec::with_capacity(chapter.blocks.len());
        let mut recent: Vec<String> = Vec::new();
        let chunks = chunk_blocks(&chapter.blocks, s.max_blocks_per_chunk, s.max_chunk_chars);
        for (n, chunk) in chunks.iter().enumerate() {
            let intra_context = if recent.is_empty() || !narrative {
                String::new()
            } else {
                format!(
                    "EARLIER IN THIS CHAPTER (already translated, reference only):\n{}\n\n",
                    recent.join("\n")
                )
            };
            let before = blocks.len();
            self.translate_chunk(
                req,
                &format!("chunk{:02}", n + 1),
                chunk,
                &glossary,
                &pronoun_rules,
                &intra_context,
                &mut blocks,
            )?;
            if s.intra_context_chunks > 0 {
                let text = blocks[before..]
                    .iter()
                    .map(|b| b.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                recent.push(text);
                if recent.len() > s.intra_context_chunks {
                    recent.remove(0);
                }
            }
        }

        debug!(
            chapter = chapter.ordinal,
            blocks = blocks.len(),
            chunks = chunks.len(),
            terms = glossary_additions.len(),
            characters = character_updates.len(),
            "translated chapter"
        );
        Ok(TranslationDraft {
            blocks,
            glossary_additions,
            character_updates,
        })
    }
}

/// Parses the glossary model's JSON array reply.
fn parse_term_proposals(raw: &str) -> Result<Vec<TermProposal>, InvokeError> {
    let json = extract_json_text(raw)
        .ok_or_else(|| InvokeError::Malformed("glossary reply has no JSON array".to_string()))?;
    let terms: Vec<TermProposal> = serde_json::from_str(json)
        .map_err(|e| InvokeError::Malformed(format!("glossary reply: {e}")))?;
    Ok(terms
        .into_iter()
        .filter(|t| !t.source.trim().is_empty() && !t.target.trim().is_empty())
        .collect())
}

/// Parses `- Name | role | description | pronoun [| correction]` lines.
fn parse_character_lines(raw: &str) -> Vec<CharacterProposal> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let Some(rest) = line.trim().strip_prefix('-') else {
            continue;
        };
        let parts: Vec<&str> = rest.split('|').map(str::trim).collect();
        if parts.len() < 4 || parts[0].is_empty() || parts[3].is_empty() {
            continue;
        }
        let mut p = CharacterProposal::new(parts[0], parts[3].to_lowercase());
        p.role = parts[1].to_string();
        p.description = parts[2].to_string();
        p.correction = parts
            .get(4)
            .is_some_and(|flag| flag.eq_ignore_ascii_case("correction"));
        out.push(p);
    }
    out
}

pub struct LlmEditor<'a> {
    caller: Caller<'a>,
    prompts: &'a PromptSet,
}

impl<'a> LlmEditor<'a> {
    pub fn new(
        chat: &'a dyn ChatBackend,
        settings: &'a LlmSettings,
        prompts: &'a PromptSet,
        trace: &'a TraceWriter,
    ) -> Self {
        Self {
            caller: Caller {
                chat,
                settings,
                trace,
            },
            prompts,
        }
    }
}

impl EditorInvoker for LlmEditor<'_> {
    fn edit(&self, req: &EditRequest<'_>) -> Result<Vec<DraftBlock>, InvokeError> {
        let chapter = req.chapter;
        if !chapter.kind.is_narrative() {
            return Ok(req.draft.to_vec());
        }
        let s = self.caller.settings;
        let mut glossary = req.snapshot.glossary.clone();
        glossary.apply_additions(req.glossary_additions.iter().cloned(), chapter.ordinal);
        let mut characters = req.snapshot.characters.clone();
        characters.merge(req.character_updates.iter().cloned(), chapter.ordinal);
        let pronoun_rules = characters.render_pronoun_rules();
        let batch = s.edit_batch_blocks.max(1);

        let mut edited = Vec::with_capacity(req.draft.len());
        for (n, drafts) in req.draft.chunks(batch).enumerate() {
            let bodies: Vec<(usize, String)> = drafts
                .iter()
                .map(|d| {
                    let original = chapter
                        .blocks
                        .get(d.index)
                        .map(|b| b.source.as_str())
                        .unwrap_or_default();
                    (
                        marker_id(d.index),
                        format!("ORIGINAL: {original}\nDRAFT: {}", d.text),
                    )
                })
                .collect();
            let ids: Vec<usize> = bodies.iter().map(|(id, _)| *id).collect();
            let wrapped = wrap_blocks(bodies.iter().map(|(id, body)| (*id, body.as_str())));
            let batch_source: String = drafts
                .iter()
                .filter_map(|d| chapter.blocks.get(d.index))
                .map(|b| b.source.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let terms = glossary.relevant_for_text(&batch_source, s.glossary_prompt_terms);
            let glossary_rules = Glossary::render_for_prompt(&terms);
            let count = drafts.len().to_string();
            let prompt = render_template(
                &self.prompts.edit,
                &[
                    ("glossary_rules", &glossary_rules),
                    ("pronoun_rules", &pronoun_rules),
                    ("block_count", &count),
                    ("blocks", &wrapped),
                ],
            );
            let raw = self.caller.call(
                chapter.ordinal,
                &format!("edit.batch{:02}", n + 1),
                &s.edit_model,
                &prompt,
                s.edit_temperature,
            )?;

            let segs = parse_segmented_output_lenient(&raw, &ids);
            let mut kept = 0usize;
            for (d, seg) in drafts.iter().zip(segs) {
                let text = match seg {
                    Some(t) => strip_edit_label(&t).to_string(),
                    None => {
                        kept += 1;
                        d.text.clone()
                    }
                };
                edited.push(DraftBlock::new(d.index, d.kind, text));
            }
            if kept > 0 {
                debug!(chapter = chapter.ordinal, kept, "editor dropped blocks; kept draft text");
            }
        }
        Ok(edited)
    }
}

fn strip_edit_label(text: &str) -> &str {
    let t = text.trim();
    ["EDITED:", "DRAFT:"]
        .iter()
        .find_map(|label| t.strip_prefix(label))
        .map_or(t, str::trim)
}

pub struct LlmSummarizer<'a> {
    caller: Caller<'a>,
    prompts: &'a PromptSet,
}

impl<'a> LlmSummarizer<'a> {
    pub fn new(
        chat: &'a dyn ChatBackend,
        settings: &'a LlmSettings,
        prompts: &'a PromptSet,
        trace: &'a TraceWriter,
    ) -> Self {
        Self {
            caller: Caller {
                chat,
                settings,
                trace,
            },
            prompts,
        }
    }
}

impl SummaryInvoker for LlmSummarizer<'_> {
    fn summarize(&self, req: &SummaryRequest<'_>) -> Result<String, InvokeError> {
        let chapter_text = req.chapter.source_text();
        let max_chars = req.max_chars.to_string();
        let prompt = if req.previous.trim().is_empty() {
            render_template(
                &self.prompts.summary_init,
                &[("chapter_text", &chapter_text), ("max_chars", &max_chars)],
            )
        } else {
            render_template(
                &self.prompts.summary_update,
                &[
                    ("current_summary", req.previous),
                    ("chapter_text", &chapter_text),
                    ("max_chars", &max_chars),
                ],
            )
        };
        let s = self.caller.settings;
        let raw = self
            .caller
            .call(req.chapter.ordinal, "summary", &s.summary_model, &prompt, 0.0)?;
        Ok(truncate_chars(&raw, req.max_chars).trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{
        chunk_blocks, parse_character_lines, parse_term_proposals, LlmEditor, LlmSettings,
        LlmSummarizer, LlmTranslator,
    };
    use crate::characters::CharacterProposal;
    use crate::error::InvokeError;
    use crate::ir::{Block, BlockKind};
    use crate::models::{ChatBackend, ChatRequest};
    use crate::pipeline::invoker::{
        DraftBlock, EditRequest, EditorInvoker, SummaryInvoker, SummaryRequest, TranslateRequest,
        TranslationInvoker,
    };
    use crate::pipeline::prompts::PromptSet;
    use crate::pipeline::state::NarrativeSnapshot;
    use crate::pipeline::testkit::{chapter, front_matter};
    use crate::pipeline::trace::TraceWriter;
    use crate::sentinels::{block_end, block_start};
    use crate::terminology::TermProposal;

    type Reply = Box<dyn Fn(&ChatRequest<'_>) -> Result<String, InvokeError> + Send + Sync>;

    struct FakeChat {
        reply: Reply,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl FakeChat {
        fn new(reply: impl Fn(&ChatRequest<'_>) -> Result<String, InvokeError> + Send + Sync + 'static) -> Self {
            Self {
                reply: Box::new(reply),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<(String, String)> {
            self.seen.lock().expect("lock").clone()
        }
    }

    impl ChatBackend for FakeChat {
        fn chat(&self, req: &ChatRequest<'_>) -> Result<String, InvokeError> {
            self.seen
                .lock()
                .expect("lock")
                .push((req.model.to_string(), req.user.to_string()));
            (self.reply)(req)
        }
    }

    /// Answers every marker found in the prompt with `vi:` plus the block id.
    fn echo_markers(prompt: &str) -> String {
        let mut out = String::new();
        for id in 1..=200 {
            if prompt.contains(&block_start(id)) {
                out.push_str(&format!("{}\nvi:{id}\n{}\n", block_start(id), block_end(id)));
            }
        }
        out
    }

    fn settings() -> LlmSettings {
        LlmSettings {
            translate_model: "tr".to_string(),
            glossary_model: "gl".to_string(),
            character_model: "ch".to_string(),
            edit_model: "ed".to_string(),
            summary_model: "su".to_string(),
            ..LlmSettings::default()
        }
    }

    fn narrative_reply(req: &ChatRequest<'_>) -> Result<String, InvokeError> {
        match req.model {
            "gl" => Ok(r#"```json
[{"source":"Winston","target":"Winston","type":"person"},{"source":"telescreen","target":"màn hình điện toán","type":"system"}]
```"#
                .to_string()),
            "ch" => Ok("CHARACTERS:\n- Winston | protagonist | clerk | anh\nnoise line".to_string()),
            _ => Ok(echo_markers(req.user)),
        }
    }

    #[test]
    fn translates_narrative_with_proposals() {
        let chat = FakeChat::new(narrative_reply);
        let s = settings();
        let prompts = PromptSet::default();
        let trace = TraceWriter::disabled();
        let tr = LlmTranslator::new(&chat, &s, &prompts, &trace);
        let ch = chapter(1, &["Winston looked at the telescreen.", "It was cold."]);
        let snap = NarrativeSnapshot::default();

        let draft = tr
            .translate(&TranslateRequest {
                chapter: &ch,
                snapshot: &snap,
                feedback: Some("block count 1 != 2"),
                after_policy_rejection: false,
            })
            .expect("draft");

        assert_eq!(draft.blocks.len(), 2);
        assert_eq!(draft.blocks[1].text, "vi:2");
        assert_eq!(draft.glossary_additions.len(), 2);
        assert_eq!(draft.character_updates[0].pronoun, "anh");

        let seen = chat.seen();
        let translate_prompt = &seen.iter().find(|(m, _)| m == "tr").expect("translate call").1;
        assert!(translate_prompt.contains("telescreen => màn hình điện toán"));
        assert!(translate_prompt.contains("\"Winston\" MUST be referred to as \"anh\""));
        assert!(translate_prompt.contains("block count 1 != 2"));
    }

    #[test]
    fn front_matter_skips_state_calls() {
        let chat = FakeChat::new(narrative_reply);
        let s = settings();
        let prompts = PromptSet::default();
        let trace = TraceWriter::disabled();
        let tr = LlmTranslator::new(&chat, &s, &prompts, &trace);
        let ch = front_matter(0, &["Copyright 1949 by the author."]);

        let draft = tr
            .translate(&TranslateRequest {
                chapter: &ch,
                snapshot: &NarrativeSnapshot::default(),
                feedback: None,
                after_policy_rejection: true,
            })
            .expect("draft");
        assert!(draft.glossary_additions.is_empty());
        assert!(draft.character_updates.is_empty());
        let seen = chat.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1.contains("published novel"));
    }

    #[test]
    fn marker_loss_splits_then_fails_on_single_block() {
        let chat = FakeChat::new(|req| match req.model {
            "gl" => Ok("[]".to_string()),
            "ch" => Ok(String::new()),
            _ => Ok(echo_markers(req.user).replace(&block_end(2), "")),
        });
        let s = settings();
        let prompts = PromptSet::default();
        let trace = TraceWriter::disabled();
        let tr = LlmTranslator::new(&chat, &s, &prompts, &trace);
        let ch = chapter(1, &["First paragraph.", "Second paragraph."]);

        let err = tr
            .translate(&TranslateRequest {
                chapter: &ch,
                snapshot: &NarrativeSnapshot::default(),
                feedback: None,
                after_policy_rejection: false,
            })
            .expect_err("malformed");
        assert!(matches!(err, InvokeError::Malformed(_)));
        // whole chunk, then each half until block 2 fails alone
        assert_eq!(chat.seen().iter().filter(|(m, _)| m == "tr").count(), 3);
    }

    #[test]
    fn fallback_model_answers_after_primary_failure() {
        let chat = FakeChat::new(|req| match req.model {
            "tr" => Err(InvokeError::Service("status 503".to_string())),
            _ => Ok(echo_markers(req.user)),
        });
        let s = LlmSettings {
            fallback_model: Some("backup".to_string()),
            ..settings()
        };
        let prompts = PromptSet::default();
        let trace = TraceWriter::disabled();
        let tr = LlmTranslator::new(&chat, &s, &prompts, &trace);
        let ch = front_matter(0, &["Contents page text."]);
        let draft = tr
            .translate(&TranslateRequest {
                chapter: &ch,
                snapshot: &NarrativeSnapshot::default(),
                feedback: None,
                after_policy_rejection: false,
            })
            .expect("draft");
        assert_eq!(draft.blocks[0].text, "vi:1");
        assert_eq!(chat.seen().last().map(|(m, _)| m.as_str()), Some("backup"));
    }

    #[test]
    fn editor_keeps_draft_for_dropped_blocks() {
        let chat = FakeChat::new(|_| {
            Ok(format!("{}\nEDITED: Trời lạnh.\n{}\n", block_start(1), block_end(1)))
        });
        let s = settings();
        let prompts = PromptSet::default();
        let trace = TraceWriter::disabled();
        let ed = LlmEditor::new(&chat, &s, &prompts, &trace);
        let ch = chapter(1, &["It was cold.", "Clocks struck thirteen."]);
        let draft = vec![
            DraftBlock::new(0, BlockKind::Paragraph, "Trời rét."),
            DraftBlock::new(1, BlockKind::Paragraph, "Đồng hồ điểm mười ba tiếng."),
        ];
        let out = ed
            .edit(&EditRequest {
                chapter: &ch,
                draft: &draft,
                snapshot: &NarrativeSnapshot::default(),
                glossary_additions: &[],
                character_updates: &[],
            })
            .expect("edit");
        assert_eq!(out[0].text, "Trời lạnh.");
        assert_eq!(out[1].text, "Đồng hồ điểm mười ba tiếng.");
        assert!(chat.seen()[0].1.contains("ORIGINAL: It was cold."));
    }

    #[test]
    fn editor_prompt_carries_committed_and_proposed_terms() {
        let chat = FakeChat::new(|req| Ok(echo_markers(req.user)));
        let s = settings();
        let prompts = PromptSet::default();
        let trace = TraceWriter::disabled();
        let ed = LlmEditor::new(&chat, &s, &prompts, &trace);
        let ch = chapter(
            2,
            &["The telescreen watched Winston.", "The Thought Police were near."],
        );
        let mut snapshot = NarrativeSnapshot::default();
        snapshot
            .glossary
            .apply_additions([TermProposal::new("telescreen", "màn hình điện toán")], 1);
        let draft = vec![
            DraftBlock::new(0, BlockKind::Paragraph, "Màn hình điện toán theo dõi Winston."),
            DraftBlock::new(1, BlockKind::Paragraph, "Cảnh sát Tư tưởng ở gần."),
        ];
        let additions = [TermProposal::new("Thought Police", "Cảnh sát Tư tưởng")];
        let characters = [CharacterProposal::new("Winston", "anh")];
        ed.edit(&EditRequest {
            chapter: &ch,
            draft: &draft,
            snapshot: &snapshot,
            glossary_additions: &additions,
            character_updates: &characters,
        })
        .expect("edit");

        let prompt = &chat.seen()[0].1;
        assert!(prompt.contains("telescreen => màn hình điện toán"));
        assert!(prompt.contains("Thought Police => Cảnh sát Tư tưởng"));
        assert!(prompt.contains("\"Winston\" MUST be referred to as \"anh\""));
    }

    #[test]
    fn summarizer_switches_between_init_and_update() {
        let chat = FakeChat::new(|_| Ok("SETTING:\nLondon, a cold April day".to_string()));
        let s = settings();
        let prompts = PromptSet::default();
        let trace = TraceWriter::disabled();
        let su = LlmSummarizer::new(&chat, &s, &prompts, &trace);
        let ch = chapter(1, &["It was a bright cold day in April."]);

        let first = su
            .summarize(&SummaryRequest {
                chapter: &ch,
                previous: "",
                max_chars: 15,
            })
            .expect("summary");
        assert_eq!(first, "SETTING:\nLondon");
        su.summarize(&SummaryRequest {
            chapter: &ch,
            previous: "SETTING: London",
            max_chars: 100,
        })
        .expect("summary");

        let seen = chat.seen();
        assert!(seen[0].1.contains("initializing"));
        assert!(seen[1].1.contains("CURRENT SUMMARY:\nSETTING: London"));
    }

    #[test]
    fn chunks_respect_both_limits() {
        let blocks: Vec<Block> = (0..5)
            .map(|i| Block::new(i, BlockKind::Paragraph, "x".repeat(10)))
            .collect();
        let sizes: Vec<usize> = chunk_blocks(&blocks, 2, 1000).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let sizes: Vec<usize> = chunk_blocks(&blocks, 10, 25).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn parses_model_state_replies() {
        assert!(matches!(
            parse_term_proposals("no terms today"),
            Err(InvokeError::Malformed(_))
        ));
        let terms = parse_term_proposals(r#"[{"source":"Ministry of Truth","target":"Bộ Sự Thật","type":"organization"}]"#)
            .expect("terms");
        assert_eq!(terms[0].kind.as_deref(), Some("organization"));

        let chars = parse_character_lines("- Julia | | dark-haired girl | Cô | correction\n- | x | y | anh");
        assert_eq!(chars.len(), 1);
        assert_eq!(chars[0].pronoun, "cô");
        assert!(chars[0].correction);
    }
}

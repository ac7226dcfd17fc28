use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::PromptsSection;

pub const DEFAULT_PROMPTS_DIR: &str = "prompts";

pub const DEFAULT_TRANSLATE: &str = "translate.txt";
pub const DEFAULT_GLOSSARY: &str = "glossary.json.txt";
pub const DEFAULT_CHARACTERS: &str = "characters.txt";
pub const DEFAULT_EDIT: &str = "edit.txt";
pub const DEFAULT_SUMMARY_INIT: &str = "summary_init.txt";
pub const DEFAULT_SUMMARY_UPDATE: &str = "summary_update.txt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptSet {
    pub translate: String,
    pub glossary: String,
    pub characters: String,
    pub edit: String,
    pub summary_init: String,
    pub summary_update: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            translate: DEFAULT_TRANSLATE_TEXT.to_string(),
            glossary: DEFAULT_GLOSSARY_TEXT.to_string(),
            characters: DEFAULT_CHARACTERS_TEXT.to_string(),
            edit: DEFAULT_EDIT_TEXT.to_string(),
            summary_init: DEFAULT_SUMMARY_INIT_TEXT.to_string(),
            summary_update: DEFAULT_SUMMARY_UPDATE_TEXT.to_string(),
        }
    }
}

impl PromptSet {
    /// Built-in templates, each replaced by its file when `[prompts]` names one.
    pub fn load(config_path: &Path, p: &PromptsSection) -> anyhow::Result<Self> {
        let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let d = Self::default();
        Ok(Self {
            translate: read_prompt(config_dir, "translate", p.translate.as_deref(), d.translate)?,
            glossary: read_prompt(config_dir, "glossary", p.glossary.as_deref(), d.glossary)?,
            characters: read_prompt(
                config_dir,
                "characters",
                p.characters.as_deref(),
                d.characters,
            )?,
            edit: read_prompt(config_dir, "edit", p.edit.as_deref(), d.edit)?,
            summary_init: read_prompt(
                config_dir,
                "summary_init",
                p.summary_init.as_deref(),
                d.summary_init,
            )?,
            summary_update: read_prompt(
                config_dir,
                "summary_update",
                p.summary_update.as_deref(),
                d.summary_update,
            )?,
        })
    }

    /// Every template, in a fixed order; feeds the service identifier.
    #[must_use]
    pub fn texts(&self) -> [(&'static str, &str); 6] {
        [
            ("translate", &self.translate),
            ("glossary", &self.glossary),
            ("characters", &self.characters),
            ("edit", &self.edit),
            ("summary_init", &self.summary_init),
            ("summary_update", &self.summary_update),
        ]
    }
}

fn read_prompt(
    config_dir: &Path,
    key: &str,
    configured: Option<&str>,
    builtin: String,
) -> anyhow::Result<String> {
    let Some(rel) = configured.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(builtin);
    };
    let mut p = PathBuf::from(rel);
    if p.is_relative() {
        p = config_dir.join(&p);
    }
    if !p.exists() {
        return Err(anyhow!(
            "prompt file not found for {key}: {} (run: epub-bilingual --init-config)",
            p.display()
        ));
    }
    std::fs::read_to_string(&p).with_context(|| format!("read prompt: {}", p.display()))
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        let pat = format!("{{{{{k}}}}}");
        out = out.replace(&pat, v);
    }
    out
}

pub fn default_prompt_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (DEFAULT_TRANSLATE, DEFAULT_TRANSLATE_TEXT),
        (DEFAULT_GLOSSARY, DEFAULT_GLOSSARY_TEXT),
        (DEFAULT_CHARACTERS, DEFAULT_CHARACTERS_TEXT),
        (DEFAULT_EDIT, DEFAULT_EDIT_TEXT),
        (DEFAULT_SUMMARY_INIT, DEFAULT_SUMMARY_INIT_TEXT),
        (DEFAULT_SUMMARY_UPDATE, DEFAULT_SUMMARY_UPDATE_TEXT),
    ]
}

pub const DEFAULT_TRANSLATE_TEXT: &str = r#"{{role}}

TARGET LANGUAGE: Vietnamese. Translate ALL content into Vietnamese.

{{extra_rules}}
{{glossary_rules}}
{{pronoun_rules}}
STORY SO FAR (reference only):
{{summary}}

{{intra_context}}{{feedback}}
FORMAT RULES (violation = invalid output):
- The input has {{block_count}} blocks, each wrapped as <<BLOCK:n>> ... <<END:n>>.
- Output EXACTLY one block per input block, with the SAME markers, in the SAME order.
- Do NOT merge, split, drop or add blocks. A very short block still gets its own block.
- Inside each block output ONLY the Vietnamese translation: no notes, no labels, no commentary.

INPUT:
{{blocks}}"#;

pub const DEFAULT_GLOSSARY_TEXT: &str = r#"ROLE: Narrative glossary analyst for English -> Vietnamese literary translation.

Identify NEW terms in the chapter that need one consistent translation across the book.

INCLUDE ONLY:
- Proper nouns: character names, specific places, organizations.
- Fictional technology, systems, slogans and world-specific objects likely to recur.

EXCLUDE:
- Common nouns and basic vocabulary, generic titles, one-off phrases, descriptive wording.
- Any term already in EXISTING TERMS. Never repeat or modify existing entries.

"target" MUST contain ONLY the Vietnamese term: no explanations, no parentheses.
Put clarifications in "note".

OUTPUT: a STRICT JSON array only, possibly empty:
[{"source":"English term","target":"Vietnamese term","type":"person | organization | concept | system","note":"optional"}]

EXISTING TERMS:
{{existing_terms}}

CHAPTER:
{{chapter_text}}"#;

pub const DEFAULT_CHARACTERS_TEXT: &str = r#"You maintain the CHARACTER CONTEXT of a novel translated into Vietnamese.

RULES:
- List ONLY characters present in the chapter. No speculation.
- Give each character one Vietnamese third-person pronoun chosen from:
  {{pronouns}}
- Choose by gender, age and status; use "anh" if the character is likely male and nothing else is known.
- Keep the pronoun already assigned to a known character. Change it ONLY when the chapter
  explicitly shows the earlier choice was wrong; then append "| correction" to that line.

KNOWN CHARACTERS:
{{existing_characters}}

OUTPUT FORMAT (text only, one line per character):
CHARACTERS:
- Name | role | description | pronoun

CHAPTER:
{{chapter_text}}"#;

pub const DEFAULT_EDIT_TEXT: &str = r#"ROLE: Vietnamese literary editor.

Make the Vietnamese DRAFT of each block read as if written by a skilled Vietnamese novelist,
preserving its meaning exactly. The ORIGINAL English is given only to resolve ambiguity:
do not retranslate from it and do not add meaning absent from the draft.

{{glossary_rules}}
{{pronoun_rules}}
RULES:
- Keep every glossary term exactly as listed; never rephrase or replace it.
- There are {{block_count}} blocks. Return EXACTLY the same markers <<BLOCK:n>> ... <<END:n>>, in order.
- Inside each block output ONLY the edited Vietnamese text, without the ORIGINAL/DRAFT labels.
- If a block needs no change, copy the draft as is.

INPUT:
{{blocks}}"#;

pub const DEFAULT_SUMMARY_INIT_TEXT: &str = r#"You are initializing the STORY SUMMARY of a novel from its FIRST narrative chapter.

RULES: only facts stated in the chapter; no speculation, interpretation or foreshadowing;
neutral, encyclopedic English; at most {{max_chars}} characters.

OUTPUT FORMAT (text only):
SETTING:
<text>

CHARACTERS:
- Name: description

WORLD_STATE:
<text>

INITIAL_PREMISE:
<text>

OPEN_QUESTIONS:
- question

CHAPTER:
{{chapter_text}}"#;

pub const DEFAULT_SUMMARY_UPDATE_TEXT: &str = r#"You are updating an EXISTING STORY SUMMARY with a new chapter.

RULES:
- Add only new facts from the chapter; keep every existing correct fact; no speculation.
- Add newly introduced characters; update descriptions only when new facts appear.
- Remove open questions the chapter answers; add new unresolved ones.
- Output ALL sections (SETTING, CHARACTERS, WORLD_STATE, INITIAL_PREMISE, OPEN_QUESTIONS),
  repeating unchanged sections verbatim. At most {{max_chars}} characters, in English.

CURRENT SUMMARY:
{{current_summary}}

NEW CHAPTER:
{{chapter_text}}"#;

#[cfg(test)]
mod tests {
    use super::{render_template, PromptSet};
    use crate::config::PromptsSection;

    #[test]
    fn renders_placeholders() {
        let out = render_template("{{a}} and {{b}}, {{a}}", &[("a", "x"), ("b", "y")]);
        assert_eq!(out, "x and y, x");
    }

    #[test]
    fn configured_file_overrides_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("edit.txt"), "EDIT {{blocks}}").expect("write");
        let section = PromptsSection {
            edit: Some("edit.txt".to_string()),
            ..PromptsSection::default()
        };
        let set = PromptSet::load(&dir.path().join("epub-bilingual.toml"), &section).expect("load");
        assert_eq!(set.edit, "EDIT {{blocks}}");
        assert_eq!(set.translate, PromptSet::default().translate);

        let missing = PromptsSection {
            glossary: Some("nope.txt".to_string()),
            ..PromptsSection::default()
        };
        let err = PromptSet::load(&dir.path().join("x.toml"), &missing).expect_err("missing");
        assert!(err.to_string().contains("glossary"));
    }
}

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "epub-bilingual.toml";
pub const CONFIG_ENV: &str = "EPUB_BILINGUAL_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub prompts: PromptsSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineSection {
    /// Ordinal of the first narrative chapter; earlier chapters are front matter.
    #[serde(default)]
    pub first_narrative: Option<u32>,
    /// Optional dev-only limiter: process at most N chapters.
    #[serde(default)]
    pub max_chapters: Option<usize>,
    /// Chapters translated speculatively ahead of the commit point.
    #[serde(default)]
    pub lookahead: Option<usize>,

    #[serde(default)]
    pub max_chapter_attempts: Option<u32>,
    #[serde(default)]
    pub max_validation_attempts: Option<u32>,
    #[serde(default)]
    pub max_conflict_retries: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,

    #[serde(default)]
    pub summary_max_chars: Option<usize>,
    #[serde(default)]
    pub max_blocks_per_chunk: Option<usize>,
    #[serde(default)]
    pub max_chunk_chars: Option<usize>,
    #[serde(default)]
    pub intra_context_chunks: Option<usize>,
    #[serde(default)]
    pub edit_batch_blocks: Option<usize>,
    #[serde(default)]
    pub glossary_prompt_terms: Option<usize>,

    /// Checkpoint and exported state; default `<output stem>_state` next to the output.
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub trace_dir: Option<String>,
    #[serde(default)]
    pub trace_prompts: Option<bool>,
    #[serde(default)]
    pub log_level: Option<String>,
    /// `compact` or `json`.
    #[serde(default)]
    pub log_format: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ServiceSection {
    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub translate_model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub edit_model: Option<String>,
    #[serde(default)]
    pub glossary_model: Option<String>,
    #[serde(default)]
    pub character_model: Option<String>,
    #[serde(default)]
    pub summary_model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub edit_temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub translate: Option<String>,
    #[serde(default)]
    pub glossary: Option<String>,
    #[serde(default)]
    pub characters: Option<String>,
    #[serde(default)]
    pub edit: Option<String>,
    #[serde(default)]
    pub summary_init: Option<String>,
    #[serde(default)]
    pub summary_update: Option<String>,
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

/// `$EPUB_BILINGUAL_CONFIG`, then upwards from the cwd, the input's directory and the executable.
pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Some(p) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
        if p.exists() {
            return Some(p);
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text)
        .with_context(|| format!("parse config toml: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::{find_file_upwards, load_config};

    #[test]
    fn finds_config_in_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("x.toml"), "").expect("write");
        assert_eq!(
            find_file_upwards(&nested, "x.toml", 3),
            Some(dir.path().join("x.toml"))
        );
        assert_eq!(find_file_upwards(&nested, "x.toml", 1), None);
    }

    #[test]
    fn partial_config_parses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("epub-bilingual.toml");
        std::fs::write(
            &path,
            "[pipeline]\nfirst_narrative = 3\n\n[service]\ntranslate_model = \"m\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.pipeline.first_narrative, Some(3));
        assert_eq!(cfg.service.translate_model.as_deref(), Some("m"));
        assert!(cfg.prompts.edit.is_none());

        std::fs::write(&path, "[pipeline]\nfirst_narrative = \"x\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};

use crate::config::{find_default_config, load_config, AppConfig, DEFAULT_CONFIG_FILE};
use crate::logging::LogFormat;
use crate::pipeline::llm::LlmSettings;
use crate::pipeline::prompts::{default_prompt_files, PromptSet, DEFAULT_PROMPTS_DIR};
use crate::pipeline::transaction::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Command-line values that take precedence over the config file.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub first_narrative: Option<u32>,
    pub max_chapters: Option<usize>,
    pub lookahead: Option<usize>,
    pub state_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub workdir: PathBuf,
    pub config_path: PathBuf,

    pub first_narrative: u32,
    pub max_chapters: Option<usize>,
    pub lookahead: usize,
    pub retry: RetryPolicy,
    pub summary_max_chars: usize,

    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub llm: LlmSettings,

    pub state_dir: PathBuf,
    pub trace_dir: PathBuf,
    pub trace_prompts: bool,
    pub log_level: String,
    pub log_format: LogFormat,

    pub prompts: PromptSet,
}

impl PipelineConfig {
    pub fn from_paths_and_args(
        input: &Path,
        output: &Path,
        args: CliOverrides,
    ) -> anyhow::Result<Self> {
        let workdir = input
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let workdir = workdir.canonicalize().unwrap_or(workdir);

        let cfg_file = args
            .config
            .clone()
            .or_else(|| find_default_config(&workdir, DEFAULT_CONFIG_FILE));

        let mut file_cfg = AppConfig::default();
        if let Some(p) = cfg_file.as_ref() {
            if p.exists() {
                file_cfg = load_config(p)?;
            }
        }
        let cfg_path = cfg_file.unwrap_or_else(|| workdir.join(DEFAULT_CONFIG_FILE));
        let p = &file_cfg.pipeline;
        let s = &file_cfg.service;

        let output_dir = output
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map(|d| d.to_path_buf())
            .unwrap_or_else(|| workdir.clone());
        let resolve_dir = |configured: Option<&str>, default: String| {
            let dir = PathBuf::from(configured.unwrap_or(default.as_str()));
            if dir.is_absolute() {
                dir
            } else {
                output_dir.join(dir)
            }
        };
        let stem = output
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("book");
        let state_dir = args
            .state_dir
            .clone()
            .unwrap_or_else(|| resolve_dir(p.state_dir.as_deref(), format!("{stem}_state")));
        let trace_dir = resolve_dir(p.trace_dir.as_deref(), format!("{stem}_trace"));

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_chapter_attempts: p
                .max_chapter_attempts
                .unwrap_or(defaults.max_chapter_attempts)
                .max(1),
            max_validation_attempts: p
                .max_validation_attempts
                .unwrap_or(defaults.max_validation_attempts)
                .max(1),
            max_conflict_retries: p
                .max_conflict_retries
                .unwrap_or(defaults.max_conflict_retries),
            backoff_base: p
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: p
                .backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
        };

        let llm_defaults = LlmSettings::default();
        let translate_model = s
            .translate_model
            .clone()
            .unwrap_or(llm_defaults.translate_model);
        let model_or_translate = |m: &Option<String>| {
            m.as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| translate_model.clone())
        };
        let llm = LlmSettings {
            fallback_model: s
                .fallback_model
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            edit_model: model_or_translate(&s.edit_model),
            glossary_model: model_or_translate(&s.glossary_model),
            character_model: model_or_translate(&s.character_model),
            summary_model: model_or_translate(&s.summary_model),
            temperature: s.temperature.unwrap_or(llm_defaults.temperature),
            edit_temperature: s.edit_temperature.unwrap_or(llm_defaults.edit_temperature),
            max_tokens: s.max_tokens,
            max_blocks_per_chunk: p
                .max_blocks_per_chunk
                .unwrap_or(llm_defaults.max_blocks_per_chunk)
                .max(1),
            max_chunk_chars: p.max_chunk_chars.unwrap_or(llm_defaults.max_chunk_chars),
            intra_context_chunks: p
                .intra_context_chunks
                .unwrap_or(llm_defaults.intra_context_chunks),
            edit_batch_blocks: p
                .edit_batch_blocks
                .unwrap_or(llm_defaults.edit_batch_blocks)
                .max(1),
            glossary_prompt_terms: p
                .glossary_prompt_terms
                .unwrap_or(llm_defaults.glossary_prompt_terms),
            translate_model,
        };

        let api_key_env = s
            .api_key_env
            .clone()
            .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
        let api_key = std::env::var(&api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let prompts = PromptSet::load(&cfg_path, &file_cfg.prompts).context("load prompts")?;

        Ok(Self {
            first_narrative: args
                .first_narrative
                .or(p.first_narrative)
                .unwrap_or(1)
                .max(1),
            max_chapters: args.max_chapters.or(p.max_chapters).filter(|n| *n > 0),
            lookahead: args.lookahead.or(p.lookahead).unwrap_or(0),
            retry,
            summary_max_chars: p.summary_max_chars.unwrap_or(4000).max(1),
            base_url: s
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            timeout: Duration::from_secs(s.timeout_secs.unwrap_or(120).max(1)),
            llm,
            state_dir,
            trace_dir,
            trace_prompts: p.trace_prompts.unwrap_or(false),
            log_level: p.log_level.clone().unwrap_or_else(|| "info".to_string()),
            log_format: LogFormat::parse(p.log_format.as_deref()),
            prompts,
            workdir,
            config_path: cfg_path,
        })
    }

    /// Identity of everything that shapes model output; part of every chapter fingerprint.
    #[must_use]
    pub fn service_id(&self) -> String {
        let l = &self.llm;
        let mut hasher = Sha256::new();
        let mut field = |k: &str, v: &str| {
            hasher.update(k.as_bytes());
            hasher.update((v.len() as u64).to_le_bytes());
            hasher.update(v.as_bytes());
        };
        field("base_url", self.base_url.trim_end_matches('/'));
        field("translate_model", &l.translate_model);
        field("fallback_model", l.fallback_model.as_deref().unwrap_or(""));
        field("edit_model", &l.edit_model);
        field("glossary_model", &l.glossary_model);
        field("character_model", &l.character_model);
        field("summary_model", &l.summary_model);
        field("temperature", &l.temperature.to_string());
        field("edit_temperature", &l.edit_temperature.to_string());
        field("max_tokens", &format!("{:?}", l.max_tokens));
        field("max_blocks_per_chunk", &l.max_blocks_per_chunk.to_string());
        field("max_chunk_chars", &l.max_chunk_chars.to_string());
        field("intra_context_chunks", &l.intra_context_chunks.to_string());
        field("edit_batch_blocks", &l.edit_batch_blocks.to_string());
        field("glossary_prompt_terms", &l.glossary_prompt_terms.to_string());
        field("summary_max_chars", &self.summary_max_chars.to_string());
        field("first_narrative", &self.first_narrative.to_string());
        for (name, text) in self.prompts.texts() {
            field(name, text);
        }
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }
}

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(DEFAULT_CONFIG_FILE);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;

    for (fname, body) in default_prompt_files() {
        let p = prompts_dir.join(fname);
        if p.exists() && !force {
            continue;
        }
        std::fs::write(&p, body).with_context(|| format!("write prompt: {}", p.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

const DEFAULT_CONFIG_TOML: &str = r#"[pipeline]
# Chapters before this ordinal are front matter: translated literally,
# no glossary/character/summary changes, no editor pass.
first_narrative = 1
# max_chapters = 3
lookahead = 0

max_chapter_attempts = 3
max_validation_attempts = 3
max_conflict_retries = 8
backoff_base_ms = 2000
backoff_max_ms = 60000

summary_max_chars = 4000
max_blocks_per_chunk = 8
max_chunk_chars = 6000
intra_context_chunks = 2
edit_batch_blocks = 24
glossary_prompt_terms = 80

# state_dir = "book_state"
# trace_dir = "book_trace"
trace_prompts = false
log_level = "info"
log_format = "compact"

[service]
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"
translate_model = "gpt-4o-mini"
# fallback_model = "gpt-4o"
edit_model = "gpt-4o-mini"
glossary_model = "gpt-4o-mini"
character_model = "gpt-4o-mini"
summary_model = "gpt-4o-mini"
timeout_secs = 120
temperature = 0.2
edit_temperature = 0.3

[prompts]
translate = "prompts/translate.txt"
glossary = "prompts/glossary.json.txt"
characters = "prompts/characters.txt"
edit = "prompts/edit.txt"
summary_init = "prompts/summary_init.txt"
summary_update = "prompts/summary_update.txt"
"#;

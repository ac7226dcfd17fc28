pub mod book;
pub mod cache;
pub mod checkpoint;
mod config;
pub mod fingerprint;
pub mod invoker;
pub mod llm;
pub mod memory;
pub mod prompts;
pub mod state;
#[cfg(test)]
mod testkit;
pub mod trace;
pub mod transaction;
pub mod validate;

pub use book::{AbortedAt, BookOutcome, BookPipeline, CommittedBook};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{init_default_config, CliOverrides, PipelineConfig};
pub use invoker::{EditorInvoker, Services, SummaryInvoker, TranslationInvoker};
pub use llm::{LlmEditor, LlmSettings, LlmSummarizer, LlmTranslator};
pub use state::{NarrativeSnapshot, NarrativeStateStore};
pub use transaction::{CancelFlag, ChapterTransaction, RetryPolicy};

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{CommandFactory, Parser};
use tracing::info;

use epub_bilingual::epub::{assemble_file, segment, EpubPackage, SegmentOptions};
use epub_bilingual::logging::init_tracing;
use epub_bilingual::models::OpenAiChatClient;
use epub_bilingual::pipeline::memory::StateExport;
use epub_bilingual::pipeline::trace::TraceWriter;
use epub_bilingual::pipeline::{
    init_default_config, BookOutcome, BookPipeline, CliOverrides, FileCheckpointStore,
    LlmEditor, LlmSummarizer, LlmTranslator, PipelineConfig, Services,
};
use epub_bilingual::progress::ConsoleProgress;

#[derive(Parser, Debug)]
#[command(name = "epub-bilingual")]
#[command(about = "English EPUB to bilingual English/Vietnamese EPUB, one committed chapter at a time", long_about = None)]
struct Args {
    /// Generate default config + prompt files, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config/prompt files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing config/prompt files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Input .epub
    #[arg(value_name = "EPUB")]
    input: Option<PathBuf>,

    /// Output .epub (default: <input_stem>_bilingual.epub)
    #[arg(short, long, value_name = "EPUB")]
    output: Option<PathBuf>,

    /// Config file path (default: $EPUB_BILINGUAL_CONFIG, then epub-bilingual.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the segmented chapters and exit (no AI calls)
    #[arg(long)]
    list_chapters: bool,

    /// Ordinal of the first narrative chapter; earlier chapters are front matter
    #[arg(long, value_name = "N")]
    first_narrative: Option<u32>,

    /// Process at most N chapters (dev-only)
    #[arg(long, value_name = "N")]
    max_chapters: Option<usize>,

    /// Chapters translated speculatively ahead of the commit point
    #[arg(long, value_name = "N")]
    lookahead: Option<usize>,

    /// Checkpoint + exported state directory (default: <output_stem>_state)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let progress = ConsoleProgress::new(true);

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let input = match args.input {
        Some(p) => p,
        None => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  epub-bilingual <input.epub>\n\nTIPS:\n  - Run with --init-config to write epub-bilingual.toml and the prompt files.\n  - Re-running after an abort resumes from the last committed chapter.\n"
            );
            return Ok(());
        }
    };
    let output = match args.output {
        Some(p) => p,
        None => {
            let stem = input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output")
                .to_string();
            input.with_file_name(format!("{stem}_bilingual.epub"))
        }
    };

    let cfg = PipelineConfig::from_paths_and_args(
        &input,
        &output,
        CliOverrides {
            config: args.config,
            first_narrative: args.first_narrative,
            max_chapters: args.max_chapters,
            lookahead: args.lookahead,
            state_dir: args.state_dir,
        },
    )
    .context("build config")?;
    init_tracing(&cfg.log_level, cfg.log_format)?;
    info!(config = %cfg.config_path.display(), "configuration loaded");

    let pkg = EpubPackage::read(&input)?;
    let seg = segment(
        &pkg,
        &SegmentOptions {
            first_narrative: cfg.first_narrative,
            max_chapters: cfg.max_chapters,
        },
    )
    .with_context(|| format!("segment {}", input.display()))?;

    if args.list_chapters {
        for (ch, doc) in seg.book.chapters().iter().zip(&seg.documents) {
            println!(
                "{:>4}  {:<12} {:>5} blocks  {}  {}",
                ch.ordinal,
                ch.kind.as_str(),
                ch.blocks.len(),
                doc.path,
                ch.title.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let chat = OpenAiChatClient::new(&cfg.base_url, cfg.api_key.clone(), cfg.timeout)?;
    let trace = TraceWriter::new(cfg.trace_dir.clone(), cfg.trace_prompts)?;
    let translator = LlmTranslator::new(&chat, &cfg.llm, &cfg.prompts, &trace);
    let editor = LlmEditor::new(&chat, &cfg.llm, &cfg.prompts, &trace);
    let summarizer = LlmSummarizer::new(&chat, &cfg.llm, &cfg.prompts, &trace);
    let service_id = cfg.service_id();
    let services = Services {
        translator: &translator,
        editor: &editor,
        summarizer: &summarizer,
        service_id: &service_id,
    };

    std::fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("create state dir: {}", cfg.state_dir.display()))?;
    let checkpoints = FileCheckpointStore::new(cfg.checkpoint_path());

    progress.info(format!(
        "{} chapters, endpoint {}, checkpoint {}",
        seg.book.len(),
        chat.endpoint(),
        cfg.checkpoint_path().display()
    ));
    let pipeline = BookPipeline::new(services, &checkpoints)
        .with_policy(cfg.retry.clone())
        .with_summary_max_chars(cfg.summary_max_chars)
        .with_lookahead(cfg.lookahead)
        .with_progress(&progress)
        .with_state_export(StateExport::new(cfg.state_dir.clone()));

    match pipeline.run(&seg.book)? {
        BookOutcome::Committed(book) => {
            assemble_file(&pkg, &seg, &book, &output)?;
            progress.info(format!(
                "done: {} ({} chapters, {} replayed from checkpoint)",
                output.display(),
                book.chapters.len(),
                book.replayed()
            ));
            Ok(())
        }
        BookOutcome::Aborted(at) => Err(anyhow!(
            "chapter {} aborted after {} attempts: {} (last committed chapter: {}; re-run to resume)",
            at.ordinal,
            at.attempts,
            at.reason,
            at.last_committed
        )),
    }
}

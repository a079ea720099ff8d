//! CLI binary for medingest.
//!
//! A thin shim over the library crate: runs intake and then drains both
//! queues in-process, with uploads and renditions kept in a local directory
//! and records held in memory for the duration of the run. The extracted
//! records are printed as JSON and saved next to the renditions so `status`
//! can report on them later.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use medingest::backend::{Backends, LlmInference, LocalObjectStore, ObjectStore};
use medingest::model::{DocumentId, Fact, FactFamily, ObjectLocation, Page, Subject};
use medingest::pipeline::input;
use medingest::pipeline::render::{self, PdfiumRasterizer};
use medingest::query::{DocumentProgress, Reconciliation};
use medingest::{Pipeline, PipelineConfig, PipelineObserver, Stage, Upload};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// One bar for the document; pages tick it as they reach a terminal state,
/// in whatever order the workers finish them.
struct CliObserver {
    bar: ProgressBar,
    errors: AtomicUsize,
    throttled: AtomicUsize,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Intake");
        bar.set_message("Counting pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
            throttled: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst);
        let throttled = self.throttled.load(Ordering::SeqCst);
        let done = self.bar.position();
        if errors == 0 {
            eprintln!("{} {} pages processed", green("✔"), bold(&done.to_string()));
        } else {
            eprintln!(
                "{} {} pages finished  ({} errors)",
                cyan("⚠"),
                bold(&done.to_string()),
                red(&errors.to_string())
            );
        }
        if throttled > 0 {
            eprintln!("   {}", dim(&format!("{throttled} throttled calls retried")));
        }
    }
}

impl PipelineObserver for CliObserver {
    fn on_document_registered(&self, _doc: DocumentId, total_pages: u32) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(u64::from(total_pages));
        self.bar.set_prefix("Extracting");
        self.bar.set_message("");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Registered document with {total_pages} pages"))
        ));
    }

    fn on_page_converted(&self, _doc: DocumentId, ordinal: u32, _total: u32) {
        self.bar.set_message(format!("rendered page {ordinal}"));
    }

    fn on_page_processed(&self, _doc: DocumentId, ordinal: u32, total: u32, facts: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            green("✓"),
            ordinal,
            total,
            dim(&format!("{facts:>3} facts")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, _doc: DocumentId, ordinal: u32, stage: Stage, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {}  {}",
            red("✗"),
            ordinal,
            dim(stage.as_str()),
            red(&msg),
        ));
        self.bar.inc(1);
    }

    fn on_throttled(&self, _doc: DocumentId, ordinal: u32, attempt: u32, delay: Duration) {
        self.throttled.fetch_add(1, Ordering::SeqCst);
        self.bar.set_message(format!(
            "page {ordinal} throttled (attempt {attempt}), retrying in {:.1}s",
            delay.as_secs_f64()
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest a local file; renditions and records land in ./medingest-out
  medingest ingest AlexDoe_MedicalRecords.pdf

  # Ingest from a URL with a specific model
  medingest ingest --model gpt-4.1 --provider openai https://example.org/records.pdf

  # Page count only (no API key needed)
  medingest inspect AlexDoe_MedicalRecords.pdf

  # Progress of an earlier run
  medingest status 6f1c2a7e-5d0b-5c39-9a51-2f4de1e0b8a3

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_PROVIDER      Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium (falls back to the system library)
  RUST_LOG                Log filter, e.g. medingest=debug
"#;

/// Ingest medical PDFs into structured records using a vision LLM.
#[derive(Parser, Debug)]
#[command(
    name = "medingest",
    version,
    about = "Ingest medical PDFs into structured records using a vision LLM",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory for uploads, renditions and saved records.
    #[arg(long, global = true, env = "MEDINGEST_OUTPUT_DIR", default_value = "medingest-out")]
    output_dir: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "MEDINGEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "MEDINGEST_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run intake, conversion and extraction for one PDF.
    Ingest(IngestArgs),
    /// Print the page count of a PDF and how it was determined.
    Inspect {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
    },
    /// Show saved progress for a document ingested earlier.
    Status {
        /// Document id printed by `ingest`.
        document_id: DocumentId,
    },
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// LLM model ID (e.g. gpt-4.1-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "MEDINGEST_DPI", default_value_t = 144,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Work items processed at once.
    #[arg(short, long, env = "MEDINGEST_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Local attempts per inference call while throttled.
    #[arg(long, env = "MEDINGEST_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Delay before a failed work item is redelivered, in seconds.
    #[arg(long, env = "MEDINGEST_REDELIVERY_DELAY", default_value_t = 60)]
    redelivery_delay: u64,

    /// Payload ceiling for the lossy rendition, in bytes.
    #[arg(long, env = "MEDINGEST_PAYLOAD_CEILING")]
    payload_ceiling: Option<usize>,

    /// Path to a text file containing a custom system preamble.
    #[arg(long, env = "MEDINGEST_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per page.
    #[arg(long, env = "MEDINGEST_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "MEDINGEST_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "MEDINGEST_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-page LLM call timeout in seconds.
    #[arg(long, env = "MEDINGEST_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "MEDINGEST_NO_PROGRESS")]
    no_progress: bool,
}

/// Everything extracted from one document, as printed and saved.
#[derive(Serialize)]
struct DocumentSnapshot {
    progress: DocumentProgress,
    reconciliation: Reconciliation,
    subject: Option<Subject>,
    pages: Vec<Page>,
    medications: Vec<Fact>,
    diagnoses: Vec<Fact>,
    test_results: Vec<Fact>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless -v is given.
    let show_progress = match &cli.command {
        Command::Ingest(args) => !cli.quiet && !args.no_progress,
        _ => false,
    };
    let filter = if cli.verbose {
        "medingest=debug,info"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Ingest(args) => ingest(&cli, args, show_progress).await,
        Command::Inspect { input } => inspect(input).await,
        Command::Status { document_id } => status(&cli.output_dir, *document_id).await,
    }
}

async fn ingest(cli: &Cli, args: &IngestArgs, show_progress: bool) -> Result<()> {
    let observer = show_progress.then(CliObserver::new);
    let config = build_config(args, observer.clone()).await?;

    let upload = input::load_upload(&args.input, args.download_timeout)
        .await
        .context("Failed to load upload")?;

    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&cli.output_dir));
    let location = ObjectLocation::new("uploads", upload.filename.as_str());
    objects
        .put(&location, upload.bytes, "application/pdf")
        .await
        .context("Failed to store upload")?;

    let inference = LlmInference::from_config(&config).context("Failed to set up LLM provider")?;
    let mut backends = Backends::in_memory(Arc::new(inference), Arc::new(PdfiumRasterizer::new()));
    backends.objects = objects;

    let pipeline = Pipeline::new(backends, config);
    let intake = pipeline
        .ingest(&Upload::new(location))
        .await
        .context("Intake failed")?;
    let report = pipeline.drain().await.context("Processing failed")?;

    if let Some(ref obs) = observer {
        obs.finish();
    }

    let document_id = intake.document.id;
    let snapshot = snapshot(&pipeline, document_id).await?;
    let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialise records")?;

    let saved = snapshot_path(&cli.output_dir, document_id);
    if let Some(parent) = saved.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&saved, &json)
        .await
        .with_context(|| format!("Failed to write {}", saved.display()))?;

    println!("{json}");

    if !cli.quiet {
        eprintln!(
            "{}  {}/{} pages  {} redelivered  {} dead-lettered  →  {}",
            if snapshot.progress.confirmed_complete {
                green("✔")
            } else {
                cyan("⚠")
            },
            snapshot.progress.actual_processed,
            snapshot.progress.total_pages,
            report.redelivered,
            report.dead_lettered,
            bold(&saved.display().to_string()),
        );
        eprintln!("   document id {}", dim(&document_id.to_string()));
    }
    Ok(())
}

async fn snapshot(pipeline: &Pipeline, document_id: DocumentId) -> Result<DocumentSnapshot> {
    let query = pipeline.query();
    let document = query.document(document_id).await?;
    let subject = match document.subject.resolved() {
        Some(id) => Some(query.subject(id).await?),
        None => None,
    };

    let facts = |family| {
        let query = query.clone();
        let subject_id = document.subject.resolved();
        async move {
            let facts = query.document_facts(document_id, family).await?;
            Ok::<_, anyhow::Error>(match subject_id {
                Some(id) => facts.into_iter().map(|f| f.resolved_to(id)).collect(),
                None => facts,
            })
        }
    };

    Ok(DocumentSnapshot {
        progress: query.document_progress(document_id).await?,
        reconciliation: query.reconcile(document_id).await?,
        subject,
        pages: query.document_pages(document_id).await?,
        medications: facts(FactFamily::Medication).await?,
        diagnoses: facts(FactFamily::Diagnosis).await?,
        test_results: facts(FactFamily::TestResult).await?,
    })
}

fn snapshot_path(output_dir: &Path, document_id: DocumentId) -> PathBuf {
    output_dir.join("records").join(format!("{document_id}.json"))
}

async fn inspect(input_str: &str) -> Result<()> {
    let upload = input::load_upload(input_str, 120)
        .await
        .context("Failed to load PDF")?;
    let size = upload.bytes.len();
    let (pages, source) = render::count_pages(
        Arc::new(PdfiumRasterizer::new()),
        Arc::new(upload.bytes),
        PipelineConfig::default().fallback_bytes_per_page,
    )
    .await;

    println!("File:         {}", upload.origin);
    println!("Size:         {} bytes", size);
    println!("Pages:        {}", pages);
    println!("Counted by:   {:?}", source);
    Ok(())
}

async fn status(output_dir: &Path, document_id: DocumentId) -> Result<()> {
    let path = snapshot_path(output_dir, document_id);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("No saved records for {document_id} at {}", path.display()))?;
    let saved: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("Corrupt record file {}", path.display()))?;

    let Some(progress) = saved.get("progress") else {
        bail!("Record file {} has no progress section", path.display());
    };
    println!(
        "{}",
        serde_json::to_string_pretty(progress).context("Failed to serialise progress")?
    );
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(args: &IngestArgs, observer: Option<Arc<CliObserver>>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .dpi(args.dpi)
        .concurrency(args.concurrency)
        .max_attempts(args.max_attempts)
        .redelivery_delay_ms(args.redelivery_delay.saturating_mul(1000))
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .api_timeout_secs(args.api_timeout);

    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(bytes) = args.payload_ceiling {
        builder = builder.payload_ceiling(bytes);
    }
    if let Some(ref path) = args.system_prompt {
        let preamble = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_preamble(preamble);
    }
    if let Some(obs) = observer {
        builder = builder.observer(obs as Arc<dyn PipelineObserver>);
    }

    builder.build().context("Invalid configuration")
}

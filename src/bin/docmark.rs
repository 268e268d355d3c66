//! CLI binary for docmark.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use docmark::pipeline::input::resolve_input;
use docmark::{
    ConversionOutput, ConversionProgressCallback, DocError, FormatTag, Pipeline, PipelineConfig,
    ProgressCallback, RawInput,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

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

// ── CLI progress callback using indicatif ────────────────────────────────

/// Progress bar over the documents of a batch. Documents finish out of
/// order, so each line names its input.
struct CliProgressCallback {
    bar: ProgressBar,
    names: Vec<String>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new(names: Vec<String>) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} documents  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(names.len() as u64);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            names,
            errors: AtomicUsize::new(0),
        })
    }

    fn name(&self, index: usize) -> &str {
        self.names.get(index).map(String::as_str).unwrap_or("?")
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_document_start(&self, _index: usize, _total: usize, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn on_document_complete(&self, index: usize, _total: usize, markdown_len: usize) {
        self.bar.println(format!(
            "  {} {:<40}  {}",
            green("✓"),
            self.name(index),
            dim(&format!("{markdown_len:>7} bytes")),
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, index: usize, _total: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let first_line = error.lines().next().unwrap_or(error);
        let msg = if first_line.chars().count() > 80 {
            format!("{}\u{2026}", first_line.chars().take(79).collect::<String>())
        } else {
            first_line.to_string()
        };
        self.bar
            .println(format!("  {} {:<40}  {}", red("✗"), self.name(index), red(&msg)));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, success_count: usize) {
        self.bar.finish_and_clear();
        let failed = total.saturating_sub(success_count);
        if failed == 0 {
            eprintln!("{} {} documents converted", green("✔"), bold(&success_count.to_string()));
        } else {
            eprintln!(
                "{} {}/{} documents converted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Canonical Markdown on stdout
  docmark report.docx

  # Several inputs into a directory, with a durable cache
  docmark a.pdf b.html c.md -o out/ --cache-dir ~/.cache/docmark

  # Link concepts to Wikipedia and keep the alias table between runs
  docmark --link --alias-file aliases.json notes.md --json

  # Store the result as a new version of a logical document
  docmark --store-dir store/ --store-id handbook handbook.html

  # Report the title of every page the document links to
  docmark --fetch-links README.md -o README.canonical.md

  # Only report the detected format
  docmark --sniff-only mystery.bin

ENVIRONMENT VARIABLES:
  RUST_LOG                 Log filter (overrides -v / -q)
  DOCMARK_CACHE_DIR        Durable cache root
  DOCMARK_STORE_DIR        Artifact store root
  DOCMARK_LOOKUP_ENDPOINT  MediaWiki API endpoint
"#;

/// Normalise documents into canonical Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "docmark",
    version,
    about = "Normalise PDF, DOCX, HTML, Markdown and text into canonical Markdown",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file paths or HTTP/HTTPS URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Output file (one input) or directory (several inputs).
    #[arg(short, long, env = "DOCMARK_OUTPUT")]
    output: Option<PathBuf>,

    /// Force a format instead of sniffing: pdf, docx, html, markdown, plaintext.
    #[arg(long, value_parser = parse_format)]
    format: Option<FormatTag>,

    /// Print the detected format and exit.
    #[arg(long)]
    sniff_only: bool,

    /// Link concept mentions to reference entries.
    #[arg(long, env = "DOCMARK_LINK")]
    link: bool,

    /// MediaWiki API endpoint used for linking.
    #[arg(long, env = "DOCMARK_LOOKUP_ENDPOINT")]
    lookup_endpoint: Option<String>,

    /// Minimum fuzzy score for accepting a reference candidate.
    #[arg(long, default_value_t = 0.88)]
    threshold: f64,

    /// Runner-up score distance below which a term is ambiguous.
    #[arg(long, default_value_t = 0.02)]
    margin: f64,

    /// Distinct terms resolved per document.
    #[arg(long, default_value_t = 200)]
    max_terms: usize,

    /// Fetch title and description of each outbound link and report them on stderr.
    #[arg(long)]
    fetch_links: bool,

    /// Outbound links fetched concurrently from one host.
    #[arg(long, default_value_t = 2)]
    per_host: usize,

    /// JSON file holding the alias table.
    #[arg(long, env = "DOCMARK_ALIAS_FILE")]
    alias_file: Option<PathBuf>,

    /// Durable cache directory.
    #[arg(long, env = "DOCMARK_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// In-memory cache entries.
    #[arg(long, default_value_t = 256)]
    cache_capacity: usize,

    /// Artifact store directory; results are stored when set.
    #[arg(long, env = "DOCMARK_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Logical id to store under (default: the input string). One input only.
    #[arg(long, requires = "store_dir")]
    store_id: Option<String>,

    /// Documents converted concurrently.
    #[arg(short, long, env = "DOCMARK_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Output structured JSON (ConversionOutput) instead of Markdown.
    #[arg(long)]
    json: bool,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, default_value_t = 120)]
    download_timeout: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_format(s: &str) -> Result<FormatTag, String> {
    match FormatTag::from_name(s) {
        Some(FormatTag::Unknown) | None => Err(format!(
            "unknown format '{s}' (expected pdf, docx, html, markdown or plaintext)"
        )),
        Some(tag) => Ok(tag),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && cli.inputs.len() > 1;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    if cli.store_id.is_some() && cli.inputs.len() > 1 {
        anyhow::bail!("--store-id needs exactly one input");
    }

    // ── Resolve inputs ───────────────────────────────────────────────────
    let mut inputs = Vec::with_capacity(cli.inputs.len());
    for raw in &cli.inputs {
        let input = resolve_input(raw, cli.download_timeout, concat!("docmark/", env!("CARGO_PKG_VERSION")))
            .await
            .with_context(|| format!("Failed to read '{raw}'"))?;
        inputs.push(input);
    }

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new(cli.inputs.clone()) as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let pipeline = Pipeline::new(build_config(&cli, progress)?).context("Failed to set up pipeline")?;

    // ── Sniff-only mode ──────────────────────────────────────────────────
    if cli.sniff_only {
        for (name, input) in cli.inputs.iter().zip(&inputs) {
            println!("{}\t{}", pipeline.sniff(input), name);
        }
        return Ok(());
    }

    // ── Convert ──────────────────────────────────────────────────────────
    let results = run(&pipeline, cli.format, inputs).await;

    let mut outputs: Vec<(String, ConversionOutput)> = Vec::new();
    let mut failures = 0usize;
    for (name, result) in cli.inputs.iter().zip(results) {
        match result {
            Ok(out) => outputs.push((name.clone(), out)),
            Err(e) => {
                failures += 1;
                if !show_progress {
                    eprintln!("{} {}: [{}] {}", red("✗"), name, e.stage(), e);
                }
            }
        }
    }

    // ── Store ────────────────────────────────────────────────────────────
    if cli.store_dir.is_some() {
        for (name, out) in &outputs {
            let id = cli.store_id.as_deref().unwrap_or(name);
            let record = pipeline
                .store(&out.document, id)
                .await
                .with_context(|| format!("Failed to store '{name}'"))?;
            if !cli.quiet {
                eprintln!("{} stored '{}' → {}", green("✔"), id, dim(&record.location));
            }
        }
    }

    // ── Outbound link metadata ───────────────────────────────────────────
    if cli.fetch_links {
        for (name, out) in &outputs {
            let fetched = pipeline.fetch_links(&out.links).await;
            if cli.quiet {
                continue;
            }
            eprintln!(
                "{} {}: {} link(s), {} unreachable",
                cyan("↗"),
                bold(name),
                fetched.total_attempted(),
                fetched.errors.len()
            );
            for meta in &fetched.links {
                eprintln!(
                    "  {} {}  {}",
                    green("✔"),
                    meta.title.as_deref().unwrap_or("(untitled)"),
                    dim(&meta.url)
                );
            }
            for err in &fetched.errors {
                eprintln!("  {} {}  {}", red("✗"), err.url, dim(&err.error.to_string()));
            }
        }
    }

    // ── Emit ─────────────────────────────────────────────────────────────
    emit(&cli, &outputs)?;

    if pipeline.save_aliases().context("Failed to save alias table")? && cli.verbose {
        eprintln!("{}", dim("alias table saved"));
    }

    if !cli.quiet && !show_progress {
        for (name, out) in &outputs {
            eprintln!(
                "{} {}  {}  {} mentions ({} resolved)  {}ms",
                green("✔"),
                bold(name),
                dim(&format!("{} via {:?}", out.format, out.cache)),
                out.stats.mentions_total,
                out.stats.mentions_resolved,
                out.stats.total_duration_ms,
            );
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} inputs failed", cli.inputs.len());
    }
    Ok(())
}

async fn run(
    pipeline: &Pipeline,
    format: Option<FormatTag>,
    inputs: Vec<RawInput>,
) -> Vec<Result<ConversionOutput, DocError>> {
    match format {
        None => pipeline.convert_batch(inputs).await,
        Some(tag) => {
            let mut results = Vec::with_capacity(inputs.len());
            for input in inputs {
                results.push(pipeline.convert_as(input, tag).await);
            }
            results
        }
    }
}

fn emit(cli: &Cli, outputs: &[(String, ConversionOutput)]) -> Result<()> {
    if cli.json {
        let docs: Vec<&ConversionOutput> = outputs.iter().map(|(_, o)| o).collect();
        let json = if docs.len() == 1 {
            serde_json::to_string_pretty(docs[0])
        } else {
            serde_json::to_string_pretty(&docs)
        }
        .context("Failed to serialise output")?;
        match &cli.output {
            Some(path) => write_file(path, &json)?,
            None => println!("{json}"),
        }
        return Ok(());
    }

    match (&cli.output, cli.inputs.len()) {
        (None, _) => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            for (_, out) in outputs {
                handle
                    .write_all(out.markdown().as_bytes())
                    .context("Failed to write to stdout")?;
            }
        }
        (Some(path), 1) => {
            if let Some((_, out)) = outputs.first() {
                write_file(path, out.markdown())?;
            }
        }
        (Some(dir), _) => {
            for (name, out) in outputs {
                write_file(&dir.join(output_name(name)), out.markdown())?;
            }
        }
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

/// `docs/report.pdf` → `report.md`; URLs use their last path segment.
fn output_name(input: &str) -> String {
    let last = input
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    let stem = Path::new(last)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| last.to_string());
    format!("{stem}.md")
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .concurrency(cli.concurrency)
        .cache_capacity(cli.cache_capacity)
        .link_concepts(cli.link)
        .acceptance_threshold(cli.threshold)
        .ambiguity_margin(cli.margin)
        .max_terms_per_document(cli.max_terms)
        .link_fetch_per_host(cli.per_host)
        .download_timeout_secs(cli.download_timeout);

    if let Some(dir) = &cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    if let Some(dir) = &cli.store_dir {
        builder = builder.store_dir(dir);
    }
    if let Some(path) = &cli.alias_file {
        builder = builder.alias_path(path);
    }
    if let Some(endpoint) = &cli.lookup_endpoint {
        builder = builder.lookup_endpoint(endpoint);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

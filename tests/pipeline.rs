//! Integration tests for the conversion pipeline.
//!
//! Everything here runs offline: reference lookups are scripted through the
//! `ReferenceLookup` trait and retries run on a clock that never sleeps.

use async_trait::async_trait;
use docmark::{
    canonicalize, AliasEntry, AliasTable, CacheSource, DocError, Extractor, ExtractorKind,
    FormatTag, LookupError, MemoryBackend, MentionState, Pipeline, PipelineConfig,
    RawInput, ReferenceCandidate, ReferenceLookup, RejectReason, RetryPolicy, Sleeper, Stage,
};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test doubles ─────────────────────────────────────────────────────────────

/// Never sleeps; remembers what it was asked to wait.
#[derive(Default)]
struct InstantSleeper {
    delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// Lookup answering from a fixed table and counting calls per term.
#[derive(Default)]
struct TableLookup {
    answers: HashMap<String, Result<Vec<ReferenceCandidate>, LookupError>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl TableLookup {
    fn with(mut self, term: &str, answer: Result<Vec<ReferenceCandidate>, LookupError>) -> Self {
        self.answers.insert(term.to_string(), answer);
        self
    }

    fn calls(&self, term: &str) -> usize {
        self.calls.lock().unwrap().get(term).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ReferenceLookup for TableLookup {
    async fn lookup(&self, term: &str) -> Result<Vec<ReferenceCandidate>, LookupError> {
        *self.calls.lock().unwrap().entry(term.to_string()).or_default() += 1;
        self.answers.get(term).cloned().unwrap_or_else(|| {
            Err(LookupError::NotFound {
                term: term.to_string(),
            })
        })
    }

    fn name(&self) -> &str {
        "table"
    }
}

fn candidate(id: &str, title: &str) -> ReferenceCandidate {
    ReferenceCandidate {
        id: id.into(),
        title: title.into(),
        summary: String::new(),
    }
}

fn linking_pipeline(lookup: Arc<TableLookup>, config: PipelineConfig) -> Pipeline {
    Pipeline::builder(config)
        .lookup(lookup)
        .sleeper(Arc::new(InstantSleeper::default()))
        .build()
        .unwrap()
}

fn retrying_config(attempts: u32) -> PipelineConfig {
    PipelineConfig::builder()
        .lookup_retry(RetryPolicy::immediate(attempts))
        .build()
        .unwrap()
}

fn html(body: &str) -> RawInput {
    RawInput::from_bytes(body.as_bytes().to_vec(), "page.html")
}

fn docx(document_xml: &str) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::SimpleFileOptions::default();
    zip.start_file("[Content_Types].xml", opts).unwrap();
    zip.write_all(br#"<?xml version="1.0"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#)
        .unwrap();
    zip.start_file("word/document.xml", opts).unwrap();
    zip.write_all(document_xml.as_bytes()).unwrap();
    zip.finish().unwrap().into_inner()
}

// ── Canonical dialect ────────────────────────────────────────────────────────

#[tokio::test]
async fn html_heading_is_rebased_and_bold_is_fixed() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let out = pipeline
        .convert(html("<h2>Intro</h2><p>Hello <b>World</b></p>"))
        .await
        .unwrap();
    assert_eq!(out.format, FormatTag::Html);
    assert_eq!(out.markdown(), "# Intro\n\nHello **World**\n");
    assert_eq!(out.document.metadata.title.as_deref(), Some("Intro"));
}

#[tokio::test]
async fn formats_converge_on_one_dialect() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let from_html = pipeline
        .convert(html("<h3>Plan</h3><p>Ship <strong>it</strong> <i>today</i></p><ul><li>one</li><li>two</li></ul>"))
        .await
        .unwrap();
    let from_md = pipeline
        .convert(RawInput::from_bytes(
            b"## Plan\n\nShip __it__ _today_\n\n* one\n* two\n".to_vec(),
            "plan.md",
        ))
        .await
        .unwrap();
    let from_docx = pipeline
        .convert(RawInput::from_bytes(
            docx(concat!(
                r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>"#,
                r#"<w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Plan</w:t></w:r></w:p>"#,
                r#"<w:p><w:r><w:t xml:space="preserve">Ship </w:t></w:r><w:r><w:rPr><w:b/></w:rPr><w:t>it</w:t></w:r>"#,
                r#"<w:r><w:t xml:space="preserve"> </w:t></w:r><w:r><w:rPr><w:i/></w:rPr><w:t>today</w:t></w:r></w:p>"#,
                r#"<w:p><w:pPr><w:numPr><w:ilvl w:val="0"/><w:numId w:val="1"/></w:numPr></w:pPr><w:r><w:t>one</w:t></w:r></w:p>"#,
                r#"<w:p><w:pPr><w:numPr><w:ilvl w:val="0"/><w:numId w:val="1"/></w:numPr></w:pPr><w:r><w:t>two</w:t></w:r></w:p>"#,
                r#"</w:body></w:document>"#
            )),
            "plan.docx",
        ))
        .await
        .unwrap();

    let expected = "# Plan\n\nShip **it** *today*\n\n- one\n- two\n";
    assert_eq!(from_html.markdown(), expected);
    assert_eq!(from_md.markdown(), expected);
    assert_eq!(from_docx.format, FormatTag::Docx);
    assert_eq!(from_docx.markdown(), expected);
}

#[test]
fn canonicalize_is_deterministic() {
    let input = html(
        "<h1>T</h1><p>a  <em>b</em>\n c</p><table><tr><th>x</th></tr><tr><td>1|2</td></tr></table><pre><code>```\nraw\n```</code></pre>",
    );
    let intermediate = Extractor::new(ExtractorKind::Html).extract(&input).unwrap();
    let first = canonicalize(&intermediate).unwrap();
    let second = canonicalize(&intermediate).unwrap();
    assert_eq!(first.markdown, second.markdown);
    assert_eq!(first.content_hash, second.content_hash);
}

#[tokio::test]
async fn failures_name_their_stage() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();

    let unknown = pipeline
        .convert(RawInput::from_bytes(vec![0x00, 0xff, 0x00, 0xfe], "blob"))
        .await
        .unwrap_err();
    assert_eq!(unknown.stage(), Stage::Sniff);

    let broken = pipeline
        .convert_as(RawInput::from_bytes(b"PK\x03\x04 truncated".to_vec(), "x.docx"), FormatTag::Docx)
        .await
        .unwrap_err();
    assert_eq!(broken.stage(), Stage::Extract);
    assert!(matches!(broken, DocError::Extraction { format: FormatTag::Docx, .. }));
    assert!(!broken.is_retryable());
}

#[test]
fn missing_path_fails_at_input() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let err = tokio_test::block_on(pipeline.convert_path("/nonexistent/nowhere.pdf")).unwrap_err();
    assert!(matches!(err, DocError::FileNotFound { .. }));
    assert_eq!(err.stage(), Stage::Input);
}

/// Canonical Markdown read back as Markdown must render to itself.
async fn assert_fixed_point(pipeline: &Pipeline, input: RawInput, expected: &str) {
    let first = pipeline.convert(input).await.unwrap();
    assert_eq!(first.markdown(), expected);
    let again = pipeline
        .convert(RawInput::from_bytes(first.markdown().as_bytes().to_vec(), "again.md"))
        .await
        .unwrap();
    assert_eq!(again.format, FormatTag::Markdown);
    assert_eq!(again.markdown(), expected);
}

#[tokio::test]
async fn html_significant_text_survives_reingest() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    assert_fixed_point(
        &pipeline,
        html("<p>text with &lt;div&gt; tag, AT&amp;T and &amp;amp;</p>"),
        "text with \\<div> tag, AT&T and \\&amp;\n",
    )
    .await;
}

#[tokio::test]
async fn emphasis_next_to_punctuation_survives_reingest() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    assert_fixed_point(&pipeline, html("<p><b>foo.</b>bar</p>"), "**foo**.bar\n").await;
    assert_fixed_point(&pipeline, html("<p>x<b>(a)</b>y</p>"), "x(**a**)y\n").await;
    assert_fixed_point(
        &pipeline,
        html("<h2>Plan</h2><p>Ship <strong>it</strong>, <i>today!</i></p>"),
        "# Plan\n\nShip **it**, *today!*\n",
    )
    .await;
}

#[tokio::test]
async fn text_mentioning_pdf_header_is_not_a_pdf() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let note = RawInput::from_bytes(
        b"# PDF internals\n\nEvery file starts with `%PDF-1.7` and a binary comment.\n".to_vec(),
        "notes.md",
    );
    assert_eq!(pipeline.sniff(&note), FormatTag::Markdown);
    let out = pipeline.convert(note).await.unwrap();
    assert_eq!(
        out.markdown(),
        "# PDF internals\n\nEvery file starts with `%PDF-1.7` and a binary comment.\n"
    );

    let plain = RawInput::from_bytes(b"hello %PDF- world".to_vec(), "a.txt");
    assert_eq!(pipeline.sniff(&plain), FormatTag::PlainText);
}

// ── Cache ────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_conversions_compute_once() {
    let pipeline = Arc::new(Pipeline::new(PipelineConfig::default()).unwrap());
    let body = "<p>shared paragraph</p>".repeat(500);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let input = html(&body);
            tokio::spawn(async move { pipeline.convert(input).await })
        })
        .collect();

    let mut hashes = Vec::new();
    for h in handles {
        hashes.push(h.await.unwrap().unwrap().document.content_hash.clone());
    }
    hashes.dedup();
    assert_eq!(hashes.len(), 1);
    assert_eq!(pipeline.cache_stats().computations, 1);
}

#[tokio::test]
async fn bumping_extractor_version_misses_the_durable_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = || PipelineConfig::builder().cache_dir(dir.path()).build().unwrap();
    let input = RawInput::from_bytes(b"# Cached\n\nbody\n".to_vec(), "c.md");

    let first = Pipeline::new(config()).unwrap();
    assert_eq!(first.convert(input.clone()).await.unwrap().cache, CacheSource::Computed);

    let restarted = Pipeline::new(config()).unwrap();
    assert_eq!(restarted.convert(input.clone()).await.unwrap().cache, CacheSource::Durable);

    let bumped = Pipeline::builder(config())
        .extractor(Extractor::new(ExtractorKind::Markdown).with_version(3))
        .build()
        .unwrap();
    let out = bumped.convert(input).await.unwrap();
    assert_eq!(out.cache, CacheSource::Computed);
    assert_eq!(out.document.metadata.extractor_version, 3);
    let superseded = format!("v2.d{}", docmark::DIALECT_VERSION);
    assert!(!dir.path().join("markdown-cmark").join(superseded).exists());
}

// ── Store ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn identical_content_is_one_blob_with_two_records() {
    let backend = Arc::new(MemoryBackend::new());
    let pipeline = Pipeline::builder(PipelineConfig::default())
        .backend(backend.clone())
        .build()
        .unwrap();
    let out = pipeline.convert(html("<p>same</p>")).await.unwrap();

    let a = pipeline.store(&out.document, "alpha").await.unwrap();
    let b = pipeline.store(&out.document, "beta").await.unwrap();
    assert_ne!(a.logical_id, b.logical_id);
    assert_eq!(a.location, b.location);
    assert_eq!(backend.blob_count(), 1);
    assert_eq!(backend.record_count(), 2);
}

#[tokio::test]
async fn reingest_under_new_name_hits_cache_and_shares_location() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(PipelineConfig::builder().store_dir(dir.path()).build().unwrap()).unwrap();
    let bytes = b"<h1>Report</h1><p>Numbers.</p>".to_vec();

    let first = pipeline
        .ingest(RawInput::from_bytes(bytes.clone(), "report.html"), "report")
        .await
        .unwrap();
    let second = pipeline
        .ingest(RawInput::from_bytes(bytes, "report-copy.html"), "report")
        .await
        .unwrap();

    assert_eq!(first.output.cache, CacheSource::Computed);
    assert_eq!(second.output.cache, CacheSource::Memory);
    assert_eq!(pipeline.cache_stats().computations, 1);
    assert_eq!(first.record.location, second.record.location);

    let latest = pipeline.fetch("report").await.unwrap().unwrap();
    assert_eq!(latest, second.record);
}

// ── Concept linking ──────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_lookups_degrade_to_unresolved() {
    let lookup = Arc::new(TableLookup::default().with(
        "grace hopper",
        Err(LookupError::Transient("connection reset".into())),
    ));
    let pipeline = linking_pipeline(lookup.clone(), retrying_config(3));

    let out = pipeline
        .convert(html("<p>Grace Hopper wrote compilers.</p>"))
        .await
        .unwrap();
    assert_eq!(out.mentions.len(), 1);
    match &out.mentions[0].state {
        MentionState::Unresolved { attempts, last_error } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(last_error, Some(LookupError::Transient(_))));
        }
        other => panic!("expected unresolved, got {other:?}"),
    }
    assert_eq!(lookup.calls("grace hopper"), 3);
    assert_eq!(out.stats.mentions_unresolved, 1);
    assert_eq!(out.markdown(), "Grace Hopper wrote compilers.\n");
}

#[tokio::test]
async fn resolved_terms_are_looked_up_once() {
    let lookup = Arc::new(
        TableLookup::default().with("ada lovelace", Ok(vec![candidate("27", "Ada Lovelace")])),
    );
    let pipeline = linking_pipeline(lookup.clone(), retrying_config(3));

    let out = pipeline
        .convert(html("<p>Ada Lovelace met Babbage, and then Ada Lovelace's notes were published.</p>"))
        .await
        .unwrap();
    let ada: Vec<_> = out
        .mentions
        .iter()
        .filter(|m| m.normalized == "ada lovelace")
        .collect();
    assert_eq!(ada.len(), 2);
    assert!(ada.iter().all(|m| matches!(
        &m.state,
        MentionState::Resolved { reference_id, confidence, .. } if reference_id == "27" && *confidence > 0.99
    )));
    assert!(ada[0].start < ada[1].start);
    assert_eq!(lookup.calls("ada lovelace"), 1);

    // A later document resolves from the alias table.
    let again = pipeline
        .convert(html("<p>Ada Lovelace again.</p>"))
        .await
        .unwrap();
    assert!(again.mentions[0].state.is_resolved());
    assert_eq!(lookup.calls("ada lovelace"), 1);
    assert_eq!(pipeline.linker_stats().unwrap().alias_hits, 1);
}

#[tokio::test]
async fn ambiguous_and_missing_terms_are_rejected() {
    let lookup = Arc::new(TableLookup::default().with(
        "mercury",
        Ok(vec![candidate("1", "Mercury (planet)"), candidate("2", "Mercury (element)")]),
    ));
    let pipeline = linking_pipeline(lookup.clone(), retrying_config(3));

    let out = pipeline
        .convert(RawInput::from_bytes(
            b"Mercury is near Zyxwvut.".to_vec(),
            "note.txt",
        ))
        .await
        .unwrap();
    let by_term: HashMap<_, _> = out
        .mentions
        .iter()
        .map(|m| (m.normalized.as_str(), &m.state))
        .collect();
    assert!(matches!(
        by_term["mercury"],
        MentionState::Rejected { reason: RejectReason::Ambiguous { candidates } } if candidates.len() == 2
    ));
    assert!(matches!(
        by_term["zyxwvut"],
        MentionState::Rejected { reason: RejectReason::NotFound }
    ));
    // Permanent outcomes are not retried.
    assert_eq!(lookup.total_calls(), 2);
    assert_eq!(out.stats.mentions_rejected, 2);
}

#[tokio::test]
async fn code_and_links_are_not_concepts() {
    let lookup = Arc::new(TableLookup::default());
    let pipeline = linking_pipeline(lookup.clone(), retrying_config(1));
    let out = pipeline
        .convert(RawInput::from_bytes(
            b"Call `HashMap` via [the docs](https://Docs.Example.com/Page).\n\n```\nStruct Name\n```\n".to_vec(),
            "code.md",
        ))
        .await
        .unwrap();
    let terms: Vec<&str> = out.mentions.iter().map(|m| m.surface.as_str()).collect();
    assert_eq!(terms, vec!["Call"]);
    assert_eq!(out.links.len(), 1);
    assert_eq!(out.links[0].url, "https://Docs.Example.com/Page");
}

#[tokio::test]
async fn alias_table_persists_between_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let alias_path = dir.path().join("aliases.json");
    let config = || {
        PipelineConfig::builder()
            .alias_path(&alias_path)
            .lookup_retry(RetryPolicy::immediate(1))
            .build()
            .unwrap()
    };

    let lookup = Arc::new(
        TableLookup::default().with("alan turing", Ok(vec![candidate("t", "Alan Turing")])),
    );
    let first = linking_pipeline(lookup.clone(), config());
    first.convert(html("<p>Alan Turing</p>")).await.unwrap();
    assert!(first.save_aliases().unwrap());

    let offline = Arc::new(TableLookup::default());
    let second = linking_pipeline(offline.clone(), config());
    let out = second.convert(html("<p>Alan Turing, again</p>")).await.unwrap();
    assert!(out.mentions[0].state.is_resolved());
    assert_eq!(offline.total_calls(), 0);
}

#[tokio::test]
async fn shared_alias_table_is_explicit() {
    let aliases = Arc::new(AliasTable::new());
    aliases.insert(
        "Rust",
        AliasEntry {
            reference_id: "r".into(),
            title: "Rust (programming language)".into(),
        },
    );
    let lookup = Arc::new(TableLookup::default());
    let with_shared = Pipeline::builder(retrying_config(1))
        .lookup(lookup.clone())
        .aliases(Arc::clone(&aliases))
        .build()
        .unwrap();
    let isolated = linking_pipeline(lookup.clone(), retrying_config(1));

    let doc = || RawInput::from_bytes(b"Rust is fast.".to_vec(), "r.txt");
    assert!(with_shared.convert(doc()).await.unwrap().mentions[0].state.is_resolved());
    assert!(!isolated.convert(doc()).await.unwrap().mentions[0].state.is_resolved());
    assert_eq!(lookup.calls("rust"), 1);
}

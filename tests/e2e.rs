//! End-to-end tests against live Wikipedia.
//!
//! Gated behind the `E2E_ENABLED` environment variable so they do not run in
//! CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 cargo test --test e2e -- --nocapture

use docmark::{MentionState, Pipeline, PipelineConfig, RawInput};

macro_rules! e2e_skip_unless_enabled {
    () => {
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
    };
}

fn live_pipeline() -> Pipeline {
    let config = PipelineConfig::builder()
        .link_concepts(true)
        .build()
        .expect("valid config");
    Pipeline::new(config).expect("pipeline")
}

#[tokio::test]
async fn test_links_well_known_people() {
    e2e_skip_unless_enabled!();
    let _ = tracing_subscriber::fmt().with_env_filter("docmark=debug").try_init();

    let pipeline = live_pipeline();
    let html = "<h1>Computing pioneers</h1><p>Ada Lovelace corresponded with Charles Babbage.</p>";
    let out = pipeline
        .convert(RawInput::from_bytes(html.as_bytes().to_vec(), "pioneers.html"))
        .await
        .expect("conversion");

    println!("{}", out.markdown());
    for m in &out.mentions {
        println!("  {:<20} {:?}", m.surface, m.state);
    }

    let ada = out
        .mentions
        .iter()
        .find(|m| m.normalized == "ada lovelace")
        .expect("Ada Lovelace is a candidate");
    assert!(
        matches!(&ada.state, MentionState::Resolved { title, .. } if title == "Ada Lovelace"),
        "unexpected state {:?}",
        ada.state
    );
}

#[tokio::test]
async fn test_alias_table_avoids_second_lookup() {
    e2e_skip_unless_enabled!();

    let pipeline = live_pipeline();
    let doc = || RawInput::from_bytes(b"Alan Turing".to_vec(), "t.txt");
    pipeline.convert(doc()).await.expect("first");
    let before = pipeline.linker_stats().expect("linking enabled");
    pipeline.convert(doc()).await.expect("second");
    let after = pipeline.linker_stats().expect("linking enabled");

    if before.resolved > 0 {
        assert_eq!(after.lookups, before.lookups);
        assert_eq!(after.alias_hits, before.alias_hits + 1);
    }
}

#[tokio::test]
async fn test_remote_html_page() {
    e2e_skip_unless_enabled!();

    let pipeline = Pipeline::new(PipelineConfig::default()).expect("pipeline");
    let out = pipeline
        .convert_path("https://example.com/")
        .await
        .expect("download and convert");
    assert!(out.markdown().contains("Example Domain"));
    assert!(out.markdown().ends_with('\n'));
}

//! Outbound link metadata fetching against a local mock server.

use async_trait::async_trait;
use docmark::{
    FetchConfig, FetchError, Link, LinkFetcher, Pipeline, PipelineConfig, RawInput, RetryPolicy,
    Sleeper,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

fn fetcher(attempts: u32) -> LinkFetcher {
    let config = FetchConfig {
        retry: RetryPolicy::immediate(attempts),
        ..FetchConfig::default()
    };
    LinkFetcher::new("docmark-tests/0", config, Arc::new(NoSleep)).unwrap()
}

fn link(server: &MockServer, route: &str) -> Link {
    Link {
        url: format!("{}{}", server.uri(), route),
        text: route.trim_start_matches('/').to_string(),
    }
}

fn html_page(title: &str, description: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        format!(
            "<html><head><title>{title}</title><meta name=\"description\" content=\"{description}\"></head><body>x</body></html>"
        ),
        "text/html; charset=utf-8",
    )
}

#[tokio::test]
async fn reads_title_and_description() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/guide"))
        .respond_with(html_page("The Guide", "Everything in one place."))
        .expect(1)
        .mount(&server)
        .await;

    let result = fetcher(3).fetch_all(&[link(&server, "/guide")]).await;
    assert!(!result.has_errors());
    assert_eq!(result.links.len(), 1);
    assert_eq!(result.links[0].url, format!("{}/guide", server.uri()));
    assert_eq!(result.links[0].title.as_deref(), Some("The Guide"));
    assert_eq!(result.links[0].description.as_deref(), Some("Everything in one place."));
}

#[tokio::test]
async fn non_html_targets_have_no_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.json"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{\"title\":\"no\"}", "application/json"))
        .mount(&server)
        .await;

    let result = fetcher(3).fetch_all(&[link(&server, "/data.json")]).await;
    assert_eq!(result.links.len(), 1);
    assert_eq!(result.links[0].title, None);
    assert_eq!(result.links[0].description, None);
}

#[tokio::test]
async fn dead_links_are_collected_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(html_page("Fine", "Still here."))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let result = fetcher(3)
        .fetch_all(&[link(&server, "/gone"), link(&server, "/ok")])
        .await;
    assert!(result.has_errors());
    assert_eq!(result.total_attempted(), 2);
    assert_eq!(result.links[0].title.as_deref(), Some("Fine"));
    assert_eq!(result.errors[0].url, format!("{}/gone", server.uri()));
    assert_eq!(result.errors[0].attempts, 1);
    assert!(matches!(result.errors[0].error, FetchError::Permanent(_)));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(html_page("Back", "Recovered."))
        .with_priority(2)
        .mount(&server)
        .await;

    let meta = fetcher(3).fetch(&format!("{}/flaky", server.uri())).await.unwrap();
    assert_eq!(meta.title.as_deref(), Some("Back"));
}

#[tokio::test]
async fn rate_limits_exhaust_into_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .expect(2)
        .mount(&server)
        .await;

    let err = fetcher(2).fetch(&format!("{}/busy", server.uri())).await.unwrap_err();
    assert_eq!(err.attempts, 2);
    assert_eq!(err.error, FetchError::RateLimited { retry_after_secs: Some(1) });
}

#[tokio::test]
async fn one_host_sees_at_most_per_host_requests() {
    let server = MockServer::start().await;
    let delay = Duration::from_millis(150);
    Mock::given(method("GET"))
        .respond_with(html_page("Page", "A page.").set_delay(delay))
        .expect(6)
        .mount(&server)
        .await;

    // Six requests to one host, two at a time: at least three delays.
    let links: Vec<Link> = (0..6).map(|i| link(&server, &format!("/p{i}"))).collect();
    let started = Instant::now();
    let result = fetcher(1).fetch_all(&links).await;
    assert_eq!(result.links.len(), 6);
    assert!(started.elapsed() >= delay * 3, "took {:?}", started.elapsed());
}

#[tokio::test]
async fn pipeline_fetches_links_of_a_conversion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/format"))
        .respond_with(html_page("Format notes", "How the format works."))
        .mount(&server)
        .await;

    let config = PipelineConfig::builder()
        .link_fetch_retry(RetryPolicy::immediate(2))
        .build()
        .unwrap();
    let pipeline = Pipeline::builder(config).sleeper(Arc::new(NoSleep)).build().unwrap();

    let md = format!("Read [the format notes]({}/format) and [the missing page]({}/missing).\n", server.uri(), server.uri());
    let out = pipeline
        .convert(RawInput::from_bytes(md.into_bytes(), "readme.md"))
        .await
        .unwrap();
    assert_eq!(out.links.len(), 2);

    let fetched = pipeline.fetch_links(&out.links).await;
    assert_eq!(fetched.total_attempted(), 2);
    assert_eq!(fetched.links[0].title.as_deref(), Some("Format notes"));
    assert_eq!(fetched.errors.len(), 1);
    assert!(fetched.errors[0].url.ends_with("/missing"));
}

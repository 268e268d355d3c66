//! Streaming conversion API: emit documents as they complete.
//!
//! Unlike [`crate::Pipeline::convert_batch`], which returns only after every
//! input finishes, [`convert_stream`] yields each result as soon as it is
//! ready. Items arrive in completion order and carry their input index; sort
//! by it if order matters.

use crate::convert::Pipeline;
use crate::error::DocError;
use crate::output::ConversionOutput;
use crate::pipeline::input::RawInput;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// A conversion result tagged with the position of its input.
#[derive(Debug)]
pub struct DocumentResult {
    pub index: usize,
    pub result: Result<ConversionOutput, DocError>,
}

/// A boxed stream of document results borrowing the pipeline.
pub type DocumentStream<'a> = Pin<Box<dyn Stream<Item = DocumentResult> + Send + 'a>>;

/// Convert `inputs` concurrently (up to `config.concurrency`), streaming
/// results in completion order.
///
/// # Example
/// ```rust,no_run
/// use docmark::{convert_stream, Pipeline, PipelineConfig, RawInput};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = Pipeline::new(PipelineConfig::default())?;
/// let inputs = vec![RawInput::from_bytes(b"# One".to_vec(), "one.md")];
/// let mut results = convert_stream(&pipeline, inputs);
/// while let Some(item) = results.next().await {
///     match item.result {
///         Ok(out) => println!("#{}: {} bytes", item.index, out.markdown().len()),
///         Err(e) => eprintln!("#{}: {e}", item.index),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn convert_stream(pipeline: &Pipeline, inputs: Vec<RawInput>) -> DocumentStream<'_> {
    let concurrency = pipeline.config().concurrency;
    info!(
        "Starting streaming conversion of {} documents (concurrency {})",
        inputs.len(),
        concurrency
    );
    let s = stream::iter(inputs.into_iter().enumerate().map(move |(index, input)| async move {
        DocumentResult {
            index,
            result: pipeline.convert(input).await,
        }
    }))
    .buffer_unordered(concurrency);
    Box::pin(s)
}

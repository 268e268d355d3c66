//! Progress-callback trait for batch conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as [`crate::Pipeline::convert_batch`] works through its inputs.
//!
//! # Example
//!
//! ```rust
//! use docmark::{ConversionProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_document_complete(&self, index: usize, total: usize, markdown_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Document {}/{} done ({} bytes)", index + 1, total, markdown_len);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it converts each document of a batch.
///
/// Documents are converted concurrently, so every method may be called from
/// several tasks at once. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once before any document is converted.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when conversion of a document begins.
    ///
    /// # Arguments
    /// * `index`: 0-based position in the batch
    /// * `total`: batch size
    /// * `name`: filename hint or a placeholder
    fn on_document_start(&self, index: usize, total: usize, name: &str) {
        let _ = (index, total, name);
    }

    /// Called when a document converted successfully.
    fn on_document_complete(&self, index: usize, total: usize, markdown_len: usize) {
        let _ = (index, total, markdown_len);
    }

    /// Called when a document failed.
    fn on_document_error(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// Called once after every document has been attempted.
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

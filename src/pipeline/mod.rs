//! Pipeline stages for document normalisation.
//!
//! Each submodule implements one transformation step and is testable on
//! its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ sniff ──▶ extract ──▶ canonical ──▶ postprocess
//! (bytes)   (format)  (blocks)    (markdown)    (cleanup)
//! ```
//!
//! 1. [`input`]     raw bytes from memory, a local path or a URL
//! 2. [`sniff`]     magic bytes first, then declared hints, then structure
//! 3. [`extract`]   per-format parsing into a [`document::IntermediateDocument`]
//! 4. [`canonical`] deterministic rendering into the canonical dialect
//! 5. [`postprocess`] whitespace and invisible-character rules that never
//!    touch fenced code

pub mod canonical;
pub mod document;
pub mod extract;
pub mod input;
pub mod postprocess;
pub mod sniff;

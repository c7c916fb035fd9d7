//! Imaging study ingestion and faceted search.
//!
//! The crate wires a DICOM-web archive to a search engine: uploads land in
//! the archive, a pipeline fetches the study hierarchy and indexes one
//! denormalized document per study, and the search side compiles faceted
//! queries against that index. `aktina-server` owns the HTTP surface; this
//! crate implements its provider traits.

pub mod archive;
pub mod cli;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod search;
pub mod thumbs;

#[doc(hidden)]
pub mod testing;

pub use error::AppError;

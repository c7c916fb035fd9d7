//! Document-search engine boundary. The engine owns analyzers, storage and
//! index schemas; this crate only upserts documents and executes compiled
//! requests against it.

pub mod elastic;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use elastic::ElasticEngine;

/// A fully compiled search request body, ready to execute as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub body: JsonValue,
}

impl EngineRequest {
    pub fn new(body: JsonValue) -> Self {
        Self { body }
    }
}

/// Engine response reduced to what the orchestrator consumes: hit sources in
/// rank order, the raw aggregation tree, and the total match count.
#[derive(Debug, Clone, Default)]
pub struct EngineResponse {
    pub hits: Vec<JsonValue>,
    pub aggregations: JsonValue,
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("search engine request failed{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Request {
        status: Option<u16>,
        message: String,
    },
    #[error("malformed search engine response: {0}")]
    Malformed(String),
}

impl EngineError {
    pub fn request(status: Option<u16>, message: impl Into<String>) -> Self {
        EngineError::Request {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::request(err.status().map(|code| code.as_u16()), err.to_string())
    }
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Insert-or-overwrite by id. Re-indexing a study must replace, never
    /// duplicate.
    async fn upsert(&self, index: &str, id: &str, document: &JsonValue)
        -> Result<(), EngineError>;

    async fn search(&self, index: &str, request: &EngineRequest)
        -> Result<EngineResponse, EngineError>;
}

//! Application-level error type shared across the binary and services.

use thiserror::Error;

use crate::archive::TransportError;
use crate::config::AppConfigError;
use crate::engine::EngineError;
use crate::fetch::RetrievalError;
use crate::pipeline::IngestError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Server(#[from] aktina_server::ServerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("search failed: {0}")]
    Search(String),
}

pub mod config;
pub mod ingest;
pub mod search;
mod server;

pub use config::ServerConfig;
pub use ingest::{IngestProvider, JobEvent, JobEventStream, JobSnapshot, JobStateTag};
pub use search::{
    ApiError, ApiErrorKind, FacetBucket, StudyHit, StudySearchProvider, StudySearchQuery,
    StudySearchResult, DEFAULT_PAGE_SIZE, PAGE_SIZE_MAX,
};
pub use server::{build_api_router, serve, ApiState, ServerError};

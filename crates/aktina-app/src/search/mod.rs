//! Search orchestration: compile the request, run it against the engine,
//! and shape the response into facets plus enriched hits.

use std::collections::BTreeMap;
use std::sync::Arc;

use aktina_server::{
    ApiError, FacetBucket, StudyHit, StudySearchProvider, StudySearchQuery, StudySearchResult,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::engine::SearchEngine;
use crate::query::{self, QueryError};
use crate::thumbs::ThumbnailResolver;

/// The HTTP surface's search provider. Holds the engine connection and the
/// thumbnail resolver; queries never touch the archive except to render
/// missing thumbnails.
#[derive(Clone)]
pub struct SearchService {
    engine: Arc<dyn SearchEngine>,
    thumbnails: ThumbnailResolver,
    index: String,
}

impl SearchService {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        thumbnails: ThumbnailResolver,
        index: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            thumbnails,
            index: index.into(),
        }
    }
}

#[async_trait]
impl StudySearchProvider for SearchService {
    async fn search(&self, query: StudySearchQuery) -> Result<StudySearchResult, ApiError> {
        let request = query::compile(&query).map_err(|err| match err {
            QueryError::MissingSearchTerm => {
                ApiError::invalid_param("search", "a search term is required")
            }
        })?;
        let response = self
            .engine
            .search(&self.index, &request)
            .await
            .map_err(|err| {
                warn!(error = %err, "search engine query failed");
                ApiError::internal("search backend unavailable")
            })?;
        debug!(hits = response.hits.len(), total = response.total, "search executed");

        let mut facets = BTreeMap::new();
        facets.insert(
            "category".to_string(),
            buckets_at(&response.aggregations, &["category", "termAgg", "buckets"]),
        );
        facets.insert(
            "gender".to_string(),
            buckets_at(&response.aggregations, &["gender", "buckets"]),
        );

        let mut studies = Vec::with_capacity(response.hits.len());
        for source in &response.hits {
            let Some(uid) = source.get("uid").and_then(JsonValue::as_str) else {
                warn!("search hit without a uid, skipping");
                continue;
            };
            studies.push(StudyHit {
                id: uid.to_string(),
                thumbnail: self.thumbnails.resolve(uid).await,
                report: report_text(source),
            });
        }

        Ok(StudySearchResult {
            facets,
            studies,
            total: response.total,
        })
    }
}

/// Walks an aggregation tree down `path` and converts the bucket array.
/// Absent or malformed levels yield an empty facet, never an error.
fn buckets_at(aggregations: &JsonValue, path: &[&str]) -> Vec<FacetBucket> {
    let mut node = aggregations;
    for step in path {
        match node.get(step) {
            Some(next) => node = next,
            None => return Vec::new(),
        }
    }
    node.as_array()
        .map(|buckets| {
            buckets
                .iter()
                .filter_map(|bucket| {
                    let key = match bucket.get("key") {
                        Some(JsonValue::String(key)) => key.clone(),
                        Some(other) => other.to_string(),
                        None => return None,
                    };
                    let count = bucket.get("doc_count").and_then(JsonValue::as_u64)?;
                    Some(FacetBucket { key, count })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn report_text(source: &JsonValue) -> String {
    source
        .pointer("/report/Records/FULLTEXT")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

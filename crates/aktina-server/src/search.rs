use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{de::Deserializer, Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const PAGE_SIZE_MAX: usize = 100;

/// Faceted study search request, bound straight from the query string.
///
/// `gender` and `category` accept comma-separated lists so they fit in a
/// single query parameter; the sentinel value `UNKNOWN` in `gender` selects
/// documents with no recorded gender at all.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySearchQuery {
    pub search: String,
    pub modality: Option<String>,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub gender: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub category: Vec<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl StudySearchQuery {
    pub fn limit_or_default(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(PAGE_SIZE_MAX)
    }

    pub fn offset_or_default(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// One facet bucket: a field value and the number of matching documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetBucket {
    pub key: String,
    pub count: u64,
}

/// One enriched study hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyHit {
    pub id: String,
    pub thumbnail: Option<String>,
    pub report: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudySearchResult {
    pub facets: BTreeMap<String, Vec<FacetBucket>>,
    pub studies: Vec<StudyHit>,
    pub total: u64,
}

#[async_trait]
pub trait StudySearchProvider: Send + Sync + 'static {
    async fn search(&self, query: StudySearchQuery) -> Result<StudySearchResult, ApiError>;
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    pub field: Option<String>,
}

impl ApiError {
    pub fn invalid_param(field: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            kind: ApiErrorKind::InvalidParameter,
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            kind: ApiErrorKind::NotFound {
                resource: resource.into(),
            },
            message: message.into(),
            field: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError {
            kind: ApiErrorKind::Internal,
            message: message.into(),
            field: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ApiErrorKind {
    InvalidParameter,
    NotFound { resource: String },
    Internal,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_lists_split_on_commas() {
        let query: StudySearchQuery =
            serde_json::from_str(r#"{"search":"lung","gender":"M, UNKNOWN","category":""}"#)
                .expect("query deserializes");
        assert_eq!(query.gender, vec!["M".to_string(), "UNKNOWN".to_string()]);
        assert!(query.category.is_empty());
    }

    #[test]
    fn pagination_defaults_apply() {
        let query = StudySearchQuery {
            search: "nodule".to_string(),
            ..Default::default()
        };
        assert_eq!(query.limit_or_default(), DEFAULT_PAGE_SIZE);
        assert_eq!(query.offset_or_default(), 0);
    }

    #[test]
    fn limit_is_clamped_to_max() {
        let query = StudySearchQuery {
            search: "nodule".to_string(),
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(query.limit_or_default(), PAGE_SIZE_MAX);
    }
}

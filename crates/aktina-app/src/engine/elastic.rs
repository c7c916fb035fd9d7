//! Elasticsearch-compatible HTTP client for the engine boundary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{EngineError, EngineRequest, EngineResponse, SearchEngine};

#[derive(Debug, Clone)]
pub struct ElasticEngine {
    base_url: Url,
    http: Client,
}

impl ElasticEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .map_err(|err| EngineError::request(None, format!("invalid engine url: {err}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, EngineError> {
        self.base_url
            .join(path)
            .map_err(|err| EngineError::request(None, format!("invalid engine path: {err}")))
    }
}

#[async_trait]
impl SearchEngine for ElasticEngine {
    async fn upsert(
        &self,
        index: &str,
        id: &str,
        document: &JsonValue,
    ) -> Result<(), EngineError> {
        let url = self.endpoint(&format!("{index}/_doc/{id}"))?;
        let response = self.http.put(url).json(document).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::request(
                Some(status.as_u16()),
                format!("upsert of `{id}` into `{index}` failed: {body}"),
            ));
        }
        debug!(%index, %id, "document upserted");
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        request: &EngineRequest,
    ) -> Result<EngineResponse, EngineError> {
        let url = self.endpoint(&format!("{index}/_search"))?;
        let response = self.http.post(url).json(&request.body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::request(
                Some(status.as_u16()),
                format!("search on `{index}` failed: {body}"),
            ));
        }
        let payload: JsonValue = response.json().await.map_err(EngineError::from)?;
        parse_search_response(payload)
    }
}

fn parse_search_response(payload: JsonValue) -> Result<EngineResponse, EngineError> {
    let hits_node = payload
        .get("hits")
        .ok_or_else(|| EngineError::Malformed("missing `hits`".to_string()))?;
    let total = hits_node
        .get("total")
        .and_then(|total| total.get("value"))
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| EngineError::Malformed("missing `hits.total.value`".to_string()))?;
    let hits = hits_node
        .get("hits")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|hit| hit.get("_source"))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let aggregations = payload
        .get("aggregations")
        .cloned()
        .unwrap_or(JsonValue::Null);
    Ok(EngineResponse {
        hits,
        aggregations,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_parsing_extracts_sources_and_total() {
        let payload = json!({
            "hits": {
                "total": { "value": 2, "relation": "eq" },
                "hits": [
                    { "_id": "a", "_source": { "uid": "a" } },
                    { "_id": "b", "_source": { "uid": "b" } }
                ]
            },
            "aggregations": { "gender": { "buckets": [] } }
        });
        let parsed = parse_search_response(payload).expect("parses");
        assert_eq!(parsed.total, 2);
        assert_eq!(parsed.hits.len(), 2);
        assert_eq!(parsed.hits[0]["uid"], json!("a"));
        assert!(parsed.aggregations.get("gender").is_some());
    }

    #[test]
    fn response_without_hits_is_malformed() {
        let err = parse_search_response(json!({})).expect_err("rejects");
        assert!(matches!(err, EngineError::Malformed(_)));
    }
}

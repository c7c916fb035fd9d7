//! Pure compiler from a structured study search into an engine request.
//!
//! Deliberately free of any engine client so the whole input space can be
//! exercised without a live backend. Relevance layout: one required fuzzy
//! OR multi-match, boosted phrase and all-terms variants as non-filtering
//! `should` clauses, and exact facet selections as non-scoring `filter`
//! clauses.

use aktina_server::search::StudySearchQuery;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::engine::EngineRequest;

/// Full-text body plus its precomputed partial-match companions, and the
/// per-instance attribute wildcard.
const FULLTEXT_FIELDS: [&str; 4] = [
    "report.Records.FULLTEXT",
    "report.Records.FULLTEXT.autocomplete",
    "report.Records.FULLTEXT.edge_ngram",
    "series.instances.metadata*",
];
const MODALITY_FIELD: &str = "series.modality.code";
const SUBJECT_FIELD: &str = "subject.reference";
const PATIENT_NAME_FIELD: &str = "metadata.00100010.Value";
const GENDER_FIELD: &str = "metadata.00100040.Value.keyword";
const STARTED_FIELD: &str = "started";
const CATEGORY_PATH: &str = "report.category";
const CATEGORY_NAME_FIELD: &str = "report.category.name";
const CATEGORY_KEYWORD_FIELD: &str = "report.category.name.keyword";
const HIGHLIGHT_FIELD: &str = "report.Records.FULLTEXT";
const HIGHLIGHT_PRE_TAG: &str = "<span class=\"highlight\">";
const HIGHLIGHT_POST_TAG: &str = "</span>";
const FACET_SIZE: usize = 100;

/// Bucket label used both for filtering on absent gender data and for the
/// aggregation's missing bucket, so the facet always accounts for
/// undocumented gender.
pub const GENDER_UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("no search query specified")]
    MissingSearchTerm,
}

struct MultiMatch<'a> {
    query: &'a str,
    match_type: Option<&'a str>,
    boost: u32,
    fuzziness: Option<u32>,
    operator: Option<&'a str>,
}

fn multi_match(params: MultiMatch<'_>) -> JsonValue {
    let mut clause = serde_json::Map::new();
    clause.insert("query".to_string(), json!(params.query));
    clause.insert("lenient".to_string(), json!(true));
    clause.insert("analyzer".to_string(), json!("standard"));
    clause.insert("fields".to_string(), json!(FULLTEXT_FIELDS));
    clause.insert("boost".to_string(), json!(params.boost));
    if let Some(match_type) = params.match_type {
        clause.insert("type".to_string(), json!(match_type));
    }
    if let Some(fuzziness) = params.fuzziness {
        clause.insert("fuzziness".to_string(), json!(fuzziness));
    }
    if let Some(operator) = params.operator {
        clause.insert("operator".to_string(), json!(operator));
    }
    json!({ "multi_match": clause })
}

fn keyed(outer: &str, field: &str, value: JsonValue) -> JsonValue {
    let mut inner = serde_json::Map::new();
    inner.insert(field.to_string(), value);
    let mut clause = serde_json::Map::new();
    clause.insert(outer.to_string(), JsonValue::Object(inner));
    JsonValue::Object(clause)
}

fn match_phrase(field: &str, query: &str) -> JsonValue {
    keyed("match_phrase", field, json!({ "query": query }))
}

fn match_terms(field: &str, value: &str) -> JsonValue {
    keyed("terms", field, json!([value]))
}

fn must_not_exist(field: &str) -> JsonValue {
    json!({ "bool": { "must_not": { "exists": { "field": field } } } })
}

fn query_string(fields: &[&str], query: &str) -> JsonValue {
    json!({ "query_string": { "fields": fields, "query": query } })
}

fn date_range(gte: Option<&str>, lte: Option<&str>) -> JsonValue {
    let mut bounds = serde_json::Map::new();
    if let Some(gte) = gte {
        bounds.insert("gte".to_string(), json!(gte));
    }
    if let Some(lte) = lte {
        bounds.insert("lte".to_string(), json!(lte));
    }
    keyed("range", STARTED_FIELD, JsonValue::Object(bounds))
}

fn wildcard(field: &str, value: &str) -> JsonValue {
    keyed("wildcard", field, json!({ "value": value }))
}

fn nested_category(category: &str) -> JsonValue {
    json!({
        "nested": {
            "path": CATEGORY_PATH,
            "query": {
                "bool": {
                    "must": [ match_phrase(CATEGORY_NAME_FIELD, category) ]
                }
            }
        }
    })
}

/// Compiles the structured query into a deterministic engine request.
/// No side effects, no I/O; identical input yields an identical body.
pub fn compile(query: &StudySearchQuery) -> Result<EngineRequest, QueryError> {
    let term = query.search.trim();
    if term.is_empty() {
        return Err(QueryError::MissingSearchTerm);
    }

    let mut must = vec![multi_match(MultiMatch {
        query: term,
        match_type: None,
        boost: 1,
        fuzziness: Some(1),
        operator: Some("or"),
    })];
    if let Some(modality) = non_empty(query.modality.as_deref()) {
        must.push(wildcard(MODALITY_FIELD, modality));
    }
    if let Some(patient_id) = non_empty(query.patient_id.as_deref()) {
        must.push(match_phrase(SUBJECT_FIELD, &format!("patient/{patient_id}")));
    }
    if let Some(patient_name) = non_empty(query.patient_name.as_deref()) {
        must.push(query_string(&[PATIENT_NAME_FIELD], patient_name));
    }
    let from_date = non_empty(query.from_date.as_deref());
    let to_date = non_empty(query.to_date.as_deref());
    if from_date.is_some() || to_date.is_some() {
        must.push(date_range(from_date, to_date));
    }

    let should = vec![
        multi_match(MultiMatch {
            query: term,
            match_type: Some("phrase"),
            boost: 3,
            fuzziness: None,
            operator: None,
        }),
        multi_match(MultiMatch {
            query: term,
            match_type: None,
            boost: 2,
            fuzziness: Some(1),
            operator: Some("and"),
        }),
    ];

    let mut filter = Vec::new();
    for gender in &query.gender {
        let gender = gender.trim();
        if gender.is_empty() {
            continue;
        }
        if gender == GENDER_UNKNOWN {
            filter.push(must_not_exist(GENDER_FIELD));
        } else {
            filter.push(match_terms(GENDER_FIELD, gender));
        }
    }
    for category in &query.category {
        let category = category.trim();
        if category.is_empty() {
            continue;
        }
        filter.push(nested_category(category));
    }

    let body = json!({
        "query": {
            "bool": {
                "must": must,
                "should": should,
                "filter": filter,
            }
        },
        "highlight": {
            "pre_tags": [HIGHLIGHT_PRE_TAG],
            "post_tags": [HIGHLIGHT_POST_TAG],
            "fields": keyed_highlight()
        },
        "aggs": {
            "category": {
                "nested": { "path": CATEGORY_PATH },
                "aggs": {
                    "termAgg": {
                        "terms": {
                            "field": CATEGORY_KEYWORD_FIELD,
                            "size": FACET_SIZE,
                        }
                    }
                }
            },
            "gender": {
                "terms": {
                    "field": GENDER_FIELD,
                    "size": FACET_SIZE,
                    "missing": GENDER_UNKNOWN,
                }
            }
        },
        "from": query.offset_or_default(),
        "size": query.limit_or_default(),
    });

    Ok(EngineRequest::new(body))
}

fn keyed_highlight() -> JsonValue {
    let mut fields = serde_json::Map::new();
    fields.insert(
        HIGHLIGHT_FIELD.to_string(),
        json!({ "number_of_fragments": 2, "fragment_size": 50 }),
    );
    JsonValue::Object(fields)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

//! DICOMweb client: QIDO-RS for hierarchy queries, WADO-RS for records and
//! rendered thumbnails, STOW-RS for bulk upload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use reqwest::{header, Client, Url};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{ArchiveClient, TransportError};

const STUDY_INSTANCE_UID: &str = "0020000D";
const SERIES_INSTANCE_UID: &str = "0020000E";
const SOP_INSTANCE_UID: &str = "00080018";
const RETRIEVE_URL: &str = "00081190";
const DICOM_JSON: &str = "application/dicom+json";
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DicomWebClient {
    base_url: Url,
    http: Client,
}

impl DicomWebClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .map_err(|err| TransportError::message(format!("invalid archive url: {err}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::message(format!("invalid archive path `{path}`: {err}")))
    }

    async fn get_json(&self, url: Url) -> Result<JsonValue, TransportError> {
        let response = self
            .http
            .get(url.clone())
            .header(header::ACCEPT, DICOM_JSON)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(JsonValue::Array(Vec::new()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                Some(status.as_u16()),
                format!("GET {url} failed: {body}"),
            ));
        }
        response.json().await.map_err(TransportError::from)
    }

    /// QIDO result sets come back as arrays; the narrowed fetches here want
    /// exactly the first record.
    async fn first_record(&self, url: Url) -> Result<JsonMap<String, JsonValue>, TransportError> {
        match self.get_json(url).await? {
            JsonValue::Array(mut items) if !items.is_empty() => match items.remove(0) {
                JsonValue::Object(map) => Ok(map),
                other => Err(TransportError::message(format!(
                    "unexpected archive record shape: {other}"
                ))),
            },
            JsonValue::Object(map) => Ok(map),
            _ => Err(TransportError::message("empty archive response")),
        }
    }

    fn uid_values(items: JsonValue, tag: &str) -> Vec<String> {
        let JsonValue::Array(items) = items else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| item.get(tag))
            .filter_map(|attr| attr.get("Value"))
            .filter_map(|values| values.get(0))
            .filter_map(JsonValue::as_str)
            .map(ToOwned::to_owned)
            .collect()
    }

    fn extract_study_id(url: &str) -> Option<String> {
        url.split("/studies/")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned)
    }
}

#[async_trait]
impl ArchiveClient for DicomWebClient {
    async fn upload(
        &self,
        files: &[PathBuf],
        progress: Option<mpsc::Sender<f64>>,
    ) -> Result<Vec<String>, TransportError> {
        let boundary = Uuid::new_v4().simple().to_string();
        let mut body: Vec<u8> = Vec::new();
        for path in files {
            let bytes = tokio::fs::read(path).await.map_err(|err| {
                TransportError::message(format!("failed to read {}: {err}", path.display()))
            })?;
            body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
            body.extend_from_slice(b"Content-Type: application/dicom\r\n\r\n");
            body.extend_from_slice(&bytes);
        }
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let total = body.len() as f64;
        let chunks: Vec<Bytes> = body
            .chunks(UPLOAD_CHUNK_BYTES)
            .map(Bytes::copy_from_slice)
            .collect();
        let body_stream = stream::iter(chunks.into_iter().scan(0usize, move |sent, chunk| {
            *sent += chunk.len();
            let fraction = (*sent as f64 / total).min(1.0);
            Some((chunk, fraction))
        }))
        .then({
            let progress = progress.clone();
            move |(chunk, fraction)| {
                let progress = progress.clone();
                async move {
                    if let Some(tx) = &progress {
                        let _ = tx.send(fraction).await;
                    }
                    Ok::<Bytes, std::io::Error>(chunk)
                }
            }
        });

        let url = self.endpoint("studies")?;
        let response = self
            .http
            .post(url.clone())
            .header(header::ACCEPT, DICOM_JSON)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; type=\"application/dicom\"; boundary={boundary}"),
            )
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                Some(status.as_u16()),
                format!("upload failed: {body}"),
            ));
        }

        let payload: JsonValue = response.json().await.map_err(TransportError::from)?;
        let retrieve_urls = payload
            .get(RETRIEVE_URL)
            .and_then(|attr| attr.get("Value"))
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let study_uids: Vec<String> = retrieve_urls
            .iter()
            .filter_map(JsonValue::as_str)
            .filter_map(Self::extract_study_id)
            .collect();
        debug!(count = study_uids.len(), "upload accepted");
        Ok(study_uids)
    }

    async fn fetch_metadata(
        &self,
        study_uid: &str,
        series_uid: Option<&str>,
        instance_uid: Option<&str>,
    ) -> Result<JsonMap<String, JsonValue>, TransportError> {
        debug_assert!(!(instance_uid.is_some() && series_uid.is_none()));
        let mut url = match (series_uid, instance_uid) {
            (Some(series), Some(_)) => {
                self.endpoint(&format!("studies/{study_uid}/series/{series}/instances"))?
            }
            (Some(_), None) => self.endpoint(&format!("studies/{study_uid}/series"))?,
            _ => self.endpoint("studies")?,
        };
        match (series_uid, instance_uid) {
            (Some(_), Some(instance)) => {
                url.query_pairs_mut().append_pair(SOP_INSTANCE_UID, instance);
            }
            (Some(series), None) => {
                url.query_pairs_mut()
                    .append_pair(SERIES_INSTANCE_UID, series);
            }
            _ => {
                url.query_pairs_mut()
                    .append_pair(STUDY_INSTANCE_UID, study_uid);
            }
        }
        self.first_record(url).await
    }

    async fn fetch_descriptor(
        &self,
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> Result<JsonMap<String, JsonValue>, TransportError> {
        let url = self.endpoint(&format!(
            "studies/{study_uid}/series/{series_uid}/instances/{instance_uid}/metadata"
        ))?;
        self.first_record(url).await
    }

    async fn list_series(&self, study_uid: &str) -> Result<Vec<String>, TransportError> {
        let url = self.endpoint(&format!("studies/{study_uid}/series"))?;
        Ok(Self::uid_values(
            self.get_json(url).await?,
            SERIES_INSTANCE_UID,
        ))
    }

    async fn list_instances(
        &self,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<Vec<String>, TransportError> {
        let url = self.endpoint(&format!("studies/{study_uid}/series/{series_uid}/instances"))?;
        Ok(Self::uid_values(self.get_json(url).await?, SOP_INSTANCE_UID))
    }

    async fn render_thumbnail(
        &self,
        study_uid: &str,
        out_dir: &Path,
    ) -> Result<PathBuf, TransportError> {
        let url = self.endpoint(&format!("studies/{study_uid}/rendered"))?;
        let response = self
            .http
            .get(url.clone())
            .header(header::ACCEPT, "image/jpeg")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::new(
                Some(status.as_u16()),
                format!("thumbnail render failed for study {study_uid}"),
            ));
        }
        let bytes = response.bytes().await.map_err(TransportError::from)?;
        tokio::fs::create_dir_all(out_dir).await.map_err(|err| {
            TransportError::message(format!("failed to create {}: {err}", out_dir.display()))
        })?;
        let path = out_dir.join(format!("{study_uid}.jpg"));
        tokio::fs::write(&path, &bytes).await.map_err(|err| {
            TransportError::message(format!("failed to write {}: {err}", path.display()))
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn study_id_comes_from_retrieve_url() {
        let url = "http://pacs.local/dicom-web/studies/1.2.840.1/series/9";
        assert_eq!(
            DicomWebClient::extract_study_id(url),
            Some("1.2.840.1".to_string())
        );
        assert_eq!(DicomWebClient::extract_study_id("http://pacs.local/"), None);
    }

    #[test]
    fn uid_values_reads_dicom_json_attributes() {
        let items = json!([
            { "0020000E": { "Value": ["1.1"] } },
            { "0020000E": { "Value": ["1.2"] } },
            { "other": {} }
        ]);
        assert_eq!(
            DicomWebClient::uid_values(items, SERIES_INSTANCE_UID),
            vec!["1.1".to_string(), "1.2".to_string()]
        );
    }
}

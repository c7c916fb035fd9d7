//! Remote image-archive access. The trait is the seam the fetcher and
//! pipeline are written against; `dicom_web` is the production client.

pub mod dicom_web;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::mpsc;

pub use dicom_web::DicomWebClient;

/// Wire-level archive failure carrying the HTTP-like status when one exists.
#[derive(Debug, Error)]
#[error("archive request failed{}: {message}", status_suffix(.status))]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.status().map(|code| code.as_u16()), err.to_string())
    }
}

/// Remote archive capability: bulk upload plus hierarchical metadata access.
///
/// All operations suspend on the wire and surface failures untouched; no
/// retry policy lives at this layer.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Uploads local files and returns the archive-assigned study UIDs they
    /// landed in. Collaborators that can observe transfer progress report
    /// fractions in `[0,1]` through `progress`; ones that cannot simply
    /// never send.
    async fn upload(
        &self,
        files: &[PathBuf],
        progress: Option<mpsc::Sender<f64>>,
    ) -> Result<Vec<String>, TransportError>;

    /// Query-level record for a study, series, or instance depending on how
    /// far the selector narrows.
    async fn fetch_metadata(
        &self,
        study_uid: &str,
        series_uid: Option<&str>,
        instance_uid: Option<&str>,
    ) -> Result<JsonMap<String, JsonValue>, TransportError>;

    /// Full technical record for a single instance.
    async fn fetch_descriptor(
        &self,
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> Result<JsonMap<String, JsonValue>, TransportError>;

    async fn list_series(&self, study_uid: &str) -> Result<Vec<String>, TransportError>;

    async fn list_instances(
        &self,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<Vec<String>, TransportError>;

    /// Renders a study thumbnail into `out_dir` and returns the written path.
    async fn render_thumbnail(
        &self,
        study_uid: &str,
        out_dir: &Path,
    ) -> Result<PathBuf, TransportError>;
}

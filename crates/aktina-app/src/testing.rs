//! In-memory doubles for the archive and search engine, shared by the unit
//! and end-to-end suites. Deterministic, no network, no timers.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::sync::mpsc;

use crate::archive::{ArchiveClient, TransportError};
use crate::engine::{EngineError, EngineRequest, EngineResponse, SearchEngine};

type StudyLayout = Vec<(String, Vec<String>)>;

/// Scripted archive: a fixed study hierarchy plus failure injection points.
/// Instance UIDs are generated as `{series}/I{n}` so a failure selector
/// names exactly one instance.
#[derive(Default)]
pub struct MockArchive {
    studies: Mutex<BTreeMap<String, StudyLayout>>,
    upload_plan: Mutex<Option<Vec<String>>>,
    upload_delay: Mutex<Option<std::time::Duration>>,
    fail_upload: AtomicBool,
    fail_render: AtomicBool,
    failed_studies: Mutex<HashSet<String>>,
    failed_instances: Mutex<HashSet<String>>,
    pub upload_calls: AtomicUsize,
    pub render_calls: AtomicUsize,
}

impl MockArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_study(study_uid: &str, series: &[(&str, usize)]) -> Self {
        let archive = Self::new();
        archive.add_study(study_uid, series);
        archive
    }

    pub fn add_study(&self, study_uid: &str, series: &[(&str, usize)]) {
        let layout = series
            .iter()
            .map(|(series_uid, count)| {
                let instances = (1..=*count)
                    .map(|n| format!("{series_uid}/I{n}"))
                    .collect();
                (series_uid.to_string(), instances)
            })
            .collect();
        self.studies
            .lock()
            .expect("studies lock")
            .insert(study_uid.to_string(), layout);
    }

    /// Overrides the study UIDs the next uploads report. By default an
    /// upload reports every registered study.
    pub fn plan_upload(&self, study_uids: &[&str]) {
        *self.upload_plan.lock().expect("plan lock") =
            Some(study_uids.iter().map(|uid| uid.to_string()).collect());
    }

    /// Makes uploads sleep before returning, so a test can act mid-flight.
    pub fn delay_upload(&self, delay: std::time::Duration) {
        *self.upload_delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn fail_upload(&self) {
        self.fail_upload.store(true, Ordering::SeqCst);
    }

    pub fn fail_render(&self) {
        self.fail_render.store(true, Ordering::SeqCst);
    }

    pub fn fail_study(&self, study_uid: &str) {
        self.failed_studies
            .lock()
            .expect("failures lock")
            .insert(study_uid.to_string());
    }

    pub fn fail_instance(&self, instance_uid: &str) {
        self.failed_instances
            .lock()
            .expect("failures lock")
            .insert(instance_uid.to_string());
    }

    fn layout_for(&self, study_uid: &str) -> Result<StudyLayout, TransportError> {
        self.studies
            .lock()
            .expect("studies lock")
            .get(study_uid)
            .cloned()
            .ok_or_else(|| TransportError::new(Some(404), format!("unknown study {study_uid}")))
    }
}

fn uid_record(tag: &str, uid: &str) -> JsonMap<String, JsonValue> {
    let mut record = JsonMap::new();
    record.insert(
        tag.to_string(),
        json!({ "vr": "UI", "Value": [uid] }),
    );
    record
}

#[async_trait]
impl ArchiveClient for MockArchive {
    async fn upload(
        &self,
        files: &[PathBuf],
        progress: Option<mpsc::Sender<f64>>,
    ) -> Result<Vec<String>, TransportError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.upload_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(TransportError::new(Some(500), "upload rejected"));
        }
        if let Some(sender) = progress {
            let total = files.len().max(1);
            for sent in 1..=total {
                let _ = sender.send(sent as f64 / total as f64).await;
            }
        }
        let planned = self.upload_plan.lock().expect("plan lock").clone();
        Ok(planned.unwrap_or_else(|| {
            self.studies
                .lock()
                .expect("studies lock")
                .keys()
                .cloned()
                .collect()
        }))
    }

    async fn fetch_metadata(
        &self,
        study_uid: &str,
        series_uid: Option<&str>,
        instance_uid: Option<&str>,
    ) -> Result<JsonMap<String, JsonValue>, TransportError> {
        if self
            .failed_studies
            .lock()
            .expect("failures lock")
            .contains(study_uid)
        {
            return Err(TransportError::new(Some(502), "archive unavailable"));
        }
        let layout = self.layout_for(study_uid)?;
        match (series_uid, instance_uid) {
            (None, _) => Ok(uid_record("0020000D", study_uid)),
            (Some(series), None) => {
                if !layout.iter().any(|(uid, _)| uid == series) {
                    return Err(TransportError::new(
                        Some(404),
                        format!("unknown series {series}"),
                    ));
                }
                Ok(uid_record("0020000E", series))
            }
            (Some(_), Some(instance)) => {
                if self
                    .failed_instances
                    .lock()
                    .expect("failures lock")
                    .contains(instance)
                {
                    return Err(TransportError::new(Some(502), "archive unavailable"));
                }
                Ok(uid_record("00080018", instance))
            }
        }
    }

    async fn fetch_descriptor(
        &self,
        _study_uid: &str,
        _series_uid: &str,
        instance_uid: &str,
    ) -> Result<JsonMap<String, JsonValue>, TransportError> {
        if self
            .failed_instances
            .lock()
            .expect("failures lock")
            .contains(instance_uid)
        {
            return Err(TransportError::new(Some(502), "archive unavailable"));
        }
        let mut record = uid_record("00080018", instance_uid);
        record.insert("00280010".to_string(), json!({ "vr": "US", "Value": [512] }));
        Ok(record)
    }

    async fn list_series(&self, study_uid: &str) -> Result<Vec<String>, TransportError> {
        Ok(self
            .layout_for(study_uid)?
            .into_iter()
            .map(|(uid, _)| uid)
            .collect())
    }

    async fn list_instances(
        &self,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<Vec<String>, TransportError> {
        self.layout_for(study_uid)?
            .into_iter()
            .find(|(uid, _)| uid == series_uid)
            .map(|(_, instances)| instances)
            .ok_or_else(|| TransportError::new(Some(404), format!("unknown series {series_uid}")))
    }

    async fn render_thumbnail(
        &self,
        study_uid: &str,
        out_dir: &Path,
    ) -> Result<PathBuf, TransportError> {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_render.load(Ordering::SeqCst) {
            return Err(TransportError::new(Some(503), "renderer offline"));
        }
        let path = out_dir.join(format!("{study_uid}.jpg"));
        tokio::fs::write(&path, b"\xff\xd8\xff\xd9")
            .await
            .map_err(|err| TransportError::message(err.to_string()))?;
        Ok(path)
    }
}

/// Engine double: stores upserted documents by `(index, id)` and answers
/// searches from a scripted response queue.
#[derive(Default)]
pub struct MemoryEngine {
    documents: Mutex<BTreeMap<(String, String), JsonValue>>,
    responses: Mutex<VecDeque<EngineResponse>>,
    fail_search: AtomicBool,
    failed_ids: Mutex<HashSet<String>>,
    pub requests: Mutex<Vec<EngineRequest>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: EngineResponse) {
        self.responses
            .lock()
            .expect("responses lock")
            .push_back(response);
    }

    pub fn fail_search(&self) {
        self.fail_search.store(true, Ordering::SeqCst);
    }

    pub fn fail_upsert(&self, id: &str) {
        self.failed_ids
            .lock()
            .expect("failures lock")
            .insert(id.to_string());
    }

    pub fn document(&self, index: &str, id: &str) -> Option<JsonValue> {
        self.documents
            .lock()
            .expect("documents lock")
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.documents
            .lock()
            .expect("documents lock")
            .keys()
            .filter(|(stored_index, _)| stored_index == index)
            .count()
    }

    pub fn last_request(&self) -> Option<EngineRequest> {
        self.requests.lock().expect("requests lock").last().cloned()
    }
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn upsert(
        &self,
        index: &str,
        id: &str,
        document: &JsonValue,
    ) -> Result<(), EngineError> {
        if self.failed_ids.lock().expect("failures lock").contains(id) {
            return Err(EngineError::request(Some(500), "index write rejected"));
        }
        self.documents
            .lock()
            .expect("documents lock")
            .insert((index.to_string(), id.to_string()), document.clone());
        Ok(())
    }

    async fn search(
        &self,
        _index: &str,
        request: &EngineRequest,
    ) -> Result<EngineResponse, EngineError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(EngineError::request(Some(503), "engine unavailable"));
        }
        Ok(self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_default())
    }
}

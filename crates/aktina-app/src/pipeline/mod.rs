//! Ingestion pipeline: upload local files to the archive, then fetch and
//! index each resulting study. Emits a progress stream that a smoothing
//! layer can interleave with synthetic nudges.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_stream::{stream, try_stream};
use futures_util::{pin_mut, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveClient, TransportError};
use crate::engine::{EngineError, SearchEngine};
use crate::fetch::{fetch_study, FetchEvent, RetrievalError};
use crate::progress::{ProgressGauge, TrickleConfig};

/// Slice of the overall fraction the upload phase occupies; fetching and
/// indexing share the rest.
pub const UPLOAD_WEIGHT: f64 = 0.25;
pub const INDEX_WEIGHT: f64 = 1.0 - UPLOAD_WEIGHT;

/// Cadence at which the smoothing layer re-reads the synthetic estimate.
const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// Upload phase started.
    Uploading,
    /// Overall completed fraction, with an upper bound the synthetic
    /// trickle may approach until the next real signal. Fractions are
    /// strictly increasing within one run and every non-final checkpoint
    /// points strictly past its own fraction.
    Progress { fraction: f64, next_checkpoint: f64 },
    /// Fetch-and-index phase moved on to this study.
    Indexing { study_uid: String },
    /// Every study was indexed.
    Done { study_uids: Vec<String> },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upload failed: {0}")]
    Upload(#[source] TransportError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error("failed to index study {study_uid}: {source}")]
    Indexing {
        study_uid: String,
        #[source]
        source: EngineError,
    },
    #[error("ingestion cancelled")]
    Cancelled,
}

/// Upload plus per-study fetch and upsert, shared by the job runner and the
/// CLI. Cheap to clone.
#[derive(Clone)]
pub struct IngestionPipeline {
    archive: Arc<dyn ArchiveClient>,
    engine: Arc<dyn SearchEngine>,
    index: String,
    trickle: TrickleConfig,
}

impl IngestionPipeline {
    pub fn new(
        archive: Arc<dyn ArchiveClient>,
        engine: Arc<dyn SearchEngine>,
        index: impl Into<String>,
        trickle: TrickleConfig,
    ) -> Self {
        Self {
            archive,
            engine,
            index: index.into(),
            trickle,
        }
    }

    /// Runs an ingestion with synthetic progress interleaved between real
    /// checkpoints. The stream ends after `Done` or the first error.
    pub fn run(
        &self,
        files: Vec<PathBuf>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<IngestEvent, IngestError>> + Send {
        smooth(self.run_raw(files, cancel), self.trickle)
    }

    /// Real checkpoints only, no timers. The `run` stream wraps this.
    pub fn run_raw(
        &self,
        files: Vec<PathBuf>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<IngestEvent, IngestError>> + Send {
        let archive = Arc::clone(&self.archive);
        let engine = Arc::clone(&self.engine);
        let index = self.index.clone();
        try_stream! {
            yield IngestEvent::Uploading;
            info!(files = files.len(), "starting upload");

            let (progress_tx, mut progress_rx) = mpsc::channel(16);
            let upload = {
                let archive = Arc::clone(&archive);
                tokio::spawn(async move { archive.upload(&files, Some(progress_tx)).await })
            };
            // The upload-complete checkpoint below is the only event that
            // lands exactly on UPLOAD_WEIGHT, so interim fractions stay
            // strictly under it.
            let mut uploaded = 0.0_f64;
            while let Some(fraction) = progress_rx.recv().await {
                let fraction = fraction.clamp(0.0, 1.0);
                if fraction > uploaded && fraction < 1.0 {
                    uploaded = fraction;
                    yield IngestEvent::Progress {
                        fraction: fraction * UPLOAD_WEIGHT,
                        next_checkpoint: UPLOAD_WEIGHT,
                    };
                }
            }
            let study_uids = upload
                .await
                .map_err(|err| IngestError::Upload(TransportError::message(err.to_string())))?
                .map_err(IngestError::Upload)?;
            info!(studies = study_uids.len(), "upload complete");

            if study_uids.is_empty() {
                yield IngestEvent::Progress {
                    fraction: 1.0,
                    next_checkpoint: 1.0,
                };
                yield IngestEvent::Done { study_uids };
                return;
            }
            let per_study = INDEX_WEIGHT / study_uids.len() as f64;
            let last = study_uids.len() - 1;
            // Point past the upload phase so the trickle keeps moving while
            // the first study's hierarchy is listed.
            yield IngestEvent::Progress {
                fraction: UPLOAD_WEIGHT,
                next_checkpoint: UPLOAD_WEIGHT + per_study,
            };
            let mut indexed = Vec::with_capacity(study_uids.len());
            for (position, study_uid) in study_uids.iter().enumerate() {
                ensure_live(&cancel)?;
                yield IngestEvent::Indexing {
                    study_uid: study_uid.clone(),
                };
                debug!(%study_uid, "fetching study hierarchy");

                let base = UPLOAD_WEIGHT + per_study * position as f64;
                let events = fetch_study(Arc::clone(&archive), study_uid);
                pin_mut!(events);
                let mut document = None;
                while let Some(event) = events.next().await {
                    match event? {
                        FetchEvent::Progress {
                            fraction,
                            next_checkpoint,
                        } => {
                            // The last study's final fraction must land on
                            // exactly 1.0, not a float neighbor of it. A
                            // non-final study's last checkpoint points at the
                            // next study's slice end so the trickle does not
                            // stall while that hierarchy is listed.
                            let (overall, overall_next) = if fraction >= 1.0 {
                                if position == last {
                                    (1.0, 1.0)
                                } else {
                                    (base + per_study, base + 2.0 * per_study)
                                }
                            } else {
                                (
                                    base + per_study * fraction,
                                    base + per_study * next_checkpoint,
                                )
                            };
                            yield IngestEvent::Progress {
                                fraction: overall,
                                next_checkpoint: overall_next,
                            };
                        }
                        FetchEvent::Study(doc) => document = Some(doc),
                        other => {
                            debug!(?other, "ignoring out-of-scope fetch event");
                        }
                    }
                }
                let document = document.ok_or_else(|| IngestError::Indexing {
                    study_uid: study_uid.clone(),
                    source: EngineError::Malformed(
                        "study fetch ended without a document".to_string(),
                    ),
                })?;

                ensure_live(&cancel)?;
                let body = serde_json::to_value(&document).map_err(|err| {
                    IngestError::Indexing {
                        study_uid: study_uid.clone(),
                        source: EngineError::Malformed(err.to_string()),
                    }
                })?;
                engine
                    .upsert(&index, &document.uid, &body)
                    .await
                    .map_err(|source| IngestError::Indexing {
                        study_uid: study_uid.clone(),
                        source,
                    })?;
                info!(%study_uid, instances = document.instance_count(), "study indexed");
                indexed.push(study_uid.clone());
            }
            yield IngestEvent::Done {
                study_uids: indexed,
            };
        }
    }
}

/// Cancellation points sit before each study fetch and before each index
/// write; work already written stays written.
fn ensure_live(cancel: &CancellationToken) -> Result<(), IngestError> {
    if cancel.is_cancelled() {
        info!("ingestion cancelled");
        return Err(IngestError::Cancelled);
    }
    Ok(())
}

/// Interleaves synthetic nudges between real checkpoints so consumers see
/// movement during long archive calls. Re-emitted fractions stay strictly
/// increasing and never reach the next real checkpoint early.
pub fn smooth<S>(
    events: S,
    cfg: TrickleConfig,
) -> impl Stream<Item = Result<IngestEvent, IngestError>> + Send
where
    S: Stream<Item = Result<IngestEvent, IngestError>> + Send,
{
    stream! {
        pin_mut!(events);
        let mut gauge = ProgressGauge::new(cfg);
        let mut ceiling = 1.0;
        let mut tick = tokio::time::interval(SAMPLE_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.next() => match event {
                    None => break,
                    Some(Ok(IngestEvent::Uploading)) => {
                        // Anchor at zero with the upload slice as ceiling so
                        // a collaborator that reports nothing still shows
                        // synthetic movement.
                        gauge.observe(0.0, UPLOAD_WEIGHT);
                        ceiling = UPLOAD_WEIGHT;
                        yield Ok(IngestEvent::Uploading);
                    }
                    Some(Ok(IngestEvent::Progress { fraction, next_checkpoint })) => {
                        ceiling = next_checkpoint;
                        if let Some(reported) = gauge.observe(fraction, next_checkpoint) {
                            yield Ok(IngestEvent::Progress {
                                fraction: reported,
                                next_checkpoint,
                            });
                        }
                    }
                    Some(Ok(other)) => yield Ok(other),
                    Some(Err(err)) => {
                        warn!(error = %err, "ingestion stream failed");
                        yield Err(err);
                        break;
                    }
                },
                _ = tick.tick() => {
                    if let Some(reported) = gauge.sample() {
                        yield Ok(IngestEvent::Progress {
                            fraction: reported,
                            next_checkpoint: ceiling,
                        });
                    }
                }
            }
        }
    }
}

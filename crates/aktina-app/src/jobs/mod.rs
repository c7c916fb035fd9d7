//! Background ingestion jobs: one pipeline run per job, a bounded worker
//! pool, and per-job event feeds that replay a snapshot for late
//! subscribers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use aktina_server::{
    ApiError, IngestProvider, JobEvent, JobEventStream, JobSnapshot, JobStateTag,
};
use async_stream::stream;
use async_trait::async_trait;
use futures_util::{pin_mut, StreamExt};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::{IngestEvent, IngestionPipeline};

/// Broadcast buffer per job. Slow subscribers that fall further behind than
/// this see a lag warning and resume from the newest event.
const EVENT_BUFFER: usize = 64;

struct JobEntry {
    snapshot: JobSnapshot,
    events: broadcast::Sender<JobEvent>,
    cancel: CancellationToken,
}

/// Owns the job table and the worker pool. Finished jobs stay in the table
/// so late lookups and subscriptions still resolve.
pub struct JobRunner {
    pipeline: IngestionPipeline,
    limiter: Arc<Semaphore>,
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
}

impl JobRunner {
    pub fn new(pipeline: IngestionPipeline, max_concurrent_jobs: usize) -> Self {
        Self {
            pipeline,
            limiter: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a job and spawns its worker. The id is returned before the
    /// worker acquires a pool slot.
    pub fn spawn_job(&self, files: Vec<PathBuf>) -> String {
        let id = Uuid::new_v4().to_string();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let entry = JobEntry {
            snapshot: JobSnapshot {
                id: id.clone(),
                state: JobStateTag::Queued,
                progress: 0.0,
                current_study_uid: None,
                error: None,
            },
            events,
            cancel: cancel.clone(),
        };
        write_jobs(&self.jobs).insert(id.clone(), entry);
        info!(job_id = %id, files = files.len(), "job queued");

        let pipeline = self.pipeline.clone();
        let limiter = Arc::clone(&self.limiter);
        let jobs = Arc::clone(&self.jobs);
        let worker_id = id.clone();
        tokio::spawn(async move {
            let permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            run_job(&pipeline, &jobs, &worker_id, files, cancel).await;
            drop(permit);
        });
        id
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        read_jobs(&self.jobs)
            .get(job_id)
            .map(|entry| entry.snapshot.clone())
    }

    /// Remaining event sequence for a job. Late subscribers on a live job
    /// first see the snapshot progress; on a finished job they see just the
    /// terminal event.
    pub fn subscribe_events(&self, job_id: &str) -> Option<JobEventStream> {
        let jobs = read_jobs(&self.jobs);
        let entry = jobs.get(job_id)?;
        let snapshot = entry.snapshot.clone();
        match snapshot.state {
            JobStateTag::Done => Some(Box::pin(futures_util::stream::once(async {
                JobEvent::Completed
            }))),
            JobStateTag::Failed => {
                let message = snapshot.error.unwrap_or_default();
                Some(Box::pin(futures_util::stream::once(async {
                    JobEvent::Failed(message)
                })))
            }
            _ => {
                // Subscribing under the table lock keeps the snapshot and
                // the receiver consistent: workers broadcast under the
                // write lock, so no event lands between the two.
                let receiver = entry.events.subscribe();
                let initial = snapshot.progress;
                Some(Box::pin(stream! {
                    if initial > 0.0 {
                        yield JobEvent::Progress(initial);
                    }
                    let mut receiver = receiver;
                    loop {
                        match receiver.recv().await {
                            Ok(event) => {
                                let terminal = event.is_terminal();
                                yield event;
                                if terminal {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "job subscriber lagged, resuming from newest");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }))
            }
        }
    }

    /// Flags a live job for cancellation. The pipeline stops at its next
    /// cancellation point and the job finishes as failed.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let jobs = read_jobs(&self.jobs);
        match jobs.get(job_id) {
            Some(entry)
                if !matches!(
                    entry.snapshot.state,
                    JobStateTag::Done | JobStateTag::Failed
                ) =>
            {
                info!(%job_id, "cancelling job");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl IngestProvider for JobRunner {
    async fn enqueue(&self, files: Vec<PathBuf>) -> Result<String, ApiError> {
        if files.is_empty() {
            return Err(ApiError::invalid_param(
                "files",
                "at least one file is required",
            ));
        }
        Ok(self.spawn_job(files))
    }

    fn subscribe(&self, job_id: &str) -> Option<JobEventStream> {
        self.subscribe_events(job_id)
    }

    fn job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.snapshot(job_id)
    }

    fn cancel(&self, job_id: &str) -> bool {
        self.cancel_job(job_id)
    }
}

async fn run_job(
    pipeline: &IngestionPipeline,
    jobs: &RwLock<HashMap<String, JobEntry>>,
    job_id: &str,
    files: Vec<PathBuf>,
    cancel: CancellationToken,
) {
    let events = pipeline.run(files, cancel);
    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(IngestEvent::Uploading) => {
                update(jobs, job_id, None, |snapshot| {
                    snapshot.state = JobStateTag::Uploading;
                });
            }
            Ok(IngestEvent::Progress { fraction, .. }) => {
                update(jobs, job_id, Some(JobEvent::Progress(fraction)), |snapshot| {
                    snapshot.progress = fraction;
                });
            }
            Ok(IngestEvent::Indexing { study_uid }) => {
                debug!(job_id, %study_uid, "job advanced to indexing");
                update(jobs, job_id, None, |snapshot| {
                    snapshot.state = JobStateTag::Indexing;
                    snapshot.current_study_uid = Some(study_uid.clone());
                });
            }
            Ok(IngestEvent::Done { study_uids }) => {
                info!(job_id, studies = study_uids.len(), "job completed");
                update(jobs, job_id, Some(JobEvent::Completed), |snapshot| {
                    snapshot.state = JobStateTag::Done;
                    snapshot.progress = 1.0;
                    snapshot.current_study_uid = None;
                });
            }
            Err(err) => {
                warn!(job_id, error = %err, "job failed");
                let message = err.to_string();
                update(
                    jobs,
                    job_id,
                    Some(JobEvent::Failed(message.clone())),
                    move |snapshot| {
                        snapshot.state = JobStateTag::Failed;
                        snapshot.error = Some(message);
                    },
                );
                break;
            }
        }
    }
}

/// Applies a snapshot change and broadcasts the matching event under one
/// write-lock hold, so subscribers never see the two out of order.
fn update(
    jobs: &RwLock<HashMap<String, JobEntry>>,
    job_id: &str,
    event: Option<JobEvent>,
    apply: impl FnOnce(&mut JobSnapshot),
) {
    let mut jobs = write_jobs(jobs);
    if let Some(entry) = jobs.get_mut(job_id) {
        apply(&mut entry.snapshot);
        if let Some(event) = event {
            let _ = entry.events.send(event);
        }
    }
}

fn read_jobs(
    jobs: &RwLock<HashMap<String, JobEntry>>,
) -> RwLockReadGuard<'_, HashMap<String, JobEntry>> {
    jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_jobs(
    jobs: &RwLock<HashMap<String, JobEntry>>,
) -> RwLockWriteGuard<'_, HashMap<String, JobEntry>> {
    jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

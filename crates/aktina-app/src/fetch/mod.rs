//! Hierarchical metadata retrieval: walks study → series → instance through
//! the archive and emits a lazy sequence of progress fractions ahead of the
//! completed document.

use std::sync::Arc;

use async_stream::try_stream;
use futures_util::Stream;
use thiserror::Error;

use crate::archive::{ArchiveClient, TransportError};
use crate::document::{InstanceDocument, SeriesDocument, StudyDocument};

/// Archive fetch failure, annotated with the entity being retrieved.
#[derive(Debug, Error)]
#[error("failed to retrieve study {study_uid}{}{}: {source}",
    .series_uid.as_deref().map(|uid| format!(" series {uid}")).unwrap_or_default(),
    .instance_uid.as_deref().map(|uid| format!(" instance {uid}")).unwrap_or_default())]
pub struct RetrievalError {
    pub study_uid: String,
    pub series_uid: Option<String>,
    pub instance_uid: Option<String>,
    #[source]
    pub source: TransportError,
}

impl RetrievalError {
    fn study(study_uid: &str, source: TransportError) -> Self {
        Self {
            study_uid: study_uid.to_string(),
            series_uid: None,
            instance_uid: None,
            source,
        }
    }

    fn series(study_uid: &str, series_uid: &str, source: TransportError) -> Self {
        Self {
            study_uid: study_uid.to_string(),
            series_uid: Some(series_uid.to_string()),
            instance_uid: None,
            source,
        }
    }

    fn instance(
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
        source: TransportError,
    ) -> Self {
        Self {
            study_uid: study_uid.to_string(),
            series_uid: Some(series_uid.to_string()),
            instance_uid: Some(instance_uid.to_string()),
            source,
        }
    }
}

/// Stream items: progress fractions first, the completed document last.
/// Each fraction also carries the value the next real signal will have,
/// which feeds the synthetic-progress cap upstream.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    Progress { fraction: f64, next_checkpoint: f64 },
    Study(StudyDocument),
    Series(SeriesDocument),
    Instance(InstanceDocument),
}

/// How far the fetch narrows into the hierarchy.
#[derive(Debug, Clone)]
pub enum FetchScope {
    Study {
        study_uid: String,
    },
    Series {
        study_uid: String,
        series_uid: String,
    },
    Instance {
        study_uid: String,
        series_uid: String,
        instance_uid: String,
    },
}

/// Cumulative fraction plan for one fetch: the first entry covers the
/// top-level fetch at weight `1/(N+1)`, the rest split the remainder across
/// series proportionally to their instance counts. Always non-empty, always
/// ends at exactly `1.0`.
fn fraction_schedule(instance_counts: &[usize]) -> Vec<f64> {
    let n = instance_counts.len();
    let head = (1.0 / (n as f64 + 1.0)).min(1.0);
    let total: usize = instance_counts.iter().sum();
    if total == 0 {
        return vec![1.0];
    }

    let remaining = 1.0 - head;
    let mut fractions = Vec::with_capacity(total + 1);
    fractions.push(head);
    let mut cumulative = head;
    for &count in instance_counts {
        if count == 0 {
            continue;
        }
        let share = remaining * (count as f64 / total as f64);
        let step = share / count as f64;
        for _ in 0..count {
            cumulative += step;
            fractions.push(cumulative.min(1.0));
        }
    }
    if let Some(last) = fractions.last_mut() {
        // Absorb float drift so the sequence terminates at exactly 1.0.
        *last = 1.0;
    }
    fractions
}

fn next_checkpoint(schedule: &[f64], position: usize) -> f64 {
    schedule.get(position + 1).copied().unwrap_or(1.0)
}

/// Fetches one study (or a narrower entity) as a progress stream ending in
/// the completed document. Lazy and non-restartable: the first poll issues
/// the first archive call, and any failure terminates the stream.
pub fn fetch(
    archive: Arc<dyn ArchiveClient>,
    scope: FetchScope,
) -> impl Stream<Item = Result<FetchEvent, RetrievalError>> {
    try_stream! {
        match scope {
            FetchScope::Study { study_uid } => {
                let metadata = archive
                    .fetch_metadata(&study_uid, None, None)
                    .await
                    .map_err(|err| RetrievalError::study(&study_uid, err))?;
                let series_uids = archive
                    .list_series(&study_uid)
                    .await
                    .map_err(|err| RetrievalError::study(&study_uid, err))?;

                // Proportional weights need every series' instance count up
                // front, so list the whole hierarchy before fetching records.
                let mut listed = Vec::with_capacity(series_uids.len());
                for series_uid in &series_uids {
                    let instance_uids = archive
                        .list_instances(&study_uid, series_uid)
                        .await
                        .map_err(|err| RetrievalError::series(&study_uid, series_uid, err))?;
                    listed.push((series_uid.clone(), instance_uids));
                }
                let counts: Vec<usize> =
                    listed.iter().map(|(_, instances)| instances.len()).collect();
                let schedule = fraction_schedule(&counts);

                let mut position = 0;
                yield FetchEvent::Progress {
                    fraction: schedule[0],
                    next_checkpoint: next_checkpoint(&schedule, 0),
                };

                let mut document = StudyDocument::new(&study_uid, metadata);
                for (series_uid, instance_uids) in listed {
                    let series_metadata = archive
                        .fetch_metadata(&study_uid, Some(&series_uid), None)
                        .await
                        .map_err(|err| RetrievalError::series(&study_uid, &series_uid, err))?;
                    let mut series = SeriesDocument::new(&series_uid, series_metadata);
                    for instance_uid in instance_uids {
                        series.instances.push(
                            fetch_instance_document(
                                archive.as_ref(),
                                &study_uid,
                                &series_uid,
                                &instance_uid,
                            )
                            .await?,
                        );
                        position += 1;
                        yield FetchEvent::Progress {
                            fraction: schedule[position],
                            next_checkpoint: next_checkpoint(&schedule, position),
                        };
                    }
                    document.series.push(series);
                }
                yield FetchEvent::Study(document);
            }
            FetchScope::Series {
                study_uid,
                series_uid,
            } => {
                let metadata = archive
                    .fetch_metadata(&study_uid, Some(&series_uid), None)
                    .await
                    .map_err(|err| RetrievalError::series(&study_uid, &series_uid, err))?;
                let instance_uids = archive
                    .list_instances(&study_uid, &series_uid)
                    .await
                    .map_err(|err| RetrievalError::series(&study_uid, &series_uid, err))?;
                let schedule = fraction_schedule(&[instance_uids.len()]);

                let mut position = 0;
                yield FetchEvent::Progress {
                    fraction: schedule[0],
                    next_checkpoint: next_checkpoint(&schedule, 0),
                };

                let mut series = SeriesDocument::new(&series_uid, metadata);
                for instance_uid in instance_uids {
                    series.instances.push(
                        fetch_instance_document(
                            archive.as_ref(),
                            &study_uid,
                            &series_uid,
                            &instance_uid,
                        )
                        .await?,
                    );
                    position += 1;
                    yield FetchEvent::Progress {
                        fraction: schedule[position],
                        next_checkpoint: next_checkpoint(&schedule, position),
                    };
                }
                yield FetchEvent::Series(series);
            }
            FetchScope::Instance {
                study_uid,
                series_uid,
                instance_uid,
            } => {
                let instance = fetch_instance_document(
                    archive.as_ref(),
                    &study_uid,
                    &series_uid,
                    &instance_uid,
                )
                .await?;
                yield FetchEvent::Progress {
                    fraction: 1.0,
                    next_checkpoint: 1.0,
                };
                yield FetchEvent::Instance(instance);
            }
        }
    }
}

/// Study-scoped fetch, the shape the ingestion pipeline consumes.
pub fn fetch_study(
    archive: Arc<dyn ArchiveClient>,
    study_uid: &str,
) -> impl Stream<Item = Result<FetchEvent, RetrievalError>> {
    fetch(
        archive,
        FetchScope::Study {
            study_uid: study_uid.to_string(),
        },
    )
}

async fn fetch_instance_document(
    archive: &dyn ArchiveClient,
    study_uid: &str,
    series_uid: &str,
    instance_uid: &str,
) -> Result<InstanceDocument, RetrievalError> {
    let metadata = archive
        .fetch_metadata(study_uid, Some(series_uid), Some(instance_uid))
        .await
        .map_err(|err| RetrievalError::instance(study_uid, series_uid, instance_uid, err))?;
    let descriptor = archive
        .fetch_descriptor(study_uid, series_uid, instance_uid)
        .await
        .map_err(|err| RetrievalError::instance(study_uid, series_uid, instance_uid, err))?;
    Ok(InstanceDocument {
        uid: instance_uid.to_string(),
        metadata,
        descriptor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockArchive;
    use futures_util::StreamExt;

    #[test]
    fn schedule_head_weight_is_one_over_series_count_plus_one() {
        let schedule = fraction_schedule(&[2, 2]);
        assert!((schedule[0] - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(schedule.len(), 5);
        assert_eq!(*schedule.last().expect("non-empty"), 1.0);
    }

    #[test]
    fn schedule_increments_sum_to_one() {
        for counts in [vec![1], vec![3, 1], vec![2, 0, 5], vec![10, 10, 10]] {
            let schedule = fraction_schedule(&counts);
            let mut previous = 0.0;
            let mut sum = 0.0;
            for fraction in &schedule {
                assert!(*fraction > previous, "monotone: {schedule:?}");
                sum += fraction - previous;
                previous = *fraction;
            }
            assert!((sum - 1.0).abs() < 1e-9, "sum of increments: {schedule:?}");
            assert_eq!(previous, 1.0);
        }
    }

    #[test]
    fn schedule_weights_series_by_instance_count() {
        let schedule = fraction_schedule(&[3, 1]);
        // Head 1/3, then series one carries 3/4 of the remaining 2/3.
        let series_one_end = schedule[3];
        assert!((series_one_end - (1.0 / 3.0 + (2.0 / 3.0) * 0.75)).abs() < 1e-9);
    }

    #[test]
    fn empty_hierarchy_collapses_to_a_single_full_step() {
        assert_eq!(fraction_schedule(&[]), vec![1.0]);
        assert_eq!(fraction_schedule(&[0, 0]), vec![1.0]);
    }

    #[tokio::test]
    async fn study_fetch_streams_monotone_fractions_then_the_document() {
        let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 2), ("SE2", 1)]));
        let mut events = Box::pin(fetch_study(archive, "S1"));

        let mut fractions = Vec::new();
        let mut document = None;
        while let Some(event) = events.next().await {
            match event.expect("fetch succeeds") {
                FetchEvent::Progress { fraction, .. } => fractions.push(fraction),
                FetchEvent::Study(doc) => document = Some(doc),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        assert!(fractions.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(*fractions.last().expect("progress emitted"), 1.0);

        let document = document.expect("document emitted");
        assert_eq!(document.uid, "S1");
        assert_eq!(document.series.len(), 2);
        assert_eq!(document.series[0].instances.len(), 2);
        assert_eq!(document.instance_count(), 3);
    }

    #[tokio::test]
    async fn checkpoints_announce_the_following_fraction() {
        let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 2)]));
        let mut events = Box::pin(fetch_study(archive, "S1"));

        let mut checkpoints = Vec::new();
        while let Some(event) = events.next().await {
            if let FetchEvent::Progress {
                fraction,
                next_checkpoint,
            } = event.expect("fetch succeeds")
            {
                checkpoints.push((fraction, next_checkpoint));
            }
        }
        for pair in checkpoints.windows(2) {
            assert!((pair[0].1 - pair[1].0).abs() < 1e-9);
        }
        assert_eq!(checkpoints.last().expect("events").1, 1.0);
    }

    #[tokio::test]
    async fn a_failing_instance_aborts_the_stream_with_context() {
        let archive = MockArchive::with_study("S1", &[("SE1", 2)]);
        archive.fail_instance("SE1/I1");
        let mut events = Box::pin(fetch_study(Arc::new(archive), "S1"));

        let mut failure = None;
        while let Some(event) = events.next().await {
            match event {
                Ok(_) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let failure = failure.expect("stream fails");
        assert_eq!(failure.study_uid, "S1");
        assert_eq!(failure.series_uid.as_deref(), Some("SE1"));
        assert_eq!(failure.instance_uid.as_deref(), Some("SE1/I1"));
        assert_eq!(failure.source.status, Some(502));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn series_scope_returns_the_narrow_document() {
        let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 2)]));
        let mut events = Box::pin(fetch(
            archive,
            FetchScope::Series {
                study_uid: "S1".to_string(),
                series_uid: "SE1".to_string(),
            },
        ));

        let mut series = None;
        while let Some(event) = events.next().await {
            if let FetchEvent::Series(doc) = event.expect("fetch succeeds") {
                series = Some(doc);
            }
        }
        let series = series.expect("series emitted");
        assert_eq!(series.uid, "SE1");
        assert_eq!(series.instances.len(), 2);
    }
}

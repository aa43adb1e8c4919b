use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::backend::{ArchiveBackend, UnitGranularity};
use crate::domain::{ArchiveSource, Project, Run, Sample};
use crate::transfer::{TransferResult, TransferState, TransferUnit, UnitExecutor};

/// Caps applied while the hierarchy is resolved, before anything transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireLimits {
    /// First N samples in archive order.
    pub max_samples: Option<usize>,
    /// First N runs across all kept samples, in archive order.
    pub max_runs: Option<usize>,
}

impl AcquireLimits {
    pub fn samples(max_samples: usize) -> Self {
        Self {
            max_samples: Some(max_samples),
            max_runs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSample {
    pub sample: Sample,
    pub runs: Vec<Run>,
}

/// The resolved hierarchy of one project and the units derived from it.
#[derive(Debug, Clone)]
pub struct AcquisitionPlan {
    pub project: Project,
    pub source: ArchiveSource,
    pub samples: Vec<PlannedSample>,
    pub units: Vec<TransferUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionSummary {
    pub project_accession: String,
    pub source: ArchiveSource,
    pub total_samples: usize,
    pub downloaded_samples: usize,
    pub failed_samples: usize,
    pub total_runs: usize,
    pub downloaded_runs: usize,
    pub failed_runs: usize,
    /// Files present and valid after the acquisition, skipped ones included.
    pub downloaded_files: usize,
    pub failed_files: usize,
    /// Subset of `downloaded_files` that was already valid on disk.
    pub skipped_files: usize,
    pub errors: Vec<String>,
}

impl AcquisitionSummary {
    pub fn new(project_accession: &str, source: ArchiveSource) -> Self {
        Self {
            project_accession: project_accession.to_string(),
            source,
            total_samples: 0,
            downloaded_samples: 0,
            failed_samples: 0,
            total_runs: 0,
            downloaded_runs: 0,
            failed_runs: 0,
            downloaded_files: 0,
            failed_files: 0,
            skipped_files: 0,
            errors: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed_samples > 0 || self.failed_files > 0 || !self.errors.is_empty()
    }
}

enum WorkerMessage {
    Started(usize),
    Finished {
        index: usize,
        result: TransferResult,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct DownloadScheduler {
    concurrency: usize,
    raw_reads: Utf8PathBuf,
}

impl DownloadScheduler {
    pub fn new(concurrency: usize, raw_reads: Utf8PathBuf) -> Self {
        Self {
            concurrency: concurrency.max(1),
            raw_reads,
        }
    }

    /// Resolve and dispatch in one call.
    pub fn run_acquisition<B, E>(
        &self,
        backend: &B,
        executor: &E,
        project: Project,
        limits: AcquireLimits,
        sink: &dyn ProgressSink,
    ) -> AcquisitionSummary
    where
        B: ArchiveBackend + ?Sized,
        E: UnitExecutor,
    {
        let plan = self.plan(backend, project, limits, sink);
        self.dispatch(&plan, executor, sink)
    }

    /// Walks project, samples and runs sequentially and flattens the
    /// eligible units. One remote listing per sample.
    pub fn plan<B>(
        &self,
        backend: &B,
        project: Project,
        limits: AcquireLimits,
        sink: &dyn ProgressSink,
    ) -> AcquisitionPlan
    where
        B: ArchiveBackend + ?Sized,
    {
        sink.event(ProgressEvent::phase(format!(
            "phase=Resolve; listing samples of {}",
            project.accession
        )));
        let mut samples = backend.list_samples(&project);
        if let Some(max) = limits.max_samples {
            if samples.len() > max {
                info!(project = %project.accession, max, "limiting samples");
                samples.truncate(max);
            }
        }

        let mut run_budget = limits.max_runs;
        let mut planned = Vec::with_capacity(samples.len());
        for sample in samples {
            if run_budget == Some(0) {
                info!(sample = %sample.accession, "run limit reached, skipping remaining samples");
                break;
            }
            sink.event(ProgressEvent::phase(format!(
                "phase=Resolve; listing runs of {}",
                sample.accession
            )));
            let mut runs = backend.list_runs(&sample);
            if let Some(budget) = run_budget.as_mut() {
                runs.truncate(*budget);
                *budget -= runs.len();
            }
            planned.push(PlannedSample { sample, runs });
        }

        let units = flatten_units(&planned, backend.unit_granularity(), &self.raw_reads);
        info!(
            project = %project.accession,
            samples = planned.len(),
            units = units.len(),
            "hierarchy resolved"
        );
        AcquisitionPlan {
            source: backend.source(),
            project,
            samples: planned,
            units,
        }
    }

    /// Runs every unit on a pool of at most `concurrency` workers. Results
    /// are folded into the summary on the calling thread as they arrive; a
    /// failed unit never cancels its siblings.
    pub fn dispatch<E: UnitExecutor>(
        &self,
        plan: &AcquisitionPlan,
        executor: &E,
        sink: &dyn ProgressSink,
    ) -> AcquisitionSummary {
        let mut tally = Tally::new(plan);
        let units = plan.units.as_slice();

        if !units.is_empty() {
            sink.event(ProgressEvent::phase(format!(
                "phase=Transfer; {} units on {} workers",
                units.len(),
                self.concurrency.min(units.len())
            )));
            let next = AtomicUsize::new(0);
            let (tx, rx) = mpsc::channel();
            thread::scope(|scope| {
                for _ in 0..self.concurrency.min(units.len()) {
                    let tx = tx.clone();
                    let next = &next;
                    scope.spawn(move || {
                        loop {
                            let index = next.fetch_add(1, Ordering::Relaxed);
                            let Some(unit) = units.get(index) else {
                                break;
                            };
                            let _ = tx.send(WorkerMessage::Started(index));
                            let started = Instant::now();
                            let result = executor.execute(unit);
                            let _ = tx.send(WorkerMessage::Finished {
                                index,
                                result,
                                elapsed: started.elapsed(),
                            });
                        }
                    });
                }
                drop(tx);

                for message in rx {
                    match message {
                        WorkerMessage::Started(index) => {
                            sink.event(ProgressEvent::unit(
                                units[index].label(),
                                TransferState::InProgress,
                                None,
                            ));
                        }
                        WorkerMessage::Finished {
                            index,
                            result,
                            elapsed,
                        } => {
                            sink.event(ProgressEvent::unit(
                                units[index].label(),
                                result.state,
                                Some(elapsed),
                            ));
                            tally.record(result);
                        }
                    }
                }
            });
        }

        let summary = tally.finish();
        info!(
            project = %summary.project_accession,
            downloaded_samples = summary.downloaded_samples,
            total_samples = summary.total_samples,
            downloaded_files = summary.downloaded_files,
            failed_files = summary.failed_files,
            "acquisition finished"
        );
        summary
    }
}

fn flatten_units(
    samples: &[PlannedSample],
    granularity: UnitGranularity,
    raw_reads: &Utf8PathBuf,
) -> Vec<TransferUnit> {
    let mut units = Vec::new();
    for planned in samples {
        let sample = planned.sample.accession.as_str();
        for run in &planned.runs {
            match granularity {
                UnitGranularity::Files => {
                    units.extend(
                        run.files
                            .iter()
                            .filter(|file| file.file_type.is_sequence_reads())
                            .map(|file| {
                                TransferUnit::file(
                                    sample,
                                    &run.accession,
                                    file.clone(),
                                    raw_reads.join(&file.filename),
                                )
                            }),
                    );
                }
                UnitGranularity::Runs => {
                    units.push(TransferUnit::run(sample, &run.accession, raw_reads.clone()));
                }
            }
        }
    }
    units
}

/// Single-owner accumulator; only the dispatching thread touches it.
struct Tally {
    summary: AcquisitionSummary,
    samples: Vec<String>,
    runs: Vec<(String, String)>,
    failed_samples: BTreeSet<String>,
    failed_runs: BTreeSet<(String, String)>,
}

impl Tally {
    fn new(plan: &AcquisitionPlan) -> Self {
        let mut summary = AcquisitionSummary::new(&plan.project.accession, plan.source);
        let mut failed_samples = BTreeSet::new();
        for planned in &plan.samples {
            if planned.runs.is_empty() {
                warn!(sample = %planned.sample.accession, "no runs found");
                summary
                    .errors
                    .push(format!("No runs found for sample {}", planned.sample.accession));
                failed_samples.insert(planned.sample.accession.clone());
            }
        }
        let runs = plan
            .samples
            .iter()
            .flat_map(|planned| {
                planned
                    .runs
                    .iter()
                    .map(|run| (planned.sample.accession.clone(), run.accession.clone()))
            })
            .collect();
        Self {
            summary,
            samples: plan
                .samples
                .iter()
                .map(|planned| planned.sample.accession.clone())
                .collect(),
            runs,
            failed_samples,
            failed_runs: BTreeSet::new(),
        }
    }

    fn record(&mut self, result: TransferResult) {
        if !result.state.is_terminal() {
            warn!(unit = %result.unit, "ignoring non-terminal result");
            return;
        }
        if result.state.is_success() {
            self.summary.downloaded_files += result.files;
            if result.state == TransferState::SkippedAlreadyValid {
                self.summary.skipped_files += result.files;
            }
            return;
        }

        self.summary.failed_files += 1;
        let reason = result.message.as_deref().unwrap_or("unknown error");
        self.summary
            .errors
            .push(format!("Failed to download {}: {reason}", result.unit));
        self.failed_samples.insert(result.sample_accession.clone());
        self.failed_runs
            .insert((result.sample_accession, result.run_accession));
    }

    fn finish(self) -> AcquisitionSummary {
        let mut summary = self.summary;
        summary.total_samples = self.samples.len();
        summary.failed_samples = self
            .samples
            .iter()
            .filter(|sample| self.failed_samples.contains(*sample))
            .count();
        summary.downloaded_samples = summary.total_samples - summary.failed_samples;
        summary.total_runs = self.runs.len();
        summary.failed_runs = self
            .runs
            .iter()
            .filter(|run| self.failed_runs.contains(*run))
            .count();
        summary.downloaded_runs = summary.total_runs - summary.failed_runs;
        summary
    }
}

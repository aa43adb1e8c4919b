use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::backend::ArchiveBackend;
use crate::domain::{Accession, ArchiveSource, Project};
use crate::recorder::MetadataRecorder;
use crate::scheduler::{AcquireLimits, AcquisitionSummary, DownloadScheduler};
use crate::transfer::{TransferState, UnitExecutor};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Phase description, or the unit label for unit transitions.
    pub message: String,
    pub state: Option<TransferState>,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn phase(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            state: None,
            elapsed: None,
        }
    }

    pub fn unit(label: &str, state: TransferState, elapsed: Option<Duration>) -> Self {
        Self {
            message: label.to_string(),
            state: Some(state),
            elapsed,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub source: ArchiveSource,
    pub keywords: Vec<String>,
    /// One entry per keyword hit; the same accession may repeat.
    pub projects: Vec<Project>,
}

/// Resolves, records and transfers one project at a time against a single
/// archive backend.
pub struct App<B: ArchiveBackend, E: UnitExecutor> {
    backend: B,
    executor: E,
    scheduler: DownloadScheduler,
    recorder: MetadataRecorder,
}

impl<B: ArchiveBackend, E: UnitExecutor> App<B, E> {
    pub fn new(
        backend: B,
        executor: E,
        scheduler: DownloadScheduler,
        recorder: MetadataRecorder,
    ) -> Self {
        Self {
            backend,
            executor,
            scheduler,
            recorder,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Never fails: unresolvable entities, transfer failures and recorder
    /// errors all end up in the returned summary.
    pub fn acquire(
        &self,
        accession: &Accession,
        limits: AcquireLimits,
        sink: &dyn ProgressSink,
    ) -> AcquisitionSummary {
        info!(%accession, source = %self.backend.source(), "starting acquisition");
        sink.event(ProgressEvent::phase(format!(
            "phase=Resolve; project {accession}"
        )));
        let project = self.backend.resolve_project(accession).unwrap_or_else(|| {
            warn!(%accession, "project metadata unavailable, continuing with accession only");
            Project::unresolved(accession, self.backend.source())
        });

        let plan = self.scheduler.plan(&self.backend, project, limits, sink);

        let mut recorder_errors = Vec::new();
        sink.event(ProgressEvent::phase("phase=Store; recording hierarchy"));
        if let Err(err) = self.recorder.record_hierarchy(&plan.project, &plan.samples) {
            error!(project = %plan.project.accession, "failed to record hierarchy: {err}");
            recorder_errors.push(format!("Failed to record metadata: {err}"));
        }

        let mut summary = self.scheduler.dispatch(&plan, &self.executor, sink);
        if !recorder_errors.is_empty() {
            recorder_errors.append(&mut summary.errors);
            summary.errors = recorder_errors;
        }

        sink.event(ProgressEvent::phase("phase=Store; recording summary"));
        if let Err(err) = self.recorder.record_summary(&plan.project, &summary) {
            error!(project = %plan.project.accession, "failed to record summary: {err}");
            summary
                .errors
                .push(format!("Failed to record download summary: {err}"));
        }

        info!(
            project = %summary.project_accession,
            "summary: {}/{} samples downloaded",
            summary.downloaded_samples,
            summary.total_samples
        );
        summary
    }

    pub fn search(&self, keywords: &[String], sink: &dyn ProgressSink) -> SearchResult {
        sink.event(ProgressEvent::phase(format!(
            "phase=Search; {} keywords",
            keywords.len()
        )));
        let projects = self.backend.search(keywords);
        SearchResult {
            source: self.backend.source(),
            keywords: keywords.to_vec(),
            projects,
        }
    }
}

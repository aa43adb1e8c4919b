use camino::Utf8PathBuf;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{Project, Run, Sample};
use crate::error::HarvestError;
use crate::scheduler::{AcquisitionSummary, PlannedSample};
use crate::store::Store;

/// On-disk snapshot of a resolved project hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRecord {
    pub project_accession: String,
    pub project: Project,
    pub samples: Vec<SampleRecord>,
    pub download_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(flatten)]
    pub sample: Sample,
    pub runs: Vec<Run>,
}

impl From<&PlannedSample> for SampleRecord {
    fn from(planned: &PlannedSample) -> Self {
        Self {
            sample: planned.sample.clone(),
            runs: planned.runs.clone(),
        }
    }
}

/// Writes one self-contained snapshot per call; re-recording a project
/// overwrites the previous one.
#[derive(Debug, Clone)]
pub struct MetadataRecorder {
    store: Store,
}

impl MetadataRecorder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn record_hierarchy(
        &self,
        project: &Project,
        samples: &[PlannedSample],
    ) -> Result<Utf8PathBuf, HarvestError> {
        let record = HierarchyRecord {
            project_accession: project.accession.clone(),
            project: project.clone(),
            samples: samples.iter().map(SampleRecord::from).collect(),
            download_date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let path = self.store.hierarchy_path(&project.accession);
        Store::write_json_atomic(&path, &record)?;
        info!(project = %project.accession, path = %path, "hierarchy recorded");
        Ok(path)
    }

    pub fn record_summary(
        &self,
        project: &Project,
        summary: &AcquisitionSummary,
    ) -> Result<Utf8PathBuf, HarvestError> {
        let path = self.store.summary_path(&project.accession);
        Store::write_json_atomic(&path, summary)?;
        info!(project = %project.accession, path = %path, "summary recorded");
        Ok(path)
    }
}

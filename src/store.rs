use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;

use crate::config::StorageSettings;
use crate::error::HarvestError;

/// Local data layout. Every directory is created up front by
/// [`Store::ensure_layout`]; transfers only ever write inside them.
#[derive(Debug, Clone)]
pub struct Store {
    raw_reads: Utf8PathBuf,
    alignments: Utf8PathBuf,
    metadata: Utf8PathBuf,
    qc_reports: Utf8PathBuf,
    derived_signals: Utf8PathBuf,
    logs: Utf8PathBuf,
}

impl Store {
    pub fn from_settings(settings: &StorageSettings) -> Self {
        Self {
            raw_reads: settings.raw_reads.clone(),
            alignments: settings.alignments.clone(),
            metadata: settings.metadata.clone(),
            qc_reports: settings.qc_reports.clone(),
            derived_signals: settings.derived_signals.clone(),
            logs: settings.logs.clone(),
        }
    }

    /// Layout with the default relative paths placed under `root`.
    pub fn new_with_root(root: &Utf8Path) -> Self {
        Self {
            raw_reads: root.join("data/raw/fastq"),
            alignments: root.join("data/raw/bam"),
            metadata: root.join("data/metadata"),
            qc_reports: root.join("data/qc_reports"),
            derived_signals: root.join("data/fragmentomics"),
            logs: root.join("logs"),
        }
    }

    pub fn raw_reads_dir(&self) -> &Utf8Path {
        &self.raw_reads
    }

    pub fn metadata_dir(&self) -> &Utf8Path {
        &self.metadata
    }

    pub fn logs_dir(&self) -> &Utf8Path {
        &self.logs
    }

    pub fn ensure_layout(&self) -> Result<(), HarvestError> {
        for dir in [
            &self.raw_reads,
            &self.alignments,
            &self.metadata,
            &self.qc_reports,
            &self.derived_signals,
            &self.logs,
        ] {
            fs::create_dir_all(dir.as_std_path()).map_err(HarvestError::fs)?;
        }
        Ok(())
    }

    pub fn hierarchy_path(&self, project_accession: &str) -> Utf8PathBuf {
        self.metadata
            .join(format!("{project_accession}_metadata.json"))
    }

    pub fn summary_path(&self, project_accession: &str) -> Utf8PathBuf {
        self.metadata
            .join(format!("{project_accession}_download_summary.json"))
    }

    /// Replaces `path` with the pretty-printed JSON of `value`. Readers see
    /// either the previous document or the new one, never a partial write.
    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), HarvestError> {
        let parent = path
            .parent()
            .ok_or_else(|| HarvestError::Filesystem(format!("invalid output path: {path}")))?;
        fs::create_dir_all(parent.as_std_path()).map_err(HarvestError::fs)?;
        let mut content = serde_json::to_vec_pretty(value).map_err(HarvestError::fs)?;
        content.push(b'\n');
        let temp = Builder::new()
            .prefix(".seqharvest")
            .suffix(".json.tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(HarvestError::fs)?;
        fs::write(temp.path(), &content).map_err(HarvestError::fs)?;
        temp.persist(path.as_std_path()).map_err(HarvestError::fs)?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, HarvestError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(HarvestError::fs)?;
        serde_json::from_str(&content).map_err(HarvestError::fs)
    }
}

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{Accession, ArchiveSource};
use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "seqharvest.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub sources: SourcesSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub quality_filters: QualityFiltersSection,
    #[serde(default)]
    pub datasets: DatasetsSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SourcesSection {
    #[serde(default)]
    pub ena: EnaSection,
    #[serde(default)]
    pub ncbi: NcbiSection,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EnaSection {
    #[serde(default = "default_ena_base_url")]
    pub base_url: String,
    #[serde(default = "default_ena_ftp_base")]
    pub ftp_base: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EnaSection {
    fn default() -> Self {
        Self {
            base_url: default_ena_base_url(),
            ftp_base: default_ena_ftp_base(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NcbiSection {
    #[serde(default = "default_ncbi_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retmax")]
    pub retmax: u32,
}

impl Default for NcbiSection {
    fn default() -> Self {
        Self {
            base_url: default_ncbi_base_url(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            retmax: default_retmax(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default = "default_raw_reads")]
    pub raw_reads: String,
    #[serde(default = "default_alignments")]
    pub alignments: String,
    #[serde(default = "default_metadata")]
    pub metadata: String,
    #[serde(default = "default_qc_reports")]
    pub qc_reports: String,
    #[serde(default = "default_derived_signals")]
    pub derived_signals: String,
    #[serde(default = "default_logs")]
    pub logs: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            raw_reads: default_raw_reads(),
            alignments: default_alignments(),
            metadata: default_metadata(),
            qc_reports: default_qc_reports(),
            derived_signals: default_derived_signals(),
            logs: default_logs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DownloadSection {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_true")]
    pub validate_downloads: bool,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            validate_downloads: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QualityFiltersSection {
    #[serde(default = "default_min_read_length")]
    pub min_read_length: u32,
}

impl Default for QualityFiltersSection {
    fn default() -> Self {
        Self {
            min_read_length: default_min_read_length(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DatasetsSection {
    #[serde(default)]
    pub ena: Vec<DatasetEntry>,
    #[serde(default)]
    pub ncbi: Vec<DatasetEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasetEntry {
    Shorthand(String),
    Detailed(DatasetEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntryObject {
    pub accession: String,
    #[serde(default)]
    pub max_units: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchSection {
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub base_url: String,
    pub ftp_base: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retmax: u32,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub raw_reads: Utf8PathBuf,
    pub alignments: Utf8PathBuf,
    pub metadata: Utf8PathBuf,
    pub qc_reports: Utf8PathBuf,
    pub derived_signals: Utf8PathBuf,
    pub logs: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub source: ArchiveSource,
    pub accession: Accession,
    pub max_units: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub ena: SourceSettings,
    pub ncbi: SourceSettings,
    pub storage: StorageSettings,
    pub max_concurrent_downloads: usize,
    pub validate_downloads: bool,
    pub min_read_length: u32,
    pub datasets: Vec<DatasetRequest>,
    pub keywords: Vec<String>,
    pub log_level: String,
}

impl ResolvedConfig {
    pub fn source(&self, source: ArchiveSource) -> &SourceSettings {
        match source {
            ArchiveSource::Ena => &self.ena,
            ArchiveSource::Ncbi => &self.ncbi,
        }
    }

    pub fn datasets_for(&self, source: ArchiveSource) -> impl Iterator<Item = &DatasetRequest> {
        self.datasets
            .iter()
            .filter(move |request| request.source == source)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(HarvestError::InvalidConfig(format!(
                "unsupported schema_version {schema_version} (expected {SCHEMA_VERSION})"
            )));
        }

        if config.download.max_concurrent_downloads == 0 {
            return Err(HarvestError::InvalidConfig(
                "download.max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if config.sources.ena.timeout == 0 || config.sources.ncbi.timeout == 0 {
            return Err(HarvestError::InvalidConfig(
                "sources.*.timeout must be at least 1 second".to_string(),
            ));
        }

        let ena = SourceSettings {
            base_url: trim_base(&config.sources.ena.base_url),
            ftp_base: Some(trim_base(&config.sources.ena.ftp_base)),
            timeout: Duration::from_secs(config.sources.ena.timeout),
            max_retries: config.sources.ena.max_retries,
            retmax: 0,
        };
        let ncbi = SourceSettings {
            base_url: trim_base(&config.sources.ncbi.base_url),
            ftp_base: None,
            timeout: Duration::from_secs(config.sources.ncbi.timeout),
            max_retries: config.sources.ncbi.max_retries,
            retmax: config.sources.ncbi.retmax,
        };

        let storage = StorageSettings {
            raw_reads: Utf8PathBuf::from(config.storage.raw_reads),
            alignments: Utf8PathBuf::from(config.storage.alignments),
            metadata: Utf8PathBuf::from(config.storage.metadata),
            qc_reports: Utf8PathBuf::from(config.storage.qc_reports),
            derived_signals: Utf8PathBuf::from(config.storage.derived_signals),
            logs: Utf8PathBuf::from(config.storage.logs),
        };

        let ena_datasets = config
            .datasets
            .ena
            .into_iter()
            .map(|entry| resolve_dataset(ArchiveSource::Ena, entry));
        let ncbi_datasets = config
            .datasets
            .ncbi
            .into_iter()
            .map(|entry| resolve_dataset(ArchiveSource::Ncbi, entry));
        let datasets = ena_datasets
            .chain(ncbi_datasets)
            .collect::<Result<Vec<_>, HarvestError>>()?;

        Ok(ResolvedConfig {
            ena,
            ncbi,
            storage,
            max_concurrent_downloads: config.download.max_concurrent_downloads,
            validate_downloads: config.download.validate_downloads,
            min_read_length: config.quality_filters.min_read_length,
            datasets,
            keywords: config.search.keywords,
            log_level: config.logging.level,
        })
    }
}

fn resolve_dataset(
    source: ArchiveSource,
    entry: DatasetEntry,
) -> Result<DatasetRequest, HarvestError> {
    match entry {
        DatasetEntry::Shorthand(value) => Ok(DatasetRequest {
            source,
            accession: value.parse()?,
            max_units: None,
        }),
        DatasetEntry::Detailed(obj) => Ok(DatasetRequest {
            source,
            accession: obj.accession.parse()?,
            max_units: obj.max_units,
        }),
    }
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn default_ena_base_url() -> String {
    "https://www.ebi.ac.uk/ena/browser/api/xml".to_string()
}

fn default_ena_ftp_base() -> String {
    "ftp://ftp.sra.ebi.ac.uk/vol1/fastq".to_string()
}

fn default_ncbi_base_url() -> String {
    "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retmax() -> u32 {
    10_000
}

fn default_raw_reads() -> String {
    "data/raw/fastq".to_string()
}

fn default_alignments() -> String {
    "data/raw/bam".to_string()
}

fn default_metadata() -> String {
    "data/metadata".to_string()
}

fn default_qc_reports() -> String {
    "data/qc_reports".to_string()
}

fn default_derived_signals() -> String {
    "data/fragmentomics".to_string()
}

fn default_logs() -> String {
    "logs".to_string()
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_min_read_length() -> u32 {
    30
}

pub fn default_keywords() -> Vec<String> {
    vec!["cfDNA".to_string(), "cell-free DNA".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

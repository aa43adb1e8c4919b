use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveSource {
    Ena,
    Ncbi,
}

impl fmt::Display for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveSource::Ena => write!(f, "ena"),
            ArchiveSource::Ncbi => write!(f, "ncbi"),
        }
    }
}

/// Stable archive identifier for a project, sample or run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Accession(String);

impl Accession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Accession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Accession {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.');
        if !is_valid {
            return Err(HarvestError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionInfo {
    pub submission_date: Option<String>,
    pub center_name: Option<String>,
    pub broker_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub accession: String,
    pub title: String,
    pub description: String,
    pub submission: SubmissionInfo,
    pub source: ArchiveSource,
    /// Search keyword that surfaced this project, when it came from a search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl Project {
    /// Placeholder used when the archive cannot describe the project itself.
    pub fn unresolved(accession: &Accession, source: ArchiveSource) -> Self {
        Self {
            accession: accession.as_str().to_string(),
            title: String::new(),
            description: String::new(),
            submission: SubmissionInfo::default(),
            source,
            keyword: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub accession: String,
    pub title: String,
    pub description: String,
    pub taxon_id: Option<String>,
    pub submission_date: Option<String>,
    /// Archive-defined key/value attributes.
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub accession: String,
    pub alias: Option<String>,
    pub title: String,
    pub instrument_platform: Option<String>,
    pub instrument_model: Option<String>,
    pub base_count: Option<u64>,
    pub read_count: Option<u64>,
    pub run_date: Option<String>,
    pub experiment_accession: Option<String>,
    pub study_accession: Option<String>,
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
    pub file_type: FileType,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_checksum_algorithm: Option<ChecksumAlgorithm>,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileType {
    Fastq,
    FastqGz,
    Bam,
    Cram,
    Sra,
    Other(String),
}

impl FileType {
    pub fn is_sequence_reads(&self) -> bool {
        matches!(self, FileType::Fastq | FileType::FastqGz)
    }
}

impl From<&str> for FileType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "fastq" => FileType::Fastq,
            "fastq.gz" => FileType::FastqGz,
            "bam" => FileType::Bam,
            "cram" => FileType::Cram,
            "sra" => FileType::Sra,
            _ => FileType::Other(value.trim().to_string()),
        }
    }
}

impl From<String> for FileType {
    fn from(value: String) -> Self {
        FileType::from(value.as_str())
    }
}

impl From<FileType> for String {
    fn from(value: FileType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Fastq => write!(f, "fastq"),
            FileType::FastqGz => write!(f, "fastq.gz"),
            FileType::Bam => write!(f, "bam"),
            FileType::Cram => write!(f, "cram"),
            FileType::Sra => write!(f, "sra"),
            FileType::Other(label) => write!(f, "{label}"),
        }
    }
}

/// Digest algorithm declared by the archive. Names the validator does not
/// implement are kept verbatim so they can be reported and accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
    Unsupported(String),
}

impl ChecksumAlgorithm {
    /// Parses an archive label; empty and `none` mean no checksum.
    pub fn parse(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "none" => None,
            "md5" => Some(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Some(ChecksumAlgorithm::Sha256),
            _ => Some(ChecksumAlgorithm::Unsupported(label.trim().to_string())),
        }
    }
}

impl From<String> for ChecksumAlgorithm {
    fn from(value: String) -> Self {
        ChecksumAlgorithm::parse(&value).unwrap_or(ChecksumAlgorithm::Unsupported(value))
    }
}

impl From<ChecksumAlgorithm> for String {
    fn from(value: ChecksumAlgorithm) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Unsupported(label) => write!(f, "{label}"),
        }
    }
}

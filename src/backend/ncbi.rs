use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backend::{ArchiveBackend, HttpSession, UnitGranularity, parse_count};
use crate::config::SourceSettings;
use crate::domain::{
    Accession, ArchiveSource, FileDescriptor, FileType, Project, Run, Sample, SubmissionInfo,
};
use crate::error::HarvestError;
use crate::fs_util;
use crate::markup;

const ARCHIVE: &str = "NCBI";
const SUMMARY_CHUNK: usize = 200;

/// NCBI SRA through E-utilities: `esearch` for ids, `esummary` for the flat
/// per-id records, which are reassembled into the project hierarchy here.
/// Reads are fetched later by the retrieval tool, one run at a time.
#[derive(Clone)]
pub struct NcbiBackend {
    http: HttpSession,
    base_url: String,
    retmax: u32,
    api_key: Option<String>,
}

impl NcbiBackend {
    pub fn new(settings: &SourceSettings) -> Result<Self, HarvestError> {
        let api_key = std::env::var("NCBI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        Ok(Self {
            http: HttpSession::new(ARCHIVE, settings.timeout, settings.max_retries)?,
            base_url: settings.base_url.clone(),
            retmax: settings.retmax,
            api_key,
        })
    }

    fn with_key(&self, mut query: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(key) = &self.api_key {
            query.push(("api_key", key.clone()));
        }
        query
    }

    fn esearch(&self, db: &str, term: &str) -> Result<Vec<String>, HarvestError> {
        let url = format!("{}/esearch.fcgi", self.base_url);
        let query = self.with_key(vec![
            ("db", db.to_string()),
            ("term", term.to_string()),
            ("retmode", "json".to_string()),
            ("retmax", self.retmax.to_string()),
        ]);
        let payload = self.http.get_json(&url, &query)?;
        let ids = id_list(&payload);
        debug!(db, term, count = ids.len(), "esearch");
        Ok(ids)
    }

    fn esummary(&self, db: &str, ids: &[String]) -> Result<Vec<Value>, HarvestError> {
        let url = format!("{}/esummary.fcgi", self.base_url);
        let mut records = Vec::new();
        for chunk in ids.chunks(SUMMARY_CHUNK) {
            let query = self.with_key(vec![
                ("db", db.to_string()),
                ("id", chunk.join(",")),
                ("retmode", "json".to_string()),
            ]);
            let payload = self.http.get_json(&url, &query)?;
            records.extend(summary_records(&payload));
        }
        Ok(records)
    }

    fn sra_records(&self, term: &str) -> Result<Vec<Value>, HarvestError> {
        let ids = self.esearch("sra", term)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.esummary("sra", &ids)
    }

    fn lookup_project(&self, accession: &str) -> Result<Option<Project>, HarvestError> {
        let ids = self.esearch("bioproject", &format!("{accession}[Project Accession]"))?;
        if ids.is_empty() {
            return Ok(None);
        }
        let records = self.esummary("bioproject", &ids)?;
        let project = records
            .iter()
            .filter_map(project_from_bioproject)
            .find(|project| project.accession.eq_ignore_ascii_case(accession));
        Ok(project)
    }
}

impl ArchiveBackend for NcbiBackend {
    fn source(&self) -> ArchiveSource {
        ArchiveSource::Ncbi
    }

    fn unit_granularity(&self) -> UnitGranularity {
        UnitGranularity::Runs
    }

    fn resolve_project(&self, accession: &Accession) -> Option<Project> {
        match self.lookup_project(accession.as_str()) {
            Ok(Some(project)) => Some(project),
            Ok(None) => {
                warn!(%accession, "BioProject not found");
                None
            }
            Err(err) => {
                error!(%accession, "error resolving BioProject: {err}");
                None
            }
        }
    }

    fn list_samples(&self, project: &Project) -> Vec<Sample> {
        info!(project = %project.accession, "getting samples");
        match self.sra_records(&project_term(&project.accession)) {
            Ok(records) => {
                let samples = samples_from_summaries(&records);
                info!(project = %project.accession, count = samples.len(), "found samples");
                samples
            }
            Err(err) => {
                error!(project = %project.accession, "error getting samples: {err}");
                Vec::new()
            }
        }
    }

    fn list_runs(&self, sample: &Sample) -> Vec<Run> {
        info!(sample = %sample.accession, "getting runs");
        match self.sra_records(&sample.accession) {
            Ok(records) => {
                let runs = runs_from_summaries(&records, &sample.accession);
                info!(sample = %sample.accession, count = runs.len(), "found runs");
                runs
            }
            Err(err) => {
                error!(sample = %sample.accession, "error getting runs: {err}");
                Vec::new()
            }
        }
    }

    fn search(&self, keywords: &[String]) -> Vec<Project> {
        let mut projects = Vec::new();
        for keyword in keywords {
            info!(%keyword, "searching NCBI SRA");
            let term = format!(r#""{keyword}"[Title/Abstract] AND "WGS"[Strategy]"#);
            match self.sra_records(&term) {
                Ok(records) => projects.extend(projects_from_summaries(&records, keyword)),
                Err(err) => error!(%keyword, "error searching NCBI SRA: {err}"),
            }
        }
        info!(count = projects.len(), "NCBI search complete");
        projects
    }
}

fn project_term(accession: &str) -> String {
    if accession.to_ascii_uppercase().starts_with("PRJ") {
        format!("{accession}[BioProject]")
    } else {
        format!("{accession}[Accession]")
    }
}

pub fn id_list(payload: &Value) -> Vec<String> {
    payload["esearchresult"]["idlist"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Per-id records from an `esummary` payload, in `uids` order. Ids the
/// service reports an error for are dropped.
pub fn summary_records(payload: &Value) -> Vec<Value> {
    let Some(uids) = payload["result"]["uids"].as_array() else {
        return Vec::new();
    };
    uids.iter()
        .filter_map(|uid| uid.as_str())
        .filter_map(|uid| {
            let record = &payload["result"][uid];
            if record.is_object() && record.get("error").is_none() {
                Some(record.clone())
            } else {
                None
            }
        })
        .collect()
}

fn field(record: &Value, key: &str) -> Option<String> {
    record[key]
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn project_from_bioproject(record: &Value) -> Option<Project> {
    Some(Project {
        accession: field(record, "project_acc")?,
        title: field(record, "project_title").unwrap_or_default(),
        description: field(record, "project_description").unwrap_or_default(),
        submission: SubmissionInfo {
            submission_date: field(record, "registration_date"),
            center_name: field(record, "submitter_organization")
                .or_else(|| field(record, "organization")),
            broker_name: None,
        },
        source: ArchiveSource::Ncbi,
        keyword: None,
    })
}

/// One SRA experiment record with its `expxml` fragment unpacked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentSummary {
    pub title: String,
    pub platform: Option<String>,
    pub instrument_model: Option<String>,
    pub experiment_accession: Option<String>,
    pub study_accession: Option<String>,
    pub study_name: Option<String>,
    pub bioproject: Option<String>,
    pub biosample: Option<String>,
    pub sample_accession: Option<String>,
    pub sample_name: Option<String>,
    pub taxon_id: Option<String>,
    pub organism: Option<String>,
    pub center_name: Option<String>,
    pub library: BTreeMap<String, String>,
    pub create_date: Option<String>,
    pub runs: Vec<RunStub>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStub {
    pub accession: String,
    pub total_spots: Option<u64>,
    pub total_bases: Option<u64>,
}

pub fn experiment_summary(record: &Value) -> ExperimentSummary {
    let expxml = record["expxml"].as_str().unwrap_or_default();
    let runs_xml = record["runs"].as_str().unwrap_or_default();
    let attr = |tag: &str, name: &str| {
        markup::first(expxml, tag).and_then(|element| element.attr(name).map(str::to_string))
    };

    let platform = markup::first(expxml, "Platform");
    let library = markup::first(expxml, "Library_descriptor")
        .map(|descriptor| {
            ["LIBRARY_STRATEGY", "LIBRARY_SOURCE", "LIBRARY_SELECTION"]
                .iter()
                .filter_map(|tag| {
                    descriptor
                        .child_text(tag)
                        .map(|value| (tag.to_ascii_lowercase(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    let runs = markup::elements(runs_xml, "Run")
        .iter()
        .filter_map(|run| {
            Some(RunStub {
                accession: run.attr("acc")?.to_string(),
                total_spots: parse_count(run.attr("total_spots")),
                total_bases: parse_count(run.attr("total_bases")),
            })
        })
        .collect();

    ExperimentSummary {
        title: markup::child_text(expxml, "Title").unwrap_or_default(),
        platform: platform.as_ref().map(|p| p.text()).filter(|t| !t.is_empty()),
        instrument_model: platform
            .as_ref()
            .and_then(|p| p.attr("instrument_model").map(str::to_string)),
        experiment_accession: attr("Experiment", "acc"),
        study_accession: attr("Study", "acc"),
        study_name: attr("Study", "name"),
        bioproject: markup::child_text(expxml, "Bioproject"),
        biosample: markup::child_text(expxml, "Biosample"),
        sample_accession: attr("Sample", "acc"),
        sample_name: attr("Sample", "name"),
        taxon_id: attr("Organism", "taxid"),
        organism: attr("Organism", "ScientificName"),
        center_name: attr("Submitter", "center_name"),
        library,
        create_date: field(record, "createdate"),
        runs,
    }
}

/// Distinct samples in first-seen order.
pub fn samples_from_summaries(records: &[Value]) -> Vec<Sample> {
    let mut samples: Vec<Sample> = Vec::new();
    for summary in records.iter().map(experiment_summary) {
        let Some(accession) = summary.sample_accession.clone() else {
            continue;
        };
        if samples.iter().any(|sample| sample.accession == accession) {
            continue;
        }
        let mut attributes = summary.library.clone();
        if let Some(biosample) = &summary.biosample {
            attributes.insert("biosample".to_string(), biosample.clone());
        }
        if let Some(organism) = &summary.organism {
            attributes.insert("scientific_name".to_string(), organism.clone());
        }
        samples.push(Sample {
            accession,
            title: summary.sample_name.clone().unwrap_or(summary.title.clone()),
            description: String::new(),
            taxon_id: summary.taxon_id.clone(),
            submission_date: summary.create_date.clone(),
            attributes,
        });
    }
    samples
}

/// Runs of experiments that belong to `sample_accession`. The retrieval tool
/// works from the run accession alone, so each run carries a single
/// descriptor with no checksum.
pub fn runs_from_summaries(records: &[Value], sample_accession: &str) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for summary in records.iter().map(experiment_summary) {
        if summary.sample_accession.as_deref() != Some(sample_accession) {
            continue;
        }
        for stub in &summary.runs {
            if runs.iter().any(|run| run.accession == stub.accession) {
                continue;
            }
            if !fs_util::is_safe_name(&stub.accession) {
                warn!(run = %stub.accession, "skipping run with unusable accession");
                continue;
            }
            runs.push(Run {
                accession: stub.accession.clone(),
                title: summary.title.clone(),
                instrument_platform: summary.platform.clone(),
                instrument_model: summary.instrument_model.clone(),
                base_count: stub.total_bases,
                read_count: stub.total_spots,
                run_date: summary.create_date.clone(),
                experiment_accession: summary.experiment_accession.clone(),
                study_accession: summary.study_accession.clone(),
                files: vec![FileDescriptor {
                    filename: stub.accession.clone(),
                    file_type: FileType::Sra,
                    checksum: None,
                    checksum_algorithm: None,
                    unencrypted_checksum: None,
                    unencrypted_checksum_algorithm: None,
                    locator: stub.accession.clone(),
                }],
                ..Run::default()
            });
        }
    }
    runs
}

/// Projects behind search hits, one per distinct project within a keyword.
pub fn projects_from_summaries(records: &[Value], keyword: &str) -> Vec<Project> {
    let mut projects: Vec<Project> = Vec::new();
    for summary in records.iter().map(experiment_summary) {
        let Some(accession) = summary
            .bioproject
            .clone()
            .or_else(|| summary.study_accession.clone())
        else {
            continue;
        };
        if projects.iter().any(|project| project.accession == accession) {
            continue;
        }
        projects.push(Project {
            accession,
            title: summary.study_name.clone().unwrap_or(summary.title.clone()),
            description: String::new(),
            submission: SubmissionInfo {
                submission_date: summary.create_date.clone(),
                center_name: summary.center_name.clone(),
                broker_name: None,
            },
            source: ArchiveSource::Ncbi,
            keyword: Some(keyword.to_string()),
        });
    }
    projects
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sra_payload() -> Value {
        json!({
            "header": {"type": "esummary", "version": "0.3"},
            "result": {
                "uids": ["101", "102", "103", "104"],
                "101": {
                    "uid": "101",
                    "expxml": "<Summary><Title>cfDNA WGS plasma 1</Title><Platform instrument_model=\"Illumina NovaSeq 6000\">ILLUMINA</Platform><Statistics total_runs=\"2\"/></Summary><Submitter acc=\"SRA1\" center_name=\"BROAD\"/><Experiment acc=\"SRX1\"/><Study acc=\"SRP1\" name=\"cfDNA fragmentation\"/><Organism taxid=\"9606\" ScientificName=\"Homo sapiens\"/><Sample acc=\"SRS1\" name=\"plasma-1\"/><Library_descriptor><LIBRARY_NAME>L1</LIBRARY_NAME><LIBRARY_STRATEGY>WGS</LIBRARY_STRATEGY><LIBRARY_SOURCE>GENOMIC</LIBRARY_SOURCE></Library_descriptor><Bioproject>PRJNA1</Bioproject><Biosample>SAMN1</Biosample>",
                    "runs": "<Run acc=\"SRR11\" total_spots=\"100\" total_bases=\"15000\" load_done=\"true\"/><Run acc=\"SRR12\" total_spots=\"50\" total_bases=\"7500\"/>",
                    "createdate": "2021/03/04"
                },
                "102": {
                    "uid": "102",
                    "expxml": "<Summary><Title>cfDNA WGS plasma 2</Title></Summary><Experiment acc=\"SRX2\"/><Study acc=\"SRP1\" name=\"cfDNA fragmentation\"/><Sample acc=\"SRS2\" name=\"\"/><Bioproject>PRJNA1</Bioproject>",
                    "runs": "<Run acc=\"SRR21\" total_spots=\"\" total_bases=\"\"/>",
                    "createdate": ""
                },
                "103": {
                    "uid": "103",
                    "expxml": "<Summary><Title>cfDNA WGS plasma 1 rerun</Title></Summary><Experiment acc=\"SRX3\"/><Study acc=\"SRP1\"/><Sample acc=\"SRS1\" name=\"plasma-1\"/><Bioproject>PRJNA1</Bioproject>",
                    "runs": "<Run acc=\"SRR13\" total_spots=\"10\" total_bases=\"1500\"/>"
                },
                "104": {"error": "cannot get document summary"}
            }
        })
    }

    #[test]
    fn reads_esearch_ids() {
        let payload = json!({"esearchresult": {"count": "2", "idlist": ["7", "9"]}});
        assert_eq!(id_list(&payload), vec!["7", "9"]);
        assert!(id_list(&json!({})).is_empty());
    }

    #[test]
    fn summary_records_skip_errors() {
        let records = summary_records(&sra_payload());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["uid"], "101");
    }

    #[test]
    fn unpacks_experiment_xml() {
        let records = summary_records(&sra_payload());
        let summary = experiment_summary(&records[0]);
        assert_eq!(summary.title, "cfDNA WGS plasma 1");
        assert_eq!(summary.platform.as_deref(), Some("ILLUMINA"));
        assert_eq!(summary.instrument_model.as_deref(), Some("Illumina NovaSeq 6000"));
        assert_eq!(summary.sample_accession.as_deref(), Some("SRS1"));
        assert_eq!(summary.taxon_id.as_deref(), Some("9606"));
        assert_eq!(summary.library.get("library_strategy").map(String::as_str), Some("WGS"));
        assert!(!summary.library.contains_key("library_name"));
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.runs[0].total_bases, Some(15000));
    }

    #[test]
    fn groups_samples_in_first_seen_order() {
        let records = summary_records(&sra_payload());
        let samples = samples_from_summaries(&records);
        let accessions = samples.iter().map(|s| s.accession.as_str()).collect::<Vec<_>>();
        assert_eq!(accessions, vec!["SRS1", "SRS2"]);
        assert_eq!(samples[0].title, "plasma-1");
        assert_eq!(samples[0].attributes.get("biosample").map(String::as_str), Some("SAMN1"));
        // empty sample name falls back to the experiment title
        assert_eq!(samples[1].title, "cfDNA WGS plasma 2");
    }

    #[test]
    fn runs_are_filtered_by_sample() {
        let records = summary_records(&sra_payload());
        let runs = runs_from_summaries(&records, "SRS1");
        let accessions = runs.iter().map(|r| r.accession.as_str()).collect::<Vec<_>>();
        assert_eq!(accessions, vec!["SRR11", "SRR12", "SRR13"]);
        assert_eq!(runs[0].read_count, Some(100));
        assert_eq!(runs[0].experiment_accession.as_deref(), Some("SRX1"));
        assert_eq!(runs[2].experiment_accession.as_deref(), Some("SRX3"));
        assert_eq!(runs[0].files.len(), 1);
        assert!(runs[0].files[0].checksum.is_none());
        assert_eq!(runs[0].files[0].locator, "SRR11");

        let other = runs_from_summaries(&records, "SRS2");
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].read_count, None);
    }

    #[test]
    fn option_like_run_accessions_are_dropped() {
        let records = vec![json!({
            "uid": "201",
            "expxml": "<Summary><Title>t</Title></Summary><Sample acc=\"SRS9\" name=\"\"/>",
            "runs": "<Run acc=\"--split-spot\" total_spots=\"1\"/><Run acc=\"SRR91\" total_spots=\"1\"/>"
        })];
        let runs = runs_from_summaries(&records, "SRS9");
        let accessions = runs.iter().map(|r| r.accession.as_str()).collect::<Vec<_>>();
        assert_eq!(accessions, vec!["SRR91"]);
    }

    #[test]
    fn search_hits_collapse_per_project() {
        let records = summary_records(&sra_payload());
        let projects = projects_from_summaries(&records, "cfDNA");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].accession, "PRJNA1");
        assert_eq!(projects[0].title, "cfDNA fragmentation");
        assert_eq!(projects[0].submission.center_name.as_deref(), Some("BROAD"));
        assert_eq!(projects[0].keyword.as_deref(), Some("cfDNA"));
    }

    #[test]
    fn bioproject_record() {
        let record = json!({
            "uid": "5",
            "project_acc": "PRJNA5",
            "project_title": "Cell-free DNA atlas",
            "project_description": "Plasma WGS",
            "registration_date": "2019/01/01 00:00"
        });
        let project = project_from_bioproject(&record).unwrap();
        assert_eq!(project.accession, "PRJNA5");
        assert_eq!(project.title, "Cell-free DNA atlas");
        assert_eq!(project.source, ArchiveSource::Ncbi);
        assert!(project_from_bioproject(&json!({"uid": "6"})).is_none());
    }

    #[test]
    fn project_terms() {
        assert_eq!(project_term("PRJNA1"), "PRJNA1[BioProject]");
        assert_eq!(project_term("SRP1"), "SRP1[Accession]");
    }
}

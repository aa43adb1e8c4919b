use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::backend::{ArchiveBackend, HttpSession, UnitGranularity, parse_count};
use crate::config::SourceSettings;
use crate::domain::{
    Accession, ArchiveSource, ChecksumAlgorithm, FileDescriptor, FileType, Project, Run, Sample,
    SubmissionInfo,
};
use crate::error::HarvestError;
use crate::fs_util;
use crate::markup::{self, Element};

const ARCHIVE: &str = "ENA";

/// European Nucleotide Archive: XML records fetched per accession from the
/// browser API, files served from the FASTQ mirror.
pub struct EnaBackend {
    http: HttpSession,
    base_url: String,
    ftp_base: String,
    /// Project records kept from `resolve_project` until samples are listed.
    project_records: Mutex<HashMap<String, String>>,
}

impl EnaBackend {
    pub fn new(settings: &SourceSettings) -> Result<Self, HarvestError> {
        let ftp_base = settings
            .ftp_base
            .clone()
            .ok_or_else(|| HarvestError::InvalidConfig("sources.ena.ftp_base".to_string()))?;
        Ok(Self {
            http: HttpSession::new(ARCHIVE, settings.timeout, settings.max_retries)?,
            base_url: settings.base_url.clone(),
            ftp_base,
            project_records: Mutex::default(),
        })
    }

    fn fetch_record(&self, accession: &str) -> Result<String, HarvestError> {
        let url = format!("{}/{}", self.base_url, accession);
        self.http.get_text(&url, &[])
    }

    fn remember_project_record(&self, accession: &str, xml: String) {
        if let Ok(mut records) = self.project_records.lock() {
            records.insert(accession.to_string(), xml);
        }
    }

    fn take_project_record(&self, accession: &str) -> Option<String> {
        self.project_records
            .lock()
            .ok()
            .and_then(|mut records| records.remove(accession))
    }

    fn search_keyword(&self, keyword: &str) -> Result<Vec<Project>, HarvestError> {
        let url = format!("{}/search", self.base_url);
        let query = [
            (
                "query",
                format!(r#"study_title:"{keyword}" OR study_description:"{keyword}""#),
            ),
            ("result", "study".to_string()),
            ("format", "xml".to_string()),
        ];
        let xml = self.http.get_text(&url, &query)?;
        Ok(parse_studies(&xml, Some(keyword)))
    }
}

impl ArchiveBackend for EnaBackend {
    fn source(&self) -> ArchiveSource {
        ArchiveSource::Ena
    }

    fn unit_granularity(&self) -> UnitGranularity {
        UnitGranularity::Files
    }

    fn resolve_project(&self, accession: &Accession) -> Option<Project> {
        match self.fetch_record(accession.as_str()) {
            Ok(xml) => {
                let project = parse_project(&xml, accession.as_str());
                match &project {
                    Some(_) => self.remember_project_record(accession.as_str(), xml),
                    None => warn!(%accession, "ENA record did not describe this project or study"),
                }
                project
            }
            Err(err) => {
                error!(%accession, "error resolving ENA project: {err}");
                None
            }
        }
    }

    fn list_samples(&self, project: &Project) -> Vec<Sample> {
        info!(project = %project.accession, "getting samples");
        let record = match self.take_project_record(&project.accession) {
            Some(xml) => Ok(xml),
            None => self.fetch_record(&project.accession),
        };
        match record {
            Ok(xml) => {
                let samples = parse_samples(&xml);
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
        match self.fetch_record(&sample.accession) {
            Ok(xml) => {
                let runs = parse_runs(&xml, &self.ftp_base);
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
            info!(%keyword, "searching ENA");
            match self.search_keyword(keyword) {
                Ok(found) => projects.extend(found),
                Err(err) => error!(%keyword, "error searching ENA: {err}"),
            }
        }
        info!(count = projects.len(), "ENA search complete");
        projects
    }
}

/// `{ftp_base}/{first six characters of run}/{run}/{filename}`
pub fn ftp_locator(ftp_base: &str, run_accession: &str, filename: &str) -> String {
    let prefix = run_accession.get(..6).unwrap_or(run_accession);
    format!("{ftp_base}/{prefix}/{run_accession}/{filename}")
}

pub fn parse_project(xml: &str, accession: &str) -> Option<Project> {
    let candidates = markup::elements(xml, "PROJECT")
        .into_iter()
        .map(project_from_project_element)
        .chain(
            markup::elements(xml, "STUDY")
                .into_iter()
                .map(|study| project_from_study(&study, None)),
        )
        .flatten()
        .collect::<Vec<_>>();
    candidates
        .into_iter()
        .find(|project| project.accession == accession)
}

pub fn parse_studies(xml: &str, keyword: Option<&str>) -> Vec<Project> {
    markup::elements(xml, "STUDY")
        .iter()
        .filter_map(|study| project_from_study(study, keyword))
        .collect()
}

fn project_from_project_element(element: Element) -> Option<Project> {
    Some(Project {
        accession: element.attr("accession")?.to_string(),
        title: element.child_text("TITLE").unwrap_or_default(),
        description: element.child_text("DESCRIPTION").unwrap_or_default(),
        submission: submission_info(&element),
        source: ArchiveSource::Ena,
        keyword: None,
    })
}

fn project_from_study(study: &Element, keyword: Option<&str>) -> Option<Project> {
    let description = study
        .child_text("STUDY_DESCRIPTION")
        .or_else(|| study.child_text("STUDY_ABSTRACT"))
        .unwrap_or_default();
    Some(Project {
        accession: study.attr("accession")?.to_string(),
        title: study.child_text("STUDY_TITLE").unwrap_or_default(),
        description,
        submission: submission_info(study),
        source: ArchiveSource::Ena,
        keyword: keyword.map(str::to_string),
    })
}

fn submission_info(element: &Element) -> SubmissionInfo {
    SubmissionInfo {
        submission_date: element
            .attr("submission_date")
            .or_else(|| element.attr("first_public"))
            .map(str::to_string),
        center_name: element.attr("center_name").map(str::to_string),
        broker_name: element.attr("broker_name").map(str::to_string),
    }
}

pub fn parse_samples(xml: &str) -> Vec<Sample> {
    markup::elements(xml, "SAMPLE")
        .iter()
        .filter_map(|sample| {
            let accession = sample.attr("accession")?.to_string();
            let attributes = sample
                .children("SAMPLE_ATTRIBUTE")
                .iter()
                .filter_map(|attr| Some((attr.child_text("TAG")?, attr.child_text("VALUE")?)))
                .collect();
            let taxon_id = sample
                .attr("taxon_id")
                .map(str::to_string)
                .or_else(|| sample.child_text("TAXON_ID"));
            Some(Sample {
                accession,
                title: sample.child_text("TITLE").unwrap_or_default(),
                description: sample.child_text("DESCRIPTION").unwrap_or_default(),
                taxon_id,
                submission_date: sample.attr("submission_date").map(str::to_string),
                attributes,
            })
        })
        .collect()
}

pub fn parse_runs(xml: &str, ftp_base: &str) -> Vec<Run> {
    markup::elements(xml, "RUN")
        .iter()
        .filter_map(|run| {
            let accession = run.attr("accession")?.to_string();
            if !fs_util::is_safe_name(&accession) {
                warn!(run = %accession, "skipping run with unusable accession");
                return None;
            }
            let files = run
                .children("FILE")
                .iter()
                .filter_map(|file| file_descriptor(file, &accession, ftp_base))
                .collect();
            Some(Run {
                alias: run.attr("alias").map(str::to_string),
                title: run.child_text("TITLE").unwrap_or_default(),
                instrument_platform: run.attr("instrument_platform").map(str::to_string),
                instrument_model: run.attr("instrument_model").map(str::to_string),
                base_count: parse_count(run.attr("base_count")),
                read_count: parse_count(run.attr("read_count")),
                run_date: run.attr("run_date").map(str::to_string),
                experiment_accession: None,
                study_accession: None,
                files,
                accession,
            })
        })
        .collect()
}

fn file_descriptor(file: &Element, run_accession: &str, ftp_base: &str) -> Option<FileDescriptor> {
    // only the final path segment is used locally
    let filename = file.attr("filename")?.rsplit('/').next()?.to_string();
    if !fs_util::is_safe_name(&filename) {
        warn!(run = run_accession, %filename, "skipping file with unusable name");
        return None;
    }
    Some(FileDescriptor {
        locator: ftp_locator(ftp_base, run_accession, &filename),
        file_type: FileType::from(file.attr("filetype").unwrap_or_default()),
        checksum: file.attr("checksum").map(str::to_string),
        checksum_algorithm: file.attr("checksum_method").and_then(ChecksumAlgorithm::parse),
        unencrypted_checksum: file.attr("unencrypted_checksum").map(str::to_string),
        unencrypted_checksum_algorithm: file
            .attr("unencrypted_checksum_method")
            .and_then(ChecksumAlgorithm::parse),
        filename,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FTP: &str = "ftp://ftp.sra.ebi.ac.uk/vol1/fastq";

    const PROJECT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PROJECT_SET>
  <PROJECT accession="PRJEB1000" center_name="UCL" broker_name="EGA">
    <TITLE>Plasma cfDNA whole genome sequencing</TITLE>
    <DESCRIPTION>Low-pass WGS of cell-free DNA</DESCRIPTION>
  </PROJECT>
  <SAMPLE accession="ERS0001" taxon_id="9606" submission_date="2020-01-02">
    <TITLE>patient 1 plasma</TITLE>
    <SAMPLE_ATTRIBUTES>
      <SAMPLE_ATTRIBUTE><TAG>disease</TAG><VALUE>healthy</VALUE></SAMPLE_ATTRIBUTE>
      <SAMPLE_ATTRIBUTE><TAG>tissue</TAG><VALUE>plasma</VALUE></SAMPLE_ATTRIBUTE>
    </SAMPLE_ATTRIBUTES>
  </SAMPLE>
  <SAMPLE accession="ERS0002" taxon_id="9606">
    <TITLE>patient 2 plasma</TITLE>
  </SAMPLE>
</PROJECT_SET>"#;

    const RUN_XML: &str = r#"<RUN_SET>
  <RUN accession="ERR1234567" alias="run-a" instrument_platform="ILLUMINA"
       instrument_model="HiSeq 2500" base_count="1000" read_count="10" run_date="2020-02-03">
    <TITLE>Illumina run</TITLE>
    <DATA_BLOCK>
      <FILES>
        <FILE filename="ERR1234567_1.fastq.gz" filetype="fastq.gz" checksum_method="MD5"
              checksum="5d41402abc4b2a76b9719d911017c592"/>
        <FILE filename="sub/ERR1234567.bam" filetype="bam" checksum_method="CRC32" checksum="abcd"/>
      </FILES>
    </DATA_BLOCK>
    <RUN_ATTRIBUTES>
      <RUN_ATTRIBUTE><TAG>ENA-SPOT-COUNT</TAG><VALUE>10</VALUE></RUN_ATTRIBUTE>
    </RUN_ATTRIBUTES>
  </RUN>
</RUN_SET>"#;

    #[test]
    fn locator_uses_six_character_prefix() {
        assert_eq!(
            ftp_locator(FTP, "ERR1234567", "ERR1234567_1.fastq.gz"),
            "ftp://ftp.sra.ebi.ac.uk/vol1/fastq/ERR123/ERR1234567/ERR1234567_1.fastq.gz"
        );
        assert_eq!(ftp_locator("ftp://h", "ERR1", "a"), "ftp://h/ERR1/ERR1/a");
    }

    #[test]
    fn parses_project_record() {
        let project = parse_project(PROJECT_XML, "PRJEB1000").unwrap();
        assert_eq!(project.title, "Plasma cfDNA whole genome sequencing");
        assert_eq!(project.description, "Low-pass WGS of cell-free DNA");
        assert_eq!(project.submission.center_name.as_deref(), Some("UCL"));
        assert_eq!(project.source, ArchiveSource::Ena);
    }

    #[test]
    fn project_must_match_requested_accession() {
        assert!(parse_project(PROJECT_XML, "PRJEB9999").is_none());
    }

    #[test]
    fn unusable_names_are_dropped() {
        let xml = r#"<RUN_SET>
  <RUN accession="ERR1">
    <FILE filename="ERR1_1.fastq.gz" filetype="fastq.gz"/>
    <FILE filename="-O" filetype="fastq.gz"/>
    <FILE filename="up/.." filetype="fastq.gz"/>
  </RUN>
  <RUN accession="--execute=x">
    <FILE filename="ok.fastq.gz" filetype="fastq.gz"/>
  </RUN>
</RUN_SET>"#;
        let runs = parse_runs(xml, FTP);
        assert_eq!(runs.len(), 1);
        let names = runs[0]
            .files
            .iter()
            .map(|file| file.filename.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["ERR1_1.fastq.gz"]);
    }

    #[test]
    fn listing_samples_reuses_the_resolved_record() {
        let settings = SourceSettings {
            // nothing listens here; any request fails
            base_url: "http://127.0.0.1:9".to_string(),
            ftp_base: Some(FTP.to_string()),
            timeout: std::time::Duration::from_secs(2),
            max_retries: 0,
            retmax: 0,
        };
        let backend = EnaBackend::new(&settings).unwrap();
        let project = parse_project(PROJECT_XML, "PRJEB1000").unwrap();
        backend.remember_project_record("PRJEB1000", PROJECT_XML.to_string());

        let samples = backend.list_samples(&project);
        assert_eq!(samples.len(), 2);
        assert!(backend.take_project_record("PRJEB1000").is_none());
    }

    #[test]
    fn parses_samples_with_attributes() {
        let samples = parse_samples(PROJECT_XML);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].accession, "ERS0001");
        assert_eq!(samples[0].taxon_id.as_deref(), Some("9606"));
        assert_eq!(samples[0].attributes.get("tissue").map(String::as_str), Some("plasma"));
        assert_eq!(samples[0].attributes.len(), 2);
        assert!(samples[1].attributes.is_empty());
    }

    #[test]
    fn parses_runs_and_files() {
        let runs = parse_runs(RUN_XML, FTP);
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.accession, "ERR1234567");
        assert_eq!(run.instrument_model.as_deref(), Some("HiSeq 2500"));
        assert_eq!(run.base_count, Some(1000));
        assert_eq!(run.files.len(), 2);

        let fastq = &run.files[0];
        assert!(fastq.file_type.is_sequence_reads());
        assert_eq!(fastq.checksum_algorithm, Some(ChecksumAlgorithm::Md5));
        assert!(fastq.locator.ends_with("/ERR123/ERR1234567/ERR1234567_1.fastq.gz"));

        let bam = &run.files[1];
        assert_eq!(bam.filename, "ERR1234567.bam");
        assert!(!bam.file_type.is_sequence_reads());
        assert_eq!(
            bam.checksum_algorithm,
            Some(ChecksumAlgorithm::Unsupported("CRC32".to_string()))
        );
    }

    #[test]
    fn search_results_carry_keyword() {
        let xml = r#"<STUDY_SET>
  <STUDY accession="ERP001" center_name="X">
    <DESCRIPTOR><STUDY_TITLE>cfDNA study</STUDY_TITLE><STUDY_ABSTRACT>abs</STUDY_ABSTRACT></DESCRIPTOR>
  </STUDY>
  <STUDY alias="missing accession"/>
</STUDY_SET>"#;
        let projects = parse_studies(xml, Some("cfDNA"));
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].title, "cfDNA study");
        assert_eq!(projects[0].description, "abs");
        assert_eq!(projects[0].keyword.as_deref(), Some("cfDNA"));
    }
}

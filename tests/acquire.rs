use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;

use seqharvest::app::{App, ProgressEvent, ProgressSink};
use seqharvest::backend::{ArchiveBackend, UnitGranularity};
use seqharvest::checksum::ChecksumValidator;
use seqharvest::domain::{
    Accession, ArchiveSource, ChecksumAlgorithm, FileDescriptor, FileType, Project, Run, Sample,
    SubmissionInfo,
};
use seqharvest::error::HarvestError;
use seqharvest::recorder::{HierarchyRecord, MetadataRecorder};
use seqharvest::scheduler::{AcquireLimits, AcquisitionSummary, DownloadScheduler};
use seqharvest::store::Store;
use seqharvest::transfer::{TransferExecutor, TransferSettings};
use seqharvest::transport::{CommandOutput, CommandSpec, Transport};

const HELLO: &[u8] = b"hello";
const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

struct Quiet;

impl ProgressSink for Quiet {
    fn event(&self, _event: ProgressEvent) {}
}

struct MockBackend {
    granularity: UnitGranularity,
    resolvable: bool,
    samples: Vec<(Sample, Vec<Run>)>,
    run_listings: Mutex<usize>,
}

impl MockBackend {
    fn files(samples: Vec<(Sample, Vec<Run>)>) -> Self {
        Self {
            granularity: UnitGranularity::Files,
            resolvable: true,
            samples,
            run_listings: Mutex::new(0),
        }
    }

    fn runs(samples: Vec<(Sample, Vec<Run>)>) -> Self {
        Self {
            granularity: UnitGranularity::Runs,
            ..Self::files(samples)
        }
    }
}

impl ArchiveBackend for MockBackend {
    fn source(&self) -> ArchiveSource {
        match self.granularity {
            UnitGranularity::Files => ArchiveSource::Ena,
            UnitGranularity::Runs => ArchiveSource::Ncbi,
        }
    }

    fn unit_granularity(&self) -> UnitGranularity {
        self.granularity
    }

    fn resolve_project(&self, accession: &Accession) -> Option<Project> {
        self.resolvable.then(|| Project {
            accession: accession.as_str().to_string(),
            title: "cfDNA plasma WGS".to_string(),
            description: String::new(),
            submission: SubmissionInfo::default(),
            source: self.source(),
            keyword: None,
        })
    }

    fn list_samples(&self, _project: &Project) -> Vec<Sample> {
        self.samples.iter().map(|(sample, _)| sample.clone()).collect()
    }

    fn list_runs(&self, sample: &Sample) -> Vec<Run> {
        *self.run_listings.lock().unwrap() += 1;
        self.samples
            .iter()
            .find(|(candidate, _)| candidate.accession == sample.accession)
            .map(|(_, runs)| runs.clone())
            .unwrap_or_default()
    }

    fn search(&self, _keywords: &[String]) -> Vec<Project> {
        Vec::new()
    }
}

/// Writes `payloads[locator]` (default `hello`) to the requested output,
/// or `{run}_1.fastq` and `{run}_2.fastq` for run retrievals.
#[derive(Default)]
struct FakeTransport {
    payloads: HashMap<String, &'static [u8]>,
    failing: Vec<String>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeTransport {
    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Transport for FakeTransport {
    fn execute(
        &self,
        command: &CommandSpec,
        _timeout: Duration,
    ) -> Result<CommandOutput, HarvestError> {
        self.calls.lock().unwrap().push(command.clone());
        let target = command.args.last().cloned().unwrap_or_default();
        if self.failing.contains(&target) {
            return Ok(CommandOutput {
                status: Some(8),
                stderr: "ERROR 550: No such file".to_string(),
                ..CommandOutput::default()
            });
        }
        if let Some(dest) = command.flag_value("--output-document") {
            let bytes = self.payloads.get(&target).copied().unwrap_or(HELLO);
            std::fs::write(dest, bytes).unwrap();
        } else {
            let dir = Path::new(command.flag_value("--outdir").unwrap());
            std::fs::write(dir.join(format!("{target}_1.fastq")), b"@r1\nACGT\n+\nIIII\n").unwrap();
            std::fs::write(dir.join(format!("{target}_2.fastq")), b"@r2\nTGCA\n+\nIIII\n").unwrap();
        }
        Ok(CommandOutput {
            status: Some(0),
            ..CommandOutput::default()
        })
    }
}

fn sample(accession: &str) -> Sample {
    Sample {
        accession: accession.to_string(),
        title: format!("{accession} plasma"),
        description: String::new(),
        taxon_id: Some("9606".to_string()),
        submission_date: None,
        attributes: BTreeMap::new(),
    }
}

fn run_with_file(run: &str) -> Run {
    let filename = format!("{run}_1.fastq.gz");
    Run {
        accession: run.to_string(),
        files: vec![FileDescriptor {
            locator: format!("ftp://mirror/{run}/{filename}"),
            filename,
            file_type: FileType::FastqGz,
            checksum: Some(HELLO_MD5.to_string()),
            checksum_algorithm: Some(ChecksumAlgorithm::Md5),
            unencrypted_checksum: None,
            unencrypted_checksum_algorithm: None,
        }],
        ..Run::default()
    }
}

fn settings() -> TransferSettings {
    TransferSettings {
        timeout: Duration::from_secs(5),
        max_retries: 2,
        retry_delay: Duration::ZERO,
        threads: 2,
        min_read_length: 30,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Store,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = Store::new_with_root(&root);
    store.ensure_layout().unwrap();
    Fixture { _dir: dir, store }
}

fn app(
    fixture: &Fixture,
    backend: MockBackend,
    transport: FakeTransport,
) -> App<MockBackend, TransferExecutor<FakeTransport>> {
    let executor = TransferExecutor::new(transport, ChecksumValidator::new(true), settings());
    let scheduler = DownloadScheduler::new(4, fixture.store.raw_reads_dir().to_owned());
    App::new(
        backend,
        executor,
        scheduler,
        MetadataRecorder::new(fixture.store.clone()),
    )
}

fn two_sample_project() -> MockBackend {
    MockBackend::files(vec![
        (sample("SAMEA1"), vec![run_with_file("ERR0001")]),
        (sample("SAMEA2"), vec![run_with_file("ERR0002")]),
    ])
}

#[test]
fn acquires_project_and_records_both_snapshots() {
    let fixture = fixture();
    let app = app(&fixture, two_sample_project(), FakeTransport::default());
    let accession: Accession = "PRJ001".parse().unwrap();

    let summary = app.acquire(&accession, AcquireLimits::default(), &Quiet);

    assert_eq!(summary.total_samples, 2);
    assert_eq!(summary.downloaded_samples, 2);
    assert_eq!(summary.failed_samples, 0);
    assert_eq!(summary.downloaded_files, 2);
    assert_eq!(summary.failed_files, 0);
    assert!(summary.errors.is_empty());

    let hierarchy: HierarchyRecord =
        Store::read_json(&fixture.store.hierarchy_path("PRJ001")).unwrap();
    assert_eq!(hierarchy.project_accession, "PRJ001");
    assert_eq!(hierarchy.samples.len(), 2);
    assert_eq!(hierarchy.samples[1].runs[0].accession, "ERR0002");

    let persisted: AcquisitionSummary =
        Store::read_json(&fixture.store.summary_path("PRJ001")).unwrap();
    assert_eq!(persisted, summary);
    assert!(fixture.store.raw_reads_dir().join("ERR0001_1.fastq.gz").exists());
}

#[test]
fn second_acquisition_skips_valid_files_without_transfers() {
    let fixture = fixture();
    let app = app(&fixture, two_sample_project(), FakeTransport::default());
    let accession: Accession = "PRJ001".parse().unwrap();

    app.acquire(&accession, AcquireLimits::default(), &Quiet);
    let calls_after_first = app.executor().transport().call_count();
    assert_eq!(calls_after_first, 2);

    let second = app.acquire(&accession, AcquireLimits::default(), &Quiet);
    assert_eq!(app.executor().transport().call_count(), calls_after_first);
    assert_eq!(second.skipped_files, 2);
    assert_eq!(second.downloaded_files, 2);
    assert_eq!(second.downloaded_samples, 2);
}

#[test]
fn truncates_to_first_samples_in_archive_order() {
    let fixture = fixture();
    let samples = (0..10)
        .map(|idx| {
            (
                sample(&format!("SAMEA{idx}")),
                vec![run_with_file(&format!("ERR00{idx}"))],
            )
        })
        .collect();
    let app = app(&fixture, MockBackend::files(samples), FakeTransport::default());
    let accession: Accession = "PRJ010".parse().unwrap();

    let summary = app.acquire(&accession, AcquireLimits::samples(3), &Quiet);

    assert_eq!(summary.total_samples, 3);
    assert_eq!(summary.downloaded_files, 3);
    assert_eq!(*app.backend().run_listings.lock().unwrap(), 3);
    let hierarchy: HierarchyRecord =
        Store::read_json(&fixture.store.hierarchy_path("PRJ010")).unwrap();
    let recorded = hierarchy
        .samples
        .iter()
        .map(|s| s.sample.accession.as_str())
        .collect::<Vec<_>>();
    assert_eq!(recorded, vec!["SAMEA0", "SAMEA1", "SAMEA2"]);
}

#[test]
fn corrupt_download_is_removed_and_reported() {
    let fixture = fixture();
    let mut transport = FakeTransport::default();
    transport
        .payloads
        .insert("ftp://mirror/ERR0001/ERR0001_1.fastq.gz".to_string(), b"hellx");
    let app = app(&fixture, two_sample_project(), transport);
    let accession: Accession = "PRJ001".parse().unwrap();

    let summary = app.acquire(&accession, AcquireLimits::default(), &Quiet);

    assert_eq!(summary.failed_files, 1);
    assert_eq!(summary.downloaded_files, 1);
    assert_eq!(summary.failed_samples, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("checksum validation failed"));
    assert!(!fixture.store.raw_reads_dir().join("ERR0001_1.fastq.gz").exists());
}

#[test]
fn failing_sample_does_not_affect_siblings() {
    let fixture = fixture();
    let transport = FakeTransport {
        failing: vec!["ftp://mirror/ERR0002/ERR0002_1.fastq.gz".to_string()],
        ..FakeTransport::default()
    };
    let app = app(&fixture, two_sample_project(), transport);
    let accession: Accession = "PRJ001".parse().unwrap();

    let summary = app.acquire(&accession, AcquireLimits::default(), &Quiet);

    assert_eq!(summary.downloaded_samples, 1);
    assert_eq!(summary.failed_samples, 1);
    assert_eq!(summary.failed_runs, 1);
    assert!(summary.errors[0].contains("ERR0002_1.fastq.gz"));
    assert!(summary.errors[0].contains("No such file"));
    // both attempts of the retry budget were spent on the failing file
    assert_eq!(app.executor().transport().call_count(), 3);
}

#[test]
fn run_granularity_counts_produced_files() {
    let fixture = fixture();
    let backend = MockBackend::runs(vec![
        (
            sample("SRS1"),
            vec![
                Run {
                    accession: "SRR1".to_string(),
                    ..Run::default()
                },
                Run {
                    accession: "SRR2".to_string(),
                    ..Run::default()
                },
            ],
        ),
        (sample("SRS2"), Vec::new()),
    ]);
    let app = app(&fixture, backend, FakeTransport::default());
    let accession: Accession = "PRJNA9".parse().unwrap();

    let summary = app.acquire(&accession, AcquireLimits::default(), &Quiet);

    assert_eq!(summary.source, ArchiveSource::Ncbi);
    assert_eq!(summary.total_runs, 2);
    assert_eq!(summary.downloaded_runs, 2);
    assert_eq!(summary.downloaded_files, 4);
    assert_eq!(summary.failed_samples, 1);
    assert_eq!(summary.errors, vec!["No runs found for sample SRS2".to_string()]);

    let calls = app.executor().transport().calls.lock().unwrap().clone();
    assert!(calls.iter().all(|call| call.program == "fasterq-dump"));
    assert!(calls.iter().all(|call| call.flag_value("--min-read-len") == Some("30")));
}

#[test]
fn unresolved_project_still_acquires_samples() {
    let fixture = fixture();
    let backend = MockBackend {
        resolvable: false,
        ..two_sample_project()
    };
    let app = app(&fixture, backend, FakeTransport::default());
    let accession: Accession = "PRJ404".parse().unwrap();

    let summary = app.acquire(&accession, AcquireLimits::default(), &Quiet);

    assert_eq!(summary.project_accession, "PRJ404");
    assert_eq!(summary.downloaded_samples, 2);
    let hierarchy: HierarchyRecord =
        Store::read_json(&fixture.store.hierarchy_path("PRJ404")).unwrap();
    assert!(hierarchy.project.title.is_empty());
}

#[test]
fn recorder_failure_is_reported_in_summary() {
    let fixture = fixture();
    let metadata_dir = fixture.store.metadata_dir().to_owned();
    std::fs::remove_dir_all(metadata_dir.as_std_path()).unwrap();
    std::fs::write(metadata_dir.as_std_path(), b"not a directory").unwrap();
    let app = app(&fixture, two_sample_project(), FakeTransport::default());
    let accession: Accession = "PRJ001".parse().unwrap();

    let summary = app.acquire(&accession, AcquireLimits::default(), &Quiet);

    assert_eq!(summary.downloaded_files, 2);
    assert!(summary.errors[0].starts_with("Failed to record metadata"));
    assert!(
        summary
            .errors
            .last()
            .unwrap()
            .starts_with("Failed to record download summary")
    );
}

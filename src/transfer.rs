use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::checksum::ChecksumValidator;
use crate::config::ResolvedConfig;
use crate::domain::{ArchiveSource, FileDescriptor};
use crate::error::HarvestError;
use crate::fs_util;
use crate::transport::{CommandSpec, Transport};

const RESUMABLE_DOWNLOADER: &str = "wget";
const RUN_RETRIEVAL_TOOL: &str = "fasterq-dump";
const DEFAULT_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    SkippedAlreadyValid,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed | TransferState::SkippedAlreadyValid
        )
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::SkippedAlreadyValid
        )
    }
}

/// One schedulable acquisition unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub sample_accession: String,
    pub run_accession: String,
    pub kind: UnitKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// A single archive file fetched from `file.locator` to `destination`.
    File {
        file: FileDescriptor,
        destination: Utf8PathBuf,
    },
    /// A whole run materialized by the retrieval tool into `output_dir`.
    Run { output_dir: Utf8PathBuf },
}

impl TransferUnit {
    pub fn file(
        sample_accession: &str,
        run_accession: &str,
        file: FileDescriptor,
        destination: Utf8PathBuf,
    ) -> Self {
        Self {
            sample_accession: sample_accession.to_string(),
            run_accession: run_accession.to_string(),
            kind: UnitKind::File { file, destination },
        }
    }

    pub fn run(sample_accession: &str, run_accession: &str, output_dir: Utf8PathBuf) -> Self {
        Self {
            sample_accession: sample_accession.to_string(),
            run_accession: run_accession.to_string(),
            kind: UnitKind::Run { output_dir },
        }
    }

    pub fn label(&self) -> &str {
        match &self.kind {
            UnitKind::File { file, .. } => &file.filename,
            UnitKind::Run { .. } => &self.run_accession,
        }
    }
}

/// Terminal outcome of one unit. Only terminal states can be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub unit: String,
    pub sample_accession: String,
    pub run_accession: String,
    pub state: TransferState,
    /// Files present locally for this unit after the transfer.
    pub files: usize,
    pub message: Option<String>,
}

impl TransferResult {
    pub fn succeeded(unit: &TransferUnit, files: usize) -> Self {
        Self::terminal(unit, TransferState::Succeeded, files, None)
    }

    pub fn skipped(unit: &TransferUnit, files: usize) -> Self {
        Self::terminal(unit, TransferState::SkippedAlreadyValid, files, None)
    }

    pub fn failed(unit: &TransferUnit, message: impl Into<String>) -> Self {
        Self::terminal(unit, TransferState::Failed, 0, Some(message.into()))
    }

    fn terminal(
        unit: &TransferUnit,
        state: TransferState,
        files: usize,
        message: Option<String>,
    ) -> Self {
        Self {
            unit: unit.label().to_string(),
            sample_accession: unit.sample_accession.clone(),
            run_accession: unit.run_accession.clone(),
            state,
            files,
            message,
        }
    }
}

/// Anything that can drive a unit to a terminal state. Workers share one
/// executor, so implementations must be `Sync`.
pub trait UnitExecutor: Sync {
    fn execute(&self, unit: &TransferUnit) -> TransferResult;
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Hard wall-clock budget for one unit, retries included.
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub threads: usize,
    pub min_read_length: u32,
}

impl TransferSettings {
    pub fn from_config(config: &ResolvedConfig, source: ArchiveSource) -> Self {
        let settings = config.source(source);
        Self {
            timeout: settings.timeout,
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            threads: config.max_concurrent_downloads,
            min_read_length: config.min_read_length,
        }
    }
}

pub struct TransferExecutor<T: Transport> {
    transport: T,
    validator: ChecksumValidator,
    settings: TransferSettings,
}

impl<T: Transport> TransferExecutor<T> {
    pub fn new(transport: T, validator: ChecksumValidator, settings: TransferSettings) -> Self {
        Self {
            transport,
            validator,
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transfer(&self, unit: &TransferUnit) -> TransferResult {
        match &unit.kind {
            UnitKind::File { file, destination } => self.transfer_file(unit, file, destination),
            UnitKind::Run { output_dir } => self.transfer_run(unit, output_dir),
        }
    }

    fn transfer_file(
        &self,
        unit: &TransferUnit,
        file: &FileDescriptor,
        destination: &Utf8PathBuf,
    ) -> TransferResult {
        let path = destination.as_std_path();
        if path.exists() && self.validator.validate_file(path, file) {
            info!(file = %file.filename, "file already exists and is valid");
            return TransferResult::skipped(unit, 1);
        }

        info!(file = %file.filename, locator = %file.locator, "downloading");
        let outcome = self.run_transport(
            unit.label(),
            |remaining| {
                CommandSpec::new(RESUMABLE_DOWNLOADER)
                    .arg("--continue")
                    .arg("--timeout")
                    .arg(whole_seconds(remaining).to_string())
                    .arg("--tries")
                    .arg("1")
                    .arg("--output-document")
                    .arg(destination.as_str())
                    .arg(file.locator.as_str())
            },
            // keep the partial file so the next attempt continues from it
            || {},
        );

        match outcome {
            Ok(()) if self.validator.validate_file(path, file) => {
                info!(file = %file.filename, "download complete");
                TransferResult::succeeded(unit, 1)
            }
            Ok(()) => {
                error!(file = %file.filename, "file validation failed");
                fs_util::remove_artifact(path);
                TransferResult::failed(
                    unit,
                    HarvestError::ValidationFailure(file.filename.clone()).to_string(),
                )
            }
            Err(err) => {
                error!(file = %file.filename, "download failed: {err}");
                fs_util::remove_artifact(path);
                TransferResult::failed(unit, err.to_string())
            }
        }
    }

    fn transfer_run(&self, unit: &TransferUnit, output_dir: &Utf8PathBuf) -> TransferResult {
        let dir = output_dir.as_std_path();
        let run = unit.run_accession.as_str();

        // Known gap: without archive checksums, any non-empty prior output
        // counts as complete even if an earlier run was truncated.
        let existing = fs_util::run_outputs(dir, run);
        if !existing.is_empty() {
            if self.outputs_valid(&existing) {
                info!(run, files = existing.len(), "run already downloaded");
                return TransferResult::skipped(unit, existing.len());
            }
            warn!(run, files = existing.len(), "discarding incomplete run outputs");
            remove_run_outputs(dir, run);
        }

        info!(run, "retrieving run");
        let outcome = self.run_transport(
            run,
            |_| {
                CommandSpec::new(RUN_RETRIEVAL_TOOL)
                    .arg("--outdir")
                    .arg(output_dir.as_str())
                    .arg("--threads")
                    .arg(self.settings.threads.max(1).to_string())
                    .arg("--split-files")
                    .arg("--skip-technical")
                    .arg("--min-read-len")
                    .arg(self.settings.min_read_length.to_string())
                    .arg(run)
            },
            // the retrieval tool refuses to overwrite earlier outputs
            || remove_run_outputs(dir, run),
        );

        if let Err(err) = outcome {
            error!(run, "run retrieval failed: {err}");
            remove_run_outputs(dir, run);
            return TransferResult::failed(unit, err.to_string());
        }

        let produced = fs_util::run_outputs(dir, run);
        if produced.is_empty() {
            error!(run, "no FASTQ files created");
            return TransferResult::failed(unit, format!("No FASTQ files created for run {run}"));
        }
        if !self.outputs_valid(&produced) {
            error!(run, "run output validation failed");
            remove_run_outputs(dir, run);
            return TransferResult::failed(
                unit,
                HarvestError::ValidationFailure(run.to_string()).to_string(),
            );
        }
        info!(run, files = produced.len(), "run retrieved");
        TransferResult::succeeded(unit, produced.len())
    }

    fn outputs_valid(&self, outputs: &[std::path::PathBuf]) -> bool {
        outputs
            .iter()
            .all(|path| self.validator.validate(path, None, None))
    }

    /// Invokes the transport until it succeeds, the retry budget is spent or
    /// the unit's wall-clock budget runs out. Timeouts are never retried.
    fn run_transport<C, R>(
        &self,
        label: &str,
        mut command_for: C,
        before_retry: R,
    ) -> Result<(), HarvestError>
    where
        C: FnMut(Duration) -> CommandSpec,
        R: Fn(),
    {
        let started = Instant::now();
        let attempts = self.settings.max_retries.max(1);
        let timeout_error = || HarvestError::TransferTimeout {
            unit: label.to_string(),
            seconds: self.settings.timeout.as_secs(),
        };

        let mut last_message = String::new();
        for attempt in 1..=attempts {
            let remaining = self.settings.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(timeout_error());
            }
            let command = command_for(remaining);
            let output = self.transport.execute(&command, remaining)?;
            if output.timed_out {
                return Err(timeout_error());
            }
            if output.success() {
                return Ok(());
            }

            last_message = output.diagnostic(&command.program);
            warn!(unit = label, attempt, attempts, "transfer attempt failed: {last_message}");
            if attempt < attempts {
                before_retry();
                let remaining = self.settings.timeout.saturating_sub(started.elapsed());
                thread::sleep((self.settings.retry_delay * attempt).min(remaining));
            }
        }

        Err(HarvestError::TransferFailed {
            unit: label.to_string(),
            message: last_message,
        })
    }
}

impl<T: Transport> UnitExecutor for TransferExecutor<T> {
    fn execute(&self, unit: &TransferUnit) -> TransferResult {
        self.transfer(unit)
    }
}

fn remove_run_outputs(dir: &Path, run: &str) {
    for path in fs_util::run_outputs(dir, run) {
        fs_util::remove_artifact(&path);
    }
}

fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs().max(1)
}

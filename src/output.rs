use std::io::{self, Write};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink, SearchResult};
use crate::scheduler::AcquisitionSummary;
use crate::transfer::TransferState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summaries(summaries: &[AcquisitionSummary]) -> io::Result<()> {
        Self::print_json(&summaries)
    }

    pub fn print_search(result: &SearchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_summary(summary: &AcquisitionSummary) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        write_summary(&mut stdout, summary)
    }

    pub fn print_search(result: &SearchResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        write_search(&mut stdout, result)
    }
}

pub fn write_summary(out: &mut impl Write, summary: &AcquisitionSummary) -> io::Result<()> {
    writeln!(
        out,
        "{} ({}): {}/{} samples, {}/{} runs downloaded",
        summary.project_accession,
        summary.source,
        summary.downloaded_samples,
        summary.total_samples,
        summary.downloaded_runs,
        summary.total_runs
    )?;
    writeln!(
        out,
        "  files: {} downloaded ({} already valid), {} failed",
        summary.downloaded_files, summary.skipped_files, summary.failed_files
    )?;
    for error in &summary.errors {
        writeln!(out, "  error: {error}")?;
    }
    Ok(())
}

pub fn write_search(out: &mut impl Write, result: &SearchResult) -> io::Result<()> {
    writeln!(
        out,
        "{} projects found on {}",
        result.projects.len(),
        result.source
    )?;
    for project in &result.projects {
        let keyword = project.keyword.as_deref().unwrap_or("-");
        writeln!(out, "  {} [{keyword}] {}", project.accession, project.title)?;
    }
    Ok(())
}

/// Forwards progress to the tracing subscriber.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match (event.state, event.elapsed) {
            (None, _) => debug!("{}", event.message),
            (Some(TransferState::Failed), elapsed) => warn!(
                unit = %event.message,
                elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
                "failed"
            ),
            (Some(state), Some(elapsed)) => info!(
                unit = %event.message,
                ?state,
                elapsed_ms = elapsed.as_millis() as u64,
                "finished"
            ),
            (Some(state), None) => debug!(unit = %event.message, ?state, "started"),
        }
    }
}

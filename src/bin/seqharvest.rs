use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing::warn;

use seqharvest::app::App;
use seqharvest::backend::{ArchiveBackend, EnaBackend, NcbiBackend};
use seqharvest::checksum::ChecksumValidator;
use seqharvest::config::{ConfigLoader, ResolvedConfig};
use seqharvest::domain::{Accession, ArchiveSource};
use seqharvest::logging;
use seqharvest::output::{JsonOutput, LogSink, OutputMode, TextOutput};
use seqharvest::recorder::MetadataRecorder;
use seqharvest::scheduler::{AcquireLimits, DownloadScheduler};
use seqharvest::store::Store;
use seqharvest::transfer::{TransferExecutor, TransferSettings};
use seqharvest::transport::SystemTransport;

#[derive(Parser)]
#[command(name = "seqharvest")]
#[command(about = "Acquire sequencing datasets from ENA or NCBI SRA by accession")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./seqharvest.json)
    #[arg(long)]
    config: Option<String>,

    /// Archive to talk to
    #[arg(long, value_enum, default_value_t = ArchiveSource::Ena)]
    source: ArchiveSource,

    /// Search for projects instead of downloading
    #[arg(long)]
    search: bool,

    /// Acquire a single project instead of the configured datasets
    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    max_samples: Option<usize>,

    #[arg(long)]
    max_runs: Option<usize>,

    /// Search terms overriding the configured keywords
    #[arg(long, num_args = 1..)]
    keywords: Option<Vec<String>>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let store = Store::from_settings(&config.storage);
    store.ensure_layout()?;
    let _log_guard = logging::init(&config.log_level, store.logs_dir());

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    match cli.source {
        ArchiveSource::Ena => {
            let backend = EnaBackend::new(config.source(ArchiveSource::Ena))?;
            run_with(backend, &cli, &config, store, output_mode)
        }
        ArchiveSource::Ncbi => {
            let backend = NcbiBackend::new(config.source(ArchiveSource::Ncbi))?;
            run_with(backend, &cli, &config, store, output_mode)
        }
    }
}

fn run_with<B: ArchiveBackend>(
    backend: B,
    cli: &Cli,
    config: &ResolvedConfig,
    store: Store,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let source = backend.source();
    let executor = TransferExecutor::new(
        SystemTransport::new(),
        ChecksumValidator::new(config.validate_downloads),
        TransferSettings::from_config(config, source),
    );
    let scheduler = DownloadScheduler::new(
        config.max_concurrent_downloads,
        store.raw_reads_dir().to_owned(),
    );
    let app = App::new(backend, executor, scheduler, MetadataRecorder::new(store));

    if cli.search {
        let keywords = cli
            .keywords
            .clone()
            .unwrap_or_else(|| config.keywords.clone());
        let result = app.search(&keywords, &LogSink);
        return match output_mode {
            OutputMode::Json => JsonOutput::print_search(&result).into_diagnostic(),
            OutputMode::Text => TextOutput::print_search(&result).into_diagnostic(),
        };
    }

    let requests = match &cli.project {
        Some(project) => {
            let accession: Accession = project.parse()?;
            let limits = AcquireLimits {
                max_samples: cli.max_samples,
                max_runs: cli.max_runs,
            };
            vec![(accession, limits)]
        }
        None => config
            .datasets_for(source)
            .map(|request| {
                let limits = AcquireLimits {
                    max_samples: cli.max_samples.or(request.max_units),
                    max_runs: cli.max_runs,
                };
                (request.accession.clone(), limits)
            })
            .collect(),
    };
    if requests.is_empty() {
        warn!(%source, "no datasets configured for this source");
    }

    let mut summaries = Vec::with_capacity(requests.len());
    for (accession, limits) in requests {
        let summary = app.acquire(&accession, limits, &LogSink);
        if summary.has_failures() {
            warn!(
                project = %summary.project_accession,
                failed_samples = summary.failed_samples,
                failed_files = summary.failed_files,
                "acquisition finished with failures"
            );
        }
        if output_mode == OutputMode::Text {
            TextOutput::print_summary(&summary).into_diagnostic()?;
        }
        summaries.push(summary);
    }
    if output_mode == OutputMode::Json {
        JsonOutput::print_summaries(&summaries).into_diagnostic()?;
    }
    Ok(())
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use seq_submit::app::{Intake, SubmissionService, owned_submission, user_uploads};
use seq_submit::archive::ArchiveHttpClient;
use seq_submit::bundle::UploadedFile;
use seq_submit::config::{ConfigLoader, ResolvedConfig};
use seq_submit::domain::UserId;
use seq_submit::error::SubmitError;
use seq_submit::orchestrator::Protocol;
use seq_submit::output::JsonOutput;
use seq_submit::storage::StorageHttpClient;
use seq_submit::store::{FileStore, UploadStore};

const FOLLOW_POLL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "seq-submit")]
#[command(about = "Validate metadata and FASTA files and submit them to a sequence archive")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate a metadata file and its sequence files without submitting")]
    Check(FilesArgs),
    #[command(about = "Submit a metadata file and its sequence files")]
    Submit(SubmitArgs),
    #[command(about = "List uploads of a user")]
    Status(StatusArgs),
    #[command(about = "Run uploads left QUEUED by an earlier run")]
    Resume,
}

#[derive(Args)]
struct FilesArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(long)]
    user: UserId,

    #[arg(long)]
    follow: bool,

    #[command(flatten)]
    files: FilesArgs,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    user: UserId,

    #[arg(long)]
    submission: Option<Uuid>,

    #[arg(long, default_value_t = 0)]
    page: usize,

    #[arg(long, default_value_t = 20)]
    size: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SubmitError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SubmitError) -> u8 {
    if error.is_invalid_input() {
        return 2;
    }
    if error.is_remote() {
        return 3;
    }
    match error {
        SubmitError::MissingConfig | SubmitError::SubmissionNotFound(_) => 2,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Check(args) => run_check(args, &resolved),
        Commands::Submit(args) => run_submit(args, &resolved),
        Commands::Status(args) => run_status(args, &resolved),
        Commands::Resume => run_resume(&resolved),
    }
}

fn run_check(args: FilesArgs, resolved: &ResolvedConfig) -> miette::Result<()> {
    let files = read_files(&args.files)?;
    let result = Intake::from_config(resolved).check(files)?;
    JsonOutput::print_check(&result).into_diagnostic()?;
    Ok(())
}

fn run_submit(args: SubmitArgs, resolved: &ResolvedConfig) -> miette::Result<()> {
    let files = read_files(&args.files.files)?;
    let service = start_service(resolved)?;

    // attach before submitting so the QUEUED events are not missed
    let feed = args.follow.then(|| service.watch(&args.user, None));
    let created = service.submit(&args.user, files)?;
    JsonOutput::print_submission(&created).into_diagnostic()?;

    if let Some(feed) = feed {
        let mut pending = created.upload_ids.iter().copied().collect::<HashSet<_>>();
        while !pending.is_empty() {
            match feed.next_timeout(FOLLOW_POLL) {
                Some(upload) if upload.submission_id == created.submission_id => {
                    JsonOutput::print_event(&upload).into_diagnostic()?;
                    if upload.status.is_terminal() {
                        pending.remove(&upload.upload_id);
                    }
                }
                Some(_) => {}
                None if !service.is_healthy() => {
                    tracing::warn!(pending = pending.len(), "workers stopped while following");
                    break;
                }
                None => {}
            }
        }
    }

    service.shutdown();
    Ok(())
}

fn run_status(args: StatusArgs, resolved: &ResolvedConfig) -> miette::Result<()> {
    let store = FileStore::open(resolved.store_dir.clone())?;
    if let Some(submission_id) = args.submission {
        owned_submission(&store, &args.user, submission_id)?;
    }
    let page = user_uploads(&store, &args.user, args.submission, args.page, args.size)?;
    JsonOutput::print_uploads(&page).into_diagnostic()?;
    Ok(())
}

fn run_resume(resolved: &ResolvedConfig) -> miette::Result<()> {
    let service = start_service(resolved)?;
    let result = service.resume_queued()?;
    JsonOutput::print_resume(&result).into_diagnostic()?;
    service.shutdown();
    Ok(())
}

fn start_service(resolved: &ResolvedConfig) -> Result<SubmissionService, SubmitError> {
    let store: Arc<dyn UploadStore> = Arc::new(FileStore::open(resolved.store_dir.clone())?);
    let archive = Arc::new(ArchiveHttpClient::new(&resolved.clients)?);
    let storage = Arc::new(StorageHttpClient::new(&resolved.clients)?);
    let protocol = Protocol::new(archive, storage, Arc::clone(&store));
    SubmissionService::start(
        Intake::from_config(resolved),
        protocol,
        store,
        resolved.workers,
    )
}

fn read_files(paths: &[PathBuf]) -> miette::Result<Vec<UploadedFile>> {
    paths
        .iter()
        .map(|path| -> miette::Result<UploadedFile> {
            let content = fs::read(path)
                .map_err(|_| SubmitError::Filesystem(format!("failed to read {}", path.display())))?;
            Ok(UploadedFile::new(file_name(path), content))
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

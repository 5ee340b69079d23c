//! Stevedore CLI
//!
//! Resumable chunked uploads to Backblaze B2 and ranged HTTP downloads.
//! Progress is persisted after every chunk; an interrupted transfer is
//! continued with `stevedore resume`.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use stevedore_backend::{
    B2Backend, BackendError, BackendFuture, HttpRangeReader, PartTarget, PartUpload,
    StorageBackend,
};
use stevedore_engine::{
    Completion, DownloadArtifact, DownloadManager, DownloadRequest, EngineConfig, RunOutcome,
    TransferControl, TransferEvent, UploadManager, UploadRequest, recover,
};
use stevedore_protocol::{BackendSession, Direction, TransferId, TransferState, UploadReceipt};
use stevedore_store::{JsonFileStore, StateStore, StatusFilter, TransferRegistry};
use stevedore_transfer::{ChecksumAlgorithm, FileSink, FileSource};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{CliConfig, default_config_path};

/// Stevedore - resumable chunked transfers
#[derive(Parser)]
#[command(name = "stevedore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file to the configured B2 bucket
    Upload {
        /// File to upload
        file: PathBuf,

        /// Object name in the bucket (defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        /// MIME type (B2 picks one from the name when omitted)
        #[arg(long)]
        content_type: Option<String>,

        /// Free-form label for grouping transfers
        #[arg(long)]
        tag: Option<String>,

        /// Transfer id to use instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },

    /// Download a URL with ranged requests
    Download {
        /// Source URL
        url: String,

        /// Output file (defaults to the last URL path segment)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Known size in bytes; fetched when omitted
        #[arg(long)]
        size: Option<u64>,

        /// Free-form label for grouping transfers
        #[arg(long)]
        tag: Option<String>,

        /// Transfer id to use instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },

    /// List transfers
    List {
        /// Include completed and failed transfers
        #[arg(short, long)]
        all: bool,

        /// Only transfers with this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Resume one transfer, or every active one
    Resume {
        /// Transfer id; all active transfers when omitted
        id: Option<String>,

        /// Limit recovery to this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Cancel a transfer and discard its partial data
    Cancel {
        /// Transfer id
        id: String,
    },

    /// Delete a transfer record
    Remove {
        /// Transfer id
        id: String,
    },

    /// Delete completed and failed transfer records
    Prune {
        /// Only transfers with this tag
        #[arg(long)]
        tag: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()
            .context("cannot determine a config directory; pass --config")?,
    };
    let app = App::open(CliConfig::load_or_init(&config_path)?)?;

    match cli.command {
        Commands::Upload {
            file,
            name,
            content_type,
            tag,
            id,
        } => app.upload(file, name, content_type, tag, id).await,
        Commands::Download {
            url,
            output,
            size,
            tag,
            id,
        } => app.download(url, output, size, tag, id).await,
        Commands::List { all, tag } => app.list(all, tag.as_deref()),
        Commands::Resume { id: Some(id), .. } => app.resume_one(id.into()).await,
        Commands::Resume { id: None, tag } => app.resume_all(tag.as_deref()).await,
        Commands::Cancel { id } => app.cancel(id.into()).await,
        Commands::Remove { id } => {
            let id = TransferId::from(id);
            if !app.registry.remove(&id)? {
                bail!("no transfer {id}");
            }
            println!("removed {id}");
            Ok(())
        }
        Commands::Prune { tag } => {
            let removed = app.registry.prune_finished(tag.as_deref())?;
            println!("removed {removed} finished transfer(s)");
            Ok(())
        }
    }
}

struct App {
    config: CliConfig,
    store: Arc<dyn StateStore>,
    registry: TransferRegistry,
}

impl App {
    fn open(config: CliConfig) -> anyhow::Result<Self> {
        let state_path = config.resolve_state_path()?;
        let store: Arc<dyn StateStore> = Arc::new(
            JsonFileStore::open(&state_path)
                .with_context(|| format!("opening state file {}", state_path.display()))?,
        );
        Ok(Self {
            config,
            registry: TransferRegistry::new(store.clone()),
            store,
        })
    }

    fn engine(&self) -> EngineConfig {
        self.config.engine.clone()
    }

    fn backend(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        Ok(Arc::new(B2Backend::new(self.config.b2()?.clone())?))
    }

    /// The B2 backend when configured. Download-only setups get a stand-in
    /// that refuses every call.
    fn backend_or_unconfigured(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        match &self.config.b2 {
            Some(_) => self.backend(),
            None => Ok(Arc::new(Unconfigured)),
        }
    }

    async fn upload(
        &self,
        file: PathBuf,
        name: Option<String>,
        content_type: Option<String>,
        tag: Option<String>,
        id: Option<String>,
    ) -> anyhow::Result<()> {
        let backend = self.backend()?;
        let file = std::path::absolute(&file)?;
        let source = FileSource::open(&file)
            .with_context(|| format!("opening {}", file.display()))?;

        let name = match name {
            Some(name) => name,
            None => file_name(&file)?,
        };
        let mut request = UploadRequest::new(name);
        request.content_type = content_type;
        request.tag = tag;

        let id = id.map(TransferId::from).unwrap_or_else(TransferId::generate);
        let (tx, rx) = mpsc::channel(64);
        let mgr = UploadManager::new(id, request, Arc::new(source), backend, self.store.clone())
            .with_config(self.engine())
            .with_events(tx);
        run_upload(mgr, rx).await
    }

    async fn download(
        &self,
        url: String,
        output: Option<PathBuf>,
        size: Option<u64>,
        tag: Option<String>,
        id: Option<String>,
    ) -> anyhow::Result<()> {
        let output = match output {
            Some(path) => path,
            None => PathBuf::from(url_file_name(&url)),
        };
        let output = std::path::absolute(&output)?;

        let mut request = DownloadRequest::new(url, file_name(&output)?);
        request.size = size;
        request.tag = tag;

        let id = id.map(TransferId::from).unwrap_or_else(TransferId::generate);
        let (tx, rx) = mpsc::channel(64);
        let mgr = DownloadManager::new(
            id,
            request,
            Arc::new(FileSink::new(output)),
            Arc::new(HttpRangeReader::new()?),
            self.store.clone(),
        )
        .with_config(self.engine())
        .with_events(tx);
        run_download(mgr, rx).await
    }

    fn list(&self, all: bool, tag: Option<&str>) -> anyhow::Result<()> {
        let filter = if all {
            StatusFilter::Any
        } else {
            StatusFilter::Active
        };
        let transfers = self.registry.list(&filter, tag)?;
        if transfers.is_empty() {
            println!("no transfers");
            return Ok(());
        }

        println!(
            "{:<36}  {:<4}  {:<11}  {:>6}  {:<20}  NAME",
            "ID", "DIR", "STATUS", "DONE", "UPDATED"
        );
        for state in &transfers {
            println!("{}", format_row(state));
        }
        Ok(())
    }

    async fn resume_one(&self, id: TransferId) -> anyhow::Result<()> {
        let state = self
            .registry
            .get(&id)?
            .with_context(|| format!("no transfer {id}"))?;

        let (tx, rx) = mpsc::channel(64);
        match state.direction {
            Direction::Upload => {
                let mgr = UploadManager::resume(id, self.backend()?, self.store.clone())?
                    .with_config(self.engine())
                    .with_events(tx);
                run_upload(mgr, rx).await
            }
            Direction::Download => {
                let mgr = DownloadManager::resume(
                    id,
                    Arc::new(HttpRangeReader::new()?),
                    self.store.clone(),
                )?
                .with_config(self.engine())
                .with_events(tx);
                run_download(mgr, rx).await
            }
        }
    }

    async fn resume_all(&self, tag: Option<&str>) -> anyhow::Result<()> {
        let report = recover(
            &self.registry,
            self.backend_or_unconfigured()?,
            Arc::new(HttpRangeReader::new()?),
            &self.config.engine,
            tag,
        )
        .await?;

        for (id, outcome) in &report.resumed {
            match outcome {
                RunOutcome::Completed(Completion::Upload(receipt)) => print_receipt(id, receipt),
                RunOutcome::Completed(Completion::Download(artifact)) => {
                    print_artifact(id, artifact)
                }
                RunOutcome::Paused => println!("{id}: paused"),
                RunOutcome::Cancelled => println!("{id}: cancelled"),
            }
        }
        for id in &report.needs_source {
            println!("{id}: upload from memory, cannot resume without its data");
        }
        for (id, err) in &report.failed {
            println!("{id}: failed: {err}");
        }

        if report.resumed.is_empty()
            && report.failed.is_empty()
            && report.needs_source.is_empty()
        {
            println!("nothing to resume");
        }
        if !report.failed.is_empty() {
            bail!("{} transfer(s) failed", report.failed.len());
        }
        Ok(())
    }

    async fn cancel(&self, id: TransferId) -> anyhow::Result<()> {
        let state = self
            .registry
            .get(&id)?
            .with_context(|| format!("no transfer {id}"))?;

        match state.direction {
            Direction::Upload => {
                let backend = self.backend_or_unconfigured()?;
                UploadManager::resume(id.clone(), backend, self.store.clone())?
                    .cancel()
                    .await?
            }
            Direction::Download => {
                let reader = Arc::new(HttpRangeReader::new()?);
                DownloadManager::resume(id.clone(), reader, self.store.clone())?
                    .cancel()
                    .await?
            }
        }
        println!("cancelled {id}");
        Ok(())
    }
}

async fn run_upload(
    mgr: UploadManager,
    rx: mpsc::Receiver<TransferEvent>,
) -> anyhow::Result<()> {
    pause_on_ctrl_c(mgr.control());
    let printer = tokio::spawn(print_events(rx));
    let id = mgr.id().clone();

    let result = mgr.start().await;
    drop(mgr);
    printer.await?;

    match result? {
        RunOutcome::Completed(receipt) => print_receipt(&id, &receipt),
        RunOutcome::Paused => println!("{id}: paused; continue with `stevedore resume {id}`"),
        RunOutcome::Cancelled => println!("{id}: cancelled"),
    }
    Ok(())
}

async fn run_download(
    mgr: DownloadManager,
    rx: mpsc::Receiver<TransferEvent>,
) -> anyhow::Result<()> {
    pause_on_ctrl_c(mgr.control());
    let printer = tokio::spawn(print_events(rx));
    let id = mgr.id().clone();

    let result = mgr.start().await;
    drop(mgr);
    printer.await?;

    match result? {
        RunOutcome::Completed(artifact) => print_artifact(&id, &artifact),
        RunOutcome::Paused => println!("{id}: paused; continue with `stevedore resume {id}`"),
        RunOutcome::Cancelled => println!("{id}: cancelled"),
    }
    Ok(())
}

/// First Ctrl-C pauses after the current chunk.
fn pause_on_ctrl_c(control: TransferControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, pausing after the current chunk");
            control.request_pause();
        }
    });
}

async fn print_events(mut rx: mpsc::Receiver<TransferEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransferEvent::Progress {
                id,
                percent,
                transferred,
                total,
            } => println!("{id}: {percent:5.1}% ({transferred}/{total} bytes)"),
            TransferEvent::Failed { id, message } => eprintln!("{id}: failed: {message}"),
            TransferEvent::ChunkCompleted { .. } | TransferEvent::Completed { .. } => {}
        }
    }
}

fn print_receipt(id: &TransferId, receipt: &UploadReceipt) {
    println!("{id}: uploaded as {}", receipt.file_id);
    println!("  {}", receipt.public_reference);
}

fn print_artifact(id: &TransferId, artifact: &DownloadArtifact) {
    match artifact {
        DownloadArtifact::File(path) => println!("{id}: saved to {}", path.display()),
        DownloadArtifact::Memory(bytes) => println!("{id}: downloaded {} bytes", bytes.len()),
        DownloadArtifact::Delivered { size } => println!("{id}: already complete ({size} bytes)"),
    }
}

fn format_row(state: &TransferState) -> String {
    let dir = match state.direction {
        Direction::Upload => "up",
        Direction::Download => "down",
    };
    let name = match &state.tag {
        Some(tag) => format!("{} [{tag}]", state.resource_name),
        None => state.resource_name.clone(),
    };
    format!(
        "{:<36}  {:<4}  {:<11}  {:>5.1}%  {:<20}  {}",
        state.id,
        dir,
        state.status.to_string(),
        state.percentage(),
        state.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        name
    )
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Last non-empty path segment of `url`, without query or fragment.
fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    path.split('/')
        .skip(1)
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or("download.bin")
        .to_string()
}

/// Stands in for the B2 backend when no `[b2]` section is configured.
struct Unconfigured;

impl Unconfigured {
    fn refuse<'a, T: Send + 'a>() -> BackendFuture<'a, T> {
        Box::pin(async {
            Err(BackendError::SessionInit(
                "no [b2] section in the configuration".into(),
            ))
        })
    }
}

impl StorageBackend for Unconfigured {
    fn open_session<'a>(
        &'a self,
        _name: &'a str,
        _content_type: Option<&'a str>,
    ) -> BackendFuture<'a, BackendSession> {
        Self::refuse()
    }

    fn part_upload_target<'a>(
        &'a self,
        _session: &'a BackendSession,
    ) -> BackendFuture<'a, PartTarget> {
        Self::refuse()
    }

    fn upload_part<'a>(
        &'a self,
        _target: &'a PartTarget,
        _part: PartUpload,
    ) -> BackendFuture<'a, String> {
        Self::refuse()
    }

    fn finalize_session<'a>(
        &'a self,
        _session: &'a BackendSession,
        _checksums: Vec<String>,
    ) -> BackendFuture<'a, UploadReceipt> {
        Self::refuse()
    }

    fn abort_session<'a>(&'a self, _session: &'a BackendSession) -> BackendFuture<'a, ()> {
        Self::refuse()
    }

    fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        ChecksumAlgorithm::Sha1
    }
}

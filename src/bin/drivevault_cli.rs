//! Drivevault CLI - versioned, resumable file backup to the drive API
//!
//! Usage:
//!   drivevault-cli upload <local> [--resume]            Store a new version
//!   drivevault-cli download <path> [--version <id>]     Restore a version
//!   drivevault-cli ls [path] [--recursive] [--fast]     List logical files
//!   drivevault-cli versions <path>                      Show stored versions
//!   drivevault-cli probe-upload <local>                 Check for a partial upload
//!   drivevault-cli probe-download <path> --version <id> Check a local copy
//!   drivevault-cli delete-version <path> <id>           Remove one version
//!   drivevault-cli config [--init]                      Show or write the config

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use drivevault::config::{load_replacements, DriveConfig};
use drivevault::path_translator::{is_encrypted_path, NAMESPACE_PREFIX};
use drivevault::providers::{
    OAuth2RefreshSource, OAuthRefreshConfig, RequestExecutor, StaticToken, TokenCache, TokenSource,
};
use drivevault::{
    DownStream, DriveError, EncryptionKey, FileManager, FilePath, NoProgress, PathTranslator, ProgressReporter,
    UpStream, VersionStrategy,
};

#[derive(Parser)]
#[command(
    name = "drivevault-cli",
    about = "Drivevault CLI - versioned, resumable file backup",
    version,
    long_about = "Stores files as content-addressed versions split into numbered parts.\nPaths starting with /Drive/ are remote logical paths, anything else is local."
)]
struct Cli {
    /// Config file (default: <config dir>/drivevault/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON replacement table overriding the configured one
    #[arg(long, global = true)]
    replacements: Option<PathBuf>,

    /// Local base directory overriding the configured one
    #[arg(long, global = true)]
    local_base: Option<PathBuf>,

    /// Bearer token used as-is
    #[arg(long, global = true, env = "DRIVEVAULT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// OAuth2 refresh token for a refreshable session
    #[arg(long, global = true, env = "DRIVEVAULT_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    #[arg(long, global = true, env = "DRIVEVAULT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// 32-byte master key as hex
    #[arg(long, global = true, env = "DRIVEVAULT_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Passphrase stretched with the configured key salt
    #[arg(long, global = true, env = "DRIVEVAULT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Encrypt content (overrides config)
    #[arg(long, global = true)]
    encrypt: bool,

    /// Compress content (overrides config)
    #[arg(long, global = true)]
    compress: bool,

    /// Hide the progress bar
    #[arg(long, global = true)]
    quiet: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file as a new version
    Upload {
        /// Local file path
        local: PathBuf,
        /// Explicit version id instead of the content hash
        #[arg(long)]
        version: Option<String>,
        /// Continue after parts a previous attempt already stored
        #[arg(long)]
        resume: bool,
    },
    /// Download a stored version
    Download {
        /// Local or remote logical path
        path: String,
        /// Version id (default: most recently modified)
        #[arg(long)]
        version: Option<String>,
        /// Destination (default: mapped local path)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Always start from the first chunk
        #[arg(long)]
        no_resume: bool,
    },
    /// List logical files below a directory
    Ls {
        /// Local or remote directory (default: backup root)
        path: Option<String>,
        #[arg(short, long)]
        recursive: bool,
        /// Use the flat listing endpoint (requires --recursive)
        #[arg(long)]
        fast: bool,
    },
    /// Show the versions stored for a file
    Versions {
        /// Local or remote logical path
        path: String,
    },
    /// Report whether a version's parts are already (partially) stored
    ProbeUpload {
        local: PathBuf,
        #[arg(long)]
        version: Option<String>,
    },
    /// Report whether a local copy is complete or where to resume
    ProbeDownload {
        path: String,
        #[arg(long)]
        version: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete one version and its parts
    DeleteVersion {
        path: String,
        version: String,
    },
    /// Print the effective config
    Config {
        /// Write it to the config path, generating a key salt if none is set
        #[arg(long)]
        init: bool,
    },
}

/// Byte progress on an indicatif bar
struct BarProgress {
    bar: ProgressBar,
    translator: PathTranslator,
}

impl BarProgress {
    fn new(total: Option<u64>, translator: PathTranslator) -> Self {
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar, translator }
    }
}

impl ProgressReporter for BarProgress {
    fn on_chunk_start(&self, index: u64, remote_path: &str) {
        let message = match self.translator.partial_local_path(remote_path) {
            Some((_, local)) => format!("{} part {}", local.display(), index),
            None => format!("part {}", index),
        };
        self.bar.set_message(message);
    }

    fn on_bytes_transferred(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    fn on_chunk_complete(&self, index: u64, _bytes: u64) {
        self.bar.set_message(format!("part {} done", index));
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<DriveConfig> {
    let mut config = match &cli.config {
        Some(path) if !path.exists() && matches!(cli.command, Commands::Config { init: true }) => DriveConfig::default(),
        Some(path) => DriveConfig::load(path).with_context(|| format!("Loading config {}", path.display()))?,
        None => DriveConfig::load_or_default(),
    };
    if let Some(table) = &cli.replacements {
        config.replacements = load_replacements(table)?;
    }
    if let Some(base) = &cli.local_base {
        config.local_base = std::path::absolute(base)?;
    }
    config.encrypted |= cli.encrypt;
    config.compressed |= cli.compress;
    Ok(config.validate()?)
}

fn token_source(cli: &Cli, config: &DriveConfig) -> Result<Arc<dyn TokenSource>> {
    if let Some(token) = &cli.token {
        return Ok(Arc::new(StaticToken::new(token.clone())));
    }
    if let Some(refresh_token) = &cli.refresh_token {
        let (Some(client_id), Some(token_url)) = (&config.oauth_client_id, &config.oauth_token_url) else {
            bail!("A refresh token needs oauth_client_id and oauth_token_url in the config");
        };
        let oauth = OAuthRefreshConfig {
            client_id: client_id.clone(),
            client_secret: cli.client_secret.clone(),
            token_url: token_url.clone(),
        };
        return Ok(Arc::new(OAuth2RefreshSource::new(oauth, refresh_token.clone())?));
    }
    bail!("No credentials: pass --token or --refresh-token (or set DRIVEVAULT_TOKEN)")
}

fn encryption_key(cli: &Cli, config: &DriveConfig) -> Result<Option<EncryptionKey>> {
    if !config.encrypted {
        return Ok(None);
    }
    if let Some(hex_key) = &cli.key {
        return Ok(Some(EncryptionKey::from_hex(hex_key)?));
    }
    if let Some(passphrase) = &cli.passphrase {
        let salt = config.key_salt_bytes()?;
        return Ok(Some(EncryptionKey::from_passphrase(passphrase, &salt)?));
    }
    bail!("Encryption is enabled: pass --key or --passphrase")
}

fn build_manager(cli: &Cli, config: &DriveConfig, progress: Arc<dyn ProgressReporter>) -> Result<FileManager> {
    let tokens = Arc::new(TokenCache::new(token_source(cli, config)?));
    let executor = RequestExecutor::new(
        config.api_base_url.clone(),
        tokens,
        Arc::new(config.transport()?),
        config.retry.clone(),
    )
    .with_user_agent(config.user_agent.clone());
    let pipeline = config.pipeline(encryption_key(cli, config)?)?;
    Ok(FileManager::new(
        Arc::new(executor),
        config.translator()?,
        pipeline,
        config.chunk_settings(),
        progress,
    ))
}

type Progress = (Option<ProgressBar>, Arc<dyn ProgressReporter>);

fn progress_for(cli: &Cli, config: &DriveConfig, total: Option<u64>) -> Result<Progress> {
    if cli.quiet {
        return Ok((None, Arc::new(NoProgress)));
    }
    let progress = BarProgress::new(total, config.translator()?);
    Ok((Some(progress.bar.clone()), Arc::new(progress)))
}

/// `/Drive/...` names a remote logical file, anything else a local one
fn parse_file_path(arg: &str) -> Result<FilePath> {
    if arg.starts_with(NAMESPACE_PREFIX) {
        Ok(FilePath::remote(arg))
    } else {
        Ok(FilePath::local(std::path::absolute(arg)?))
    }
}

fn version_strategy(local: &Path, version: &Option<String>) -> VersionStrategy {
    match version {
        Some(id) => VersionStrategy::fixed(id.clone()),
        None => VersionStrategy::for_file(local),
    }
}

async fn upload(cli: &Cli, config: &DriveConfig, local: &Path, version: &Option<String>, resume: bool) -> Result<()> {
    let local = std::path::absolute(local)?;
    let size = tokio::fs::metadata(&local).await?.len();
    let (bar, progress) = progress_for(cli, config, Some(size))?;
    let manager = build_manager(cli, config, progress)?;
    let path = FilePath::local(&local);
    let strategy = version_strategy(&local, version);

    let mut start = 0;
    if resume {
        let (exists, parts) = manager.probe_upload(&path, &strategy).await?;
        if exists && parts > 0 {
            info!("Continuing upload after {} stored part(s)", parts);
            start = parts;
        }
    }

    let file = tokio::fs::File::open(&local).await?;
    let result = manager
        .write_file(UpStream::continuing_at(file, start), &path, &strategy)
        .await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    match result {
        Ok(version) => {
            println!(
                "Stored {} version {} ({} part(s))",
                manager.to_remote(&path),
                version.id,
                version.part_files.len()
            );
            Ok(())
        }
        Err(DriveError::VersionConflict { path, version }) => {
            println!("{} already has version {}", path, version);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Version with the newest recorded modification time
async fn latest_version(manager: &FileManager, path: &FilePath) -> Result<String> {
    let metadata = manager.read_file_metadata(path).await?;
    metadata
        .versions()
        .max_by(|a, b| a.property("modified").cmp(&b.property("modified")))
        .map(|v| v.id.clone())
        .with_context(|| format!("No versions stored for {}", path))
}

async fn download(
    cli: &Cli,
    config: &DriveConfig,
    path: &str,
    version: &Option<String>,
    output: &Option<PathBuf>,
    no_resume: bool,
) -> Result<()> {
    let (bar, progress) = progress_for(cli, config, None)?;
    let manager = build_manager(cli, config, progress)?;
    let path = parse_file_path(path)?;
    let version_id = match version {
        Some(id) => id.clone(),
        None => latest_version(&manager, &path).await?,
    };
    let strategy = VersionStrategy::fixed(version_id.clone());
    let target = match output {
        Some(output) => output.clone(),
        None => manager.to_local(&manager.to_remote(&path))?,
    };

    let mut resume_from = 0;
    if !no_resume {
        let probe = manager.probe_download(&path, &strategy, &target).await?;
        if probe.complete {
            println!("{} is already complete", target.display());
            return Ok(());
        }
        if probe.needs_resume {
            resume_from = probe.resume_from_chunk;
        }
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&target)
        .await?;
    let result = manager
        .read_file(DownStream::resuming_at(&mut file, resume_from), &path, &strategy)
        .await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    let outcome = result?;
    println!(
        "Restored {} version {} to {} ({} bytes, {} chunk(s) fetched from chunk {})",
        path,
        version_id,
        target.display(),
        outcome.bytes_written,
        outcome.chunks_downloaded,
        outcome.resumed_from
    );
    Ok(())
}

async fn list(cli: &Cli, config: &DriveConfig, path: &Option<String>, recursive: bool, fast: bool) -> Result<()> {
    let manager = build_manager(cli, config, Arc::new(NoProgress))?;
    let root = match path {
        Some(path) => parse_file_path(path)?,
        None => FilePath::remote(config.backup_root.clone()),
    };
    let mut entries = Box::pin(manager.list_directory(&root, recursive, fast)?.into_stream());
    let mut count = 0u64;
    while let Some(entry) = entries.next().await {
        let remote = entry?;
        let marker = if is_encrypted_path(&remote) { "E" } else { "-" };
        match manager.to_local(&remote) {
            Ok(local) => println!("{} {}  {}", marker, remote, local.display()),
            Err(_) => println!("{} {}", marker, remote),
        }
        count += 1;
    }
    info!("{} logical file(s)", count);
    Ok(())
}

async fn versions(cli: &Cli, config: &DriveConfig, path: &str) -> Result<()> {
    let manager = build_manager(cli, config, Arc::new(NoProgress))?;
    let path = parse_file_path(path)?;
    let metadata = manager.read_file_metadata(&path).await?;
    if metadata.is_empty() {
        println!("No versions stored for {}", path);
        return Ok(());
    }
    println!("{:<64}  {:>6}  {:>12}  {:<25}  TRANSFORMS", "VERSION", "PARTS", "SIZE", "MODIFIED");
    for version in metadata.versions() {
        println!(
            "{:<64}  {:>6}  {:>12}  {:<25}  {}",
            version.id,
            version.part_files.len(),
            version.property("size").unwrap_or("-"),
            version.property("modified").unwrap_or("-"),
            version.transform_names.join(",")
        );
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    match &cli.command {
        Commands::Upload { local, version, resume } => upload(&cli, &config, local, version, *resume).await,
        Commands::Download {
            path,
            version,
            output,
            no_resume,
        } => download(&cli, &config, path, version, output, *no_resume).await,
        Commands::Ls { path, recursive, fast } => list(&cli, &config, path, *recursive, *fast).await,
        Commands::Versions { path } => versions(&cli, &config, path).await,
        Commands::ProbeUpload { local, version } => {
            let manager = build_manager(&cli, &config, Arc::new(NoProgress))?;
            let local = std::path::absolute(local)?;
            let strategy = version_strategy(&local, version);
            let (exists, parts) = manager.probe_upload(&FilePath::local(&local), &strategy).await?;
            println!("exists: {}  parts: {}", exists, parts);
            Ok(())
        }
        Commands::ProbeDownload { path, version, output } => {
            let manager = build_manager(&cli, &config, Arc::new(NoProgress))?;
            let path = parse_file_path(path)?;
            let target = match output {
                Some(output) => output.clone(),
                None => manager.to_local(&manager.to_remote(&path))?,
            };
            let probe = manager
                .probe_download(&path, &VersionStrategy::fixed(version.clone()), &target)
                .await?;
            println!(
                "complete: {}  needs_resume: {}  resume_from_chunk: {}",
                probe.complete, probe.needs_resume, probe.resume_from_chunk
            );
            Ok(())
        }
        Commands::DeleteVersion { path, version } => {
            let manager = build_manager(&cli, &config, Arc::new(NoProgress))?;
            let path = parse_file_path(path)?;
            manager.delete_version(&path, version).await?;
            println!("Deleted version {} of {}", version, path);
            Ok(())
        }
        Commands::Config { init } => {
            let mut config = config;
            if *init && config.key_salt.is_none() {
                config.key_salt = Some(hex::encode(drivevault::crypto::random_bytes(16)));
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            if *init {
                let target = cli.config.clone().unwrap_or_else(DriveConfig::default_path);
                if target.exists() {
                    warn!("Overwriting {}", target.display());
                }
                config.save(&target)?;
                println!("Written to {}", target.display());
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = match e.downcast_ref::<DriveError>() {
            Some(DriveError::Authentication(_)) => 3,
            Some(DriveError::Integrity(_)) => 4,
            Some(err) if err.is_recoverable() => 75,
            _ => 1,
        };
        std::process::exit(code);
    }
}

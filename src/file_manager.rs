//! File-level operations on the drive
//!
//! `FileManager` ties the metadata store and the chunked coordinator
//! together: it checks and records versions, moves bytes, answers resume
//! probes and lists logical files below a directory.
//!
//! A logical file is a remote directory whose only direct file is
//! `metadata.json`; its version data lives in sub-directories.

use futures_util::stream::{self, Stream};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::chunked::{
    ChunkSettings, ChunkedTransferCoordinator, DownloadOutcome, DownloadProbe, DownloadSink, VersionLayout,
    CHUNK_SIZE_PROPERTY, HASH_PROPERTY,
};
use crate::metadata::{FileMetadata, MetadataStore, Version, METADATA_FILE_NAME};
use crate::path_translator::PathTranslator;
use crate::progress::ProgressReporter;
use crate::providers::http_retry::is_timeout_signal;
use crate::providers::{DirectoryListing, DriveError, DriveRequest, FileEntry, RequestExecutor};
use crate::transforms::TransformPipeline;
use crate::version::VersionStrategy;

fn file_manager_log(msg: &str) {
    debug!(target: "drivevault::file_manager", "{}", msg);
}

/// A logical file named in either namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePath {
    Local(PathBuf),
    Remote(String),
}

impl FilePath {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        FilePath::Local(path.into())
    }

    pub fn remote(path: impl Into<String>) -> Self {
        FilePath::Remote(path.into())
    }
}

impl std::fmt::Display for FilePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilePath::Local(p) => write!(f, "{}", p.display()),
            FilePath::Remote(p) => write!(f, "{}", p),
        }
    }
}

/// Content to upload, optionally continuing after already stored parts
pub struct UpStream<R> {
    pub reader: R,
    pub continued_append_starting_index: u64,
}

impl<R> UpStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            continued_append_starting_index: 0,
        }
    }

    pub fn continuing_at(reader: R, index: u64) -> Self {
        Self {
            reader,
            continued_append_starting_index: index,
        }
    }
}

/// Download destination, optionally resuming at a chunk index
pub struct DownStream<'a, S: ?Sized> {
    pub sink: &'a mut S,
    pub resume_from_chunk: u64,
}

impl<'a, S: ?Sized> DownStream<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            resume_from_chunk: 0,
        }
    }

    pub fn resuming_at(sink: &'a mut S, chunk: u64) -> Self {
        Self {
            sink,
            resume_from_chunk: chunk,
        }
    }
}

pub struct FileManager {
    executor: Arc<RequestExecutor>,
    translator: PathTranslator,
    pipeline: TransformPipeline,
    metadata: MetadataStore,
    coordinator: ChunkedTransferCoordinator,
}

impl FileManager {
    pub fn new(
        executor: Arc<RequestExecutor>,
        translator: PathTranslator,
        pipeline: TransformPipeline,
        settings: ChunkSettings,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            metadata: MetadataStore::new(executor.clone()),
            coordinator: ChunkedTransferCoordinator::new(executor.clone(), settings, progress),
            executor,
            translator,
            pipeline,
        }
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    /// Remote logical path; local names get the `.aes` suffix when encrypting
    pub fn to_remote(&self, path: &FilePath) -> String {
        match path {
            FilePath::Local(local) => self.translator.to_remote(local, self.pipeline.has_encryption()),
            FilePath::Remote(remote) => remote.trim_end_matches('/').to_string(),
        }
    }

    pub fn to_local(&self, remote_path: &str) -> Result<PathBuf, DriveError> {
        self.translator.to_local(remote_path, true)
    }

    /// `original_name`, `size` and `modified` of a local file
    async fn remote_properties(&self, path: &FilePath) -> Result<BTreeMap<String, String>, DriveError> {
        let mut properties = BTreeMap::new();
        if let FilePath::Local(local) = path {
            let meta = tokio::fs::metadata(local).await?;
            if let Some(name) = local.file_name() {
                properties.insert("original_name".to_string(), name.to_string_lossy().to_string());
            }
            properties.insert("size".to_string(), meta.len().to_string());
            if let Ok(modified) = meta.modified() {
                let modified: chrono::DateTime<chrono::Utc> = modified.into();
                properties.insert("modified".to_string(), modified.to_rfc3339());
            }
        }
        Ok(properties)
    }

    /// Upload a new version and commit it to the metadata document
    pub async fn write_file<R>(
        &self,
        upstream: UpStream<R>,
        path: &FilePath,
        strategy: &VersionStrategy,
    ) -> Result<Version, DriveError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let remote = self.to_remote(path);
        let mut metadata = self.metadata.get(&remote).await?;
        let version_id = strategy.version_id().await?;
        if metadata.contains(&version_id) {
            return Err(DriveError::VersionConflict {
                path: remote,
                version: version_id,
            });
        }

        let layout = VersionLayout::new(&remote, &version_id);
        let content_hash = strategy.content_hash().await?;
        let outcome = self
            .coordinator
            .upload(
                upstream.reader,
                &layout,
                &self.pipeline,
                content_hash.as_deref(),
                upstream.continued_append_starting_index,
            )
            .await?;

        let mut version = Version::new(&version_id, layout.base_path());
        for name in self.pipeline.names() {
            version.add_transform(name);
        }
        version.add_property(CHUNK_SIZE_PROPERTY, self.coordinator.settings().chunk_size.to_string());
        if let Some(hash) = content_hash {
            version.add_property(HASH_PROPERTY, hash);
        }
        for (key, value) in self.remote_properties(path).await? {
            version.add_property(&key, value);
        }
        for part in outcome.part_files {
            version.add_part_file(part);
        }

        metadata.update_version(version.clone());
        self.metadata.put(&remote, &metadata).await?;
        info!("Committed version {} of {} ({} part(s))", version_id, remote, version.part_files.len());
        Ok(version)
    }

    async fn existing_version(&self, remote: &str, strategy: &VersionStrategy) -> Result<Version, DriveError> {
        let metadata = self.metadata.get(remote).await?;
        let version_id = strategy.version_id().await?;
        metadata
            .get_version(&version_id)
            .cloned()
            .ok_or_else(|| DriveError::InvalidVersion {
                path: remote.to_string(),
                version: version_id,
            })
    }

    /// Download a stored version into `downstream`
    pub async fn read_file<S>(
        &self,
        downstream: DownStream<'_, S>,
        path: &FilePath,
        strategy: &VersionStrategy,
    ) -> Result<DownloadOutcome, DriveError>
    where
        S: DownloadSink + ?Sized,
    {
        let remote = self.to_remote(path);
        let version = self.existing_version(&remote, strategy).await?;
        file_manager_log(&format!("Reading version {} of {}", version.id, remote));
        self.coordinator
            .download(&version, &self.pipeline, downstream.sink, downstream.resume_from_chunk)
            .await
    }

    pub async fn read_file_metadata(&self, path: &FilePath) -> Result<FileMetadata, DriveError> {
        self.metadata.get(&self.to_remote(path)).await
    }

    /// `(exists, stored_part_count)` for the version the strategy names
    pub async fn probe_upload(&self, path: &FilePath, strategy: &VersionStrategy) -> Result<(bool, u64), DriveError> {
        let remote = self.to_remote(path);
        let layout = VersionLayout::new(&remote, &strategy.version_id().await?);
        match self.coordinator.list(&layout.base_path()).await? {
            None => Ok((false, 0)),
            Some(listing) => Ok((true, listing.files.len() as u64)),
        }
    }

    /// Whether `local_path` already holds the version, or where to resume
    pub async fn probe_download(
        &self,
        path: &FilePath,
        strategy: &VersionStrategy,
        local_path: &Path,
    ) -> Result<DownloadProbe, DriveError> {
        match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(DownloadProbe::default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DownloadProbe::default()),
            Err(e) => return Err(e.into()),
        }
        let remote = self.to_remote(path);
        let version = self.existing_version(&remote, strategy).await?;
        self.coordinator.probe_resume(&version, local_path, strategy).await
    }

    /// Remove a version's parts, then drop it from the metadata document
    pub async fn delete_version(&self, path: &FilePath, version_id: &str) -> Result<(), DriveError> {
        let remote = self.to_remote(path);
        let mut metadata = self.metadata.get(&remote).await?;
        let version = metadata
            .remove_version(version_id)
            .ok_or_else(|| DriveError::InvalidVersion {
                path: remote.clone(),
                version: version_id.to_string(),
            })?;

        for part in &version.part_files {
            let response = self.executor.execute(&DriveRequest::delete_object(part)?).await?;
            if response.is_not_found() {
                warn!("Part {} was already gone", part);
                continue;
            }
            response.error_for_status()?;
        }

        if metadata.is_empty() {
            let document = MetadataStore::document_path(&remote);
            let response = self.executor.execute(&DriveRequest::delete_object(&document)?).await?;
            if !response.is_not_found() {
                response.error_for_status()?;
            }
        } else {
            self.metadata.put(&remote, &metadata).await?;
        }
        info!("Deleted version {} of {}", version_id, remote);
        Ok(())
    }

    /// Lazily list the logical files below `path`.
    ///
    /// `fast` uses the flat listing endpoint and needs `recursive`.
    pub fn list_directory(&self, path: &FilePath, recursive: bool, fast: bool) -> Result<DirectoryWalker<'_>, DriveError> {
        if fast && !recursive {
            return Err(DriveError::InvalidConfig(
                "Fast listing is only available for recursive listings".into(),
            ));
        }
        let root = match path {
            FilePath::Local(local) => self.translator.to_remote(local, false),
            FilePath::Remote(remote) => remote.clone(),
        };
        let root = root.trim_end_matches('/').to_string();
        let root_item = if fast {
            WalkItem::Fast(root)
        } else {
            WalkItem::Metadata {
                path: root,
                depth: if recursive { None } else { Some(1) },
            }
        };
        Ok(DirectoryWalker::new(self, root_item))
    }
}

#[derive(Debug, Clone)]
enum WalkItem {
    /// One-level listing; `depth` limits how far below this directory to look
    Metadata { path: String, depth: Option<u32> },
    /// Flat listing of everything below
    Fast(String),
}

fn is_logical_file(listing: &DirectoryListing) -> bool {
    listing.files.len() == 1 && listing.files[0].name == METADATA_FILE_NAME
}

/// Worklist traversal yielding remote logical file paths
pub struct DirectoryWalker<'a> {
    manager: &'a FileManager,
    root: WalkItem,
    work: Vec<WalkItem>,
    ready: VecDeque<String>,
}

impl<'a> DirectoryWalker<'a> {
    fn new(manager: &'a FileManager, root: WalkItem) -> Self {
        Self {
            manager,
            work: vec![root.clone()],
            root,
            ready: VecDeque::new(),
        }
    }

    /// Start over from the root
    pub fn restart(&mut self) {
        self.work = vec![self.root.clone()];
        self.ready.clear();
    }

    pub async fn next(&mut self) -> Result<Option<String>, DriveError> {
        loop {
            if let Some(path) = self.ready.pop_front() {
                return Ok(Some(path));
            }
            let Some(item) = self.work.pop() else {
                return Ok(None);
            };
            match item {
                WalkItem::Metadata { path, depth } => self.visit(&path, depth).await?,
                WalkItem::Fast(path) => self.visit_fast(&path).await?,
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<String>, DriveError> {
        let mut paths = Vec::new();
        while let Some(path) = self.next().await? {
            paths.push(path);
        }
        Ok(paths)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<String, DriveError>> + 'a {
        stream::try_unfold(self, |mut walker| async move {
            Ok::<_, DriveError>(walker.next().await?.map(|path| (path, walker)))
        })
    }

    async fn visit(&mut self, path: &str, depth: Option<u32>) -> Result<(), DriveError> {
        let Some(listing) = self.manager.coordinator.list(path).await? else {
            return Ok(());
        };
        file_manager_log(&format!("Listed {}", path));
        if is_logical_file(&listing) {
            self.ready.push_back(path.to_string());
            return Ok(());
        }
        if depth == Some(0) {
            return Ok(());
        }
        let child_depth = depth.map(|d| d - 1);
        for dir in listing.directories.iter().rev() {
            self.work.push(WalkItem::Metadata {
                path: dir.path.trim_end_matches('/').to_string(),
                depth: child_depth,
            });
        }
        Ok(())
    }

    async fn visit_fast(&mut self, path: &str) -> Result<(), DriveError> {
        let response = self
            .manager
            .executor
            .execute(&DriveRequest::directory_list(path)?)
            .await?;
        if response.is_not_found() {
            return Ok(());
        }

        if is_timeout_signal(response.status, &response.body) {
            // Split the subtree: one metadata level here, fast listing below
            warn!("Flat listing of {} timed out, splitting", path);
            let Some(listing) = self.manager.coordinator.list(path).await? else {
                return Ok(());
            };
            if is_logical_file(&listing) {
                self.ready.push_back(path.to_string());
                return Ok(());
            }
            for dir in listing.directories.iter().rev() {
                self.work.push(WalkItem::Fast(dir.path.trim_end_matches('/').to_string()));
            }
            return Ok(());
        }

        let files: Vec<FileEntry> = response.error_for_status()?.json()?;
        let mut per_directory: HashMap<&str, usize> = HashMap::new();
        for file in &files {
            *per_directory.entry(parent_dir(&file.path)).or_default() += 1;
        }
        let mut found: Vec<String> = files
            .iter()
            .filter(|f| f.name == METADATA_FILE_NAME && per_directory.get(parent_dir(&f.path)) == Some(&1))
            .map(|f| parent_dir(&f.path).to_string())
            .collect();
        found.sort();
        self.ready.extend(found);
        Ok(())
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

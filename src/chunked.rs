//! Chunked, resumable transfers
//!
//! A version's content is pushed through the transform pipeline and the
//! encoded stream is cut into `chunk_size` pieces, each stored as one part
//! object `R/<version>/<name>/NNNNNNNN-<name>.partial`. Downloads fetch the
//! parts in order and decode them back.
//!
//! Both directions can pick up an interrupted transfer: uploads continue
//! after the parts already stored, downloads continue after the chunks
//! already present in the local file. Transforms are stateful, so the
//! skipped prefix is always replayed through the pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::metadata::Version;
use crate::path_translator::{partial_index, partial_name};
use crate::progress::ProgressReporter;
use crate::providers::{DirectoryListing, DriveError, DriveRequest, RequestExecutor};
use crate::transforms::TransformPipeline;
use crate::version::{hash_file, VersionStrategy};

pub const DEFAULT_CHUNK_SIZE: u64 = 5_120_000;
pub const DEFAULT_READ_SIZE: usize = 64 * 1024;
pub const CHUNK_SIZE_PROPERTY: &str = "chunk_size";
pub const HASH_PROPERTY: &str = "hash";

/// Extra room over one part for a part download
const PART_RESPONSE_SLACK: u64 = 1024 * 1024;

fn chunked_log(msg: &str) {
    debug!(target: "drivevault::chunked", "{}", msg);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    /// Size of one part object in encoded bytes
    pub chunk_size: u64,
    /// Size of one local read fed into the pipeline
    pub read_size: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_size: DEFAULT_READ_SIZE,
        }
    }
}

/// One part object of a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    /// Offsets within the encoded stream
    pub byte_range: Range<u64>,
    pub remote_path: String,
}

fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Where the parts of one version of logical file `R` live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionLayout {
    logical_path: String,
    version_id: String,
}

impl VersionLayout {
    pub fn new(logical_path: &str, version_id: &str) -> Self {
        Self {
            logical_path: logical_path.trim_end_matches('/').to_string(),
            version_id: version_id.to_string(),
        }
    }

    pub fn logical_path(&self) -> &str {
        &self.logical_path
    }

    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    /// `R/<version>`
    pub fn version_dir(&self) -> String {
        format!("{}/{}", self.logical_path, self.version_id)
    }

    /// `R/<version>/<name>`: the directory holding the part objects
    pub fn base_path(&self) -> String {
        format!("{}/{}", self.version_dir(), base_name(&self.logical_path))
    }

    pub fn part_path(&self, index: u64) -> Result<String, DriveError> {
        partial_name(&self.base_path(), index)
    }
}

/// Result of an upload
#[derive(Debug, Clone, Default)]
pub struct UploadOutcome {
    /// Every part of the version in index order, including reused ones
    pub part_files: Vec<String>,
    /// Parts actually written by this call
    pub uploaded: Vec<Chunk>,
    pub encoded_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Plaintext length of the finished sink
    pub bytes_written: u64,
    pub chunks_downloaded: u64,
    pub resumed_from: u64,
}

/// `(complete, needs_resume, resume_from_chunk)` as computed by the resume probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProbe {
    pub complete: bool,
    pub needs_resume: bool,
    pub resume_from_chunk: u64,
}

impl DownloadProbe {
    pub fn complete() -> Self {
        Self {
            complete: true,
            needs_resume: false,
            resume_from_chunk: 0,
        }
    }

    pub fn resume_from(chunk: u64) -> Self {
        Self {
            complete: false,
            needs_resume: true,
            resume_from_chunk: chunk,
        }
    }
}

/// Whether recorded and observed part sizes differ by more than 10%
pub fn chunk_size_drift_exceeded(recorded: u64, observed: u64) -> bool {
    let (hi, lo) = if recorded > observed {
        (recorded, observed)
    } else {
        (observed, recorded)
    };
    (hi as u128) * 10 > (lo as u128) * 11
}

/// Chunk size recorded on `version`, `None` when it predates the property
fn recorded_chunk_size(version: &Version) -> Result<Option<u64>, DriveError> {
    let Some(raw) = version.property(CHUNK_SIZE_PROPERTY) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(size) if size > 0 => Ok(Some(size)),
        _ => Err(DriveError::Integrity(format!(
            "Version {} has an invalid chunk size '{}'",
            version.id, raw
        ))),
    }
}

/// Destination of a download. Writes always append at the current position.
#[async_trait]
pub trait DownloadSink: Send {
    /// Position at the end of existing content and return its length
    async fn prepare_append(&mut self) -> std::io::Result<u64>;

    async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Drop everything after `len`; later writes continue from there
    async fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;

    async fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DownloadSink for tokio::fs::File {
    async fn prepare_append(&mut self) -> std::io::Result<u64> {
        self.seek(SeekFrom::End(0)).await
    }

    async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_all(data).await
    }

    async fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.flush().await?;
        self.set_len(len).await?;
        self.seek(SeekFrom::Start(len)).await?;
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        self.flush().await?;
        self.sync_all().await
    }
}

#[async_trait]
impl DownloadSink for Vec<u8> {
    async fn prepare_append(&mut self) -> std::io::Result<u64> {
        Ok(self.len() as u64)
    }

    async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }

    async fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.truncate(len as usize);
        Ok(())
    }
}

pub struct ChunkedTransferCoordinator {
    executor: Arc<RequestExecutor>,
    settings: ChunkSettings,
    progress: Arc<dyn ProgressReporter>,
}

impl ChunkedTransferCoordinator {
    pub fn new(executor: Arc<RequestExecutor>, settings: ChunkSettings, progress: Arc<dyn ProgressReporter>) -> Self {
        let settings = ChunkSettings {
            chunk_size: settings.chunk_size.max(1),
            read_size: settings.read_size.max(1),
        };
        Self {
            executor,
            settings,
            progress,
        }
    }

    pub fn settings(&self) -> ChunkSettings {
        self.settings
    }

    /// One-level listing of a remote directory, `None` when it doesn't exist
    pub async fn list(&self, path: &str) -> Result<Option<DirectoryListing>, DriveError> {
        let response = self.executor.execute(&DriveRequest::metadata(path)?).await?;
        if response.is_not_found() {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json()?))
    }

    /// Part files at `base_path`, checked for a flat, integer-indexed layout.
    /// `None` when the directory doesn't exist.
    async fn list_part_files(&self, base_path: &str) -> Result<Option<Vec<(u64, String, u64)>>, DriveError> {
        let Some(listing) = self.list(base_path).await? else {
            return Ok(None);
        };
        if !listing.directories.is_empty() {
            return Err(DriveError::Integrity(format!(
                "Part directory {} contains sub-directories",
                base_path
            )));
        }
        let mut parts = Vec::with_capacity(listing.files.len());
        for file in listing.files {
            let index = partial_index(&file.path).ok_or_else(|| {
                DriveError::Integrity(format!("Part file {} has a non-integer index", file.path))
            })?;
            parts.push((index, file.path, file.length));
        }
        parts.sort();
        Ok(Some(parts))
    }

    /// Existing parts an upload continuing at `continue_from` builds on
    async fn verify_continuation(&self, layout: &VersionLayout, continue_from: u64) -> Result<Vec<String>, DriveError> {
        let parts = self.list_part_files(&layout.base_path()).await?.unwrap_or_default();
        if parts.len() as u64 != continue_from {
            return Err(DriveError::Integrity(format!(
                "Cannot continue at part {}: {} part(s) stored at {}",
                continue_from,
                parts.len(),
                layout.base_path()
            )));
        }
        for (expected, (index, path, _)) in parts.iter().enumerate() {
            if *index != expected as u64 {
                return Err(DriveError::Integrity(format!(
                    "Stored parts are not contiguous: expected index {} but found {}",
                    expected, path
                )));
            }
        }
        Ok(parts.into_iter().map(|(_, path, _)| path).collect())
    }

    async fn store_part(&self, layout: &VersionLayout, index: u64, data: Vec<u8>) -> Result<String, DriveError> {
        let path = layout.part_path(index)?;
        let len = data.len() as u64;
        self.progress.on_chunk_start(index, &path);
        self.executor
            .execute(&DriveRequest::put_object(&path, data)?)
            .await?
            .error_for_status()?;
        self.progress.on_bytes_transferred(len);
        self.progress.on_chunk_complete(index, len);
        chunked_log(&format!("Stored part {} ({} bytes)", path, len));
        Ok(path)
    }

    /// Encode `reader` through `pipeline` and store it as the parts of `layout`.
    ///
    /// With `continue_from > 0` the parts below that index must already be
    /// stored; their content is re-encoded but not uploaded again. A known
    /// `content_hash` makes the encoded stream deterministic, which is what
    /// allows continuing an encrypted upload.
    pub async fn upload<R>(
        &self,
        mut reader: R,
        layout: &VersionLayout,
        pipeline: &TransformPipeline,
        content_hash: Option<&str>,
        continue_from: u64,
    ) -> Result<UploadOutcome, DriveError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut session = match content_hash {
            Some(hash) => {
                let nonce = format!("{}\n{}", layout.logical_path(), hash);
                pipeline.begin_deterministic_session(nonce.as_bytes())
            }
            None if continue_from > 0 && pipeline.has_encryption() => {
                return Err(DriveError::InvalidConfig(
                    "Continuing an encrypted upload requires a content-hash version".into(),
                ));
            }
            None => pipeline.begin_session(),
        };

        let mut outcome = UploadOutcome::default();
        if continue_from > 0 {
            outcome.part_files = self.verify_continuation(layout, continue_from).await?;
            info!("Continuing upload of {} at part {}", layout.base_path(), continue_from);
        }

        let chunk_size = self.settings.chunk_size as usize;
        let mut buf = vec![0u8; self.settings.read_size];
        let mut pending: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut index: u64 = 0;
        let mut offset: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await?;
            let at_end = n == 0;
            let encoded = session.encode(&buf[..n], at_end)?;
            pending.extend_from_slice(&encoded);

            while pending.len() >= chunk_size {
                let rest = pending.split_off(chunk_size);
                let piece = std::mem::replace(&mut pending, rest);
                self.emit_part(layout, index, offset, piece, continue_from, &mut outcome).await?;
                offset += chunk_size as u64;
                index += 1;
            }

            if at_end {
                // Every version has at least one part, possibly empty
                if !pending.is_empty() || index == 0 {
                    let piece = std::mem::take(&mut pending);
                    let len = piece.len() as u64;
                    self.emit_part(layout, index, offset, piece, continue_from, &mut outcome).await?;
                    offset += len;
                    index += 1;
                }
                break;
            }
        }

        if index < continue_from {
            return Err(DriveError::Integrity(format!(
                "Content yields {} part(s) but {} were already stored",
                index, continue_from
            )));
        }

        outcome.encoded_bytes = offset;
        info!(
            "Uploaded {} part(s) of {} ({} encoded bytes)",
            outcome.uploaded.len(),
            layout.base_path(),
            offset
        );
        Ok(outcome)
    }

    async fn emit_part(
        &self,
        layout: &VersionLayout,
        index: u64,
        offset: u64,
        piece: Vec<u8>,
        continue_from: u64,
        outcome: &mut UploadOutcome,
    ) -> Result<(), DriveError> {
        if index < continue_from {
            chunked_log(&format!("Skipping stored part {}", index));
            return Ok(());
        }
        let len = piece.len() as u64;
        let path = self.store_part(layout, index, piece).await?;
        outcome.part_files.push(path.clone());
        outcome.uploaded.push(Chunk {
            index,
            byte_range: offset..offset + len,
            remote_path: path,
        });
        Ok(())
    }

    async fn fetch_part(&self, path: &str, limit: u64) -> Result<Vec<u8>, DriveError> {
        let request = DriveRequest::get_object(path)?.with_response_limit(limit);
        let response = self.executor.execute(&request).await?;
        if response.is_not_found() {
            return Err(DriveError::Integrity(format!("Part {} is missing", path)));
        }
        Ok(response.error_for_status()?.body)
    }

    /// Stored length of every part of `version`, in part order
    async fn part_lengths(&self, version: &Version) -> Result<Vec<u64>, DriveError> {
        let first = version
            .part_files
            .first()
            .ok_or_else(|| DriveError::Integrity(format!("Version {} has no parts", version.id)))?;
        let base_path = parent_dir(first);
        let stored: HashMap<String, u64> = self
            .list_part_files(base_path)
            .await?
            .ok_or_else(|| DriveError::Integrity(format!("Part directory {} is missing", base_path)))?
            .into_iter()
            .map(|(_, path, len)| (path, len))
            .collect();
        version
            .part_files
            .iter()
            .map(|path| {
                stored
                    .get(path)
                    .copied()
                    .ok_or_else(|| DriveError::Integrity(format!("Part {} is missing", path)))
            })
            .collect()
    }

    /// Fetch and decode the parts of `version` into `sink`.
    ///
    /// With `resume_from > 0` the sink is expected to already hold the
    /// plaintext of the first chunks; they are replayed through the pipeline
    /// to rebuild its state and only missing bytes are written.
    pub async fn download<S>(
        &self,
        version: &Version,
        pipeline: &TransformPipeline,
        sink: &mut S,
        resume_from: u64,
    ) -> Result<DownloadOutcome, DriveError>
    where
        S: DownloadSink + ?Sized,
    {
        pipeline.ensure_matches(&version.transform_names)?;
        let parts = &version.part_files;
        let count = parts.len() as u64;
        if count == 0 {
            return Err(DriveError::Integrity(format!("Version {} has no parts", version.id)));
        }
        if resume_from > count {
            return Err(DriveError::Integrity(format!(
                "Cannot resume at chunk {}: version {} has {} part(s)",
                resume_from, version.id, count
            )));
        }

        let part_limit = recorded_chunk_size(version)?
            .unwrap_or_else(|| self.settings.chunk_size.max(DEFAULT_CHUNK_SIZE))
            + PART_RESPONSE_SLACK;

        let mut session = pipeline.begin_session();
        let mut existing = sink.prepare_append().await?;
        if resume_from == 0 && existing > 0 {
            sink.truncate_to(0).await?;
            existing = 0;
        }

        let mut position: u64 = 0;
        let mut next: u64 = 0;

        // Without transforms the skipped plaintext is just the stored part lengths
        if resume_from > 0 && pipeline.is_empty() {
            let lengths = self.part_lengths(version).await?;
            let skipped: u64 = lengths[..resume_from as usize].iter().sum();
            if skipped <= existing {
                position = skipped;
                next = resume_from;
            }
        }

        // Replay: rebuild transform state, write only what the sink lacks
        while next < resume_from {
            let data = self.fetch_part(&parts[next as usize], part_limit).await?;
            let plain = session.decode(&data, next == count - 1)?;
            let end = position + plain.len() as u64;
            if end > existing {
                let from = existing.saturating_sub(position) as usize;
                sink.write_chunk(&plain[from..]).await?;
            }
            position = end;
            next += 1;
        }
        if resume_from > 0 {
            if position < existing {
                sink.truncate_to(position).await?;
            }
            info!("Resuming download of {} at chunk {} (offset {})", version.id, resume_from, position);
        }

        let mut downloaded = 0u64;
        for index in resume_from..count {
            let path = &parts[index as usize];
            self.progress.on_chunk_start(index, path);
            let data = self.fetch_part(path, part_limit).await?;
            let plain = session.decode(&data, index == count - 1)?;
            sink.write_chunk(&plain).await?;
            position += plain.len() as u64;
            downloaded += 1;
            self.progress.on_bytes_transferred(data.len() as u64);
            self.progress.on_chunk_complete(index, data.len() as u64);
            chunked_log(&format!("Fetched part {} ({} bytes)", path, data.len()));
        }
        sink.finish().await?;

        Ok(DownloadOutcome {
            bytes_written: position,
            chunks_downloaded: downloaded,
            resumed_from: resume_from,
        })
    }

    /// Decide whether a local copy of `version` is complete or where to resume.
    ///
    /// Sizes are compared on the stored (encoded) parts, so this is a
    /// heuristic: a different file of the same length is indistinguishable
    /// from a partial download unless a content hash was recorded.
    pub async fn probe_resume(
        &self,
        version: &Version,
        local_path: &Path,
        strategy: &VersionStrategy,
    ) -> Result<DownloadProbe, DriveError> {
        let local_size = tokio::fs::metadata(local_path).await?.len();

        let lengths = self.part_lengths(version).await?;
        let summed: u64 = lengths.iter().sum();
        if local_size >= summed {
            return Ok(DownloadProbe::complete());
        }

        let chunk_size = recorded_chunk_size(version)?.unwrap_or(DEFAULT_CHUNK_SIZE);

        if lengths.len() > 1 {
            let largest = lengths.iter().copied().max().unwrap_or_default();
            if chunk_size_drift_exceeded(chunk_size, largest) {
                return Err(DriveError::Integrity(format!(
                    "Recorded chunk size {} differs more than 10% from stored part size {}",
                    chunk_size, largest
                )));
            }
        }

        let resume_from = local_size / chunk_size;
        let Some(recorded_hash) = version.property(HASH_PROPERTY) else {
            return Ok(DownloadProbe::resume_from(resume_from));
        };

        let local_hash = match strategy {
            VersionStrategy::ContentHash { source: Some(source), .. } if source == local_path => {
                strategy.content_hash().await?.unwrap_or_default()
            }
            _ => hash_file(local_path).await?,
        };
        if local_hash == recorded_hash {
            return Ok(DownloadProbe::complete());
        }
        Ok(DownloadProbe::resume_from(resume_from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_hex;
    use crate::progress::NoProgress;
    use crate::providers::memory::MemoryBackend;
    use crate::transforms::{AesCtrTransform, DeflateTransform, EncryptionKey, StreamTransform};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProgress {
        started: Mutex<Vec<u64>>,
        bytes: Mutex<u64>,
    }

    impl ProgressReporter for RecordingProgress {
        fn on_chunk_start(&self, index: u64, _remote_path: &str) {
            self.started.lock().unwrap().push(index);
        }

        fn on_bytes_transferred(&self, bytes: u64) {
            *self.bytes.lock().unwrap() += bytes;
        }
    }

    fn coordinator(backend: &Arc<MemoryBackend>, chunk_size: u64) -> ChunkedTransferCoordinator {
        ChunkedTransferCoordinator::new(
            backend.executor(),
            ChunkSettings { chunk_size, read_size: 256 },
            Arc::new(NoProgress),
        )
    }

    fn layout() -> VersionLayout {
        VersionLayout::new("/Drive/backup/big.bin", "v1")
    }

    /// Poorly compressible bytes
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    fn encrypted() -> StreamTransform {
        StreamTransform::Encryption(AesCtrTransform::new(EncryptionKey::from_master(&[3u8; 32]).unwrap()))
    }

    fn compressed() -> StreamTransform {
        StreamTransform::Compression(DeflateTransform::default())
    }

    fn version_for(layout: &VersionLayout, pipeline: &TransformPipeline, outcome: &UploadOutcome) -> Version {
        let mut version = Version::new(layout.version_id(), layout.base_path());
        for name in pipeline.names() {
            version.add_transform(name);
        }
        for part in &outcome.part_files {
            version.add_part_file(part.clone());
        }
        version
    }

    #[test]
    fn test_layout_paths() {
        let layout = layout();
        assert_eq!(layout.version_dir(), "/Drive/backup/big.bin/v1");
        assert_eq!(layout.base_path(), "/Drive/backup/big.bin/v1/big.bin");
        assert_eq!(
            layout.part_path(0).unwrap(),
            "/Drive/backup/big.bin/v1/big.bin/00000000-big.bin.partial"
        );
    }

    #[test]
    fn test_chunk_size_drift() {
        assert!(!chunk_size_drift_exceeded(5_120_000, 5_632_000));
        assert!(chunk_size_drift_exceeded(5_120_000, 6_000_000));
        assert!(chunk_size_drift_exceeded(6_000_000, 5_120_000));
        assert!(!chunk_size_drift_exceeded(5_120_000, 5_120_000));
    }

    #[tokio::test]
    async fn test_upload_splits_into_parts() {
        let backend = Arc::new(MemoryBackend::new());
        let data = noise(2_500);
        let outcome = coordinator(&backend, 1_000)
            .upload(&data[..], &layout(), &TransformPipeline::default(), None, 0)
            .await
            .unwrap();

        assert_eq!(outcome.part_files.len(), 3);
        assert_eq!(outcome.encoded_bytes, 2_500);
        assert_eq!(outcome.uploaded[2].byte_range, 2_000..2_500);
        let sizes: Vec<usize> = outcome
            .part_files
            .iter()
            .map(|p| backend.object(p).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![1_000, 1_000, 500]);
        assert_eq!(backend.object(&outcome.part_files[1]).unwrap(), &data[1_000..2_000]);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_part() {
        let backend = Arc::new(MemoryBackend::new());
        let outcome = coordinator(&backend, 1_000)
            .upload(&noise(2_000)[..], &layout(), &TransformPipeline::default(), None, 0)
            .await
            .unwrap();
        assert_eq!(outcome.part_files.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_input_stores_one_empty_part() {
        let backend = Arc::new(MemoryBackend::new());
        let outcome = coordinator(&backend, 1_000)
            .upload(&b""[..], &layout(), &TransformPipeline::default(), None, 0)
            .await
            .unwrap();
        assert_eq!(outcome.part_files, vec![layout().part_path(0).unwrap()]);
        assert_eq!(backend.object(&outcome.part_files[0]).unwrap().len(), 0);

        let version = version_for(&layout(), &TransformPipeline::default(), &outcome);
        let mut sink = Vec::new();
        coordinator(&backend, 1_000)
            .download(&version, &TransformPipeline::default(), &mut sink, 0)
            .await
            .unwrap();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_for_each_pipeline() {
        let data = noise(10_000);
        let pipelines = vec![
            TransformPipeline::default(),
            TransformPipeline::new(vec![encrypted()]),
            TransformPipeline::new(vec![compressed(), encrypted()]),
        ];
        for pipeline in pipelines {
            let backend = Arc::new(MemoryBackend::new());
            let coordinator = coordinator(&backend, 1_000);
            let outcome = coordinator.upload(&data[..], &layout(), &pipeline, None, 0).await.unwrap();
            let version = version_for(&layout(), &pipeline, &outcome);

            let mut sink = Vec::new();
            let result = coordinator.download(&version, &pipeline, &mut sink, 0).await.unwrap();
            assert_eq!(sink, data, "{:?}", pipeline.names());
            assert_eq!(result.bytes_written, data.len() as u64);
            assert_eq!(result.chunks_downloaded, outcome.part_files.len() as u64);
        }
    }

    #[tokio::test]
    async fn test_progress_events() {
        let backend = Arc::new(MemoryBackend::new());
        let progress = Arc::new(RecordingProgress::default());
        let coordinator = ChunkedTransferCoordinator::new(
            backend.executor(),
            ChunkSettings { chunk_size: 1_000, read_size: 300 },
            progress.clone(),
        );
        coordinator
            .upload(&noise(2_500)[..], &layout(), &TransformPipeline::default(), None, 0)
            .await
            .unwrap();
        assert_eq!(*progress.started.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*progress.bytes.lock().unwrap(), 2_500);
    }

    #[tokio::test]
    async fn test_continue_interrupted_encrypted_upload() {
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator(&backend, 1_000);
        let pipeline = TransformPipeline::new(vec![compressed(), encrypted()]);
        let data = noise(20_000);
        let hash = sha256_hex(&data);

        backend.limit_object_puts(Some(2));
        let err = coordinator
            .upload(&data[..], &layout(), &pipeline, Some(&hash), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::TransientNetwork(_)));
        backend.limit_object_puts(None);

        let outcome = coordinator
            .upload(&data[..], &layout(), &pipeline, Some(&hash), 2)
            .await
            .unwrap();
        assert_eq!(outcome.uploaded[0].index, 2);
        assert_eq!(outcome.part_files[0], layout().part_path(0).unwrap());
        assert_eq!(outcome.part_files.len(), outcome.uploaded.len() + 2);

        let version = version_for(&layout(), &pipeline, &outcome);
        let mut sink = Vec::new();
        coordinator.download(&version, &pipeline, &mut sink, 0).await.unwrap();
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn test_continue_with_exactly_matching_parts() {
        let backend = Arc::new(MemoryBackend::new());
        let layout = layout();
        let data = noise(2_500);
        backend.insert_object(&layout.part_path(0).unwrap(), &data[..1_000]);
        backend.insert_object(&layout.part_path(1).unwrap(), &data[1_000..2_000]);

        let outcome = coordinator(&backend, 1_000)
            .upload(&data[..], &layout, &TransformPipeline::default(), None, 2)
            .await
            .unwrap();
        assert_eq!(outcome.uploaded.len(), 1);
        assert_eq!(outcome.part_files.len(), 3);
        assert_eq!(backend.object(&outcome.part_files[2]).unwrap(), &data[2_000..]);
    }

    #[tokio::test]
    async fn test_continue_rejects_count_mismatch() {
        let backend = Arc::new(MemoryBackend::new());
        let layout = layout();
        for i in 0..3 {
            backend.insert_object(&layout.part_path(i).unwrap(), &[0u8; 1_000]);
        }
        let err = coordinator(&backend, 1_000)
            .upload(&noise(5_000)[..], &layout, &TransformPipeline::default(), None, 2)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_continue_rejects_directory_in_part_dir() {
        let backend = Arc::new(MemoryBackend::new());
        let layout = layout();
        backend.insert_object(&layout.part_path(0).unwrap(), &[0u8; 1_000]);
        backend.insert_object(&format!("{}/nested/file", layout.base_path()), b"x");
        let err = coordinator(&backend, 1_000)
            .upload(&noise(5_000)[..], &layout, &TransformPipeline::default(), None, 2)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_continue_rejects_non_integer_index() {
        let backend = Arc::new(MemoryBackend::new());
        let layout = layout();
        backend.insert_object(&layout.part_path(0).unwrap(), &[0u8; 1_000]);
        backend.insert_object(&format!("{}/abcdefgh-big.bin.partial", layout.base_path()), &[0u8; 1_000]);
        let err = coordinator(&backend, 1_000)
            .upload(&noise(5_000)[..], &layout, &TransformPipeline::default(), None, 2)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_encrypted_continuation_needs_content_hash() {
        let backend = Arc::new(MemoryBackend::new());
        let err = coordinator(&backend, 1_000)
            .upload(&noise(5_000)[..], &layout(), &TransformPipeline::new(vec![encrypted()]), None, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_missing_part_is_integrity_error() {
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator(&backend, 1_000);
        let pipeline = TransformPipeline::default();
        let outcome = coordinator.upload(&noise(2_500)[..], &layout(), &pipeline, None, 0).await.unwrap();
        backend.remove_object(&outcome.part_files[1]);

        let version = version_for(&layout(), &pipeline, &outcome);
        let err = coordinator.download(&version, &pipeline, &mut Vec::new(), 0).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_transform_mismatch_is_integrity_error() {
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator(&backend, 1_000);
        let written_with = TransformPipeline::new(vec![compressed()]);
        let outcome = coordinator.upload(&noise(500)[..], &layout(), &written_with, None, 0).await.unwrap();
        let version = version_for(&layout(), &written_with, &outcome);

        let err = coordinator
            .download(&version, &TransformPipeline::default(), &mut Vec::new(), 0)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_resume_download_into_file() {
        let data = noise(20_000);
        for pipeline in [TransformPipeline::default(), TransformPipeline::new(vec![compressed(), encrypted()])] {
            let backend = Arc::new(MemoryBackend::new());
            let coordinator = coordinator(&backend, 1_000);
            let outcome = coordinator.upload(&data[..], &layout(), &pipeline, None, 0).await.unwrap();
            let version = version_for(&layout(), &pipeline, &outcome);

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("big.bin");
            tokio::fs::write(&path, &data[..7_500]).await.unwrap();

            let mut file = tokio::fs::OpenOptions::new().read(true).write(true).open(&path).await.unwrap();
            let result = coordinator.download(&version, &pipeline, &mut file, 7).await.unwrap();
            drop(file);

            assert_eq!(result.resumed_from, 7);
            assert_eq!(result.chunks_downloaded, outcome.part_files.len() as u64 - 7);
            assert_eq!(tokio::fs::read(&path).await.unwrap(), data, "{:?}", pipeline.names());
        }
    }

    #[tokio::test]
    async fn test_resume_when_replay_outgrows_local_copy() {
        // The replayed chunks decode to more plaintext than the local copy holds
        let data = noise(1_000);
        let pipeline = TransformPipeline::new(vec![compressed()]);
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator(&backend, 100);
        let outcome = coordinator.upload(&data[..], &layout(), &pipeline, None, 0).await.unwrap();
        assert!(outcome.part_files.len() > 2);
        let version = version_for(&layout(), &pipeline, &outcome);

        let mut sink = data[..10].to_vec();
        coordinator.download(&version, &pipeline, &mut sink, 2).await.unwrap();
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn test_fresh_download_overwrites_existing_sink() {
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator(&backend, 1_000);
        let pipeline = TransformPipeline::default();
        let data = noise(1_500);
        let outcome = coordinator.upload(&data[..], &layout(), &pipeline, None, 0).await.unwrap();
        let version = version_for(&layout(), &pipeline, &outcome);

        let mut sink = vec![9u8; 4_000];
        coordinator.download(&version, &pipeline, &mut sink, 0).await.unwrap();
        assert_eq!(sink, data);
    }

    /// Version with hand-placed parts of the given sizes
    fn stored_version(backend: &MemoryBackend, sizes: &[usize], chunk_size: Option<&str>, hash: Option<&str>) -> Version {
        let layout = layout();
        let mut version = Version::new("v1", layout.base_path());
        for (i, size) in sizes.iter().enumerate() {
            let path = layout.part_path(i as u64).unwrap();
            backend.insert_object(&path, &vec![0u8; *size]);
            version.add_part_file(path);
        }
        if let Some(chunk_size) = chunk_size {
            version.add_property(CHUNK_SIZE_PROPERTY, chunk_size);
        }
        if let Some(hash) = hash {
            version.add_property(HASH_PROPERTY, hash);
        }
        version
    }

    async fn local_file(dir: &tempfile::TempDir, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("local.bin");
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_probe_resume_math() {
        let backend = Arc::new(MemoryBackend::new());
        let version = stored_version(&backend, &[5_120_000, 5_120_000], Some("5120000"), None);
        let coordinator = coordinator(&backend, DEFAULT_CHUNK_SIZE);
        let dir = tempfile::tempdir().unwrap();
        let strategy = VersionStrategy::fixed("v1");

        let partial = local_file(&dir, &vec![1u8; 5_120_000]).await;
        let probe = coordinator.probe_resume(&version, &partial, &strategy).await.unwrap();
        assert_eq!(probe, DownloadProbe::resume_from(1));

        let full = local_file(&dir, &vec![1u8; 10_240_000]).await;
        let probe = coordinator.probe_resume(&version, &full, &strategy).await.unwrap();
        assert_eq!(probe, DownloadProbe::complete());
    }

    #[tokio::test]
    async fn test_probe_chunk_size_drift() {
        let dir = tempfile::tempdir().unwrap();
        let local = local_file(&dir, &[1u8; 10]).await;
        let strategy = VersionStrategy::fixed("v1");

        let backend = Arc::new(MemoryBackend::new());
        let version = stored_version(&backend, &[5_120_000, 5_632_000], Some("5120000"), None);
        assert!(coordinator(&backend, 1_000).probe_resume(&version, &local, &strategy).await.is_ok());

        let backend = Arc::new(MemoryBackend::new());
        let version = stored_version(&backend, &[5_120_000, 6_000_000], Some("5120000"), None);
        let err = coordinator(&backend, 1_000)
            .probe_resume(&version, &local, &strategy)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_probe_uses_recorded_hash() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 150];
        let local = local_file(&dir, &data).await;
        let coordinator_for = |backend: &Arc<MemoryBackend>| coordinator(backend, 100);

        let backend = Arc::new(MemoryBackend::new());
        let version = stored_version(&backend, &[100, 100], Some("100"), Some(&sha256_hex(&data)));
        let probe = coordinator_for(&backend)
            .probe_resume(&version, &local, &VersionStrategy::for_file(&local))
            .await
            .unwrap();
        assert_eq!(probe, DownloadProbe::complete());

        let backend = Arc::new(MemoryBackend::new());
        let version = stored_version(&backend, &[100, 100], Some("100"), Some(&sha256_hex(b"other")));
        let probe = coordinator_for(&backend)
            .probe_resume(&version, &local, &VersionStrategy::fixed("v1"))
            .await
            .unwrap();
        assert_eq!(probe, DownloadProbe::resume_from(1));
    }

    #[tokio::test]
    async fn test_probe_requires_every_recorded_part() {
        let dir = tempfile::tempdir().unwrap();
        let local = local_file(&dir, &[]).await;
        let strategy = VersionStrategy::fixed("v1");

        // Parts recorded but the part directory answers 404
        let backend = Arc::new(MemoryBackend::new());
        let mut version = stored_version(&backend, &[], Some("100"), None);
        for i in 0..3 {
            version.add_part_file(layout().part_path(i).unwrap());
        }
        let err = coordinator(&backend, 100)
            .probe_resume(&version, &local, &strategy)
            .await
            .unwrap_err();
        assert!(err.is_integrity());

        // Fewer parts stored than recorded
        let backend = Arc::new(MemoryBackend::new());
        let mut version = stored_version(&backend, &[100, 100], Some("100"), None);
        version.add_part_file(layout().part_path(2).unwrap());
        let err = coordinator(&backend, 100)
            .probe_resume(&version, &local, &strategy)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_oversized_part_is_not_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let oversized = 100 + PART_RESPONSE_SLACK as usize + 1;
        let version = stored_version(&backend, &[100, oversized], Some("100"), None);
        let coordinator = coordinator(&backend, 100);
        backend.clear_requests();

        let err = coordinator
            .download(&version, &TransformPipeline::default(), &mut Vec::new(), 0)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(backend.requests_to("/object"), 2);
        assert_eq!(backend.failed_sends(), 0);
    }

    #[tokio::test]
    async fn test_probe_rejects_invalid_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let local = local_file(&dir, &[1u8; 10]).await;
        let backend = Arc::new(MemoryBackend::new());
        let version = stored_version(&backend, &[100, 100], Some("lots"), None);
        let err = coordinator(&backend, 100)
            .probe_resume(&version, &local, &VersionStrategy::fixed("v1"))
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }
}

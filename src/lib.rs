// Drivevault - versioned, resumable, chunked file sync for REST object storage
// Library root: module tree and the public surface used by the CLI

pub mod chunked;
pub mod config;
pub mod crypto;
pub mod file_manager;
pub mod metadata;
pub mod path_translator;
pub mod progress;
pub mod providers;
pub mod transforms;
pub mod version;

pub use chunked::{ChunkSettings, ChunkedTransferCoordinator, DownloadProbe, DownloadSink, VersionLayout};
pub use config::DriveConfig;
pub use file_manager::{DirectoryWalker, DownStream, FileManager, FilePath, UpStream};
pub use metadata::{FileMetadata, MetadataStore, Version};
pub use path_translator::{PathTranslator, ReplacementRule};
pub use progress::{LogProgress, NoProgress, ProgressReporter};
pub use providers::{DriveError, RequestExecutor, TokenCache};
pub use transforms::{EncryptionKey, TransformPipeline};
pub use version::VersionStrategy;

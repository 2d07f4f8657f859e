//! Versioned metadata documents
//!
//! Every logical file `R` has one JSON document at `R/metadata.json` mapping
//! version ids to the version record. The document is the only source of
//! truth for which versions exist and is always rewritten whole.
//!
//! Updates are read-modify-write without any locking: two writers committing
//! to the same path at the same time can lose one of the versions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::providers::{DriveError, DriveRequest, RequestExecutor};

pub const METADATA_FILE_NAME: &str = "metadata.json";

fn metadata_log(msg: &str) {
    debug!(target: "drivevault::metadata", "{}", msg);
}

/// One stored snapshot of a logical file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "basePath")]
    pub base_path: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(rename = "transforms", default)]
    pub transform_names: Vec<String>,
    #[serde(rename = "parts", default)]
    pub part_files: Vec<String>,
}

impl Version {
    pub fn new(id: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_path: base_path.into(),
            properties: BTreeMap::new(),
            transform_names: Vec::new(),
            part_files: Vec::new(),
        }
    }

    pub fn add_property(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.as_str())
    }

    pub fn add_transform(&mut self, name: impl Into<String>) {
        self.transform_names.push(name.into());
    }

    pub fn add_part_file(&mut self, path: impl Into<String>) {
        self.part_files.push(path.into());
    }
}

/// Version history of one logical file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMetadata {
    versions: BTreeMap<String, Version>,
}

impl FileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, DriveError> {
        let mut metadata: FileMetadata = serde_json::from_slice(bytes)
            .map_err(|e| DriveError::ParseError(format!("Invalid metadata document: {}", e)))?;
        for (id, version) in metadata.versions.iter_mut() {
            version.id = id.clone();
        }
        Ok(metadata)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, DriveError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn contains(&self, version_id: &str) -> bool {
        self.versions.contains_key(version_id)
    }

    pub fn get_version(&self, version_id: &str) -> Option<&Version> {
        self.versions.get(version_id)
    }

    /// Insert or replace the version with the same id
    pub fn update_version(&mut self, version: Version) {
        self.versions.insert(version.id.clone(), version);
    }

    pub fn remove_version(&mut self, version_id: &str) -> Option<Version> {
        self.versions.remove(version_id)
    }

    /// Versions ordered by id
    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.versions.values()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Reads and writes metadata documents through the executor
pub struct MetadataStore {
    executor: Arc<RequestExecutor>,
}

impl MetadataStore {
    pub fn new(executor: Arc<RequestExecutor>) -> Self {
        Self { executor }
    }

    pub fn document_path(remote_path: &str) -> String {
        format!("{}/{}", remote_path.trim_end_matches('/'), METADATA_FILE_NAME)
    }

    /// Metadata for the logical file at `remote_path`; empty when none was stored yet
    pub async fn get(&self, remote_path: &str) -> Result<FileMetadata, DriveError> {
        let document = Self::document_path(remote_path);
        let response = self.executor.execute(&DriveRequest::get_object(&document)?).await?;
        if response.is_not_found() {
            metadata_log(&format!("No metadata at {}", document));
            return Ok(FileMetadata::new());
        }
        let response = response.error_for_status()?;
        let metadata = FileMetadata::from_json(&response.body)?;
        metadata_log(&format!("Loaded {} version(s) from {}", metadata.len(), document));
        Ok(metadata)
    }

    /// Overwrite the whole document
    pub async fn put(&self, remote_path: &str, metadata: &FileMetadata) -> Result<(), DriveError> {
        let document = Self::document_path(remote_path);
        let body = metadata.to_json()?;
        self.executor
            .execute(&DriveRequest::put_object(&document, body)?)
            .await?
            .error_for_status()?;
        metadata_log(&format!("Committed {} version(s) to {}", metadata.len(), document));
        Ok(())
    }
}

//! Shared types for the drive backend
//!
//! This module contains the types shared by the request layer, the metadata
//! store and the transfer coordinator: listing entries as returned by the
//! REST API, and the crate-wide error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP methods understood by the drive API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Delete,
}

impl Method {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Content types sent with drive requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    OctetStream,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::OctetStream => "application/octet-stream",
        }
    }
}

/// A file as reported by a metadata listing or the flat directory list endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Length", default)]
    pub length: u64,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, path: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            length,
        }
    }
}

/// A sub-directory as reported by a metadata listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Path")]
    pub path: String,
}

/// Result of a metadata listing: one directory level split into files and directories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    #[serde(rename = "Files", default)]
    pub files: Vec<FileEntry>,
    #[serde(rename = "Directories", default)]
    pub directories: Vec<DirEntry>,
}

impl DirectoryListing {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

/// Drive error type
#[derive(Error, Debug)]
pub enum DriveError {
    /// Backup root or request path outside the drive namespace
    #[error("Path configuration error: {0}")]
    PathConfiguration(String),

    #[error("Version {version} already exists for {path}")]
    VersionConflict { path: String, version: String },

    #[error("Version {version} does not exist for {path}")]
    InvalidVersion { path: String, version: String },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error after retries: {0}")]
    TransientNetwork(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Transform failed: {0}")]
    TransformFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DriveError {
    /// Check if this error is recoverable (the caller may retry the whole operation)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DriveError::TransientNetwork(_) | DriveError::IoError(_))
    }

    /// Check if this error signals corrupted or inconsistent remote state
    pub fn is_integrity(&self) -> bool {
        matches!(self, DriveError::Integrity(_))
    }
}

impl From<serde_json::Error> for DriveError {
    fn from(e: serde_json::Error) -> Self {
        DriveError::ParseError(e.to_string())
    }
}

//! Local <-> remote path mapping
//!
//! Local files below `local_base` are stored remotely below `backup_root`,
//! which must live inside the `/Drive/` namespace. Remote names are
//! sanitized with a configurable replacement table, encrypted files carry an
//! `.aes` suffix and large files are stored as numbered `.partial` objects.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::providers::DriveError;

pub const NAMESPACE_PREFIX: &str = "/Drive/";
pub const ENCRYPTION_SUFFIX: &str = ".aes";
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const PARTIAL_INDEX_WIDTH: usize = 8;
pub const MAX_PARTIAL_ITERATION: u64 = 99_999_999;

/// One entry of the character replacement table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub character: String,
    pub replacement: String,
}

impl ReplacementRule {
    pub fn new(character: &str, replacement: &str) -> Self {
        Self {
            character: character.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

/// Characters the drive service refuses in object names
pub fn default_replacements() -> Vec<ReplacementRule> {
    ["\\", ":", "*", "?", "\"", "<", ">", "|"]
        .iter()
        .map(|c| ReplacementRule::new(c, "_"))
        .collect()
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn collapse_separators(path: &str) -> String {
    let mut out = path.to_string();
    while out.contains("//") {
        out = out.replace("//", "/");
    }
    out
}

/// Name of part `iteration` of `original`, nested in a directory named after it:
/// `/dir/file` -> `/dir/file/00000003-file.partial`
pub fn partial_name(original: &str, iteration: u64) -> Result<String, DriveError> {
    if iteration > MAX_PARTIAL_ITERATION {
        return Err(DriveError::Integrity(format!(
            "Part index {} exceeds maximum of {}",
            iteration, MAX_PARTIAL_ITERATION
        )));
    }
    let original = original.trim_end_matches('/');
    let file_name = base_name(original);
    Ok(format!(
        "{}/{:0width$}-{}{}",
        original,
        iteration,
        file_name,
        PARTIAL_SUFFIX,
        width = PARTIAL_INDEX_WIDTH
    ))
}

pub fn is_encrypted_path(remote_path: &str) -> bool {
    remote_path.ends_with(ENCRYPTION_SUFFIX)
}

fn strip_encryption_suffix(remote_path: &str) -> &str {
    remote_path.strip_suffix(ENCRYPTION_SUFFIX).unwrap_or(remote_path)
}

/// `NNNNNNNN-<name>.partial`, optionally followed by the encryption suffix
pub fn is_partial_name(remote_path: &str) -> bool {
    let unencrypted = strip_encryption_suffix(remote_path);
    if !unencrypted.ends_with(PARTIAL_SUFFIX) {
        return false;
    }
    let file_name = base_name(remote_path).as_bytes();
    file_name.len() > PARTIAL_INDEX_WIDTH
        && file_name[..PARTIAL_INDEX_WIDTH].iter().all(|b| b.is_ascii_digit())
        && file_name[PARTIAL_INDEX_WIDTH] == b'-'
}

/// Numeric index of a part object: the text before the first `-` of its name
pub fn partial_index(remote_path: &str) -> Option<u64> {
    let file_name = base_name(remote_path);
    let (index, _) = file_name.split_once('-')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

#[derive(Debug, Clone)]
pub struct PathTranslator {
    local_base: PathBuf,
    backup_root: String,
    replacements: Vec<ReplacementRule>,
}

impl PathTranslator {
    pub fn new(
        local_base: impl Into<PathBuf>,
        backup_root: &str,
        replacements: Vec<ReplacementRule>,
    ) -> Result<Self, DriveError> {
        if !backup_root.starts_with(NAMESPACE_PREFIX) {
            return Err(DriveError::PathConfiguration(format!(
                "Backup root '{}' must start with {}",
                backup_root, NAMESPACE_PREFIX
            )));
        }
        let mut backup_root = backup_root.to_string();
        if !backup_root.ends_with('/') {
            backup_root.push('/');
        }
        Ok(Self {
            local_base: local_base.into(),
            backup_root,
            replacements,
        })
    }

    pub fn local_base(&self) -> &Path {
        &self.local_base
    }

    /// Always ends with `/`
    pub fn backup_root(&self) -> &str {
        &self.backup_root
    }

    pub fn sanitize(&self, value: &str) -> String {
        let mut out = value.to_string();
        for rule in &self.replacements {
            if !rule.character.is_empty() && out.contains(&rule.character) {
                out = out.replace(&rule.character, &rule.replacement);
            }
        }
        out
    }

    pub fn combine(&self, left: &str, right: &str) -> String {
        let left = self.sanitize(left);
        let right = self.sanitize(right);
        format!(
            "{}/{}",
            left.strip_suffix('/').unwrap_or(&left),
            right.strip_prefix('/').unwrap_or(&right)
        )
    }

    /// Map a remote path below the backup root to its local path
    pub fn to_local(&self, remote_path: &str, strip_encryption: bool) -> Result<PathBuf, DriveError> {
        let root_dir = self.backup_root.trim_end_matches('/');
        let relative = if remote_path == root_dir {
            ""
        } else {
            remote_path.strip_prefix(&self.backup_root).ok_or_else(|| {
                DriveError::PathConfiguration(format!(
                    "Remote path '{}' is outside backup root {}",
                    remote_path, self.backup_root
                ))
            })?
        };
        let relative = if strip_encryption {
            strip_encryption_suffix(relative)
        } else {
            relative
        };

        // Lexical normalization, never climbing above the local base
        let mut parts: Vec<&str> = Vec::new();
        for segment in relative.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                s => parts.push(s),
            }
        }

        let mut local = self.local_base.clone();
        for part in parts {
            local.push(part);
        }
        Ok(local)
    }

    /// Map a local path to its remote object path
    pub fn to_remote(&self, local_path: &Path, encrypted: bool) -> String {
        let relative = local_path.strip_prefix(&self.local_base).unwrap_or(local_path);
        let relative: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().replace('\\', "/")),
                _ => None,
            })
            .collect();
        let relative = relative.join("/");

        let file_name = base_name(&relative);
        let directory = parent_dir(&relative);

        let mut file_name = self.sanitize(file_name);
        if encrypted && !file_name.is_empty() {
            file_name.push_str(ENCRYPTION_SUFFIX);
        }
        let directory = self.sanitize(directory);

        collapse_separators(&format!("{}{}/{}", self.backup_root, directory, file_name))
    }

    /// Map a stored part object (`R/<version>/<name>/NNNNNNNN-<name>.partial`)
    /// back to its chunk index and the local path of the logical file `R`
    pub fn partial_local_path(&self, remote_part: &str) -> Option<(u64, PathBuf)> {
        if !is_partial_name(remote_part) {
            return None;
        }
        let index = partial_index(remote_part)?;
        let version_base = parent_dir(remote_part);
        let logical = parent_dir(parent_dir(version_base));
        if base_name(version_base) != base_name(logical) {
            return None;
        }
        let local = self.to_local(logical, true).ok()?;
        Some((index, local))
    }
}

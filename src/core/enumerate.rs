/*!
 * File enumeration for source stages
 */

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::router::FileDescriptor;
use crate::error::{FlowError, Result};

/// Expand a glob pattern into regular files, in pattern order
///
/// Directories matching the pattern are skipped.
pub fn glob_files(pattern: &str) -> Result<Vec<FileDescriptor>> {
    let mut files = Vec::new();

    for entry in glob::glob(pattern)? {
        let path = entry.map_err(|e| FlowError::Io(e.into()))?;
        let metadata = std::fs::metadata(&path).map_err(|e| FlowError::from_path_io(&path, e))?;

        if metadata.is_file() {
            files.push(FileDescriptor::new(path, metadata.len()));
        } else {
            debug!("Skipping non-file glob match {:?}", path);
        }
    }

    if files.is_empty() {
        warn!("Glob pattern '{}' matched no files", pattern);
    }

    Ok(files)
}

/// Recursively list regular files under `root`, sorted by file name
pub fn walk_files(root: &Path) -> Result<Vec<FileDescriptor>> {
    if !root.exists() {
        return Err(FlowError::SourceNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(FlowError::Config(format!(
            "{:?} is not a directory",
            root
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            match e.into_io_error() {
                Some(io) => FlowError::from_path_io(path, io),
                None => FlowError::Config(format!("Filesystem loop detected at {:?}", path)),
            }
        })?;

        if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .map_err(|e| FlowError::Io(std::io::Error::other(e.to_string())))?;
            files.push(FileDescriptor::new(entry.into_path(), metadata.len()));
        }
    }

    Ok(files)
}

/// Lexically normalize a path (drop `.` components, fold `..` where possible)
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other.as_os_str()),
        }
    }

    if normalized.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        normalized
    }
}

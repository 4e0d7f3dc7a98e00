use std::path::{Component, Path, PathBuf};

use crate::error::TransferError;

/// Resolve a requested file name to a regular file under `root`.
///
/// Rejects, as [`TransferError::FileNotFound`]:
/// - Empty names
/// - Absolute paths, prefixes, and `..` components (anything that could leave `root`)
/// - Paths that do not exist
/// - Directories
pub fn resolve_served_path(root: &Path, name: &str) -> Result<PathBuf, TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::FileNotFound("no file name given".into()));
    }

    let requested = Path::new(name);
    for component in requested.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::FileNotFound(format!(
                    "{name}: outside the served directory"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    let path = root.join(requested);
    let metadata = std::fs::metadata(&path)
        .map_err(|e| TransferError::FileNotFound(format!("{name}: {e}")))?;
    if metadata.is_dir() {
        return Err(TransferError::FileNotFound(format!("{name}: is a directory")));
    }

    Ok(path)
}

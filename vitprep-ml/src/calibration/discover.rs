//! Image discovery under the dataset root.

use crate::error::PrepError;
use std::path::{Path, PathBuf};
use tracing::debug;
use vitprep_core::DiscoveryOrder;
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Recursively collect files under `root` whose extension equals
/// `extension` exactly (case-sensitive, no leading dot).
///
/// Hidden files and directories are skipped and symlinks are followed.
/// Unreadable entries are logged and ignored. An empty result is
/// [`PrepError::NoImages`].
pub fn discover_images(
    root: &Path,
    extension: &str,
    order: DiscoveryOrder,
) -> Result<Vec<PathBuf>, PrepError> {
    let mut walker = WalkDir::new(root).follow_links(true);
    if order == DiscoveryOrder::Sorted {
        walker = walker.sort_by_file_name();
    }

    let mut images = Vec::new();
    for entry in walker.into_iter().filter_entry(|e| !is_hidden(e)) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some(extension)
        {
            images.push(entry.into_path());
        }
    }

    if images.is_empty() {
        return Err(PrepError::NoImages {
            root: root.to_path_buf(),
            extension: extension.to_string(),
        });
    }
    if order == DiscoveryOrder::Sorted {
        images.sort();
    }
    debug!(root = %root.display(), count = images.len(), "Discovered images");
    Ok(images)
}

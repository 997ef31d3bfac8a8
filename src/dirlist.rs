//! On-demand filesystem directory listing. No index is kept; every
//! Browse of a container re-reads the directory from disk.

use std::path::{Path, PathBuf};

use crate::util::mime::{mime_lookup, MimeClass};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mime: Option<(MimeClass, &'static str)>,
}

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("path escapes media root")]
    Containment,
    #[error("directory not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves `relative` under `media_root`, enforcing that the result is
/// a canonical descendant of the (canonical) root.
pub fn resolve_contained(media_root: &Path, relative: &str) -> Result<PathBuf, ListError> {
    let sanitised = crate::util::path::sanitise_path(relative).ok_or(ListError::Containment)?;
    let candidate = if sanitised.is_empty() {
        media_root.to_path_buf()
    } else {
        media_root.join(&sanitised)
    };
    let canonical_root = media_root.canonicalize().map_err(|_| ListError::NotFound)?;
    let canonical_candidate = candidate.canonicalize().map_err(|_| ListError::NotFound)?;
    if !canonical_candidate.starts_with(&canonical_root) {
        return Err(ListError::Containment);
    }
    Ok(canonical_candidate)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('$')
}

/// Reads one directory's direct children, filtered and classified.
pub async fn list_directory(dir: &Path) -> Result<Vec<Entry>, ListError> {
    let mut read = tokio::fs::read_dir(dir).await.map_err(|_| ListError::NotFound)?;
    let mut entries = Vec::new();
    while let Some(ent) = read.next_entry().await? {
        let name = ent.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) {
            continue;
        }
        let Ok(meta) = ent.metadata().await else { continue };
        if meta.is_dir() {
            entries.push(Entry { name, kind: EntryKind::Directory, size: 0, mime: None });
        } else if meta.is_file() {
            if let Some(mime) = mime_lookup(&name) {
                entries.push(Entry { name, kind: EntryKind::File, size: meta.len(), mime: Some(mime) });
            }
        }
    }
    entries.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(entries)
}

/// Clamps `(starting_index, requested_count)` to `total`, per §4.F.
/// `requested_count == -1` means "all remaining".
pub fn paginate(entries: Vec<Entry>, starting_index: i64, requested_count: i64) -> (Vec<Entry>, usize) {
    let total = entries.len();
    let start = if starting_index < 0 { 0 } else { starting_index as usize };

    if start >= total {
        return (Vec::new(), total);
    }

    let mut count = if requested_count < 0 {
        total - start
    } else {
        requested_count as usize
    };
    if start + count > total {
        count = total - start;
    }
    let window = entries.into_iter().skip(start).take(count).collect();
    (window, total)
}

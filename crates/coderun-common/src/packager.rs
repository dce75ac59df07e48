// Turns a user source tree into a deterministic, backend-independent
// build artifact and indexes its exported entry points.

use crate::artifact::{BuildArtifact, Export};
use crate::constants::artifact::{
    ARCHIVE_BLOB, EXCLUDED_DIRS, EXCLUDED_EXTENSIONS, SOURCE_EXTENSION,
};
use crate::error::BuildError;
use flate2::{Compression, GzBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Column-0 function definitions, optionally `async`.
static EXPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("Invalid export regex")
});

/// A file selected for packaging.
struct SourceFile {
    /// Path inside the archive, always `/`-separated.
    name: String,
    path: PathBuf,
    executable: bool,
}

/// Pack `source` into an artifact.
///
/// Identical trees yield byte-identical archives: entries are sorted by
/// path and every header field that depends on the host is normalized.
pub fn build(source: &Path) -> Result<BuildArtifact, BuildError> {
    if !source.is_dir() {
        return Err(BuildError::MissingSource(source.to_path_buf()));
    }

    let files = collect_files(source)?;
    if files.is_empty() {
        return Err(BuildError::EmptySource(source.to_path_buf()));
    }

    let mut blobs = BTreeMap::new();
    blobs.insert(ARCHIVE_BLOB.to_string(), pack(&files)?);

    let exports = discover_exports(&files)?;
    tracing::debug!(
        files = files.len(),
        exports = exports.len(),
        "Packaged source tree {}",
        source.display()
    );

    Ok(BuildArtifact { blobs, exports })
}

fn is_excluded(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        return entry.depth() > 0 && EXCLUDED_DIRS.contains(&name.as_ref());
    }
    entry
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| EXCLUDED_EXTENSIONS.contains(&ext))
}

fn collect_files(source: &Path) -> Result<Vec<SourceFile>, BuildError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| BuildError::Io {
                path: entry.path().to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        files.push(SourceFile {
            name,
            path: entry.path().to_path_buf(),
            executable: is_executable(&entry),
        });
    }

    // Sorting by file name per directory is not the same as sorting by the
    // joined path ("a-b/x" vs "a/x"), so sort the final list.
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(unix)]
fn is_executable(entry: &DirEntry) -> bool {
    use std::os::unix::fs::PermissionsExt;
    entry
        .metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_entry: &DirEntry) -> bool {
    false
}

fn pack(files: &[SourceFile]) -> Result<Vec<u8>, BuildError> {
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(encoder);

    for file in files {
        let data = std::fs::read(&file.path).map_err(|source| BuildError::Io {
            path: file.path.clone(),
            source,
        })?;

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(if file.executable { 0o755 } else { 0o644 });
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        tar.append_data(&mut header, &file.name, data.as_slice())
            .map_err(BuildError::Archive)?;
    }

    let encoder = tar.into_inner().map_err(BuildError::Archive)?;
    encoder.finish().map_err(BuildError::Archive)
}

/// Index every public top-level function in the tree's source files,
/// ordered by file then line.
fn discover_exports(files: &[SourceFile]) -> Result<Vec<Export>, BuildError> {
    let mut exports = Vec::new();
    for file in files {
        let is_source = Path::new(&file.name)
            .extension()
            .is_some_and(|e| e == SOURCE_EXTENSION);
        if !is_source {
            continue;
        }

        let bytes = std::fs::read(&file.path).map_err(|source| BuildError::Io {
            path: file.path.clone(),
            source,
        })?;
        exports.extend(scan_exports(&file.name, &String::from_utf8_lossy(&bytes)));
    }
    exports.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
    Ok(exports)
}

fn scan_exports(file: &str, text: &str) -> Vec<Export> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let symbol = EXPORT_REGEX.captures(line)?.get(1)?.as_str();
            if symbol.starts_with('_') {
                return None;
            }
            Some(Export {
                symbol: symbol.to_string(),
                file: file.to_string(),
                line: idx as u32 + 1,
            })
        })
        .collect()
}

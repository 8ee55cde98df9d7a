use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const RAW_EXTENSION: &str = "mib";

const BYTES_PER_MB: f64 = 1e6;

/// One raw file selected for conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileHandle {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl RawFileHandle {
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / BYTES_PER_MB
    }

    /// The file's directory, used for sidecar and auxiliary lookups.
    pub fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

pub fn is_raw_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(RAW_EXTENSION)
}

/// True when the last path segment contains a glob wildcard.
pub fn has_wildcard(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().contains(['*', '?', '[']))
        .unwrap_or(false)
}

/// Find the MIB files to convert under `root`.
///
/// A literal file path is returned as-is when it has the raw suffix, whatever
/// its size. Directories are walked recursively and only files of at least
/// `min_size_mb` megabytes are kept. A path that does not exist but has a
/// wildcard in its last segment is expanded against the parent directory,
/// each match handled like a root of its own.
pub fn find_mib_files(root: &Path, min_size_mb: u64) -> io::Result<Vec<RawFileHandle>> {
    let meta = match fs::metadata(root) {
        Ok(meta) => meta,
        Err(_) if has_wildcard(root) => {
            debug!("Detected wildcard in {}", root.display());
            return expand_glob(root, min_size_mb);
        }
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        walk_dir(root, min_size_mb)
    } else if is_raw_file(root) {
        Ok(vec![RawFileHandle {
            path: root.to_path_buf(),
            size_bytes: meta.len(),
        }])
    } else {
        debug!("{} is not a MIB file", root.display());
        Ok(Vec::new())
    }
}

fn walk_dir(dir: &Path, min_size_mb: u64) -> io::Result<Vec<RawFileHandle>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            match walk_dir(&path, min_size_mb) {
                Ok(nested) => found.extend(nested),
                Err(e) => warn!("Skipping directory {}: {}", path.display(), e),
            }
            continue;
        }
        // Follows file symlinks; directory symlinks were excluded above.
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if !meta.is_file() || !is_raw_file(&path) {
            continue;
        }
        let handle = RawFileHandle {
            path,
            size_bytes: meta.len(),
        };
        if handle.size_mb() >= min_size_mb as f64 {
            found.push(handle);
        } else {
            debug!(
                "Ignoring {} ({:.0} MB < {} MB)",
                handle.path.display(),
                handle.size_mb(),
                min_size_mb
            );
        }
    }
    Ok(found)
}

fn expand_glob(pattern: &Path, min_size_mb: u64) -> io::Result<Vec<RawFileHandle>> {
    let parent = match pattern.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = pattern
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let full = Path::new(&glob::Pattern::escape(&parent.to_string_lossy())).join(name);
    let entries = glob::glob(&full.to_string_lossy())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut found = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping {}: {}", e.path().display(), e.error());
                continue;
            }
        };
        if path.is_dir() {
            debug!("Searching matched directory {}", path.display());
            found.extend(walk_dir(&path, min_size_mb)?);
        } else if is_raw_file(&path) {
            let size_bytes = fs::metadata(&path)?.len();
            found.push(RawFileHandle { path, size_bytes });
        } else {
            debug!("Skipping file {}", path.display());
        }
    }
    Ok(found)
}

use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::loader::SignalLoader;
use crate::signal::Signal;

/// Sanitised file name -> loaded signal.
pub type AuxiliaryDataSet = BTreeMap<String, Signal>;

/// Collect the auxiliary files directly inside `directory`.
///
/// Files must have one of `extensions` (with leading dot, compared as-is)
/// and be strictly smaller than `max_size_mb`. Files that fail to load are
/// logged and skipped.
pub fn collect_auxiliary(
    directory: &Path,
    max_size_mb: u64,
    extensions: &[String],
    loader: &dyn SignalLoader,
) -> AuxiliaryDataSet {
    debug!("Adding auxiliary data from directory {}", directory.display());
    let mut aux = AuxiliaryDataSet::new();

    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list auxiliary files in {}: {}", directory.display(), e);
            return aux;
        }
    };
    let mut paths: Vec<_> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    for path in paths {
        let meta = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        if !has_extension(&path, extensions) {
            continue;
        }
        let size_mb = meta.len() as f64 / 1e6;
        if size_mb >= max_size_mb as f64 {
            debug!(
                "Ignoring aux datafile {}. Filesize {:.0} >= {} MB",
                path.display(),
                size_mb,
                max_size_mb
            );
            continue;
        }

        debug!("Loading aux data {} with filesize {:.0} MB", path.display(), size_mb);
        let signal = match loader.load(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping aux datafile {}: {}", path.display(), e.report());
                continue;
            }
        };
        if signal.is_degenerate() || signal.pixels.is_empty() {
            debug!(
                "Ignoring {}, it has dimension 0 in both signal and navigation space",
                path.display()
            );
            continue;
        }
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().replace(' ', "_"))
            .unwrap_or_default();
        debug!("Adding aux data {} ({:?})", key, signal.shape);
        aux.insert(key, signal);
    }
    aux
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension() {
        Some(ext) => {
            let suffix = format!(".{}", ext.to_string_lossy());
            extensions.iter().any(|e| *e == suffix)
        }
        None => false,
    }
}

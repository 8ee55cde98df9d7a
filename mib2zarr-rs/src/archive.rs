use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ConvertError;

/// Packs a finished directory store into one zip file.
pub trait Archiver {
    fn archive(&self, source: &Path, destination: &Path) -> Result<(), ConvertError>;
}

/// External `7z`-compatible command line archiver.
#[derive(Debug, Clone)]
pub struct SevenZip {
    pub program: String,
}

impl SevenZip {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Archiver for SevenZip {
    fn archive(&self, source: &Path, destination: &Path) -> Result<(), ConvertError> {
        debug!(
            "Running {} a -tzip {} {}",
            self.program,
            destination.display(),
            source.display()
        );
        let output = Command::new(&self.program)
            .args(["a", "-tzip"])
            .arg(destination)
            .arg(source)
            .stdin(Stdio::null())
            .output()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().collect();
        for line in &lines[lines.len().saturating_sub(4)..] {
            debug!("{}: {}", self.program, line);
        }

        if !output.status.success() {
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                warn!("{}: {}", self.program, line);
            }
            return Err(ConvertError::Archiver {
                program: self.program.clone(),
                status: output.status,
                source_path: source.to_path_buf(),
            });
        }
        Ok(())
    }
}

/// Write a zip-backed store at `destination`.
///
/// `write_store` fills a staging directory created beside `destination`;
/// its contents are then packed with stored (uncompressed) entries so that
/// chunk keys stay directly addressable inside the archive. The staging
/// directory is always removed.
pub fn write_zip_store(
    destination: &Path,
    write_store: impl FnOnce(&Path) -> Result<()>,
) -> Result<()> {
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let staging = tempfile::Builder::new()
        .prefix(".mib2zarr-")
        .tempdir_in(&parent)
        .with_context(|| format!("creating staging directory in {}", parent.display()))?;

    let store_dir = staging.path().join("store");
    write_store(&store_dir)?;

    let packed = staging.path().join("store.zip");
    zip_directory(&store_dir, &packed)?;
    fs::rename(&packed, destination)
        .with_context(|| format!("moving zip store to {}", destination.display()))?;
    Ok(())
}

/// Zip every file below `root`, entry names relative to `root`.
pub fn zip_directory(root: &Path, destination: &Path) -> Result<()> {
    let file = File::create(destination)
        .with_context(|| format!("creating {}", destination.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut files = Vec::new();
    list_files(root, &mut files)?;
    files.sort();
    for path in files {
        let name = entry_name(root, &path)?;
        zip.start_file(name, options)?;
        let mut input = File::open(&path)?;
        io::copy(&mut input, &mut zip)?;
    }
    let mut writer = zip.finish()?;
    io::Write::flush(&mut writer)?;
    Ok(())
}

fn list_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            list_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root)?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

use std::path::{Path, PathBuf};

use crate::config::{DEFAULT_CHUNKS, MAX_AUX_FILESIZE_MB, MIN_MIB_FILESIZE_MB, SUPPORTED_AUX_EXTENSIONS};
use crate::error::ConvertError;
use crate::sidecar::SidecarParameters;

pub const OUTPUT_EXTENSION: &str = "zspy";

/// Options as supplied by the caller, before any sidecar is consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertOptions {
    pub navigation_shape: Option<Vec<usize>>,
    pub lineskip: usize,
    /// (navigation chunk, signal chunk)
    pub chunks: (u64, u64),
    pub zzip: bool,
    pub zstore: bool,
    pub overwrite: bool,
    pub min_mib_size: u64,
    pub max_aux_size: u64,
    pub aux_extensions: Vec<String>,
    pub vbf: bool,
    pub stack_max: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            navigation_shape: None,
            lineskip: 0,
            chunks: DEFAULT_CHUNKS,
            zzip: false,
            zstore: false,
            overwrite: false,
            min_mib_size: MIN_MIB_FILESIZE_MB,
            max_aux_size: MAX_AUX_FILESIZE_MB,
            aux_extensions: SUPPORTED_AUX_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            vbf: false,
            stack_max: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Directory store `<stem>.zspy`.
    Plain,
    /// Directory store zipped by the external archiver into `<stem>-zip.zspy`.
    ZipArchive,
    /// Zip-backed store written as `<stem>-zstore.zspy`.
    ZipStore,
}

impl OutputMode {
    pub fn select(zzip: bool, zstore: bool) -> Result<Self, ConvertError> {
        match (zzip, zstore) {
            (true, true) => Err(ConvertError::ConflictingOutputModes),
            (true, false) => Ok(OutputMode::ZipArchive),
            (false, true) => Ok(OutputMode::ZipStore),
            (false, false) => Ok(OutputMode::Plain),
        }
    }

    fn stem_suffix(self) -> Option<&'static str> {
        match self {
            OutputMode::Plain => None,
            OutputMode::ZipArchive => Some("-zip"),
            OutputMode::ZipStore => Some("-zstore"),
        }
    }
}

/// Output locations for one raw file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    /// Directory store `<stem>.zspy` next to the raw file.
    pub container: PathBuf,
    /// Single-file form for the zip modes.
    pub archive: Option<PathBuf>,
    /// Single-file forms written by the other modes.
    pub stale: Vec<PathBuf>,
}

impl Destinations {
    pub fn for_raw_file(raw: &Path, mode: OutputMode) -> Self {
        let stem = raw
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let container = raw.with_file_name(format!("{}.{}", stem, OUTPUT_EXTENSION));
        let archive_for = |m: OutputMode| {
            m.stem_suffix()
                .map(|suffix| raw.with_file_name(format!("{}{}.{}", stem, suffix, OUTPUT_EXTENSION)))
        };
        let stale = [OutputMode::ZipArchive, OutputMode::ZipStore]
            .into_iter()
            .filter(|&m| m != mode)
            .filter_map(archive_for)
            .collect();
        Self {
            container,
            archive: archive_for(mode),
            stale,
        }
    }

    /// The artifact left on disk after a successful conversion.
    pub fn final_output(&self) -> &Path {
        self.archive.as_deref().unwrap_or(&self.container)
    }

    /// Refuse to touch existing outputs unless overwriting.
    pub fn check(&self, overwrite: bool) -> Result<(), ConvertError> {
        if overwrite {
            return Ok(());
        }
        for path in std::iter::once(&self.container).chain(self.archive.iter()) {
            if path.exists() {
                return Err(ConvertError::DestinationExists { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// Settings used to convert one raw file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub navigation_shape: Option<Vec<usize>>,
    pub lineskip: usize,
    /// One entry per navigation axis followed by two signal entries.
    pub chunks: Vec<u64>,
    pub output_mode: OutputMode,
    pub overwrite: bool,
    pub max_aux_size: u64,
    pub aux_extensions: Vec<String>,
    pub vbf: bool,
    pub stack_max: bool,
}

impl ConversionRequest {
    /// Sidecar values take precedence over the caller's.
    pub fn resolve(
        options: &ConvertOptions,
        sidecar: &SidecarParameters,
    ) -> Result<Self, ConvertError> {
        let output_mode = OutputMode::select(options.zzip, options.zstore)?;
        let navigation_shape = sidecar
            .navigation_shape()
            .or_else(|| options.navigation_shape.clone());
        let lineskip = sidecar.lineskip().unwrap_or(options.lineskip);
        let chunks = expand_chunks(options.chunks, navigation_shape.as_deref())?;
        Ok(Self {
            navigation_shape,
            lineskip,
            chunks,
            output_mode,
            overwrite: options.overwrite,
            max_aux_size: options.max_aux_size,
            aux_extensions: options.aux_extensions.clone(),
            vbf: options.vbf,
            stack_max: options.stack_max,
        })
    }

    /// Navigation shape handed to the loader. With line skipping the first
    /// axis is widened so the skipped frames are read too.
    pub fn load_navigation_shape(&self) -> Option<Vec<usize>> {
        let mut shape = self.navigation_shape.clone()?;
        if self.lineskip > 0 {
            shape[0] += self.lineskip;
        }
        Some(shape)
    }
}

/// `(nav, sig)` -> one `nav` per navigation axis (two if unknown) and two `sig`.
pub fn expand_chunks(
    chunks: (u64, u64),
    navigation_shape: Option<&[usize]>,
) -> Result<Vec<u64>, ConvertError> {
    let (nav, sig) = chunks;
    if nav == 0 || sig == 0 {
        return Err(ConvertError::InvalidChunks { nav, sig });
    }
    let nav_dims = navigation_shape.map_or(2, <[usize]>::len);
    Ok(std::iter::repeat(nav)
        .take(nav_dims)
        .chain(std::iter::repeat(sig).take(2))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sidecar(value: serde_json::Value) -> SidecarParameters {
        match value {
            serde_json::Value::Object(map) => SidecarParameters::new(map),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn output_modes_are_exclusive() {
        assert_eq!(OutputMode::select(false, false).unwrap(), OutputMode::Plain);
        assert_eq!(OutputMode::select(true, false).unwrap(), OutputMode::ZipArchive);
        assert_eq!(OutputMode::select(false, true).unwrap(), OutputMode::ZipStore);
        let err = OutputMode::select(true, true).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn destinations_per_mode() {
        let raw = Path::new("/data/run1.mib");
        let plain = Destinations::for_raw_file(raw, OutputMode::Plain);
        assert_eq!(plain.container, Path::new("/data/run1.zspy"));
        assert_eq!(plain.final_output(), Path::new("/data/run1.zspy"));
        assert_eq!(
            plain.stale,
            vec![PathBuf::from("/data/run1-zip.zspy"), PathBuf::from("/data/run1-zstore.zspy")]
        );

        let zip = Destinations::for_raw_file(raw, OutputMode::ZipArchive);
        assert_eq!(zip.final_output(), Path::new("/data/run1-zip.zspy"));
        assert_eq!(zip.stale, vec![PathBuf::from("/data/run1-zstore.zspy")]);

        let zstore = Destinations::for_raw_file(raw, OutputMode::ZipStore);
        assert_eq!(zstore.container, Path::new("/data/run1.zspy"));
        assert_eq!(zstore.final_output(), Path::new("/data/run1-zstore.zspy"));
    }

    #[test]
    fn existing_destinations_block_unless_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("run1.mib");
        let dest = Destinations::for_raw_file(&raw, OutputMode::ZipArchive);
        assert!(dest.check(false).is_ok());

        std::fs::write(dir.path().join("run1-zip.zspy"), b"PK").unwrap();
        match dest.check(false) {
            Err(ConvertError::DestinationExists { path }) => {
                assert_eq!(path, dir.path().join("run1-zip.zspy"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(dest.check(true).is_ok());

        std::fs::create_dir(dir.path().join("run1.zspy")).unwrap();
        let plain = Destinations::for_raw_file(&raw, OutputMode::Plain);
        assert!(plain.check(false).is_err());
    }

    #[test]
    fn sidecar_overrides_caller() {
        let options = ConvertOptions {
            navigation_shape: Some(vec![8, 8]),
            lineskip: 1,
            ..Default::default()
        };
        let r = ConversionRequest::resolve(
            &options,
            &sidecar(json!({"navigation_shape": [4, 4], "lineskip": "0"})),
        )
        .unwrap();
        assert_eq!(r.navigation_shape, Some(vec![4, 4]));
        assert_eq!(r.lineskip, 0);

        let r = ConversionRequest::resolve(&options, &SidecarParameters::default()).unwrap();
        assert_eq!(r.navigation_shape, Some(vec![8, 8]));
        assert_eq!(r.lineskip, 1);
    }

    #[test]
    fn chunk_expansion() {
        assert_eq!(expand_chunks((32, 256), Some(&[10, 5])).unwrap(), vec![32, 32, 256, 256]);
        assert_eq!(expand_chunks((32, 256), None).unwrap(), vec![32, 32, 256, 256]);
        assert_eq!(expand_chunks((16, 64), Some(&[100])).unwrap(), vec![16, 64, 64]);
        assert!(expand_chunks((0, 256), None).unwrap_err().is_configuration());
    }

    #[test]
    fn line_skip_widens_first_axis_for_loading() {
        let options = ConvertOptions {
            navigation_shape: Some(vec![10, 5]),
            lineskip: 2,
            ..Default::default()
        };
        let r = ConversionRequest::resolve(&options, &SidecarParameters::default()).unwrap();
        assert_eq!(r.load_navigation_shape(), Some(vec![12, 5]));
        assert_eq!(r.navigation_shape, Some(vec![10, 5]));

        let unknown = ConversionRequest::resolve(
            &ConvertOptions {
                lineskip: 2,
                ..Default::default()
            },
            &SidecarParameters::default(),
        )
        .unwrap();
        assert_eq!(unknown.load_navigation_shape(), None);
    }

    #[test]
    fn conflicting_modes_fail_resolution() {
        let options = ConvertOptions {
            zzip: true,
            zstore: true,
            ..Default::default()
        };
        assert!(matches!(
            ConversionRequest::resolve(&options, &SidecarParameters::default()),
            Err(ConvertError::ConflictingOutputModes)
        ));
    }
}

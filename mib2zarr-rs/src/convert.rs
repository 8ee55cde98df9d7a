use clap::Args;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{write_zip_store, Archiver, SevenZip};
use crate::auxiliary::collect_auxiliary;
use crate::config::{Config, ConversionConfig, OutputModeSetting, DEFAULT_ARCHIVER};
use crate::discovery::{find_mib_files, is_raw_file, RawFileHandle};
use crate::error::ConvertError;
use crate::loader::{FileLoader, SignalLoader};
use crate::params::{expand_chunks, ConversionRequest, ConvertOptions, Destinations, OutputMode};
use crate::preview::write_previews;
use crate::sidecar::{load_sidecar, ExperimentalParameters, SidecarParameters, StepSizes};
use crate::signal::{LazySignal, Metadata};
use crate::zarr;

#[derive(Args, Clone, Debug)]
pub struct ConvertArgs {
    /// MIB file, directory to search recursively, or glob pattern
    pub path: PathBuf,

    /// Scan shape, fast axis first. Overridden by the sidecar JSON
    #[arg(long = "navigation_shape", num_args = 2, value_names = ["X", "Y"])]
    pub navigation_shape: Option<Vec<usize>>,

    /// Frames to drop at the end of every scan line. Overridden by the sidecar JSON
    #[arg(long, default_value_t = 0)]
    pub lineskip: usize,

    /// Chunk size along navigation and signal axes
    #[arg(long, num_args = 2, value_names = ["NAV", "SIG"])]
    pub chunks: Option<Vec<u64>>,

    /// Zip the finished store with the external archiver into <stem>-zip.zspy
    #[arg(short = 'z', long, conflicts_with = "zstore")]
    pub zzip: bool,

    /// Write a zip-backed store <stem>-zstore.zspy
    #[arg(short = 's', long)]
    pub zstore: bool,

    /// Save a virtual bright field image next to the raw file
    #[arg(long)]
    pub vbf: bool,

    /// Save the maximum through-stack image next to the raw file
    #[arg(long = "stackmax")]
    pub stack_max: bool,

    /// Replace existing outputs
    #[arg(short = 'o', long)]
    pub overwrite: bool,

    /// Minimum size in MB of MIB files picked up from directories
    #[arg(long = "mib_size", value_name = "MB")]
    pub mib_size: Option<u64>,

    /// Auxiliary files must be smaller than this many MB
    #[arg(long = "max_aux_size", value_name = "MB")]
    pub max_aux_size: Option<u64>,

    /// TOML file with default settings
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Zip archiver command used with --zzip
    #[arg(long, value_name = "PROGRAM")]
    pub archiver: Option<String>,
}

impl ConvertArgs {
    /// Command line values win over the config file, which wins over defaults.
    pub fn to_options(&self, config: &ConversionConfig) -> ConvertOptions {
        let defaults = ConvertOptions::default();
        let chunks = match self.chunks.as_deref() {
            Some([nav, sig]) => (*nav, *sig),
            _ => config
                .chunks
                .map(|[nav, sig]| (nav, sig))
                .unwrap_or(defaults.chunks),
        };
        let (zzip, zstore) = if self.zzip || self.zstore {
            (self.zzip, self.zstore)
        } else {
            match config.output_mode {
                Some(OutputModeSetting::Zip) => (true, false),
                Some(OutputModeSetting::Zstore) => (false, true),
                Some(OutputModeSetting::Plain) | None => (false, false),
            }
        };
        ConvertOptions {
            navigation_shape: self.navigation_shape.clone(),
            lineskip: self.lineskip,
            chunks,
            zzip,
            zstore,
            overwrite: self.overwrite || config.overwrite.unwrap_or(defaults.overwrite),
            min_mib_size: self
                .mib_size
                .or(config.min_mib_size)
                .unwrap_or(defaults.min_mib_size),
            max_aux_size: self
                .max_aux_size
                .or(config.max_aux_size)
                .unwrap_or(defaults.max_aux_size),
            aux_extensions: config
                .aux_extensions
                .clone()
                .unwrap_or(defaults.aux_extensions),
            vbf: self.vbf || config.vbf.unwrap_or(defaults.vbf),
            stack_max: self.stack_max || config.stack_max.unwrap_or(defaults.stack_max),
        }
    }

    pub fn archiver_program(&self, config: &ConversionConfig) -> String {
        self.archiver
            .clone()
            .or_else(|| config.archiver.clone())
            .unwrap_or_else(|| DEFAULT_ARCHIVER.to_string())
    }
}

pub fn run(
    args: ConvertArgs,
    progress: impl Fn(f64, &str),
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let options = args.to_options(&config.conversion);
    let archiver = SevenZip::new(args.archiver_program(&config.conversion));
    debug!("{:?}", options);

    let outputs = convert_path(&args.path, &options, &FileLoader, &archiver, progress)?;
    for output in &outputs {
        info!("Wrote {}", output.display());
    }
    Ok(())
}

/// Convert every MIB file selected by `root`.
///
/// A literal file path propagates its error. Files found by walking a
/// directory or expanding a glob are converted independently: a failure is
/// logged and the batch moves on.
pub fn convert_path(
    root: &Path,
    options: &ConvertOptions,
    loader: &dyn SignalLoader,
    archiver: &dyn Archiver,
    progress: impl Fn(f64, &str),
) -> Result<Vec<PathBuf>, ConvertError> {
    OutputMode::select(options.zzip, options.zstore)?;
    expand_chunks(options.chunks, None)?;

    let literal = root.is_file() && is_raw_file(root);
    let files = find_mib_files(root, options.min_mib_size)?;
    if files.is_empty() {
        warn!("No MIB files found at {}", root.display());
        return Ok(Vec::new());
    }
    info!("Found {} MIB file(s) to convert", files.len());

    let total = files.len();
    let mut outputs = Vec::new();
    for (i, raw) in files.iter().enumerate() {
        progress(
            i as f64 / total as f64,
            &format!("Converting {}/{}: {}", i + 1, total, raw.path.display()),
        );
        match convert_file(raw, options, loader, archiver) {
            Ok(paths) => outputs.extend(paths),
            Err(e) if literal => return Err(e),
            Err(e) if e.is_configuration() => warn!("{}: {}", raw.path.display(), e),
            Err(e) => error!("Failed to convert {}: {}", raw.path.display(), e.report()),
        }
    }
    progress(
        1.0,
        &format!("Converted {}/{} file(s)", outputs.len(), total),
    );
    Ok(outputs)
}

/// Convert one raw file, returning the path of the artifact left on disk.
pub fn convert_file(
    raw: &RawFileHandle,
    options: &ConvertOptions,
    loader: &dyn SignalLoader,
    archiver: &dyn Archiver,
) -> Result<Vec<PathBuf>, ConvertError> {
    let mode = OutputMode::select(options.zzip, options.zstore)?;
    let sidecar = load_sidecar(&raw.path.with_extension("json"));
    if sidecar.is_empty() {
        debug!("No sidecar parameters for {}", raw.path.display());
    }
    let request = ConversionRequest::resolve(options, &sidecar)?;
    let destinations = Destinations::for_raw_file(&raw.path, mode);
    destinations.check(request.overwrite)?;

    info!("Converting {} ({:.0} MB)", raw.path.display(), raw.size_mb());
    match &request.navigation_shape {
        Some(shape) => info!("  navigation shape: {:?}", shape),
        None => info!("  navigation shape: from frame count"),
    }
    info!("  lineskip: {}", request.lineskip);
    info!("  chunks: {:?}", request.chunks);
    info!("  output: {}", destinations.final_output().display());

    let mut signal = loader.load_lazy(
        &raw.path,
        request.load_navigation_shape().as_deref(),
        &request.chunks,
    )?;
    signal
        .skip_line_frames(request.lineskip)
        .map_err(|e| ConvertError::InvalidShape {
            path: raw.path.clone(),
            reason: e.to_string(),
        })?;

    for preview in write_previews(&signal, &raw.path, request.vbf, request.stack_max)? {
        info!("Saved {}", preview.display());
    }

    signal.metadata = build_metadata(raw, &sidecar, &request, loader);
    if !signal.metadata.experimental.is_empty() {
        info!("  experimental parameters: {:?}", signal.metadata.experimental);
    }
    let output = save(&signal, &destinations, mode, request.overwrite, archiver)?;
    info!("Finished {}", output.display());
    Ok(vec![output])
}

fn build_metadata(
    raw: &RawFileHandle,
    sidecar: &SidecarParameters,
    request: &ConversionRequest,
    loader: &dyn SignalLoader,
) -> Metadata {
    let mut original_metadata = Map::new();
    original_metadata.insert("Parameters".into(), Value::Object(sidecar.as_map().clone()));
    Metadata {
        title: sidecar.sample().unwrap_or_else(|| raw.stem()),
        original_filename: raw
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        experimental: ExperimentalParameters::from_sidecar(sidecar),
        step_sizes: StepSizes::from_sidecar(sidecar),
        original_metadata,
        auxiliary: collect_auxiliary(
            &raw.directory(),
            request.max_aux_size,
            &request.aux_extensions,
            loader,
        ),
    }
}

fn save(
    signal: &LazySignal,
    destinations: &Destinations,
    mode: OutputMode,
    overwrite: bool,
    archiver: &dyn Archiver,
) -> Result<PathBuf, ConvertError> {
    let output = destinations.final_output();
    match mode {
        OutputMode::Plain => {
            zarr::save_zspy(signal, &destinations.container, overwrite)?;
        }
        OutputMode::ZipStore => {
            remove_stale(output)?;
            remove_stale(&destinations.container)?;
            write_zip_store(output, |store| zarr::save_zspy(signal, store, false))?;
        }
        OutputMode::ZipArchive => {
            zarr::save_zspy(signal, &destinations.container, overwrite)?;
            remove_stale(output)?;
            info!("Zipping {}", destinations.container.display());
            archiver.archive(&destinations.container, output)?;
            debug!("Removing {}", destinations.container.display());
            fs::remove_dir_all(&destinations.container)?;
        }
    }
    if overwrite {
        for path in &destinations.stale {
            remove_stale(path)?;
        }
    }
    Ok(output.to_path_buf())
}

fn remove_stale(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        debug!("Removing old {}", path.display());
        zarr::remove_path(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mib::write_test_mib;
    use crate::zarr::{group_attributes, open_array, open_store, read_chunk_u16, DATA_ARRAY, SIGNAL_GROUP};
    use image::{GrayImage, ImageBuffer, Luma};
    use serde_json::json;
    use std::cell::RefCell;
    use std::fs::File;

    /// 2048 frames of 8x8 U16 with 384 byte headers, just over 1 MB.
    const PADDED_BYTES: u64 = 2048 * 512;

    /// Loader that records the navigation shapes it was asked for.
    #[derive(Default)]
    struct RecordingLoader {
        shapes: RefCell<Vec<Option<Vec<usize>>>>,
    }

    impl SignalLoader for RecordingLoader {
        fn load_lazy(
            &self,
            path: &Path,
            navigation_shape: Option<&[usize]>,
            chunks: &[u64],
        ) -> Result<LazySignal, ConvertError> {
            self.shapes.borrow_mut().push(navigation_shape.map(<[usize]>::to_vec));
            FileLoader.load_lazy(path, navigation_shape, chunks)
        }

        fn load(&self, path: &Path) -> Result<crate::signal::Signal, ConvertError> {
            FileLoader.load(path)
        }
    }

    /// Archiver that writes a marker file instead of zipping.
    #[derive(Default)]
    struct FakeArchiver {
        fail: bool,
        calls: RefCell<Vec<(PathBuf, PathBuf)>>,
    }

    impl Archiver for FakeArchiver {
        fn archive(&self, source: &Path, destination: &Path) -> Result<(), ConvertError> {
            self.calls
                .borrow_mut()
                .push((source.to_path_buf(), destination.to_path_buf()));
            assert!(source.join("zarr.json").is_file());
            // 7z adds to an existing archive instead of replacing it.
            assert!(!destination.exists());
            if self.fail {
                return Err(ConvertError::Archiver {
                    program: "fake".into(),
                    status: failed_status(),
                    source_path: source.to_path_buf(),
                });
            }
            fs::write(destination, b"PK")?;
            Ok(())
        }
    }

    #[cfg(unix)]
    fn failed_status() -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(2 << 8)
    }

    #[cfg(windows)]
    fn failed_status() -> std::process::ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(2)
    }

    /// A MIB file padded with blank frames past the 1 MB discovery threshold.
    fn raw_file(path: &Path, frames: usize) -> RawFileHandle {
        write_test_mib(path, frames, 8, 8, "U16", |i| i as u32);
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(PADDED_BYTES).unwrap();
        RawFileHandle {
            path: path.to_path_buf(),
            size_bytes: PADDED_BYTES,
        }
    }

    fn sidecar(raw: &Path, value: Value) {
        fs::write(raw.with_extension("json"), value.to_string()).unwrap();
    }

    fn options() -> ConvertOptions {
        ConvertOptions {
            min_mib_size: 1,
            max_aux_size: 1,
            ..Default::default()
        }
    }

    fn no_progress(_: f64, _: &str) {}

    #[test]
    fn directory_run_converts_large_files_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("session");
        fs::create_dir(&session).unwrap();
        let run1 = session.join("run1.mib");
        raw_file(&run1, 16);
        sidecar(
            &run1,
            json!({
                "sample": "Au",
                "navigation_shape": [4, 4],
                "beam_energy": 200,
                "cameralength": 21,
                "dx": 1.5,
                "operator": "someone"
            }),
        );
        let calib: GrayImage = ImageBuffer::from_pixel(16, 16, Luma([40u8]));
        calib.save(session.join("calib.png")).unwrap();
        // Below the discovery threshold, but small enough to be auxiliary data.
        write_test_mib(&session.join("dark.mib"), 4, 8, 8, "U16", |_| 1);

        let archiver = FakeArchiver::default();
        let outputs = convert_path(dir.path(), &options(), &FileLoader, &archiver, no_progress).unwrap();
        assert_eq!(outputs, vec![session.join("run1.zspy")]);
        assert!(archiver.calls.borrow().is_empty());
        assert!(!session.join("dark.zspy").exists());

        let out = &outputs[0];
        let store = open_store(out).unwrap();
        assert_eq!(open_array(&store, DATA_ARRAY).unwrap().shape(), &[4, 4, 8, 8]);

        let attrs = group_attributes(out, SIGNAL_GROUP);
        let meta = &attrs["metadata"];
        assert_eq!(meta["General"]["title"], "Au");
        assert_eq!(meta["General"]["original_filename"], "run1.mib");
        assert_eq!(meta["Acquisition_instrument"]["TEM"]["beam_energy"], 200.0);
        assert_eq!(
            meta["Acquisition_instrument"]["TEM"]["Detector"]["Diffraction"]["camera_length"],
            21.0
        );
        assert!(meta["Acquisition_instrument"]["TEM"].get("operator").is_none());
        let aux: Vec<&String> = meta["Auxiliary_data"].as_object().unwrap().keys().collect();
        assert_eq!(aux, vec!["calib.png", "dark.mib"]);
        assert_eq!(attrs["original_metadata"]["Parameters"]["operator"], "someone");
        assert_eq!(attrs["axes"][0]["scale"], 1.5);
        assert_eq!(attrs["axes"][1]["scale"], 1.5);
    }

    #[test]
    fn title_falls_back_to_stem() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("scan_07.mib"), 4);
        let outputs = convert_file(&raw, &options(), &FileLoader, &FakeArchiver::default()).unwrap();
        let attrs = group_attributes(&outputs[0], SIGNAL_GROUP);
        assert_eq!(attrs["metadata"]["General"]["title"], "scan_07");
        assert_eq!(attrs["original_metadata"]["Parameters"], json!({}));
    }

    #[test]
    fn line_skip_loads_wide_lines_and_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 60);
        sidecar(&raw.path, json!({"navigation_shape": [10, 5], "lineskip": 2}));

        let loader = RecordingLoader::default();
        let outputs = convert_file(&raw, &options(), &loader, &FakeArchiver::default()).unwrap();
        assert_eq!(*loader.shapes.borrow(), vec![Some(vec![12, 5])]);

        let store = open_store(&outputs[0]).unwrap();
        let array = open_array(&store, DATA_ARRAY).unwrap();
        assert_eq!(array.shape(), &[5, 10, 8, 8]);
        let chunk = read_chunk_u16(&array, &[0, 0, 0, 0]).unwrap();
        // Second scan line starts at frame 12.
        assert_eq!(chunk[10 * 64], 12);
        assert_eq!(chunk[9 * 64], 9);
    }

    #[test]
    fn oversized_line_skip_is_a_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        let opts = ConvertOptions {
            lineskip: 5000,
            ..options()
        };
        // The inferred 2048 frame stack is shorter than the skip.
        let err = convert_file(&raw, &opts, &FileLoader, &FakeArchiver::default()).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidShape { .. }));
        assert!(!dir.path().join("run1.zspy").exists());
    }

    #[test]
    fn existing_output_is_kept_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        let archiver = FakeArchiver::default();
        convert_file(&raw, &options(), &FileLoader, &archiver).unwrap();
        let marker = dir.path().join("run1.zspy").join("zarr.json");
        let before = fs::read_to_string(&marker).unwrap();

        let err = convert_file(&raw, &options(), &FileLoader, &archiver).unwrap_err();
        assert!(matches!(err, ConvertError::DestinationExists { .. }));
        assert_eq!(fs::read_to_string(&marker).unwrap(), before);

        let again = ConvertOptions {
            overwrite: true,
            ..options()
        };
        assert!(convert_file(&raw, &again, &FileLoader, &archiver).is_ok());
    }

    #[test]
    fn conflicting_modes_fail_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        raw_file(&dir.path().join("run1.mib"), 4);
        let opts = ConvertOptions {
            zzip: true,
            zstore: true,
            ..options()
        };
        let loader = RecordingLoader::default();
        let err = convert_path(dir.path(), &opts, &loader, &FakeArchiver::default(), no_progress)
            .unwrap_err();
        assert!(matches!(err, ConvertError::ConflictingOutputModes));
        assert!(loader.shapes.borrow().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn zip_mode_leaves_only_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        let opts = ConvertOptions {
            zzip: true,
            ..options()
        };
        let archiver = FakeArchiver::default();
        let outputs = convert_file(&raw, &opts, &FileLoader, &archiver).unwrap();
        assert_eq!(outputs, vec![dir.path().join("run1-zip.zspy")]);
        assert_eq!(
            *archiver.calls.borrow(),
            vec![(dir.path().join("run1.zspy"), dir.path().join("run1-zip.zspy"))]
        );
        assert!(outputs[0].is_file());
        assert!(!dir.path().join("run1.zspy").exists());
    }

    #[test]
    fn zip_overwrite_replaces_the_old_archive() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        let archive = dir.path().join("run1-zip.zspy");
        fs::write(&archive, b"old").unwrap();
        let opts = ConvertOptions {
            zzip: true,
            overwrite: true,
            ..options()
        };
        let archiver = FakeArchiver::default();
        let outputs = convert_file(&raw, &opts, &FileLoader, &archiver).unwrap();
        assert_eq!(outputs, vec![archive.clone()]);
        assert_eq!(archiver.calls.borrow().len(), 1);
        assert_eq!(fs::read(&archive).unwrap(), b"PK");
        assert!(!dir.path().join("run1.zspy").exists());
    }

    #[test]
    fn plain_overwrite_removes_archived_forms() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        fs::write(dir.path().join("run1-zip.zspy"), b"PK").unwrap();
        fs::write(dir.path().join("run1-zstore.zspy"), b"PK").unwrap();

        // Without overwrite the archived forms are left alone.
        convert_file(&raw, &options(), &FileLoader, &FakeArchiver::default()).unwrap();
        assert!(dir.path().join("run1-zip.zspy").exists());

        let opts = ConvertOptions {
            overwrite: true,
            ..options()
        };
        let outputs = convert_file(&raw, &opts, &FileLoader, &FakeArchiver::default()).unwrap();
        assert_eq!(outputs, vec![dir.path().join("run1.zspy")]);
        assert!(!dir.path().join("run1-zip.zspy").exists());
        assert!(!dir.path().join("run1-zstore.zspy").exists());
    }

    #[test]
    fn failed_archiver_keeps_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        let opts = ConvertOptions {
            zzip: true,
            ..options()
        };
        let archiver = FakeArchiver {
            fail: true,
            ..Default::default()
        };
        let err = convert_file(&raw, &opts, &FileLoader, &archiver).unwrap_err();
        assert!(matches!(err, ConvertError::Archiver { .. }));
        assert!(dir.path().join("run1.zspy").join("zarr.json").is_file());
        assert!(!dir.path().join("run1-zip.zspy").exists());
    }

    #[test]
    fn zstore_mode_writes_zip_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        // Leftover plain store from an earlier run is replaced.
        fs::create_dir(dir.path().join("run1.zspy")).unwrap();
        let opts = ConvertOptions {
            zstore: true,
            overwrite: true,
            ..options()
        };
        let outputs = convert_file(&raw, &opts, &FileLoader, &FakeArchiver::default()).unwrap();
        assert_eq!(outputs, vec![dir.path().join("run1-zstore.zspy")]);
        assert!(!dir.path().join("run1.zspy").exists());

        let mut archive = zip::ZipArchive::new(File::open(&outputs[0]).unwrap()).unwrap();
        assert!(archive.by_name("zarr.json").is_ok());
        assert!(archive.by_name("Experiments/signal/data/zarr.json").is_ok());
    }

    #[test]
    fn previews_are_written_beside_the_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        let opts = ConvertOptions {
            vbf: true,
            stack_max: true,
            ..options()
        };
        convert_file(&raw, &opts, &FileLoader, &FakeArchiver::default()).unwrap();
        assert!(dir.path().join("run1_vbf.png").is_file());
        assert!(dir.path().join("run1_max.png").is_file());
    }

    #[test]
    fn batch_failures_are_isolated_but_literal_files_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("a_bad.mib");
        fs::write(&bad, b"not a detector file").unwrap();
        File::options().write(true).open(&bad).unwrap().set_len(PADDED_BYTES).unwrap();
        raw_file(&dir.path().join("b_good.mib"), 4);

        let outputs =
            convert_path(dir.path(), &options(), &FileLoader, &FakeArchiver::default(), no_progress)
                .unwrap();
        assert_eq!(outputs, vec![dir.path().join("b_good.zspy")]);

        assert!(convert_path(&bad, &options(), &FileLoader, &FakeArchiver::default(), no_progress).is_err());
    }

    #[test]
    fn corrupt_header_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir.path().join("a_corrupt.mib");
        let mut header = b"MQ1,000001,0,01,0,0,U16,1x1".to_vec();
        header.resize(PADDED_BYTES as usize, 0);
        fs::write(&corrupt, header).unwrap();
        raw_file(&dir.path().join("b_good.mib"), 4);

        let outputs =
            convert_path(dir.path(), &options(), &FileLoader, &FakeArchiver::default(), no_progress)
                .unwrap();
        assert_eq!(outputs, vec![dir.path().join("b_good.zspy")]);
        assert!(!dir.path().join("a_corrupt.zspy").exists());
    }

    #[test]
    fn reserved_auxiliary_names_do_not_fail_the_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_file(&dir.path().join("run1.mib"), 4);
        let image: GrayImage = ImageBuffer::from_pixel(4, 4, Luma([9u8]));
        image.save(dir.path().join("__overview.png")).unwrap();
        image.save(dir.path().join("calib.png")).unwrap();

        let outputs = convert_file(&raw, &options(), &FileLoader, &FakeArchiver::default()).unwrap();
        let attrs = group_attributes(&outputs[0], SIGNAL_GROUP);
        let aux: Vec<&String> = attrs["metadata"]["Auxiliary_data"].as_object().unwrap().keys().collect();
        assert_eq!(aux, vec!["calib.png"]);
    }

    #[test]
    fn bracketed_directories_are_searched_literally() {
        let dir = tempfile::tempdir().unwrap();
        let session = dir.path().join("session[1]");
        fs::create_dir(&session).unwrap();
        raw_file(&session.join("run1.mib"), 4);

        let outputs =
            convert_path(&session, &options(), &FileLoader, &FakeArchiver::default(), no_progress)
                .unwrap();
        assert_eq!(outputs, vec![session.join("run1.zspy")]);
    }

    #[test]
    fn glob_selects_matching_runs() {
        let dir = tempfile::tempdir().unwrap();
        raw_file(&dir.path().join("run1.mib"), 4);
        raw_file(&dir.path().join("other.mib"), 4);
        let messages = RefCell::new(Vec::new());
        let outputs = convert_path(
            &dir.path().join("run*.mib"),
            &options(),
            &FileLoader,
            &FakeArchiver::default(),
            |fraction, message| messages.borrow_mut().push((fraction, message.to_string())),
        )
        .unwrap();
        assert_eq!(outputs, vec![dir.path().join("run1.zspy")]);
        let messages = messages.borrow();
        assert_eq!(messages.first().map(|m| m.0), Some(0.0));
        assert_eq!(messages.last().map(|m| m.0), Some(1.0));
    }

    #[test]
    fn command_line_wins_over_config_file() {
        let config = Config::from_str(
            r#"
            [conversion]
            min_mib_size = 50
            chunks = [16, 128]
            output_mode = "zstore"
            archiver = "/opt/7zz"
            vbf = true
            "#,
        )
        .unwrap()
        .conversion;

        let args = ConvertArgs {
            path: PathBuf::from("data"),
            navigation_shape: None,
            lineskip: 0,
            chunks: Some(vec![8, 64]),
            zzip: true,
            zstore: false,
            vbf: false,
            stack_max: false,
            overwrite: false,
            mib_size: None,
            max_aux_size: Some(20),
            config: None,
            archiver: None,
        };
        let opts = args.to_options(&config);
        assert_eq!(opts.chunks, (8, 64));
        assert_eq!((opts.zzip, opts.zstore), (true, false));
        assert_eq!(opts.min_mib_size, 50);
        assert_eq!(opts.max_aux_size, 20);
        assert!(opts.vbf);
        assert_eq!(args.archiver_program(&config), "/opt/7zz");

        let bare = ConvertArgs {
            chunks: None,
            zzip: false,
            ..args
        };
        let opts = bare.to_options(&ConversionConfig::default());
        assert_eq!(opts, ConvertOptions {
            max_aux_size: 20,
            ..Default::default()
        });
        assert_eq!(bare.archiver_program(&ConversionConfig::default()), "7z");
    }
}

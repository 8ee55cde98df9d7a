use anyhow::{bail, Result};
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use zarrs::array::{data_type, Array, ArrayBuilder};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::auxiliary::AuxiliaryDataSet;
use crate::signal::{LazySignal, PixelType, Pixels, Signal};

pub type Store = Arc<FilesystemStore>;

/// Type alias for arrays in the store.
pub type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

pub const EXPERIMENTS_GROUP: &str = "/Experiments";
pub const SIGNAL_GROUP: &str = "/Experiments/signal";
pub const DATA_ARRAY: &str = "/Experiments/signal/data";
pub const AUXILIARY_GROUP: &str = "/Experiments/signal/auxiliary";

pub fn open_store(root: &Path) -> Result<Store> {
    let store = FilesystemStore::new(root)?;
    Ok(Arc::new(store))
}

pub fn create_group(store: &Store, path: &str, attrs: Option<Map<String, Value>>) -> Result<()> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let mut builder = GroupBuilder::new();
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let group = builder.build(store_trait, path)?;
    group.store_metadata()?;
    Ok(())
}

pub fn create_array(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    pixel_type: PixelType,
    attrs: Option<Map<String, Value>>,
) -> Result<StoreArray> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let mut builder = match pixel_type {
        PixelType::U8 => ArrayBuilder::new(shape, chunks, data_type::uint8(), 0u8),
        PixelType::U16 => ArrayBuilder::new(shape, chunks, data_type::uint16(), 0u16),
        PixelType::U32 => ArrayBuilder::new(shape, chunks, data_type::uint32(), 0u32),
    };
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store_trait, path)?;
    array.store_metadata()?;
    Ok(array)
}

pub fn store_chunk(array: &StoreArray, chunk_indices: &[u64], data: &Pixels) -> Result<()> {
    match data {
        Pixels::U8(v) => array.store_chunk(chunk_indices, v.as_slice())?,
        Pixels::U16(v) => array.store_chunk(chunk_indices, v.as_slice())?,
        Pixels::U32(v) => array.store_chunk(chunk_indices, v.as_slice())?,
    }
    Ok(())
}

/// Save `signal` as a zspy directory store at `destination`.
///
/// Layout:
/// - `/` file format attributes
/// - `/Experiments/signal` metadata, original metadata and axes
/// - `/Experiments/signal/data` the frames, chunked as the signal is
/// - `/Experiments/signal/auxiliary/<name>` one array per auxiliary file
///
/// A store that fails half way is removed again.
pub fn save_zspy(signal: &LazySignal, destination: &Path, overwrite: bool) -> Result<()> {
    if destination.exists() {
        if !overwrite {
            bail!("{} already exists", destination.display());
        }
        debug!("Removing old {}", destination.display());
        remove_path(destination)?;
    }
    fs::create_dir_all(destination)?;
    let result = write_zspy(signal, destination);
    if result.is_err() {
        debug!("Removing partial {}", destination.display());
        if let Err(e) = remove_path(destination) {
            warn!("Could not remove {}: {}", destination.display(), e);
        }
    }
    result
}

fn write_zspy(signal: &LazySignal, destination: &Path) -> Result<()> {
    let store = open_store(destination)?;

    let root_attrs = json!({
        "file_format": "zspy",
        "writer": env!("CARGO_PKG_NAME"),
        "writer_version": env!("CARGO_PKG_VERSION"),
    });
    create_group(&store, "/", root_attrs.as_object().cloned())?;
    create_group(&store, EXPERIMENTS_GROUP, None)?;

    let skipped = write_auxiliary(&store, destination, &signal.metadata.auxiliary)?;
    let mut metadata = signal.metadata.to_json();
    let emptied = match metadata.get_mut("Auxiliary_data") {
        Some(Value::Object(aux)) => {
            aux.retain(|name, _| !skipped.contains(name));
            aux.is_empty()
        }
        _ => false,
    };
    if emptied {
        if let Some(root) = metadata.as_object_mut() {
            root.remove("Auxiliary_data");
        }
    }

    let signal_attrs = json!({
        "metadata": metadata,
        "original_metadata": Value::Object(signal.metadata.original_metadata.clone()),
        "axes": signal.axes(),
    });
    create_group(&store, SIGNAL_GROUP, signal_attrs.as_object().cloned())?;

    let axes = signal.axes();
    let axis_names: Vec<&str> = axes
        .iter()
        .take(signal.navigation_shape().len())
        .rev()
        .chain(axes.iter().skip(signal.navigation_shape().len()).rev())
        .map(|a| a.name.as_str())
        .collect();
    let data_attrs = json!({ "axis_names": axis_names });
    let array = create_array(
        &store,
        DATA_ARRAY,
        signal.array_shape(),
        signal.chunk_shape().to_vec(),
        signal.pixel_type(),
        data_attrs.as_object().cloned(),
    )?;
    write_frames(&array, signal)
}

/// Write one array per auxiliary signal, returning the names that could
/// not be stored.
fn write_auxiliary(
    store: &Store,
    destination: &Path,
    auxiliary: &AuxiliaryDataSet,
) -> Result<Vec<String>> {
    let mut skipped = Vec::new();
    if auxiliary.is_empty() {
        return Ok(skipped);
    }
    create_group(store, AUXILIARY_GROUP, None)?;
    for (name, aux) in auxiliary {
        let path = format!("{}/{}", AUXILIARY_GROUP, name);
        if let Err(e) = write_signal(store, &path, aux) {
            warn!("Skipping auxiliary array {}: {:#}", name, e);
            let partial = destination.join(path.trim_start_matches('/'));
            if partial.exists() {
                remove_path(&partial)?;
            }
            skipped.push(name.clone());
        }
    }
    Ok(skipped)
}

pub fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Store a fully loaded signal as a single-chunk array.
fn write_signal(store: &Store, path: &str, signal: &Signal) -> Result<()> {
    let shape: Vec<u64> = signal.shape.iter().map(|&n| n as u64).collect();
    let chunks: Vec<u64> = shape.iter().map(|&n| n.max(1)).collect();
    let attrs = json!({
        "title": signal.title,
        "navigation_dimension": signal.navigation_dims,
    });
    let array = create_array(
        store,
        path,
        shape,
        chunks,
        signal.pixels.pixel_type(),
        attrs.as_object().cloned(),
    )?;
    store_chunk(&array, &vec![0; signal.shape.len()], &signal.pixels)
}

/// C-order (last index fastest) walk over every index of `shape`.
fn c_order(shape: &[usize]) -> Vec<Vec<usize>> {
    let reversed: Vec<usize> = shape.iter().rev().copied().collect();
    crate::signal::positions(&reversed)
        .into_iter()
        .map(|mut p| {
            p.reverse();
            p
        })
        .collect()
}

/// Stream the frames of `signal` into `array`, one navigation chunk of
/// frames in memory at a time.
fn write_frames(array: &StoreArray, signal: &LazySignal) -> Result<()> {
    let shape = signal.array_shape();
    let chunks = signal.chunk_shape();
    let nav_dims = signal.navigation_shape().len();
    let (width, height) = signal.signal_shape();
    let pixel_type = signal.pixel_type();

    let nav_shape: Vec<usize> = shape[..nav_dims].iter().map(|&n| n as usize).collect();
    let nav_chunk: Vec<usize> = chunks[..nav_dims].iter().map(|&n| n as usize).collect();
    let (chunk_h, chunk_w) = (chunks[nav_dims] as usize, chunks[nav_dims + 1] as usize);

    let nav_grid: Vec<usize> = nav_shape
        .iter()
        .zip(&nav_chunk)
        .map(|(&n, &c)| n.div_ceil(c))
        .collect();
    let sig_grid = (height.div_ceil(chunk_h), width.div_ceil(chunk_w));
    let local_offsets = c_order(&nav_chunk);

    for nav_index in c_order(&nav_grid) {
        let mut frames: Vec<Option<Pixels>> = Vec::with_capacity(local_offsets.len());
        for local in &local_offsets {
            let global: Vec<usize> = nav_index
                .iter()
                .zip(&nav_chunk)
                .zip(local)
                .map(|((&i, &c), &l)| i * c + l)
                .collect();
            if global.iter().zip(&nav_shape).any(|(&g, &n)| g >= n) {
                frames.push(None);
                continue;
            }
            let position: Vec<usize> = global.into_iter().rev().collect();
            frames.push(Some(signal.frame_at(&position)?));
        }

        for sig_row in 0..sig_grid.0 {
            for sig_col in 0..sig_grid.1 {
                let window = Window {
                    width,
                    height,
                    row0: sig_row * chunk_h,
                    col0: sig_col * chunk_w,
                    rows: chunk_h,
                    cols: chunk_w,
                };
                let buffer = assemble_chunk(&frames, pixel_type, &window)?;
                let indices: Vec<u64> = nav_index
                    .iter()
                    .map(|&i| i as u64)
                    .chain([sig_row as u64, sig_col as u64])
                    .collect();
                store_chunk(array, &indices, &buffer)?;
            }
        }
    }
    Ok(())
}

/// Detector region covered by one signal chunk.
struct Window {
    width: usize,
    height: usize,
    row0: usize,
    col0: usize,
    rows: usize,
    cols: usize,
}

fn assemble_chunk(frames: &[Option<Pixels>], pixel_type: PixelType, w: &Window) -> Result<Pixels> {
    fn typed<'a, T>(
        frames: &'a [Option<Pixels>],
        pick: impl Fn(&'a Pixels) -> Option<&'a [T]>,
    ) -> Result<Vec<Option<&'a [T]>>> {
        frames
            .iter()
            .map(|f| match f {
                None => Ok(None),
                Some(p) => match pick(p) {
                    Some(v) => Ok(Some(v)),
                    None => bail!("frame pixel type {} differs from signal", p.pixel_type().name()),
                },
            })
            .collect()
    }

    Ok(match pixel_type {
        PixelType::U8 => Pixels::U8(copy_window(
            &typed(frames, |p| match p {
                Pixels::U8(v) => Some(v.as_slice()),
                _ => None,
            })?,
            w,
        )),
        PixelType::U16 => Pixels::U16(copy_window(
            &typed(frames, |p| match p {
                Pixels::U16(v) => Some(v.as_slice()),
                _ => None,
            })?,
            w,
        )),
        PixelType::U32 => Pixels::U32(copy_window(
            &typed(frames, |p| match p {
                Pixels::U32(v) => Some(v.as_slice()),
                _ => None,
            })?,
            w,
        )),
    })
}

/// Copy the window of every frame into a full (zero padded) chunk buffer.
fn copy_window<T: Copy + Default>(frames: &[Option<&[T]>], w: &Window) -> Vec<T> {
    let per_frame = w.rows * w.cols;
    let mut out = vec![T::default(); frames.len() * per_frame];
    let cols = w.cols.min(w.width.saturating_sub(w.col0));
    for (f, frame) in frames.iter().enumerate() {
        let Some(frame) = frame else { continue };
        for r in 0..w.rows {
            let row = w.row0 + r;
            if row >= w.height {
                break;
            }
            let src = row * w.width + w.col0;
            let dst = f * per_frame + r * w.cols;
            out[dst..dst + cols].copy_from_slice(&frame[src..src + cols]);
        }
    }
    out
}

#[cfg(test)]
pub(crate) fn open_array(store: &Store, path: &str) -> Result<StoreArray> {
    use zarrs::config::MetadataRetrieveVersion;
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let array = Array::open_opt(store_trait, path, &MetadataRetrieveVersion::V3)?;
    Ok(array)
}

#[cfg(test)]
pub(crate) fn read_chunk_u16(array: &StoreArray, chunk_indices: &[u64]) -> Result<Vec<u16>> {
    let data = array.retrieve_chunk::<Vec<u16>>(chunk_indices)?;
    Ok(data)
}

/// Attributes of the group at `path` inside a directory store.
#[cfg(test)]
pub(crate) fn group_attributes(root: &Path, path: &str) -> Value {
    let file = root.join(path.trim_start_matches('/')).join("zarr.json");
    let meta: Value = serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap();
    meta["attributes"].clone()
}

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::auxiliary::AuxiliaryDataSet;
use crate::sidecar::{ExperimentalParameters, StepSizes};

const NAVIGATION_AXIS_NAMES: [&str; 3] = ["x", "y", "z"];
const SIGNAL_AXIS_NAMES: [&str; 2] = ["kx", "ky"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    U16,
    U32,
}

impl PixelType {
    pub fn bytes(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::U32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::U16 => "uint16",
            PixelType::U32 => "uint32",
        }
    }
}

/// Typed pixel buffer, row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Pixels {
    pub fn with_capacity(pixel_type: PixelType, capacity: usize) -> Self {
        match pixel_type {
            PixelType::U8 => Pixels::U8(Vec::with_capacity(capacity)),
            PixelType::U16 => Pixels::U16(Vec::with_capacity(capacity)),
            PixelType::U32 => Pixels::U32(Vec::with_capacity(capacity)),
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            Pixels::U8(_) => PixelType::U8,
            Pixels::U16(_) => PixelType::U16,
            Pixels::U32(_) => PixelType::U32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Pixels::U8(v) => v.len(),
            Pixels::U16(v) => v.len(),
            Pixels::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_f64(&self, index: usize) -> f64 {
        match self {
            Pixels::U8(v) => v[index] as f64,
            Pixels::U16(v) => v[index] as f64,
            Pixels::U32(v) => v[index] as f64,
        }
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Pixels::U8(v) => v.iter().map(|&p| p as f64).collect(),
            Pixels::U16(v) => v.iter().map(|&p| p as f64).collect(),
            Pixels::U32(v) => v.iter().map(|&p| p as f64).collect(),
        }
    }

    pub fn extend_from(&mut self, other: &Pixels) -> Result<()> {
        match (self, other) {
            (Pixels::U8(a), Pixels::U8(b)) => a.extend_from_slice(b),
            (Pixels::U16(a), Pixels::U16(b)) => a.extend_from_slice(b),
            (Pixels::U32(a), Pixels::U32(b)) => a.extend_from_slice(b),
            (a, b) => bail!(
                "pixel type mismatch: {} vs {}",
                a.pixel_type().name(),
                b.pixel_type().name()
            ),
        }
        Ok(())
    }
}

/// Random access to the frames of an acquisition, in acquisition order.
pub trait FrameSource {
    fn frame_count(&self) -> usize;
    /// Detector (width, height) in pixels.
    fn frame_size(&self) -> (usize, usize);
    fn pixel_type(&self) -> PixelType;
    fn read_frame(&self, index: usize) -> Result<Pixels>;
}

/// Chunk shape actually used for an array: one entry per axis, clamped to
/// the axis length. A hint of the wrong length is spread as navigation
/// value (first entry) and signal value (last entry).
pub fn native_chunks(array_shape: &[u64], navigation_dims: usize, hint: &[u64]) -> Vec<u64> {
    let nav_chunk = hint.first().copied().unwrap_or(1);
    let sig_chunk = hint.last().copied().unwrap_or(1);
    array_shape
        .iter()
        .enumerate()
        .map(|(axis, &len)| {
            let wanted = if hint.len() == array_shape.len() {
                hint[axis]
            } else if axis < navigation_dims {
                nav_chunk
            } else {
                sig_chunk
            };
            wanted.clamp(1, len.max(1))
        })
        .collect()
}

/// Fortran-order (first index fastest) walk over every position of `shape`.
pub(crate) fn positions(shape: &[usize]) -> Vec<Vec<usize>> {
    let total: usize = shape.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut current = vec![0usize; shape.len()];
    for _ in 0..total {
        out.push(current.clone());
        for (axis, &len) in shape.iter().enumerate() {
            current[axis] += 1;
            if current[axis] < len {
                break;
            }
            current[axis] = 0;
        }
    }
    out
}

/// Frames read from a [`FrameSource`] only when asked for.
///
/// Navigation shape is fast axis first (`x`, `y`); stored arrays are
/// C order (`y`, `x`, detector row, detector column).
pub struct LazySignal {
    source: Box<dyn FrameSource>,
    navigation_shape: Vec<usize>,
    line_length: usize,
    requested_chunks: Vec<u64>,
    chunks: Vec<u64>,
    pub metadata: Metadata,
}

impl std::fmt::Debug for LazySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazySignal")
            .field("navigation_shape", &self.navigation_shape)
            .field("signal_shape", &self.signal_shape())
            .field("chunks", &self.chunks)
            .field("title", &self.metadata.title)
            .finish()
    }
}

impl LazySignal {
    /// Wrap `source` with the given navigation shape. The source must hold
    /// at least as many frames as the shape addresses.
    pub fn new(
        source: Box<dyn FrameSource>,
        navigation_shape: Vec<usize>,
        chunks: &[u64],
    ) -> Result<Self> {
        let needed: usize = navigation_shape.iter().product();
        if needed > source.frame_count() {
            bail!(
                "navigation shape {:?} needs {} frames but only {} are available",
                navigation_shape,
                needed,
                source.frame_count()
            );
        }
        let line_length = navigation_shape.first().copied().unwrap_or(1);
        let mut signal = Self {
            source,
            navigation_shape,
            line_length,
            requested_chunks: chunks.to_vec(),
            chunks: Vec::new(),
            metadata: Metadata::default(),
        };
        signal.rechunk();
        Ok(signal)
    }

    fn rechunk(&mut self) {
        self.chunks = native_chunks(
            &self.array_shape(),
            self.navigation_shape.len(),
            &self.requested_chunks,
        );
    }

    pub fn navigation_shape(&self) -> &[usize] {
        &self.navigation_shape
    }

    /// Detector (width, height).
    pub fn signal_shape(&self) -> (usize, usize) {
        self.source.frame_size()
    }

    pub fn pixel_type(&self) -> PixelType {
        self.source.pixel_type()
    }

    pub fn frame_len(&self) -> usize {
        let (w, h) = self.signal_shape();
        w * h
    }

    /// Shape in storage (C) order.
    pub fn array_shape(&self) -> Vec<u64> {
        let (w, h) = self.signal_shape();
        self.navigation_shape
            .iter()
            .rev()
            .map(|&n| n as u64)
            .chain([h as u64, w as u64])
            .collect()
    }

    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunks
    }

    /// Drop the trailing `lineskip` frames of every scan line.
    pub fn skip_line_frames(&mut self, lineskip: usize) -> Result<()> {
        if lineskip == 0 {
            return Ok(());
        }
        let first = self
            .navigation_shape
            .first_mut()
            .ok_or_else(|| anyhow!("cannot skip line frames of a signal without navigation axes"))?;
        if lineskip >= *first {
            bail!("lineskip {} leaves no frames in lines of length {}", lineskip, first);
        }
        *first -= lineskip;
        self.rechunk();
        Ok(())
    }

    /// Index into the source for a navigation position (fast axis first).
    pub fn frame_index(&self, position: &[usize]) -> usize {
        let mut index = 0;
        let mut stride = 1;
        for (axis, &p) in position.iter().enumerate() {
            index += p * stride;
            stride *= if axis == 0 {
                self.line_length
            } else {
                self.navigation_shape[axis]
            };
        }
        index
    }

    pub fn frame_at(&self, position: &[usize]) -> Result<Pixels> {
        self.source.read_frame(self.frame_index(position))
    }

    /// Visit every retained frame in storage order.
    pub fn for_each_frame(&self, mut f: impl FnMut(&[usize], &Pixels) -> Result<()>) -> Result<()> {
        for position in positions(&self.navigation_shape) {
            let frame = self.frame_at(&position)?;
            f(&position, &frame)?;
        }
        Ok(())
    }

    /// Read everything into memory.
    pub fn compute(&self, title: &str) -> Result<Signal> {
        let nav_len: usize = self.navigation_shape.iter().product();
        let mut pixels = Pixels::with_capacity(self.pixel_type(), nav_len * self.frame_len());
        self.for_each_frame(|_, frame| pixels.extend_from(frame))?;
        Ok(Signal {
            title: title.to_string(),
            pixels,
            shape: self.array_shape().into_iter().map(|n| n as usize).collect(),
            navigation_dims: self.navigation_shape.len(),
        })
    }

    pub fn axes(&self) -> Vec<Axis> {
        let (w, h) = self.signal_shape();
        let mut axes: Vec<Axis> = self
            .navigation_shape
            .iter()
            .enumerate()
            .map(|(i, &size)| Axis {
                name: axis_name(&NAVIGATION_AXIS_NAMES, i, "nav"),
                size,
                scale: self
                    .metadata
                    .step_sizes
                    .map(|s| s.scale_for_axis(i))
                    .unwrap_or(1.0),
                offset: 0.0,
                navigate: true,
            })
            .collect();
        for (i, size) in [w, h].into_iter().enumerate() {
            axes.push(Axis {
                name: SIGNAL_AXIS_NAMES[i].to_string(),
                size,
                scale: 1.0,
                offset: 0.0,
                navigate: false,
            });
        }
        axes
    }
}

fn axis_name(names: &[&str], index: usize, fallback: &str) -> String {
    names
        .get(index)
        .map(|n| n.to_string())
        .unwrap_or_else(|| format!("{}{}", fallback, index))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Axis {
    pub name: String,
    pub size: usize,
    pub scale: f64,
    pub offset: f64,
    pub navigate: bool,
}

/// Fully loaded signal, used for auxiliary data.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub title: String,
    pub pixels: Pixels,
    /// Storage (C) order, navigation axes first.
    pub shape: Vec<usize>,
    pub navigation_dims: usize,
}

impl Signal {
    pub fn signal_dims(&self) -> usize {
        self.shape.len() - self.navigation_dims
    }

    /// Zero-dimensional in both navigation and signal space.
    pub fn is_degenerate(&self) -> bool {
        self.navigation_dims == 0 && self.signal_dims() == 0
    }

    /// Remove length-1 axes. Row-major data is unaffected.
    pub fn squeezed(mut self) -> Self {
        let removed_nav = self.shape[..self.navigation_dims]
            .iter()
            .filter(|&&n| n == 1)
            .count();
        self.navigation_dims -= removed_nav;
        self.shape.retain(|&n| n != 1);
        self
    }

    pub fn describe(&self) -> Value {
        json!({
            "title": self.title,
            "shape": self.shape,
            "navigation_dimension": self.navigation_dims,
            "signal_dimension": self.signal_dims(),
            "dtype": self.pixels.pixel_type().name(),
        })
    }
}

/// Everything attached to the converted signal besides the frames.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub title: String,
    pub original_filename: Option<String>,
    pub experimental: ExperimentalParameters,
    pub step_sizes: Option<StepSizes>,
    /// Raw, unprocessed parameters (the sidecar lives under `Parameters`).
    pub original_metadata: Map<String, Value>,
    pub auxiliary: AuxiliaryDataSet,
}

impl Metadata {
    pub fn to_json(&self) -> Value {
        let mut general = Map::new();
        general.insert("title".into(), json!(self.title));
        if let Some(name) = &self.original_filename {
            general.insert("original_filename".into(), json!(name));
        }

        let exp = &self.experimental;
        let mut tem = Map::new();
        insert_some(&mut tem, "beam_energy", exp.beam_energy);
        insert_some(&mut tem, "scan_rotation", exp.scan_rotation);
        insert_some(&mut tem, "rocking_angle", exp.rocking_angle);
        insert_some(&mut tem, "rocking_frequency", exp.rocking_frequency);
        let mut diffraction = Map::new();
        insert_some(&mut diffraction, "camera_length", exp.camera_length);
        insert_some(&mut diffraction, "exposure_time", exp.exposure_time);
        if !diffraction.is_empty() {
            tem.insert("Detector".into(), json!({ "Diffraction": diffraction }));
        }

        let mut root = Map::new();
        root.insert("General".into(), Value::Object(general));
        root.insert("Signal".into(), json!({ "signal_type": "electron_diffraction" }));
        if !tem.is_empty() {
            root.insert("Acquisition_instrument".into(), json!({ "TEM": tem }));
        }
        if !self.auxiliary.is_empty() {
            let aux: Map<String, Value> = self
                .auxiliary
                .iter()
                .map(|(k, s)| (k.clone(), s.describe()))
                .collect();
            root.insert("Auxiliary_data".into(), Value::Object(aux));
        }
        Value::Object(root)
    }
}

fn insert_some(map: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        map.insert(key.to_string(), json!(v));
    }
}

/// In-memory frames for tests.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MemoryFrames {
    pub width: usize,
    pub height: usize,
    pub frames: Vec<Pixels>,
}

#[cfg(test)]
impl MemoryFrames {
    /// `count` u16 frames where every pixel of frame `i` equals `i`.
    pub fn numbered(count: usize, width: usize, height: usize) -> Self {
        let frames = (0..count)
            .map(|i| Pixels::U16(vec![i as u16; width * height]))
            .collect();
        Self {
            width,
            height,
            frames,
        }
    }
}

#[cfg(test)]
impl FrameSource for MemoryFrames {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn pixel_type(&self) -> PixelType {
        self.frames
            .first()
            .map(Pixels::pixel_type)
            .unwrap_or(PixelType::U16)
    }

    fn read_frame(&self, index: usize) -> Result<Pixels> {
        self.frames
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("frame {} out of range ({} frames)", index, self.frames.len()))
    }
}

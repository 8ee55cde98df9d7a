use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::ConvertError;
use crate::signal::{FrameSource, PixelType, Pixels};

const MAGIC: &str = "MQ1";
const HEADER_READ_BYTES: u64 = 4096;

/// Leading ASCII header of a MIB frame:
/// `MQ1,<seq>,<header bytes>,<chips>,<width>,<height>,<depth>,<layout>,...`
///
/// Pixels follow big-endian. Only unpacked depths (`U08`, `U16`, `U32`)
/// are read; raw bit-packed acquisitions (`R64`) are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MibHeader {
    pub header_bytes: usize,
    pub chips: u32,
    pub width: usize,
    pub height: usize,
    pub depth: String,
    pub layout: String,
}

impl MibHeader {
    pub fn parse(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        if fields.first() != Some(&MAGIC) {
            bail!("not a MIB frame header (expected {})", MAGIC);
        }
        if fields.len() < 8 {
            bail!("truncated MIB header: {} fields", fields.len());
        }
        let number = |i: usize, what: &str| -> Result<usize> {
            fields[i]
                .parse::<usize>()
                .with_context(|| format!("invalid {} {:?} in MIB header", what, fields[i]))
        };
        let header = Self {
            header_bytes: number(2, "header size")?,
            chips: number(3, "chip count")? as u32,
            width: number(4, "width")?,
            height: number(5, "height")?,
            depth: fields[6].to_string(),
            layout: fields[7].to_string(),
        };
        if header.header_bytes == 0 {
            bail!("MIB header declares a header size of 0 bytes");
        }
        if header.width == 0 || header.height == 0 {
            bail!("MIB header declares an empty {}x{} frame", header.width, header.height);
        }
        Ok(header)
    }

    pub fn pixel_type(&self) -> Option<PixelType> {
        match self.depth.as_str() {
            "U08" => Some(PixelType::U8),
            "U16" => Some(PixelType::U16),
            "U32" => Some(PixelType::U32),
            _ => None,
        }
    }

    /// Header plus pixel block, `None` if the declared size overflows.
    pub fn frame_bytes(&self, pixel_type: PixelType) -> Option<usize> {
        self.width
            .checked_mul(self.height)?
            .checked_mul(pixel_type.bytes())?
            .checked_add(self.header_bytes)
    }
}

/// Frames of one MIB file, read on demand.
#[derive(Debug)]
pub struct MibFile {
    path: PathBuf,
    file: File,
    header: MibHeader,
    pixel_type: PixelType,
    frame_bytes: usize,
    frame_count: usize,
}

impl MibFile {
    pub fn open(path: &Path) -> Result<Self, ConvertError> {
        let file = File::open(path).map_err(|e| ConvertError::load(path, e))?;
        let len = file.metadata().map_err(|e| ConvertError::load(path, e))?.len();
        let header = read_header(&file).map_err(|e| ConvertError::load(path, e))?;
        let pixel_type = header.pixel_type().ok_or_else(|| {
            debug!("Unsupported MIB depth {} in {}", header.depth, path.display());
            ConvertError::UnsupportedFormat {
                path: path.to_path_buf(),
            }
        })?;

        let frame_bytes = header.frame_bytes(pixel_type).ok_or_else(|| {
            ConvertError::load(
                path,
                anyhow!("{}x{} frame size overflows", header.width, header.height),
            )
        })?;
        let frame_count = (len / frame_bytes as u64) as usize;
        if frame_count == 0 {
            return Err(ConvertError::load(
                path,
                anyhow!("file holds less than one {} byte frame", frame_bytes),
            ));
        }
        let trailing = len % frame_bytes as u64;
        if trailing != 0 {
            warn!(
                "{} has {} trailing bytes after {} frames",
                path.display(),
                trailing,
                frame_count
            );
        }
        debug!(
            "Opened {}: {} frames of {}x{} {} ({} chips, layout {})",
            path.display(),
            frame_count,
            header.width,
            header.height,
            header.depth,
            header.chips,
            header.layout
        );
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            pixel_type,
            frame_bytes,
            frame_count,
        })
    }
}

fn read_header(file: &File) -> Result<MibHeader> {
    let mut head = Vec::new();
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    reader.take(HEADER_READ_BYTES).read_to_end(&mut head)?;
    let text = String::from_utf8_lossy(&head);
    let header = MibHeader::parse(&text)?;
    if header.header_bytes > head.len() {
        bail!("MIB header of {} bytes exceeds file", header.header_bytes);
    }
    Ok(header)
}

impl FrameSource for MibFile {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn frame_size(&self) -> (usize, usize) {
        (self.header.width, self.header.height)
    }

    fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    fn read_frame(&self, index: usize) -> Result<Pixels> {
        if index >= self.frame_count {
            bail!("frame {} out of range ({} frames)", index, self.frame_count);
        }
        let offset = (index * self.frame_bytes + self.header.header_bytes) as u64;
        let mut raw = vec![0u8; self.frame_bytes - self.header.header_bytes];
        let mut reader = &self.file;
        reader.seek(SeekFrom::Start(offset))?;
        reader
            .read_exact(&mut raw)
            .with_context(|| format!("reading frame {} of {}", index, self.path.display()))?;
        Ok(decode_big_endian(&raw, self.pixel_type))
    }
}

fn decode_big_endian(raw: &[u8], pixel_type: PixelType) -> Pixels {
    match pixel_type {
        PixelType::U8 => Pixels::U8(raw.to_vec()),
        PixelType::U16 => Pixels::U16(
            raw.chunks_exact(2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .collect(),
        ),
        PixelType::U32 => Pixels::U32(
            raw.chunks_exact(4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
    }
}

/// Navigation shape used when none was given: a single frame has no
/// navigation axes, a square frame count is a square scan, anything else
/// is a flat stack.
pub fn infer_navigation_shape(frames: usize) -> Vec<usize> {
    if frames <= 1 {
        return Vec::new();
    }
    let side = (frames as f64).sqrt().round() as usize;
    if side * side == frames {
        vec![side, side]
    } else {
        vec![frames]
    }
}

/// Write a synthetic MIB file: frame `i` has every pixel set to `value(i)`.
#[cfg(test)]
pub(crate) fn write_test_mib(
    path: &Path,
    frames: usize,
    width: usize,
    height: usize,
    depth: &str,
    value: impl Fn(usize) -> u32,
) {
    use std::io::Write;
    let header_bytes = 384;
    let mut out = std::io::BufWriter::new(File::create(path).unwrap());
    for i in 0..frames {
        let mut header = format!(
            "MQ1,{:06},{:05},01,{:04},{:04},{},1x1,01,2024-06-14 12:00:00.000000,0.001000,0,0,0",
            i + 1,
            header_bytes,
            width,
            height,
            depth
        )
        .into_bytes();
        header.resize(header_bytes, 0);
        out.write_all(&header).unwrap();
        let v = value(i);
        for _ in 0..width * height {
            match depth {
                "U08" => out.write_all(&[v as u8]).unwrap(),
                "U16" => out.write_all(&(v as u16).to_be_bytes()).unwrap(),
                _ => out.write_all(&v.to_be_bytes()).unwrap(),
            }
        }
    }
    out.flush().unwrap();
}

use image::ColorType;
use log::warn;
use std::fs::File;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};

use crate::discovery::is_raw_file;
use crate::error::ConvertError;
use crate::mib::{infer_navigation_shape, MibFile};
use crate::signal::{FrameSource, LazySignal, Pixels, Signal};

/// Opens raw and auxiliary files as signals.
pub trait SignalLoader {
    /// Open a raw acquisition without reading its frames. Without a
    /// navigation shape the loader decides one from the frame count.
    fn load_lazy(
        &self,
        path: &Path,
        navigation_shape: Option<&[usize]>,
        chunks: &[u64],
    ) -> Result<LazySignal, ConvertError>;

    /// Read a (small) file completely.
    fn load(&self, path: &Path) -> Result<Signal, ConvertError>;
}

/// Loader for the formats found in acquisition folders.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl SignalLoader for FileLoader {
    fn load_lazy(
        &self,
        path: &Path,
        navigation_shape: Option<&[usize]>,
        chunks: &[u64],
    ) -> Result<LazySignal, ConvertError> {
        if !is_raw_file(path) {
            return Err(ConvertError::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }
        let mib = MibFile::open(path)?;
        let frames = mib.frame_count();
        let shape = match navigation_shape {
            Some(shape) => shape.to_vec(),
            None => infer_navigation_shape(frames),
        };
        let used: usize = shape.iter().product();
        if used < frames {
            warn!(
                "{}: navigation shape {:?} uses {} of {} frames",
                path.display(),
                shape,
                used,
                frames
            );
        }
        LazySignal::new(Box::new(mib), shape, chunks).map_err(|e| ConvertError::load(path, e))
    }

    fn load(&self, path: &Path) -> Result<Signal, ConvertError> {
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let signal = match extension.as_str() {
            "mib" => self
                .load_lazy(path, None, &[])?
                .compute(&title)
                .map_err(|e| ConvertError::load(path, e))?,
            "png" | "jpg" | "jpeg" => load_image(path, title)?,
            "tif" | "tiff" => load_tiff(path, title)?,
            _ => {
                return Err(ConvertError::UnsupportedFormat {
                    path: path.to_path_buf(),
                })
            }
        };
        Ok(signal.squeezed())
    }
}

fn load_image(path: &Path, title: String) -> Result<Signal, ConvertError> {
    let img = image::open(path).map_err(|e| ConvertError::load(path, e))?;
    let (width, height) = (img.width() as usize, img.height() as usize);
    let pixels = match img.color() {
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
            Pixels::U16(img.to_luma16().into_raw())
        }
        _ => Pixels::U8(img.to_luma8().into_raw()),
    };
    Ok(Signal {
        title,
        pixels,
        shape: vec![height, width],
        navigation_dims: 0,
    })
}

fn load_tiff(path: &Path, title: String) -> Result<Signal, ConvertError> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(file).map_err(|e| ConvertError::load(path, e))?;
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| ConvertError::load(path, e))?;
    let pixels = match decoder.read_image().map_err(|e| ConvertError::load(path, e))? {
        DecodingResult::U8(v) => Pixels::U8(v),
        DecodingResult::U16(v) => Pixels::U16(v),
        DecodingResult::U32(v) => Pixels::U32(v),
        _ => {
            return Err(ConvertError::UnsupportedFormat {
                path: path.to_path_buf(),
            })
        }
    };
    let (width, height) = (width as usize, height as usize);
    if pixels.len() != width * height {
        return Err(ConvertError::load(
            path,
            anyhow::anyhow!("only single-channel TIFF images are supported"),
        ));
    }
    Ok(Signal {
        title,
        pixels,
        shape: vec![height, width],
        navigation_dims: 0,
    })
}

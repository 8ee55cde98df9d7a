use anyhow::{anyhow, Result};
use image::GrayImage;
use log::info;
use ndarray::{Array2, ArrayView2};
use std::path::{Path, PathBuf};

use crate::signal::LazySignal;

/// Circular detector region used for the virtual bright field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircleRoi {
    pub cx: usize,
    pub cy: usize,
    pub r: usize,
}

impl CircleRoi {
    /// Centred on the detector with a tenth of its width as radius.
    pub fn centred(width: usize, height: usize) -> Self {
        Self {
            cx: width / 2,
            cy: height / 2,
            r: width / 10,
        }
    }

    fn pixel_indices(&self, width: usize, height: usize) -> Vec<usize> {
        let r2 = (self.r * self.r) as i64;
        let mut out = Vec::new();
        for row in 0..height {
            for col in 0..width {
                let dx = col as i64 - self.cx as i64;
                let dy = row as i64 - self.cy as i64;
                if dx * dx + dy * dy <= r2 {
                    out.push(row * width + col);
                }
            }
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct Previews {
    /// Integrated ROI intensity per scan position, (rows, columns).
    pub vbf: Option<Array2<f64>>,
    /// Per-pixel maximum over all frames, (height, width).
    pub stack_max: Option<Array2<f64>>,
}

/// Compute the requested previews in a single pass over the frames.
pub fn compute_previews(signal: &LazySignal, vbf: bool, stack_max: bool) -> Result<Previews> {
    if !vbf && !stack_max {
        return Ok(Previews::default());
    }
    let (width, height) = signal.signal_shape();
    let nav = signal.navigation_shape();
    let columns = nav.first().copied().unwrap_or(1);
    let rows: usize = nav.iter().skip(1).product();

    let roi = CircleRoi::centred(width, height);
    let roi_pixels = roi.pixel_indices(width, height);
    if vbf {
        info!("Creating VBF ({}, {}, {})", roi.cx, roi.cy, roi.r);
    }
    if stack_max {
        info!("Creating maximum through-stack image");
    }

    let mut vbf_image = vbf.then(|| Array2::<f64>::zeros((rows, columns)));
    let mut max_image = stack_max.then(|| Array2::<f64>::zeros((height, width)));

    signal.for_each_frame(|position, frame| {
        if let Some(image) = vbf_image.as_mut() {
            let col = position.first().copied().unwrap_or(0);
            let mut row = 0;
            let mut stride = 1;
            for (axis, &p) in position.iter().enumerate().skip(1) {
                row += p * stride;
                stride *= nav[axis];
            }
            image[[row, col]] = roi_pixels.iter().map(|&i| frame.get_f64(i)).sum();
        }
        if let Some(image) = max_image.as_mut() {
            let values = frame.to_f64();
            let view = ArrayView2::from_shape((height, width), &values)?;
            image.zip_mut_with(&view, |m, &v| *m = m.max(v));
        }
        Ok(())
    })?;

    Ok(Previews {
        vbf: vbf_image,
        stack_max: max_image,
    })
}

pub fn vbf_path(raw: &Path) -> PathBuf {
    suffixed_png(raw, "vbf")
}

pub fn stack_max_path(raw: &Path) -> PathBuf {
    suffixed_png(raw, "max")
}

fn suffixed_png(raw: &Path, suffix: &str) -> PathBuf {
    let stem = raw
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    raw.with_file_name(format!("{}_{}.png", stem, suffix))
}

/// Compute and save the requested previews beside `raw`.
pub fn write_previews(
    signal: &LazySignal,
    raw: &Path,
    vbf: bool,
    stack_max: bool,
) -> Result<Vec<PathBuf>> {
    let previews = compute_previews(signal, vbf, stack_max)?;
    let mut written = Vec::new();
    if let Some(image) = &previews.vbf {
        let path = vbf_path(raw);
        render(image, false)?.save(&path)?;
        written.push(path);
    }
    if let Some(image) = &previews.stack_max {
        let path = stack_max_path(raw);
        render(image, true)?.save(&path)?;
        written.push(path);
    }
    Ok(written)
}

fn render(image: &Array2<f64>, symlog: bool) -> Result<GrayImage> {
    let (rows, cols) = image.dim();
    let values: Vec<f64> = image
        .iter()
        .map(|&v| if symlog { v.signum() * v.abs().ln_1p() } else { v })
        .collect();
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    let data: Vec<u8> = values
        .iter()
        .map(|&v| {
            if range > 0.0 {
                (((v - min) / range) * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect();
    GrayImage::from_raw(cols as u32, rows as u32, data)
        .ok_or_else(|| anyhow!("preview buffer does not match {}x{}", cols, rows))
}

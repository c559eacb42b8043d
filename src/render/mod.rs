//! Pixel conversion and aspect-preserving scaling shared by the sinks.

pub mod pattern;

pub use pattern::TestPattern;

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::media::{Frame, PixelFormat};
use crate::{Result, StreamerError};

/// Resampling filter for every resize in the pipeline.
pub const SCALE_FILTER: FilterType = FilterType::CatmullRom;

/// Decode a frame into an owned RGBA image.
pub fn frame_to_rgba(frame: &Frame) -> Result<RgbaImage> {
    let data = frame.data();
    let pixels = match frame.format() {
        PixelFormat::Rgba8 => data.to_vec(),
        PixelFormat::Bgra8 => {
            let mut out = data.to_vec();
            for px in out.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            out
        }
        PixelFormat::Rgb8 => {
            let mut out = Vec::with_capacity(data.len() / 3 * 4);
            for px in data.chunks_exact(3) {
                out.extend_from_slice(&[px[0], px[1], px[2], 255]);
            }
            out
        }
    };
    RgbaImage::from_raw(frame.width(), frame.height(), pixels)
        .ok_or_else(|| StreamerError::Render("Failed to create image from frame".into()))
}

/// Largest `(width, height)` with the source aspect ratio that fits the box.
pub fn fit_within(src: (u32, u32), dst: (u32, u32)) -> (u32, u32) {
    let (sw, sh) = (src.0.max(1) as u64, src.1.max(1) as u64);
    let (dw, dh) = (dst.0 as u64, dst.1 as u64);
    // Compare sw/sh with dw/dh without floating point.
    if sw * dh >= dw * sh {
        (dw as u32, ((sh * dw) / sw).max(1) as u32)
    } else {
        (((sw * dh) / sh).max(1) as u32, dh as u32)
    }
}

/// Scale `frame` into a `width` x `height` canvas keeping its aspect ratio,
/// filling the bars with black.
pub fn letterbox(frame: &Frame, width: u32, height: u32) -> Result<RgbaImage> {
    if width == 0 || height == 0 {
        return Err(StreamerError::Render(format!("invalid target size {}x{}", width, height)));
    }
    let source = frame_to_rgba(frame)?;
    if source.dimensions() == (width, height) {
        return Ok(source);
    }

    let (fw, fh) = fit_within(source.dimensions(), (width, height));
    let scaled = if (fw, fh) == source.dimensions() {
        source
    } else {
        imageops::resize(&source, fw, fh, SCALE_FILTER)
    };
    if (fw, fh) == (width, height) {
        return Ok(scaled);
    }

    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));
    let x = (width - fw) / 2;
    let y = (height - fh) / 2;
    imageops::replace(&mut canvas, &scaled, x as i64, y as i64);
    Ok(canvas)
}

/// Letterboxed RGB24 bytes, the raw layout the encoder reads from stdin.
pub fn to_rgb24(frame: &Frame, width: u32, height: u32) -> Result<Vec<u8>> {
    if frame.format() == PixelFormat::Rgb8 && (frame.width(), frame.height()) == (width, height) {
        return Ok(frame.data().to_vec());
    }
    let image = letterbox(frame, width, height)?;
    let mut out = Vec::with_capacity(width as usize * height as usize * 3);
    for px in image.as_raw().chunks_exact(4) {
        out.extend_from_slice(&px[..3]);
    }
    Ok(out)
}

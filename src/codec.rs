//! Screen capture image services.
//!
//! Captures arrive as binary PPM (`P6`) files. The [`ImageCodec`] validates
//! and re-encodes them; a [`VideoEncoder`] turns a directory of frames into a
//! video. Frame identity is a SHA-256 content [`fingerprint`].

use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::Path;

/// Image conversion services.
pub trait ImageCodec: Send + Sync {
    /// Whether `path` holds a structurally valid frame.
    fn verify_frame(&self, path: &Path) -> bool {
        verify_ppm_file(path)
    }

    /// Encode `src` as a JPEG at `dst`.
    fn encode_jpeg(&self, src: &Path, dst: &Path, quality: u8) -> Result<()>;

    /// Convert `src` to a PNG at `dst`.
    fn convert_png(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Encodes a directory of frames into a video file.
pub trait VideoEncoder: Send + Sync {
    /// Whether WebM output is available; otherwise Ogg is produced.
    fn supports_webm(&self) -> bool;

    /// Encode every frame in `frames_dir` into `output`.
    fn encode(&self, frames_dir: &Path, output: &Path) -> Result<()>;
}

/// Hex SHA-256 of a file's content.
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether `path` is a complete binary PPM image.
pub fn verify_ppm_file(path: &Path) -> bool {
    match std::fs::read(path) {
        Ok(data) => verify_ppm(&data),
        Err(_) => false,
    }
}

/// Whether `data` decodes as a binary (`P6`) PPM image with a nonempty raster.
pub fn verify_ppm(data: &[u8]) -> bool {
    if !data.starts_with(b"P6") {
        return false;
    }
    match decode_ppm(data) {
        Ok(frame) => frame.width() > 0 && frame.height() > 0,
        Err(e) => {
            tracing::trace!(error = %e, "frame does not decode");
            false
        }
    }
}

fn decode_ppm(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory_with_format(data, ImageFormat::Pnm)
        .map_err(|e| Error::Codec(e.to_string()))
}

fn load_ppm(path: &Path) -> Result<DynamicImage> {
    decode_ppm(&std::fs::read(path)?)
}

/// [`ImageCodec`] backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterCodec;

impl ImageCodec for RasterCodec {
    fn encode_jpeg(&self, src: &Path, dst: &Path, quality: u8) -> Result<()> {
        let frame = load_ppm(src)?.to_rgb8();
        let out = BufWriter::new(File::create(dst)?);
        JpegEncoder::new_with_quality(out, quality.clamp(1, 100))
            .encode_image(&frame)
            .map_err(|e| Error::Codec(format!("{}: {}", dst.display(), e)))
    }

    fn convert_png(&self, src: &Path, dst: &Path) -> Result<()> {
        load_ppm(src)?
            .save_with_format(dst, ImageFormat::Png)
            .map_err(|e| Error::Codec(format!("{}: {}", dst.display(), e)))
    }
}

#[cfg(test)]
pub(crate) fn sample_ppm(width: usize, height: usize, fill: u8) -> Vec<u8> {
    let mut data = format!("P6\n{} {}\n255\n", width, height).into_bytes();
    data.extend(std::iter::repeat(fill).take(width * height * 3));
    data
}

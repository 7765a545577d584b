use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use std::fs;
use std::path::Path;

/// Encode an image as JPEG bytes.
pub fn encode_jpeg(image: &Mat) -> Result<Vec<u8>> {
    if image.empty() {
        return Err(anyhow!("Cannot encode an empty image"));
    }
    let mut buf = Vector::<u8>::new();
    let ok = imgcodecs::imencode(".jpg", image, &mut buf, &Vector::new())?;
    if !ok {
        return Err(anyhow!("JPEG encoder rejected the image"));
    }
    Ok(buf.to_vec())
}

pub fn encode_jpeg_base64(image: &Mat) -> Result<String> {
    Ok(STANDARD.encode(encode_jpeg(image)?))
}

/// Write an image as `dest` via a staging file in the same directory, so
/// readers polling the directory never observe a partially written file.
///
/// The staging name keeps the destination's extension so the encoder picks
/// the same format.
pub fn write_image_atomic(dest: &Path, image: &Mat) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| anyhow!("No parent directory for {:?}", dest))?;
    let name = dest
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("Invalid image path: {:?}", dest))?;
    let staging = dir.join(format!("tmp_{name}"));

    let staging_str = staging
        .to_str()
        .ok_or_else(|| anyhow!("Non UTF-8 path: {:?}", staging))?;
    let ok = imgcodecs::imwrite(staging_str, image, &Vector::new())
        .with_context(|| format!("Failed to write {:?}", staging))?;
    if !ok {
        return Err(anyhow!("Image encoder refused to write {:?}", staging));
    }

    fs::rename(&staging, dest).with_context(|| format!("Failed to move image into {:?}", dest))?;
    Ok(())
}

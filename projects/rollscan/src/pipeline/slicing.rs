use crate::pipeline::geometry::PatchGrid;
use crate::pipeline::types::Patch;
use anyhow::{Context, Result};
use opencv::core::{Mat, Rect};
use opencv::prelude::*;

/// Split a normalized frame into non-overlapping patches.
///
/// Patches are produced in row-major order (left to right, top to bottom).
/// When the frame size is not a multiple of `patch_size`, the last column and
/// row are clipped to the frame instead of padded, so the output always holds
/// `ceil(W / s) * ceil(H / s)` patches.
pub fn generate_patches(image: &Mat, patch_size: u32) -> Result<(PatchGrid, Vec<Patch>)> {
    if patch_size == 0 {
        anyhow::bail!("Patch size must be positive");
    }

    let size = image.size()?;
    let grid = PatchGrid::new(size.width.max(0) as u32, size.height.max(0) as u32, patch_size);

    if grid.is_empty() {
        anyhow::bail!("Cannot tile an empty image");
    }

    let mut patches = Vec::with_capacity(grid.len());
    for cell in grid.cells() {
        let coords = grid.coords(cell);
        let roi = Rect::new(coords.x1, coords.y1, coords.width(), coords.height());
        let view = Mat::roi(image, roi)
            .with_context(|| format!("Failed to cut patch at ({}, {})", coords.x1, coords.y1))?;

        let mut tile = Mat::default();
        view.copy_to(&mut tile)?;

        patches.push(Patch {
            cell,
            coords,
            image: tile,
        });
    }

    Ok((grid, patches))
}

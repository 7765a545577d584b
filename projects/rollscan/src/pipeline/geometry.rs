use crate::pipeline::types::{GridCell, PatchCoords};

/// Regular grid of fixed-size patches over a frame. Edge patches are clipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    pub width: u32,
    pub height: u32,
    pub patch_size: u32,
    pub cols: u32,
    pub rows: u32,
}

impl PatchGrid {
    pub fn new(width: u32, height: u32, patch_size: u32) -> Self {
        let patch_size = patch_size.max(1);
        Self {
            width,
            height,
            patch_size,
            cols: width.div_ceil(patch_size),
            rows: height.div_ceil(patch_size),
        }
    }

    pub fn len(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, cell: GridCell) -> bool {
        cell.col < self.cols && cell.row < self.rows
    }

    /// Row-major position of a cell, matching the tiler's output order.
    pub fn index_of(&self, cell: GridCell) -> Option<usize> {
        self.contains(cell)
            .then(|| cell.row as usize * self.cols as usize + cell.col as usize)
    }

    pub fn coords(&self, cell: GridCell) -> PatchCoords {
        let x1 = cell.col * self.patch_size;
        let y1 = cell.row * self.patch_size;
        PatchCoords {
            x1: x1 as i32,
            y1: y1 as i32,
            x2: (x1 + self.patch_size).min(self.width) as i32,
            y2: (y1 + self.patch_size).min(self.height) as i32,
        }
    }

    /// Cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.cols).map(move |col| GridCell::new(col, row)))
    }

    /// 8-connected neighbors of a cell, clipped to the grid, excluding the cell itself.
    pub fn neighbors(&self, cell: GridCell) -> Vec<GridCell> {
        let mut out = Vec::with_capacity(8);
        for row in cell.row.saturating_sub(1)..=(cell.row + 1) {
            for col in cell.col.saturating_sub(1)..=(cell.col + 1) {
                let candidate = GridCell::new(col, row);
                if candidate != cell && self.contains(candidate) {
                    out.push(candidate);
                }
            }
        }
        out
    }
}

/// A defect location in physical roll coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalPoint {
    /// Along-roll position
    pub x_cm: f64,
    /// Cross-web position
    pub y_cm: f64,
}

/// Maps frame-relative pixel positions onto the roll.
///
/// Successive sampled frames are stacked along the roll's long axis, so the
/// along-roll position is `frame_pos` full frame heights plus the pixel row.
/// The frame's horizontal axis is the cross-web axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollGeometry {
    pub frame_height_cm: f64,
    pub frame_height_px: u32,
}

impl RollGeometry {
    pub fn new(frame_height_cm: f64, frame_height_px: u32) -> Self {
        Self {
            frame_height_cm,
            frame_height_px,
        }
    }

    /// Centimeters per pixel.
    pub fn ratio(&self) -> f64 {
        self.frame_height_cm / self.frame_height_px as f64
    }

    pub fn to_physical(&self, frame_pos: u64, pos_x: u32, pos_y: u32) -> PhysicalPoint {
        let ratio = self.ratio();
        PhysicalPoint {
            x_cm: ratio * (frame_pos as f64 * self.frame_height_px as f64 + pos_y as f64),
            y_cm: ratio * pos_x as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dimensions_round_up() {
        let grid = PatchGrid::new(768, 512, 64);
        assert_eq!((grid.cols, grid.rows), (12, 8));
        assert_eq!(grid.len(), 96);

        let ragged = PatchGrid::new(100, 70, 64);
        assert_eq!((ragged.cols, ragged.rows), (2, 2));
        let corner = ragged.coords(GridCell::new(1, 1));
        assert_eq!(corner, PatchCoords { x1: 64, y1: 64, x2: 100, y2: 70 });
    }

    #[test]
    fn test_index_of_is_row_major() {
        let grid = PatchGrid::new(768, 512, 64);
        assert_eq!(grid.index_of(GridCell::new(0, 0)), Some(0));
        assert_eq!(grid.index_of(GridCell::new(3, 2)), Some(27));
        assert_eq!(grid.index_of(GridCell::new(12, 0)), None);
        let order: Vec<_> = grid.cells().take(13).collect();
        assert_eq!(order[12], GridCell::new(0, 1));
    }

    #[test]
    fn test_neighbors_clipped_at_corners_and_edges() {
        let grid = PatchGrid::new(768, 512, 64);

        let corner = grid.neighbors(GridCell::new(0, 0));
        assert_eq!(
            corner,
            vec![GridCell::new(1, 0), GridCell::new(0, 1), GridCell::new(1, 1)]
        );

        let far_corner = grid.neighbors(GridCell::new(11, 7));
        assert_eq!(far_corner.len(), 3);

        let edge = grid.neighbors(GridCell::new(5, 0));
        assert_eq!(edge.len(), 5);

        let inner = grid.neighbors(GridCell::new(5, 4));
        assert_eq!(inner.len(), 8);
        assert!(!inner.contains(&GridCell::new(5, 4)));
    }

    #[test]
    fn test_neighbors_respect_non_square_bounds() {
        // Wider than tall: the bottom row must not leak past the frame height.
        let grid = PatchGrid::new(768, 128, 64);
        let n = grid.neighbors(GridCell::new(10, 1));
        assert!(n.iter().all(|c| c.row < 2 && c.col < 12));
        assert_eq!(n.len(), 5);
    }

    #[test]
    fn test_physical_mapping() {
        let geometry = RollGeometry::new(15.0, 512);
        let p = geometry.to_physical(0, 0, 0);
        assert_eq!(p, PhysicalPoint { x_cm: 0.0, y_cm: 0.0 });

        let p = geometry.to_physical(2, 256, 128);
        let ratio = 15.0 / 512.0;
        assert!((p.x_cm - ratio * (2.0 * 512.0 + 128.0)).abs() < 1e-9);
        assert!((p.y_cm - 7.5).abs() < 1e-9);
    }
}

use opencv::core::{Mat, Scalar};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Surface defect classes, in the id order the classifier was trained with.
///
/// Id `0` is the background class: a patch predicted as `Good` is never a defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DefectClass {
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "hole")]
    Hole,
    #[serde(rename = "objects")]
    Objects,
    #[serde(rename = "oil spot")]
    OilSpot,
    #[serde(rename = "thread error")]
    ThreadError,
}

impl DefectClass {
    pub const ALL: [DefectClass; 5] = [
        DefectClass::Good,
        DefectClass::Hole,
        DefectClass::Objects,
        DefectClass::OilSpot,
        DefectClass::ThreadError,
    ];

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u32 {
        match self {
            DefectClass::Good => 0,
            DefectClass::Hole => 1,
            DefectClass::Objects => 2,
            DefectClass::OilSpot => 3,
            DefectClass::ThreadError => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DefectClass::Good => "good",
            DefectClass::Hole => "hole",
            DefectClass::Objects => "objects",
            DefectClass::OilSpot => "oil spot",
            DefectClass::ThreadError => "thread error",
        }
    }

    pub fn is_defect(self) -> bool {
        self != DefectClass::Good
    }

    /// Drawing color in BGR order, shared by frame annotations and rollmaps.
    pub fn bgr(self) -> [u8; 3] {
        match self {
            DefectClass::Good => [0, 255, 255],
            DefectClass::Hole => [0, 0, 255],         // Red
            DefectClass::Objects => [255, 0, 0],      // Blue
            DefectClass::OilSpot => [0, 255, 0],      // Green
            DefectClass::ThreadError => [42, 42, 165], // Brown
        }
    }

    pub fn color(self) -> Scalar {
        let [b, g, r] = self.bgr();
        Scalar::new(b as f64, g as f64, r as f64, 0.0)
    }
}

impl std::fmt::Display for DefectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of a patch in the tiling grid. Ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GridCell {
    pub row: u32,
    pub col: u32,
}

impl GridCell {
    pub fn new(col: u32, row: u32) -> Self {
        Self { row, col }
    }
}

/// Pixel rectangle of a patch inside the normalized frame, clipped to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PatchCoords {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PatchCoords {
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

/// A tile cut from a normalized frame, the unit of classification.
#[derive(Clone)]
pub struct Patch {
    pub cell: GridCell,
    pub coords: PatchCoords,
    pub image: Mat,
}

/// Classifier output for one patch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class_id: u32,
    pub confidence: f32,
}

/// Which acceptance pass confirmed a defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Primary,
    Neighbor,
}

/// A patch accepted as defective for the current frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcceptedDefect {
    pub cell: GridCell,
    pub coords: PatchCoords,
    pub class: DefectClass,
    pub confidence: f32,
    pub pass: Pass,
}

/// A sampled frame waiting in a queue directory, named `frame_<index>.jpg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFile {
    pub index: u64,
    pub path: PathBuf,
}

const FRAME_PREFIX: &str = "frame_";
const FRAME_SUFFIX: &str = ".jpg";

impl FrameFile {
    pub fn file_name(index: u64) -> String {
        format!("{FRAME_PREFIX}{index}{FRAME_SUFFIX}")
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let digits = name.strip_prefix(FRAME_PREFIX)?.strip_suffix(FRAME_SUFFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            index: digits.parse().ok()?,
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_table_round_trips_ids() {
        for class in DefectClass::ALL {
            assert_eq!(DefectClass::from_id(class.id()), Some(class));
        }
        assert_eq!(DefectClass::from_id(5), None);
        assert!(!DefectClass::Good.is_defect());
        assert!(DefectClass::OilSpot.is_defect());
    }

    #[test]
    fn test_class_serializes_as_name() {
        let json = serde_json::to_string(&DefectClass::ThreadError).unwrap();
        assert_eq!(json, "\"thread error\"");
        let parsed: DefectClass = serde_json::from_str("\"oil spot\"").unwrap();
        assert_eq!(parsed, DefectClass::OilSpot);
    }

    #[test]
    fn test_frame_file_parsing() {
        let f = FrameFile::from_path(Path::new("/q/frame_238.jpg")).unwrap();
        assert_eq!(f.index, 238);
        assert!(FrameFile::from_path(Path::new("/q/tmp_frame_238.jpg")).is_none());
        assert!(FrameFile::from_path(Path::new("/q/frame_.jpg")).is_none());
        assert!(FrameFile::from_path(Path::new("/q/frame_12a.jpg")).is_none());
        assert!(FrameFile::from_path(Path::new("/q/frame_12.png")).is_none());
        assert_eq!(FrameFile::file_name(0), "frame_0.jpg");
    }

    #[test]
    fn test_grid_cells_order_row_major() {
        let mut cells = vec![
            GridCell::new(1, 1),
            GridCell::new(5, 0),
            GridCell::new(0, 1),
        ];
        cells.sort();
        assert_eq!(
            cells,
            vec![GridCell::new(5, 0), GridCell::new(0, 1), GridCell::new(1, 1)]
        );
    }
}

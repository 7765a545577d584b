use crate::pipeline::codec::write_image_atomic;
use crate::pipeline::types::{AcceptedDefect, FrameFile};
use anyhow::{Context, Result};
use opencv::core::{Mat, Rect};
use opencv::imgproc::{rectangle, LINE_8};
use opencv::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

const BOX_THICKNESS: i32 = 2;

/// Draw one box per accepted defect on a copy of the normalized frame.
pub fn annotate_frame(normalized: &Mat, defects: &[AcceptedDefect]) -> Result<Mat> {
    let mut draw_img = normalized.try_clone()?;
    for d in defects {
        let rect = Rect::new(d.coords.x1, d.coords.y1, d.coords.width(), d.coords.height());
        rectangle(&mut draw_img, rect, d.class.color(), BOX_THICKNESS, LINE_8, 0)?;
    }
    Ok(draw_img)
}

/// Write the annotated frame into `ready_dir` under the source frame's name,
/// then remove the source frame. Returns the published path.
pub fn publish(annotated: &Mat, frame: &FrameFile, ready_dir: &Path) -> Result<PathBuf> {
    let dest = ready_dir.join(FrameFile::file_name(frame.index));
    write_image_atomic(&dest, annotated)?;
    fs::remove_file(&frame.path)
        .with_context(|| format!("Failed to remove processed frame {:?}", frame.path))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{DefectClass, GridCell, Pass, PatchCoords};
    use opencv::core::{Scalar, Vec3b, CV_8UC3};

    fn defect(x1: i32, y1: i32, class: DefectClass) -> AcceptedDefect {
        AcceptedDefect {
            cell: GridCell::new((x1 / 64) as u32, (y1 / 64) as u32),
            coords: PatchCoords {
                x1,
                y1,
                x2: x1 + 64,
                y2: y1 + 64,
            },
            class,
            confidence: 0.9999,
            pass: Pass::Primary,
        }
    }

    #[test]
    fn test_boxes_use_class_colors() {
        let frame = Mat::new_rows_cols_with_default(512, 768, CV_8UC3, Scalar::all(128.0)).unwrap();
        let out = annotate_frame(
            &frame,
            &[defect(0, 0, DefectClass::Hole), defect(128, 64, DefectClass::Objects)],
        )
        .unwrap();

        assert_eq!(*out.at_2d::<Vec3b>(0, 10).unwrap(), Vec3b::from(DefectClass::Hole.bgr()));
        assert_eq!(*out.at_2d::<Vec3b>(64, 140).unwrap(), Vec3b::from(DefectClass::Objects.bgr()));
        // Interior untouched, source untouched
        assert_eq!(*out.at_2d::<Vec3b>(32, 32).unwrap(), Vec3b::from([128, 128, 128]));
        assert_eq!(*frame.at_2d::<Vec3b>(0, 10).unwrap(), Vec3b::from([128, 128, 128]));
    }

    #[test]
    fn test_no_defects_leaves_frame_unchanged() {
        let frame = Mat::new_rows_cols_with_default(64, 64, CV_8UC3, Scalar::all(7.0)).unwrap();
        let out = annotate_frame(&frame, &[]).unwrap();
        assert_eq!(out.data_bytes().unwrap(), frame.data_bytes().unwrap());
    }

    #[test]
    fn test_publish_moves_frame_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        let ready = dir.path().join("ready");
        fs::create_dir_all(&frames).unwrap();
        fs::create_dir_all(&ready).unwrap();

        let source = frames.join(FrameFile::file_name(238));
        fs::write(&source, b"raw").unwrap();
        let frame = FrameFile::from_path(&source).unwrap();

        let image = Mat::new_rows_cols_with_default(64, 64, CV_8UC3, Scalar::all(0.0)).unwrap();
        let dest = publish(&image, &frame, &ready).unwrap();

        assert_eq!(dest, ready.join("frame_238.jpg"));
        assert!(dest.exists());
        assert!(!source.exists());
        assert!(!ready.join("tmp_frame_238.jpg").exists());
    }
}

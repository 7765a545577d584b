// Session artifact struct definitions
//
// This module contains the records that are persisted as files within the
// data root or a session directory, and the summary derived from them.

use crate::pipeline::types::DefectClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of the active-session pointer file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionPointer {
    pub active_session: String,
}

/// Written into a session root once its video has been fully sampled.
///
/// Frame indices restart at 0 for every video, so a session holds the
/// frames of exactly one video.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRecord {
    pub video: String,
    pub decoded: u64,
    pub sampled: u64,
    pub extracted_at: DateTime<Utc>,
}

/// One accepted defect, one line of the session's defect log.
///
/// Records are immutable once appended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DefectRecord {
    /// Sampled-frame ordinal along the roll (`frame_index / frame_skip`)
    pub frame_pos: u64,
    /// Index of the frame in the source video
    pub frame_index: u64,
    #[serde(rename = "camera")]
    pub camera_id: String,
    pub class: DefectClass,
    pub confidence: f32,
    /// Patch origin in the normalized frame
    pub pos_x: u32,
    pub pos_y: u32,
    #[serde(rename = "time")]
    pub capture_unix_time: i64,
    /// JPEG of the patch, base64 encoded
    #[serde(rename = "img_base64")]
    pub thumbnail: String,
}

/// Roll-level statistics computed from a defect log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub session_id: String,
    /// Seconds between the first and the last logged defect
    pub elapsed_time: i64,
    /// Sampled frames covered so far (`last frame_pos + 1`)
    pub captures: u64,
    pub speed: f64,
    pub position: f64,
    pub defect_count: usize,
}

impl Summary {
    pub fn empty(session_id: &str, speed: f64) -> Self {
        Self {
            session_id: session_id.to_string(),
            elapsed_time: 0,
            captures: 0,
            speed,
            position: 0.0,
            defect_count: 0,
        }
    }
}

/// Tabular view of a [`DefectRecord`] without the thumbnail.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DefectRow<'a> {
    pub frame_pos: u64,
    pub frame_index: u64,
    pub camera: &'a str,
    pub class: DefectClass,
    pub confidence: f32,
    pub pos_x: u32,
    pub pos_y: u32,
    pub time: i64,
}

impl<'a> From<&'a DefectRecord> for DefectRow<'a> {
    fn from(r: &'a DefectRecord) -> Self {
        Self {
            frame_pos: r.frame_pos,
            frame_index: r.frame_index,
            camera: &r.camera_id,
            class: r.class,
            confidence: r.confidence,
            pos_x: r.pos_x,
            pos_y: r.pos_y,
            time: r.capture_unix_time,
        }
    }
}

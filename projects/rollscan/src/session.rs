use crate::artifacts::SessionPointer;
use crate::pipeline::orchestrator::PollWorker;
use crate::pipeline::store::DefectStore;
use crate::pipeline::types::FrameFile;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

const POINTER_FILE: &str = "active_session.json";
const WORKING_DIR: &str = "working";

/// Receiving end of the active-session channel.
pub type SessionWatch = watch::Receiver<Option<Arc<SessionContext>>>;

/// Resolve the active session once for the current cycle.
pub fn current_session(rx: &SessionWatch) -> Option<Arc<SessionContext>> {
    rx.borrow().clone()
}

/// Top-level directory holding the session pointer and every session root.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn pointer_file(&self) -> PathBuf {
        self.root.join(POINTER_FILE)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.root.join(WORKING_DIR)
    }

    pub fn session(&self, id: &str) -> SessionContext {
        SessionContext::new(self, id)
    }
}

/// Paths of one session, resolved from its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub id: String,
    pub root: PathBuf,
    pub frames_dir: PathBuf,
    pub ready_dir: PathBuf,
    pub rollmaps_dir: PathBuf,
    pub defect_log: PathBuf,
}

impl SessionContext {
    pub fn new(data_root: &DataRoot, id: &str) -> Self {
        let root = data_root.working_dir().join(id);
        Self {
            id: id.to_string(),
            frames_dir: root.join("frames"),
            ready_dir: root.join("ready"),
            rollmaps_dir: root.join("rollmaps"),
            defect_log: root.join("defects.json"),
            root,
        }
    }

    pub fn create_layout(&self) -> Result<()> {
        for dir in [&self.frames_dir, &self.ready_dir, &self.rollmaps_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create session directory {:?}", dir))?;
        }
        Ok(())
    }

    pub fn layout_exists(&self) -> bool {
        [&self.frames_dir, &self.ready_dir, &self.rollmaps_dir]
            .iter()
            .all(|d| d.is_dir())
    }

    pub fn store(&self) -> DefectStore {
        DefectStore::new(&self.defect_log)
    }

    /// Marker left once the session's video was sampled.
    pub fn extraction_record(&self) -> PathBuf {
        self.root.join("extracted.json")
    }

    /// Where the externally picked-up frame is placed.
    pub fn last_frame_path(&self) -> PathBuf {
        self.root.join("last.jpg")
    }
}

fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        bail!("Invalid session id {:?}", id);
    }
    Ok(())
}

/// Read the active-session pointer. A missing file is `None`; a malformed one is an error.
pub fn read_pointer(data_root: &DataRoot) -> Result<Option<SessionPointer>> {
    let path = data_root.pointer_file();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };
    let pointer: SessionPointer = serde_json::from_str(&content)
        .with_context(|| format!("Malformed session pointer {:?}", path))?;
    validate_session_id(&pointer.active_session)?;
    Ok(Some(pointer))
}

pub fn write_pointer(data_root: &DataRoot, id: &str) -> Result<()> {
    validate_session_id(id)?;
    fs::create_dir_all(&data_root.root)?;
    let path = data_root.pointer_file();
    let staging = data_root.root.join(format!("tmp_{POINTER_FILE}"));
    let content = serde_json::to_string(&SessionPointer {
        active_session: id.to_string(),
    })?;
    fs::write(&staging, content).with_context(|| format!("Failed to write {:?}", staging))?;
    fs::rename(&staging, &path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// Context of the session the pointer currently names.
pub fn active_session(data_root: &DataRoot) -> Result<SessionContext> {
    let pointer = read_pointer(data_root)?.ok_or_else(|| anyhow!("No active session"))?;
    Ok(data_root.session(&pointer.active_session))
}

pub fn new_session_id(now: DateTime<Local>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Video files directly inside a session root, sorted by path.
pub fn list_videos(session_root: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(session_root)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_video_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    videos.sort();
    videos
}

/// Frame files in a queue directory, in ascending frame index order.
pub fn list_frames(dir: &Path) -> Result<Vec<FrameFile>> {
    let mut frames = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(frames),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", dir)),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(frame) = FrameFile::from_path(&entry.path()) {
            frames.push(frame);
        }
    }
    frames.sort_by_key(|f| f.index);
    Ok(frames)
}

/// Hand a video over to the pipeline as a new active session.
///
/// The video is copied under a non-video staging name and renamed into the
/// session root, then the pointer is switched to the new id.
pub fn register_upload(
    data_root: &DataRoot,
    video: &Path,
    now: DateTime<Local>,
) -> Result<SessionContext> {
    if !is_video_file(video) {
        bail!(
            "Unsupported video format {:?}, expected one of {:?}",
            video,
            VIDEO_EXTENSIONS
        );
    }
    let name = video
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("Invalid video name: {:?}", video))?;

    let id = new_session_id(now);
    let ctx = data_root.session(&id);
    ctx.create_layout()?;

    let staging = ctx.root.join(format!("{name}.part"));
    fs::copy(video, &staging).with_context(|| format!("Failed to copy {:?}", video))?;
    fs::rename(&staging, ctx.root.join(name))?;

    write_pointer(data_root, &id)?;
    tracing::info!("Registered {} as session {}", name, id);
    Ok(ctx)
}

/// Delete every session and the pointer. Returns the number of sessions removed.
pub fn reset_sessions(data_root: &DataRoot) -> Result<usize> {
    match fs::remove_file(data_root.pointer_file()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Failed to remove session pointer"),
    }

    let working = data_root.working_dir();
    if !working.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(&working)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("Failed to remove {:?}", path))?;
            removed += 1;
        }
    }
    tracing::info!("Reset removed {} sessions", removed);
    Ok(removed)
}

/// Move the oldest annotated frame to `last.jpg`.
pub fn take_ready_frame(ctx: &SessionContext) -> Result<Option<PathBuf>> {
    let Some(oldest) = list_frames(&ctx.ready_dir)?.into_iter().next() else {
        return Ok(None);
    };
    let dest = ctx.last_frame_path();
    fs::rename(&oldest.path, &dest)
        .with_context(|| format!("Failed to move {:?} to {:?}", oldest.path, dest))?;
    Ok(Some(dest))
}

/// Publishes the session named by the pointer file to every worker.
pub struct SessionManager {
    data_root: DataRoot,
    tx: watch::Sender<Option<Arc<SessionContext>>>,
}

impl SessionManager {
    pub fn new(data_root: DataRoot) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { data_root, tx }
    }

    pub fn subscribe(&self) -> SessionWatch {
        self.tx.subscribe()
    }

    /// Re-read the pointer and publish the resulting context if it changed.
    pub fn refresh(&self) -> Result<Option<Arc<SessionContext>>> {
        let pointer = match read_pointer(&self.data_root) {
            Ok(pointer) => pointer,
            Err(e) => {
                tracing::warn!("Ignoring session pointer: {:#}", e);
                None
            }
        };
        let current = self.tx.borrow().clone();

        let Some(pointer) = pointer else {
            if let Some(previous) = current {
                tracing::info!("Session {} is no longer active", previous.id);
                self.tx.send_replace(None);
            }
            return Ok(None);
        };

        if let Some(ctx) = current.filter(|c| c.id == pointer.active_session) {
            if !ctx.layout_exists() {
                tracing::warn!("Layout of session {} is missing, recreating", ctx.id);
                ctx.create_layout()?;
            }
            return Ok(Some(ctx));
        }

        let ctx = Arc::new(self.data_root.session(&pointer.active_session));
        ctx.create_layout()?;
        tracing::info!("Active session is now {}", ctx.id);
        self.tx.send_replace(Some(ctx.clone()));
        Ok(Some(ctx))
    }
}

impl PollWorker for SessionManager {
    fn name(&self) -> &'static str {
        "session"
    }

    fn poll(&mut self) -> Result<()> {
        self.refresh().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_session_id_is_timestamp() {
        assert_eq!(new_session_id(fixed_time()), "20240501123045");
    }

    #[test]
    fn test_video_extensions() {
        assert!(is_video_file(Path::new("roll.mp4")));
        assert!(is_video_file(Path::new("roll.MKV")));
        assert!(is_video_file(Path::new("a/b/roll.mov")));
        assert!(!is_video_file(Path::new("roll.jpg")));
        assert!(!is_video_file(Path::new("roll.mp4.part")));
        assert!(!is_video_file(Path::new("roll")));
    }

    #[test]
    fn test_pointer_round_trip_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        assert!(read_pointer(&root).unwrap().is_none());

        write_pointer(&root, "20240501123045").unwrap();
        let pointer = read_pointer(&root).unwrap().unwrap();
        assert_eq!(pointer.active_session, "20240501123045");

        fs::write(root.pointer_file(), "{not json").unwrap();
        assert!(read_pointer(&root).is_err());

        fs::write(root.pointer_file(), r#"{"active_session": "../escape"}"#).unwrap();
        assert!(read_pointer(&root).is_err());
    }

    #[test]
    fn test_register_upload_creates_session() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path().join("data"));
        let video = dir.path().join("roll.mp4");
        fs::write(&video, b"video bytes").unwrap();

        let ctx = register_upload(&root, &video, fixed_time()).unwrap();
        assert_eq!(ctx.id, "20240501123045");
        assert!(ctx.layout_exists());
        assert_eq!(list_videos(&ctx.root), vec![ctx.root.join("roll.mp4")]);
        assert!(!ctx.root.join("roll.mp4.part").exists());
        assert_eq!(active_session(&root).unwrap(), ctx);

        let bad = dir.path().join("notes.txt");
        fs::write(&bad, b"x").unwrap();
        assert!(register_upload(&root, &bad, fixed_time()).is_err());
    }

    #[test]
    fn test_list_videos_is_shallow_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.avi", "a.mp4", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir_all(dir.path().join("frames")).unwrap();
        fs::write(dir.path().join("frames").join("c.mp4"), b"x").unwrap();

        let videos = list_videos(dir.path());
        assert_eq!(
            videos,
            vec![dir.path().join("a.mp4"), dir.path().join("b.avi")]
        );
    }

    #[test]
    fn test_list_frames_sorts_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let names = [
            "frame_1190.jpg",
            "frame_119.jpg",
            "frame_0.jpg",
            "tmp_frame_238.jpg",
            "x.jpg",
        ];
        for name in names {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let indices: Vec<u64> = list_frames(dir.path()).unwrap().iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 119, 1190]);
        assert!(list_frames(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_take_ready_frame_moves_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = DataRoot::new(dir.path()).session("s1");
        ctx.create_layout().unwrap();
        assert!(take_ready_frame(&ctx).unwrap().is_none());

        fs::write(ctx.ready_dir.join("frame_238.jpg"), b"later").unwrap();
        fs::write(ctx.ready_dir.join("frame_119.jpg"), b"first").unwrap();

        let taken = take_ready_frame(&ctx).unwrap().unwrap();
        assert_eq!(taken, ctx.last_frame_path());
        assert_eq!(fs::read(&taken).unwrap(), b"first");
        assert!(ctx.ready_dir.join("frame_238.jpg").exists());
    }

    #[test]
    fn test_reset_removes_sessions_and_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        assert_eq!(reset_sessions(&root).unwrap(), 0);

        root.session("a").create_layout().unwrap();
        root.session("b").create_layout().unwrap();
        write_pointer(&root, "b").unwrap();

        assert_eq!(reset_sessions(&root).unwrap(), 2);
        assert!(!root.pointer_file().exists());
        assert!(read_pointer(&root).unwrap().is_none());
    }

    #[test]
    fn test_manager_tracks_pointer_changes() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        let manager = SessionManager::new(root.clone());
        let rx = manager.subscribe();

        assert!(manager.refresh().unwrap().is_none());
        assert!(current_session(&rx).is_none());

        write_pointer(&root, "one").unwrap();
        manager.refresh().unwrap();
        let ctx = current_session(&rx).unwrap();
        assert_eq!(ctx.id, "one");
        assert!(ctx.layout_exists());

        // Layout deleted under an unchanged pointer is recreated
        fs::remove_dir_all(&ctx.root).unwrap();
        manager.refresh().unwrap();
        assert!(ctx.layout_exists());

        write_pointer(&root, "two").unwrap();
        manager.refresh().unwrap();
        assert_eq!(current_session(&rx).unwrap().id, "two");
        // Held contexts are snapshots
        assert_eq!(ctx.id, "one");

        fs::write(root.pointer_file(), "garbage").unwrap();
        assert!(manager.refresh().unwrap().is_none());
        assert!(current_session(&rx).is_none());
    }
}

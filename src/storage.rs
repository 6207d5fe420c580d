use crate::config::ImageFormat;
use crate::error::StorageError;
use crate::frame::Frame;
use crate::record::{encode_line, SampleRow, HEADER};
use crate::sampler::Point;
use anyhow::Result;
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

pub const IMAGE_DIR: &str = "images";
pub const METADATA_FILE: &str = "session.json";
const MAX_ID_SUFFIX: u32 = 100;

pub fn session_stamp(start: &DateTime<Local>) -> String {
    start.format("%Y-%m-%d_%H-%M-%S").to_string()
}

pub fn record_file_name(session_id: &str) -> String {
    format!("rgb_points_{}.csv", session_id)
}

/// A session id names exactly one directory directly under the data root.
pub fn is_valid_session_id(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !id.contains(['/', '\\'])
}

/// Settings frozen into a session when it is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub record_interval_secs: f64,
    pub image_interval_secs: f64,
    pub save_image: bool,
    pub image_format: ImageFormat,
    pub jpeg_quality: u8,
    pub points: Vec<Point>,
}

/// Contents of `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub start_time: String,
    pub start_unix_ms: i64,
    pub end_time: Option<String>,
    pub end_unix_ms: Option<i64>,
    pub rows_written: u64,
    pub images_written: u64,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub start_time: DateTime<Local>,
    pub dir: PathBuf,
    pub record_file: PathBuf,
    pub image_dir: PathBuf,
}

/// Owns one session's record file and image directory. The record file is
/// append-only: a header, then rows, never rewritten.
pub struct SessionStore {
    info: SessionInfo,
    writer: Option<BufWriter<File>>,
    metadata: SessionMetadata,
    /// Rows appended since the last successful flush.
    pending_rows: u64,
}

impl SessionStore {
    /// Creates `<data_root>/<session_id>/` and the record file with its header.
    /// On failure nothing is left open and an empty session directory is removed.
    pub fn open(
        data_root: &Path,
        start: DateTime<Local>,
        settings: SessionSettings,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(data_root).map_err(|source| StorageError::CreateSession {
            path: data_root.to_path_buf(),
            source,
        })?;
        let (id, dir) = create_unique_dir(data_root, &session_stamp(&start))?;

        match Self::init(id, dir.clone(), start, settings) {
            Ok(store) => Ok(store),
            Err(e) => {
                if let Err(rm) = fs::remove_dir_all(&dir) {
                    tracing::warn!("failed to remove partial session {}: {}", dir.display(), rm);
                }
                Err(e)
            }
        }
    }

    fn init(
        id: String,
        dir: PathBuf,
        start: DateTime<Local>,
        settings: SessionSettings,
    ) -> Result<Self, StorageError> {
        let record_file = dir.join(record_file_name(&id));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&record_file)
            .map_err(|source| StorageError::CreateSession {
                path: record_file.clone(),
                source,
            })?;

        let metadata = SessionMetadata {
            session_id: id.clone(),
            start_time: start.to_rfc3339(),
            start_unix_ms: start.timestamp_millis(),
            end_time: None,
            end_unix_ms: None,
            rows_written: 0,
            images_written: 0,
            settings,
        };
        let info = SessionInfo {
            id,
            start_time: start,
            image_dir: dir.join(IMAGE_DIR),
            dir,
            record_file,
        };
        let mut store = SessionStore {
            info,
            writer: Some(BufWriter::new(file)),
            metadata,
            pending_rows: 0,
        };

        store.write_line(&encode_line(&HEADER))?;
        store.flush()?;
        store.write_metadata()?;
        tracing::info!("opened session {} at {}", store.info.id, store.info.dir.display());
        Ok(store)
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.metadata.settings
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Rows known to be on stable storage.
    pub fn rows_written(&self) -> u64 {
        self.metadata.rows_written
    }

    pub fn images_written(&self) -> u64 {
        self.metadata.images_written
    }

    pub fn append_row(&mut self, row: &SampleRow) -> Result<(), StorageError> {
        self.write_line(&encode_line(&row.fields()))?;
        self.pending_rows += 1;
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), StorageError> {
        let writer = self.writer.as_mut().ok_or(StorageError::Closed)?;
        writer.write_all(line.as_bytes()).map_err(|source| StorageError::Write {
            path: self.info.record_file.clone(),
            source,
        })
    }

    /// Pushes buffered rows to the file and syncs them to stable storage.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        let writer = self.writer.as_mut().ok_or(StorageError::Closed)?;
        let path = &self.info.record_file;
        writer.flush().map_err(|source| StorageError::Flush {
            path: path.clone(),
            source,
        })?;
        writer.get_ref().sync_data().map_err(|source| StorageError::Flush {
            path: path.clone(),
            source,
        })?;
        self.metadata.rows_written += self.pending_rows;
        self.pending_rows = 0;
        Ok(())
    }

    /// Flushes and releases the record file, then stamps the end time into the
    /// session metadata. Calling it again is a no-op.
    pub fn close(&mut self, ended: DateTime<Local>) -> Result<(), StorageError> {
        if self.writer.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        self.writer = None;
        flushed?;

        self.metadata.end_time = Some(ended.to_rfc3339());
        self.metadata.end_unix_ms = Some(ended.timestamp_millis());
        self.write_metadata()?;
        tracing::info!(
            "closed session {} ({} rows, {} images)",
            self.info.id,
            self.metadata.rows_written,
            self.metadata.images_written
        );
        Ok(())
    }

    /// Encodes the frame under the image directory as `<stem>.<ext>` and
    /// returns the path written. An existing image is never replaced; a
    /// clashing stem gets a `_2`, `_3`, ... suffix.
    pub fn save_image(
        &mut self,
        frame: &Frame,
        stem: &str,
        format: ImageFormat,
        quality: u8,
    ) -> Result<PathBuf, StorageError> {
        let dir = &self.info.image_dir;
        fs::create_dir_all(dir).map_err(|e| StorageError::Image {
            path: dir.clone(),
            detail: e.to_string(),
        })?;
        let (path, file) = create_unique_file(dir, stem, format.extension())?;
        let image_err = |detail: String| StorageError::Image {
            path: path.clone(),
            detail,
        };

        let mut w = BufWriter::new(file);
        let rgb = frame.to_rgb();
        let (width, height) = (frame.width, frame.height);
        let encoded = match format {
            ImageFormat::Jpeg => JpegEncoder::new_with_quality(&mut w, quality).write_image(
                &rgb,
                width,
                height,
                ExtendedColorType::Rgb8,
            ),
            ImageFormat::Png => {
                PngEncoder::new(&mut w).write_image(&rgb, width, height, ExtendedColorType::Rgb8)
            }
        };
        encoded.map_err(|e| image_err(e.to_string()))?;
        w.flush().map_err(|e| image_err(e.to_string()))?;

        self.metadata.images_written += 1;
        Ok(path)
    }

    fn write_metadata(&self) -> Result<(), StorageError> {
        let path = self.info.dir.join(METADATA_FILE);
        let tmp_path = self.info.dir.join(format!("{}.tmp", METADATA_FILE));
        let meta_err = |detail: String| StorageError::Metadata {
            path: path.clone(),
            detail,
        };

        let json =
            serde_json::to_string_pretty(&self.metadata).map_err(|e| meta_err(e.to_string()))?;
        fs::write(&tmp_path, json).map_err(|e| meta_err(e.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|e| meta_err(e.to_string()))
    }

    /// Takes the record writer away so later writes fail as if the file were gone.
    #[cfg(test)]
    pub(crate) fn detach_writer(&mut self) -> Option<BufWriter<File>> {
        self.writer.take()
    }

    #[cfg(test)]
    pub(crate) fn attach_writer(&mut self, writer: BufWriter<File>) {
        self.writer = Some(writer);
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if let Some(mut w) = self.writer.take() {
            if let Err(e) = w.flush() {
                tracing::error!("session {} dropped with unflushed rows: {}", self.info.id, e);
            }
        }
    }
}

fn create_unique_dir(data_root: &Path, stamp: &str) -> Result<(String, PathBuf), StorageError> {
    for n in 1..=MAX_ID_SUFFIX {
        let id = if n == 1 {
            stamp.to_string()
        } else {
            format!("{}_{}", stamp, n)
        };
        let dir = data_root.join(&id);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((id, dir)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(StorageError::CreateSession { path: dir, source }),
        }
    }
    Err(StorageError::CreateSession {
        path: data_root.join(stamp),
        source: io::Error::new(io::ErrorKind::AlreadyExists, "no free session id for this second"),
    })
}

fn create_unique_file(dir: &Path, stem: &str, ext: &str) -> Result<(PathBuf, File), StorageError> {
    for n in 1..=MAX_ID_SUFFIX {
        let name = if n == 1 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{}_{}.{}", stem, n, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(StorageError::Image {
                    path,
                    detail: e.to_string(),
                })
            }
        }
    }
    Err(StorageError::Image {
        path: dir.join(format!("{}.{}", stem, ext)),
        detail: "no free image name for this timestamp".into(),
    })
}

/// Session directories under `data_root` (those holding their record file),
/// sorted by id.
pub fn list_sessions(data_root: &Path) -> Result<Vec<PathBuf>> {
    if !data_root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(data_root)? {
        let p = entry?.path();
        if !p.is_dir() {
            continue;
        }
        if let Some(name) = p.file_name().and_then(|s| s.to_str()) {
            if p.join(record_file_name(name)).is_file() {
                out.push(p);
            }
        }
    }
    out.sort();
    Ok(out)
}

pub fn read_metadata(session_dir: &Path) -> Result<SessionMetadata> {
    let data = fs::read_to_string(session_dir.join(METADATA_FILE))?;
    Ok(serde_json::from_str(&data)?)
}

pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::record::read_records;
    use crate::sampler::Rgb;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn settings() -> SessionSettings {
        SessionSettings {
            record_interval_secs: 1.0,
            image_interval_secs: 10.0,
            save_image: true,
            image_format: ImageFormat::Jpeg,
            jpeg_quality: 90,
            points: vec![Point::new("p1", 10, 10)],
        }
    }

    fn start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 19, 14, 3, 7).unwrap()
    }

    fn row(id: &str, rgb: Option<Rgb>) -> SampleRow {
        SampleRow {
            timestamp_iso: "2026-10-19T14:03:07.000".into(),
            unix_ms: start().timestamp_millis(),
            image_path: String::new(),
            point_id: id.into(),
            x: 10,
            y: 10,
            rgb,
        }
    }

    #[test]
    fn test_open_creates_layout_and_header() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let store = SessionStore::open(tmpdir.path(), start(), settings())?;

        let info = store.info();
        assert_eq!(info.id, "2026-10-19_14-03-07");
        assert_eq!(info.dir, tmpdir.path().join("2026-10-19_14-03-07"));
        assert_eq!(info.record_file, info.dir.join("rgb_points_2026-10-19_14-03-07.csv"));
        assert!(!info.image_dir.exists(), "image dir is created lazily");

        let text = fs::read_to_string(&info.record_file)?;
        assert_eq!(text, "timestamp_iso,unix_ms,image_path,point_id,x,y,R,G,B\r\n");

        let meta = read_metadata(&info.dir)?;
        assert_eq!(meta.session_id, info.id);
        assert!(meta.end_time.is_none());
        Ok(())
    }

    #[test]
    fn test_append_flush_close() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let mut store = SessionStore::open(tmpdir.path(), start(), settings())?;
        store.append_row(&row("p1", Some(Rgb { r: 1, g: 2, b: 3 })))?;
        store.append_row(&row("oob", None))?;
        store.flush()?;

        let (rows, _) = read_records(&store.info().record_file)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].rgb, None);

        let end = start() + chrono::Duration::seconds(30);
        store.close(end)?;
        assert!(!store.is_open());
        store.close(end)?;

        assert!(matches!(store.append_row(&row("p1", None)), Err(StorageError::Closed)));
        let meta = read_metadata(&store.info().dir)?;
        assert_eq!(meta.rows_written, 2);
        assert_eq!(meta.end_unix_ms, Some(end.timestamp_millis()));
        Ok(())
    }

    #[test]
    fn test_same_second_gets_suffixed_id() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let a = SessionStore::open(tmpdir.path(), start(), settings())?;
        let b = SessionStore::open(tmpdir.path(), start(), settings())?;
        assert_eq!(a.info().id, "2026-10-19_14-03-07");
        assert_eq!(b.info().id, "2026-10-19_14-03-07_2");
        assert!(b.info().record_file.ends_with("rgb_points_2026-10-19_14-03-07_2.csv"));
        Ok(())
    }

    #[test]
    fn test_open_fails_on_unwritable_root() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let blocker = tmpdir.path().join("not-a-dir");
        fs::write(&blocker, b"x")?;
        let err = SessionStore::open(&blocker, start(), settings()).err().unwrap();
        assert!(matches!(err, StorageError::CreateSession { .. }));
        Ok(())
    }

    #[test]
    fn test_save_image_jpeg_and_png() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let mut store = SessionStore::open(tmpdir.path(), start(), settings())?;
        let frame = Frame::filled(16, 8, PixelFormat::Bgr, [10, 50, 200]);

        let jpg = store.save_image(&frame, "1000", ImageFormat::Jpeg, 80)?;
        assert_eq!(jpg, store.info().image_dir.join("1000.jpg"));
        let png = store.save_image(&frame, "2000", ImageFormat::Png, 80)?;

        let decoded = image::open(&png)?.into_rgb8();
        assert_eq!(decoded.get_pixel(3, 3).0, [200, 50, 10]);
        assert_eq!(image::open(&jpg)?.width(), 16);
        assert_eq!(store.images_written(), 2);
        Ok(())
    }

    #[test]
    fn test_list_sessions_and_checksum() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let a = SessionStore::open(tmpdir.path(), start(), settings())?;
        let later = start() + chrono::Duration::seconds(5);
        let b = SessionStore::open(tmpdir.path(), later, settings())?;
        fs::create_dir(tmpdir.path().join("stray"))?;

        let sessions = list_sessions(tmpdir.path())?;
        assert_eq!(sessions, vec![a.info().dir.clone(), b.info().dir.clone()]);

        let c1 = file_checksum(&a.info().record_file)?;
        let c2 = file_checksum(&b.info().record_file)?;
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64);
        Ok(())
    }

    #[test]
    fn test_save_image_never_overwrites() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let mut store = SessionStore::open(tmpdir.path(), start(), settings())?;
        let red = Frame::filled(4, 4, PixelFormat::Rgb, [255, 0, 0]);
        let blue = Frame::filled(4, 4, PixelFormat::Rgb, [0, 0, 255]);

        let first = store.save_image(&red, "1000", ImageFormat::Png, 90)?;
        let second = store.save_image(&blue, "1000", ImageFormat::Png, 90)?;
        assert_eq!(second, store.info().image_dir.join("1000_2.png"));
        assert_eq!(image::open(&first)?.into_rgb8().get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image::open(&second)?.into_rgb8().get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(fs::read_dir(&store.info().image_dir)?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_rows_counted_only_after_flush() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let mut store = SessionStore::open(tmpdir.path(), start(), settings())?;
        store.append_row(&row("p1", None))?;
        assert_eq!(store.rows_written(), 0);
        store.flush()?;
        assert_eq!(store.rows_written(), 1);

        store.append_row(&row("oob", None))?;
        let writer = store.detach_writer().unwrap();
        assert!(matches!(store.flush(), Err(StorageError::Closed)));
        assert_eq!(store.rows_written(), 1);

        store.attach_writer(writer);
        store.close(start())?;
        assert_eq!(read_metadata(&store.info().dir)?.rows_written, 2);
        assert_eq!(read_records(&store.info().record_file)?.0.len(), 2);
        Ok(())
    }

    #[test]
    fn test_session_id_validation() {
        assert!(is_valid_session_id("2026-10-19_14-03-07"));
        assert!(is_valid_session_id("2026-10-19_14-03-07_2"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("."));
        assert!(!is_valid_session_id(".."));
        assert!(!is_valid_session_id("../data/2026-10-19_14-03-07"));
        assert!(!is_valid_session_id("/tmp/2026-10-19_14-03-07"));
        assert!(!is_valid_session_id("a\\b"));
    }
}

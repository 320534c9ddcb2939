//! On-the-fly archive downloads of a directory subtree.
//!
//! The tree is walked once, in file-name order, and every entry is written to
//! the sink as soon as it is read. Nothing is staged on disk and the only
//! per-job memory is the copy buffer plus the encoders' own windows.
//!
//! Once the first byte has left, a failing entry (for example a file removed
//! by a concurrent delete) can only abort the stream: the client sees a
//! truncated archive without an end marker, and the failure is logged.

use std::cell::Cell;
use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use axum::body::Body;
use chrono::{DateTime, Datelike, Local, Timelike};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, error, info};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::FileServerError;
use crate::resolve::relative_slash_path;

/// Entries at or above this size need zip64 headers.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "application/x-tar+gzip",
            ArchiveFormat::Zip => "application/zip",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }

    /// Download name: the archived directory's own name plus the extension.
    pub fn file_name(self, path: &Path) -> String {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        format!("{}.{}", base, self.extension())
    }

    /// `Content-Disposition` value; quotes in the name are replaced.
    pub fn content_disposition(self, path: &Path) -> String {
        let safe_name = self.file_name(path).replace('"', "'");
        format!("attachment; filename=\"{}\"", safe_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
}

/// One filesystem entry as it goes into the archive.
struct ArchiveEntry {
    /// Path relative to the archive root, `/`-separated
    name: String,
    path: PathBuf,
    kind: EntryKind,
    metadata: Metadata,
}

impl ArchiveEntry {
    fn mode(&self) -> u32 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            self.metadata.permissions().mode() & 0o7777
        }
        #[cfg(not(unix))]
        {
            match self.kind {
                EntryKind::Directory => 0o755,
                EntryKind::File => 0o644,
            }
        }
    }

    fn modified(&self) -> SystemTime {
        self.metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

/// Walk `root` and hand every directory and regular file to `visit`.
///
/// A directory root contributes only its descendants; a file root contributes
/// itself under its own name. Symbolic links and special files are skipped.
fn walk_entries<F>(root: &Path, mut visit: F) -> Result<(), FileServerError>
where
    F: FnMut(ArchiveEntry) -> Result<(), FileServerError>,
{
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let file_type = entry.file_type();

        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            debug!("Skipping non-regular entry: {}", entry.path().display());
            continue;
        };

        let name = if entry.depth() == 0 {
            if kind == EntryKind::Directory {
                continue;
            }
            entry.file_name().to_string_lossy().to_string()
        } else {
            relative_slash_path(root, entry.path())
        };

        let metadata = entry.metadata().map_err(io::Error::from)?;
        visit(ArchiveEntry {
            name,
            path: entry.path().to_path_buf(),
            kind,
            metadata,
        })?;
    }

    Ok(())
}

/// Copy `reader` into `writer` through the caller's buffer.
fn copy_with_buffer<R: Read, W: Write>(
    buffer: &mut [u8],
    reader: &mut R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut copied = 0u64;
    loop {
        let n = match reader.read(buffer) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        writer.write_all(&buffer[..n])?;
        copied += n as u64;
    }
}

/// Reader that yields exactly `remaining` bytes or fails.
///
/// Tar headers carry the size up front, so a file that shrinks while it is
/// being read must abort the stream instead of silently misframing it.
struct ExactReader<R> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while being archived",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn zip_time(modified: SystemTime) -> zip::DateTime {
    let local: DateTime<Local> = modified.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).unwrap_or(1980),
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second().min(59) as u8,
    )
    .unwrap_or_default()
}

fn unix_seconds(modified: SystemTime) -> u64 {
    modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Pass-through sink that refuses every write once `cut` is set.
///
/// The tar, gzip and zip encoders all write their trailers when dropped. After
/// a failed walk the sink is cut first, so a partial tree can never leave as a
/// well-formed archive.
struct CutoffSink<'a, W> {
    inner: W,
    cut: &'a Cell<bool>,
}

impl<W: Write> Write for CutoffSink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cut.get() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "archive aborted"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.cut.get() {
            return Ok(());
        }
        self.inner.flush()
    }
}

fn write_tar_gz<W: Write>(root: &Path, sink: W) -> Result<(), FileServerError> {
    let cut = Cell::new(false);
    let encoder = GzEncoder::new(CutoffSink { inner: sink, cut: &cut }, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    let walked = walk_entries(root, |entry| {
        let mut header = tar::Header::new_gnu();
        header.set_mode(entry.mode());
        header.set_mtime(unix_seconds(entry.modified()));

        match entry.kind {
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                tar.append_data(&mut header, &entry.name, io::empty())?;
            }
            EntryKind::File => {
                let len = entry.metadata.len();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(len);
                let file = File::open(&entry.path)?;
                tar.append_data(&mut header, &entry.name, ExactReader::new(file, len))?;
            }
        }
        Ok(())
    });
    if let Err(err) = walked {
        cut.set(true);
        return Err(err);
    }

    let encoder = tar.into_inner()?;
    let mut sink = encoder.finish()?;
    sink.flush()?;
    Ok(())
}

fn write_zip<W: Write>(root: &Path, sink: W, buffer: &mut [u8]) -> Result<(), FileServerError> {
    let cut = Cell::new(false);
    let mut zip = ZipWriter::new_stream(CutoffSink { inner: sink, cut: &cut });

    let walked = walk_entries(root, |entry| {
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(entry.mode())
            .last_modified_time(zip_time(entry.modified()));

        match entry.kind {
            EntryKind::Directory => {
                zip.add_directory(format!("{}/", entry.name), options)?;
            }
            EntryKind::File => {
                let options = options.large_file(entry.metadata.len() >= ZIP64_THRESHOLD);
                zip.start_file(entry.name.as_str(), options)?;
                let mut input = File::open(&entry.path)?;
                copy_with_buffer(buffer, &mut input, &mut zip)?;
            }
        }
        Ok(())
    });
    if let Err(err) = walked {
        cut.set(true);
        return Err(err);
    }

    let mut sink = zip.finish()?;
    sink.flush()?;
    Ok(())
}

/// Write `root` as a `format` archive into `sink`.
///
/// `buffer` is the copy buffer reused for every zip entry. Tar entries are
/// copied by `tar::Builder` through its own fixed-size buffer, so the
/// configured size only shapes the zip path; both stay bounded.
///
/// On error nothing more is written, so the output ends without the format's
/// end marker.
pub fn stream_archive<W: Write>(
    root: &Path,
    format: ArchiveFormat,
    sink: W,
    buffer: &mut [u8],
) -> Result<(), FileServerError> {
    match format {
        ArchiveFormat::TarGz => write_tar_gz(root, sink),
        ArchiveFormat::Zip => write_zip(root, sink, buffer),
    }
}

/// Response body producing the archive of `root` while it is being read.
///
/// The encoder runs on the blocking pool and writes into an in-memory pipe
/// of `buffer_size` bytes, so it advances only as fast as the client reads.
/// A client disconnect closes the pipe and aborts the walk.
pub fn archive_body(root: PathBuf, format: ArchiveFormat, buffer_size: usize) -> Body {
    let (reader, writer) = tokio::io::duplex(buffer_size);

    tokio::task::spawn_blocking(move || {
        let sink = SyncIoBridge::new(writer);
        let mut buffer = vec![0u8; buffer_size];

        match stream_archive(&root, format, sink, &mut buffer) {
            Ok(()) => info!("Streamed {} archive of {}", format.extension(), root.display()),
            Err(err) => {
                let failure = FileServerError::StreamingFailure(err.to_string());
                error!("{} ({})", failure, root.display());
            }
        }
    });

    Body::from_stream(ReaderStream::with_capacity(reader, buffer_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::HttpBody;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::pin::Pin;
    use tempfile::TempDir;
    use zip::ZipArchive;

    /// Sink that accepts `limit` bytes, then fails like a dropped connection.
    struct FailingSink {
        written: usize,
        limit: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written >= self.limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
            }
            let n = buf.len().min(self.limit - self.written);
            self.written += n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Sink that deletes `victim` when the first byte arrives, mimicking a
    /// concurrent delete once the response has started.
    struct DeletingSink {
        out: Vec<u8>,
        victim: Option<PathBuf>,
    }

    impl Write for DeletingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(victim) = self.victim.take() {
                std::fs::remove_file(victim)?;
            }
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Incompressible bytes, so the encoder output is as large as the input.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    fn fixture() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("a.txt"), "alpha").unwrap();
        std::fs::write(root.join("b.txt"), "bravo bravo").unwrap();
        std::fs::create_dir_all(root.join("d").join("e")).unwrap();
        std::fs::write(root.join("d").join("inner.txt"), "inner").unwrap();
        temp_dir
    }

    fn zip_entries(bytes: Vec<u8>) -> BTreeMap<String, Option<String>> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entries = BTreeMap::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let name = entry.name().unwrap().to_string();
            if entry.is_dir() {
                entries.insert(name, None);
            } else {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                entries.insert(name, Some(content));
            }
        }
        entries
    }

    fn tar_entries(bytes: Vec<u8>) -> BTreeMap<String, Option<String>> {
        let decoder = flate2::read::GzDecoder::new(Cursor::new(bytes));
        let mut archive = tar::Archive::new(decoder);
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            if entry.header().entry_type().is_dir() {
                entries.insert(name, None);
            } else {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                entries.insert(name, Some(content));
            }
        }
        entries
    }

    #[test]
    fn test_zip_round_trip() {
        let temp_dir = fixture();
        let mut out = Vec::new();
        let mut buffer = vec![0u8; 16];

        stream_archive(temp_dir.path(), ArchiveFormat::Zip, &mut out, &mut buffer).unwrap();

        let entries = zip_entries(out);
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "d/", "d/e/", "d/inner.txt"]);
        assert_eq!(entries["a.txt"].as_deref(), Some("alpha"));
        assert_eq!(entries["b.txt"].as_deref(), Some("bravo bravo"));
        assert_eq!(entries["d/inner.txt"].as_deref(), Some("inner"));
    }

    #[test]
    fn test_tar_gz_round_trip() {
        let temp_dir = fixture();
        let mut out = Vec::new();
        let mut buffer = vec![0u8; 16];

        stream_archive(temp_dir.path(), ArchiveFormat::TarGz, &mut out, &mut buffer).unwrap();

        let entries = tar_entries(out);
        assert_eq!(entries["a.txt"].as_deref(), Some("alpha"));
        assert_eq!(entries["b.txt"].as_deref(), Some("bravo bravo"));
        assert_eq!(entries["d/inner.txt"].as_deref(), Some("inner"));
        assert!(entries.keys().any(|k| k.trim_end_matches('/') == "d"));
        assert!(entries.keys().any(|k| k.trim_end_matches('/') == "d/e"));
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn test_file_root_archives_itself() {
        let temp_dir = fixture();
        let mut out = Vec::new();
        let mut buffer = vec![0u8; 64];

        stream_archive(
            &temp_dir.path().join("a.txt"),
            ArchiveFormat::Zip,
            &mut out,
            &mut buffer,
        )
        .unwrap();

        let entries = zip_entries(out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["a.txt"].as_deref(), Some("alpha"));
    }

    #[test]
    fn test_empty_directory_is_valid_archive() {
        let temp_dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        let mut buffer = vec![0u8; 64];

        stream_archive(temp_dir.path(), ArchiveFormat::Zip, &mut out, &mut buffer).unwrap();
        assert!(zip_entries(out).is_empty());

        let mut out = Vec::new();
        stream_archive(temp_dir.path(), ArchiveFormat::TarGz, &mut out, &mut buffer).unwrap();
        assert!(tar_entries(out).is_empty());
    }

    #[test]
    fn test_missing_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        let mut buffer = vec![0u8; 64];

        let result = stream_archive(
            &temp_dir.path().join("gone"),
            ArchiveFormat::TarGz,
            &mut out,
            &mut buffer,
        );
        assert!(matches!(result, Err(FileServerError::Io(_))));
    }

    #[test]
    fn test_exact_reader_detects_short_file() {
        let mut reader = ExactReader::new(Cursor::new(b"abc".to_vec()), 5);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut reader = ExactReader::new(Cursor::new(b"abcdef".to_vec()), 4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn test_download_names() {
        let path = Path::new("/data/sub");
        assert_eq!(ArchiveFormat::Zip.file_name(path), "sub.zip");
        assert_eq!(ArchiveFormat::TarGz.file_name(path), "sub.tar.gz");
        assert_eq!(
            ArchiveFormat::Zip.content_disposition(Path::new("/data/we\"ird")),
            "attachment; filename=\"we'ird.zip\""
        );
    }

    #[tokio::test]
    async fn test_archive_body_streams_complete_zip() {
        let temp_dir = fixture();
        let body = archive_body(temp_dir.path().to_path_buf(), ArchiveFormat::Zip, 4096);
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();

        let entries = zip_entries(bytes.to_vec());
        assert_eq!(entries["d/inner.txt"].as_deref(), Some("inner"));
    }

    #[test]
    fn test_failing_sink_aborts_stream() {
        let temp_dir = fixture();
        let mut buffer = vec![0u8; 64];

        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz] {
            for limit in [0, 16, 64] {
                let sink = FailingSink { written: 0, limit };
                let result = stream_archive(temp_dir.path(), format, sink, &mut buffer);
                assert!(result.is_err(), "{:?} with limit {}", format, limit);
            }
        }
    }

    #[test]
    fn test_vanished_entry_leaves_no_end_marker() {
        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz] {
            let temp_dir = TempDir::new().unwrap();
            std::fs::write(temp_dir.path().join("a.bin"), noise(256 * 1024)).unwrap();
            std::fs::write(temp_dir.path().join("b.txt"), "bravo").unwrap();

            let mut sink = DeletingSink {
                out: Vec::new(),
                victim: Some(temp_dir.path().join("b.txt")),
            };
            let mut buffer = vec![0u8; 4096];

            let result = stream_archive(temp_dir.path(), format, &mut sink, &mut buffer);
            assert!(result.is_err(), "{:?}", format);
            assert!(!sink.out.is_empty());

            match format {
                ArchiveFormat::Zip => {
                    assert!(ZipArchive::new(Cursor::new(sink.out)).is_err());
                }
                ArchiveFormat::TarGz => {
                    let mut tar_bytes = Vec::new();
                    let decoded = flate2::read::GzDecoder::new(Cursor::new(sink.out))
                        .read_to_end(&mut tar_bytes);
                    assert!(decoded.is_err() || !tar_bytes.ends_with(&[0u8; 1024]));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_archive_body_truncated_when_entry_vanishes() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.bin"), noise(1024 * 1024)).unwrap();
        std::fs::write(temp_dir.path().join("b.txt"), "bravo").unwrap();

        let mut body = archive_body(temp_dir.path().to_path_buf(), ArchiveFormat::Zip, 4096);
        let first = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx))
            .await
            .unwrap()
            .unwrap();
        let mut bytes = first.into_data().unwrap().to_vec();

        // The encoder is parked on the full pipe inside a.bin, after the
        // directory was read but before b.txt is reached.
        std::fs::remove_file(temp_dir.path().join("b.txt")).unwrap();

        let rest = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        bytes.extend_from_slice(&rest);

        assert!(bytes.len() > 512 * 1024);
        let tail = &bytes[bytes.len() - 22..];
        assert_ne!(&tail[..4], b"PK\x05\x06");
        assert!(ZipArchive::new(Cursor::new(bytes)).is_err());
    }
}

//! Container files on disk: naming, serial numbers, directory selection.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::compression::CompressionKind;
use crate::record::{timestamp14, ArchiveFormat};

/// Suffix carried by a file while it is being written.
pub const OCCUPIED_SUFFIX: &str = ".open";

/// Suffix given to files whose writer was invalidated.
pub const INVALID_SUFFIX: &str = ".invalid";

/// Shared serial-number counter for container file names.
///
/// Clones share the same counter, so every writer created from one factory
/// draws from a single sequence.
#[derive(Debug, Clone, Default)]
pub struct SerialNumber(Arc<AtomicU64>);

impl SerialNumber {
    /// Counter whose next value is `start`.
    pub fn new(start: u64) -> Self {
        SerialNumber(Arc::new(AtomicU64::new(start)))
    }

    /// Take the next serial number.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Value the next call to [`SerialNumber::next`] will return.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builds container file names.
#[derive(Debug, Clone)]
pub struct ContainerNamer {
    prefix: String,
    suffix: Option<String>,
    format: ArchiveFormat,
    compression: CompressionKind,
}

impl ContainerNamer {
    /// Namer for the given settings; `${HOSTNAME}` in the suffix is expanded.
    pub fn new(
        prefix: &str,
        suffix: Option<&str>,
        format: ArchiveFormat,
        compression: CompressionKind,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.filter(|s| !s.is_empty()).map(expand_suffix),
            format,
            compression,
        }
    }

    /// `{prefix}-{serial:05}-{timestamp}[-{suffix}].{ext}[.gz|.zst]`
    pub fn name(&self, serial: u64, created: &DateTime<Utc>) -> String {
        let mut name = format!("{}-{:05}-{}", self.prefix, serial, timestamp14(created));
        if let Some(suffix) = &self.suffix {
            name.push('-');
            name.push_str(suffix);
        }
        name.push('.');
        name.push_str(self.format.extension());
        if let Some(ext) = self.compression.extension() {
            name.push('.');
            name.push_str(ext);
        }
        name
    }
}

fn expand_suffix(template: &str) -> String {
    if !template.contains("${HOSTNAME}") {
        return template.to_string();
    }
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    template.replace("${HOSTNAME}", &host)
}

/// Round-robin choice among candidate output directories.
#[derive(Debug)]
pub struct DirectoryRotation {
    dirs: Vec<PathBuf>,
    cursor: AtomicUsize,
}

impl DirectoryRotation {
    /// Rotation over `dirs`.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Candidate directories.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Create `name` plus the occupied suffix in the next usable directory.
    ///
    /// Directories that cannot be created or written are skipped.
    pub fn create(&self, name: &str) -> io::Result<(PathBuf, File)> {
        if self.dirs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no output directories configured"));
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.dirs.len() {
            let dir = &self.dirs[(start + i) % self.dirs.len()];
            if let Err(e) = fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "skipping unusable output directory");
                continue;
            }
            let final_path = dir.join(name);
            let open_path = with_suffix(&final_path, OCCUPIED_SUFFIX);
            match OpenOptions::new().write(true).create_new(true).open(&open_path) {
                Ok(file) => return Ok((final_path, file)),
                Err(e) => {
                    warn!(path = %open_path.display(), error = %e, "skipping unusable output directory");
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("directories unusable: {:?}", self.dirs),
        ))
    }
}

/// `path` with `suffix` appended to its file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// One container file open for append.
pub struct ContainerFile {
    path: PathBuf,
    serial: u64,
    out: BufWriter<File>,
    size: u64,
    content_records: u64,
    compressed: bool,
}

impl ContainerFile {
    /// Create the next container under `dirs`.
    pub fn create(
        dirs: &DirectoryRotation,
        namer: &ContainerNamer,
        serial: u64,
        compressed: bool,
    ) -> io::Result<Self> {
        let name = namer.name(serial, &Utc::now());
        let (path, file) = dirs.create(&name)?;
        info!(path = %path.display(), serial, "opened container file");
        Ok(Self {
            path,
            serial,
            out: BufWriter::new(file),
            size: 0,
            content_records: 0,
            compressed,
        })
    }

    /// Final path, without the occupied suffix.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the final path.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Serial number embedded in the name.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Bytes written so far, descriptor included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether records are framed.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// True once a record other than the descriptor was written.
    pub fn has_content(&self) -> bool {
        self.content_records > 0
    }

    /// Count one non-descriptor record.
    pub fn mark_content_record(&mut self) {
        self.content_records += 1;
    }

    /// Flush and drop the occupied suffix.
    pub fn close(mut self) -> io::Result<PathBuf> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        fs::rename(with_suffix(&self.path, OCCUPIED_SUFFIX), &self.path)?;
        info!(path = %self.path.display(), size = self.size, records = self.content_records, "closed container file");
        Ok(self.path)
    }

    /// Flush what can be flushed and rename with the invalid suffix.
    pub fn invalidate(mut self) -> io::Result<PathBuf> {
        if let Err(e) = self.out.flush() {
            debug!(path = %self.path.display(), error = %e, "flush failed while invalidating");
        }
        let invalid = with_suffix(&self.path, INVALID_SUFFIX);
        fs::rename(with_suffix(&self.path, OCCUPIED_SUFFIX), &invalid)?;
        warn!(path = %invalid.display(), size = self.size, "invalidated container file");
        Ok(invalid)
    }
}

impl Write for ContainerFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.out.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_serial_number_shared() {
        let a = SerialNumber::new(7);
        let b = a.clone();
        assert_eq!(a.next(), 7);
        assert_eq!(b.next(), 8);
        assert_eq!(a.peek(), 9);
        assert_eq!(SerialNumber::default().next(), 0);
    }

    #[test]
    fn test_name_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let namer = ContainerNamer::new("CRAWL", Some("node1"), ArchiveFormat::Warc, CompressionKind::Gzip);
        assert_eq!(namer.name(42, &ts), "CRAWL-00042-20240506070809-node1.warc.gz");

        let namer = ContainerNamer::new("CRAWL", None, ArchiveFormat::Arc, CompressionKind::None);
        assert_eq!(namer.name(3, &ts), "CRAWL-00003-20240506070809.arc");

        let namer = ContainerNamer::new("X", Some(""), ArchiveFormat::Warc, CompressionKind::Zstd { level: 3 });
        assert_eq!(namer.name(0, &ts), "X-00000-20240506070809.warc.zst");
    }

    #[test]
    fn test_create_close_renames() {
        let dir = TempDir::new().unwrap();
        let rotation = DirectoryRotation::new(vec![dir.path().to_path_buf()]);
        let namer = ContainerNamer::new("T", None, ArchiveFormat::Warc, CompressionKind::None);
        let mut file = ContainerFile::create(&rotation, &namer, 1, false).unwrap();
        let open_path = with_suffix(file.path(), OCCUPIED_SUFFIX);
        assert!(open_path.exists());

        file.write_all(b"hello").unwrap();
        assert_eq!(file.size(), 5);
        assert!(!file.has_content());
        file.mark_content_record();
        assert!(file.has_content());

        let path = file.close().unwrap();
        assert!(path.exists());
        assert!(!open_path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_invalidate_renames() {
        let dir = TempDir::new().unwrap();
        let rotation = DirectoryRotation::new(vec![dir.path().to_path_buf()]);
        let namer = ContainerNamer::new("T", None, ArchiveFormat::Arc, CompressionKind::None);
        let file = ContainerFile::create(&rotation, &namer, 1, false).unwrap();
        let invalid = file.invalidate().unwrap();
        assert!(invalid.to_string_lossy().ends_with(".arc.invalid"));
        assert!(invalid.exists());
    }

    #[test]
    fn test_rotation_skips_unusable_dirs() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let good = dir.path().join("good");
        let rotation = DirectoryRotation::new(vec![blocker.clone(), good.clone()]);
        for i in 0..3 {
            let (path, _) = rotation.create(&format!("f{}", i)).unwrap();
            assert!(path.starts_with(&good));
        }
    }

    #[test]
    fn test_all_dirs_unusable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let rotation = DirectoryRotation::new(vec![blocker]);
        let err = rotation.create("f").unwrap_err();
        assert!(err.to_string().contains("directories unusable"));
    }
}

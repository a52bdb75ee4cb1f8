//! Container writer: frames records, appends them, rotates files.
//!
//! Each record becomes header + body + terminator inside one compression
//! frame. Records whose declared length fits in memory are framed into a
//! buffer first, so a failure while reading the source never leaves a partial
//! record on disk. Larger records are streamed straight into the file; a
//! failure there poisons the writer and the caller must invalidate it.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::codec::{self, field};
use crate::compression::FrameWriter;
use crate::config::WriterSettings;
use crate::container::{ContainerFile, ContainerNamer, DirectoryRotation, SerialNumber};
use crate::error::{ArchiveError, ArchiveResult};
use crate::header_block::HeaderBlock;
use crate::record::{ArchiveFormat, Record, RecordId, RecordType};

/// Largest declared body framed in memory before appending.
pub const MAX_BUFFERED_RECORD: u64 = 8 * 1024 * 1024; // 8MB

/// Hook run inside each record's frame after the terminator.
pub trait RecordInterceptor: Send + Sync {
    /// Write extra bytes for `record`; the default writes nothing.
    fn after_record(&self, record: &Record, out: &mut dyn Write) -> io::Result<()>;
}

/// Where a record landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    /// Record kind.
    pub record_type: RecordType,
    /// Record identifier.
    pub id: RecordId,
    /// Target URL.
    pub url: String,
    /// Capture timestamp.
    pub date: DateTime<Utc>,
    /// Payload digest, if any.
    pub payload_digest: Option<String>,
    /// Final path of the container file.
    pub path: PathBuf,
    /// Offset of the record (frame) start.
    pub offset: u64,
    /// Bytes the record occupies on disk.
    pub length: u64,
}

/// Counters for one writer.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WriterStats {
    /// Records written, descriptors excluded.
    pub records_written: u64,
    /// Bytes appended, descriptors included.
    pub bytes_written: u64,
    /// Container files opened.
    pub files_created: u64,
}

/// Creates writers sharing one serial counter and directory rotation.
pub struct WriterFactory {
    settings: Arc<WriterSettings>,
    namer: Arc<ContainerNamer>,
    directories: Arc<DirectoryRotation>,
    serial: SerialNumber,
    interceptor: Option<Arc<dyn RecordInterceptor>>,
    next_id: AtomicU64,
}

impl WriterFactory {
    /// Factory drawing file serial numbers from `serial`.
    pub fn new(settings: WriterSettings, serial: SerialNumber) -> Self {
        let namer = ContainerNamer::new(
            &settings.prefix,
            settings.suffix.as_deref(),
            settings.format,
            settings.compression,
        );
        let directories = DirectoryRotation::new(settings.directories.clone());
        Self {
            settings: Arc::new(settings),
            namer: Arc::new(namer),
            directories: Arc::new(directories),
            serial,
            interceptor: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Install an interceptor on every writer created afterwards.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn RecordInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Shared settings.
    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    /// Shared serial counter.
    pub fn serial(&self) -> &SerialNumber {
        &self.serial
    }

    /// New writer. No file is opened until the first write.
    pub fn create(&self) -> ArchiveWriter {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(writer = id, "created archive writer");
        ArchiveWriter {
            id,
            settings: Arc::clone(&self.settings),
            namer: Arc::clone(&self.namer),
            directories: Arc::clone(&self.directories),
            serial: self.serial.clone(),
            interceptor: self.interceptor.clone(),
            current: None,
            completed: Vec::new(),
            stats: WriterStats::default(),
            poisoned: false,
        }
    }
}

/// Owns at most one open container file.
pub struct ArchiveWriter {
    id: u64,
    settings: Arc<WriterSettings>,
    namer: Arc<ContainerNamer>,
    directories: Arc<DirectoryRotation>,
    serial: SerialNumber,
    interceptor: Option<Arc<dyn RecordInterceptor>>,
    current: Option<ContainerFile>,
    completed: Vec<PathBuf>,
    stats: WriterStats,
    poisoned: bool,
}

impl fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("id", &self.id)
            .field("current", &self.current_path())
            .field("completed", &self.completed.len())
            .field("stats", &self.stats)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl ArchiveWriter {
    /// Identifier unique within the factory.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replace the post-write hook.
    pub fn set_interceptor(&mut self, interceptor: Option<Arc<dyn RecordInterceptor>>) {
        self.interceptor = interceptor;
    }

    /// Path of the file currently open, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path())
    }

    /// Size of the file currently open, or 0.
    pub fn current_size(&self) -> u64 {
        self.current.as_ref().map(|f| f.size()).unwrap_or(0)
    }

    /// Files this writer has closed.
    pub fn completed_files(&self) -> &[PathBuf] {
        &self.completed
    }

    /// Counters.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// True after a failure that may have left a partial record on disk.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Append one record, rotating the file as needed.
    pub fn write(&mut self, mut record: Record) -> ArchiveResult<WriteReceipt> {
        if self.poisoned {
            return Err(ArchiveError::Io(io::Error::new(
                io::ErrorKind::Other,
                "writer was poisoned by an earlier failure",
            )));
        }
        let max = self.settings.max_file_size;
        let declared = record.content_length;

        let (offset, length) = if declared <= MAX_BUFFERED_RECORD {
            let framed = self.frame_record(&mut record, Vec::new())?;
            let needs_rotation = self
                .current
                .as_ref()
                .map(|f| f.has_content() && f.size() + framed.len() as u64 > max)
                .unwrap_or(false);
            if needs_rotation {
                self.close_current()?;
            }
            let file = self.ensure_file()?;
            let offset = file.size();
            if let Err(e) = file.write_all(&framed) {
                self.poisoned = true;
                return Err(e.into());
            }
            (offset, framed.len() as u64)
        } else {
            let needs_rotation = self
                .current
                .as_ref()
                .map(|f| f.has_content() && (f.size() + declared > max || declared > max))
                .unwrap_or(false);
            if needs_rotation {
                self.close_current()?;
            }
            // Encode the header before touching the file so format errors leave it clean.
            codec::encode_header(self.settings.format, &record)?;
            let mut file = match self.current.take() {
                Some(f) => f,
                None => {
                    self.ensure_file()?;
                    self.current.take().ok_or_else(|| {
                        ArchiveError::Io(io::Error::new(io::ErrorKind::Other, "no container file open"))
                    })?
                }
            };
            let offset = file.size();
            let result = self.frame_record(&mut record, &mut file).map(|_| ());
            let length = file.size() - offset;
            self.current = Some(file);
            if let Err(e) = result {
                self.poisoned = true;
                return Err(e);
            }
            (offset, length)
        };

        let file = self.current.as_mut().ok_or_else(|| {
            ArchiveError::Io(io::Error::new(io::ErrorKind::Other, "no container file open"))
        })?;
        file.mark_content_record();
        let path = file.path().to_path_buf();
        let size = file.size();
        self.stats.records_written += 1;
        self.stats.bytes_written += length;
        trace!(writer = self.id, url = %record.url, offset, length, "wrote record");

        if size >= max {
            self.close_current()?;
        }

        Ok(WriteReceipt {
            record_type: record.record_type,
            id: record.id.clone(),
            url: record.url.clone(),
            date: record.date,
            payload_digest: record.payload_digest.clone(),
            path,
            offset,
            length,
        })
    }

    /// Close the open file, if any.
    pub fn close(&mut self) -> ArchiveResult<()> {
        self.close_current()
    }

    /// Close the open file under the invalid suffix and return its path.
    pub fn invalidate(mut self) -> ArchiveResult<Option<PathBuf>> {
        match self.current.take() {
            Some(file) => Ok(Some(file.invalidate()?)),
            None => Ok(None),
        }
    }

    fn close_current(&mut self) -> ArchiveResult<()> {
        if let Some(file) = self.current.take() {
            let path = file.close()?;
            self.completed.push(path);
        }
        Ok(())
    }

    fn ensure_file(&mut self) -> ArchiveResult<&mut ContainerFile> {
        if self.current.is_none() {
            let serial = self.serial.next();
            let mut file = ContainerFile::create(
                &self.directories,
                &self.namer,
                serial,
                self.settings.compression.is_compressed(),
            )?;
            let mut descriptor = descriptor_record(
                self.settings.format,
                &file.file_name(),
                &self.settings.metadata,
            )?;
            // A failed descriptor leaves an unusable file behind.
            if let Err(e) = self.frame_record(&mut descriptor, &mut file) {
                if let Err(inv) = file.invalidate() {
                    warn!(error = %inv, "could not invalidate file after descriptor failure");
                }
                return Err(e);
            }
            self.stats.files_created += 1;
            self.stats.bytes_written += file.size();
            self.current = Some(file);
        }
        self.current.as_mut().ok_or_else(|| {
            ArchiveError::Io(io::Error::new(io::ErrorKind::Other, "no container file open"))
        })
    }

    fn frame_record<W: Write>(&self, record: &mut Record, out: W) -> ArchiveResult<W> {
        let format = self.settings.format;
        let header = codec::encode_header(format, record)?;
        let mut frame = FrameWriter::new(self.settings.compression, out)?;
        frame.write_all(&header)?;

        let declared = record.content_length;
        let source = record.content_mut();
        let copied = codec::read_body(source, declared, &mut frame)?;
        if copied != declared {
            if record.enforce_length && self.settings.enforce_length {
                return Err(ArchiveError::LengthMismatch {
                    expected: declared,
                    actual: copied,
                });
            }
            warn!(url = %record.url, declared, copied, "record body shorter than declared");
        }
        match record.content_mut().remaining() {
            None | Some(0) => {}
            Some(remaining) => {
                return Err(ArchiveError::Gap {
                    expected: declared,
                    remaining,
                })
            }
        }

        frame.write_all(codec::record_terminator(format))?;
        if let Some(interceptor) = &self.interceptor {
            interceptor.after_record(record, &mut frame)?;
        }
        Ok(frame.finish()?)
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if let Some(file) = self.current.take() {
            let result = if self.poisoned {
                file.invalidate().map(|_| ())
            } else {
                file.close().map(|_| ())
            };
            if let Err(e) = result {
                warn!(writer = self.id, error = %e, "failed to close container file on drop");
            }
        }
    }
}

/// Descriptor record opening every container file.
pub fn descriptor_record(
    format: ArchiveFormat,
    file_name: &str,
    metadata: &[String],
) -> ArchiveResult<Record> {
    match format {
        ArchiveFormat::Arc => {
            let version = if metadata.is_empty() { "1 0" } else { "1 1" };
            let mut body = format!(
                "{} InternetArchive\nURL IP-address Archive-date Content-type Archive-length\n",
                version
            );
            for line in metadata {
                body.push_str(line);
                body.push('\n');
            }
            Ok(Record::from_bytes(
                RecordType::Warcinfo,
                format!("filedesc://{}", file_name),
                "text/plain",
                body,
            )
            .with_ip(codec::NO_IP))
        }
        ArchiveFormat::Warc => {
            let body = if metadata.is_empty() {
                let mut block = HeaderBlock::new();
                block.push("software", concat!("arcstore/", env!("CARGO_PKG_VERSION")))?;
                block.push("format", "WARC File Format 1.0")?;
                block.to_bytes()
            } else {
                let mut body = String::new();
                for line in metadata {
                    body.push_str(line);
                    body.push_str("\r\n");
                }
                body.into_bytes()
            };
            Record::from_bytes(RecordType::Warcinfo, "", "application/warc-fields", body)
                .with_header(field::FILENAME, file_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionKind;
    use crate::replay::{ContentSource, ReaderSource};
    use std::io::Read;
    use tempfile::TempDir;

    fn settings(dir: &Path, format: ArchiveFormat, compression: CompressionKind, max: u64) -> WriterSettings {
        WriterSettings {
            prefix: "UNIT".to_string(),
            suffix: None,
            format,
            compression,
            max_file_size: max,
            directories: vec![dir.to_path_buf()],
            metadata: Vec::new(),
            enforce_length: true,
        }
    }

    fn page(i: usize) -> Record {
        let body = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html><body>Page #{}</body></html>\n",
            i
        );
        Record::from_bytes(RecordType::Response, format!("http://www.one.net/id={}", i), "text/html", body)
            .with_ip("0.1.2.3")
    }

    struct Lying {
        inner: ReaderSource<io::Cursor<Vec<u8>>>,
        remaining: i64,
    }

    impl Read for Lying {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl ContentSource for Lying {
        fn remaining(&self) -> Option<i64> {
            Some(self.remaining)
        }
    }

    #[test]
    fn test_lazy_open_and_descriptor() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Arc, CompressionKind::None, 1 << 20),
            SerialNumber::new(0),
        );
        let mut writer = factory.create();
        assert!(writer.current_path().is_none());

        writer.write(page(0)).unwrap();
        let path = writer.current_path().unwrap().to_path_buf();
        writer.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("filedesc://UNIT-00000-"));
        assert!(text.contains("1 0 InternetArchive\n"));
        assert!(text.contains("http://www.one.net/id=0 0.1.2.3 "));
        assert_eq!(writer.stats().records_written, 1);
        assert_eq!(writer.stats().files_created, 1);
    }

    #[test]
    fn test_warcinfo_with_metadata() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path(), ArchiveFormat::Warc, CompressionKind::None, 1 << 20);
        s.metadata = vec!["operator: crawl team".to_string(), "isPartOf: test".to_string()];
        let factory = WriterFactory::new(s, SerialNumber::new(5));
        let mut writer = factory.create();
        writer.write(page(1)).unwrap();
        writer.close().unwrap();

        let path = &writer.completed_files()[0];
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("WARC/1.0\r\nWARC-Type: warcinfo\r\n"));
        assert!(text.contains("WARC-Filename: UNIT-00005-"));
        assert!(text.contains("operator: crawl team\r\nisPartOf: test\r\n"));
        assert!(path.to_string_lossy().ends_with(".warc"));
    }

    #[test]
    fn test_receipt_offsets_increase() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Warc, CompressionKind::Gzip, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        let a = writer.write(page(0)).unwrap();
        let b = writer.write(page(1)).unwrap();
        assert!(a.offset > 0);
        assert_eq!(b.offset, a.offset + a.length);
        assert_eq!(a.path, b.path);
    }

    #[test]
    fn test_rotation_keeps_files_under_max() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Arc, CompressionKind::None, 600),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        for i in 0..10 {
            writer.write(page(i)).unwrap();
        }
        writer.close().unwrap();
        let files = writer.completed_files();
        assert!(files.len() > 1);
        for f in files {
            assert!(std::fs::metadata(f).unwrap().len() <= 600);
        }
    }

    #[test]
    fn test_oversized_record_gets_own_file() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Warc, CompressionKind::None, 2048),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        writer.write(page(0)).unwrap();
        let big = Record::from_bytes(RecordType::Resource, "http://big.example/", "application/octet-stream", vec![b'x'; 10_000]);
        let receipt = writer.write(big).unwrap();
        writer.write(page(1)).unwrap();
        writer.close().unwrap();

        let files = writer.completed_files();
        assert_eq!(files.len(), 3);
        assert_eq!(receipt.path, files[1]);
    }

    #[test]
    fn test_length_mismatch_leaves_file_clean() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Warc, CompressionKind::None, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        writer.write(page(0)).unwrap();
        let before = writer.current_size();

        let mut short = Record::from_bytes(RecordType::Resource, "http://a.example/", "text/plain", "abc");
        short.content_length = 10;
        let err = writer.write(short).unwrap_err();
        assert!(matches!(err, ArchiveError::LengthMismatch { expected: 10, actual: 3 }));
        assert_eq!(writer.current_size(), before);
        assert!(!writer.is_poisoned());
    }

    #[test]
    fn test_gap_detected() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Arc, CompressionKind::Gzip, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        let source = Lying {
            inner: ReaderSource::new(io::Cursor::new(b"content".to_vec())),
            remaining: -1,
        };
        let record = Record::new(RecordType::Response, "http://gap.example/", "text/plain", 7, Box::new(source));
        let err = writer.write(record).unwrap_err();
        assert!(matches!(err, ArchiveError::Gap { expected: 7, remaining: -1 }));
        assert!(err.to_string().contains("mismatch between expected and actual"));
    }

    #[test]
    fn test_undercounted_slice_is_gap() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Warc, CompressionKind::None, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        let mut record = Record::from_bytes(RecordType::Resource, "http://a.example/", "text/plain", "abcdef");
        record.content_length = 4;
        let err = writer.write(record).unwrap_err();
        assert!(matches!(err, ArchiveError::Gap { expected: 4, remaining: 2 }));
    }

    #[test]
    fn test_format_error_before_any_bytes() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Arc, CompressionKind::None, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        let record = Record::from_bytes(RecordType::Response, "http://a.example/ x", "text/plain", "abc");
        assert!(matches!(writer.write(record), Err(ArchiveError::Format { .. })));
        assert!(writer.current_path().is_none());
    }

    #[test]
    fn test_interceptor_appends_inside_frame() {
        struct Junk;
        impl RecordInterceptor for Junk {
            fn after_record(&self, _record: &Record, out: &mut dyn Write) -> io::Result<()> {
                out.write_all(b"JUNK")
            }
        }
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Arc, CompressionKind::None, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        writer.set_interceptor(Some(Arc::new(Junk)));
        writer.write(page(0)).unwrap();
        writer.close().unwrap();
        let text = std::fs::read_to_string(&writer.completed_files()[0]).unwrap();
        assert!(text.ends_with("</html>\n\nJUNK"));
    }

    #[test]
    fn test_invalidate_renames_current() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Warc, CompressionKind::Gzip, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        writer.write(page(0)).unwrap();
        let invalid = writer.invalidate().unwrap().unwrap();
        assert!(invalid.to_string_lossy().ends_with(".warc.gz.invalid"));
    }

    #[test]
    fn test_debug_shows_open_file() {
        let dir = TempDir::new().unwrap();
        let factory = WriterFactory::new(
            settings(dir.path(), ArchiveFormat::Warc, CompressionKind::None, 1 << 20),
            SerialNumber::default(),
        );
        let mut writer = factory.create();
        writer.write(page(0)).unwrap();
        let shown = format!("{:?}", writer);
        assert!(shown.starts_with("ArchiveWriter"));
        assert!(shown.contains(".open"));
        assert!(shown.contains("poisoned: false"));
    }
}

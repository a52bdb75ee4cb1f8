//! Sequential container reader and validator.
//!
//! Compressed files are read one frame at a time; every frame must hold
//! exactly one record. In strict mode the first integrity problem is
//! returned as an error. In lenient mode it is recorded as a warning, the
//! damaged record is still counted when its header was readable, and
//! reading resumes at the next plausible record start.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::codec;
use crate::compression::{CompressionKind, FrameReader};
use crate::error::{ArchiveError, ArchiveResult};
use crate::record::{ArchiveFormat, RecordHeader};

const SCAN_CHUNK: usize = 64 * 1024;
const MAX_PREALLOC: u64 = 1024 * 1024;

/// URL scheme prefixes that can open a legacy header line.
const ARC_LINE_PREFIXES: [&[u8]; 6] = [b"http:", b"https:", b"ftp:", b"dns:", b"filedesc:", b"whois:"];
const WARC_LINE_PREFIX: &[u8] = b"WARC/";

/// How to react to damaged records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPolicy {
    /// Fail on the first problem.
    #[default]
    Strict,
    /// Warn and keep going.
    Lenient,
}

/// Problem found while reading in lenient mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadWarning {
    /// Offset of the affected record.
    pub offset: u64,
    /// Description of the problem.
    pub message: String,
}

impl fmt::Display for ReadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WARNING at offset {}: {}", self.offset, self.message)
    }
}

/// A record read back from a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    /// Parsed header.
    pub header: RecordHeader,
    /// Body bytes as found; shorter than declared for truncated records.
    pub body: Vec<u8>,
}

/// Result of validating one file.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Validated file.
    pub path: PathBuf,
    /// Headers of every record counted, descriptor included.
    pub headers: Vec<RecordHeader>,
    /// Warnings raised in lenient mode.
    pub warnings: Vec<ReadWarning>,
}

impl ValidationReport {
    /// Records counted.
    pub fn records_seen(&self) -> usize {
        self.headers.len()
    }

    /// Records other than file descriptors.
    pub fn content_records(&self) -> usize {
        self.headers.iter().filter(|h| !h.is_descriptor()).count()
    }
}

/// Tracks the logical position of a buffered reader.
struct CountingReader<R> {
    inner: R,
    pos: u64,
}

impl<R> CountingReader<R> {
    fn position(&self) -> u64 {
        self.pos
    }
}

impl<R: Seek> CountingReader<R> {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.pos += amt as u64;
    }
}

/// A record plus whatever was wrong with it.
struct Parsed {
    record: ArchiveRecord,
    issue: Option<ArchiveError>,
    /// Where the next record is expected.
    resume: u64,
}

/// Reads records from one container file.
pub struct ArchiveReader {
    path: PathBuf,
    input: CountingReader<BufReader<File>>,
    file_len: u64,
    compression: CompressionKind,
    format: Option<ArchiveFormat>,
    policy: ReadPolicy,
    warnings: Vec<ReadWarning>,
    records_seen: usize,
    finished: bool,
}

impl ArchiveReader {
    /// Open `path` at its first record.
    pub fn open(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        Self::open_at(path, 0)
    }

    /// Open `path` positioned at the record starting at `offset`.
    pub fn open_at(path: impl AsRef<Path>, offset: u64) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut input = CountingReader {
            inner: BufReader::new(file),
            pos: 0,
        };
        input.seek_to(offset)?;
        let compression = CompressionKind::detect(input.fill_buf()?);
        debug!(path = %path.display(), offset, compression = ?compression, "opened archive for reading");
        Ok(Self {
            path,
            input,
            file_len,
            compression,
            format: None,
            policy: ReadPolicy::default(),
            warnings: Vec::new(),
            records_seen: 0,
            finished: false,
        })
    }

    /// Set the damage policy.
    pub fn with_policy(mut self, policy: ReadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// File being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frame compression detected at open.
    pub fn compression(&self) -> CompressionKind {
        self.compression
    }

    /// Warnings raised so far.
    pub fn warnings(&self) -> &[ReadWarning] {
        &self.warnings
    }

    /// Records returned so far.
    pub fn records_seen(&self) -> usize {
        self.records_seen
    }

    /// Next record with its body.
    pub fn next_record(&mut self) -> ArchiveResult<Option<ArchiveRecord>> {
        self.advance(true)
    }

    /// Next header; the body is skipped.
    pub fn next_header(&mut self) -> ArchiveResult<Option<RecordHeader>> {
        Ok(self.advance(false)?.map(|r| r.header))
    }

    /// Iterate over the remaining records. Iteration stops after an error.
    pub fn records(&mut self) -> impl Iterator<Item = ArchiveResult<ArchiveRecord>> + '_ {
        std::iter::from_fn(move || self.next_record().transpose())
    }

    /// Read to the end, checking the record count when `expected` is given.
    pub fn validate(mut self, expected: Option<usize>) -> ArchiveResult<ValidationReport> {
        let mut headers = Vec::new();
        while let Some(header) = self.next_header()? {
            headers.push(header);
        }
        if let Some(expected) = expected {
            if headers.len() != expected {
                let err = ArchiveError::RecordCount {
                    expected,
                    actual: headers.len(),
                };
                match self.policy {
                    ReadPolicy::Strict => return Err(err),
                    ReadPolicy::Lenient => self.warn(0, &err),
                }
            }
        }
        debug!(path = %self.path.display(), records = headers.len(), warnings = self.warnings.len(), "validated archive");
        Ok(ValidationReport {
            path: self.path,
            headers,
            warnings: self.warnings,
        })
    }

    fn advance(&mut self, keep_body: bool) -> ArchiveResult<Option<ArchiveRecord>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let start = self.input.position();
            let result = if self.compression.is_compressed() {
                self.read_frame(start, keep_body)
            } else {
                self.read_plain(start, keep_body)
            };
            match result {
                Ok(None) => {
                    self.finished = true;
                    return Ok(None);
                }
                Ok(Some(parsed)) => {
                    if let Some(issue) = parsed.issue {
                        if self.policy == ReadPolicy::Strict {
                            self.finished = true;
                            return Err(issue);
                        }
                        self.warn(start, &issue);
                    }
                    if self.input.position() != parsed.resume {
                        self.input.seek_to(parsed.resume)?;
                    }
                    self.records_seen += 1;
                    return Ok(Some(parsed.record));
                }
                Err(e) => {
                    if self.policy == ReadPolicy::Strict || !e.is_integrity_issue() {
                        self.finished = true;
                        return Err(e);
                    }
                    self.warn(start, &e);
                    match self.resync(start + 1)? {
                        Some(next) => {
                            debug!(path = %self.path.display(), from = start, to = next, "resynchronized");
                            self.input.seek_to(next)?;
                        }
                        None => {
                            self.finished = true;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    fn read_frame(&mut self, start: u64, keep_body: bool) -> ArchiveResult<Option<Parsed>> {
        if self.input.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let kind = self.compression;
        let (header, body, got, rest) = {
            let mut frame = BufReader::new(FrameReader::open(kind, &mut self.input)?);
            let header = codec::read_header(&mut frame, start)
                .map_err(|e| frame_error(start, e))?
                .ok_or_else(|| ArchiveError::parse(start, "empty compressed frame"))?;
            let mut body = Vec::new();
            let copied = if keep_body {
                body.reserve(header.content_length.min(MAX_PREALLOC) as usize);
                codec::read_body(&mut frame, header.content_length, &mut body)
            } else {
                codec::read_body(&mut frame, header.content_length, &mut io::sink())
            };
            let got = copied.map_err(|e| frame_error(start, e.into()))?;
            let mut rest = Vec::new();
            frame
                .read_to_end(&mut rest)
                .map_err(|e| frame_error(start, e.into()))?;
            (header, body, got, rest)
        };
        self.format = Some(header.format);

        let terminator = codec::record_terminator(header.format);
        let issue = if got < header.content_length {
            Some(ArchiveError::PrematureEnd {
                offset: start,
                expected: header.content_length,
                actual: got,
            })
        } else if rest.is_empty() || rest == terminator {
            None
        } else {
            let count = if rest.starts_with(terminator) {
                rest.len() - terminator.len()
            } else {
                rest.len()
            };
            Some(ArchiveError::TrailingBytes {
                offset: start,
                count: count as u64,
            })
        };
        Ok(Some(Parsed {
            record: ArchiveRecord { header, body },
            issue,
            resume: self.input.position(),
        }))
    }

    fn read_plain(&mut self, start: u64, keep_body: bool) -> ArchiveResult<Option<Parsed>> {
        let header = match codec::read_header(&mut self.input, start)? {
            Some(h) => h,
            None => return Ok(None),
        };
        self.format = Some(header.format);
        let body_start = self.input.position();
        let mut body = Vec::new();
        let got = if keep_body {
            body.reserve(header.content_length.min(MAX_PREALLOC) as usize);
            codec::read_body(&mut self.input, header.content_length, &mut body)?
        } else {
            codec::read_body(&mut self.input, header.content_length, &mut io::sink())?
        };
        if got < header.content_length {
            let issue = ArchiveError::PrematureEnd {
                offset: start,
                expected: header.content_length,
                actual: got,
            };
            return Ok(Some(Parsed {
                record: ArchiveRecord { header, body },
                issue: Some(issue),
                resume: self.input.position(),
            }));
        }

        let body_end = self.input.position();
        let terminator = codec::record_terminator(header.format);
        let mut found = Vec::with_capacity(terminator.len());
        (&mut self.input)
            .take(terminator.len() as u64)
            .read_to_end(&mut found)?;
        // A missing terminator at end of file is tolerated.
        if found.is_empty() || found == terminator {
            return Ok(Some(Parsed {
                record: ArchiveRecord { header, body },
                issue: None,
                resume: self.input.position(),
            }));
        }

        // Scan from the body start: an overlong declared length swallows the
        // beginning of the next record.
        let resume = self.resync(body_start)?.unwrap_or(self.file_len);
        let issue = if resume < body_end {
            body.truncate((resume - body_start) as usize);
            if body.ends_with(terminator) {
                body.truncate(body.len() - terminator.len());
            }
            let actual = if keep_body { body.len() as u64 } else { resume - body_start };
            ArchiveError::PrematureEnd {
                offset: start,
                expected: header.content_length,
                actual,
            }
        } else {
            ArchiveError::TrailingBytes {
                offset: start,
                count: resume - body_end,
            }
        };
        Ok(Some(Parsed {
            record: ArchiveRecord { header, body },
            issue: Some(issue),
            resume,
        }))
    }

    fn warn(&mut self, offset: u64, err: &ArchiveError) {
        let warning = ReadWarning {
            offset,
            message: err.to_string(),
        };
        warn!(path = %self.path.display(), offset, error = %err, "damaged record");
        self.warnings.push(warning);
    }

    fn resync_needles(&self) -> Vec<&'static [u8]> {
        if self.compression.is_compressed() {
            return vec![self.compression.magic()];
        }
        match self.format {
            Some(ArchiveFormat::Warc) => vec![WARC_LINE_PREFIX],
            Some(ArchiveFormat::Arc) => ARC_LINE_PREFIXES.to_vec(),
            None => {
                let mut all = ARC_LINE_PREFIXES.to_vec();
                all.push(WARC_LINE_PREFIX);
                all
            }
        }
    }

    /// Offset of the first readable record header at or after `from`.
    fn resync(&mut self, from: u64) -> ArchiveResult<Option<u64>> {
        let needles = self.resync_needles();
        let overlap = needles.iter().map(|n| n.len()).max().unwrap_or(1).saturating_sub(1);
        let mut scan = File::open(&self.path)?;
        scan.seek(SeekFrom::Start(from))?;

        let mut buf = vec![0u8; SCAN_CHUNK + overlap];
        let mut base = from;
        let mut carried = 0usize;
        loop {
            let n = fill(&mut scan, &mut buf[carried..])?;
            let filled = carried + n;
            if filled == 0 {
                return Ok(None);
            }
            let at_eof = filled < buf.len();
            let limit = if at_eof { filled } else { filled - overlap };
            for i in 0..limit {
                let window = &buf[i..filled];
                if needles.iter().any(|needle| window.starts_with(needle)) {
                    let candidate = base + i as u64;
                    if self.probe(candidate) {
                        return Ok(Some(candidate));
                    }
                }
            }
            if at_eof {
                return Ok(None);
            }
            buf.copy_within(limit..filled, 0);
            carried = filled - limit;
            base += limit as u64;
        }
    }

    /// True when a record header can be read at `offset`.
    fn probe(&mut self, offset: u64) -> bool {
        if self.input.seek_to(offset).is_err() {
            return false;
        }
        if self.compression.is_compressed() {
            match FrameReader::open(self.compression, &mut self.input) {
                Ok(frame) => matches!(codec::read_header(&mut BufReader::new(frame), offset), Ok(Some(_))),
                Err(_) => false,
            }
        } else {
            matches!(codec::read_header(&mut self.input, offset), Ok(Some(_)))
        }
    }
}

/// Errors from inside a frame are decompression failures unless the
/// header itself was malformed.
fn frame_error(offset: u64, err: ArchiveError) -> ArchiveError {
    match err {
        ArchiveError::Io(e) => ArchiveError::Compression(format!("frame at offset {}: {}", offset, e)),
        other => other,
    }
}

/// Read until `buf` is full or the stream ends.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Validate several files with the same policy.
pub fn validate_files<P: AsRef<Path>>(paths: &[P], policy: ReadPolicy) -> ArchiveResult<Vec<ValidationReport>> {
    paths
        .iter()
        .map(|p| ArchiveReader::open(p)?.with_policy(policy).validate(None))
        .collect()
}

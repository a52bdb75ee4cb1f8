//! Record model shared by writers, builders, and readers.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};
use crate::header_block::HeaderBlock;
use crate::replay::{ContentSource, SliceSource};

/// Serialization profile of a container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// Legacy single-line header profile.
    Arc,
    /// Named-field header block profile.
    #[default]
    Warc,
}

impl ArchiveFormat {
    /// File extension without compression suffix.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Arc => "arc",
            ArchiveFormat::Warc => "warc",
        }
    }
}

/// Kind of record stored in a container.
///
/// `Conversion` and `Continuation` are never written here; they are only
/// recognized so files from other producers can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Full protocol response.
    Response,
    /// Protocol request as sent.
    Request,
    /// Crawl provenance or auxiliary data about another record.
    Metadata,
    /// Reference to previously stored content.
    Revisit,
    /// Content without protocol framing.
    Resource,
    /// File descriptor record leading every container file.
    Warcinfo,
    /// Transformed content derived from another record.
    Conversion,
    /// Continuation of a segmented record.
    Continuation,
}

impl RecordType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Response => "response",
            RecordType::Request => "request",
            RecordType::Metadata => "metadata",
            RecordType::Revisit => "revisit",
            RecordType::Resource => "resource",
            RecordType::Warcinfo => "warcinfo",
            RecordType::Conversion => "conversion",
            RecordType::Continuation => "continuation",
        }
    }

    /// Parse a wire name; matching is case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        let t = match name.to_ascii_lowercase().as_str() {
            "response" => RecordType::Response,
            "request" => RecordType::Request,
            "metadata" => RecordType::Metadata,
            "revisit" => RecordType::Revisit,
            "resource" => RecordType::Resource,
            "warcinfo" => RecordType::Warcinfo,
            "conversion" => RecordType::Conversion,
            "continuation" => RecordType::Continuation,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URN-style unique record identifier, stored with its angle brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a fresh `<urn:uuid:...>` identifier.
    pub fn generate() -> Self {
        RecordId(format!("<urn:uuid:{}>", uuid::Uuid::new_v4()))
    }

    /// Wrap an identifier read from a file.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        RecordId(raw.into())
    }

    /// Identifier text, including angle brackets.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reason a fetch was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Truncation {
    /// Byte-length cap reached.
    Length,
    /// Time cap reached.
    Time,
    /// Header-only policy or overlong headers.
    Head,
    /// Cut short for an unrecorded reason.
    Unspecified,
}

impl Truncation {
    /// Value written into the truncation header.
    pub fn as_str(self) -> &'static str {
        match self {
            Truncation::Length => "length",
            Truncation::Time => "time",
            Truncation::Head => "long-headers",
            Truncation::Unspecified => "unspecified",
        }
    }

    /// Parse a truncation header value.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "length" => Truncation::Length,
            "time" => Truncation::Time,
            "long-headers" | "head" => Truncation::Head,
            _ => Truncation::Unspecified,
        }
    }
}

/// 14-digit timestamp used by the legacy profile and file names.
pub fn timestamp14(date: &DateTime<Utc>) -> String {
    date.format("%Y%m%d%H%M%S").to_string()
}

/// ISO-8601 timestamp used by the header-block profile.
pub fn timestamp_iso(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Parse either timestamp style.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// One record to be written.
///
/// The content source is consumed by the writer; everything else is header
/// data. Declared `content_length` must match what the source yields unless
/// length enforcement is switched off.
pub struct Record {
    /// Record kind.
    pub record_type: RecordType,
    /// Unique identifier.
    pub id: RecordId,
    /// Target URL; empty for descriptor records.
    pub url: String,
    /// Capture timestamp.
    pub date: DateTime<Utc>,
    /// Content mimetype.
    pub mimetype: String,
    /// Contacted IP address.
    pub ip: Option<String>,
    /// Declared body length in bytes.
    pub content_length: u64,
    /// Digest of the payload, e.g. `sha256:...`.
    pub payload_digest: Option<String>,
    /// Back-reference to the primary record of the same fetch.
    pub concurrent_to: Option<RecordId>,
    /// Why the captured content is incomplete.
    pub truncated: Option<Truncation>,
    /// Additional named headers, written in insertion order.
    pub extra_headers: HeaderBlock,
    /// Whether the writer must reject a source yielding a different length.
    pub enforce_length: bool,
    content: Box<dyn ContentSource>,
}

impl Record {
    /// Create a record with a fresh id and the current time.
    pub fn new(
        record_type: RecordType,
        url: impl Into<String>,
        mimetype: impl Into<String>,
        content_length: u64,
        content: Box<dyn ContentSource>,
    ) -> Self {
        Self {
            record_type,
            id: RecordId::generate(),
            url: url.into(),
            date: Utc::now(),
            mimetype: mimetype.into(),
            ip: None,
            content_length,
            payload_digest: None,
            concurrent_to: None,
            truncated: None,
            extra_headers: HeaderBlock::new(),
            enforce_length: true,
            content,
        }
    }

    /// Create a record whose body is an in-memory buffer.
    pub fn from_bytes(
        record_type: RecordType,
        url: impl Into<String>,
        mimetype: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        let body = body.into();
        let len = body.len() as u64;
        Self::new(record_type, url, mimetype, len, Box::new(SliceSource::new(body)))
    }

    /// Set the capture timestamp.
    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    /// Set the contacted IP address.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the payload digest.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.payload_digest = Some(digest.into());
        self
    }

    /// Link to the primary record of the same fetch.
    pub fn with_concurrent_to(mut self, id: RecordId) -> Self {
        self.concurrent_to = Some(id);
        self
    }

    /// Mark as truncated.
    pub fn with_truncation(mut self, reason: Truncation) -> Self {
        self.truncated = Some(reason);
        self
    }

    /// Append a named header.
    pub fn with_header(mut self, name: &str, value: &str) -> ArchiveResult<Self> {
        self.extra_headers.push(name, value)?;
        Ok(self)
    }

    /// Toggle length enforcement for this record.
    pub fn with_enforce_length(mut self, enforce: bool) -> Self {
        self.enforce_length = enforce;
        self
    }

    /// Mutable access to the body source.
    pub fn content_mut(&mut self) -> &mut dyn ContentSource {
        self.content.as_mut()
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("record_type", &self.record_type)
            .field("id", &self.id)
            .field("url", &self.url)
            .field("date", &self.date)
            .field("mimetype", &self.mimetype)
            .field("content_length", &self.content_length)
            .field("concurrent_to", &self.concurrent_to)
            .field("truncated", &self.truncated)
            .finish_non_exhaustive()
    }
}

/// Header of a record as read back from a container file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHeader {
    /// Byte offset of the record start (the frame start when compressed).
    pub offset: u64,
    /// Profile the record was written with.
    pub format: ArchiveFormat,
    /// Record kind; legacy records are `Response` except the leading descriptor.
    pub record_type: RecordType,
    /// Identifier, absent in the legacy profile.
    pub id: Option<RecordId>,
    /// Target URL.
    pub url: String,
    /// Timestamp as written.
    pub date: String,
    /// Content mimetype.
    pub mimetype: String,
    /// Contacted IP address.
    pub ip: Option<String>,
    /// Declared body length.
    pub content_length: u64,
    /// Every named field of a header block, in file order.
    pub fields: HeaderBlock,
}

impl RecordHeader {
    /// Parsed capture timestamp.
    pub fn parsed_date(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.date)
    }

    /// Value of a named field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name)
    }

    /// Concurrent-to back-reference.
    pub fn concurrent_to(&self) -> Option<RecordId> {
        self.field(crate::codec::field::CONCURRENT_TO)
            .map(RecordId::from_raw)
    }

    /// Payload digest.
    pub fn payload_digest(&self) -> Option<&str> {
        self.field(crate::codec::field::PAYLOAD_DIGEST)
    }

    /// Truncation reason.
    pub fn truncated(&self) -> Option<Truncation> {
        self.field(crate::codec::field::TRUNCATED).map(Truncation::parse)
    }

    /// True for the descriptor record that opens a file.
    pub fn is_descriptor(&self) -> bool {
        self.record_type == RecordType::Warcinfo
    }
}

/// Reject characters that would break header framing.
pub(crate) fn check_no_whitespace(field: &'static str, value: &str) -> ArchiveResult<()> {
    if let Some((i, c)) = value
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
    {
        return Err(ArchiveError::format(
            field,
            format!("contains disallowed white space or control character {:?} at index {}", c, i),
        ));
    }
    Ok(())
}

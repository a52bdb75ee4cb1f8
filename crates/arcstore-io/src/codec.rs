//! Record header encoding and decoding for both serialization profiles.
//!
//! Legacy profile: `url SP ip SP yyyyMMddHHmmss SP mimetype SP length LF`,
//! body, `LF`.
//!
//! Header-block profile: `WARC/1.0`, named fields, blank line, body,
//! `CRLF CRLF`.

use std::io::{self, BufRead, Read, Write};

use crate::error::{ArchiveError, ArchiveResult};
use crate::header_block::HeaderBlock;
use crate::record::{
    check_no_whitespace, timestamp14, timestamp_iso, ArchiveFormat, Record, RecordHeader, RecordId,
    RecordType,
};

/// Version line of the header-block profile.
pub const WARC_VERSION_LINE: &str = "WARC/1.0";

/// Mimetype written by the legacy profile when none is known.
pub const NO_TYPE_MIMETYPE: &str = "no-type";

/// IP written by the legacy profile when none is known.
pub const NO_IP: &str = "0.0.0.0";

/// Upper bound on a single header line or header block.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Field names of the header-block profile.
pub mod field {
    /// Record kind.
    pub const TYPE: &str = "WARC-Type";
    /// Target URL.
    pub const TARGET_URI: &str = "WARC-Target-URI";
    /// Capture time.
    pub const DATE: &str = "WARC-Date";
    /// Record identifier.
    pub const RECORD_ID: &str = "WARC-Record-ID";
    /// Contacted IP.
    pub const IP_ADDRESS: &str = "WARC-IP-Address";
    /// Payload digest.
    pub const PAYLOAD_DIGEST: &str = "WARC-Payload-Digest";
    /// Link to the primary record of the same fetch.
    pub const CONCURRENT_TO: &str = "WARC-Concurrent-To";
    /// Truncation reason.
    pub const TRUNCATED: &str = "WARC-Truncated";
    /// Revisit profile URI.
    pub const PROFILE: &str = "WARC-Profile";
    /// Id of the record a revisit refers to.
    pub const REFERS_TO: &str = "WARC-Refers-To";
    /// URL of the record a revisit refers to.
    pub const REFERS_TO_TARGET_URI: &str = "WARC-Refers-To-Target-URI";
    /// Date of the record a revisit refers to.
    pub const REFERS_TO_DATE: &str = "WARC-Refers-To-Date";
    /// Name of the container file (descriptor records).
    pub const FILENAME: &str = "WARC-Filename";
    /// Server ETag recorded on not-modified revisits.
    pub const ETAG: &str = "WARC-Etag";
    /// Server Last-Modified recorded on not-modified revisits.
    pub const LAST_MODIFIED: &str = "WARC-Last-Modified";
    /// Body mimetype.
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Body length.
    pub const CONTENT_LENGTH: &str = "Content-Length";
}

/// Bytes that close every record of `format`.
pub fn record_terminator(format: ArchiveFormat) -> &'static [u8] {
    match format {
        ArchiveFormat::Arc => b"\n",
        ArchiveFormat::Warc => b"\r\n\r\n",
    }
}

/// Encode the header of `record` for `format`.
pub fn encode_header(format: ArchiveFormat, record: &Record) -> ArchiveResult<Vec<u8>> {
    match format {
        ArchiveFormat::Arc => encode_arc_header(record),
        ArchiveFormat::Warc => encode_warc_header(record),
    }
}

/// Legacy header line. The mimetype has white space squeezed out.
pub fn encode_arc_header(record: &Record) -> ArchiveResult<Vec<u8>> {
    if record.url.is_empty() {
        return Err(ArchiveError::format("url", "empty url"));
    }
    check_no_whitespace("url", &record.url)?;
    let ip = record.ip.as_deref().unwrap_or(NO_IP);
    check_no_whitespace("ip", ip)?;
    let mimetype: String = record.mimetype.chars().filter(|c| !c.is_whitespace()).collect();
    let mimetype = if mimetype.is_empty() {
        NO_TYPE_MIMETYPE.to_string()
    } else {
        mimetype
    };
    check_no_whitespace("mimetype", &mimetype)?;
    let line = format!(
        "{} {} {} {} {}\n",
        record.url,
        ip,
        timestamp14(&record.date),
        mimetype,
        record.content_length
    );
    Ok(line.into_bytes())
}

/// Header block, version line through the blank line preceding the body.
pub fn encode_warc_header(record: &Record) -> ArchiveResult<Vec<u8>> {
    let mut block = HeaderBlock::new();
    block.push(field::TYPE, record.record_type.as_str())?;
    if !record.url.is_empty() {
        check_no_whitespace("url", &record.url)?;
        block.push(field::TARGET_URI, &record.url)?;
    }
    block.push(field::DATE, &timestamp_iso(&record.date))?;
    if let Some(ip) = &record.ip {
        check_no_whitespace("ip", ip)?;
        block.push(field::IP_ADDRESS, ip)?;
    }
    if let Some(id) = &record.concurrent_to {
        block.push(field::CONCURRENT_TO, id.as_str())?;
    }
    if let Some(digest) = &record.payload_digest {
        check_no_whitespace("digest", digest)?;
        block.push(field::PAYLOAD_DIGEST, digest)?;
    }
    if let Some(reason) = record.truncated {
        block.push(field::TRUNCATED, reason.as_str())?;
    }
    for f in record.extra_headers.iter() {
        match &f.value {
            Some(v) => block.push(&f.name, v)?,
            None => block.push_label(&f.name)?,
        }
    }
    block.push(field::RECORD_ID, record.id.as_str())?;
    if record.content_length > 0 {
        if record.mimetype.contains('\n') {
            return Err(ArchiveError::format("mimetype", "mimetype contains a line break"));
        }
        block.push(field::CONTENT_TYPE, &record.mimetype)?;
    }
    block.push(field::CONTENT_LENGTH, &record.content_length.to_string())?;

    let mut out = String::with_capacity(256);
    out.push_str(WARC_VERSION_LINE);
    out.push_str("\r\n");
    block.write_fields(&mut out);
    out.push_str("\r\n");
    Ok(out.into_bytes())
}

/// Read one header line, bounded by [`MAX_HEADER_BYTES`]. Empty at end of stream.
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader
        .by_ref()
        .take(MAX_HEADER_BYTES as u64)
        .read_until(b'\n', &mut line)?;
    Ok(line)
}

/// Read the next header from `reader`; `None` at a clean end of stream.
pub fn read_header<R: BufRead>(reader: &mut R, offset: u64) -> ArchiveResult<Option<RecordHeader>> {
    let first = read_line(reader)?;
    if first.is_empty() {
        return Ok(None);
    }
    parse_header(&first, reader, offset).map(Some)
}

/// Parse a header whose first line has already been read.
pub fn parse_header<R: BufRead>(
    first_line: &[u8],
    rest: &mut R,
    offset: u64,
) -> ArchiveResult<RecordHeader> {
    if first_line.starts_with(b"WARC/") {
        parse_warc_header(first_line, rest, offset)
    } else {
        parse_arc_line(first_line, offset)
    }
}

fn parse_arc_line(line: &[u8], offset: u64) -> ArchiveResult<RecordHeader> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ArchiveError::parse(offset, "header line is not valid UTF-8"))?;
    if !text.ends_with('\n') {
        return Err(ArchiveError::parse(offset, "header line is not terminated"));
    }
    let fields: Vec<&str> = text.split_ascii_whitespace().collect();
    if fields.len() != 5 {
        return Err(ArchiveError::parse(
            offset,
            format!("header line doesn't match expected pattern: {:?}", text.trim_end()),
        ));
    }
    let content_length = fields[4].parse::<u64>().map_err(|_| {
        ArchiveError::parse(offset, format!("invalid length field {:?}", fields[4]))
    })?;
    if fields[2].len() < 8 || !fields[2].bytes().all(|b| b.is_ascii_digit()) {
        return Err(ArchiveError::parse(offset, format!("invalid date field {:?}", fields[2])));
    }
    let url = fields[0].to_string();
    let record_type = if url.starts_with("filedesc:") {
        RecordType::Warcinfo
    } else {
        RecordType::Response
    };
    Ok(RecordHeader {
        offset,
        format: ArchiveFormat::Arc,
        record_type,
        id: None,
        url,
        date: fields[2].to_string(),
        mimetype: fields[3].to_string(),
        ip: Some(fields[1].to_string()),
        content_length,
        fields: HeaderBlock::new(),
    })
}

fn parse_warc_header<R: BufRead>(
    first_line: &[u8],
    rest: &mut R,
    offset: u64,
) -> ArchiveResult<RecordHeader> {
    let mut text = String::new();
    loop {
        let line = read_line(rest)?;
        if line.is_empty() {
            return Err(ArchiveError::parse(offset, "header block ends before blank line"));
        }
        let line = std::str::from_utf8(&line)
            .map_err(|_| ArchiveError::parse(offset, "header block is not valid UTF-8"))?;
        if line == "\r\n" || line == "\n" {
            break;
        }
        text.push_str(line);
        if text.len() > MAX_HEADER_BYTES {
            return Err(ArchiveError::parse(offset, "header block too long"));
        }
    }
    let version = String::from_utf8_lossy(first_line).trim_end().to_string();
    let fields = HeaderBlock::parse(&text).map_err(|e| e.at_offset(offset))?;

    let type_name = fields
        .get(field::TYPE)
        .ok_or_else(|| ArchiveError::parse(offset, format!("{} record without {}", version, field::TYPE)))?;
    let record_type = RecordType::parse(type_name.trim())
        .ok_or_else(|| ArchiveError::parse(offset, format!("unknown record type {:?}", type_name)))?;
    let length = fields
        .get(field::CONTENT_LENGTH)
        .ok_or_else(|| ArchiveError::parse(offset, format!("record without {}", field::CONTENT_LENGTH)))?;
    let content_length = length
        .trim()
        .parse::<u64>()
        .map_err(|_| ArchiveError::parse(offset, format!("invalid content length {:?}", length)))?;

    Ok(RecordHeader {
        offset,
        format: ArchiveFormat::Warc,
        record_type,
        id: fields.get(field::RECORD_ID).map(RecordId::from_raw),
        url: fields.get(field::TARGET_URI).unwrap_or_default().to_string(),
        date: fields.get(field::DATE).unwrap_or_default().to_string(),
        mimetype: fields.get(field::CONTENT_TYPE).unwrap_or_default().to_string(),
        ip: fields.get(field::IP_ADDRESS).map(str::to_string),
        content_length,
        fields,
    })
}

/// Copy at most `len` body bytes to `out`, returning how many were available.
pub fn read_body<R: Read + ?Sized, W: Write + ?Sized>(reader: &mut R, len: u64, out: &mut W) -> io::Result<u64> {
    io::copy(&mut reader.take(len), out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Truncation;
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;

    fn sample(record_type: RecordType, url: &str, body: &str) -> Record {
        Record::from_bytes(record_type, url, "text/html", body.to_string())
            .with_date(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
            .with_ip("10.0.0.1")
    }

    #[test]
    fn test_arc_line() {
        let r = sample(RecordType::Response, "http://www.one.net/id=1", "abc");
        let line = String::from_utf8(encode_arc_header(&r).unwrap()).unwrap();
        assert_eq!(line, "http://www.one.net/id=1 10.0.0.1 20240102030405 text/html 3\n");
    }

    #[test]
    fn test_arc_mimetype_squeezed() {
        let mut r = sample(RecordType::Response, "http://a.example/", "abc");
        r.mimetype = "text/html; charset=utf-8".to_string();
        let line = String::from_utf8(encode_arc_header(&r).unwrap()).unwrap();
        assert!(line.contains(" text/html;charset=utf-8 "));
    }

    #[test]
    fn test_space_in_url_fails() {
        let r = sample(RecordType::Response, "http://a.example/ /index.html", "abc");
        let err = encode_arc_header(&r).unwrap_err();
        assert!(matches!(err, ArchiveError::Format { field: "url", .. }));
        let err = encode_warc_header(&r).unwrap_err();
        assert!(matches!(err, ArchiveError::Format { field: "url", .. }));
    }

    #[test]
    fn test_tab_in_url_fails() {
        let r = sample(RecordType::Response, "http://a.example/\t/index.html", "abc");
        assert!(encode_header(ArchiveFormat::Arc, &r).is_err());
        assert!(encode_header(ArchiveFormat::Warc, &r).is_err());
    }

    #[test]
    fn test_warc_header_layout() {
        let r = sample(RecordType::Response, "http://a.example/", "abc")
            .with_truncation(Truncation::Length)
            .with_header("X-Note", "two\nlines")
            .unwrap();
        let text = String::from_utf8(encode_warc_header(&r).unwrap()).unwrap();
        assert!(text.starts_with("WARC/1.0\r\nWARC-Type: response\r\nWARC-Target-URI: http://a.example/\r\n"));
        assert!(text.contains("WARC-Date: 2024-01-02T03:04:05Z\r\n"));
        assert!(text.contains("WARC-Truncated: length\r\n"));
        assert!(text.contains("X-Note: two\r\n lines\r\n"));
        assert!(text.ends_with("Content-Type: text/html\r\nContent-Length: 3\r\n\r\n"));
    }

    #[test]
    fn test_warc_empty_body_omits_content_type() {
        let r = sample(RecordType::Metadata, "", "");
        let text = String::from_utf8(encode_warc_header(&r).unwrap()).unwrap();
        assert!(!text.contains("Content-Type"));
        assert!(!text.contains("WARC-Target-URI"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_warc_header_round_trip() {
        let r = sample(RecordType::Request, "http://a.example/q?x=1", "GET / HTTP/1.1\r\n\r\n");
        let bytes = encode_warc_header(&r).unwrap();
        let mut cursor = Cursor::new(bytes);
        let header = read_header(&mut cursor, 9).unwrap().unwrap();
        assert_eq!(header.offset, 9);
        assert_eq!(header.record_type, RecordType::Request);
        assert_eq!(header.url, "http://a.example/q?x=1");
        assert_eq!(header.mimetype, "text/html");
        assert_eq!(header.content_length, r.content_length);
        assert_eq!(header.id.as_ref(), Some(&r.id));
        assert_eq!(header.ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_arc_header_round_trip() {
        let r = sample(RecordType::Response, "http://a.example/", "hello");
        let mut cursor = Cursor::new(encode_arc_header(&r).unwrap());
        let header = read_header(&mut cursor, 0).unwrap().unwrap();
        assert_eq!(header.format, ArchiveFormat::Arc);
        assert_eq!(header.url, "http://a.example/");
        assert_eq!(header.content_length, 5);
        assert_eq!(header.date, "20240102030405");
    }

    #[test]
    fn test_bad_arc_line() {
        let mut cursor = Cursor::new(b"http://a.example/ extra 1.2.3.4 20240102030405 text/html 5\n".to_vec());
        let err = read_header(&mut cursor, 33).unwrap_err();
        assert!(matches!(err, ArchiveError::Parse { offset: 33, .. }));
        assert!(err.to_string().contains("doesn't match expected pattern"));
    }

    #[test]
    fn test_warc_missing_length() {
        let mut cursor = Cursor::new(b"WARC/1.0\r\nWARC-Type: resource\r\n\r\n".to_vec());
        let err = read_header(&mut cursor, 0).unwrap_err();
        assert!(err.to_string().contains("Content-Length"));
    }

    #[test]
    fn test_reads_foreign_record_types() {
        let text = b"WARC/1.0\r\nWARC-Type: continuation\r\nWARC-Segment-Number: 2\r\nContent-Length: 3\r\n\r\nabc";
        let header = read_header(&mut Cursor::new(text.to_vec()), 0).unwrap().unwrap();
        assert_eq!(header.record_type, RecordType::Continuation);
        assert_eq!(header.field("WARC-Segment-Number"), Some("2"));
        assert_eq!(header.content_length, 3);
    }

    #[test]
    fn test_read_body_never_overreads() {
        let mut cursor = Cursor::new(b"0123456789".to_vec());
        let mut out = Vec::new();
        assert_eq!(read_body(&mut cursor, 4, &mut out).unwrap(), 4);
        assert_eq!(out, b"0123");
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn test_read_header_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_header(&mut cursor, 0).unwrap().is_none());
    }
}

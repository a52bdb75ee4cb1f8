//! Error types for the archive engine.

use thiserror::Error;

/// Result type alias for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Error variants for writing, pooling, and reading archive records.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A header field contains characters that would corrupt record framing.
    #[error("Format error in {field}: {reason}")]
    Format {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// The content source produced a different number of bytes than declared.
    #[error("Length mismatch: read {actual} bytes but expected {expected}")]
    LengthMismatch {
        /// Declared content length.
        expected: u64,
        /// Bytes actually read from the source.
        actual: u64,
    },

    /// The record body ended before its declared length.
    #[error("Premature end of record at offset {offset}: declared {expected} body bytes, found {actual}")]
    PrematureEnd {
        /// Byte offset of the record start.
        offset: u64,
        /// Declared content length.
        expected: u64,
        /// Body bytes actually present.
        actual: u64,
    },

    /// Unexpected bytes follow the declared end of a record.
    #[error("Unexpected bytes after record ending: record starting at {offset} has {count} trailing byte(s)")]
    TrailingBytes {
        /// Byte offset of the record start.
        offset: u64,
        /// Number of unexpected bytes.
        count: u64,
    },

    /// The source reports unread or unknown bytes after the declared body.
    #[error("Gap detected: mismatch between expected and actual stream position after {expected} bytes (source reports {remaining} remaining)")]
    Gap {
        /// Declared content length that was consumed.
        expected: u64,
        /// Remaining-bytes value reported by the source; negative means inconsistent.
        remaining: i64,
    },

    /// No writer became available before the borrow timeout elapsed.
    #[error("Pool exhausted: no writer available after {waited_ms}ms (capacity {capacity})")]
    PoolExhausted {
        /// Milliseconds spent waiting.
        waited_ms: u64,
        /// Maximum number of concurrently open writers.
        capacity: usize,
    },

    /// The writer pool has been closed.
    #[error("Writer pool is closed")]
    PoolClosed,

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid header data.
    #[error("Parse error at offset {offset}: {reason}")]
    Parse {
        /// Byte offset of the record start.
        offset: u64,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// A compressed frame could not be encoded or decoded.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Validation saw a different number of records than expected.
    #[error("Record count mismatch: saw {actual} records, expected {expected}")]
    RecordCount {
        /// Expected record count.
        expected: usize,
        /// Records actually seen.
        actual: usize,
    },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ArchiveError {
    /// Build a format error for `field`.
    pub fn format(field: &'static str, reason: impl Into<String>) -> Self {
        ArchiveError::Format {
            field,
            reason: reason.into(),
        }
    }

    /// Build a parse error at `offset`.
    pub fn parse(offset: u64, reason: impl Into<String>) -> Self {
        ArchiveError::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Rebase parse errors raised without position information.
    pub fn at_offset(self, offset: u64) -> Self {
        match self {
            ArchiveError::Parse { reason, .. } => ArchiveError::Parse { offset, reason },
            other => other,
        }
    }

    /// True for the backpressure signal; the caller may retry later.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, ArchiveError::PoolExhausted { .. })
    }

    /// True when a write failed in a way that leaves the open file suspect.
    pub fn requires_invalidation(&self) -> bool {
        matches!(
            self,
            ArchiveError::Io(_)
                | ArchiveError::Gap { .. }
                | ArchiveError::LengthMismatch { .. }
                | ArchiveError::Compression(_)
        )
    }

    /// True for conditions a lenient reader reports as warnings.
    pub fn is_integrity_issue(&self) -> bool {
        matches!(
            self,
            ArchiveError::PrematureEnd { .. }
                | ArchiveError::TrailingBytes { .. }
                | ArchiveError::Parse { .. }
                | ArchiveError::Compression(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_message_mentions_mismatch() {
        let err = ArchiveError::Gap {
            expected: 120,
            remaining: -1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("mismatch between expected and actual"));
        assert!(msg.contains("-1"));
    }

    #[test]
    fn test_trailing_bytes_message() {
        let err = ArchiveError::TrailingBytes {
            offset: 512,
            count: 19,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("record ending"));
        assert!(msg.contains("512"));
        assert!(msg.contains("19 trailing"));
    }

    #[test]
    fn test_premature_end_message() {
        let err = ArchiveError::PrematureEnd {
            offset: 40,
            expected: 100,
            actual: 91,
        };
        assert!(format!("{}", err).starts_with("Premature end of record at offset 40"));
    }

    #[test]
    fn test_at_offset_rebases_parse_only() {
        let err = ArchiveError::parse(0, "bad line").at_offset(77);
        assert!(matches!(err, ArchiveError::Parse { offset: 77, .. }));

        let err = ArchiveError::PoolClosed.at_offset(77);
        assert!(matches!(err, ArchiveError::PoolClosed));
    }

    #[test]
    fn test_classification() {
        let exhausted = ArchiveError::PoolExhausted {
            waited_ms: 10,
            capacity: 3,
        };
        assert!(exhausted.is_backpressure());
        assert!(!exhausted.is_integrity_issue());
        assert!(ArchiveError::parse(3, "x").is_integrity_issue());
        assert!(!ArchiveError::format("url", "space").is_integrity_issue());
        assert!(ArchiveError::Gap {
            expected: 1,
            remaining: -1
        }
        .requires_invalidation());
        assert!(!ArchiveError::format("url", "space").requires_invalidation());
    }

    #[test]
    fn test_io_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ArchiveError = io_err.into();
        assert!(matches!(err, ArchiveError::Io(_)));
    }
}

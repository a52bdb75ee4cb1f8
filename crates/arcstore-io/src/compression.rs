//! Independent per-record compression frames (gzip members or zstd frames).

use std::io::{self, BufRead, Read, Write};

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};

const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Frame compression applied to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// Records are stored as-is.
    None,
    /// One gzip member per record.
    #[default]
    Gzip,
    /// One zstd frame per record.
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

impl CompressionKind {
    /// True unless `None`.
    pub fn is_compressed(self) -> bool {
        !matches!(self, CompressionKind::None)
    }

    /// Extension appended to compressed container names.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            CompressionKind::None => None,
            CompressionKind::Gzip => Some("gz"),
            CompressionKind::Zstd { .. } => Some("zst"),
        }
    }

    /// Magic bytes opening every frame.
    pub fn magic(self) -> &'static [u8] {
        match self {
            CompressionKind::None => &[],
            CompressionKind::Gzip => &GZIP_MAGIC,
            CompressionKind::Zstd { .. } => &ZSTD_MAGIC,
        }
    }

    /// Identify the framing from the first bytes of a record.
    pub fn detect(prefix: &[u8]) -> CompressionKind {
        if prefix.starts_with(&GZIP_MAGIC[..2]) {
            CompressionKind::Gzip
        } else if prefix.starts_with(&ZSTD_MAGIC) {
            CompressionKind::Zstd { level: 3 }
        } else {
            CompressionKind::None
        }
    }
}

/// Writer that closes one frame on [`FrameWriter::finish`].
pub enum FrameWriter<W: Write> {
    /// Pass-through.
    Plain(W),
    /// Gzip member in progress.
    Gzip(GzEncoder<W>),
    /// Zstd frame in progress.
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> FrameWriter<W> {
    /// Open a frame over `inner`.
    pub fn new(kind: CompressionKind, inner: W) -> ArchiveResult<Self> {
        Ok(match kind {
            CompressionKind::None => FrameWriter::Plain(inner),
            CompressionKind::Gzip => FrameWriter::Gzip(GzEncoder::new(inner, Compression::default())),
            CompressionKind::Zstd { level } => {
                let mut enc = zstd::stream::write::Encoder::new(inner, level)
                    .map_err(|e| ArchiveError::Compression(e.to_string()))?;
                enc.include_checksum(true)
                    .map_err(|e| ArchiveError::Compression(e.to_string()))?;
                FrameWriter::Zstd(enc)
            }
        })
    }

    /// Write the frame footer and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            FrameWriter::Plain(w) => Ok(w),
            FrameWriter::Gzip(enc) => enc.finish(),
            FrameWriter::Zstd(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for FrameWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FrameWriter::Plain(w) => w.write(buf),
            FrameWriter::Gzip(enc) => enc.write(buf),
            FrameWriter::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FrameWriter::Plain(w) => w.flush(),
            FrameWriter::Gzip(enc) => enc.flush(),
            FrameWriter::Zstd(enc) => enc.flush(),
        }
    }
}

/// Reader over exactly one frame of a buffered stream.
///
/// Decoding stops at the frame footer, leaving `inner` positioned at the
/// next frame once the reader has returned end of stream.
pub enum FrameReader<R: BufRead> {
    /// One gzip member.
    Gzip(GzDecoder<R>),
    /// One zstd frame.
    Zstd(zstd::stream::read::Decoder<'static, R>),
}

impl<R: BufRead> FrameReader<R> {
    /// Open the frame starting at the current position of `inner`.
    pub fn open(kind: CompressionKind, inner: R) -> ArchiveResult<Self> {
        match kind {
            CompressionKind::Gzip => Ok(FrameReader::Gzip(GzDecoder::new(inner))),
            CompressionKind::Zstd { .. } => {
                let dec = zstd::stream::read::Decoder::with_buffer(inner)
                    .map_err(|e| ArchiveError::Compression(e.to_string()))?;
                Ok(FrameReader::Zstd(dec.single_frame()))
            }
            CompressionKind::None => Err(ArchiveError::Compression(
                "cannot open a frame on uncompressed input".to_string(),
            )),
        }
    }
}

impl<R: BufRead> Read for FrameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FrameReader::Gzip(dec) => dec.read(buf),
            FrameReader::Zstd(dec) => dec.read(buf),
        }
    }
}

/// Compress `data` into a single frame.
pub fn compress_frame(data: &[u8], kind: CompressionKind) -> ArchiveResult<Vec<u8>> {
    let mut frame = FrameWriter::new(kind, Vec::with_capacity(data.len() / 2 + 64))?;
    frame
        .write_all(data)
        .map_err(|e| ArchiveError::Compression(e.to_string()))?;
    frame.finish().map_err(|e| ArchiveError::Compression(e.to_string()))
}

/// Decompress the first frame of `data`.
pub fn decompress_frame(data: &[u8], kind: CompressionKind) -> ArchiveResult<Vec<u8>> {
    if !kind.is_compressed() {
        return Ok(data.to_vec());
    }
    let mut out = Vec::new();
    FrameReader::open(kind, data)?
        .read_to_end(&mut out)
        .map_err(|e| ArchiveError::Compression(e.to_string()))?;
    Ok(out)
}

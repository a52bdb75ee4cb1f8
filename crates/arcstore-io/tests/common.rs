//! Shared fixtures for arcstore-io integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use arcstore_io::{ArchiveFormat, CompressionKind, Record, RecordType, SerialNumber, WriterFactory, WriterSettings};

/// Writer settings writing into `dir` with no host suffix.
pub fn settings(dir: &Path, format: ArchiveFormat, compression: CompressionKind, max_file_size: u64) -> WriterSettings {
    WriterSettings {
        prefix: "IT".to_string(),
        suffix: None,
        format,
        compression,
        max_file_size,
        directories: vec![dir.to_path_buf()],
        metadata: Vec::new(),
        enforce_length: true,
    }
}

/// Factory with a fresh serial counter.
pub fn factory(dir: &Path, format: ArchiveFormat, compression: CompressionKind, max_file_size: u64) -> WriterFactory {
    WriterFactory::new(settings(dir, format, compression, max_file_size), SerialNumber::default())
}

/// Body of a small HTTP response numbered `i`.
pub fn page_body(i: usize) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html><head><title>Page #{i}</title></head><body>Page #{i}</body></html>\n"
    )
}

/// Small HTTP response record numbered `i`.
pub fn page(i: usize) -> Record {
    Record::from_bytes(
        RecordType::Response,
        format!("http://www.one.net/id={}", i),
        "text/html",
        page_body(i),
    )
    .with_ip("0.1.2.3")
}

/// Finished container files in `dir`, sorted by name.
pub fn finished_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            let name = p.to_string_lossy();
            !name.ends_with(".open") && !name.ends_with(".invalid")
        })
        .collect();
    files.sort();
    files
}

//! Duplicate payloads become revisit records pointing at the first capture.

mod common;

use std::sync::Arc;

use arcstore_io::{
    ArchiveProcessor, ArchiveReader, ArchiveRecord, BuilderSettings, CompressionKind, DedupStore, FetchOutcome,
    MemoryDedupStore, OutcomeHostLookup, PoolConfig, RecordType, RecordedBytes, Recorder, SerialNumber,
    WriterFactory, WriterPool,
};
use chrono::Utc;
use common::{finished_files, settings};
use tempfile::TempDir;

const HEADERS: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 21\r\n\r\n";
const PAYLOAD: &str = "the very same payload";

fn fetch(url: &str) -> FetchOutcome {
    let mut outcome = FetchOutcome::new(url, Utc::now());
    outcome.status = 200;
    outcome.content_type = Some("text/plain".to_string());
    outcome.server_ip = Some("192.0.2.7".to_string());
    outcome.recorder = Some(Recorder::exchange(
        RecordedBytes::http(format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", url)),
        RecordedBytes::http(format!("{}{}", HEADERS, PAYLOAD)),
    ));
    outcome
}

fn processor(dir: &TempDir, store: Arc<dyn DedupStore>) -> ArchiveProcessor {
    let settings = settings(
        dir.path(),
        arcstore_io::ArchiveFormat::Warc,
        CompressionKind::Gzip,
        1 << 20,
    );
    let pool = WriterPool::new(
        PoolConfig::default(),
        WriterFactory::new(settings, SerialNumber::default()),
    )
    .unwrap();
    ArchiveProcessor::new(
        Arc::new(pool),
        BuilderSettings::default(),
        Arc::new(OutcomeHostLookup),
        store,
    )
}

fn read_all(dir: &TempDir) -> Vec<ArchiveRecord> {
    let files = finished_files(dir.path());
    assert_eq!(files.len(), 1);
    let mut reader = ArchiveReader::open(&files[0]).unwrap();
    reader.records().collect::<Result<Vec<_>, _>>().unwrap()
}

#[test]
fn test_identical_payload_written_as_revisit() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryDedupStore::new());
    let p = processor(&dir, store.clone());

    let first = p.process(&mut fetch("http://www.one.net/same")).unwrap();
    let second = p.process(&mut fetch("http://www.one.net/same")).unwrap();
    assert_eq!(first[0].record_type, RecordType::Response);
    assert_eq!(second[0].record_type, RecordType::Revisit);
    assert_eq!(store.entry_count(), 1);
    p.shutdown().unwrap();

    let records = read_all(&dir);
    let response = records
        .iter()
        .find(|r| r.header.record_type == RecordType::Response)
        .unwrap();
    let revisit = records
        .iter()
        .find(|r| r.header.record_type == RecordType::Revisit)
        .unwrap();

    assert_eq!(response.body, format!("{}{}", HEADERS, PAYLOAD).into_bytes());
    assert_eq!(revisit.body, HEADERS.as_bytes());
    assert_eq!(revisit.header.content_length, HEADERS.len() as u64);

    let original_id = response.header.id.as_ref().unwrap();
    assert_eq!(revisit.header.field("WARC-Refers-To"), Some(original_id.as_str()));
    assert_eq!(
        revisit.header.field("WARC-Refers-To-Target-URI"),
        Some("http://www.one.net/same")
    );
    assert_eq!(
        revisit.header.field("WARC-Refers-To-Date"),
        Some(response.header.date.as_str())
    );
    assert_eq!(
        revisit.header.field("WARC-Payload-Digest"),
        response.header.field("WARC-Payload-Digest")
    );
    assert_eq!(revisit.header.field("WARC-Truncated"), Some("length"));
    assert!(revisit
        .header
        .field("WARC-Profile")
        .unwrap()
        .ends_with("/revisit/identical-payload-digest"));
}

#[test]
fn test_different_payload_not_deduplicated() {
    let dir = TempDir::new().unwrap();
    let p = processor(&dir, Arc::new(MemoryDedupStore::new()));

    p.process(&mut fetch("http://www.one.net/a")).unwrap();
    let mut changed = fetch("http://www.one.net/a");
    changed.recorder = Some(Recorder::response_only(RecordedBytes::http(format!(
        "{}the other payload here",
        HEADERS
    ))));
    let receipts = p.process(&mut changed).unwrap();
    assert_eq!(receipts[0].record_type, RecordType::Response);
    p.shutdown().unwrap();

    let records = read_all(&dir);
    assert!(records
        .iter()
        .all(|r| r.header.record_type != RecordType::Revisit));
}

#[test]
fn test_processor_stats_count_revisits() {
    let dir = TempDir::new().unwrap();
    let p = processor(&dir, Arc::new(MemoryDedupStore::new()));
    for _ in 0..3 {
        p.process(&mut fetch("http://www.one.net/x")).unwrap();
    }
    let stats = p.shutdown().unwrap();
    assert_eq!(stats.fetches_archived, 3);
    assert_eq!(stats.revisits_written, 2);
}

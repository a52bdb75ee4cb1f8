//! Record builders: turn one fetch outcome into the records to store.
//!
//! Builders run in a fixed order and each decides for itself whether it
//! applies. The first record produced for a fetch becomes the concurrent-to
//! target of every later record of that fetch.

use std::sync::Arc;

use tracing::debug;

use crate::config::BuilderSettings;
use crate::error::{ArchiveError, ArchiveResult};
use crate::fetch::{FetchOutcome, HostLookup};
use crate::header_block::HeaderBlock;
use crate::record::{Record, RecordId, RecordType, Truncation};
use crate::replay::ReplaySource;

/// Mimetype of request records.
pub const HTTP_REQUEST_MIMETYPE: &str = "application/http; msgtype=request";
/// Mimetype of HTTP response and revisit records.
pub const HTTP_RESPONSE_MIMETYPE: &str = "application/http; msgtype=response";
/// Mimetype of FTP control-channel transcripts.
pub const FTP_CONTROL_CONVERSATION_MIMETYPE: &str = "text/x-ftp-control-conversation";
/// Mimetype of named-field bodies.
pub const WARC_FIELDS_MIMETYPE: &str = "application/warc-fields";
/// Mimetype of DNS responses.
pub const DNS_MIMETYPE: &str = "text/dns";
/// Mimetype used when nothing better is known.
pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// One step of the builder chain.
pub trait RecordBuilder: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this builder emits a record for `outcome`.
    fn applies(&self, outcome: &FetchOutcome) -> bool;

    /// Build the record.
    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record>;
}

fn response_of(outcome: &FetchOutcome) -> Option<&Arc<dyn ReplaySource>> {
    outcome.recorder.as_ref().and_then(|r| r.response.as_ref())
}

fn require_response(outcome: &FetchOutcome) -> ArchiveResult<&Arc<dyn ReplaySource>> {
    response_of(outcome).ok_or_else(|| ArchiveError::format("content", format!("no recorded response for {}", outcome.url)))
}

fn link(record: Record, concurrent_to: Option<&RecordId>) -> Record {
    match concurrent_to {
        Some(id) => record.with_concurrent_to(id.clone()),
        None => record,
    }
}

fn with_fetch_fields(mut record: Record, outcome: &FetchOutcome, ip: Option<String>) -> Record {
    record.date = outcome.fetch_began;
    record.ip = ip;
    record.payload_digest = outcome.content_digest.clone();
    record.truncated = outcome.truncation();
    record
}

/// DNS response; the resolver's IP goes in the IP header.
#[derive(Debug, Default)]
pub struct DnsResponseBuilder;

impl RecordBuilder for DnsResponseBuilder {
    fn name(&self) -> &'static str {
        "dns-response"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        outcome.scheme() == "dns" && response_of(outcome).is_some()
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let response = require_response(outcome)?;
        let record = Record::new(
            RecordType::Response,
            outcome.url.clone(),
            DNS_MIMETYPE,
            response.size(),
            response.replay(),
        );
        Ok(link(with_fetch_fields(record, outcome, outcome.dns_server_ip.clone()), concurrent_to))
    }
}

/// Full HTTP response, unless a revisit decision replaces it.
pub struct HttpResponseBuilder {
    lookup: Arc<dyn HostLookup>,
}

impl HttpResponseBuilder {
    /// Builder recording IPs from `lookup`.
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self { lookup }
    }
}

impl RecordBuilder for HttpResponseBuilder {
    fn name(&self) -> &'static str {
        "http-response"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        outcome.is_http() && outcome.revisit.is_none() && response_of(outcome).is_some()
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let response = require_response(outcome)?;
        let record = Record::new(
            RecordType::Response,
            outcome.url.clone(),
            HTTP_RESPONSE_MIMETYPE,
            response.size(),
            response.replay(),
        );
        let ip = self.lookup.ip_for(outcome);
        Ok(link(with_fetch_fields(record, outcome, ip), concurrent_to))
    }
}

/// FTP control-channel transcript as a metadata record.
pub struct FtpControlConversationBuilder {
    lookup: Arc<dyn HostLookup>,
}

impl FtpControlConversationBuilder {
    /// Builder recording IPs from `lookup`.
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self { lookup }
    }
}

impl RecordBuilder for FtpControlConversationBuilder {
    fn name(&self) -> &'static str {
        "ftp-control-conversation"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        outcome.scheme() == "ftp" && outcome.ftp_control_conversation.is_some()
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let transcript = outcome.ftp_control_conversation.clone().unwrap_or_default();
        let mut record = Record::from_bytes(
            RecordType::Metadata,
            outcome.url.clone(),
            FTP_CONTROL_CONVERSATION_MIMETYPE,
            transcript,
        )
        .with_date(outcome.fetch_began);
        record.ip = self.lookup.ip_for(outcome);
        Ok(link(record, concurrent_to))
    }
}

/// FTP payload as a resource record.
pub struct FtpResponseBuilder {
    lookup: Arc<dyn HostLookup>,
}

impl FtpResponseBuilder {
    /// Builder recording IPs from `lookup`.
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self { lookup }
    }
}

impl RecordBuilder for FtpResponseBuilder {
    fn name(&self) -> &'static str {
        "ftp-response"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        outcome.scheme() == "ftp" && outcome.revisit.is_none() && response_of(outcome).is_some()
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let response = require_response(outcome)?;
        let mimetype = outcome.content_type.clone().unwrap_or_else(|| DEFAULT_MIMETYPE.to_string());
        let record = Record::new(
            RecordType::Resource,
            outcome.url.clone(),
            mimetype,
            response.size(),
            response.replay(),
        );
        let ip = self.lookup.ip_for(outcome);
        Ok(link(with_fetch_fields(record, outcome, ip), concurrent_to))
    }
}

/// Revisit in place of an HTTP or FTP payload already stored.
///
/// The body keeps the protocol headers plus at most `payload_limit` payload
/// bytes.
pub struct RevisitBuilder {
    lookup: Arc<dyn HostLookup>,
    payload_limit: u64,
}

impl RevisitBuilder {
    /// Builder keeping `payload_limit` payload bytes after the headers.
    pub fn new(lookup: Arc<dyn HostLookup>, payload_limit: u64) -> Self {
        Self {
            lookup,
            payload_limit,
        }
    }
}

impl RecordBuilder for RevisitBuilder {
    fn name(&self) -> &'static str {
        "revisit"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        let scheme = outcome.scheme();
        matches!(scheme.as_str(), "http" | "https" | "ftp")
            && outcome.revisit.is_some()
            && response_of(outcome).is_some()
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let response = require_response(outcome)?;
        let profile = outcome
            .revisit
            .as_ref()
            .ok_or_else(|| ArchiveError::format("revisit", "no revisit decision on outcome"))?;
        let size = response.size();
        let kept = response.content_begin().saturating_add(self.payload_limit).min(size);
        let mimetype = if outcome.is_http() {
            HTTP_RESPONSE_MIMETYPE.to_string()
        } else {
            outcome.content_type.clone().unwrap_or_else(|| DEFAULT_MIMETYPE.to_string())
        };

        let mut record = Record::new(
            RecordType::Revisit,
            outcome.url.clone(),
            mimetype,
            kept,
            response.replay_prefix(kept),
        );
        record.date = outcome.fetch_began;
        record.ip = self.lookup.ip_for(outcome);
        record.payload_digest = profile.digest.clone().or_else(|| outcome.content_digest.clone());
        if kept < size {
            record.truncated = Some(Truncation::Length);
        }
        profile.write_headers(&mut record.extra_headers)?;
        debug!(url = %outcome.url, kept, size, profile = profile.kind.profile_uri(), "built revisit");
        Ok(link(record, concurrent_to))
    }
}

/// HTTP request as sent.
#[derive(Debug, Default)]
pub struct HttpRequestBuilder;

impl RecordBuilder for HttpRequestBuilder {
    fn name(&self) -> &'static str {
        "http-request"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        outcome.is_http()
            && outcome
                .recorder
                .as_ref()
                .map(|r| r.request.is_some())
                .unwrap_or(false)
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let request = outcome
            .recorder
            .as_ref()
            .and_then(|r| r.request.as_ref())
            .ok_or_else(|| ArchiveError::format("content", format!("no recorded request for {}", outcome.url)))?;
        let record = Record::new(
            RecordType::Request,
            outcome.url.clone(),
            HTTP_REQUEST_MIMETYPE,
            request.size(),
            request.replay(),
        )
        .with_date(outcome.fetch_began);
        Ok(link(record, concurrent_to))
    }
}

/// Crawl provenance as `application/warc-fields`.
#[derive(Debug)]
pub struct MetadataBuilder {
    write_outlinks: bool,
}

impl MetadataBuilder {
    /// Builder optionally listing outlinks.
    pub fn new(write_outlinks: bool) -> Self {
        Self { write_outlinks }
    }

    /// Named-field body for `outcome`.
    pub fn body(&self, outcome: &FetchOutcome) -> ArchiveResult<HeaderBlock> {
        let mut fields = HeaderBlock::new();
        if outcome.is_seed {
            fields.push_label("seed")?;
        } else if let Some(via) = &outcome.via {
            fields.push("via", via)?;
        }
        if !outcome.path_from_seed.is_empty() {
            fields.push("hopsFromSeed", &outcome.path_from_seed)?;
        }
        if let Some(tag) = &outcome.source_tag {
            fields.push("sourceTag", tag)?;
        }
        if let Some(ms) = outcome.fetch_duration_ms() {
            fields.push("fetchTimeMs", &ms.to_string())?;
        }
        if let Some(transcript_len) = outcome.ftp_control_conversation.as_ref().map(|t| t.len()) {
            fields.push("ftpControlConversationBytes", &transcript_len.to_string())?;
        }
        if self.write_outlinks {
            for link in &outcome.outlinks {
                fields.push("outlink", link)?;
            }
        }
        Ok(fields)
    }
}

impl RecordBuilder for MetadataBuilder {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        outcome.scheme() != "dns"
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let body = self.body(outcome)?.to_bytes();
        let record = Record::from_bytes(RecordType::Metadata, outcome.url.clone(), WARC_FIELDS_MIMETYPE, body)
            .with_date(outcome.fetch_began);
        Ok(link(record, concurrent_to))
    }
}

/// Resource record for schemes no other builder handles.
pub struct GenericResourceBuilder {
    lookup: Arc<dyn HostLookup>,
}

impl GenericResourceBuilder {
    /// Builder recording IPs from `lookup`.
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self { lookup }
    }
}

impl RecordBuilder for GenericResourceBuilder {
    fn name(&self) -> &'static str {
        "generic-resource"
    }

    fn applies(&self, outcome: &FetchOutcome) -> bool {
        !matches!(outcome.scheme().as_str(), "http" | "https" | "dns" | "ftp") && response_of(outcome).is_some()
    }

    fn build(&self, outcome: &FetchOutcome, concurrent_to: Option<&RecordId>) -> ArchiveResult<Record> {
        let response = require_response(outcome)?;
        let mimetype = outcome.content_type.clone().unwrap_or_else(|| DEFAULT_MIMETYPE.to_string());
        let record = Record::new(
            RecordType::Resource,
            outcome.url.clone(),
            mimetype,
            response.size(),
            response.replay(),
        );
        let ip = self.lookup.ip_for(outcome);
        Ok(link(with_fetch_fields(record, outcome, ip), concurrent_to))
    }
}

/// Ordered list of builders.
pub struct BuilderChain {
    builders: Vec<Box<dyn RecordBuilder>>,
}

impl BuilderChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self { builders: Vec::new() }
    }

    /// Standard chain: DNS response, HTTP response, FTP control conversation,
    /// FTP response, generic resource, revisit, HTTP request, metadata.
    ///
    /// Payload builders come first so the payload record is the one every
    /// later record points at.
    pub fn standard(settings: &BuilderSettings, lookup: Arc<dyn HostLookup>) -> Self {
        let mut chain = Self::new();
        chain.push(Box::new(DnsResponseBuilder));
        chain.push(Box::new(HttpResponseBuilder::new(Arc::clone(&lookup))));
        chain.push(Box::new(FtpControlConversationBuilder::new(Arc::clone(&lookup))));
        chain.push(Box::new(FtpResponseBuilder::new(Arc::clone(&lookup))));
        chain.push(Box::new(GenericResourceBuilder::new(Arc::clone(&lookup))));
        chain.push(Box::new(RevisitBuilder::new(lookup, settings.revisit_payload_limit)));
        if settings.write_requests {
            chain.push(Box::new(HttpRequestBuilder));
        }
        if settings.write_metadata {
            chain.push(Box::new(MetadataBuilder::new(settings.write_metadata_outlinks)));
        }
        chain
    }

    /// Append a builder.
    pub fn push(&mut self, builder: Box<dyn RecordBuilder>) {
        self.builders.push(builder);
    }

    /// Builder names in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.builders.iter().map(|b| b.name()).collect()
    }

    /// Every record for `outcome`, in chain order.
    pub fn build_all(&self, outcome: &FetchOutcome) -> ArchiveResult<Vec<Record>> {
        let mut records: Vec<Record> = Vec::new();
        let mut primary: Option<RecordId> = None;
        for builder in &self.builders {
            if !builder.applies(outcome) {
                continue;
            }
            let record = builder.build(outcome, primary.as_ref())?;
            debug!(builder = builder.name(), url = %outcome.url, record_type = %record.record_type, "built record");
            if primary.is_none() {
                primary = Some(record.id.clone());
            }
            records.push(record);
        }
        Ok(records)
    }
}

impl Default for BuilderChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field;
    use crate::dedup::{RevisitProfile, StoredRecordRef};
    use crate::fetch::{OutcomeHostLookup, LENGTH_TRUNC};
    use crate::replay::{RecordedBytes, Recorder};
    use chrono::Utc;

    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>hello</html>";
    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n";

    fn chain() -> BuilderChain {
        BuilderChain::standard(&BuilderSettings::default(), Arc::new(OutcomeHostLookup))
    }

    fn http_outcome() -> FetchOutcome {
        let mut o = FetchOutcome::new("http://a.example/", Utc::now());
        o.status = 200;
        o.server_ip = Some("192.0.2.1".to_string());
        o.content_digest = Some("sha256:ABC".to_string());
        o.recorder = Some(Recorder::exchange(
            RecordedBytes::http(REQUEST),
            RecordedBytes::http(RESPONSE),
        ));
        o.via = Some("http://seed.example/".to_string());
        o.path_from_seed = "L".to_string();
        o.outlinks = vec!["http://a.example/next".to_string()];
        o
    }

    fn body_of(mut record: Record) -> Vec<u8> {
        let mut out = Vec::new();
        record.content_mut().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_standard_order() {
        assert_eq!(
            chain().names(),
            vec![
                "dns-response",
                "http-response",
                "ftp-control-conversation",
                "ftp-response",
                "generic-resource",
                "revisit",
                "http-request",
                "metadata"
            ]
        );
    }

    #[test]
    fn test_http_fetch_records() {
        let records = chain().build_all(&http_outcome()).unwrap();
        let types: Vec<_> = records.iter().map(|r| r.record_type).collect();
        assert_eq!(types, vec![RecordType::Response, RecordType::Request, RecordType::Metadata]);

        let response_id = records[0].id.clone();
        assert_eq!(records[0].concurrent_to, None);
        assert_eq!(records[0].ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(records[0].payload_digest.as_deref(), Some("sha256:ABC"));
        assert_eq!(records[0].mimetype, HTTP_RESPONSE_MIMETYPE);
        assert_eq!(records[1].concurrent_to.as_ref(), Some(&response_id));
        assert_eq!(records[2].concurrent_to.as_ref(), Some(&response_id));
    }

    #[test]
    fn test_metadata_body() {
        let records = chain().build_all(&http_outcome()).unwrap();
        let metadata = records.into_iter().last().unwrap();
        let text = String::from_utf8(body_of(metadata)).unwrap();
        assert!(text.contains("via: http://seed.example/\r\n"));
        assert!(text.contains("hopsFromSeed: L\r\n"));
        assert!(text.contains("outlink: http://a.example/next\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_seed_label() {
        let mut o = http_outcome();
        o.is_seed = true;
        o.source_tag = Some("seeds.txt".to_string());
        let fields = MetadataBuilder::new(false).body(&o).unwrap();
        assert!(fields.contains("seed"));
        assert!(!fields.contains("via"));
        assert!(!fields.contains("outlink"));
        assert_eq!(fields.get("sourceTag"), Some("seeds.txt"));
    }

    #[test]
    fn test_revisit_replaces_response() {
        let mut o = http_outcome();
        let original = StoredRecordRef {
            id: RecordId::generate(),
            url: "http://a.example/".to_string(),
            date: Utc::now(),
            path: None,
            offset: None,
        };
        o.revisit = Some(RevisitProfile::identical_digest("sha256:ABC", &original));
        let records = chain().build_all(&o).unwrap();
        let types: Vec<_> = records.iter().map(|r| r.record_type).collect();
        assert_eq!(types, vec![RecordType::Revisit, RecordType::Request, RecordType::Metadata]);

        let revisit = records.into_iter().next().unwrap();
        assert_eq!(revisit.extra_headers.get(field::REFERS_TO), Some(original.id.as_str()));
        assert_eq!(revisit.truncated, Some(Truncation::Length));
        let header_len = RecordedBytes::http(RESPONSE).content_begin();
        assert_eq!(revisit.content_length, header_len);
        let body = body_of(revisit);
        assert!(body.ends_with(b"\r\n\r\n"));
        assert!(!body.windows(5).any(|w| w == b"hello"));
    }

    #[test]
    fn test_revisit_payload_limit() {
        let mut o = http_outcome();
        o.revisit = Some(RevisitProfile::server_not_modified(None, None));
        let builder = RevisitBuilder::new(Arc::new(OutcomeHostLookup), 6);
        let record = builder.build(&o, None).unwrap();
        let body = body_of(record);
        assert!(body.ends_with(b"<html>"));
    }

    #[test]
    fn test_revisit_unbounded_limit_keeps_everything() {
        let mut o = http_outcome();
        o.revisit = Some(RevisitProfile::server_not_modified(None, None));
        let builder = RevisitBuilder::new(Arc::new(OutcomeHostLookup), u64::MAX);
        let record = builder.build(&o, None).unwrap();
        assert_eq!(record.content_length, RESPONSE.len() as u64);
        assert_eq!(record.truncated, None);
        assert_eq!(body_of(record), RESPONSE);
    }

    #[test]
    fn test_truncated_response() {
        let mut o = http_outcome();
        o.annotations.push(LENGTH_TRUNC.to_string());
        let records = chain().build_all(&o).unwrap();
        assert_eq!(records[0].truncated, Some(Truncation::Length));
    }

    #[test]
    fn test_dns_record() {
        let mut o = FetchOutcome::new("dns:a.example", Utc::now());
        o.status = 1;
        o.dns_server_ip = Some("9.9.9.9".to_string());
        o.recorder = Some(Recorder::response_only(RecordedBytes::new(&b"20240101000000\na.example. 300 IN A 192.0.2.1\n"[..])));
        let records = chain().build_all(&o).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mimetype, DNS_MIMETYPE);
        assert_eq!(records[0].ip.as_deref(), Some("9.9.9.9"));
    }

    #[test]
    fn test_ftp_records() {
        let mut o = FetchOutcome::new("ftp://files.example/pub/a.txt", Utc::now());
        o.status = 226;
        o.content_type = Some("text/plain".to_string());
        o.ftp_control_conversation = Some("220 ready\r\nUSER anonymous\r\n".to_string());
        o.recorder = Some(Recorder::response_only(RecordedBytes::new(&b"file contents"[..])));
        let records = chain().build_all(&o).unwrap();
        let types: Vec<_> = records.iter().map(|r| r.record_type).collect();
        assert_eq!(types, vec![RecordType::Metadata, RecordType::Resource, RecordType::Metadata]);
        assert_eq!(records[0].mimetype, FTP_CONTROL_CONVERSATION_MIMETYPE);
        assert_eq!(records[1].concurrent_to.as_ref(), Some(&records[0].id));
    }

    #[test]
    fn test_generic_fallback() {
        let mut o = FetchOutcome::new("whois://whois.example/a.example", Utc::now());
        o.status = 1000;
        o.recorder = Some(Recorder::response_only(RecordedBytes::new(&b"Domain: a.example"[..])));
        let records = chain().build_all(&o).unwrap();
        let types: Vec<_> = records.iter().map(|r| r.record_type).collect();
        assert_eq!(types, vec![RecordType::Resource, RecordType::Metadata]);
        assert_eq!(records[0].mimetype, DEFAULT_MIMETYPE);
        assert!(records[0].concurrent_to.is_none());
        assert_eq!(records[1].concurrent_to.as_ref(), Some(&records[0].id));
    }

    #[test]
    fn test_settings_disable_requests_and_metadata() {
        let settings = BuilderSettings {
            write_requests: false,
            write_metadata: false,
            ..BuilderSettings::default()
        };
        let chain = BuilderChain::standard(&settings, Arc::new(OutcomeHostLookup));
        let records = chain.build_all(&http_outcome()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, RecordType::Response);
    }
}

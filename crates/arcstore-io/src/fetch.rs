//! Fetch outcomes handed to the engine by the crawler.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::dedup::RevisitProfile;
use crate::record::Truncation;
use crate::replay::Recorder;

/// Annotation set when a byte-length cap cut the fetch short.
pub const LENGTH_TRUNC: &str = "lenTrunc";
/// Annotation set when a time cap cut the fetch short.
pub const TIMER_TRUNC: &str = "timeTrunc";
/// Annotation set when only headers were kept.
pub const HEADER_TRUNC: &str = "headerTrunc";
/// Suffix shared by every truncation annotation.
pub const TRUNC_SUFFIX: &str = "Trunc";

/// Everything the engine needs to know about one completed fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Fetched URL.
    pub url: String,
    /// URL this one was discovered from.
    pub via: Option<String>,
    /// Hop path from the seed, one letter per hop.
    pub path_from_seed: String,
    /// True for seeds.
    pub is_seed: bool,
    /// Tag of the seed source.
    pub source_tag: Option<String>,
    /// When fetching started.
    pub fetch_began: DateTime<Utc>,
    /// When fetching finished.
    pub fetch_completed: Option<DateTime<Utc>>,
    /// Protocol status; positive on success.
    pub status: i32,
    /// Mimetype reported by the server.
    pub content_type: Option<String>,
    /// IP the fetcher connected to.
    pub server_ip: Option<String>,
    /// Free-form annotations, including truncation reasons.
    pub annotations: Vec<String>,
    /// Digest of the payload.
    pub content_digest: Option<String>,
    /// Revisit decision, set by the dedup step.
    pub revisit: Option<RevisitProfile>,
    /// Discovered links.
    pub outlinks: Vec<String>,
    /// Recorded bytes.
    pub recorder: Option<Recorder>,
    /// FTP control-channel transcript.
    pub ftp_control_conversation: Option<String>,
    /// Resolver that answered a DNS lookup.
    pub dns_server_ip: Option<String>,
    /// Server ETag.
    pub etag: Option<String>,
    /// Server Last-Modified.
    pub last_modified: Option<String>,
}

impl FetchOutcome {
    /// Outcome for `url` with everything else empty.
    pub fn new(url: impl Into<String>, fetch_began: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            via: None,
            path_from_seed: String::new(),
            is_seed: false,
            source_tag: None,
            fetch_began,
            fetch_completed: None,
            status: 0,
            content_type: None,
            server_ip: None,
            annotations: Vec::new(),
            content_digest: None,
            revisit: None,
            outlinks: Vec::new(),
            recorder: None,
            ftp_control_conversation: None,
            dns_server_ip: None,
            etag: None,
            last_modified: None,
        }
    }

    /// Lowercased scheme, empty when the URL has none.
    pub fn scheme(&self) -> String {
        match self.url.split_once(':') {
            Some((scheme, _)) if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) => {
                scheme.to_ascii_lowercase()
            }
            _ => String::new(),
        }
    }

    /// True for `http` and `https`.
    pub fn is_http(&self) -> bool {
        matches!(self.scheme().as_str(), "http" | "https")
    }

    /// Host part of the URL.
    pub fn host(&self) -> Option<&str> {
        host_of(&self.url)
    }

    /// Truncation reason derived from annotations.
    pub fn truncation(&self) -> Option<Truncation> {
        let mut found = None;
        for a in &self.annotations {
            let reason = match a.as_str() {
                LENGTH_TRUNC => Truncation::Length,
                TIMER_TRUNC => Truncation::Time,
                HEADER_TRUNC => Truncation::Head,
                other if other.ends_with(TRUNC_SUFFIX) => Truncation::Unspecified,
                _ => continue,
            };
            found.get_or_insert(reason);
        }
        found
    }

    /// Milliseconds between begin and completion.
    pub fn fetch_duration_ms(&self) -> Option<i64> {
        self.fetch_completed
            .map(|done| (done - self.fetch_began).num_milliseconds())
    }

    /// True when there is something worth archiving.
    pub fn should_archive(&self) -> bool {
        self.status > 0
            && self
                .recorder
                .as_ref()
                .map(|r| r.response.is_some())
                .unwrap_or(false)
    }
}

/// Host of a URL such as `http://user@host:80/path`.
pub fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, r)| r).or_else(|| url.split_once(':').map(|(_, r)| r))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host_port = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = if host_port.starts_with('[') {
        host_port.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(host_port)
    } else {
        host_port.split(':').next().unwrap_or(host_port)
    };
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Resolves the IP to record for a fetch.
pub trait HostLookup: Send + Sync {
    /// IP of the server contacted for `outcome`.
    fn ip_for(&self, outcome: &FetchOutcome) -> Option<String>;
}

/// Uses the IP the fetcher reported on the outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutcomeHostLookup;

impl HostLookup for OutcomeHostLookup {
    fn ip_for(&self, outcome: &FetchOutcome) -> Option<String> {
        outcome.server_ip.clone()
    }
}

/// Fixed host table, falling back to the outcome's own IP.
#[derive(Debug, Default, Clone)]
pub struct StaticHostLookup {
    hosts: HashMap<String, String>,
}

impl StaticHostLookup {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `host` to `ip`.
    pub fn insert(&mut self, host: impl Into<String>, ip: impl Into<String>) {
        self.hosts.insert(host.into().to_ascii_lowercase(), ip.into());
    }
}

impl HostLookup for StaticHostLookup {
    fn ip_for(&self, outcome: &FetchOutcome) -> Option<String> {
        outcome
            .host()
            .and_then(|h| self.hosts.get(&h.to_ascii_lowercase()).cloned())
            .or_else(|| outcome.server_ip.clone())
    }
}

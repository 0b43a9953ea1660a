//! Usage statistics and rate-limit bookkeeping for a single client.
//!
//! Both caches are single-slot. The stats snapshot stays valid until a write
//! invalidates it; the rate-limit snapshot is replaced by every append.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use crate::{Error, Result};

pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-rate-limit-remaining";
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-rate-limit-limit";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-rate-limit-reset";
/// Assumed name; the service's remaining-bytes header is not confirmed.
pub const REMAINING_BYTES_HEADER: &str = "x-rate-limit-remaining-bytes";

/// Stream storage statistics from the stats endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(rename = "used")]
    pub used_bytes: u64,
    #[serde(rename = "cap")]
    pub cap_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(rename = "pageCount", default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u64>,
}

/// The values reported in rate-limit response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    RemainingRequests,
    RequestLimit,
    ResetTime,
    RemainingBytes,
}

impl RateLimitKind {
    pub fn header(&self) -> &'static str {
        match self {
            RateLimitKind::RemainingRequests => RATE_LIMIT_REMAINING_HEADER,
            RateLimitKind::RequestLimit => RATE_LIMIT_LIMIT_HEADER,
            RateLimitKind::ResetTime => RATE_LIMIT_RESET_HEADER,
            RateLimitKind::RemainingBytes => REMAINING_BYTES_HEADER,
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateLimitKind::RemainingRequests => "remaining requests",
            RateLimitKind::RequestLimit => "request limit",
            RateLimitKind::ResetTime => "reset time",
            RateLimitKind::RemainingBytes => "remaining bytes",
        };
        f.write_str(name)
    }
}

/// Rate-limit values captured from the most recent append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub remaining_requests: Option<i64>,
    pub request_limit: Option<i64>,
    pub reset_time: Option<i64>,
    pub remaining_bytes: Option<i64>,
}

impl RateLimitSnapshot {
    /// Build a snapshot from response headers keyed by lower-cased name.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let read = |kind: RateLimitKind| headers.get(kind.header()).and_then(|v| parse_header_number(v));
        Self {
            remaining_requests: read(RateLimitKind::RemainingRequests),
            request_limit: read(RateLimitKind::RequestLimit),
            reset_time: read(RateLimitKind::ResetTime),
            remaining_bytes: read(RateLimitKind::RemainingBytes),
        }
    }

    pub fn get(&self, kind: RateLimitKind) -> Option<i64> {
        match kind {
            RateLimitKind::RemainingRequests => self.remaining_requests,
            RateLimitKind::RequestLimit => self.request_limit,
            RateLimitKind::ResetTime => self.reset_time,
            RateLimitKind::RemainingBytes => self.remaining_bytes,
        }
    }
}

fn parse_header_number(value: &str) -> Option<i64> {
    let value = value.trim();
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|f| f as i64))
}

/// Per-client cache of usage statistics and rate-limit headers.
#[derive(Debug, Default)]
pub struct UsageTracker {
    usage: Option<UsageSnapshot>,
    rate_limit: Option<RateLimitSnapshot>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached snapshot, calling `fetch` only when the cache is
    /// empty or `force_refresh` is set.
    pub async fn get_usage<F, Fut>(&mut self, force_refresh: bool, fetch: F) -> Result<UsageSnapshot>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UsageSnapshot>>,
    {
        if !force_refresh {
            if let Some(ref usage) = self.usage {
                return Ok(usage.clone());
            }
        }

        let usage = fetch().await?;
        self.usage = Some(usage.clone());
        Ok(usage)
    }

    pub fn invalidate(&mut self) {
        self.usage = None;
    }

    pub fn is_stale(&self) -> bool {
        self.usage.is_none()
    }

    pub fn record_rate_limit_headers(&mut self, headers: &HashMap<String, String>) {
        self.rate_limit = Some(RateLimitSnapshot::from_headers(headers));
    }

    pub fn rate_limit_snapshot(&self) -> Option<&RateLimitSnapshot> {
        self.rate_limit.as_ref()
    }

    /// Read one rate-limit value, [`Error::Unavailable`] before any append
    /// or when the last append did not report it.
    pub fn get_rate_limit(&self, kind: RateLimitKind) -> Result<i64> {
        self.rate_limit
            .as_ref()
            .and_then(|snapshot| snapshot.get(kind))
            .ok_or(Error::Unavailable(kind))
    }
}

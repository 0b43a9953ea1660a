use std::collections::HashSet;
use std::fmt;
use tokio::sync::{Mutex, OnceCell};

use crate::codec::{EncryptedJson, PlainJson, Value, ValueCodec, TIMESTAMP};
use crate::config::ClientSettings;
use crate::query::{render_query, validate_options, QueryOptions};
use crate::record::{sort_records, Record};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport};
use crate::usage::{RateLimitKind, UsageSnapshot, UsageTracker};
use crate::{Error, Result};

/// Returned by the rate-limit accessors before any append has succeeded.
pub const RATE_LIMIT_UNAVAILABLE: i64 = -1;

/// Header carrying the private key on a clear request.
pub const PRIVATE_KEY_HEADER: &str = "Phant-Private-Key";

/// Keys and location of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIdentity {
    pub public_key: String,
    pub private_key: Option<String>,
    pub delete_key: Option<String>,
    pub base_url: String,
    pub title: Option<String>,
}

impl StreamIdentity {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            public_key: settings.public_key.clone(),
            private_key: settings.private_key.clone(),
            delete_key: settings.delete_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            title: settings.title.clone(),
        }
    }
}

/// Client for one stream.
///
/// Cached usage statistics and rate-limit headers live behind a per-client
/// mutex, so a client can be shared through an `Arc`. Two appends racing
/// may still interleave their cache invalidation.
pub struct StreamClient {
    identity: StreamIdentity,
    fields: OnceCell<Vec<String>>,
    codec: Box<dyn ValueCodec>,
    transport: Box<dyn Transport>,
    usage: Mutex<UsageTracker>,
}

impl StreamClient {
    /// Create a client. An empty `fields` list is discovered from the server
    /// on first use.
    pub fn new(
        identity: StreamIdentity,
        fields: Vec<String>,
        codec: Box<dyn ValueCodec>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if field == TIMESTAMP {
                return Err(Error::Validation(format!("'{}' is a reserved field name", TIMESTAMP)));
            }
            if !seen.insert(field.as_str()) {
                return Err(Error::Validation(format!("duplicate field name '{}'", field)));
            }
        }

        let fields = if fields.is_empty() { None } else { Some(fields) };
        Ok(Self {
            identity,
            fields: OnceCell::new_with(fields),
            codec,
            transport,
            usage: Mutex::new(UsageTracker::new()),
        })
    }

    /// Build a client from settings with the HTTP transport. A passphrase
    /// selects the encrypted codec.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let codec: Box<dyn ValueCodec> = match settings.passphrase {
            Some(ref passphrase) => Box::new(EncryptedJson::new(passphrase)),
            None => Box::new(PlainJson),
        };
        Self::new(
            StreamIdentity::from_settings(settings),
            settings.fields.clone(),
            codec,
            Box::new(HttpTransport::new()),
        )
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    pub fn public_key(&self) -> &str {
        &self.identity.public_key
    }

    pub fn title(&self) -> Option<&str> {
        self.identity.title.as_deref()
    }

    pub fn input_url(&self, extension: &str) -> String {
        self.url_for("input", extension)
    }

    pub fn output_url(&self, extension: &str) -> String {
        self.url_for("output", extension)
    }

    pub fn manage_url(&self, extension: &str) -> String {
        self.url_for("streams", extension)
    }

    fn url_for(&self, command: &str, extension: &str) -> String {
        format!(
            "{}/{}/{}{}",
            self.identity.base_url, command, self.identity.public_key, extension
        )
    }

    fn require_private_key(&self, action: &'static str) -> Result<&str> {
        self.identity
            .private_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(Error::MissingCredential(action))
    }

    /// The stream's field names, discovered from the server if the client was
    /// built without them.
    pub async fn fields(&self) -> Result<&[String]> {
        let fields = self.fields.get_or_try_init(|| self.discover_fields()).await?;
        Ok(fields.as_slice())
    }

    /// Field names plus `timestamp`.
    pub async fn extended_fields(&self) -> Result<Vec<String>> {
        let mut fields = self.fields().await?.to_vec();
        fields.push(TIMESTAMP.to_string());
        Ok(fields)
    }

    /// Append one row. `values` line up positionally with [`fields`](Self::fields).
    pub async fn append(&self, values: &[Value]) -> Result<()> {
        let private_key = self.require_private_key("log data")?;
        let fields = self.fields().await?;
        if values.len() != fields.len() {
            return Err(Error::Validation(format!(
                "expected {} values for fields [{}], got {}",
                fields.len(),
                fields.join(", "),
                values.len()
            )));
        }

        let mut form = Vec::with_capacity(fields.len() + 1);
        form.push(("private_key".to_string(), private_key.to_string()));
        for (field, value) in fields.iter().zip(values) {
            form.push((field.clone(), self.codec.encode(value)?));
        }

        let request = HttpRequest::new(Method::Post, self.input_url(".json")).with_form(form);
        let response = self.transport.send(request).await?;
        check_envelope(&response)?;

        let mut usage = self.usage.lock().await;
        usage.invalidate();
        usage.record_rate_limit_headers(&response.headers);
        tracing::debug!(stream = %self.identity.public_key, "appended row");
        Ok(())
    }

    /// Delete every row of the stream. Only transport failures are reported.
    pub async fn clear(&self) -> Result<()> {
        let private_key = self.require_private_key("clear data")?;
        let request = HttpRequest::new(Method::Delete, self.input_url(""))
            .with_header(PRIVATE_KEY_HEADER, private_key);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(Error::Transport(format!("HTTP {}: {}", response.status, response.body)));
        }
        tracing::debug!(stream = %self.identity.public_key, "cleared stream");
        Ok(())
    }

    /// Fetch rows, filtered and limited server side, optionally sorted.
    pub async fn query(&self, options: &QueryOptions) -> Result<Vec<Record>> {
        validate_options(options)?;
        let known_fields = self.query_fields(options).await?;
        let query = render_query(options, &known_fields)?;

        let request = HttpRequest::new(Method::Get, self.output_url(".json")).with_query(query);
        let response = self.transport.send(request).await?;
        let rows = match check_envelope(&response)? {
            Some(serde_json::Value::Array(rows)) => rows,
            _ => {
                return Err(Error::Decode(format!(
                    "expected a JSON array of rows, got: {}",
                    response.body
                )))
            }
        };

        let zoned = options.timezone.is_some();
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let row = match row {
                serde_json::Value::Object(row) => row,
                other => return Err(Error::Decode(format!("row is not an object: {}", other))),
            };
            records.push(Record::decode(row, self.codec.as_ref(), options.convert_timestamp, zoned)?);
        }

        if let Some(ref field) = options.sort_by {
            sort_records(&mut records, field);
        }
        Ok(records)
    }

    // Field names a query may reference. Discovery only runs when the query
    // names a non-timestamp field and a private key is available; otherwise
    // only `timestamp` is known.
    async fn query_fields(&self, options: &QueryOptions) -> Result<HashSet<String>> {
        if !options.references_fields() {
            return Ok(HashSet::new());
        }
        let only_timestamp = options.referenced_fields().all(|field| field == TIMESTAMP);
        let can_discover = self.require_private_key("discover fields").is_ok();
        if self.fields.initialized() || (!only_timestamp && can_discover) {
            return Ok(self.extended_fields().await?.into_iter().collect());
        }
        Ok(HashSet::from([TIMESTAMP.to_string()]))
    }

    /// Storage statistics, fetched once and cached until the next append.
    pub async fn stats(&self, force_refresh: bool) -> Result<UsageSnapshot> {
        let mut usage = self.usage.lock().await;
        let snapshot = usage.get_usage(force_refresh, || self.fetch_stats()).await?;
        Ok(snapshot)
    }

    pub async fn used_bytes(&self) -> Result<u64> {
        Ok(self.stats(false).await?.used_bytes)
    }

    pub async fn cap(&self) -> Result<u64> {
        Ok(self.stats(false).await?.cap_bytes)
    }

    async fn fetch_stats(&self) -> Result<UsageSnapshot> {
        let request = HttpRequest::new(Method::Get, self.output_url("/stats.json"));
        let response = self.transport.send(request).await?;
        match check_envelope(&response)? {
            Some(body) => Ok(serde_json::from_value(body)?),
            None => Err(Error::Decode(format!("stats response is not JSON: {}", response.body))),
        }
    }

    /// Read a rate-limit value from the last append, without the sentinel.
    pub async fn rate_limit(&self, kind: RateLimitKind) -> Result<i64> {
        self.usage.lock().await.get_rate_limit(kind)
    }

    pub async fn remaining_requests(&self) -> i64 {
        self.rate_limit_or_sentinel(RateLimitKind::RemainingRequests).await
    }

    pub async fn request_limit(&self) -> i64 {
        self.rate_limit_or_sentinel(RateLimitKind::RequestLimit).await
    }

    pub async fn reset_time(&self) -> i64 {
        self.rate_limit_or_sentinel(RateLimitKind::ResetTime).await
    }

    pub async fn remaining_bytes(&self) -> i64 {
        self.rate_limit_or_sentinel(RateLimitKind::RemainingBytes).await
    }

    async fn rate_limit_or_sentinel(&self, kind: RateLimitKind) -> i64 {
        match self.rate_limit(kind).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "unable to gather limit statistics until a row is appended, returning -1");
                RATE_LIMIT_UNAVAILABLE
            }
        }
    }

    // Fallback for servers without schema introspection: post an empty row
    // and read the expected field list out of the validation error.
    async fn discover_fields(&self) -> Result<Vec<String>> {
        let private_key = self.require_private_key("discover fields")?;
        let request = HttpRequest::new(Method::Post, self.input_url(".json"))
            .with_form(vec![("private_key".to_string(), private_key.to_string())]);
        let response = self.transport.send(request).await?;
        if response.is_success() {
            // The empty row was accepted and stored.
            let mut usage = self.usage.lock().await;
            usage.invalidate();
            usage.record_rate_limit_headers(&response.headers);
        }

        let body: serde_json::Value = serde_json::from_str(&response.body)
            .map_err(|_| Error::Discovery(response.body.clone()))?;
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .ok_or_else(|| Error::Discovery(response.body.clone()))?;

        let fields = parse_expected_fields(message)?;
        tracing::debug!(stream = %self.identity.public_key, ?fields, "discovered fields");
        Ok(fields)
    }
}

impl fmt::Display for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phant@{}", self.identity.public_key)
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("public_key", &self.identity.public_key)
            .field("base_url", &self.identity.base_url)
            .field("title", &self.identity.title)
            .field("fields", &self.fields.get())
            .finish_non_exhaustive()
    }
}

/// Raise the service's `{"success": false, "message": ...}` envelope as
/// [`Error::RemoteRejected`] and any other non-2xx status as a transport
/// failure. Returns the parsed body when it is JSON.
fn check_envelope(response: &HttpResponse) -> Result<Option<serde_json::Value>> {
    let parsed = serde_json::from_str::<serde_json::Value>(&response.body).ok();
    if let Some(serde_json::Value::Object(ref obj)) = parsed {
        if obj.get("success").and_then(|s| s.as_bool()) == Some(false) {
            let message = obj
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("request failed without a message");
            return Err(Error::RemoteRejected(message.to_string()));
        }
    }
    if !response.is_success() {
        return Err(Error::Transport(format!("HTTP {}: {}", response.status, response.body)));
    }
    Ok(parsed)
}

/// Pull the field list out of a message like `... expecting: temp, humidity`.
pub fn parse_expected_fields(message: &str) -> Result<Vec<String>> {
    let (_, expected) = message
        .split_once("expecting:")
        .ok_or_else(|| Error::Discovery(message.to_string()))?;

    let fields: Vec<String> = expected
        .trim()
        .trim_end_matches('.')
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    if fields.is_empty() {
        return Err(Error::Discovery(message.to_string()));
    }
    Ok(fields)
}

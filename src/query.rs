//! Query construction for the stream output endpoint.
//!
//! The service expects bracketed filter keys such as `eq[temperature]=23`.
//! Generic URL encoders mangle those brackets, so [`render_query`] produces
//! the literal `key=value&...` text and the transport appends it verbatim.

use std::collections::HashSet;
use std::fmt;

use crate::{Error, Result};

/// Comparison operators understood by the output endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    /// Regular expression match
    Grep,
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl FilterOp {
    /// Evaluation order used when rendering filters.
    pub const ALL: [FilterOp; 7] = [
        FilterOp::Grep,
        FilterOp::Eq,
        FilterOp::Ne,
        FilterOp::Gt,
        FilterOp::Lt,
        FilterOp::Gte,
        FilterOp::Lte,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Grep => "grep",
            FilterOp::Eq => "eq",
            FilterOp::Ne => "ne",
            FilterOp::Gt => "gt",
            FilterOp::Lt => "lt",
            FilterOp::Gte => "gte",
            FilterOp::Lte => "lte",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single server-side row predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression {
    pub field: String,
    pub op: FilterOp,
    pub operand: String,
}

impl FilterExpression {
    pub fn new(op: FilterOp, field: impl Into<String>, operand: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op,
            operand: operand.into(),
        }
    }

    /// Check the field against the stream's extended field set.
    pub fn validate(&self, known_fields: &HashSet<String>) -> Result<()> {
        if !known_fields.contains(&self.field) {
            return Err(unknown_field(&self.field, known_fields));
        }
        Ok(())
    }

    /// The `op[field]` key and its operand.
    pub fn to_pair(&self) -> (String, String) {
        (format!("{}[{}]", self.op, self.field), self.operand.clone())
    }
}

/// Options accepted by a stream query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub sample: Option<u64>,
    /// IANA zone name, e.g. `America/Chicago`
    pub timezone: Option<String>,
    pub filters: Vec<FilterExpression>,
    pub sort_by: Option<String>,
    pub convert_timestamp: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: None,
            offset: None,
            sample: None,
            timezone: None,
            filters: Vec::new(),
            sort_by: None,
            convert_timestamp: true,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn sample(mut self, sample: u64) -> Self {
        self.sample = Some(sample);
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn filter(mut self, op: FilterOp, field: impl Into<String>, operand: impl Into<String>) -> Self {
        self.filters.push(FilterExpression::new(op, field, operand));
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.sort_by = Some(field.into());
        self
    }

    pub fn raw_timestamps(mut self) -> Self {
        self.convert_timestamp = false;
        self
    }

    /// Whether validating these options needs the stream's field list.
    pub fn references_fields(&self) -> bool {
        !self.filters.is_empty() || self.sort_by.is_some()
    }

    /// Field names named by filters and `sort_by`.
    pub fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        self.filters
            .iter()
            .map(|f| f.field.as_str())
            .chain(self.sort_by.as_deref())
    }
}

/// Checks that hold whatever the stream's fields are: positive numerics, a
/// non-empty timezone and at most one filter per operator.
pub fn validate_options(options: &QueryOptions) -> Result<()> {
    for (name, value) in [
        ("limit", options.limit),
        ("offset", options.offset),
        ("sample", options.sample),
    ] {
        if value == Some(0) {
            return Err(Error::Validation(format!("{} must be a positive integer", name)));
        }
    }

    if let Some(ref tz) = options.timezone {
        if tz.trim().is_empty() {
            return Err(Error::Validation("timezone must be a non-empty string".to_string()));
        }
    }

    for op in FilterOp::ALL {
        if options.filters.iter().filter(|f| f.op == op).count() > 1 {
            return Err(Error::Validation(format!("at most one {} filter per query", op)));
        }
    }
    Ok(())
}

/// Validate `options` and build the ordered query parameters.
///
/// Order: limit, offset, sample, timezone, then filters in [`FilterOp::ALL`] order.
pub fn build_params(options: &QueryOptions, known_fields: &HashSet<String>) -> Result<Vec<(String, String)>> {
    validate_options(options)?;
    let mut params = Vec::new();

    for (name, value) in [
        ("limit", options.limit),
        ("offset", options.offset),
        ("sample", options.sample),
    ] {
        if let Some(n) = value {
            params.push((name.to_string(), n.to_string()));
        }
    }

    if let Some(ref tz) = options.timezone {
        params.push(("timezone".to_string(), tz.clone()));
    }

    for filter in &options.filters {
        filter.validate(known_fields)?;
    }

    for op in FilterOp::ALL {
        if let Some(filter) = options.filters.iter().find(|f| f.op == op) {
            tracing::debug!(op = %op, field = %filter.field, "adding filter");
            params.push(filter.to_pair());
        }
    }

    if let Some(ref field) = options.sort_by {
        if !known_fields.contains(field) {
            return Err(unknown_field(field, known_fields));
        }
    }

    Ok(params)
}

/// Render the query as unescaped `key=value` pairs joined by `&`.
pub fn render_query(options: &QueryOptions, known_fields: &HashSet<String>) -> Result<String> {
    let params = build_params(options, known_fields)?;
    Ok(params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&"))
}

fn unknown_field(field: &str, known_fields: &HashSet<String>) -> Error {
    let mut known: Vec<&str> = known_fields.iter().map(String::as_str).collect();
    known.sort_unstable();
    Error::Validation(format!(
        "Field '{}' not in the known list of fields: {}",
        field,
        known.join(", ")
    ))
}

//! Phant client: append to, query and clear Phant data-logging streams.
//!
//! A stream is an append-only table identified by a public key. Rows hold
//! user-defined fields plus a server-assigned `timestamp`. Field values go
//! through a pluggable [`ValueCodec`], either plain JSON or AES encrypted JSON,
//! so encrypted streams can live on a public server.
//!
//! # Example
//!
//! ```rust,no_run
//! use phant_client::{ClientSettings, FilterOp, QueryOptions, StreamClient, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut settings = ClientSettings::with_public_key("PUBLIC");
//!     settings.private_key = Some("PRIVATE".to_string());
//!     settings.fields = vec!["temp".to_string(), "room".to_string()];
//!
//!     let client = StreamClient::from_settings(&settings)?;
//!     client.append(&[Value::from(21.5), Value::from("kitchen")]).await?;
//!
//!     let options = QueryOptions::new()
//!         .limit(10)
//!         .filter(FilterOp::Gt, "temp", "20")
//!         .sort_by("temp");
//!     for record in client.query(&options).await? {
//!         println!("{} {:?}", record.timestamp, record.get("temp"));
//!     }
//!
//!     println!("used {} of {} bytes", client.used_bytes().await?, client.cap().await?);
//!     println!("{} requests left", client.remaining_requests().await);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod query;
pub mod record;
pub mod transport;
pub mod usage;
mod tests;

pub use client::{StreamClient, StreamIdentity, RATE_LIMIT_UNAVAILABLE};
pub use codec::{Complex, EncryptedJson, PlainJson, Value, ValueCodec, TIMESTAMP};
pub use config::ClientSettings;
pub use error::{Error, Result};
pub use query::{FilterExpression, FilterOp, QueryOptions};
pub use record::{Record, Timestamp};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport};
pub use usage::{RateLimitKind, RateLimitSnapshot, UsageSnapshot, UsageTracker};

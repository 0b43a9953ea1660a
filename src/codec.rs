//! Value codecs.
//!
//! A codec decides which bytes cross the wire for each field value. Two
//! implementations exist:
//!
//! - [`PlainJson`] writes the canonical JSON text of the value.
//! - [`EncryptedJson`] writes the same JSON text encrypted with AES-256-CBC
//!   under a key derived from a passphrase, as base64 of `IV || ciphertext`.
//!
//! Both codecs tag complex numbers as `{"__complex__": true, "real": r, "imag": i}`
//! before any encryption and recognise the tag after decryption. The
//! `timestamp` field is server formatted and always passes through untouched.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

use crate::{Error, Result};

/// Reserved name of the server-assigned timestamp column.
pub const TIMESTAMP: &str = "timestamp";

const COMPLEX_TAG: &str = "__complex__";
const BLOCK_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// A complex number, carried over JSON as a tagged object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

/// An application value stored in a stream field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Json(serde_json::Value),
    Complex(Complex),
}

impl Value {
    /// Borrow the value as text when it is a JSON string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Json(v) => v.as_str(),
            Value::Complex(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Json(v) => v.as_f64(),
            Value::Complex(_) => None,
        }
    }

    /// Render the value as JSON, tagging complex numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Json(v) => v.clone(),
            Value::Complex(c) => json!({ COMPLEX_TAG: true, "real": c.re, "imag": c.im }),
        }
    }

    /// Build a value from parsed JSON, recognising the complex tag.
    pub fn from_json(value: serde_json::Value) -> Self {
        if let Some(obj) = value.as_object() {
            if obj.contains_key(COMPLEX_TAG) {
                let re = obj.get("real").and_then(|v| v.as_f64());
                let im = obj.get("imag").and_then(|v| v.as_f64());
                if let (Some(re), Some(im)) = (re, im) {
                    return Value::Complex(Complex { re, im });
                }
            }
        }
        Value::Json(value)
    }

    /// Total order used when sorting query results.
    ///
    /// Numbers compare numerically, strings lexically and complex numbers by
    /// (real, imag). Values of different kinds order by kind: null, bool,
    /// number, complex, string, array, object.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Complex(a), Value::Complex(b)) => a
                .re
                .total_cmp(&b.re)
                .then_with(|| a.im.total_cmp(&b.im)),
            (Value::Json(a), Value::Json(b)) => match (a, b) {
                (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.total_cmp(&y)
                }
                (serde_json::Value::String(x), serde_json::Value::String(y)) => x.cmp(y),
                (serde_json::Value::Bool(x), serde_json::Value::Bool(y)) => x.cmp(y),
                _ => self.kind_rank().cmp(&other.kind_rank()),
            },
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Json(serde_json::Value::Null) => 0,
            Value::Json(serde_json::Value::Bool(_)) => 1,
            Value::Json(serde_json::Value::Number(_)) => 2,
            Value::Complex(_) => 3,
            Value::Json(serde_json::Value::String(_)) => 4,
            Value::Json(serde_json::Value::Array(_)) => 5,
            Value::Json(serde_json::Value::Object(_)) => 6,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Json(serde_json::Value::String(s)) => write!(f, "{}", s),
            Value::Json(v) => write!(f, "{}", v),
            Value::Complex(c) => write!(f, "({}{:+}j)", c.re, c.im),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl From<Complex> for Value {
    fn from(value: Complex) -> Self {
        Value::Complex(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Json(json!(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Json(json!(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Json(json!(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Json(json!(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Json(serde_json::Value::String(value))
    }
}

/// Converts field values to their wire text and back.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<String>;
    fn decode(&self, field: &str, wire: &str) -> Result<Value>;
}

/// Canonical JSON text on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainJson;

impl ValueCodec for PlainJson {
    fn encode(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(&value.to_json())?)
    }

    fn decode(&self, field: &str, wire: &str) -> Result<Value> {
        if field == TIMESTAMP {
            return Ok(Value::from(wire));
        }
        match serde_json::from_str::<serde_json::Value>(wire) {
            Ok(parsed) => Ok(Value::from_json(parsed)),
            Err(err) => {
                tracing::debug!(field, wire, error = %err, "keeping non-JSON field value as text");
                Ok(Value::from(wire))
            }
        }
    }
}

/// AES-256-CBC encrypted JSON on the wire.
#[derive(Clone)]
pub struct EncryptedJson {
    key: [u8; 32],
}

impl EncryptedJson {
    /// Derive the cipher key from a passphrase with SHA-256.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut payload = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext);
        STANDARD.encode(payload)
    }

    fn decrypt(&self, wire: &str) -> Result<Vec<u8>> {
        let payload = STANDARD
            .decode(wire.trim())
            .map_err(|e| Error::Decode(format!("invalid base64 payload: {}", e)))?;

        if payload.len() < 2 * BLOCK_SIZE || payload.len() % BLOCK_SIZE != 0 {
            return Err(Error::Decode(format!(
                "ciphertext of {} bytes is not a whole number of blocks after the IV",
                payload.len()
            )));
        }

        let (iv, ciphertext) = payload.split_at(BLOCK_SIZE);
        Aes256CbcDec::new(&self.key.into(), GenericArray::from_slice(iv))
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Decode("bad padding, wrong passphrase or corrupt payload".to_string()))
    }
}

impl fmt::Debug for EncryptedJson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedJson").finish_non_exhaustive()
    }
}

impl ValueCodec for EncryptedJson {
    fn encode(&self, value: &Value) -> Result<String> {
        let text = serde_json::to_string(&value.to_json())?;
        Ok(self.encrypt(text.as_bytes()))
    }

    fn decode(&self, field: &str, wire: &str) -> Result<Value> {
        if field == TIMESTAMP {
            return PlainJson.decode(field, wire);
        }
        let plaintext = self.decrypt(wire)?;
        let parsed: serde_json::Value = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Decode(format!("decrypted payload is not JSON: {}", e)))?;
        Ok(Value::from_json(parsed))
    }
}

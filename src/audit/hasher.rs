//! Entry Commitments
//!
//! Canonical byte encoding of an entry and the digest that binds it to its
//! predecessor. Pure functions only: no state, no I/O.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::audit::entry::AuditEntry;
use crate::error::{LedgerError, LedgerResult};

const CANONICAL_VERSION: &[u8] = b"audit-ledger.entry.v1";

/// Digest algorithm used to compute commitments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(LedgerError::InvalidInput(format!("unsupported hash algorithm: {}", other))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Digest in `<algorithm>:<hex>` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commitment(String);

impl Commitment {
    /// Fixed `previous_commitment` of the first entry in every partition
    pub fn genesis(algorithm: HashAlgorithm) -> Self {
        Self(format!(
            "{}:{}",
            algorithm.prefix(),
            "0".repeat(algorithm.digest_len() * 2)
        ))
    }

    pub fn from_digest(algorithm: HashAlgorithm, digest: &[u8]) -> Self {
        Self(format!("{}:{}", algorithm.prefix(), hex::encode(digest)))
    }

    /// Parse a stored commitment, checking prefix and digest length
    pub fn parse(value: impl Into<String>) -> LedgerResult<Self> {
        let value = value.into();
        let (prefix, digest) = value
            .split_once(':')
            .ok_or_else(|| LedgerError::Serialization(format!("malformed commitment: {}", value)))?;
        let algorithm: HashAlgorithm = prefix.parse()?;
        let bytes = hex::decode(digest)
            .map_err(|e| LedgerError::Serialization(format!("malformed commitment digest: {}", e)))?;
        if bytes.len() != algorithm.digest_len() {
            return Err(LedgerError::Serialization(format!(
                "commitment digest has {} bytes, expected {}",
                bytes.len(),
                algorithm.digest_len()
            )));
        }
        Ok(Self(value))
    }

    pub fn algorithm(&self) -> Option<HashAlgorithm> {
        self.0.split_once(':').and_then(|(prefix, _)| prefix.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length-prefixed field encoder
struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&(CANONICAL_VERSION.len() as u32).to_be_bytes());
        buf.extend_from_slice(CANONICAL_VERSION);
        Self { buf }
    }

    fn field(&mut self, name: &str, value: Option<&[u8]>) {
        self.buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        match value {
            Some(bytes) => {
                self.buf.push(1);
                self.buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
                self.buf.extend_from_slice(bytes);
            }
            None => self.buf.push(0),
        }
    }

    fn text(&mut self, name: &str, value: &str) {
        self.field(name, Some(value.as_bytes()));
    }

    fn json(&mut self, name: &str, value: Option<&Value>) -> LedgerResult<()> {
        match value {
            Some(value) => {
                let mut out = String::new();
                write_canonical_json(value, &mut out)?;
                self.field(name, Some(out.as_bytes()));
            }
            None => self.field(name, None),
        }
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Render JSON with sorted object keys and no whitespace
pub fn write_canonical_json(value: &Value, out: &mut String) -> LedgerResult<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => out.push_str(&value.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical_json(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Canonical bytes of every entry field except the two commitments
pub fn canonical_bytes(entry: &AuditEntry) -> LedgerResult<Vec<u8>> {
    let mut writer = CanonicalWriter::new();
    writer.field("id", Some(entry.id.as_bytes().as_slice()));
    writer.text("partition_id", entry.partition_id.as_str());
    writer.field("sequence_number", Some(entry.sequence_number.to_be_bytes().as_slice()));
    writer.text("actor_id", entry.actor_id.as_str());
    writer.text("action", entry.action.as_str());
    writer.text("entity_type", &entry.entity_type);
    writer.text("entity_id", &entry.entity_id);
    writer.json("before_state", entry.before_state.as_ref())?;
    writer.json("after_state", entry.after_state.as_ref())?;
    let context = serde_json::to_value(&entry.context)?;
    writer.json("context", Some(&context))?;
    writer.text(
        "created_at",
        &entry.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
    );
    Ok(writer.finish())
}

/// Compute the commitment of `entry` chained onto `previous`.
///
/// The entry's own `commitment` and `previous_commitment` fields are ignored;
/// `previous` is appended to the canonical bytes instead.
pub fn commit(
    entry: &AuditEntry,
    previous: &Commitment,
    algorithm: HashAlgorithm,
) -> LedgerResult<Commitment> {
    let mut bytes = canonical_bytes(entry)?;
    let previous = previous.as_str().as_bytes();
    bytes.extend_from_slice(&(previous.len() as u64).to_be_bytes());
    bytes.extend_from_slice(previous);
    Ok(Commitment::from_digest(algorithm, &algorithm.digest(&bytes)))
}

pub fn verify_commitment(entry: &AuditEntry, algorithm: HashAlgorithm) -> bool {
    match commit(entry, &entry.previous_commitment, algorithm) {
        Ok(expected) => expected == entry.commitment,
        Err(_) => false,
    }
}

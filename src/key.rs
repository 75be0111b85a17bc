//! Config values, canonical encoding, and content-addressed keys.
//!
//! A `Key` identifies one cached unit of work: computation name, version,
//! structured config, and replica index. Identity is content-addressed — the
//! config is canonically encoded and hashed with SHA-224, and two keys are
//! equal exactly when (name, version, fingerprint, replica) match.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

use crate::error::{Error, Result};

/// Parameters whose names start with this prefix participate in the call
/// but are excluded from the config, and thus from cache identity.
pub const EPHEMERAL_PREFIX: &str = "__";

/// A computation's structured config: bound parameter names to values.
pub type Config = BTreeMap<String, ConfigValue>;

/// A config value. Everything that can participate in cache identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered sequence. Element order is significant for the fingerprint.
    List(Vec<ConfigValue>),
    /// Mapping with arbitrary (possibly non-primitive) keys. Entry order
    /// does not affect the fingerprint.
    Map(Vec<(ConfigValue, ConfigValue)>),
    /// A reference to another computation's cached slot. Encodes that
    /// computation's full identity without requiring its materialized value.
    Key(Key),
}

impl ConfigValue {
    fn is_primitive(&self) -> bool {
        matches!(
            self,
            ConfigValue::Null
                | ConfigValue::Bool(_)
                | ConfigValue::Int(_)
                | ConfigValue::Float(_)
                | ConfigValue::Str(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_key(&self) -> Option<&Key> {
        match self {
            ConfigValue::Key(key) => Some(key),
            _ => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<i32> for ConfigValue {
    fn from(i: i32) -> Self {
        ConfigValue::Int(i64::from(i))
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl From<u32> for ConfigValue {
    fn from(i: u32) -> Self {
        ConfigValue::Int(i64::from(i))
    }
}

impl From<f64> for ConfigValue {
    fn from(f: f64) -> Self {
        ConfigValue::Float(f)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Str(s)
    }
}

impl From<Vec<ConfigValue>> for ConfigValue {
    fn from(items: Vec<ConfigValue>) -> Self {
        ConfigValue::List(items)
    }
}

impl From<Key> for ConfigValue {
    fn from(key: Key) -> Self {
        ConfigValue::Key(key)
    }
}

impl From<&Key> for ConfigValue {
    fn from(key: &Key) -> Self {
        ConfigValue::Key(key.clone())
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Null => write!(f, "null"),
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Float(x) => write!(f, "{x:?}"),
            ConfigValue::Str(s) => write!(f, "{s:?}"),
            ConfigValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ConfigValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            ConfigValue::Key(key) => write!(f, "<key {}>", key.canonical()),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical encoding
// ---------------------------------------------------------------------------

fn encode_primitive(value: &ConfigValue, out: &mut String) -> Result<()> {
    match value {
        ConfigValue::Null => out.push_str("null"),
        ConfigValue::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        ConfigValue::Int(i) => {
            let _ = write!(out, "{i}");
        }
        ConfigValue::Float(x) => {
            if !x.is_finite() {
                return Err(Error::InvalidConfig(format!("non-finite float: {x}")));
            }
            let _ = write!(out, "{x:?}");
        }
        ConfigValue::Str(s) => {
            let _ = write!(out, "{s:?}");
        }
        _ => unreachable!("encode_primitive called on a compound value"),
    }
    Ok(())
}

fn encode_value(value: &ConfigValue, out: &mut String) -> Result<()> {
    match value {
        v if v.is_primitive() => encode_primitive(v, out)?,
        ConfigValue::List(items) => {
            out.push('[');
            for item in items {
                encode_value(item, out)?;
                out.push(',');
            }
            out.push(']');
        }
        ConfigValue::Map(entries) => {
            let mut encoded: Vec<(String, &ConfigValue)> = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                // Non-primitive map keys are fingerprinted and tagged so
                // they cannot collide with string literals.
                let encoded_key = if k.is_primitive() {
                    let mut s = String::new();
                    encode_primitive(k, &mut s)?;
                    s
                } else {
                    format!("~{}", fingerprint_value(k)?)
                };
                encoded.push((encoded_key, v));
            }
            encode_sorted_entries(encoded, out)?;
        }
        ConfigValue::Key(key) => {
            out.push_str("<key ");
            out.push_str(&key.canonical());
            out.push('>');
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Encode map entries sorted by their encoded key, so the fingerprint is
/// independent of insertion order.
fn encode_sorted_entries(mut entries: Vec<(String, &ConfigValue)>, out: &mut String) -> Result<()> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    out.push('{');
    for (encoded_key, value) in entries {
        out.push_str(&encoded_key);
        out.push(':');
        encode_value(value, out)?;
        out.push(',');
    }
    out.push('}');
    Ok(())
}

fn hex_digest(encoded: &str) -> String {
    let digest = Sha224::digest(encoded.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn fingerprint_value(value: &ConfigValue) -> Result<String> {
    let mut out = String::new();
    encode_value(value, &mut out)?;
    Ok(hex_digest(&out))
}

/// Fingerprint a config: canonical recursive encoding hashed with SHA-224.
///
/// Deterministic across processes — independent of memory addresses,
/// hash-table iteration order, and hasher randomization.
pub fn fingerprint(config: &Config) -> Result<String> {
    let mut entries: Vec<(String, &ConfigValue)> = Vec::with_capacity(config.len());
    for (name, value) in config {
        entries.push((format!("{name:?}"), value));
    }
    let mut out = String::new();
    encode_sorted_entries(entries, &mut out)?;
    Ok(hex_digest(&out))
}

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Identity of one cached unit: (name, version, config fingerprint, replica).
///
/// Immutable once constructed. Equality and hashing never inspect the config
/// directly; the derived fingerprint stands in for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    name: String,
    version: u32,
    config: Config,
    replica: u32,
    fingerprint: String,
}

impl Key {
    pub fn new(name: impl Into<String>, version: u32, config: Config, replica: u32) -> Result<Self> {
        let fingerprint = fingerprint(&config)?;
        Ok(Self {
            name: name.into(),
            version,
            config,
            replica,
            fingerprint,
        })
    }

    /// Rebuild a key from persisted parts, reusing the stored fingerprint.
    pub(crate) fn from_parts(
        name: String,
        version: u32,
        config: Config,
        replica: u32,
        fingerprint: String,
    ) -> Self {
        Self {
            name,
            version,
            config,
            replica,
            fingerprint,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn replica(&self) -> u32 {
        self.replica
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The same key at a different replica index. The fingerprint does not
    /// depend on the replica, so no re-encoding happens.
    pub fn with_replica(&self, replica: u32) -> Key {
        Key {
            name: self.name.clone(),
            version: self.version,
            config: self.config.clone(),
            replica,
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Canonical identity string, used when this key appears inside another
    /// computation's config.
    pub fn canonical(&self) -> String {
        format!(
            "{},{},{},{}",
            self.name, self.version, self.fingerprint, self.replica
        )
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && self.name == other.name
            && self.version == other.version
            && self.replica == other.replica
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
        self.fingerprint.hash(state);
        self.replica.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Key {}(", self.name)?;
        for (i, (name, value)) in self.config.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, ") v={} r={}>", self.version, self.replica)
    }
}

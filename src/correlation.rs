use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap();
}

/// Upper bound (exclusive) of the random suffix
pub const SUFFIX_RANGE: u32 = 1000;

/// Token tying an upload to its later download
///
/// Generated ids look like `1700000000000-42`: the upload time in unix
/// milliseconds followed by a random suffix below [`SUFFIX_RANGE`]. Two
/// uploads in the same millisecond can draw the same suffix, so callers that
/// need uniqueness must reserve the id (`RelayStore::save_upload` does).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid file ID: {0:?}")]
pub struct InvalidId(pub String);

impl CorrelationId {
    /// Create a fresh id from the current time and a random suffix
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = rand::thread_rng().gen_range(0..SUFFIX_RANGE);
        CorrelationId(format!("{}-{}", millis, suffix))
    }

    /// Accept an id supplied by a client
    ///
    /// Only ASCII letters, digits, `-` and `_` are allowed so an id can be
    /// used as a directory name or filename prefix without escaping.
    pub fn parse(raw: &str) -> Result<Self, InvalidId> {
        let trimmed = raw.trim();
        if ID_PATTERN.is_match(trimmed) {
            Ok(CorrelationId(trimmed.to_string()))
        } else {
            Err(InvalidId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond timestamp embedded in a generated id
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.0.split('-').next()?.parse().ok()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = InvalidId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CorrelationId::parse(&value)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

//! Partition keys: the ordering domain for scheduled work.
//!
//! A partition is a `(location, workflow)` pair. Its composite string form is
//! used verbatim as the staging key and lock name, and with a prefix as the
//! stream name. Each part is escaped so distinct pairs never collide.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Workflow id used when the inbound request does not name one.
pub const DEFAULT_WORKFLOW_ID: &str = "noworkflow";

/// Prefix for stream names derived from partition keys.
pub const STREAM_PREFIX: &str = "seq:";

const SEPARATOR: char = ':';
const LOCK_ID_MASK: u64 = 0x7fff_ffff_ffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    location_id: String,
    workflow_id: String,
}

impl PartitionKey {
    pub fn new(location_id: impl Into<String>, workflow_id: Option<&str>) -> Self {
        let workflow_id = workflow_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_WORKFLOW_ID);
        Self {
            location_id: location_id.into(),
            workflow_id: workflow_id.to_string(),
        }
    }

    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Composite key string: `escape(location):escape(workflow)`.
    pub fn as_key(&self) -> String {
        format!(
            "{}{SEPARATOR}{}",
            escape_part(&self.location_id),
            escape_part(&self.workflow_id)
        )
    }

    /// Parse a composite key produced by [`PartitionKey::as_key`].
    pub fn parse(key: &str) -> Option<Self> {
        let (location, workflow) = key.split_once(SEPARATOR)?;
        if workflow.contains(SEPARATOR) {
            return None;
        }
        Some(Self {
            location_id: unescape_part(location)?,
            workflow_id: unescape_part(workflow)?,
        })
    }

    pub fn stream_name(&self) -> String {
        format!("{STREAM_PREFIX}{}", self.as_key())
    }

    pub fn from_stream_name(stream: &str) -> Option<Self> {
        stream.strip_prefix(STREAM_PREFIX).and_then(Self::parse)
    }

    /// Fixed-width advisory lock id for this partition.
    ///
    /// Only the lock backend sees this value; two keys hashing to the same id
    /// are merely serialized together.
    pub fn lock_id(&self) -> i64 {
        lock_id_for(&self.as_key())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// 63-bit polynomial string hash (`h = h * 31 + byte`).
pub fn lock_id_for(name: &str) -> i64 {
    let hash = name.bytes().fold(0u64, |hash, byte| {
        hash.wrapping_mul(31).wrapping_add(u64::from(byte)) & LOCK_ID_MASK
    });
    hash as i64
}

fn escape_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for ch in part.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_part(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(index) = rest.find('%') {
        out.push_str(&rest[..index]);
        let code = rest.get(index + 1..index + 3)?;
        match code {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            _ => return None,
        }
        rest = &rest[index + 3..];
    }
    out.push_str(rest);
    Some(out)
}

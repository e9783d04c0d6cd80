// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entry record layout and field encoding.
//!
//! One hash per entry:
//!
//! | field | content                                      |
//! |-------|----------------------------------------------|
//! | `d`   | payload, possibly enveloped                  |
//! | `m`   | unix time of the last save                   |
//! | `t`   | comma-joined tag list, possibly enveloped    |
//! | `i`   | `1` when saved without a lifetime, else `0`  |

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::compression::Envelope;
use crate::error::CacheResult;

pub const FIELD_DATA: &str = "d";
pub const FIELD_MTIME: &str = "m";
pub const FIELD_TAGS: &str = "t";
pub const FIELD_INFINITE: &str = "i";

const TAG_SEPARATOR: char = ',';

/// What `metadata` reports about an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Absolute expiry (unix seconds); `None` for infinite entries.
    pub expire_at: Option<u64>,
    pub tags: Vec<String>,
    pub mtime: u64,
}

/// Drop empty names and collapse duplicates, keeping first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

pub fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

pub fn split_tags(raw: &str) -> Vec<String> {
    normalize_tags(raw.split(TAG_SEPARATOR))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Field encoder: applies the compression envelope with separate levels
/// for payload and tag list.
#[derive(Debug, Clone)]
pub struct EntryCodec {
    envelope: Envelope,
    data_level: i32,
    tags_level: i32,
}

impl EntryCodec {
    pub fn new(envelope: Envelope, data_level: i32, tags_level: i32) -> Self {
        Self {
            envelope,
            data_level,
            tags_level,
        }
    }

    pub fn encode_data<'a>(&self, data: &'a [u8]) -> CacheResult<Cow<'a, [u8]>> {
        Ok(self.envelope.encode(data, self.data_level)?)
    }

    /// `None` when the stored bytes cannot be decoded.
    pub fn decode_data(&self, id: &str, raw: &[u8]) -> Option<Vec<u8>> {
        match self.envelope.decode(raw) {
            Ok(data) => Some(data.into_owned()),
            Err(e) => {
                warn!(id = %id, error = %e, "Stored payload could not be decoded, treating as miss");
                None
            }
        }
    }

    pub fn encode_tags(&self, tags: &[String]) -> CacheResult<Vec<u8>> {
        let joined = join_tags(tags);
        Ok(self.envelope.encode(joined.as_bytes(), self.tags_level)?.into_owned())
    }

    /// Tag list of an entry; an undecodable list yields no tags.
    pub fn decode_tags(&self, id: &str, raw: &[u8]) -> Vec<String> {
        match self.envelope.decode(raw) {
            Ok(bytes) => split_tags(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                warn!(id = %id, error = %e, "Stored tag list could not be decoded");
                Vec::new()
            }
        }
    }
}

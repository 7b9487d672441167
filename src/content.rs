// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content keys and the units moved between channels.
//!
//! A [`ContentKey`] identifies one item inside a channel. Keys are totally
//! ordered by sequence, then hash. A [`ChannelContentKey`] pairs a key with
//! the channel it came from and is the sort unit for cross-channel merges:
//! equal keys from different channels are tie-broken by channel name.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one item within a channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    /// Monotonic position within the channel.
    pub sequence: i64,
    /// Disambiguates items written at the same sequence. May be empty.
    pub hash: String,
}

impl ContentKey {
    pub fn new(sequence: i64, hash: impl Into<String>) -> Self {
        Self {
            sequence,
            hash: hash.into(),
        }
    }

    /// Key with an empty hash.
    pub fn from_sequence(sequence: i64) -> Self {
        Self::new(sequence, "")
    }

    /// Encode as a single coordination-store path segment.
    ///
    /// `%` and `/` in the hash are percent-escaped so the segment never
    /// splits into nested nodes.
    pub fn to_path_segment(&self) -> String {
        let mut segment = format!("{}:", self.sequence);
        for c in self.hash.chars() {
            match c {
                '%' => segment.push_str("%25"),
                '/' => segment.push_str("%2F"),
                c => segment.push(c),
            }
        }
        segment
    }

    /// Decode a path segment produced by [`to_path_segment`](Self::to_path_segment).
    ///
    /// Returns `None` for anything malformed, including a raw `/` or a `%`
    /// that is not one of the two escapes.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        let (sequence, escaped) = segment.split_once(':')?;
        let sequence = sequence.parse::<i64>().ok()?;

        let mut hash = String::with_capacity(escaped.len());
        let mut rest = escaped;
        while let Some(at) = rest.find(['%', '/']) {
            hash.push_str(&rest[..at]);
            let tail = &rest[at..];
            if tail.starts_with("%25") {
                hash.push('%');
            } else if tail.starts_with("%2F") {
                hash.push('/');
            } else {
                return None;
            }
            rest = &tail[3..];
        }
        hash.push_str(rest);
        Some(Self::new(sequence, hash))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hash.is_empty() {
            write!(f, "{}", self.sequence)
        } else {
            write!(f, "{}/{}", self.sequence, self.hash)
        }
    }
}

/// A content key tagged with its origin channel.
///
/// Field order matters: the derived ordering compares `key` first and
/// `channel` second.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelContentKey {
    pub key: ContentKey,
    pub channel: String,
}

impl ChannelContentKey {
    pub fn new(channel: impl Into<String>, key: ContentKey) -> Self {
        Self {
            key,
            channel: channel.into(),
        }
    }
}

impl fmt::Display for ChannelContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.key, self.channel)
    }
}

/// One item of content as moved by replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub key: ContentKey,
    pub data: Vec<u8>,
}

impl ContentItem {
    pub fn new(key: ContentKey, data: Vec<u8>) -> Self {
        Self { key, data }
    }
}

/// A "keys from a starting point" query.
///
/// `name` is a channel name when sent to a single channel, or a tag name when
/// sent to the merger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionQuery {
    pub name: String,
    /// Exclusive starting key; `None` starts from the beginning (ascending)
    /// or the end (descending) of the channel.
    pub start_key: Option<ContentKey>,
    /// `true` walks forward (ascending), `false` walks backward.
    pub next: bool,
    /// Maximum keys returned.
    pub count: usize,
    /// Only return keys that can no longer change.
    pub stable: bool,
}

impl DirectionQuery {
    /// Ascending query for `count` keys after `start_key`.
    pub fn next(name: impl Into<String>, start_key: Option<ContentKey>, count: usize) -> Self {
        Self {
            name: name.into(),
            start_key,
            next: true,
            count,
            stable: true,
        }
    }

    /// Descending query for `count` keys before `start_key`.
    pub fn previous(name: impl Into<String>, start_key: Option<ContentKey>, count: usize) -> Self {
        Self {
            next: false,
            ..Self::next(name, start_key, count)
        }
    }

    /// Same query re-targeted at a single channel.
    pub fn with_channel(&self, channel: &str) -> Self {
        Self {
            name: channel.to_string(),
            ..self.clone()
        }
    }
}

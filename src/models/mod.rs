//! Data model for monitored stops and their upcoming passages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Kind of transit line serving a passage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Bus,
    Metro,
    Tram,
    /// Used when the line kind cannot be determined from upstream data
    #[serde(other)]
    Unknown,
}

impl LineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineKind::Bus => "bus",
            LineKind::Metro => "metro",
            LineKind::Tram => "tram",
            LineKind::Unknown => "unknown",
        }
    }

    /// Map the upstream route type tag ("B", "M", "T" or a full word)
    pub fn from_route_type(route_type: &str) -> Self {
        match route_type.to_ascii_lowercase().as_str() {
            "b" | "bus" => LineKind::Bus,
            "m" | "metro" | "subway" => LineKind::Metro,
            "t" | "tram" => LineKind::Tram,
            _ => LineKind::Unknown,
        }
    }

    /// Display icon for this line kind. Unknown lines fall back to the bus
    /// icon, matching what riders see for unclassified services.
    pub fn icon(&self) -> &'static str {
        match self {
            LineKind::Bus | LineKind::Unknown => "mdi:bus",
            LineKind::Metro => "mdi:subway",
            LineKind::Tram => "mdi:tram",
        }
    }
}

/// Time remaining until a passage, as reported by upstream at fetch time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ArrivingIn {
    pub minutes: u32,
    /// Seconds component, always in 0..=59
    pub seconds: u32,
}

/// One upcoming vehicle passage at a stop.
///
/// Immutable once constructed; a fresh fetch produces a new list that
/// replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Passage {
    pub destination: String,
    pub expected_arrival_time: DateTime<Utc>,
    /// Upstream point identifier the passage was reported for
    pub stop_id: String,
    pub message: Option<String>,
    pub arriving_in: ArrivingIn,
    pub line_id: String,
    pub line_kind: LineKind,
    pub line_color: Option<String>,
}

/// A single (line, destination) pair selecting which passages count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LineFilter {
    pub line: String,
    pub destination: String,
}

/// Allow-list of (line, destination) pairs for one monitored stop.
/// An empty filter matches every passage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassageFilter {
    entries: Vec<LineFilter>,
}

impl PassageFilter {
    pub fn new(entries: Vec<LineFilter>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[LineFilter] {
        &self.entries
    }

    /// Whether a passage passes the filter. Line and destination are
    /// compared case-insensitively since upstream casing varies by language.
    pub fn matches(&self, passage: &Passage) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries.iter().any(|f| {
            f.line.eq_ignore_ascii_case(&passage.line_id)
                && f.destination.eq_ignore_ascii_case(&passage.destination)
        })
    }
}

/// Stable identifier for a monitored stop, derived from the stop name and
/// the sorted filter pairs. Identical across process restarts.
pub fn stop_key(stop_name: &str, filter: &PassageFilter) -> String {
    let mut key = slug(stop_name);
    let mut parts: Vec<String> = filter
        .entries()
        .iter()
        .map(|f| format!("{}-{}", slug(&f.line), slug(&f.destination)))
        .collect();
    parts.sort();
    for part in parts {
        key.push('+');
        key.push_str(&part);
    }
    key
}

fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

//! The record model: the typed values carried from monitors to actions
//! through filters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::LookoutError;

/// Log representations truncate free text at this many characters.
pub const MAX_DEBUG_LEN: usize = 60;

/// Collapse whitespace and truncate `text` to at most `max` characters.
pub fn shorten(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

// ---------------------------------------------------------------------------
// Variant payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Generic,
    Error,
    Started,
    Finished,
}

impl Default for EventType {
    fn default() -> Self {
        EventType::Generic
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Generic => write!(f, "generic"),
            EventType::Error => write!(f, "error"),
            EventType::Started => write!(f, "started"),
            EventType::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub event_type: EventType,
    pub text: String,
}

/// A single entry of a syndication feed. `extra` preserves source fields
/// the parser does not model; it survives persistence round trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub uid: String,
    pub url: String,
    pub summary: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A record with a downloadable url: the livestream shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub url: String,
    pub author: String,
    pub title: String,
}

// ---------------------------------------------------------------------------
// Sum type
// ---------------------------------------------------------------------------

/// Discriminant of the closed record set. Actors declare which kinds they
/// accept via [`crate::actor::Actor::supported_kinds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Text,
    Event,
    Feed,
    Stream,
}

impl RecordKind {
    pub const ALL: &'static [RecordKind] = &[
        RecordKind::Text,
        RecordKind::Event,
        RecordKind::Feed,
        RecordKind::Stream,
    ];
}

#[derive(Clone, PartialEq)]
pub enum Record {
    Text(TextRecord),
    Event(EventRecord),
    Feed(FeedRecord),
    Stream(StreamRecord),
}

impl Record {
    pub fn text(text: impl Into<String>) -> Self {
        Record::Text(TextRecord { text: text.into() })
    }

    pub fn event(event_type: EventType, text: impl Into<String>) -> Self {
        Record::Event(EventRecord {
            event_type,
            text: text.into(),
        })
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Text(_) => RecordKind::Text,
            Record::Event(_) => RecordKind::Event,
            Record::Feed(_) => RecordKind::Feed,
            Record::Stream(_) => RecordKind::Stream,
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Record::Text(_) => "TextRecord",
            Record::Event(_) => "Event",
            Record::Feed(_) => "FeedRecord",
            Record::Stream(_) => "StreamRecord",
        }
    }

    /// The declared ancestor names of this variant, most specific first.
    /// `filter.type` consults this list instead of a language-level class
    /// hierarchy.
    pub fn ancestry(&self) -> &'static [&'static str] {
        match self {
            Record::Text(_) => &["TextRecord", "Record"],
            Record::Event(_) => &["Event", "Record"],
            Record::Feed(_) => &["FeedRecord", "Record"],
            Record::Stream(_) => &["StreamRecord", "LivestreamRecord", "Record"],
        }
    }

    /// Long string form, used by sinks.
    pub fn display(&self) -> String {
        match self {
            Record::Text(r) => r.text.clone(),
            Record::Event(r) => r.text.clone(),
            Record::Feed(r) => {
                let second_line = if !r.author.is_empty() && !r.title.is_empty() {
                    format!("{}: {}\n", r.author, r.title)
                } else {
                    String::new()
                };
                let summary = shorten(&r.summary, MAX_DEBUG_LEN * 2);
                format!(
                    "[{}] {}\n{}{}",
                    r.published.to_rfc3339(),
                    r.url,
                    second_line,
                    summary
                )
            }
            Record::Stream(r) => format!("{}\n{}", r.url, r.title),
        }
    }

    /// Short string form for logs.
    pub fn debug(&self) -> String {
        format!("{:?}", self)
    }

    fn to_value(&self) -> serde_json::Value {
        let result = match self {
            Record::Text(r) => serde_json::to_value(r),
            Record::Event(r) => serde_json::to_value(r),
            Record::Feed(r) => serde_json::to_value(r),
            Record::Stream(r) => serde_json::to_value(r),
        };
        // All variants serialize to plain maps of serializable fields.
        result.unwrap_or(serde_json::Value::Null)
    }

    /// Canonical JSON of the variant payload: keys sorted, non-ASCII
    /// preserved, dates rendered through their stable serialization.
    pub fn canonical_json(&self) -> String {
        self.to_value().to_string()
    }

    pub fn pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_value()).unwrap_or_else(|_| self.canonical_json())
    }

    /// SHA-1 hex digest of [`Record::canonical_json`]. Stable across process
    /// restarts and across field-insertion order in the source document.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// String view of a named field, used by `{field}` templating.
    pub fn field(&self, name: &str) -> Option<String> {
        match self.to_value().get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Reconstruct a record from its persisted `(class_name, as_json)` pair.
    pub fn from_class(class_name: &str, as_json: &str) -> crate::Result<Record> {
        let record = match class_name {
            "TextRecord" => Record::Text(serde_json::from_str(as_json).map_err(anyhow::Error::from)?),
            "Event" => Record::Event(serde_json::from_str(as_json).map_err(anyhow::Error::from)?),
            "FeedRecord" => Record::Feed(serde_json::from_str(as_json).map_err(anyhow::Error::from)?),
            "StreamRecord" => {
                Record::Stream(serde_json::from_str(as_json).map_err(anyhow::Error::from)?)
            }
            other => return Err(LookoutError::UnknownRecordClass(other.to_string())),
        };
        Ok(record)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Text(r) => write!(f, "TextRecord(\"{}\")", shorten(&r.text, MAX_DEBUG_LEN)),
            Record::Event(r) => write!(
                f,
                "Event(event_type=\"{}\", text=\"{}\")",
                r.event_type,
                shorten(&r.text, MAX_DEBUG_LEN)
            ),
            Record::Feed(r) => write!(
                f,
                "FeedRecord(published=\"{}\", url=\"{}\", title=\"{}\")",
                r.published.to_rfc3339(),
                r.url,
                shorten(&r.title, MAX_DEBUG_LEN)
            ),
            Record::Stream(r) => write!(
                f,
                "StreamRecord(author={}, title=\"{}\")",
                r.author,
                shorten(&r.title, MAX_DEBUG_LEN)
            ),
        }
    }
}

//! Search criteria and result shapes of the log index.

use super::entry::{LogEntry, LogLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Newest entries first.
    #[default]
    NewestFirst,
    /// Oldest entries first.
    OldestFirst,
}

/// Search criteria. Every criterion that is set must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    /// Exact level.
    pub level: Option<LogLevel>,
    /// Lowest level included.
    pub min_level: Option<LogLevel>,
    /// Operation category.
    pub category: Option<String>,
    /// Trace id or correlation id.
    pub correlation_id: Option<String>,
    /// Tags that must all be present.
    pub tags: Vec<String>,
    /// Case-insensitive substring of the message or error.
    pub text: Option<String>,
    /// Operation name.
    pub operation: Option<String>,
    /// Inclusive lower time bound.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper time bound.
    pub end: Option<DateTime<Utc>>,
    /// Entries skipped before the page.
    pub offset: usize,
    /// Page size; the index default applies when unset.
    pub limit: Option<usize>,
    /// Ordering.
    pub order: SortOrder,
}

impl LogQuery {
    /// An empty query matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one level.
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Restrict to a minimum level.
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    /// Restrict to a category.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Restrict to a trace or correlation id.
    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Require a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Free-text substring.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Time range.
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    /// Pagination.
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether any criterion served by a postings set is present.
    pub(crate) fn has_indexed_criterion(&self) -> bool {
        self.level.is_some()
            || self.min_level.is_some()
            || self.category.is_some()
            || self.correlation_id.is_some()
            || !self.tags.is_empty()
            || (self.start.is_some() && self.end.is_some())
    }

    /// Criteria checked by inspecting the entry itself.
    pub(crate) fn inspect(&self, entry: &LogEntry, text_lower: Option<&str>) -> bool {
        if let Some(start) = self.start {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.timestamp > end {
                return false;
            }
        }
        if let Some(min) = self.min_level {
            if entry.level < min {
                return false;
            }
        }
        if let Some(operation) = &self.operation {
            if entry.context.operation.as_deref() != Some(operation.as_str()) {
                return false;
            }
        }
        if let Some(needle) = text_lower {
            if !entry.contains_text(needle) {
                return false;
            }
        }
        true
    }
}

/// Counts over the whole match set, before pagination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchAggregations {
    /// Matches per level.
    pub by_level: BTreeMap<LogLevel, usize>,
    /// Matches per category.
    pub by_category: BTreeMap<String, usize>,
    /// Most frequent tags, highest count first.
    pub top_tags: Vec<(String, usize)>,
}

/// One page of search results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    /// Entries of the page.
    pub entries: Vec<LogEntry>,
    /// Total matches.
    pub total: usize,
    /// Offset of the page.
    pub offset: usize,
    /// Size limit of the page.
    pub limit: usize,
    /// Whether more matches follow the page.
    pub has_more: bool,
    /// Aggregations over all matches.
    pub aggregations: SearchAggregations,
    /// Whether postings narrowed the candidates or every entry was scanned.
    pub used_index: bool,
}

/// Statistics of one time bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBucket {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// Entries in the bucket.
    pub total: usize,
    /// Entries per level.
    pub by_level: BTreeMap<LogLevel, usize>,
    /// Entries at error level or above.
    pub errors: usize,
}

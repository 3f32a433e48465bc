//! Inverted postings over retained entries.

use super::entry::{hour_bucket, LogEntry, LogLevel};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;

type Postings<K> = HashMap<K, BTreeSet<u64>>;

fn post<K: Eq + Hash>(postings: &mut Postings<K>, key: K, id: u64) {
    postings.entry(key).or_default().insert(id);
}

fn unpost<K: Eq + Hash>(postings: &mut Postings<K>, key: &K, id: u64) {
    if let Some(set) = postings.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            postings.remove(key);
        }
    }
}

/// Entries by sequence id plus one postings map per indexed dimension.
#[derive(Default)]
pub(crate) struct IndexStore {
    pub(crate) entries: BTreeMap<u64, Arc<LogEntry>>,
    by_level: Postings<LogLevel>,
    by_category: Postings<String>,
    by_correlation: Postings<String>,
    by_tag: Postings<String>,
    by_hour: Postings<i64>,
}

impl IndexStore {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, entry: LogEntry) {
        let id = entry.id;
        post(&mut self.by_level, entry.level, id);
        if let Some(category) = &entry.context.category {
            post(&mut self.by_category, category.clone(), id);
        }
        for key in entry.correlation_keys() {
            post(&mut self.by_correlation, key, id);
        }
        for tag in &entry.tags {
            post(&mut self.by_tag, tag.clone(), id);
        }
        post(&mut self.by_hour, hour_bucket(entry.timestamp), id);
        self.entries.insert(id, Arc::new(entry));
    }

    /// Removes an entry and every posting that points at it.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        unpost(&mut self.by_level, &entry.level, id);
        if let Some(category) = &entry.context.category {
            unpost(&mut self.by_category, category, id);
        }
        for key in entry.correlation_keys() {
            unpost(&mut self.by_correlation, &key, id);
        }
        for tag in &entry.tags {
            unpost(&mut self.by_tag, tag, id);
        }
        unpost(&mut self.by_hour, &hour_bucket(entry.timestamp), id);
        true
    }

    /// Ids of entries stamped before `cutoff`. Whole hours below the cutoff
    /// hour are taken from the hour postings; only the cutoff hour itself is
    /// checked entry by entry.
    pub(crate) fn expired_before(&self, cutoff: DateTime<Utc>) -> Vec<u64> {
        let cutoff_hour = hour_bucket(cutoff);
        let mut expired = Vec::new();
        for (hour, ids) in &self.by_hour {
            if *hour < cutoff_hour {
                expired.extend(ids.iter().copied());
            } else if *hour == cutoff_hour {
                expired.extend(
                    ids.iter()
                        .copied()
                        .filter(|id| self.entries.get(id).is_some_and(|e| e.timestamp < cutoff)),
                );
            }
        }
        expired
    }

    /// Drops all postings and rebuilds them from the stored entries.
    pub(crate) fn rebuild(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        *self = IndexStore::default();
        for (_, entry) in entries {
            let entry = Arc::try_unwrap(entry).unwrap_or_else(|shared| (*shared).clone());
            self.insert(entry);
        }
    }

    pub(crate) fn level_postings(&self, level: LogLevel) -> BTreeSet<u64> {
        self.by_level.get(&level).cloned().unwrap_or_default()
    }

    pub(crate) fn min_level_postings(&self, min: LogLevel) -> BTreeSet<u64> {
        LogLevel::ALL
            .iter()
            .filter(|level| **level >= min)
            .filter_map(|level| self.by_level.get(level))
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    pub(crate) fn category_postings(&self, category: &str) -> BTreeSet<u64> {
        self.by_category.get(category).cloned().unwrap_or_default()
    }

    pub(crate) fn correlation_postings(&self, id: &str) -> BTreeSet<u64> {
        self.by_correlation.get(id).cloned().unwrap_or_default()
    }

    pub(crate) fn tag_postings(&self, tag: &str) -> BTreeSet<u64> {
        self.by_tag.get(tag).cloned().unwrap_or_default()
    }

    pub(crate) fn hour_postings(&self, first_hour: i64, last_hour: i64) -> BTreeSet<u64> {
        if last_hour - first_hour > self.by_hour.len() as i64 {
            // Wide ranges walk the populated buckets instead of every hour.
            return self
                .by_hour
                .iter()
                .filter(|(hour, _)| (first_hour..=last_hour).contains(*hour))
                .flat_map(|(_, set)| set.iter().copied())
                .collect();
        }
        (first_hour..=last_hour)
            .filter_map(|hour| self.by_hour.get(&hour))
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    /// Lists postings that disagree with the stored entries.
    pub(crate) fn consistency_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut check = |dimension: &str, key: String, set: &BTreeSet<u64>| {
            for id in set {
                if !self.entries.contains_key(id) {
                    problems.push(format!("{} posting '{}' points at missing entry {}", dimension, key, id));
                }
            }
        };
        for (key, set) in &self.by_level {
            check("level", key.to_string(), set);
        }
        for (key, set) in &self.by_category {
            check("category", key.clone(), set);
        }
        for (key, set) in &self.by_correlation {
            check("correlation", key.clone(), set);
        }
        for (key, set) in &self.by_tag {
            check("tag", key.clone(), set);
        }
        for (key, set) in &self.by_hour {
            check("hour", key.to_string(), set);
        }

        for (id, entry) in &self.entries {
            let indexed = self.by_level.get(&entry.level).is_some_and(|s| s.contains(id))
                && self
                    .by_hour
                    .get(&hour_bucket(entry.timestamp))
                    .is_some_and(|s| s.contains(id));
            if !indexed {
                problems.push(format!("entry {} is missing from its postings", id));
            }
        }
        problems
    }
}

/// Intersects postings sets, smallest first.
pub(crate) fn intersect(mut sets: Vec<BTreeSet<u64>>) -> BTreeSet<u64> {
    sets.sort_by_key(|s| s.len());
    let mut iter = sets.into_iter();
    let Some(mut acc) = iter.next() else {
        return BTreeSet::new();
    };
    for set in iter {
        if acc.is_empty() {
            break;
        }
        acc.retain(|id| set.contains(id));
    }
    acc
}

use std::collections::{HashMap, HashSet};

use mcat_core::{CanonicalRecord, EntityKind, MaterializedEntry};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub inserted: usize,
    pub updated: usize,
    pub stable: usize,
    pub retired: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub to_insert: Vec<CanonicalRecord>,
    pub to_update: Vec<CanonicalRecord>,
    pub to_retire: Vec<String>,
    pub stable_count: usize,
    pub duplicates: usize,
}

impl Reconciliation {
    pub fn counts(&self) -> KindCounts {
        KindCounts {
            inserted: self.to_insert.len(),
            updated: self.to_update.len(),
            stable: self.stable_count,
            retired: self.to_retire.len(),
        }
    }
}

/// Only active entries take part in the lookup, so an entity that reappears
/// after being retired is a fresh insert.
pub fn reconcile<F>(
    kind: EntityKind,
    next: Vec<CanonicalRecord>,
    previous: &[MaterializedEntry],
    equals: F,
) -> Reconciliation
where
    F: Fn(&JsonValue, &JsonValue) -> bool,
{
    let active: HashMap<&str, &JsonValue> = previous
        .iter()
        .filter(|entry| entry.is_active())
        .map(|entry| (entry.id.as_str(), &entry.entity))
        .collect();

    let mut out = Reconciliation::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(next.len());
    for record in next {
        if !seen.insert(record.id.clone()) {
            warn!(%kind, id = %record.id, "duplicate identity in pass; keeping first");
            out.duplicates += 1;
            continue;
        }
        match active.get(record.id.as_str()) {
            None => out.to_insert.push(record),
            Some(prior) if equals(*prior, &record.body) => out.stable_count += 1,
            Some(_) => out.to_update.push(record),
        }
    }

    let mut to_retire: Vec<String> = active
        .keys()
        .filter(|id| !seen.contains(**id))
        .map(|id| id.to_string())
        .collect();
    to_retire.sort();
    out.to_retire = to_retire;
    out
}

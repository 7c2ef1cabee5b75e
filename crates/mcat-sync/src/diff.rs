use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use mcat_core::{CanonicalRecord, ChangeKind, ChangeOp, ChangeRecord, EntityKind, SnapshotId};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value as JsonValue};
use tracing::warn;

use crate::path::{FieldPath, PathPattern};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMode {
    Ordered,
    /// Order-insensitive set of scalars; an element's path segment is its value.
    Set,
    Keyed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeChangeMode {
    #[default]
    Replace,
    RemoveAdd,
}

#[derive(Debug, Clone, Default)]
pub struct DiffPolicy {
    pub ignored: Vec<PathPattern>,
    pub arrays: Vec<(PathPattern, ArrayMode)>,
    pub type_change: TypeChangeMode,
}

impl DiffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore(mut self, pattern: PathPattern) -> Self {
        self.ignored.push(pattern);
        self
    }

    pub fn array(mut self, pattern: PathPattern, mode: ArrayMode) -> Self {
        self.arrays.push((pattern, mode));
        self
    }

    pub fn type_change(mut self, mode: TypeChangeMode) -> Self {
        self.type_change = mode;
        self
    }

    pub fn without_ignores(&self) -> Self {
        Self {
            ignored: Vec::new(),
            arrays: self.arrays.clone(),
            type_change: self.type_change,
        }
    }

    pub fn is_ignored(&self, path: &FieldPath) -> bool {
        self.ignored.iter().any(|pattern| pattern.covers(path))
    }

    fn array_mode(&self, path: &FieldPath) -> &ArrayMode {
        const ORDERED: &ArrayMode = &ArrayMode::Ordered;
        self.arrays
            .iter()
            .find(|(pattern, _)| pattern.matches(path.segments()))
            .map(|(_, mode)| mode)
            .unwrap_or(ORDERED)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub change_kind: ChangeKind,
    pub path: FieldPath,
    pub operation: Option<ChangeOp>,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
}

impl EntityChange {
    pub fn into_record(
        self,
        entity_type: EntityKind,
        entity_id: &str,
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> ChangeRecord {
        let path = self.path.joined();
        let mut record = ChangeRecord {
            id: uuid::Uuid::nil(),
            crawl_id: current.clone(),
            previous_crawl_id: previous.clone(),
            entity_type,
            change_kind: self.change_kind,
            entity_id: entity_id.to_string(),
            path,
            path_level_1: self.path.level(1).map(str::to_string),
            path_level_2: self.path.level(2).map(str::to_string),
            operation: self.operation,
            before: self.before,
            after: self.after,
            is_display: true,
        };
        record.id = ChangeRecord::deterministic_id(previous, current, &record.key());
        record
    }
}

/// Entity-level diff: absent/present transitions become a single create or
/// delete carrying the whole entity; otherwise leaf updates.
pub fn diff_entity(
    before: Option<&JsonValue>,
    after: Option<&JsonValue>,
    policy: &DiffPolicy,
) -> Vec<EntityChange> {
    match (before, after) {
        (None, None) => Vec::new(),
        (None, Some(after)) => vec![EntityChange {
            change_kind: ChangeKind::Create,
            path: FieldPath::root(),
            operation: None,
            before: None,
            after: Some(after.clone()),
        }],
        (Some(before), None) => vec![EntityChange {
            change_kind: ChangeKind::Delete,
            path: FieldPath::root(),
            operation: None,
            before: Some(before.clone()),
            after: None,
        }],
        (Some(before), Some(after)) => diff_values(before, after, policy),
    }
}

pub fn diff_values(
    before: &JsonValue,
    after: &JsonValue,
    policy: &DiffPolicy,
) -> Vec<EntityChange> {
    let mut walker = Walker {
        policy,
        out: Vec::new(),
    };
    walker.compare(&FieldPath::root(), before, after);
    walker.out
}

pub fn structurally_equal(a: &JsonValue, b: &JsonValue, policy: &DiffPolicy) -> bool {
    diff_values(a, b, policy).is_empty()
}

/// A duplicate id within one side keeps the first occurrence; colliding change
/// keys keep the first record emitted.
pub fn diff_snapshot(
    kind: EntityKind,
    policy: &DiffPolicy,
    previous_entities: &[CanonicalRecord],
    current_entities: &[CanonicalRecord],
    previous: &SnapshotId,
    current: &SnapshotId,
) -> Vec<ChangeRecord> {
    let before = index_by_id(kind, previous_entities);
    let after = index_by_id(kind, current_entities);
    let ids: BTreeSet<&str> = before.keys().chain(after.keys()).copied().collect();

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for id in ids {
        let changes = diff_entity(before.get(id).copied(), after.get(id).copied(), policy);
        for change in changes {
            let record = change.into_record(kind, id, previous, current);
            if seen.insert(record.key()) {
                records.push(record);
            } else {
                warn!(
                    %kind,
                    entity_id = id,
                    path = %record.path,
                    "duplicate change key; keeping first"
                );
            }
        }
    }
    records
}

fn index_by_id<'a>(
    kind: EntityKind,
    entities: &'a [CanonicalRecord],
) -> HashMap<&'a str, &'a JsonValue> {
    let mut index = HashMap::with_capacity(entities.len());
    for entity in entities {
        if index.contains_key(entity.id.as_str()) {
            warn!(%kind, entity_id = %entity.id, "duplicate entity id in snapshot; keeping first");
            continue;
        }
        index.insert(entity.id.as_str(), &entity.body);
    }
    index
}

struct Walker<'p> {
    policy: &'p DiffPolicy,
    out: Vec<EntityChange>,
}

impl Walker<'_> {
    fn emit(
        &mut self,
        path: &FieldPath,
        op: ChangeOp,
        before: Option<&JsonValue>,
        after: Option<&JsonValue>,
    ) {
        self.out.push(EntityChange {
            change_kind: ChangeKind::Update,
            path: path.clone(),
            operation: Some(op),
            before: before.cloned(),
            after: after.cloned(),
        });
    }

    fn walk(&mut self, path: &FieldPath, before: Option<&JsonValue>, after: Option<&JsonValue>) {
        if self.policy.is_ignored(path) {
            return;
        }
        match (before, after) {
            (None, None) => {}
            (None, Some(after)) => self.emit(path, ChangeOp::Add, None, Some(after)),
            (Some(before), None) => self.emit(path, ChangeOp::Remove, Some(before), None),
            (Some(before), Some(after)) => self.compare(path, before, after),
        }
    }

    fn compare(&mut self, path: &FieldPath, before: &JsonValue, after: &JsonValue) {
        match (before, after) {
            (JsonValue::Object(b), JsonValue::Object(a)) => {
                let keys: BTreeSet<&String> = b.keys().chain(a.keys()).collect();
                for key in keys {
                    self.walk(&path.child(key.as_str()), b.get(key), a.get(key));
                }
            }
            (JsonValue::Array(b), JsonValue::Array(a)) => {
                let before_children = array_children(self.policy.array_mode(path), b);
                let after_children = array_children(self.policy.array_mode(path), a);
                let keys: BTreeSet<&String> = before_children
                    .keys()
                    .chain(after_children.keys())
                    .collect();
                for key in keys {
                    self.walk(
                        &path.child(key.as_str()),
                        before_children.get(key).copied(),
                        after_children.get(key).copied(),
                    );
                }
            }
            (JsonValue::Number(b), JsonValue::Number(a)) => {
                if numbers_differ(b, a) {
                    self.emit(path, ChangeOp::Replace, Some(before), Some(after));
                }
            }
            _ if same_type(before, after) => {
                if before != after {
                    self.emit(path, ChangeOp::Replace, Some(before), Some(after));
                }
            }
            _ => self.type_changed(path, before, after),
        }
    }

    fn type_changed(&mut self, path: &FieldPath, before: &JsonValue, after: &JsonValue) {
        if self.policy.type_change == TypeChangeMode::Replace {
            self.emit(path, ChangeOp::Replace, Some(before), Some(after));
            return;
        }
        let mut removed = Vec::new();
        let mut added = Vec::new();
        self.leaves(path, before, &mut removed);
        self.leaves(path, after, &mut added);
        let removed_paths: HashSet<&FieldPath> = removed.iter().map(|(p, _)| p).collect();
        if added.iter().any(|(p, _)| removed_paths.contains(p)) {
            self.emit(path, ChangeOp::Replace, Some(before), Some(after));
            return;
        }
        for (leaf, value) in removed {
            self.emit(&leaf, ChangeOp::Remove, Some(value), None);
        }
        for (leaf, value) in added {
            self.emit(&leaf, ChangeOp::Add, None, Some(value));
        }
    }

    fn leaves<'v>(
        &self,
        path: &FieldPath,
        value: &'v JsonValue,
        out: &mut Vec<(FieldPath, &'v JsonValue)>,
    ) {
        if self.policy.is_ignored(path) {
            return;
        }
        match value {
            JsonValue::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    self.leaves(&path.child(key.as_str()), child, out);
                }
            }
            JsonValue::Array(items) if !items.is_empty() => {
                for (key, child) in array_children(self.policy.array_mode(path), items) {
                    self.leaves(&path.child(key), child, out);
                }
            }
            _ => out.push((path.clone(), value)),
        }
    }
}

/// Integers compare exactly; only float forms fall back to f64.
fn numbers_differ(before: &Number, after: &Number) -> bool {
    if let (Some(b), Some(a)) = (before.as_i64(), after.as_i64()) {
        return b != a;
    }
    if let (Some(b), Some(a)) = (before.as_u64(), after.as_u64()) {
        return b != a;
    }
    before.as_f64() != after.as_f64()
}

fn same_type(a: &JsonValue, b: &JsonValue) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn element_key(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Later duplicates of a key are dropped.
fn array_children<'v>(mode: &ArrayMode, items: &'v [JsonValue]) -> BTreeMap<String, &'v JsonValue> {
    let mut children = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        let key = match mode {
            ArrayMode::Ordered => index.to_string(),
            ArrayMode::Set => element_key(item),
            ArrayMode::Keyed(field) => item
                .get(field)
                .map(element_key)
                .unwrap_or_else(|| element_key(item)),
        };
        children.entry(key).or_insert(item);
    }
    children
}

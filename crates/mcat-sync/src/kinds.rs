use mcat_core::{CanonicalRecord, ChangeRecord, EntityKind, SnapshotId};
use serde_json::Value as JsonValue;

use crate::diff::{diff_snapshot, structurally_equal, ArrayMode, DiffPolicy, TypeChangeMode};
use crate::path::PathPattern;

#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub kind: EntityKind,
    pub diff_policy: DiffPolicy,
    pub state_policy: DiffPolicy,
}

impl EntitySpec {
    pub fn for_kind(kind: EntityKind) -> Self {
        let diff_policy = match kind {
            EntityKind::Model => DiffPolicy::new()
                .ignore(PathPattern::exact(&["variant_slugs"]))
                .array(PathPattern::exact(&["variants"]), ArrayMode::Set)
                .array(PathPattern::exact(&["variant_slugs"]), ArrayMode::Set)
                .array(PathPattern::exact(&["input_modalities"]), ArrayMode::Set)
                .array(PathPattern::exact(&["output_modalities"]), ArrayMode::Set),
            EntityKind::Endpoint => DiffPolicy::new()
                .ignore(PathPattern::exact(&["stats"]))
                .array(PathPattern::exact(&["supported_parameters"]), ArrayMode::Set),
            EntityKind::Provider => DiffPolicy::new()
                .array(
                    PathPattern::exact(&["policy_links"]),
                    ArrayMode::Keyed("kind".to_string()),
                )
                .array(PathPattern::exact(&["regions"]), ArrayMode::Set)
                .type_change(TypeChangeMode::RemoveAdd),
        };
        let state_policy = diff_policy.without_ignores();
        Self {
            kind,
            diff_policy,
            state_policy,
        }
    }

    pub fn state_equal(&self, a: &JsonValue, b: &JsonValue) -> bool {
        structurally_equal(a, b, &self.state_policy)
    }

    pub fn diff(
        &self,
        previous_entities: &[CanonicalRecord],
        current_entities: &[CanonicalRecord],
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> Vec<ChangeRecord> {
        diff_snapshot(
            self.kind,
            &self.diff_policy,
            previous_entities,
            current_entities,
            previous,
            current,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_stats_are_ignored_by_diff_but_not_by_state() {
        let descriptor = EntitySpec::for_kind(EntityKind::Endpoint);
        let a = json!({"uuid": "ep", "status": 0, "stats": {"hourly": []}});
        let b = json!({
            "uuid": "ep",
            "status": 0,
            "stats": {"hourly": [{"timestamp": "2026-01-01T00:00:00Z"}]}
        });

        let prev = vec![CanonicalRecord {
            id: "ep".into(),
            body: a.clone(),
        }];
        let cur = vec![CanonicalRecord {
            id: "ep".into(),
            body: b.clone(),
        }];
        assert!(descriptor.diff(&prev, &cur, &"s1".into(), &"s2".into()).is_empty());
        assert!(!descriptor.state_equal(&a, &b));
    }

    #[test]
    fn model_state_ignores_array_order() {
        let descriptor = EntitySpec::for_kind(EntityKind::Model);
        let a = json!({"slug": "acme/foo", "variants": ["standard", "free"]});
        let b = json!({"slug": "acme/foo", "variants": ["free", "standard"]});
        assert!(descriptor.state_equal(&a, &b));
    }
}

//! Display filter: decides which update records are shown to consumers.

use std::path::Path;

use anyhow::{Context, Result};
use mcat_core::{ChangeKey, ChangeKind, ChangeOp, ChangeRecord, EntityKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::path::PathPattern;

/// `Undefined` is an absent field, `Null` an explicit null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueClass {
    Null,
    Undefined,
    Either,
    Neither,
    True,
    False,
    Boolean,
    String,
    Number,
    Object,
    Array,
}

impl ValueClass {
    pub fn matches(&self, value: Option<&JsonValue>) -> bool {
        match (self, value) {
            (ValueClass::Undefined, v) => v.is_none(),
            (ValueClass::Either, v) => matches!(v, None | Some(JsonValue::Null)),
            (ValueClass::Neither, v) => !matches!(v, None | Some(JsonValue::Null)),
            (_, None) => false,
            (ValueClass::Null, Some(v)) => v.is_null(),
            (ValueClass::True, Some(v)) => v.as_bool() == Some(true),
            (ValueClass::False, Some(v)) => v.as_bool() == Some(false),
            (ValueClass::Boolean, Some(v)) => v.is_boolean(),
            (ValueClass::String, Some(v)) => v.is_string(),
            (ValueClass::Number, Some(v)) => v.is_number(),
            (ValueClass::Object, Some(v)) => v.is_object(),
            (ValueClass::Array, Some(v)) => v.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePredicate {
    EntityType(EntityKind),
    Path(PathPattern),
    Operation(ChangeOp),
    /// Class of the affected value: `after` for add/replace, `before` for remove.
    Value(ValueClass),
    Before(ValueClass),
    After(ValueClass),
    All(Vec<RulePredicate>),
    Any(Vec<RulePredicate>),
    Not(Box<RulePredicate>),
}

impl RulePredicate {
    pub fn all(predicates: impl IntoIterator<Item = RulePredicate>) -> Self {
        RulePredicate::All(predicates.into_iter().collect())
    }

    pub fn path(raw: &str) -> Result<Self> {
        let pattern =
            PathPattern::parse(raw).with_context(|| format!("parsing path pattern {raw:?}"))?;
        Ok(RulePredicate::Path(pattern))
    }

    pub fn evaluate(&self, record: &ChangeRecord) -> bool {
        match self {
            RulePredicate::EntityType(kind) => record.entity_type == *kind,
            RulePredicate::Path(pattern) => pattern.matches_dotted(&record.path),
            RulePredicate::Operation(op) => record.operation == Some(*op),
            RulePredicate::Value(class) => class.matches(affected_value(record)),
            RulePredicate::Before(class) => class.matches(record.before.as_ref()),
            RulePredicate::After(class) => class.matches(record.after.as_ref()),
            RulePredicate::All(predicates) => predicates.iter().all(|p| p.evaluate(record)),
            RulePredicate::Any(predicates) => predicates.iter().any(|p| p.evaluate(record)),
            RulePredicate::Not(inner) => !inner.evaluate(record),
        }
    }
}

fn affected_value(record: &ChangeRecord) -> Option<&JsonValue> {
    match record.operation {
        Some(ChangeOp::Remove) => record.before.as_ref(),
        _ => record.after.as_ref(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub when: RulePredicate,
}

impl DisplayRule {
    pub fn new(name: impl Into<String>, when: RulePredicate) -> Self {
        Self {
            name: name.into(),
            description: None,
            when,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DisplayRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    rules: Vec<DisplayRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFilter {
    rules: Vec<DisplayRule>,
}

impl Default for DisplayFilter {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}

impl DisplayFilter {
    pub fn new(rules: Vec<DisplayRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[DisplayRule] {
        &self.rules
    }

    pub fn default_rules() -> Vec<DisplayRule> {
        vec![
            DisplayRule::new(
                "empty-field-added",
                RulePredicate::all([
                    RulePredicate::Operation(ChangeOp::Add),
                    RulePredicate::Value(ValueClass::Either),
                ]),
            ),
            DisplayRule::new(
                "empty-field-removed",
                RulePredicate::all([
                    RulePredicate::Operation(ChangeOp::Remove),
                    RulePredicate::Value(ValueClass::Either),
                ]),
            ),
            DisplayRule::new(
                "endpoint-stats",
                RulePredicate::all([
                    RulePredicate::EntityType(EntityKind::Endpoint),
                    RulePredicate::Path(PathPattern::prefix(&["stats"])),
                ]),
            ),
            DisplayRule::new(
                "model-updated-at",
                RulePredicate::all([
                    RulePredicate::EntityType(EntityKind::Model),
                    RulePredicate::Path(PathPattern::exact(&["updated_at"])),
                ]),
            ),
            DisplayRule::new(
                "endpoint-status",
                RulePredicate::all([
                    RulePredicate::EntityType(EntityKind::Endpoint),
                    RulePredicate::Path(PathPattern::exact(&["status"])),
                ]),
            ),
        ]
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: DisplayRulesFile = serde_yaml::from_str(text).context("parsing display rules")?;
        Ok(Self::new(file.rules))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("display.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no display rules file; using built-in rules");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn matching_rule(&self, record: &ChangeRecord) -> Option<&DisplayRule> {
        if record.change_kind != ChangeKind::Update {
            return None;
        }
        self.rules.iter().find(|rule| rule.when.evaluate(record))
    }

    pub fn is_displayable(&self, record: &ChangeRecord) -> bool {
        self.matching_rule(record).is_none()
    }

    pub fn apply(&self, records: &mut [ChangeRecord]) {
        for record in records {
            record.is_display = self.is_displayable(record);
        }
    }

    pub fn recompute(&self, records: &[ChangeRecord]) -> Vec<(ChangeKey, bool)> {
        records
            .iter()
            .filter_map(|record| {
                let display = self.is_displayable(record);
                (display != record.is_display).then(|| (record.key(), display))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(
        kind: EntityKind,
        path: &str,
        op: ChangeOp,
        before: Option<JsonValue>,
        after: Option<JsonValue>,
    ) -> ChangeRecord {
        let segments: Vec<&str> = path.split('.').collect();
        ChangeRecord {
            id: uuid::Uuid::nil(),
            crawl_id: "s2".into(),
            previous_crawl_id: "s1".into(),
            entity_type: kind,
            change_kind: ChangeKind::Update,
            entity_id: "x".into(),
            path: path.into(),
            path_level_1: segments.first().map(|s| s.to_string()),
            path_level_2: segments.get(1).map(|s| s.to_string()),
            operation: Some(op),
            before,
            after,
            is_display: true,
        }
    }

    fn replace(kind: EntityKind, path: &str, before: JsonValue, after: JsonValue) -> ChangeRecord {
        update(kind, path, ChangeOp::Replace, Some(before), Some(after))
    }

    fn price_change() -> ChangeRecord {
        replace(EntityKind::Endpoint, "pricing.prompt", json!("1"), json!("2"))
    }

    #[test]
    fn value_classes_distinguish_null_and_undefined() {
        assert!(ValueClass::Undefined.matches(None));
        assert!(!ValueClass::Undefined.matches(Some(&JsonValue::Null)));
        assert!(ValueClass::Null.matches(Some(&JsonValue::Null)));
        assert!(!ValueClass::Null.matches(None));
        assert!(ValueClass::Either.matches(None));
        assert!(ValueClass::Neither.matches(Some(&json!(0))));
        assert!(ValueClass::False.matches(Some(&json!(false))));
        assert!(!ValueClass::True.matches(Some(&json!("true"))));
        assert!(ValueClass::Array.matches(Some(&json!([]))));
    }

    #[test]
    fn default_rules_hide_noise_only() {
        let filter = DisplayFilter::default();

        let add = |after: JsonValue| {
            update(EntityKind::Model, "description", ChangeOp::Add, None, Some(after))
        };
        let null_added = add(JsonValue::Null);
        let real_added = add(json!("Fast"));
        let uptime = "stats.hourly.0.values.uptime";
        let stats = replace(EntityKind::Endpoint, uptime, json!(99.0), json!(98.0));
        let price = price_change();
        let bumped = replace(EntityKind::Model, "updated_at", json!("a"), json!("b"));

        assert!(!filter.is_displayable(&null_added));
        let rule = filter.matching_rule(&null_added).map(|r| r.name.as_str());
        assert_eq!(rule, Some("empty-field-added"));
        assert!(filter.is_displayable(&real_added));
        assert!(!filter.is_displayable(&stats));
        assert!(filter.is_displayable(&price));
        assert!(!filter.is_displayable(&bumped));
    }

    #[test]
    fn create_and_delete_are_always_displayed() {
        let hide_all = DisplayFilter::new(vec![DisplayRule::new(
            "hide-everything",
            RulePredicate::Not(Box::new(RulePredicate::Any(vec![]))),
        )]);
        let mut record = update(EntityKind::Provider, "", ChangeOp::Add, None, None);
        record.change_kind = ChangeKind::Create;
        record.operation = None;
        assert!(hide_all.is_displayable(&record));

        record.change_kind = ChangeKind::Delete;
        assert!(hide_all.is_displayable(&record));

        assert!(!hide_all.is_displayable(&price_change()));
    }

    #[test]
    fn first_matching_rule_wins() {
        let filter = DisplayFilter::new(vec![
            DisplayRule::new("pricing", RulePredicate::path("pricing.*").unwrap()),
            DisplayRule::new("prompt", RulePredicate::path("pricing.prompt").unwrap()),
        ]);
        assert_eq!(filter.matching_rule(&price_change()).unwrap().name, "pricing");
    }

    #[test]
    fn yaml_rules_parse_into_predicates() {
        let yaml = r#"
version: 1
rules:
  - name: quiet-quantization
    description: quantization flips between null and a value
    when:
      all:
        - entity_type: endpoint
        - path: quantization
        - not:
            after: string
"#;
        let filter = DisplayFilter::from_yaml_str(yaml).expect("parse");
        assert_eq!(filter.rules().len(), 1);

        let cleared = replace(EntityKind::Endpoint, "quantization", json!("fp8"), JsonValue::Null);
        let set = replace(EntityKind::Endpoint, "quantization", JsonValue::Null, json!("fp8"));
        assert!(!filter.is_displayable(&cleared));
        assert!(filter.is_displayable(&set));
    }

    #[test]
    fn bundled_rules_file_matches_built_in_rules() {
        let text = include_str!("../../../rules/display.yaml");
        let filter = DisplayFilter::from_yaml_str(text).expect("parse bundled rules");
        let shape = |rules: &[DisplayRule]| {
            rules
                .iter()
                .map(|r| (r.name.clone(), r.when.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(filter.rules()), shape(&DisplayFilter::default_rules()));
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let filter = DisplayFilter::from_workspace_root(dir.path()).expect("load");
        assert_eq!(filter, DisplayFilter::default());
    }

    #[test]
    fn recompute_reports_only_changed_flags() {
        let mut records = vec![
            replace(EntityKind::Model, "updated_at", json!("a"), json!("b")),
            replace(EntityKind::Model, "name", json!("A"), json!("B")),
        ];
        let filter = DisplayFilter::default();
        let flags = filter.recompute(&records);
        assert_eq!(flags, vec![(records[0].key(), false)]);

        filter.apply(&mut records);
        assert!(filter.recompute(&records).is_empty());
    }
}

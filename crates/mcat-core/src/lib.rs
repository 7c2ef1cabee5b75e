use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mcat-core";

pub const HOURLY_CAPACITY: usize = 72;
pub const DAILY_CAPACITY: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Model,
    Endpoint,
    Provider,
}

impl EntityKind {
    pub fn all() -> [EntityKind; 3] {
        [EntityKind::Model, EntityKind::Endpoint, EntityKind::Provider]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Model => "model",
            EntityKind::Endpoint => "endpoint",
            EntityKind::Provider => "provider",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ids compare lexicographically and increase across crawls.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SnapshotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariantDraft {
    pub slug: String,
    pub base_slug: String,
    pub variant: Option<String>,
    pub name: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub context_length: Option<u64>,
    pub input_modalities: Vec<String>,
    pub output_modalities: Vec<String>,
    pub supports_reasoning: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDraft {
    pub uuid: String,
    pub name: Option<String>,
    pub model_ref: String,
    pub provider_slug: String,
    pub variant: Option<String>,
    pub pricing: Pricing,
    pub limits: EndpointLimits,
    pub supported_parameters: Vec<String>,
    pub quantization: Option<String>,
    pub status: i64,
    pub is_disabled: bool,
    pub sample: Option<WindowPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalModel {
    pub slug: String,
    pub name: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub context_length: Option<u64>,
    pub input_modalities: Vec<String>,
    pub output_modalities: Vec<String>,
    pub supports_reasoning: bool,
    pub variants: Vec<String>,
    pub variant_slugs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt: Option<String>,
    pub completion: Option<String>,
    pub request: Option<String>,
    pub image: Option<String>,
    pub input_cache_read: Option<String>,
    pub input_cache_write: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimits {
    pub context_length: Option<u64>,
    pub max_completion_tokens: Option<u64>,
    pub max_prompt_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCapabilities {
    pub supports_image_input: bool,
    pub supports_audio_input: bool,
    pub supports_file_input: bool,
    pub supports_image_output: bool,
    pub supports_tools: bool,
    pub supports_structured_output: bool,
    pub supports_reasoning: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEndpoint {
    pub uuid: String,
    pub name: Option<String>,
    pub model_slug: String,
    pub provider_slug: String,
    pub variant: Option<String>,
    pub pricing: Pricing,
    pub limits: EndpointLimits,
    pub capabilities: EndpointCapabilities,
    pub supported_parameters: Vec<String>,
    pub quantization: Option<String>,
    pub status: i64,
    pub is_disabled: bool,
    pub stats: RollingWindow,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPolicy {
    pub training: Option<bool>,
    pub retains_prompts: Option<bool>,
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLink {
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalProvider {
    pub slug: String,
    pub name: String,
    pub headquarters: Option<String>,
    pub moderated: bool,
    pub byok_enabled: bool,
    pub data_policy: DataPolicy,
    pub policy_links: Vec<PolicyLink>,
    pub regions: Vec<String>,
    pub status_page_url: Option<String>,
}

pub trait CatalogEntity: Serialize {
    fn identity(&self) -> &str;

    fn to_record(&self) -> Result<CanonicalRecord, serde_json::Error> {
        Ok(CanonicalRecord {
            id: self.identity().to_string(),
            body: serde_json::to_value(self)?,
        })
    }
}

impl CatalogEntity for CanonicalModel {
    fn identity(&self) -> &str {
        &self.slug
    }
}

impl CatalogEntity for CanonicalEndpoint {
    fn identity(&self) -> &str {
        &self.uuid
    }
}

impl CatalogEntity for CanonicalProvider {
    fn identity(&self) -> &str {
        &self.slug
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub body: JsonValue,
}

/// One time-series sample. A point with no values marks a known gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPoint {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub values: std::collections::BTreeMap<String, f64>,
}

impl WindowPoint {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            values: Default::default(),
        }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: f64) -> Self {
        self.values.insert(field.into(), value);
        self
    }

    pub fn is_gap(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingWindow {
    #[serde(default)]
    pub hourly: Vec<WindowPoint>,
    #[serde(default)]
    pub daily: Vec<WindowPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Add,
    Remove,
    Replace,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Add => "add",
            ChangeOp::Remove => "remove",
            ChangeOp::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeKey {
    pub entity_type: EntityKind,
    pub change_kind: ChangeKind,
    pub entity_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub crawl_id: SnapshotId,
    pub previous_crawl_id: SnapshotId,
    pub entity_type: EntityKind,
    pub change_kind: ChangeKind,
    pub entity_id: String,
    pub path: String,
    pub path_level_1: Option<String>,
    pub path_level_2: Option<String>,
    pub operation: Option<ChangeOp>,
    /// `None` is "undefined" (field absent); `Some(Null)` is an explicit null.
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub is_display: bool,
}

impl ChangeRecord {
    pub fn key(&self) -> ChangeKey {
        ChangeKey {
            entity_type: self.entity_type,
            change_kind: self.change_kind,
            entity_id: self.entity_id.clone(),
            path: self.path.clone(),
        }
    }

    pub fn deterministic_id(previous: &SnapshotId, current: &SnapshotId, key: &ChangeKey) -> Uuid {
        let source = format!(
            "{}:{}:{}:{}:{}:{}",
            previous,
            current,
            key.entity_type,
            key.change_kind.as_str(),
            key.entity_id,
            key.path
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Retired { unavailable_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedEntry {
    pub kind: EntityKind,
    pub id: String,
    pub entity: JsonValue,
    pub lifecycle: Lifecycle,
    pub snapshot_id: SnapshotId,
    pub updated_at: DateTime<Utc>,
}

impl MaterializedEntry {
    pub fn is_active(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Active)
    }

    pub fn unavailable_at(&self) -> Option<DateTime<Utc>> {
        match self.lifecycle {
            Lifecycle::Active => None,
            Lifecycle::Retired { unavailable_at } => Some(unavailable_at),
        }
    }
}

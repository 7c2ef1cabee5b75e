use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use mcat_core::{
    CanonicalProvider, DataPolicy, EndpointDraft, EndpointLimits, EntityKind, ModelVariantDraft,
    PolicyLink, Pricing, SnapshotId, WindowPoint,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mcat-adapters";

pub const METRIC_UPTIME: &str = "uptime";
pub const METRIC_LATENCY_MS: &str = "latency_ms";
pub const METRIC_THROUGHPUT_TPS: &str = "throughput_tps";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("unresolved {kind} reference `{reference}`")]
    UnresolvedReference { kind: EntityKind, reference: String },
}

impl RecordError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: EntityKind,
    pub snapshot_id: SnapshotId,
    pub record_index: Option<usize>,
    pub identifier: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        kind: EntityKind,
        snapshot_id: &SnapshotId,
        record_index: Option<usize>,
        identifier: Option<String>,
        error: &RecordError,
    ) -> Self {
        Self {
            kind,
            snapshot_id: snapshot_id.clone(),
            record_index,
            identifier,
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validated<T> {
    pub items: Vec<T>,
    pub issues: Vec<ValidationIssue>,
}

impl<T> Default for Validated<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            issues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawModel {
    slug: String,
    #[serde(alias = "permaslug")]
    base_slug: Option<String>,
    variant: Option<String>,
    name: String,
    author: Option<String>,
    description: Option<String>,
    context_length: Option<u64>,
    #[serde(default)]
    input_modalities: Vec<String>,
    #[serde(default)]
    output_modalities: Vec<String>,
    #[serde(default)]
    supports_reasoning: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEndpoint {
    #[serde(alias = "id")]
    uuid: String,
    name: Option<String>,
    model_slug: String,
    provider_slug: String,
    variant: Option<String>,
    #[serde(default)]
    pricing: BTreeMap<String, JsonValue>,
    context_length: Option<u64>,
    max_completion_tokens: Option<u64>,
    max_prompt_tokens: Option<u64>,
    #[serde(default)]
    supported_parameters: Vec<String>,
    quantization: Option<String>,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    is_disabled: bool,
    stats: Option<RawEndpointStats>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEndpointStats {
    observed_at: DateTime<Utc>,
    uptime: Option<f64>,
    p50_latency: Option<f64>,
    p50_throughput: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawProvider {
    slug: String,
    name: String,
    headquarters: Option<String>,
    #[serde(default)]
    moderated: bool,
    #[serde(default)]
    byok_enabled: bool,
    #[serde(default)]
    data_policy: DataPolicy,
    terms_of_service_url: Option<String>,
    privacy_policy_url: Option<String>,
    #[serde(default)]
    regions: Vec<String>,
    status_page_url: Option<String>,
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key).and_then(JsonValue::as_str)
}

pub fn raw_identifier(kind: EntityKind, value: &JsonValue) -> Option<String> {
    let keys: &[&str] = match kind {
        EntityKind::Model | EntityKind::Provider => &["slug", "name"],
        EntityKind::Endpoint => &["uuid", "id"],
    };
    keys.iter()
        .find_map(|key| json_str(value, key))
        .map(str::to_string)
}

fn text_or_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_text(value: String, field: &'static str) -> Result<String, RecordError> {
    text_or_none(Some(value)).ok_or(RecordError::MissingField(field))
}

fn normalize_tags(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let tag = value.trim().to_ascii_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

fn validate_each<T>(
    kind: EntityKind,
    snapshot_id: &SnapshotId,
    records: &[JsonValue],
    parse: impl Fn(&JsonValue) -> Result<T, RecordError>,
) -> Validated<T> {
    let mut validated = Validated::default();
    for (index, record) in records.iter().enumerate() {
        match parse(record) {
            Ok(item) => validated.items.push(item),
            Err(err) => {
                let identifier = raw_identifier(kind, record);
                debug!(
                    %kind,
                    %snapshot_id,
                    index,
                    ?identifier,
                    error = %err,
                    "rejected raw record"
                );
                validated.issues.push(ValidationIssue::new(
                    kind,
                    snapshot_id,
                    Some(index),
                    identifier,
                    &err,
                ));
            }
        }
    }
    validated
}

pub fn validate_models(
    snapshot_id: &SnapshotId,
    records: &[JsonValue],
) -> Validated<ModelVariantDraft> {
    validate_each(EntityKind::Model, snapshot_id, records, parse_model)
}

pub fn validate_endpoints(
    snapshot_id: &SnapshotId,
    records: &[JsonValue],
) -> Validated<EndpointDraft> {
    validate_each(EntityKind::Endpoint, snapshot_id, records, parse_endpoint)
}

pub fn validate_providers(
    snapshot_id: &SnapshotId,
    records: &[JsonValue],
) -> Validated<CanonicalProvider> {
    validate_each(EntityKind::Provider, snapshot_id, records, parse_provider)
}

fn parse_model(value: &JsonValue) -> Result<ModelVariantDraft, RecordError> {
    let raw: RawModel = serde_json::from_value(value.clone())?;
    let slug = required_text(raw.slug, "slug")?;
    let name = required_text(raw.name, "name")?;

    // `vendor/model:variant` slugs carry their variant tag when none is given.
    let (slug_base, slug_variant) = match slug.split_once(':') {
        Some((base, tag)) => (base.to_string(), text_or_none(Some(tag.to_string()))),
        None => (slug.clone(), None),
    };
    let base_slug = text_or_none(raw.base_slug).unwrap_or(slug_base);
    let variant = text_or_none(raw.variant).or(slug_variant);
    let mut updated_at = raw.updated_at.unwrap_or(raw.created_at);
    if updated_at < raw.created_at {
        warn!(
            %slug,
            %updated_at,
            created_at = %raw.created_at,
            "updated_at precedes created_at; clamping"
        );
        updated_at = raw.created_at;
    }

    Ok(ModelVariantDraft {
        slug,
        base_slug,
        variant,
        name,
        author: text_or_none(raw.author),
        description: text_or_none(raw.description),
        context_length: raw.context_length,
        input_modalities: normalize_tags(raw.input_modalities),
        output_modalities: normalize_tags(raw.output_modalities),
        supports_reasoning: raw.supports_reasoning,
        created_at: raw.created_at,
        updated_at,
    })
}

/// Upstream prices arrive as decimal strings or bare numbers. Negative values
/// such as `"-1"` are upstream sentinels and are kept verbatim.
fn normalize_price(field: &str, value: &JsonValue) -> Result<Option<String>, RecordError> {
    let text = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => {
            return Err(RecordError::invalid(
                format!("pricing.{field}"),
                format!("expected decimal, got {other}"),
            ))
        }
    };
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(text)),
        _ => Err(RecordError::invalid(
            format!("pricing.{field}"),
            format!("`{text}` is not a decimal"),
        )),
    }
}

fn parse_pricing(raw: &BTreeMap<String, JsonValue>) -> Result<Pricing, RecordError> {
    let price = |field: &str| match raw.get(field) {
        Some(value) => normalize_price(field, value),
        None => Ok(None),
    };
    Ok(Pricing {
        prompt: price("prompt")?,
        completion: price("completion")?,
        request: price("request")?,
        image: price("image")?,
        input_cache_read: price("input_cache_read")?,
        input_cache_write: price("input_cache_write")?,
    })
}

fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}

fn parse_stats(raw: RawEndpointStats) -> Result<WindowPoint, RecordError> {
    let mut point = WindowPoint::new(hour_start(raw.observed_at));
    for (field, value) in [
        (METRIC_UPTIME, raw.uptime),
        (METRIC_LATENCY_MS, raw.p50_latency),
        (METRIC_THROUGHPUT_TPS, raw.p50_throughput),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(RecordError::invalid(
                    format!("stats.{field}"),
                    "negative or non-finite",
                ));
            }
            point.values.insert(field.to_string(), v);
        }
    }
    Ok(point)
}

fn parse_endpoint(value: &JsonValue) -> Result<EndpointDraft, RecordError> {
    let raw: RawEndpoint = serde_json::from_value(value.clone())?;
    let uuid = required_text(raw.uuid, "uuid")?;
    let model_ref = required_text(raw.model_slug, "model_slug")?;
    let provider_slug = required_text(raw.provider_slug, "provider_slug")?;
    let pricing = parse_pricing(&raw.pricing)?;
    let sample = raw.stats.map(parse_stats).transpose()?;

    Ok(EndpointDraft {
        uuid,
        name: text_or_none(raw.name),
        model_ref,
        provider_slug,
        variant: text_or_none(raw.variant),
        pricing,
        limits: EndpointLimits {
            context_length: raw.context_length,
            max_completion_tokens: raw.max_completion_tokens,
            max_prompt_tokens: raw.max_prompt_tokens,
        },
        supported_parameters: normalize_tags(raw.supported_parameters),
        quantization: text_or_none(raw.quantization),
        status: raw.status,
        is_disabled: raw.is_disabled,
        sample,
    })
}

fn parse_provider(value: &JsonValue) -> Result<CanonicalProvider, RecordError> {
    let raw: RawProvider = serde_json::from_value(value.clone())?;
    let slug = required_text(raw.slug, "slug")?;
    let name = required_text(raw.name, "name")?;

    let mut policy_links = Vec::new();
    for (kind, url) in [
        ("terms_of_service", raw.terms_of_service_url),
        ("privacy_policy", raw.privacy_policy_url),
    ] {
        if let Some(url) = text_or_none(url) {
            policy_links.push(PolicyLink {
                kind: kind.to_string(),
                url,
            });
        }
    }

    Ok(CanonicalProvider {
        slug,
        name,
        headquarters: text_or_none(raw.headquarters),
        moderated: raw.moderated,
        byok_enabled: raw.byok_enabled,
        data_policy: raw.data_policy,
        policy_links,
        regions: normalize_tags(raw.regions),
        status_page_url: text_or_none(raw.status_page_url),
    })
}

pub fn load_raw_listing(path: impl AsRef<Path>) -> Result<Vec<JsonValue>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut page) => match page.remove("data") {
            Some(JsonValue::Array(items)) => Ok(items),
            _ => bail!("{} has no `data` array", path.display()),
        },
        _ => bail!("{} is neither an array nor a listing page", path.display()),
    }
}

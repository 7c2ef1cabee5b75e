use std::collections::{HashMap, HashSet};

use mcat_adapters::{RecordError, ValidationIssue};
use mcat_core::{
    CanonicalEndpoint, CanonicalModel, CanonicalProvider, CanonicalRecord, CatalogEntity,
    EndpointCapabilities, EndpointDraft, EntityKind, RollingWindow, SnapshotId,
};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::consolidate::Consolidated;
use crate::window::fold_window;

#[derive(Debug, Clone)]
pub struct CanonicalSnapshot {
    pub snapshot_id: SnapshotId,
    pub models: Vec<CanonicalModel>,
    pub endpoints: Vec<CanonicalEndpoint>,
    pub providers: Vec<CanonicalProvider>,
    pub issues: Vec<ValidationIssue>,
}

fn to_records<T: CatalogEntity>(items: &[T]) -> Result<Vec<CanonicalRecord>, serde_json::Error> {
    items.iter().map(CatalogEntity::to_record).collect()
}

impl CanonicalSnapshot {
    pub fn records(&self, kind: EntityKind) -> Result<Vec<CanonicalRecord>, serde_json::Error> {
        match kind {
            EntityKind::Model => to_records(&self.models),
            EntityKind::Endpoint => to_records(&self.endpoints),
            EntityKind::Provider => to_records(&self.providers),
        }
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Model => self.models.len(),
            EntityKind::Endpoint => self.endpoints.len(),
            EntityKind::Provider => self.providers.len(),
        }
    }
}

fn has_tag(tags: &[String], wanted: &[&str]) -> bool {
    tags.iter().any(|tag| wanted.contains(&tag.as_str()))
}

pub fn derive_capabilities(
    model: &CanonicalModel,
    supported_parameters: &[String],
) -> EndpointCapabilities {
    EndpointCapabilities {
        supports_image_input: has_tag(&model.input_modalities, &["image"]),
        supports_audio_input: has_tag(&model.input_modalities, &["audio"]),
        supports_file_input: has_tag(&model.input_modalities, &["file"]),
        supports_image_output: has_tag(&model.output_modalities, &["image"]),
        supports_tools: has_tag(supported_parameters, &["tools", "tool_choice"]),
        supports_structured_output: has_tag(
            supported_parameters,
            &["structured_outputs", "response_format"],
        ),
        supports_reasoning: model.supports_reasoning
            || has_tag(supported_parameters, &["reasoning", "include_reasoning"]),
    }
}

pub fn build_endpoint(
    draft: EndpointDraft,
    models: &Consolidated,
    provider_slugs: &HashSet<&str>,
    prior_window: Option<&RollingWindow>,
    required_fields: &[String],
) -> Result<CanonicalEndpoint, RecordError> {
    let model = models
        .resolve(&draft.model_ref)
        .ok_or_else(|| RecordError::UnresolvedReference {
            kind: EntityKind::Model,
            reference: draft.model_ref.clone(),
        })?;
    if !provider_slugs.contains(draft.provider_slug.as_str()) {
        return Err(RecordError::UnresolvedReference {
            kind: EntityKind::Provider,
            reference: draft.provider_slug,
        });
    }

    let variant = draft.variant.or_else(|| {
        draft
            .model_ref
            .split_once(':')
            .map(|(_, tag)| tag.to_string())
            .filter(|tag| !tag.is_empty())
    });
    let incoming: Vec<_> = draft.sample.into_iter().collect();
    let stats = fold_window(
        prior_window.unwrap_or(&RollingWindow::default()),
        &incoming,
        required_fields,
    );

    Ok(CanonicalEndpoint {
        capabilities: derive_capabilities(model, &draft.supported_parameters),
        uuid: draft.uuid,
        name: draft.name,
        model_slug: model.slug.clone(),
        provider_slug: draft.provider_slug,
        variant,
        pricing: draft.pricing,
        limits: draft.limits,
        supported_parameters: draft.supported_parameters,
        quantization: draft.quantization,
        status: draft.status,
        is_disabled: draft.is_disabled,
        stats,
    })
}

pub fn prior_windows<'a>(
    entries: impl IntoIterator<Item = (&'a str, &'a JsonValue)>,
) -> HashMap<String, RollingWindow> {
    let mut windows = HashMap::new();
    for (id, body) in entries {
        let Some(stats) = body.get("stats") else {
            continue;
        };
        match serde_json::from_value::<RollingWindow>(stats.clone()) {
            Ok(window) => {
                windows.insert(id.to_string(), window);
            }
            Err(err) => {
                warn!(endpoint = id, error = %err, "unreadable stored window; starting empty")
            }
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mcat_core::{EndpointLimits, ModelVariantDraft, Pricing, WindowPoint};
    use serde_json::json;

    use crate::consolidate::consolidate_models;

    fn models() -> Consolidated {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        consolidate_models(vec![ModelVariantDraft {
            slug: "acme/vision:free".into(),
            base_slug: "acme/vision".into(),
            variant: Some("free".into()),
            name: "Vision (free)".into(),
            author: None,
            description: None,
            context_length: None,
            input_modalities: vec!["text".into(), "image".into()],
            output_modalities: vec!["text".into()],
            supports_reasoning: false,
            created_at: ts,
            updated_at: ts,
        }])
    }

    fn draft(model_ref: &str, provider: &str) -> EndpointDraft {
        EndpointDraft {
            uuid: "ep-1".into(),
            name: None,
            model_ref: model_ref.into(),
            provider_slug: provider.into(),
            variant: None,
            pricing: Pricing::default(),
            limits: EndpointLimits::default(),
            supported_parameters: vec!["tools".into(), "include_reasoning".into()],
            quantization: None,
            status: 0,
            is_disabled: false,
            sample: Some(
                WindowPoint::new(Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).single().unwrap())
                    .with_value("uptime", 99.0),
            ),
        }
    }

    #[test]
    fn variant_references_resolve_to_the_canonical_model() {
        let providers: HashSet<&str> = ["acme"].into_iter().collect();
        let required = vec!["uptime".to_string()];
        let endpoint = build_endpoint(
            draft("acme/vision:free", "acme"),
            &models(),
            &providers,
            None,
            &required,
        )
        .expect("resolves");

        assert_eq!(endpoint.model_slug, "acme/vision");
        assert_eq!(endpoint.variant.as_deref(), Some("free"));
        assert!(endpoint.capabilities.supports_image_input);
        assert!(!endpoint.capabilities.supports_audio_input);
        assert!(endpoint.capabilities.supports_tools);
        assert!(endpoint.capabilities.supports_reasoning);
        assert_eq!(endpoint.stats.hourly.len(), 1);
        assert_eq!(endpoint.stats.daily.len(), 1);
    }

    #[test]
    fn unresolved_references_are_record_errors() {
        let providers: HashSet<&str> = ["acme"].into_iter().collect();
        let missing_model =
            build_endpoint(draft("other/model", "acme"), &models(), &providers, None, &[]);
        assert!(matches!(
            missing_model,
            Err(RecordError::UnresolvedReference { kind: EntityKind::Model, .. })
        ));

        let missing_provider =
            build_endpoint(draft("acme/vision", "nobody"), &models(), &providers, None, &[]);
        assert!(matches!(
            missing_provider,
            Err(RecordError::UnresolvedReference { kind: EntityKind::Provider, .. })
        ));
    }

    #[test]
    fn prior_windows_skip_unreadable_stats() {
        let good = json!({"stats": {"hourly": [
            {"timestamp": "2026-03-01T05:00:00Z", "values": {"uptime": 1.0}}
        ]}});
        let bad = json!({"stats": "oops"});
        let none = json!({});
        let windows = prior_windows([("a", &good), ("b", &bad), ("c", &none)]);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows["a"].hourly.len(), 1);
    }
}

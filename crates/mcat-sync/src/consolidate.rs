use std::collections::{BTreeMap, HashMap};

use mcat_core::{CanonicalModel, ModelVariantDraft};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct Consolidated {
    pub models: Vec<CanonicalModel>,
    aliases: HashMap<String, usize>,
}

impl Consolidated {
    pub fn resolve(&self, reference: &str) -> Option<&CanonicalModel> {
        self.aliases
            .get(reference)
            .and_then(|&index| self.models.get(index))
    }
}

/// Shorter display names win: suffixes like "(free)" lengthen variant names.
fn base_rank(draft: &ModelVariantDraft) -> (usize, &str) {
    (draft.name.chars().count(), draft.slug.as_str())
}

pub fn consolidate_models(drafts: Vec<ModelVariantDraft>) -> Consolidated {
    let mut groups: BTreeMap<String, Vec<ModelVariantDraft>> = BTreeMap::new();
    for draft in drafts {
        let group = groups.entry(draft.base_slug.clone()).or_default();
        if group.iter().any(|d| d.slug == draft.slug) {
            warn!(slug = %draft.slug, "duplicate model variant slug; keeping first");
            continue;
        }
        group.push(draft);
    }

    let mut consolidated = Consolidated::default();
    for (base_slug, mut group) in groups {
        group.sort_by(|a, b| base_rank(a).cmp(&base_rank(b)));
        let Some(base) = group.first() else {
            continue;
        };

        let mut variants: Vec<String> = Vec::new();
        for tag in group.iter().filter_map(|d| d.variant.as_deref()) {
            let tag = tag.trim();
            if !tag.is_empty() && !variants.iter().any(|v| v == tag) {
                variants.push(tag.to_string());
            }
        }
        let mut variant_slugs: Vec<String> = group.iter().map(|d| d.slug.clone()).collect();
        variant_slugs.sort();

        let index = consolidated.models.len();
        consolidated.aliases.insert(base_slug.clone(), index);
        for slug in &variant_slugs {
            consolidated.aliases.insert(slug.clone(), index);
        }

        let created_at = group.iter().map(|d| d.created_at).min().unwrap_or(base.created_at);
        let updated_at = group.iter().map(|d| d.updated_at).max().unwrap_or(base.updated_at);
        consolidated.models.push(CanonicalModel {
            slug: base_slug,
            name: base.name.clone(),
            author: base.author.clone(),
            description: base.description.clone(),
            context_length: base.context_length,
            input_modalities: base.input_modalities.clone(),
            output_modalities: base.output_modalities.clone(),
            supports_reasoning: base.supports_reasoning,
            variants,
            variant_slugs,
            created_at,
            updated_at,
        });
    }
    consolidated
}

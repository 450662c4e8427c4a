//! Catalog validation
//!
//! The catalog is checked once at startup. Every problem found is collected and
//! reported together in a single `Config` error.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use common::error::{Error, Result};
use common::models::StyleEntry;
use common::types::{EngineTarget, DETERMINISTIC_ENGINE_ID, SAFETY_NET_STYLE};

use crate::catalog::Catalog;

const SOURCE_SCHEMES: [&str; 4] = ["http://", "https://", "file://", "builtin://"];

/// Validates a catalog against the set of engines the binary ships
#[derive(Debug, Clone)]
pub struct CatalogValidator {
    known_engines: HashSet<String>,
}

impl CatalogValidator {
    /// Creates a validator; the deterministic engine is always known
    pub fn new<I, S>(known_engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known_engines: HashSet<String> = known_engines.into_iter().map(Into::into).collect();
        known_engines.insert(DETERMINISTIC_ENGINE_ID.to_string());
        Self { known_engines }
    }

    /// Validates the catalog, returning every problem in one error
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        let mut problems = Vec::new();

        self.check_tiers(catalog, &mut problems);
        self.check_styles(catalog, &mut problems);
        self.check_models(catalog, &mut problems);

        if problems.is_empty() {
            debug!(
                "Catalog valid: {} tiers, {} styles, {} models",
                catalog.tiers.len(),
                catalog.styles.len(),
                catalog.models.len()
            );
            Ok(())
        } else {
            Err(Error::Config(format!(
                "invalid catalog: {}",
                problems.join("; ")
            )))
        }
    }

    fn check_tiers(&self, catalog: &Catalog, problems: &mut Vec<String>) {
        if catalog.tiers.is_empty() {
            problems.push("catalog defines no tiers".to_string());
            return;
        }

        let mut seen = HashSet::new();
        for tier in &catalog.tiers {
            if !seen.insert(tier.id.as_str()) {
                problems.push(format!("duplicate tier id '{}'", tier.id));
            }
            if !self.known_engines.contains(&tier.preferred_engine) {
                problems.push(format!(
                    "tier '{}' prefers unknown engine '{}'",
                    tier.id, tier.preferred_engine
                ));
            }
            if tier.budget.max_models == 0 {
                problems.push(format!("tier '{}' allows zero models", tier.id));
            }
            if tier.budget.cache_byte_budget < tier.budget.max_model_bytes {
                problems.push(format!(
                    "tier '{}' cache budget is smaller than its max model size",
                    tier.id
                ));
            }
        }

        let last = catalog.tiers.len() - 1;
        if !catalog.tiers[last].requirements.is_unconditional() {
            problems.push(format!(
                "weakest tier '{}' must have no requirements",
                catalog.tiers[last].id
            ));
        }
        for tier in &catalog.tiers[..last] {
            if tier.requirements.is_unconditional() {
                problems.push(format!(
                    "tier '{}' has no requirements, so the tiers after it are unreachable",
                    tier.id
                ));
            }
        }
    }

    fn check_styles(&self, catalog: &Catalog, problems: &mut Vec<String>) {
        let mut ids = HashSet::new();
        for style in &catalog.styles {
            if !ids.insert(style.id.as_str()) {
                problems.push(format!("duplicate style id '{}'", style.id));
            }
        }

        let by_id: HashMap<&str, &StyleEntry> =
            catalog.styles.iter().map(|s| (s.id.as_str(), s)).collect();

        match by_id.get(SAFETY_NET_STYLE) {
            None => problems.push(format!("safety-net style '{}' is missing", SAFETY_NET_STYLE)),
            Some(entry) if !entry.engine.is_deterministic() => problems.push(format!(
                "safety-net style '{}' must use the deterministic engine, not '{}'",
                SAFETY_NET_STYLE, entry.engine
            )),
            Some(_) => {}
        }

        for style in &catalog.styles {
            if style.requires_dual_input {
                problems.push(format!(
                    "style '{}' requires a second input image, which is not supported",
                    style.id
                ));
            }

            if let EngineTarget::Engine(engine) = &style.engine {
                if !self.known_engines.contains(engine) {
                    problems.push(format!("style '{}' uses unknown engine '{}'", style.id, engine));
                }
            }

            if let Some(target) = &style.fallback {
                if !by_id.contains_key(target.as_str()) {
                    problems.push(format!(
                        "style '{}' falls back to unknown style '{}'",
                        style.id, target
                    ));
                    continue;
                }
            }

            if let Err(problem) = terminal_style(&by_id, style) {
                problems.push(problem);
            }

            self.check_style_models(catalog, style, problems);
        }
    }

    fn check_style_models(&self, catalog: &Catalog, style: &StyleEntry, problems: &mut Vec<String>) {
        let engines: Vec<&str> = match &style.engine {
            EngineTarget::Engine(engine) => vec![engine.as_str()],
            EngineTarget::Auto => {
                let mut engines: Vec<&str> = catalog
                    .tiers
                    .iter()
                    .map(|t| t.preferred_engine.as_str())
                    .collect();
                engines.sort_unstable();
                engines.dedup();
                engines
            }
        };

        for engine in engines {
            if engine == DETERMINISTIC_ENGINE_ID || !self.known_engines.contains(engine) {
                continue;
            }
            let model_type = style.model_id();
            if !catalog
                .models_for_engine(engine)
                .any(|m| m.model_type == model_type)
            {
                problems.push(format!(
                    "style '{}' needs a '{}' model for engine '{}' but none is described",
                    style.id, model_type, engine
                ));
            }
        }
    }

    fn check_models(&self, catalog: &Catalog, problems: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for model in &catalog.models {
            if !seen.insert((model.engine.as_str(), model.model_type.as_str(), model.quality_level)) {
                problems.push(format!(
                    "duplicate model '{}' for engine '{}'",
                    model.cache_key(),
                    model.engine
                ));
            }
            if model.engine == DETERMINISTIC_ENGINE_ID {
                problems.push(format!(
                    "model '{}' targets the deterministic engine, which loads no models",
                    model.cache_key()
                ));
            } else if !self.known_engines.contains(&model.engine) {
                problems.push(format!(
                    "model '{}' targets unknown engine '{}'",
                    model.cache_key(),
                    model.engine
                ));
            }
            if !SOURCE_SCHEMES
                .iter()
                .any(|scheme| model.source_location.starts_with(scheme))
            {
                problems.push(format!(
                    "model '{}' has unsupported source '{}'",
                    model.cache_key(),
                    model.source_location
                ));
            }
            if model.approx_size_bytes == 0 {
                problems.push(format!("model '{}' has zero size", model.cache_key()));
            }
        }
    }
}

/// Walks a style's fallback links until a deterministic style is reached
fn terminal_style<'a>(
    by_id: &HashMap<&str, &'a StyleEntry>,
    start: &'a StyleEntry,
) -> std::result::Result<&'a StyleEntry, String> {
    let mut visited = HashSet::new();
    let mut current = start;

    loop {
        if current.engine.is_deterministic() {
            return Ok(current);
        }
        if !visited.insert(current.id.as_str()) || visited.len() > by_id.len() {
            return Err(format!("style '{}' has a cyclic fallback chain", start.id));
        }
        match current.fallback.as_deref() {
            Some(next) => match by_id.get(next) {
                Some(entry) => current = entry,
                // Reported separately as an unknown fallback target.
                None => return Ok(current),
            },
            None => {
                return Err(format!(
                    "fallback chain of style '{}' ends at '{}' instead of a deterministic style",
                    start.id, current.id
                ))
            }
        }
    }
}

/// Ordered fallback chain starting at `style_id`, ending at the first deterministic style
///
/// Fails with `UnknownStyle` when the starting style is missing and with `Config`
/// when a link is broken or the chain loops.
pub fn fallback_chain<'a>(styles: &'a [StyleEntry], style_id: &str) -> Result<Vec<&'a StyleEntry>> {
    let mut current = styles
        .iter()
        .find(|s| s.id == style_id)
        .ok_or_else(|| Error::UnknownStyle(style_id.to_string()))?;

    let mut chain = vec![current];
    while !current.engine.is_deterministic() {
        let Some(next) = current.fallback.as_deref() else {
            break;
        };
        current = styles
            .iter()
            .find(|s| s.id == next)
            .ok_or_else(|| Error::Config(format!("style '{}' falls back to unknown style '{}'", current.id, next)))?;

        if chain.iter().any(|s| s.id == current.id) || chain.len() >= styles.len() {
            return Err(Error::Config(format!("style '{}' has a cyclic fallback chain", style_id)));
        }
        chain.push(current);
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{PIPELINE_ENGINE_ID, TENSOR_ENGINE_ID};

    use crate::defaults::default_catalog;

    fn validator() -> CatalogValidator {
        CatalogValidator::new([TENSOR_ENGINE_ID, PIPELINE_ENGINE_ID])
    }

    fn style(id: &str, engine: &str, fallback: Option<&str>) -> StyleEntry {
        StyleEntry {
            id: id.to_string(),
            engine: EngineTarget::from(engine),
            model: None,
            fallback: fallback.map(str::to_string),
            requires_dual_input: false,
        }
    }

    fn problems(catalog: &Catalog) -> String {
        match validator().validate(catalog) {
            Err(Error::Config(message)) => message,
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_catalog_is_valid() {
        validator().validate(&default_catalog()).unwrap();
    }

    #[test]
    fn test_every_default_chain_ends_deterministic() {
        let catalog = default_catalog();
        for style in &catalog.styles {
            let chain = fallback_chain(&catalog.styles, &style.id).unwrap();
            assert!(chain.len() <= catalog.styles.len());
            assert!(chain.last().unwrap().engine.is_deterministic(), "{}", style.id);
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let mut catalog = default_catalog();
        for (id, next) in [("a", "b"), ("b", "a")] {
            let mut entry = style(id, PIPELINE_ENGINE_ID, Some(next));
            entry.model = Some("edge_net".to_string());
            catalog.styles.push(entry);
        }

        assert!(problems(&catalog).contains("cyclic"));
        assert!(matches!(fallback_chain(&catalog.styles, "a"), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_engine_and_fallback_rejected() {
        let mut catalog = default_catalog();
        catalog.styles.push(style("mystery", "quantum", Some("nowhere")));

        let message = problems(&catalog);
        assert!(message.contains("unknown engine 'quantum'"));
        assert!(message.contains("unknown style 'nowhere'"));
    }

    #[test]
    fn test_chain_must_end_deterministic() {
        let mut catalog = default_catalog();
        let mut dead_end = style("dead_end", PIPELINE_ENGINE_ID, None);
        dead_end.model = Some("edge_net".to_string());
        catalog.styles.push(dead_end);

        assert!(problems(&catalog).contains("instead of a deterministic style"));
    }

    #[test]
    fn test_weakest_tier_must_be_unconditional() {
        let mut catalog = default_catalog();
        catalog.tiers.pop();
        assert!(problems(&catalog).contains("must have no requirements"));
    }

    #[test]
    fn test_weakest_tier_may_spell_out_false_flags() {
        let mut catalog = default_catalog();
        let weakest = catalog.tiers.last_mut().unwrap();
        weakest.requirements.accelerated_gpu = Some(false);
        weakest.requirements.portable_compute = Some(false);
        validator().validate(&catalog).unwrap();
    }

    #[test]
    fn test_duplicates_and_dual_input_rejected() {
        let mut catalog = default_catalog();
        catalog.styles.push(style("pencil", DETERMINISTIC_ENGINE_ID, None));
        let mut dual = style("blend_two", DETERMINISTIC_ENGINE_ID, None);
        dual.requires_dual_input = true;
        catalog.styles.push(dual);

        let message = problems(&catalog);
        assert!(message.contains("duplicate style id 'pencil'"));
        assert!(message.contains("second input image"));
    }

    #[test]
    fn test_missing_model_descriptor_rejected() {
        let mut catalog = default_catalog();
        catalog.models.retain(|m| m.model_type != "anime_lines");
        assert!(problems(&catalog).contains("'anime_lines' model for engine 'tensor'"));
    }

    #[test]
    fn test_safety_net_style_required() {
        let mut catalog = default_catalog();
        catalog.styles.retain(|s| s.id != SAFETY_NET_STYLE);
        for style in &mut catalog.styles {
            if style.fallback.as_deref() == Some(SAFETY_NET_STYLE) {
                style.fallback = Some("outline".to_string());
            }
        }
        let message = problems(&catalog);
        assert!(message.contains("safety-net style 'pencil' is missing"), "{}", message);

        let mut catalog = default_catalog();
        let pencil = catalog.styles.iter_mut().find(|s| s.id == SAFETY_NET_STYLE).unwrap();
        pencil.engine = EngineTarget::from(PIPELINE_ENGINE_ID);
        pencil.model = Some("edge_net".to_string());
        pencil.fallback = Some("outline".to_string());
        let message = problems(&catalog);
        assert!(message.contains("must use the deterministic engine"), "{}", message);
    }

    #[test]
    fn test_bad_model_source_rejected() {
        let mut catalog = default_catalog();
        catalog.models[0].source_location = "ftp://example.invalid/model.bin".to_string();
        assert!(problems(&catalog).contains("unsupported source"));
    }

    #[test]
    fn test_fallback_chain_unknown_start() {
        let catalog = default_catalog();
        assert!(matches!(
            fallback_chain(&catalog.styles, "missing"),
            Err(Error::UnknownStyle(_))
        ));
        let chain: Vec<&str> = fallback_chain(&catalog.styles, "ai_sketch")
            .unwrap()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(chain, vec!["ai_sketch", "pencil_pipeline", "pencil"]);
    }
}

//! Style catalog
//!
//! Maps style ids to engines, model ids and fallback styles.

use std::collections::HashMap;

use common::error::{Error, Result};
use common::models::StyleEntry;
use common::types::DETERMINISTIC_ENGINE_ID;
use config::fallback_chain;

pub use common::types::SAFETY_NET_STYLE;

/// Validated set of styles
#[derive(Debug, Clone)]
pub struct StyleCatalog {
    styles: Vec<StyleEntry>,
    index: HashMap<String, usize>,
}

impl StyleCatalog {
    /// Builds the catalog; fails if any style's fallback chain is broken
    pub fn new(styles: Vec<StyleEntry>) -> Result<Self> {
        let mut index = HashMap::with_capacity(styles.len());
        for (position, style) in styles.iter().enumerate() {
            if index.insert(style.id.clone(), position).is_some() {
                return Err(Error::Config(format!("duplicate style '{}'", style.id)));
            }
        }

        let catalog = Self { styles, index };
        for style in &catalog.styles {
            let chain = catalog.chain(&style.id)?;
            let ends_deterministic = chain
                .last()
                .map_or(false, |last| last.engine.is_deterministic());
            if !ends_deterministic {
                return Err(Error::Config(format!(
                    "fallback chain of '{}' does not end on the {} engine",
                    style.id, DETERMINISTIC_ENGINE_ID
                )));
            }
        }
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&StyleEntry> {
        self.index.get(id).map(|position| &self.styles[*position])
    }

    /// Like [`get`](Self::get) but returns `UnknownStyle` on a miss
    pub fn require(&self, id: &str) -> Result<&StyleEntry> {
        self.get(id).ok_or_else(|| Error::UnknownStyle(id.to_string()))
    }

    /// The style followed by its fallbacks, ending on a deterministic style
    pub fn chain(&self, id: &str) -> Result<Vec<&StyleEntry>> {
        fallback_chain(&self.styles, id)
    }

    pub fn entries(&self) -> &[StyleEntry] {
        &self.styles
    }

    pub fn ids(&self) -> Vec<&str> {
        self.styles.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}

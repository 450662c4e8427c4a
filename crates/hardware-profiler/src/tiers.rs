//! Tier catalog, assignment and the shared active tier

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::error::{Error, Result};
use common::models::{CapabilitySnapshot, Tier, TierBudget};
use common::types::QualityLevel;

/// Ordered list of tiers, strongest first
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: Vec<Tier>,
}

impl TierCatalog {
    /// Creates a catalog; the list must be non-empty and end with an unconditional tier
    pub fn new(tiers: Vec<Tier>) -> Result<Self> {
        match tiers.last() {
            None => Err(Error::Config("tier catalog is empty".to_string())),
            Some(last) if !last.requirements.is_unconditional() => Err(Error::Config(format!(
                "weakest tier '{}' must have no requirements",
                last.id
            ))),
            Some(_) => Ok(Self { tiers }),
        }
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// Index of a tier, 0 being the strongest
    pub fn position(&self, id: &str) -> Option<usize> {
        self.tiers.iter().position(|t| t.id == id)
    }

    pub fn strongest(&self) -> &Tier {
        &self.tiers[0]
    }

    pub fn weakest(&self) -> &Tier {
        &self.tiers[self.tiers.len() - 1]
    }

    /// Tier one step weaker than `id`
    pub fn next_weaker(&self, id: &str) -> Option<&Tier> {
        self.position(id).and_then(|idx| self.tiers.get(idx + 1))
    }

    /// Tier one step stronger than `id`
    pub fn next_stronger(&self, id: &str) -> Option<&Tier> {
        self.position(id)
            .and_then(|idx| idx.checked_sub(1))
            .and_then(|idx| self.tiers.get(idx))
    }
}

/// Settings derived from a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    pub tier_id: String,
    pub quality_level: QualityLevel,
    pub preferred_engine: String,
    pub allows_parallelism: bool,
    pub budget: TierBudget,
}

impl From<&Tier> for AdaptiveSettings {
    fn from(tier: &Tier) -> Self {
        Self {
            tier_id: tier.id.clone(),
            quality_level: tier.budget.quality_level,
            preferred_engine: tier.preferred_engine.clone(),
            allows_parallelism: tier.budget.allows_parallelism,
            budget: tier.budget.clone(),
        }
    }
}

/// Maps capability snapshots to tiers
#[derive(Debug, Clone)]
pub struct TierAssigner {
    catalog: Arc<TierCatalog>,
}

impl TierAssigner {
    /// Creates a new tier assigner
    pub fn new(catalog: Arc<TierCatalog>) -> Self {
        Self { catalog }
    }

    /// First tier, strongest to weakest, whose requirements the snapshot meets
    pub fn assign(&self, snapshot: &CapabilitySnapshot) -> &Tier {
        let tier = self
            .catalog
            .tiers()
            .iter()
            .find(|tier| tier.requirements.is_satisfied_by(snapshot))
            .unwrap_or_else(|| self.catalog.weakest());

        debug!("Assigned tier '{}'", tier.id);
        tier
    }

    /// Adaptive settings for a tier
    pub fn adaptive_settings(&self, tier: &Tier) -> AdaptiveSettings {
        AdaptiveSettings::from(tier)
    }

    pub fn catalog(&self) -> &Arc<TierCatalog> {
        &self.catalog
    }
}

/// Cause of a tier change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Benchmark,
    Latency,
    MemoryPressure,
    Manual,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::Benchmark => write!(f, "benchmark"),
            TransitionReason::Latency => write!(f, "latency"),
            TransitionReason::MemoryPressure => write!(f, "memory_pressure"),
            TransitionReason::Manual => write!(f, "manual"),
        }
    }
}

/// Recorded tier change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTransition {
    pub from: String,
    pub to: String,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Current tier, shared between the router, the benchmark and the monitor
#[derive(Debug)]
pub struct ActiveTier {
    /// Tier catalog
    catalog: Arc<TierCatalog>,

    /// Current tier
    current: RwLock<Tier>,

    /// Transition log, oldest first
    transitions: Mutex<Vec<TierTransition>>,
}

impl ActiveTier {
    /// Creates the active tier starting at `initial`
    pub fn new(catalog: Arc<TierCatalog>, initial: &Tier) -> Self {
        info!("Active tier set to '{}'", initial.id);
        Self {
            catalog,
            current: RwLock::new(initial.clone()),
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the current tier
    pub fn current(&self) -> Tier {
        self.current.read().clone()
    }

    pub fn current_id(&self) -> String {
        self.current.read().id.clone()
    }

    pub fn settings(&self) -> AdaptiveSettings {
        AdaptiveSettings::from(&*self.current.read())
    }

    pub fn catalog(&self) -> &Arc<TierCatalog> {
        &self.catalog
    }

    /// Switches to the named tier; returns the new tier if it changed
    pub fn switch_to(&self, tier_id: &str, reason: TransitionReason) -> Result<Option<Tier>> {
        let target = self
            .catalog
            .get(tier_id)
            .ok_or_else(|| Error::Config(format!("unknown tier '{}'", tier_id)))?
            .clone();

        let from = {
            let mut current = self.current.write();
            if current.id == target.id {
                return Ok(None);
            }
            std::mem::replace(&mut *current, target.clone())
        };

        info!("Tier changed from '{}' to '{}' ({})", from.id, target.id, reason);
        self.transitions.lock().push(TierTransition {
            from: from.id,
            to: target.id.clone(),
            reason,
            at: Utc::now(),
        });

        Ok(Some(target))
    }

    /// Moves one tier weaker; `None` when already at the weakest tier
    pub fn downgrade(&self, reason: TransitionReason) -> Option<Tier> {
        let next = self.catalog.next_weaker(&self.current_id())?.id.clone();
        self.switch_to(&next, reason).ok().flatten()
    }

    /// Moves one tier stronger; `None` when already at the strongest tier
    pub fn upgrade(&self, reason: TransitionReason) -> Option<Tier> {
        let next = self.catalog.next_stronger(&self.current_id())?.id.clone();
        self.switch_to(&next, reason).ok().flatten()
    }

    /// Transition log, oldest first
    pub fn transitions(&self) -> Vec<TierTransition> {
        self.transitions.lock().clone()
    }
}

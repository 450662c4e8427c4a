//! Micro-benchmarks
//!
//! A benchmark run executes a fixed set of synthetic workloads, maps each to a
//! score in `[0, 100]`, averages the scores and recommends moving one tier up or
//! down when the average is far from expectations. A recommended tier always
//! has requirements the host meets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::CapabilitySnapshot;
use config::ConfigManager;

use crate::tiers::TierCatalog;

/// Raw outcome of one workload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    /// Fixed amount of work; faster is better
    Elapsed {
        elapsed: Duration,
        /// Milliseconds that cost one point
        ms_per_point: f64,
    },
    /// Fixed time window; more operations is better
    Throughput {
        operations: u64,
        /// Operations worth one point
        per_point: f64,
    },
}

impl Measurement {
    /// Score in `[0, 100]`
    pub fn score(&self) -> f64 {
        let raw = match *self {
            Measurement::Elapsed { elapsed, ms_per_point } => {
                100.0 - elapsed.as_secs_f64() * 1000.0 / ms_per_point.max(f64::EPSILON)
            }
            Measurement::Throughput { operations, per_point } => {
                operations as f64 / per_point.max(f64::EPSILON)
            }
        };

        if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, 100.0)
        }
    }
}

/// A synthetic workload
pub trait Workload: Send + Sync {
    /// Name used as the score key
    fn name(&self) -> &str;

    /// Only run when the accelerated path is present
    fn requires_accelerated(&self) -> bool {
        false
    }

    /// Runs the workload
    fn run(&self) -> Result<Measurement>;
}

/// Scoring constants, read from `benchmark.*`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConstants {
    pub surface_iterations: usize,
    pub surface_ms_per_point: f64,
    pub allocation_window: Duration,
    pub allocations_per_point: f64,
    pub compute_iterations: usize,
    pub compute_ms_per_point: f64,
    pub accelerated_iterations: usize,
    pub accelerated_ms_per_point: f64,
    /// Averages below this recommend the next weaker tier
    pub downgrade_below: f64,
    /// Averages at or above this recommend the next stronger tier
    pub upgrade_at_or_above: f64,
}

impl Default for ScoringConstants {
    fn default() -> Self {
        Self {
            surface_iterations: 200,
            surface_ms_per_point: 5.0,
            allocation_window: Duration::from_millis(50),
            allocations_per_point: 400.0,
            compute_iterations: 40,
            compute_ms_per_point: 3.0,
            accelerated_iterations: 40,
            accelerated_ms_per_point: 1.5,
            downgrade_below: 40.0,
            upgrade_at_or_above: 80.0,
        }
    }
}

impl ScoringConstants {
    /// Reads the constants from configuration, keeping defaults for missing keys
    pub fn from_config(config: &ConfigManager) -> Self {
        let d = Self::default();
        Self {
            surface_iterations: config.get_usize("benchmark.surface_iterations").unwrap_or(d.surface_iterations),
            surface_ms_per_point: config.get_f64("benchmark.surface_ms_per_point").unwrap_or(d.surface_ms_per_point),
            allocation_window: config.get_duration("benchmark.allocation_window_ms").unwrap_or(d.allocation_window),
            allocations_per_point: config.get_f64("benchmark.allocations_per_point").unwrap_or(d.allocations_per_point),
            compute_iterations: config.get_usize("benchmark.compute_iterations").unwrap_or(d.compute_iterations),
            compute_ms_per_point: config.get_f64("benchmark.compute_ms_per_point").unwrap_or(d.compute_ms_per_point),
            accelerated_iterations: config
                .get_usize("benchmark.accelerated_iterations")
                .unwrap_or(d.accelerated_iterations),
            accelerated_ms_per_point: config
                .get_f64("benchmark.accelerated_ms_per_point")
                .unwrap_or(d.accelerated_ms_per_point),
            downgrade_below: config.get_f64("benchmark.downgrade_below").unwrap_or(d.downgrade_below),
            upgrade_at_or_above: config.get_f64("benchmark.upgrade_at_or_above").unwrap_or(d.upgrade_at_or_above),
        }
    }
}

/// Classification of an average score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Excellent,
    Good,
    Acceptable,
    Poor,
    VeryPoor,
}

impl Classification {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Classification::Excellent
        } else if score >= 60.0 {
            Classification::Good
        } else if score >= 40.0 {
            Classification::Acceptable
        } else if score >= 20.0 {
            Classification::Poor
        } else {
            Classification::VeryPoor
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Classification::Excellent => "excellent",
            Classification::Good => "good",
            Classification::Acceptable => "acceptable",
            Classification::Poor => "poor",
            Classification::VeryPoor => "very_poor",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Score per workload that ran
    pub per_test_score: BTreeMap<String, f64>,
    /// Mean of the available scores
    pub average_score: f64,
    pub classification: Classification,
    /// Tier the run recommends
    pub recommended_tier_id: String,
    pub elapsed: Duration,
}

/// Runs workloads and recommends a tier
pub struct Benchmark {
    /// Tier catalog used for neighbour lookups
    catalog: Arc<TierCatalog>,

    /// Workloads, in run order
    workloads: Vec<Box<dyn Workload>>,

    /// Thresholds
    constants: ScoringConstants,
}

impl Benchmark {
    /// Creates a benchmark with the built-in workloads
    pub fn new(catalog: Arc<TierCatalog>, constants: ScoringConstants) -> Self {
        let workloads: Vec<Box<dyn Workload>> = vec![
            Box::new(SurfaceWorkload::new(constants.surface_iterations, constants.surface_ms_per_point)),
            Box::new(AllocationWorkload::new(constants.allocation_window, constants.allocations_per_point)),
            Box::new(ComputeWorkload::new(constants.compute_iterations, constants.compute_ms_per_point)),
            Box::new(AcceleratedWorkload::new(
                constants.accelerated_iterations,
                constants.accelerated_ms_per_point,
            )),
        ];
        Self::with_workloads(catalog, constants, workloads)
    }

    /// Creates a benchmark with custom workloads
    pub fn with_workloads(
        catalog: Arc<TierCatalog>,
        constants: ScoringConstants,
        workloads: Vec<Box<dyn Workload>>,
    ) -> Self {
        Self { catalog, workloads, constants }
    }

    /// Runs every applicable workload and recommends a tier
    ///
    /// Failed workloads are left out of the average. When no workload produces a
    /// score the current tier is kept.
    pub fn run(&self, snapshot: &CapabilitySnapshot, current_tier_id: &str) -> BenchmarkResult {
        let start = Instant::now();
        let mut per_test_score = BTreeMap::new();

        for workload in &self.workloads {
            if workload.requires_accelerated() && !snapshot.accelerated_gpu {
                debug!("Skipping workload '{}': no accelerated path", workload.name());
                continue;
            }

            match workload.run() {
                Ok(measurement) => {
                    let score = measurement.score();
                    debug!("Workload '{}' scored {:.1}", workload.name(), score);
                    per_test_score.insert(workload.name().to_string(), score);
                }
                Err(e) => warn!("Workload '{}' failed: {}", workload.name(), e),
            }
        }

        let average_score = if per_test_score.is_empty() {
            0.0
        } else {
            per_test_score.values().sum::<f64>() / per_test_score.len() as f64
        };

        let recommended_tier_id = if per_test_score.is_empty() {
            current_tier_id.to_string()
        } else {
            self.recommend(snapshot, average_score, current_tier_id)
        };

        let result = BenchmarkResult {
            classification: Classification::from_score(average_score),
            per_test_score,
            average_score,
            recommended_tier_id,
            elapsed: start.elapsed(),
        };

        info!(
            "Benchmark finished: average {:.1} ({}), recommended tier '{}'",
            result.average_score, result.classification, result.recommended_tier_id
        );

        result
    }

    /// Runs the benchmark on the blocking thread pool
    pub async fn run_blocking(
        self: Arc<Self>,
        snapshot: CapabilitySnapshot,
        current_tier_id: String,
    ) -> Result<BenchmarkResult> {
        tokio::task::spawn_blocking(move || self.run(&snapshot, &current_tier_id))
            .await
            .map_err(|e| Error::Internal(format!("benchmark task failed: {}", e)))
    }

    fn recommend(&self, snapshot: &CapabilitySnapshot, average: f64, current_tier_id: &str) -> String {
        if average < self.constants.downgrade_below {
            let mut candidate = self.catalog.next_weaker(current_tier_id);
            while let Some(weaker) = candidate {
                if weaker.requirements.is_satisfied_by(snapshot) {
                    return weaker.id.clone();
                }
                candidate = self.catalog.next_weaker(&weaker.id);
            }
        } else if average >= self.constants.upgrade_at_or_above {
            match self.catalog.next_stronger(current_tier_id) {
                Some(stronger) if stronger.requirements.is_satisfied_by(snapshot) => {
                    return stronger.id.clone();
                }
                Some(stronger) => debug!(
                    "Score {:.1} suggests '{}' but the host does not meet its requirements",
                    average, stronger.id
                ),
                None => {}
            }
        }
        current_tier_id.to_string()
    }
}

/// Draws strokes and fills onto an RGBA surface
#[derive(Debug, Clone)]
pub struct SurfaceWorkload {
    iterations: usize,
    ms_per_point: f64,
}

impl SurfaceWorkload {
    const SIDE: usize = 256;

    pub fn new(iterations: usize, ms_per_point: f64) -> Self {
        Self { iterations, ms_per_point }
    }
}

impl Workload for SurfaceWorkload {
    fn name(&self) -> &str {
        "surface"
    }

    fn run(&self) -> Result<Measurement> {
        let start = Instant::now();
        let mut surface = vec![0u8; Self::SIDE * Self::SIDE * 4];

        for i in 0..self.iterations {
            let shade = (i % 255) as u8;
            // One diagonal stroke and one filled rectangle per iteration.
            for t in 0..Self::SIDE {
                let x = (t + i) % Self::SIDE;
                let idx = (t * Self::SIDE + x) * 4;
                surface[idx..idx + 4].copy_from_slice(&[shade, shade, shade, 255]);
            }
            let origin = i % (Self::SIDE / 2);
            for y in origin..origin + 32 {
                let row = y * Self::SIDE * 4;
                for x in origin..origin + 32 {
                    surface[row + x * 4] = surface[row + x * 4].wrapping_add(shade);
                }
            }
        }

        std::hint::black_box(&surface);
        Ok(Measurement::Elapsed {
            elapsed: start.elapsed(),
            ms_per_point: self.ms_per_point,
        })
    }
}

/// Allocates and touches buffers for a fixed window
#[derive(Debug, Clone)]
pub struct AllocationWorkload {
    window: Duration,
    per_point: f64,
}

impl AllocationWorkload {
    const BLOCK_BYTES: usize = 64 * 1024;

    pub fn new(window: Duration, per_point: f64) -> Self {
        Self { window, per_point }
    }
}

impl Workload for AllocationWorkload {
    fn name(&self) -> &str {
        "allocation"
    }

    fn run(&self) -> Result<Measurement> {
        let start = Instant::now();
        let mut operations = 0u64;

        while start.elapsed() < self.window {
            let mut block = vec![0u8; Self::BLOCK_BYTES];
            block[operations as usize % Self::BLOCK_BYTES] = 1;
            std::hint::black_box(&block);
            operations += 1;
        }

        Ok(Measurement::Throughput {
            operations,
            per_point: self.per_point,
        })
    }
}

/// Repeated matrix products
#[derive(Debug, Clone)]
pub struct ComputeWorkload {
    iterations: usize,
    ms_per_point: f64,
}

impl ComputeWorkload {
    const SIDE: usize = 64;

    pub fn new(iterations: usize, ms_per_point: f64) -> Self {
        Self { iterations, ms_per_point }
    }
}

impl Workload for ComputeWorkload {
    fn name(&self) -> &str {
        "compute"
    }

    fn run(&self) -> Result<Measurement> {
        let start = Instant::now();
        let a = Array2::from_shape_fn((Self::SIDE, Self::SIDE), |(i, j)| ((i * j) % 7) as f32 * 0.1);
        let mut acc = Array2::<f32>::eye(Self::SIDE);

        for _ in 0..self.iterations {
            acc = acc.dot(&a);
            let norm = acc.iter().fold(0.0f32, |m, v| m.max(v.abs())).max(1.0);
            acc.mapv_inplace(|v| v / norm);
        }

        std::hint::black_box(&acc);
        Ok(Measurement::Elapsed {
            elapsed: start.elapsed(),
            ms_per_point: self.ms_per_point,
        })
    }
}

/// Data-parallel transform exercising the accelerated path
#[derive(Debug, Clone)]
pub struct AcceleratedWorkload {
    iterations: usize,
    ms_per_point: f64,
}

impl AcceleratedWorkload {
    const LEN: usize = 1 << 16;

    pub fn new(iterations: usize, ms_per_point: f64) -> Self {
        Self { iterations, ms_per_point }
    }
}

impl Workload for AcceleratedWorkload {
    fn name(&self) -> &str {
        "accelerated"
    }

    fn requires_accelerated(&self) -> bool {
        true
    }

    fn run(&self) -> Result<Measurement> {
        let start = Instant::now();
        let mut data: Vec<f32> = (0..Self::LEN).map(|i| (i % 255) as f32 / 255.0).collect();

        for _ in 0..self.iterations {
            data.par_chunks_mut(1024).for_each(|chunk| {
                for v in chunk.iter_mut() {
                    *v = (*v * 1.0001 + 0.5).sqrt().fract();
                }
            });
        }

        std::hint::black_box(&data);
        Ok(Measurement::Elapsed {
            elapsed: start.elapsed(),
            ms_per_point: self.ms_per_point,
        })
    }
}

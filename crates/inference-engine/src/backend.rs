//! Execution backend resolution

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::error::Result;
use common::models::CapabilitySnapshot;

/// Where an engine runs its numeric work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    /// Accelerated GPU path
    Accelerated,
    /// Intermediate GPU path
    Intermediate,
    /// SIMD-capable CPU
    Portable,
    /// Plain scalar CPU; always available
    Scalar,
}

impl ExecutionBackend {
    /// Backends the snapshot advertises, strongest first; always ends with `Scalar`
    pub fn candidates(snapshot: &CapabilitySnapshot) -> Vec<ExecutionBackend> {
        let mut candidates = Vec::with_capacity(4);
        if snapshot.accelerated_gpu {
            candidates.push(ExecutionBackend::Accelerated);
        }
        if snapshot.intermediate_gpu {
            candidates.push(ExecutionBackend::Intermediate);
        }
        if snapshot.portable_compute {
            candidates.push(ExecutionBackend::Portable);
        }
        candidates.push(ExecutionBackend::Scalar);
        candidates
    }

    /// Whether filters may run data-parallel on this backend
    pub fn supports_parallelism(&self) -> bool {
        !matches!(self, ExecutionBackend::Scalar)
    }
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionBackend::Accelerated => write!(f, "accelerated"),
            ExecutionBackend::Intermediate => write!(f, "intermediate"),
            ExecutionBackend::Portable => write!(f, "portable"),
            ExecutionBackend::Scalar => write!(f, "scalar"),
        }
    }
}

/// Picks the strongest candidate whose initialization succeeds
///
/// `Scalar` is used when every other candidate fails; its initializer is not
/// consulted.
pub fn resolve_backend<F>(engine: &str, snapshot: &CapabilitySnapshot, mut init: F) -> ExecutionBackend
where
    F: FnMut(ExecutionBackend) -> Result<()>,
{
    for backend in ExecutionBackend::candidates(snapshot) {
        if backend == ExecutionBackend::Scalar {
            break;
        }
        match init(backend) {
            Ok(()) => {
                info!("Engine '{}' using {} backend", engine, backend);
                return backend;
            }
            Err(e) => warn!("Engine '{}' could not initialize {} backend: {}", engine, backend, e),
        }
    }

    info!("Engine '{}' using scalar backend", engine);
    ExecutionBackend::Scalar
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::Error;

    fn snapshot(accelerated: bool, intermediate: bool, portable: bool) -> CapabilitySnapshot {
        CapabilitySnapshot {
            accelerated_gpu: accelerated,
            intermediate_gpu: intermediate,
            portable_compute: portable,
            ..CapabilitySnapshot::conservative()
        }
    }

    #[test]
    fn test_candidates_order() {
        assert_eq!(
            ExecutionBackend::candidates(&snapshot(true, true, true)),
            vec![
                ExecutionBackend::Accelerated,
                ExecutionBackend::Intermediate,
                ExecutionBackend::Portable,
                ExecutionBackend::Scalar
            ]
        );
        assert_eq!(
            ExecutionBackend::candidates(&CapabilitySnapshot::conservative()),
            vec![ExecutionBackend::Scalar]
        );
    }

    #[test]
    fn test_resolution_falls_back() {
        let backend = resolve_backend("tensor", &snapshot(true, false, true), |b| match b {
            ExecutionBackend::Accelerated => Err(Error::Internal("no device".into())),
            _ => Ok(()),
        });
        assert_eq!(backend, ExecutionBackend::Portable);

        let backend = resolve_backend("tensor", &snapshot(true, true, true), |_| {
            Err(Error::Internal("nothing works".into()))
        });
        assert_eq!(backend, ExecutionBackend::Scalar);
    }
}

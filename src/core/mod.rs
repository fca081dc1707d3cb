//! The core module
pub mod estimators;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The hard cap on the number of integration dimensions. The stratification
/// grid addresses its cells with a single linear index, so the number of
/// cells, `bins^dim`, must stay representable; beyond this many dimensions no
/// sensible bin count does.
pub const MAX_DIMENSIONS: usize = 15;

/// Integrand trait
///
/// The integrand must be non-negative everywhere on the unit hypercube and
/// deterministic in its argument: the event generator evaluates the same
/// point against different envelope draws and relies on getting the same
/// weight back.
pub trait Integrand<T: Copy> {
    /// Call the integrand with a phase space point.
    fn call(&self, x: &[T]) -> T;
    /// The dimension of the integrand.
    fn dim(&self) -> usize;
}

/// The phase of operation during which an error was encountered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// The one-shot sweep populating the per-cell maxima.
    GridPreparation,
    /// Rejection sampling of unweighted events.
    Generation,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GridPreparation => write!(f, "grid preparation"),
            Self::Generation => write!(f, "event generation"),
        }
    }
}

/// Errors reported by the integrators and generators of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested number of dimensions exceeds [`MAX_DIMENSIONS`].
    #[error("number of integration dimensions {dim} exceeds the maximum of {max}")]
    DimensionTooLarge {
        /// The requested number of dimensions.
        dim: usize,
        /// The compiled maximum, [`MAX_DIMENSIONS`].
        max: usize,
    },
    /// The cell count `bins^dim` does not fit into the linear cell index.
    #[error("stratification grid with {bins}^{dim} cells overflows the cell index")]
    GridOverflow {
        /// The number of grid bins per dimension.
        bins: usize,
        /// The requested number of dimensions.
        dim: usize,
    },
    /// The integrand returned a NaN or infinite weight where a finite one is
    /// required for rejection sampling to be sound.
    #[error("integrand returned a non-finite weight during {phase}")]
    NonFiniteWeight {
        /// The phase of operation during which the weight was encountered.
        phase: Phase,
    },
}

/// A checkpoint saves the state of an integration after an iteration,
/// including the state of the random number generator before and after it, so
/// that any iteration's result can be reproduced in isolation.
#[derive(Debug, Deserialize, Serialize)]
pub struct Checkpoint<R, E> {
    rng_before: R,
    rng_after: R,
    estimators: E,
}

impl<R, E> Checkpoint<R, E> {
    /// Constructor
    pub(crate) fn new(rng_before: R, rng_after: R, estimators: E) -> Self {
        Self {
            rng_before,
            rng_after,
            estimators,
        }
    }

    /// Returns the random number generator before generation of this checkpoint.
    pub fn rng_before(&self) -> &R {
        &self.rng_before
    }

    /// Returns the random number generator after generation of this checkpoint
    pub fn rng_after(&self) -> &R {
        &self.rng_after
    }

    /// Returns the estimators of this checkpoint.
    pub fn estimators(&self) -> &E {
        &self.estimators
    }

    /// Destructure the checkpoint and return its components.
    pub fn destructure(self) -> (R, R, E) {
        (self.rng_before, self.rng_after, self.estimators)
    }
}

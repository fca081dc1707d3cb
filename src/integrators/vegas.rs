//! VEGAS integrator
//!
//! An adaptive importance-sampling integrator. Each dimension carries a grid
//! of bins whose boundaries are redistributed after every pass so that bins
//! end up concentrated where the integrand (squared) is large. Iteration
//! estimates are combined into a running inverse-variance-weighted average
//! together with a chi-square diagnostic of their mutual compatibility.
use crate::callbacks::Callback;
use crate::core::estimators::*;
use crate::core::*;

use log::{info, warn};
use num_traits::{Float, FromPrimitive};
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Number of adaptive bins per dimension.
const N_BINS: usize = 50;

/// Damping exponent for the grid refinement. Smaller values make the grid
/// adapt more slowly but more stably.
const ALPHA: f64 = 1.5;

/// Number of integrand evaluations spent on the warm-up pass.
const WARMUP_CALLS: usize = 10_000;

/// Estimators for the VEGAS integrator.
///
/// Unlike a single-iteration estimate, these are cumulative: `mean` and `var`
/// describe the inverse-variance-weighted combination of all refinement
/// iterations performed so far, and [`IterativeEstimators::chi_sq`] reports
/// how compatible the combined iterations are.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VegasEstimators<T> {
    mean_var: MeanVar<T>,
    chi_sq: T,
    calls: usize,
    non_finite_calls: usize,
    non_zero_calls: usize,
}

impl<T: Float> Default for VegasEstimators<T> {
    fn default() -> Self {
        Self {
            mean_var: MeanVar::new(T::zero(), T::zero()),
            chi_sq: T::zero(),
            calls: 0,
            non_finite_calls: 0,
            non_zero_calls: 0,
        }
    }
}

impl<T: Float> BasicEstimators<T> for VegasEstimators<T> {
    fn mean(&self) -> T {
        self.mean_var.mean()
    }

    fn var(&self) -> T {
        self.mean_var.var()
    }
}

impl<T: Float> Estimators<T> for VegasEstimators<T> {
    fn calls(&self) -> usize {
        self.calls
    }

    fn non_finite_calls(&self) -> usize {
        self.non_finite_calls
    }

    fn non_zero_calls(&self) -> usize {
        self.non_zero_calls
    }
}

impl<T: Float> IterativeEstimators<T> for VegasEstimators<T> {
    fn chi_sq(&self) -> T {
        self.chi_sq
    }
}

/// Per-dimension importance grid: `N_BINS + 1` bin boundaries for each
/// dimension, stored flattened, with the outermost boundaries pinned to zero
/// and one.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct AdaptiveGrid<T> {
    dim: usize,
    xi: Vec<T>,
}

impl<T> AdaptiveGrid<T>
where
    T: AddAssign + Float + FromPrimitive,
{
    fn new(dim: usize) -> Self {
        let bins = T::from_usize(N_BINS).unwrap();
        let xi = (0..dim)
            .flat_map(|_| (0..=N_BINS).map(|i| T::from_usize(i).unwrap() / bins))
            .collect();

        Self { dim, xi }
    }

    /// Draw a point distributed according to the current grid density and
    /// return the Jacobian of the mapping. The index of the bin hit in each
    /// dimension is written to `bins_hit` for the refinement bookkeeping.
    fn sample<R>(&self, rng: &mut R, x: &mut [T], bins_hit: &mut [usize]) -> T
    where
        R: Rng,
        Standard: Distribution<T>,
    {
        let bins = T::from_usize(N_BINS).unwrap();
        let mut jacobian = T::one();

        for k in 0..self.dim {
            let z = rng.gen::<T>() * bins;
            let bin = z.to_usize().unwrap().min(N_BINS - 1);
            let frac = z - T::from_usize(bin).unwrap();

            let lower = self.xi[k * (N_BINS + 1) + bin];
            let width = self.xi[k * (N_BINS + 1) + bin + 1] - lower;

            x[k] = lower + frac * width;
            jacobian = jacobian * width * bins;
            bins_hit[k] = bin;
        }

        jacobian
    }

    /// Redistribute the bin boundaries so that each bin receives an equal
    /// share of the (smoothed, damped) importance accumulated in `d2`, the
    /// per-bin sums of the squared weighted integrand values.
    fn refine(&mut self, d2: &[T]) {
        let alpha = T::from_f64(ALPHA).unwrap();
        let mut smoothed = vec![T::zero(); N_BINS];
        let mut weight = vec![T::zero(); N_BINS];
        let mut new_xi = vec![T::zero(); N_BINS + 1];

        for k in 0..self.dim {
            let d = &d2[k * N_BINS..(k + 1) * N_BINS];

            // smooth the importance over neighbouring bins
            let mut oldg = d[0];
            let mut newg = d[1];
            smoothed[0] = (oldg + newg) / T::from_usize(2).unwrap();
            let mut total = smoothed[0];
            for i in 1..N_BINS - 1 {
                let rc = oldg + newg;
                oldg = newg;
                newg = d[i + 1];
                smoothed[i] = (rc + newg) / T::from_usize(3).unwrap();
                total += smoothed[i];
            }
            smoothed[N_BINS - 1] = (newg + oldg) / T::from_usize(2).unwrap();
            total += smoothed[N_BINS - 1];

            // damped per-bin weights
            let mut total_weight = T::zero();
            for i in 0..N_BINS {
                weight[i] = T::zero();
                if smoothed[i] > T::zero() {
                    let ratio = total / smoothed[i];
                    weight[i] = ((ratio - T::one()) / (ratio * ratio.ln())).powf(alpha);
                }
                total_weight += weight[i];
            }

            if !(total_weight > T::zero()) || !total_weight.is_finite() {
                // no usable information in this dimension, keep the grid
                continue;
            }

            // place the new boundaries so that each bin holds an equal weight
            let xi = &mut self.xi[k * (N_BINS + 1)..(k + 1) * (N_BINS + 1)];
            new_xi.copy_from_slice(xi);
            let per_bin = total_weight / T::from_usize(N_BINS).unwrap();
            let mut running = T::zero();
            let mut xnew = T::zero();
            let mut index = 1;

            for i in 0..N_BINS {
                running += weight[i];
                let xold = xnew;
                xnew = xi[i + 1];
                while running > per_bin && index < N_BINS {
                    running = running - per_bin;
                    new_xi[index] = xnew - (xnew - xold) * running / weight[i];
                    index += 1;
                }
            }

            xi[1..N_BINS].copy_from_slice(&new_xi[1..N_BINS]);
            xi[N_BINS] = T::one();
        }
    }
}

/// Result of a single adaptive pass, before it is folded into the running
/// average.
struct Pass<T> {
    mean: T,
    var: T,
    calls: usize,
    non_finite_calls: usize,
    non_zero_calls: usize,
    d2: Vec<T>,
}

/// The VEGAS integrator.
///
/// The integrator is stateful: its importance grid persists between calls to
/// [`Vegas::integrate`] and the warm-up pass runs exactly once per instance.
pub struct Vegas<T> {
    grid: AdaptiveGrid<T>,
    calls_per_iteration: usize,
    iterations: usize,
    warmed_up: bool,
    // running inverse-variance-weighted combination of the iterations
    sum_wgt: T,
    sum_wgt_mean: T,
    sum_wgt_mean_sq: T,
    folded: usize,
    calls: usize,
    non_finite_calls: usize,
    non_zero_calls: usize,
}

impl<T> Vegas<T>
where
    T: AddAssign + Float + FromPrimitive,
{
    /// Construct an integrator for a `dim`-dimensional integrand.
    ///
    /// Each refinement iteration spends a fifth of `calls_per_iteration`
    /// integrand evaluations; `iterations` refinement passes are performed
    /// per call to [`Vegas::integrate`].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::DimensionTooLarge`] before any integrand
    /// evaluation if `dim` exceeds [`MAX_DIMENSIONS`].
    pub fn new(dim: usize, calls_per_iteration: usize, iterations: usize) -> Result<Self, Error> {
        if dim > MAX_DIMENSIONS {
            return Err(Error::DimensionTooLarge {
                dim,
                max: MAX_DIMENSIONS,
            });
        }

        Ok(Self {
            grid: AdaptiveGrid::new(dim),
            calls_per_iteration,
            iterations,
            warmed_up: false,
            sum_wgt: T::zero(),
            sum_wgt_mean: T::zero(),
            sum_wgt_mean_sq: T::zero(),
            folded: 0,
            calls: 0,
            non_finite_calls: 0,
            non_zero_calls: 0,
        })
    }

    /// Perform one adaptive pass of `calls` integrand evaluations.
    fn pass<R, I>(&self, integrand: &I, rng: &mut R, calls: usize) -> Pass<T>
    where
        I: Integrand<T>,
        R: Rng,
        Standard: Distribution<T>,
    {
        let mut x = vec![T::zero(); self.grid.dim];
        let mut bins_hit = vec![0; self.grid.dim];
        let mut d2 = vec![T::zero(); self.grid.dim * N_BINS];

        let mut sum = T::zero();
        let mut sumsq = T::zero();
        let mut non_finite_calls = 0;
        let mut non_zero_calls = 0;

        for _ in 0..calls {
            let jacobian = self.grid.sample(rng, &mut x, &mut bins_hit);
            let value = integrand.call(&x);

            if value != T::zero() {
                non_zero_calls += 1;

                if value.is_finite() {
                    let weighted = value * jacobian;
                    sum += weighted;
                    sumsq += weighted * weighted;

                    for (k, &bin) in bins_hit.iter().enumerate() {
                        d2[k * N_BINS + bin] += weighted * weighted;
                    }
                } else {
                    non_finite_calls += 1;
                }
            }
        }

        let n = T::from_usize(calls).unwrap();
        let mean = sum / n;
        let var = (sumsq - sum * sum / n) / n / (n - T::one());

        Pass {
            mean,
            var,
            calls,
            non_finite_calls,
            non_zero_calls,
            d2,
        }
    }

    /// Fold the result of one pass into the running combination and return
    /// the updated cumulative estimators.
    fn fold(&mut self, pass: &Pass<T>) -> VegasEstimators<T> {
        let wgt = if pass.var.is_finite() && pass.var > T::zero() {
            pass.var.recip()
        } else {
            // a degenerate pass still contributes, with a weight capped at
            // the numeric resolution
            warn!("iteration produced a degenerate variance, using it best-effort");
            T::epsilon().recip()
        };

        self.sum_wgt += wgt;
        self.sum_wgt_mean += wgt * pass.mean;
        self.sum_wgt_mean_sq += wgt * pass.mean * pass.mean;
        self.folded += 1;
        self.calls += pass.calls;
        self.non_finite_calls += pass.non_finite_calls;
        self.non_zero_calls += pass.non_zero_calls;

        let mean = self.sum_wgt_mean / self.sum_wgt;
        let var = self.sum_wgt.recip();
        let chi_sq = if self.folded > 1 {
            let chi = (self.sum_wgt_mean_sq - self.sum_wgt_mean * self.sum_wgt_mean / self.sum_wgt)
                / T::from_usize(self.folded - 1).unwrap();
            chi.max(T::zero())
        } else {
            T::zero()
        };

        VegasEstimators {
            mean_var: MeanVar::new(mean, var),
            chi_sq,
            calls: self.calls,
            non_finite_calls: self.non_finite_calls,
            non_zero_calls: self.non_zero_calls,
        }
    }

    /// Integrate the `integrand`, producing one checkpoint per refinement
    /// iteration; the last checkpoint's estimators are the result.
    ///
    /// The first call starts with a warm-up pass of 10 000 evaluations whose
    /// only purpose is to let the importance grid settle; its numbers are
    /// logged and discarded.
    pub fn integrate<R, I>(
        &mut self,
        integrand: &I,
        rng: &mut R,
        callback: &impl Callback<T, R, VegasEstimators<T>>,
    ) -> Vec<Checkpoint<R, VegasEstimators<T>>>
    where
        I: Integrand<T>,
        R: Clone + Rng,
        Standard: Distribution<T>,
    {
        debug_assert_eq!(integrand.dim(), self.grid.dim);

        if !self.warmed_up {
            let pass = self.pass(integrand, rng, WARMUP_CALLS);
            self.grid.refine(&pass.d2);
            self.warmed_up = true;
            info!(
                "warm-up finished: average = {:e}, sigma = {:e}",
                pass.mean.to_f64().unwrap_or(f64::NAN),
                pass.var.sqrt().to_f64().unwrap_or(f64::NAN),
            );
        }

        let calls = (self.calls_per_iteration / 5).max(2);
        let mut checkpoints = Vec::with_capacity(self.iterations);

        for iteration in 0..self.iterations {
            let rng_before = rng.clone();
            let pass = self.pass(integrand, rng, calls);
            let estimators = self.fold(&pass);
            self.grid.refine(&pass.d2);

            info!(
                "iteration {:2}: average = {:e}, sigma = {:e}, chi2 = {:e}",
                iteration + 1,
                estimators.mean().to_f64().unwrap_or(f64::NAN),
                estimators.std().to_f64().unwrap_or(f64::NAN),
                estimators.chi_sq().to_f64().unwrap_or(f64::NAN),
            );

            checkpoints.push(Checkpoint::new(rng_before, rng.clone(), estimators));
            callback.print(&checkpoints);
        }

        checkpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::SinkCallback;
    use rand_pcg::Pcg64;

    struct Product {
        dim: usize,
    }

    impl Integrand<f64> for Product {
        fn call(&self, x: &[f64]) -> f64 {
            x.iter().product()
        }

        fn dim(&self) -> usize {
            self.dim
        }
    }

    fn rng() -> Pcg64 {
        Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
    }

    #[test]
    fn test_dimension_cap() {
        match Vegas::<f64>::new(MAX_DIMENSIONS + 1, 1000, 2) {
            Err(Error::DimensionTooLarge { dim, max }) => {
                assert_eq!(dim, MAX_DIMENSIONS + 1);
                assert_eq!(max, MAX_DIMENSIONS);
            }
            _ => panic!("expected a dimension error"),
        }
    }

    #[test]
    fn test_uniform_grid_sampling_covers_the_cube() {
        let grid = AdaptiveGrid::<f64>::new(2);
        let mut rng = rng();
        let mut x = [0.0; 2];
        let mut bins_hit = [0; 2];

        for _ in 0..1000 {
            let jacobian = grid.sample(&mut rng, &mut x, &mut bins_hit);
            // on the uniform grid the mapping is the identity
            assert_approx_eq::assert_approx_eq!(jacobian, 1.0, 1e-12);
            for v in &x {
                assert!(*v >= 0.0 && *v < 1.0);
            }
        }
    }

    #[test]
    fn test_refinement_keeps_boundaries_ordered() {
        let mut grid = AdaptiveGrid::<f64>::new(1);
        let mut rng = rng();
        let mut x = [0.0; 1];
        let mut bins_hit = [0; 1];
        let mut d2 = vec![0.0; N_BINS];

        // lopsided importance, concentrated near one
        for _ in 0..10_000 {
            grid.sample(&mut rng, &mut x, &mut bins_hit);
            let f = x[0] * x[0];
            d2[bins_hit[0]] += f * f;
        }
        grid.refine(&d2);

        assert_eq!(grid.xi[0], 0.0);
        assert_eq!(grid.xi[N_BINS], 1.0);
        for i in 0..N_BINS {
            assert!(grid.xi[i] < grid.xi[i + 1]);
        }
        // bins shift towards the peak at one
        assert!(grid.xi[N_BINS / 2] > 0.5);
    }

    #[test]
    fn test_counters() {
        let mut vegas = Vegas::new(1, 500, 3).unwrap();
        let mut rng = rng();
        let chkpts = vegas.integrate(&Product { dim: 1 }, &mut rng, &SinkCallback {});

        assert_eq!(chkpts.len(), 3);
        // cumulative calls: three iterations of 100 each
        assert_eq!(chkpts[2].estimators().calls(), 300);
        assert_eq!(chkpts[2].estimators().non_finite_calls(), 0);
        assert_eq!(chkpts[2].estimators().non_zero_calls(), 300);
    }

    #[test]
    fn test_checkpoint_serialization_round_trip() {
        let mut vegas = Vegas::new(2, 1000, 2).unwrap();
        let mut rng = rng();
        let chkpts = vegas.integrate(&Product { dim: 2 }, &mut rng, &SinkCallback {});

        let json = serde_json::to_string(&chkpts).unwrap();
        let back: Vec<Checkpoint<Pcg64, VegasEstimators<f64>>> =
            serde_json::from_str(&json).unwrap();

        assert_eq!(back.len(), chkpts.len());
        assert_eq!(
            back[1].estimators().mean(),
            chkpts[1].estimators().mean()
        );
        assert_eq!(
            serde_json::to_string(back[1].rng_after()).unwrap(),
            serde_json::to_string(chkpts[1].rng_after()).unwrap()
        );
    }
}

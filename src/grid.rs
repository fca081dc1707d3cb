//! The stratification grid backing the unweighted event generators.

use crate::core::{Error, Integrand, Phase, MAX_DIMENSIONS};
use log::{debug, trace};
use num_traits::{Float, FromPrimitive};
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Diagnostic summary of a grid preparation sweep.
///
/// None of these values influence the correctness of the generated events;
/// they indicate how well the grid resolves the integrand and therefore how
/// efficient rejection sampling against it will be.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PreparationReport<T> {
    average: T,
    std: T,
    max: T,
    average_inefficiency: T,
    overall_inefficiency: T,
}

impl<T: Copy> PreparationReport<T> {
    /// Returns the integrand value averaged over all preparation samples.
    pub fn average(&self) -> T {
        self.average
    }

    /// Returns the standard deviation of the integrand over all preparation samples.
    pub fn std(&self) -> T {
        self.std
    }

    /// Returns the largest integrand value observed during preparation.
    pub fn max(&self) -> T {
        self.max
    }

    /// Returns the mean cell maximum divided by the mean integrand value.
    ///
    /// A value close to one means the envelope is tight almost everywhere.
    pub fn average_inefficiency(&self) -> T {
        self.average_inefficiency
    }

    /// Returns the global maximum divided by the mean integrand value.
    pub fn overall_inefficiency(&self) -> T {
        self.overall_inefficiency
    }
}

/// A fixed partition of the `dim`-dimensional unit hypercube into `bins^dim`
/// axis-aligned cells, each holding the largest integrand value observed in
/// it so far. The per-cell maxima form the acceptance envelope of the
/// unweighted event generator.
///
/// Cells are addressed by a linear index which decodes into one grid digit
/// per dimension in mixed radix `bins`, least significant digit first.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StratificationGrid<T> {
    dim: usize,
    bins: usize,
    cells: usize,
    local_max: Vec<T>,
    visits: Vec<u32>,
    global_max: T,
    report: Option<PreparationReport<T>>,
}

impl<T> StratificationGrid<T>
where
    T: AddAssign + Float + FromPrimitive,
{
    /// Construct an unprepared grid with `bins` subdivisions per dimension.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::DimensionTooLarge`] if `dim` exceeds
    /// [`MAX_DIMENSIONS`] and with [`Error::GridOverflow`] if `bins^dim` is
    /// not representable as a cell index. Both checks run before any memory
    /// is allocated or any integrand call is made.
    pub fn new(dim: usize, bins: usize) -> Result<Self, Error> {
        if dim > MAX_DIMENSIONS {
            return Err(Error::DimensionTooLarge {
                dim,
                max: MAX_DIMENSIONS,
            });
        }

        let cells = bins
            .checked_pow(dim as u32)
            .ok_or(Error::GridOverflow { bins, dim })?;

        Ok(Self {
            dim,
            bins,
            cells,
            // allocated by the first call to `prepare`
            local_max: Vec::new(),
            visits: Vec::new(),
            global_max: T::zero(),
            report: None,
        })
    }

    /// Returns the number of dimensions of the grid.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the number of subdivisions per dimension.
    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Returns the total number of cells, `bins^dim`.
    pub fn cells(&self) -> usize {
        self.cells
    }

    /// Returns the largest integrand value observed in any cell.
    pub fn global_max(&self) -> T {
        self.global_max
    }

    /// Returns the largest integrand value observed in the given cell.
    pub fn local_max(&self, cell: usize) -> T {
        self.local_max[cell]
    }

    /// Returns how often the given cell has been chosen during sampling.
    pub fn visits(&self, cell: usize) -> u32 {
        self.visits[cell]
    }

    /// Returns whether the preparation sweep has run.
    pub fn prepared(&self) -> bool {
        self.report.is_some()
    }

    /// Decode the linear cell index into one grid digit per dimension.
    pub(crate) fn decode(&self, cell: usize, digits: &mut [usize]) {
        debug_assert_eq!(digits.len(), self.dim);
        let mut rest = cell;
        for digit in digits.iter_mut() {
            *digit = rest % self.bins;
            rest /= self.bins;
        }
    }

    /// Draw a point uniformly distributed within the given cell.
    pub(crate) fn sample_point<R>(&self, cell: usize, rng: &mut R, x: &mut [T])
    where
        R: Rng,
        Standard: Distribution<T>,
    {
        let bins = T::from_usize(self.bins).unwrap();
        let mut rest = cell;
        for value in x.iter_mut() {
            let digit = rest % self.bins;
            rest /= self.bins;
            *value = (rng.gen::<T>() + T::from_usize(digit).unwrap()) / bins;
        }
    }

    pub(crate) fn bump_visits(&mut self, cell: usize) {
        self.visits[cell] += 1;
    }

    /// Raise the envelope of the given cell, folding the new value into the
    /// global maximum so that `global_max >= local_max[cell]` holds for every
    /// cell after every update.
    pub(crate) fn raise_local_max(&mut self, cell: usize, weight: T) {
        self.local_max[cell] = weight;
        if weight > self.global_max {
            self.global_max = weight;
        }
    }

    /// Populate the per-cell maxima with `points_per_cell` uniform samples
    /// confined to each cell.
    ///
    /// The sweep runs exactly once per grid; repeated calls return the cached
    /// report without touching any cell. Preparation is the only place where
    /// the cell arrays are allocated.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NonFiniteWeight`] as soon as the integrand returns
    /// a NaN or infinite value; in that case no state is cached and a later
    /// call will re-run the sweep.
    pub fn prepare<R, I>(
        &mut self,
        integrand: &I,
        rng: &mut R,
        points_per_cell: usize,
    ) -> Result<PreparationReport<T>, Error>
    where
        I: Integrand<T>,
        R: Rng,
        Standard: Distribution<T>,
    {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }

        debug!(
            "preparing the grid for the generation of unweighted events: {} cells, {} points per cell",
            self.cells, points_per_cell
        );

        self.local_max = vec![T::zero(); self.cells];
        self.visits = vec![0; self.cells];
        self.global_max = T::zero();

        let inv_points = T::one() / T::from_usize(points_per_cell).unwrap();
        let mut x = vec![T::zero(); self.dim];
        let mut digits = vec![0; self.dim];

        // sums of the per-cell average, average square and variance
        let mut sum = T::zero();
        let mut sum2 = T::zero();
        let mut sum2p = T::zero();

        for cell in 0..self.cells {
            let mut fsum = T::zero();
            let mut fsum2 = T::zero();

            for _ in 0..points_per_cell {
                self.sample_point(cell, rng, &mut x);
                let z = integrand.call(&x);

                if !z.is_finite() {
                    self.local_max.clear();
                    self.visits.clear();
                    self.global_max = T::zero();
                    return Err(Error::NonFiniteWeight {
                        phase: Phase::GridPreparation,
                    });
                }

                self.local_max[cell] = self.local_max[cell].max(z);
                fsum += z;
                fsum2 += z * z;
            }

            let av = fsum * inv_points;
            let av2 = fsum2 * inv_points;
            let sig2 = av2 - av * av;
            sum += av;
            sum2 += av2;
            sum2p += sig2;

            if self.local_max[cell] > self.global_max {
                self.global_max = self.local_max[cell];
            }

            if log::log_enabled!(log::Level::Trace) {
                self.decode(cell, &mut digits);
                let eff = if self.local_max[cell] > T::zero() {
                    (self.local_max[cell] / av).to_f64().unwrap_or(f64::NAN)
                } else {
                    1.0e4
                };
                trace!(
                    "cell {} {:?}: average = {:e}, sigma = {:e}, local max = {:e}, inefficiency = {:e}",
                    cell,
                    digits,
                    av.to_f64().unwrap_or(f64::NAN),
                    sig2.sqrt().to_f64().unwrap_or(f64::NAN),
                    self.local_max[cell].to_f64().unwrap_or(f64::NAN),
                    eff
                );
            }
        }

        let cells = T::from_usize(self.cells).unwrap();
        let average = sum / cells;
        let average2 = sum2 / cells;
        // rounding can push the variance of a near-constant integrand
        // slightly below zero
        let std = (average2 - average * average).max(T::zero()).sqrt();

        let average_inefficiency = self
            .local_max
            .iter()
            .fold(T::zero(), |acc, &m| acc + m / (cells * average));
        let overall_inefficiency = self.global_max / average;

        let report = PreparationReport {
            average,
            std,
            max: self.global_max,
            average_inefficiency,
            overall_inefficiency,
        };

        debug!(
            "grid prepared: average = {:e}, sigma = {:e}, average cell sigma = {:e}, global max = {:e}, \
             average inefficiency = {:e}, overall inefficiency = {:e}",
            average.to_f64().unwrap_or(f64::NAN),
            std.to_f64().unwrap_or(f64::NAN),
            (sum2p / cells).max(T::zero()).sqrt().to_f64().unwrap_or(f64::NAN),
            self.global_max.to_f64().unwrap_or(f64::NAN),
            average_inefficiency.to_f64().unwrap_or(f64::NAN),
            overall_inefficiency.to_f64().unwrap_or(f64::NAN),
        );

        self.report = Some(report.clone());

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
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

    struct NanIntegrand;

    impl Integrand<f64> for NanIntegrand {
        fn call(&self, x: &[f64]) -> f64 {
            if x[0] > 0.5 {
                f64::NAN
            } else {
                1.0
            }
        }

        fn dim(&self) -> usize {
            1
        }
    }

    fn rng() -> Pcg64 {
        Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
    }

    #[test]
    fn test_dimension_too_large() {
        match StratificationGrid::<f64>::new(16, 3) {
            Err(Error::DimensionTooLarge { dim: 16, max }) => {
                assert_eq!(max, MAX_DIMENSIONS);
            }
            _ => panic!("expected a dimension error"),
        }
    }

    #[test]
    fn test_cell_index_overflow() {
        match StratificationGrid::<f64>::new(11, 100) {
            Err(Error::GridOverflow { bins: 100, dim: 11 }) => {}
            _ => panic!("expected an overflow error"),
        }
    }

    #[test]
    fn test_mixed_radix_decoding() {
        let grid = StratificationGrid::<f64>::new(3, 4).unwrap();
        assert_eq!(grid.cells(), 64);

        let mut digits = [0; 3];
        grid.decode(0, &mut digits);
        assert_eq!(digits, [0, 0, 0]);
        grid.decode(5, &mut digits);
        assert_eq!(digits, [1, 1, 0]);
        grid.decode(63, &mut digits);
        assert_eq!(digits, [3, 3, 3]);
    }

    #[test]
    fn test_points_stay_inside_their_cell() {
        let grid = StratificationGrid::<f64>::new(2, 5).unwrap();
        let mut rng = rng();
        let mut x = [0.0; 2];
        let mut digits = [0; 2];

        for cell in 0..grid.cells() {
            grid.decode(cell, &mut digits);
            for _ in 0..10 {
                grid.sample_point(cell, &mut rng, &mut x);
                for (value, digit) in x.iter().zip(digits.iter()) {
                    assert!(*value >= *digit as f64 / 5.0);
                    assert!(*value < (*digit as f64 + 1.0) / 5.0);
                }
            }
        }
    }

    #[test]
    fn test_global_max_is_the_largest_local_max() {
        let mut grid = StratificationGrid::new(2, 3).unwrap();
        let mut rng = rng();
        grid.prepare(&Product { dim: 2 }, &mut rng, 50).unwrap();

        let largest = (0..grid.cells())
            .map(|cell| grid.local_max(cell))
            .fold(0.0, f64::max);
        assert_eq!(grid.global_max(), largest);
        assert!(grid.global_max() > 0.0);
    }

    #[test]
    fn test_preparation_is_idempotent() {
        let mut grid = StratificationGrid::new(2, 3).unwrap();
        let mut rng = rng();

        let first = grid.prepare(&Product { dim: 2 }, &mut rng, 20).unwrap();
        let local_max: Vec<_> = (0..grid.cells()).map(|c| grid.local_max(c)).collect();
        let global_max = grid.global_max();

        // a second sweep must not move anything, not even the rng
        let rng_before = rng.clone();
        let second = grid.prepare(&Product { dim: 2 }, &mut rng, 20).unwrap();

        assert_eq!(
            serde_json::to_string(&rng_before).unwrap(),
            serde_json::to_string(&rng).unwrap()
        );
        assert_eq!(first.average(), second.average());
        assert_eq!(global_max, grid.global_max());
        for (cell, max) in local_max.iter().enumerate() {
            assert_eq!(*max, grid.local_max(cell));
            assert_eq!(grid.visits(cell), 0);
        }
    }

    #[test]
    fn test_constant_integrand_report() {
        struct One;

        impl Integrand<f64> for One {
            fn call(&self, _: &[f64]) -> f64 {
                1.0
            }

            fn dim(&self) -> usize {
                1
            }
        }

        let mut grid = StratificationGrid::new(1, 10).unwrap();
        let report = grid.prepare(&One, &mut rng(), 100).unwrap();

        assert_approx_eq!(report.average(), 1.0, 1e-12);
        assert_approx_eq!(report.max(), 1.0, 1e-12);
        assert_approx_eq!(report.average_inefficiency(), 1.0, 1e-12);
        assert_approx_eq!(report.overall_inefficiency(), 1.0, 1e-12);
    }

    #[test]
    fn test_non_finite_weight_is_fatal() {
        let mut grid = StratificationGrid::new(1, 4).unwrap();
        match grid.prepare(&NanIntegrand, &mut rng(), 10) {
            Err(Error::NonFiniteWeight { phase }) => {
                assert_eq!(phase, Phase::GridPreparation);
                assert!(!grid.prepared());
            }
            _ => panic!("expected a non-finite weight error"),
        }
    }
}

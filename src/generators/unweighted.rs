//! Unweighted event generator
//!
//! Draws events distributed proportionally to the integrand via rejection
//! sampling against the acceptance envelope held by a [`StratificationGrid`].
//! The envelope starts from the maxima observed during the preparation sweep
//! and is raised whenever sampling finds a larger weight (a *breach*). Every
//! breach leaves the breached cell under-represented in the events accepted
//! so far; the generator repays this through *correction cycles*, make-up
//! draws confined to the breached cell. The correction protocol spans
//! multiple calls and is carried in an explicit [`GeneratorState`] value, so
//! it can be inspected and tested independently of call ordering.
use crate::callbacks::Recorder;
use crate::core::{Error, Integrand, Phase};
use crate::grid::{PreparationReport, StratificationGrid};

use log::{debug, info, trace};
use num_traits::{Float, FromPrimitive};
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use std::ops::AddAssign;

/// How many accepted events between two progress lines.
const PRINT_EVERY: usize = 1_000;

/// Bookkeeping for a cell whose envelope was raised mid-run.
///
/// `debt` counts the make-up draws owed to the cell, with the fractional part
/// interpreted as a probability. `secondary_debt` and `secondary_max` track
/// breaches discovered *during* correction; they are folded back into a fresh
/// debt once the current one is consumed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingCorrection<T> {
    cell: usize,
    debt: T,
    secondary_debt: T,
    secondary_max: T,
    previous_max: T,
    max_delta: T,
}

impl<T: Copy> PendingCorrection<T> {
    /// The cell owed make-up draws.
    pub fn cell(&self) -> usize {
        self.cell
    }

    /// The fractional number of make-up draws still owed.
    pub fn debt(&self) -> T {
        self.debt
    }
}

/// The sampling state of an [`UnweightedGenerator`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeneratorState<T> {
    /// Normal rejection sampling.
    Ready,
    /// A breach left the generator owing make-up draws to one cell.
    Correcting(PendingCorrection<T>),
}

/// Generator of unweighted events.
///
/// A generator instance is strictly sequential: the correction protocol
/// depends on the order of calls, so a single instance must never be shared
/// between threads. Horizontal scaling is achieved by running independent
/// instances with independently seeded random number generators and merging
/// their event streams.
pub struct UnweightedGenerator<T, R, I> {
    integrand: I,
    rng: R,
    grid: StratificationGrid<T>,
    points_per_cell: usize,
    state: GeneratorState<T>,
    events_generated: usize,
}

impl<T, R, I> UnweightedGenerator<T, R, I>
where
    T: AddAssign + Float + FromPrimitive,
    R: Rng,
    I: Integrand<T>,
    Standard: Distribution<T>,
{
    /// Construct a generator over a grid of `bins` subdivisions per
    /// dimension, prepared with `points_per_cell` samples per cell.
    ///
    /// # Errors
    ///
    /// Fails like [`StratificationGrid::new`] if the integrand's dimension is
    /// too large for the grid addressing, before any integrand evaluation.
    pub fn new(integrand: I, rng: R, bins: usize, points_per_cell: usize) -> Result<Self, Error> {
        let grid = StratificationGrid::new(integrand.dim(), bins)?;

        Ok(Self {
            integrand,
            rng,
            grid,
            points_per_cell,
            state: GeneratorState::Ready,
            events_generated: 0,
        })
    }

    /// Access the stratification grid.
    pub fn grid(&self) -> &StratificationGrid<T> {
        &self.grid
    }

    /// Access the current sampling state.
    pub fn state(&self) -> &GeneratorState<T> {
        &self.state
    }

    /// Returns the number of events accepted over the generator's lifetime.
    pub fn events_generated(&self) -> usize {
        self.events_generated
    }

    /// Run the preparation sweep now instead of on the first generation call.
    ///
    /// # Errors
    ///
    /// Fails like [`StratificationGrid::prepare`].
    pub fn prepare(&mut self) -> Result<PreparationReport<T>, Error> {
        self.grid
            .prepare(&self.integrand, &mut self.rng, self.points_per_cell)
    }

    /// Generate events until `n` of them have been accepted and recorded.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NonFiniteWeight`] if the integrand misbehaves; in
    /// that case the events recorded so far remain valid.
    pub fn generate(&mut self, n: usize, recorder: &mut impl Recorder<T>) -> Result<(), Error> {
        info!("{} events will be generated", n);

        let mut accepted = 0;
        while accepted < n {
            if self.generate_one(recorder)? {
                accepted += 1;
            }
        }

        info!("{} events generated", accepted);
        Ok(())
    }

    /// Run one sampling round, either a normal cycle or one correction-cycle
    /// invocation, and return whether an event was accepted and recorded.
    ///
    /// The first call triggers the grid preparation sweep.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NonFiniteWeight`] if the integrand returns a NaN
    /// or infinite value.
    pub fn generate_one(&mut self, recorder: &mut impl Recorder<T>) -> Result<bool, Error> {
        if !self.grid.prepared() {
            self.prepare()?;
        }

        match self.state {
            GeneratorState::Ready => self.normal_cycle(recorder),
            GeneratorState::Correcting(pending) => self.correction_cycle(pending, recorder),
        }
    }

    /// The normal generation cycle: envelope-select a cell, draw a point in
    /// it and rejection-test the integrand against the envelope draw.
    fn normal_cycle(&mut self, recorder: &mut impl Recorder<T>) -> Result<bool, Error> {
        let cells = self.grid.cells();
        let mut x = vec![T::zero(); self.grid.dim()];

        loop {
            // select a cell, rejecting against the per-cell envelope so that
            // cells with a small maximum are revisited rarely
            let (cell, y) = loop {
                let cell = (self.rng.gen::<T>() * T::from_usize(cells).unwrap())
                    .to_usize()
                    .unwrap()
                    .min(cells - 1);
                let y = self.rng.gen::<T>() * self.grid.global_max();
                self.grid.bump_visits(cell);

                if y <= self.grid.local_max(cell) {
                    break (cell, y);
                }
            };

            self.grid.sample_point(cell, &mut self.rng, &mut x);
            let weight = self.integrand.call(&x);

            if !weight.is_finite() {
                return Err(Error::NonFiniteWeight {
                    phase: Phase::Generation,
                });
            }

            // rejection of the true density against the envelope draw
            if y > weight {
                continue;
            }

            if weight > self.grid.local_max(cell) {
                // the envelope was too tight; raise it and owe the cell a
                // correction starting with the next round. The breaching
                // event itself is kept.
                let pending = self.raise_envelope(cell, weight, T::one());
                trace!(
                    "envelope breach in cell {}: debt = {:e}",
                    cell,
                    pending.debt.to_f64().unwrap_or(f64::NAN)
                );
                self.state = GeneratorState::Correcting(pending);
            }

            if weight > T::zero() {
                self.store(&x, weight, recorder);
                return Ok(true);
            }

            return Ok(false);
        }
    }

    /// One invocation of the correction cycle for `pending`.
    ///
    /// The debt shrinks on every invocation, so a generator in the correcting
    /// state always returns to [`GeneratorState::Ready`] after finitely many
    /// rounds.
    fn correction_cycle(
        &mut self,
        mut pending: PendingCorrection<T>,
        recorder: &mut impl Recorder<T>,
    ) -> Result<bool, Error> {
        trace!(
            "correction cycle for cell {}: debt = {:e}, secondary debt = {:e}",
            pending.cell,
            pending.debt.to_f64().unwrap_or(f64::NAN),
            pending.secondary_debt.to_f64().unwrap_or(f64::NAN),
        );

        // one whole make-up draw is owed regardless of the probabilistic
        // round below
        if pending.debt >= T::one() {
            pending.debt = pending.debt - T::one();
        }

        if self.rng.gen::<T>() < pending.debt {
            pending.debt = -T::one();

            let mut x = vec![T::zero(); self.grid.dim()];
            self.grid.sample_point(pending.cell, &mut self.rng, &mut x);
            let weight = self.integrand.call(&x);

            if !weight.is_finite() {
                return Err(Error::NonFiniteWeight {
                    phase: Phase::Generation,
                });
            }

            // a second breach while correcting compounds the debt
            if weight > self.grid.local_max(pending.cell) {
                pending.secondary_max = pending.secondary_max.max(weight);
                pending.secondary_debt = pending.secondary_debt - T::one();
                pending.debt = pending.debt + T::one();
            }

            if weight >= pending.previous_max + pending.max_delta * self.rng.gen::<T>() {
                // make-up draw accepted
                self.state = GeneratorState::Correcting(pending);
                self.store(&x, weight, recorder);
                return Ok(true);
            }

            // this make-up attempt failed
            self.state = GeneratorState::Correcting(pending);
            return Ok(false);
        }

        if pending.secondary_max > self.grid.local_max(pending.cell) {
            // resolve the compounded debt: the secondary maximum becomes the
            // cell's envelope and the secondary debt seeds the new one
            let next = self.raise_envelope(pending.cell, pending.secondary_max, pending.secondary_debt);
            self.state = GeneratorState::Correcting(next);
            return Ok(false);
        }

        // debt exhausted
        self.state = GeneratorState::Ready;
        Ok(false)
    }

    /// Raise the envelope of `cell` to `weight` and compute the correction
    /// debt this leaves behind. `carried` is subtracted from the debt: one
    /// for a fresh breach, the (negative) secondary debt when resolving a
    /// compounded correction.
    fn raise_envelope(&mut self, cell: usize, weight: T, carried: T) -> PendingCorrection<T> {
        let previous_max = self.grid.local_max(cell);
        let max_delta = weight - previous_max;
        let visits = T::from_u32(self.grid.visits(cell)).unwrap() - T::one();
        let raises_global = weight > self.grid.global_max();

        self.grid.raise_local_max(cell, weight);
        let global_max = self.grid.global_max();

        let debt = if raises_global {
            visits * max_delta / global_max * weight / global_max - carried
        } else {
            visits * max_delta / global_max - carried
        };

        PendingCorrection {
            cell,
            debt,
            secondary_debt: T::zero(),
            secondary_max: T::zero(),
            previous_max,
            max_delta,
        }
    }

    /// Hand an accepted event to the recorder.
    fn store(&mut self, x: &[T], weight: T, recorder: &mut impl Recorder<T>) {
        recorder.record(x, weight);
        self.events_generated += 1;

        if self.events_generated % PRINT_EVERY == 0 {
            debug!("generated events: {}", self.events_generated);
        }
    }
}

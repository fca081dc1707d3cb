//! Implementation of different callback functions and event recorders.
use crate::core::estimators::{Estimators, IterativeEstimators};
use crate::core::Checkpoint;
use num_traits::Float;
use std::fmt::Display;

/// Trait for implementing callbacks for iterative MC algorithms
pub trait Callback<T, R, E>
where
    T: Copy,
{
    /// This method is called after each successfully finished iteration and may print information
    /// about it.
    fn print(&self, chkpts: &[Checkpoint<R, E>]);
}

/// A callback function that does nothing
pub struct SinkCallback {}

impl<T, R, E> Callback<T, R, E> for SinkCallback
where
    T: Copy,
{
    fn print(&self, _: &[Checkpoint<R, E>]) {}
}

/// A callback function that prints the result of each individual iteration
pub struct SimpleCallback {}

impl<T, R, E> Callback<T, R, E> for SimpleCallback
where
    T: Display + Float,
    E: Estimators<T>,
{
    fn print(&self, chkpts: &[Checkpoint<R, E>]) {
        let iteration = chkpts.len();
        // Make sure that there is at least one checkpoint
        // otherwise do nothing.
        if let Some(chkpt) = chkpts.last() {
            let estimators = chkpt.estimators();
            println!("iteration {} finished.", iteration - 1);
            println!(
                "this iteration: N={} E={} \u{b1} {}",
                estimators.calls(),
                estimators.mean(),
                estimators.std()
            );
        }
    }
}

/// A callback that prints the running combined estimate together with its
/// chi-square diagnostic after each iteration.
pub struct ChiSquareCallback {}

impl<T, R, E> Callback<T, R, E> for ChiSquareCallback
where
    T: Display + Float,
    E: IterativeEstimators<T>,
{
    fn print(&self, chkpts: &[Checkpoint<R, E>]) {
        let iteration = chkpts.len();

        if let Some(chkpt) = chkpts.last() {
            let estimators = chkpt.estimators();
            println!(
                "[iteration {}: N={} E={} \u{b1} {} chi2/dof={}]",
                iteration - 1,
                estimators.calls(),
                estimators.mean(),
                estimators.std(),
                estimators.chi_sq()
            );
        }
    }
}

/// A collaborator receiving every accepted event at the moment of its
/// acceptance.
///
/// Implementations may reconstruct and persist whatever internal structure
/// they associate with the point; the generator only guarantees that `x` is
/// the accepted point and `weight` the integrand value that admitted it.
pub trait Recorder<T: Copy> {
    /// Called once for every accepted event.
    fn record(&mut self, x: &[T], weight: T);
}

/// A recorder that drops all events.
pub struct SinkRecorder {}

impl<T: Copy> Recorder<T> for SinkRecorder {
    fn record(&mut self, _: &[T], _: T) {}
}

/// A recorder that keeps all accepted events in memory.
#[derive(Default)]
pub struct CollectingRecorder<T> {
    events: Vec<(Vec<T>, T)>,
}

impl<T: Copy> CollectingRecorder<T> {
    /// Construct an empty recorder.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Access the recorded events as `(point, weight)` pairs.
    pub fn events(&self) -> &[(Vec<T>, T)] {
        &self.events
    }
}

impl<T: Copy> Recorder<T> for CollectingRecorder<T> {
    fn record(&mut self, x: &[T], weight: T) {
        self.events.push((x.to_vec(), weight));
    }
}

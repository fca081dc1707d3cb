#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! The crate `mcgenir` provides adaptive [Monte Carlo integration] of
//! multi-dimensional definite integrals over the unit hypercube together with
//! the generation of *unweighted events*: samples whose frequency is already
//! proportional to the integrand, so that no reweighting is required by the
//! consumer.
//!
//! # Features
//!
//! This library was designed with the following features as essential in mind:
//!
//! - **Generic numeric type**. The numeric type used in this library is not fixed, but instead a
//! generic parameter, so that the routines can be used with either `f32`, `f64`, or a custom
//! numeric type that implements the `Float` trait from the `num-traits` crate.
//! - **Generic random number generator**. Every random number generator that implements the `Rng`
//! trait from the `rand` crate can be used with every integrator and generator in this crate.
//! - **Reproducibility**. As far as the numeric type allows this, all results produced with
//! `mcgenir` only depend on the used random number generator and the chosen seed. Seeds are
//! explicit; wall-clock seeding is left to the outermost caller.
//! - **Strict weight checking**. The event generator treats non-finite integrand values as a hard
//! error instead of silently comparing them against the acceptance envelope. The integrator
//! filters them out and keeps a counter, since a single bad evaluation should degrade the
//! precision of the estimate, not abort a long run.
//!
//! # How does event generation work?
//!
//! The unit hypercube is partitioned into a fixed grid of cells. A one-shot
//! preparation pass records the largest observed integrand value in every
//! cell; these per-cell maxima form the *acceptance envelope* used for
//! rejection sampling. Whenever sampling discovers a weight above the
//! envelope of its cell (a *breach*), the envelope is raised and a
//! *correction cycle* repays the events that were under-sampled while the
//! envelope was too tight, keeping the output stream statistically unweighted
//! at all times.
//!
//! # What is ...?
//!
//! Given
//!
//! $$ I = \prod_{i=1}^d \int_0^1 \mathrm{d} x_i f(x_1, x_2, \ldots, x_d) $$
//!
//! we use the following terms:
//!
//! - the number of *calls* is the number of times the integrand is evaluated. We assume that this
//! is the expensive operation;
//! - the *integrand* is the function, $f(x_1, x_2, \ldots, x_d)$, that is being integrated. It
//! must be non-negative and deterministic in its argument;
//! - the number of *dimensions*, $d$, is the number of dimensions of the integration domain;
//! - a *cell* is one of $m^d$ axis-aligned sub-regions of the hypercube, where $m$ is the number
//! of grid bins per dimension;
//! - an *unweighted event* is an accepted sample point; accepted points are distributed
//! proportionally to $f$;
//! - the *chi-square* is a per-iteration diagnostic of the integrator indicating how compatible
//! the individual iteration estimates are with each other.
//!
//! [Monte Carlo integration]: https://en.wikipedia.org/wiki/Monte_Carlo_integration

pub mod callbacks;
pub mod core;
pub mod generators;
pub mod grid;
pub mod integrators;

pub use crate::core::*;

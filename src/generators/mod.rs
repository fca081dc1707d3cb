//! The event generators provided by this crate.
pub mod unweighted;

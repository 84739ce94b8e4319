//! `twopt` measures angular two-point correlation functions w(θ) of weighted
//! point catalogs over arbitrary footprints on the celestial sphere.
//!
//! The measurement combines two estimators. Small separations are counted
//! with a hierarchical spatial index over the points ([`tree::PointIndex`],
//! Landy–Szalay estimator with generated random catalogs); large separations
//! are measured on a multi-resolution density field sampled from the
//! footprint ([`field::ScalarField`], overdensity pair sums). The
//! [`engine::CorrelationEngine`] assigns each angular bin to one of the two,
//! runs both sweeps and, with jack-knife regions, estimates the covariance.

pub mod bin;
mod convert;
pub mod engine;
pub mod error;
pub mod field;
pub mod map;
pub mod output;
pub mod pixel;
pub mod point;
pub mod tree;

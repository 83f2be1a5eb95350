// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability tools: feature interventions and steering strengths.
//!
//! - [`intervention`] — Additive steering and codec clamping, the
//!   intervention engine, and logit comparisons.
//! - [`steering`] — Control conditions and clamp-value derivation.

pub mod intervention;
pub mod steering;

//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - assay observations and datasets (`Observation`, `Dataset`, `Split`)
//! - curve parametrizations (`CurveModel`, `CurveParameters`)
//! - fit outputs (`FitResult`, `MixedFitResult`, `RandomEffectEstimate`)
//! - run configuration (`AnalysisConfig`, `SimulationSpec`)

pub mod types;

pub use types::*;

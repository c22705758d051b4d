//! Curve fitting.
//!
//! Responsibilities:
//!
//! - single-curve nonlinear least squares (`fitter`)
//! - independent per-group fits, run in parallel (`fitter`)
//! - stable group-label indexing shared by the grouped fits (`groups`)
//! - nonlinear mixed-effects fits with a per-group random effect (`mixed`)

pub mod fitter;
pub mod groups;
pub mod mixed;

pub use fitter::*;
pub use groups::*;
pub use mixed::*;

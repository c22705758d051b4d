//! Mathematical utilities: stable curve primitives, least squares, quadrature.

pub mod basis;
pub mod hermite;
pub mod ols;

pub use basis::*;
pub use hermite::*;
pub use ols::*;

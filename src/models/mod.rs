//! Saturating curve implementations (tanh and logistic forms).
//!
//! Models are implemented as small, pure methods on `domain::CurveModel` so that
//! fitting code can stay generic over the parametrization.

pub mod model;

pub use model::*;

//! Dataset preparation: synthetic assay tables and the train/test split.

pub mod sample;
pub mod split;

pub use sample::*;
pub use split::*;

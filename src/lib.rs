// Empirical orthogonal function (EOF) analysis

#![doc = include_str!("../README.md")]

pub mod adapters;
pub mod config;
pub mod decomposition;
pub mod diagnostics;
pub mod error;
pub mod extended;
pub mod flatten;
pub mod linalg_backends;
pub mod multivariate;
pub mod rotation;
pub mod solver;
pub mod weights;


pub use adapters::{AdapterRegistry, ContainerAdapter, NdarrayAdapter};
pub use config::{EofConfig, EofScaling, EofUnits, MissingPolicy, PcScaling, SvdStrategy};
pub use decomposition::{decompose, DecompositionOptions, DecompositionResult};
pub use diagnostics::ModeErrorEstimate;
pub use error::{EofError, Result};
pub use extended::ExtendedEof;
pub use flatten::{flatten, FlattenedField, SpatialIndex};
pub use multivariate::{combine, ChannelTable, CombinedMatrix, FieldSpec};
pub use rotation::{RotatedResult, RotationConfig, RotationMethod, RotationStatus, Rotator, VarimaxOptions};
pub use solver::{Eof, EofSolver, MultivariateEof};
pub use weights::{compute_weights, WeightScheme, WeightVector};

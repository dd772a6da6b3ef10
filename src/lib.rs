#![deny(dead_code)]
#![deny(unused_imports)]

pub mod bspline;
pub mod decompose;
pub mod error;
pub mod eval;
pub mod hierarchy;
pub mod tensor;
pub mod truncation;

pub use bspline::{BsplineBasis, RefinementTransfer};
pub use decompose::{DomainDecomposition, LevelPartition, Polyline, Region, decompose};
pub use error::{AccessError, DecomposeError, NumericalDegeneracy, StructuralError};
pub use eval::{ActiveFunctions, NO_FUNCTION};
pub use hierarchy::{Hierarchy, IndexBox};
pub use tensor::TensorBasis;
pub use truncation::{Presentation, SparseCoefs, TruncatedBasis};

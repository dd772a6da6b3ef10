use thiserror::Error;

/// Errors that indicate the hierarchical structure itself is (or would
/// become) inconsistent. A failed operation leaves the hierarchy untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructuralError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("The hierarchy needs at least one parametric direction.")]
    NoDirections,

    #[error(
        "Knot vector needs at least {required} knots for degree {degree}, but only {provided} were provided."
    )]
    InsufficientKnots {
        degree: usize,
        required: usize,
        provided: usize,
    },

    #[error("Invalid knot vector: {0}")]
    InvalidKnotVector(String),

    #[error(
        "Refinement to level {requested} must be exactly one level finer than the coarsest level overlapping the box, which is {coarsest}."
    )]
    LevelJump { requested: usize, coarsest: usize },

    #[error(
        "Refinement box [{low:?}, {high:?}) lies outside the index domain of {cells:?} cells."
    )]
    BoxOutOfDomain {
        low: Vec<usize>,
        high: Vec<usize>,
        cells: Vec<usize>,
    },

    #[error("Refinement box [{low:?}, {high:?}) is empty.")]
    EmptyBox { low: Vec<usize>, high: Vec<usize> },

    #[error("Refinement box has {got} dimensions but the hierarchy has {expected}.")]
    BoxDimensionMismatch { expected: usize, got: usize },

    #[error(
        "Refinement level {requested} is not reachable; the deepest level present is {max_level}."
    )]
    LevelOutOfRange { requested: usize, max_level: usize },

    #[error(
        "Truncation removed every coefficient of basis function {id}; the refined region fully covers its support."
    )]
    FullTruncation { id: usize },

    #[error("Failed to assemble the sparse presentation cache: {0}")]
    PresentationAssembly(String),

    #[error("{count} index cells are not covered by any level; the domain partition has gaps.")]
    UncoveredCells { count: usize },

    #[error("Domain decomposition is only defined for 2D hierarchies, got dimension {dim}.")]
    UnsupportedDimension { dim: usize },
}

/// Caller precondition violations on read-only queries. No internal state is
/// affected; the caller is expected to fix the query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccessError {
    #[error("Basis function {id} is not truncated and has no sparse representation.")]
    NotTruncated { id: usize },

    #[error("Basis function id {id} is out of range; the basis has {len} active functions.")]
    IdOutOfRange { id: usize, len: usize },

    #[error(
        "Point coordinate {value} in direction {dir} lies outside the parametric domain [{min}, {max}]."
    )]
    PointOutOfDomain {
        dir: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Query points have {got} coordinates but the basis is {expected}-dimensional.")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Unsupported derivative order {0}; only 0, 1, 2 are supported.")]
    UnsupportedOrder(usize),
}

/// A traced boundary polyline that cannot be resolved into simple closed
/// cycles. Detected and reported; no recovery is attempted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericalDegeneracy {
    #[error("Boundary trace at level {level} produced a polyline that does not close.")]
    OpenPolyline { level: usize },

    #[error(
        "Boundary polyline at level {level} is not simple and no repeated vertex was found to split it."
    )]
    UnresolvedCycle { level: usize },
}

/// Everything `decompose_domain` can report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecomposeError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Degeneracy(#[from] NumericalDegeneracy),
}

//! Fatal-error type for the transformation run.
//!
//! The pass distinguishes two severities. Soft per-feature failures —
//! a missing optional role loop, unmet vectorization preconditions, a
//! non-constant trip count — never become `Err`: the feature is skipped for
//! that nest and a diagnostic is logged. `OptError` covers only the fatal
//! cases: contract breaches from the upstream tiling stage or broken
//! internal post-conditions, where continuing would rewrite against an
//! inconsistent buffer identity. Fatal errors abort the whole run; nothing
//! is retried, since rewrites mutate the nest in place.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptError {
    #[error("unable to identify output/lhs/rhs buffers in matmul nest")]
    ClassifyFailed,

    #[error("vectorized buffer map has no entry for the {0} operand")]
    VectorMapMissing(&'static str),

    #[error("packing region for buffer `{buffer}` is not analyzable: {reason}")]
    PackRegion { buffer: String, reason: String },

    #[error("packed buffer `{buffer}` needs {needed} bytes, capacity ceiling is {ceiling}")]
    PackCapacity { buffer: String, needed: usize, ceiling: usize },
}

pub type OptResult<T> = Result<T, OptError>;

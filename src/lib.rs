//! blis-opt: BLIS-style micro-kernel rewriting for pre-tiled matmul nests.
//!
//! The input is a loop nest that an upstream tiling stage has already
//! blocked for the cache hierarchy and tagged with symbolic role labels
//! (`iC`/`jC`/`kC` cache loops, `jR`/`jjR`/`iiR` register-tile loops, `k`
//! reduction). This crate rewrites such nests into BLIS micro-kernel form:
//! the innermost `jjR` loop is widened to vector-width accesses, operands
//! are packed into aligned cache-level scratch buffers with
//! register-friendly layouts, and the register-tile loops are unrolled (and
//! jammed) to expose reuse.
//!
//! # Pipeline
//!
//! ```text
//! Function → driver::run → optimize_matmul (per matmul nest)
//!                              ├── analysis::classify_operands
//!                              ├── vectorize      (jjR, soft)
//!                              ├── pack           (iC / kC / jR tiers)
//!                              └── unroll         (iiR, jjR, k)
//! ```
//!
//! Rewrites happen in place and are not retryable; fatal contract breaches
//! ([`OptError`]) abort the run, while missing optional structure only
//! disables the corresponding feature for that nest.

pub mod analysis;
pub mod config;
pub mod driver;
pub mod error;
pub mod ir;
pub mod optimize;
pub mod pack;
pub mod unroll;
pub mod validation;
pub mod vectorize;

pub use config::{OptConfig, TileParams};
pub use driver::{run, OptReport};
pub use error::{OptError, OptResult};
pub use optimize::{optimize_matmul, NestOutcome};
pub use pack::PackedBuffers;

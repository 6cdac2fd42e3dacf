//! Driver: scan a function for matmul-tagged nests and run the recipe.

use log::debug;

use crate::config::{OptConfig, TileParams};
use crate::error::OptResult;
use crate::ir::{Function, NestClass, Stmt};
use crate::optimize::{optimize_matmul, NestOutcome};

/// Per-run bookkeeping, mostly for callers and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptReport {
    /// Top-level loops carrying the matmul class tag.
    pub nests_seen: usize,
    /// Nests the recipe ran to completion on.
    pub optimized: usize,
    /// Nests skipped for a missing required role loop.
    pub skipped: usize,
}

/// Process every matmul-tagged top-level nest of `func`, in statement
/// order. Untagged statements are left byte-for-byte unchanged.
///
/// Per-nest tile parameters come from the nest's annotations, defaulted
/// from the fixed configuration table. Fatal errors abort the whole run;
/// per-nest skips continue with the next nest. Canonicalization and the
/// optional scalar-replacement cleanup run after this pass, outside this
/// crate — `cfg.scalar_replace` is only forwarded there.
pub fn run(func: &mut Function, cfg: &OptConfig) -> OptResult<OptReport> {
    let Function { body, buffers, loop_ids, name } = func;
    let mut report = OptReport::default();

    for stmt in body.iter_mut() {
        let Stmt::Loop(nest) = stmt else { continue };
        if nest.class != Some(NestClass::Matmul) {
            continue;
        }
        report.nests_seen += 1;

        let tiles = TileParams::resolve(&nest.tiles);
        match optimize_matmul(nest, buffers, loop_ids, &tiles, cfg)? {
            NestOutcome::Optimized { .. } => report.optimized += 1,
            NestOutcome::SkippedMissingRole(_) => report.skipped += 1,
        }
    }

    debug!(
        "{}: {} matmul nest(s), {} optimized, {} skipped",
        name, report.nests_seen, report.optimized, report.skipped
    );
    Ok(report)
}

//! Orchestrator: the fixed BLIS recipe applied to one matmul nest.
//!
//! Stage order is classify → vectorize → pack → unroll/jam. Operand
//! identities discovered by the classifier are threaded through the stages
//! because vectorization replaces the buffers that packing must then
//! target.

use log::debug;

use crate::analysis::{classify_operands, find_by_role, Operands};
use crate::config::{OptConfig, TileParams};
use crate::error::OptResult;
use crate::ir::{BufferTable, Loop, LoopIdGen, Role};
use crate::pack::{pack_operands, PackedBuffers};
use crate::unroll::{unroll_up_to, UnrollMode};
use crate::vectorize::vectorize;

/// What the orchestrator did with one nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestOutcome {
    Optimized {
        vectorized: bool,
        packed: Option<PackedBuffers>,
    },
    /// A required role loop is missing; the nest was left untouched.
    SkippedMissingRole(Role),
}

/// Optimize one matmul-tagged nest in place.
///
/// Classification failure is fatal for the whole run (the nest violates the
/// tiling stage's contract). A missing `iC` or `jR` loop aborts this nest
/// only: the recipe has nowhere to anchor packing, so no stage runs and the
/// pre-tiled structure is kept.
pub fn optimize_matmul(
    nest: &mut Loop,
    buffers: &mut BufferTable,
    ids: &mut LoopIdGen,
    tiles: &TileParams,
    cfg: &OptConfig,
) -> OptResult<NestOutcome> {
    let mut ops: Operands = classify_operands(nest)?;

    for required in [Role::IC, Role::JR] {
        if find_by_role(nest, required).is_none() {
            debug!("matmul recipe failed: {} not found", required.as_str());
            return Ok(NestOutcome::SkippedMissingRole(required));
        }
    }

    let vectorized = vectorize(nest, buffers, &mut ops, cfg)?;

    let packed = if cfg.pack {
        Some(pack_operands(nest, buffers, ids, &ops, tiles)?)
    } else {
        None
    };

    if cfg.unroll {
        // Register-tile loops are identified by role tag, never by depth:
        // degenerate tile sizes can make any of them disappear.
        if let Some(iir) = find_by_role(nest, Role::IIR).map(|l| l.id) {
            unroll_up_to(nest, iir, tiles.m_r, UnrollMode::Jam, ids);
        }
        if let Some(jjr) = find_by_role(nest, Role::JJR).map(|l| l.id) {
            unroll_up_to(nest, jjr, tiles.n_r, UnrollMode::Jam, ids);
        }
        if let Some(k) = find_by_role(nest, Role::K).map(|l| l.id) {
            unroll_up_to(nest, k, tiles.k_u, UnrollMode::Straight, ids);
        }
    }

    Ok(NestOutcome::Optimized { vectorized, packed })
}

//! Packing engine: stage operand data into cache-level scratch buffers.
//!
//! Three copy-in tiers, mirroring the BLIS memory hierarchy:
//!
//! - LHS at the `iC` body (capacity 2 MiB), remapped into contiguous
//!   `M_R`-row panels so the register tile streams it with unit stride;
//! - RHS at the `kC` body (2 MiB) when `kC` exists, else the original RHS
//!   passes through untouched;
//! - RHS again at the `jR` body (256 KiB) from the previous tier — the
//!   buffer the micro-kernel actually reads.
//!
//! Packing is read-only staging: the Output buffer is never packed. Every
//! fresh scratch buffer gets a 32-byte alignment attribute; a pass-through
//! RHS tier (an external argument) is left alone.
//!
//! Region analysis is the load-bearing part: for each buffer dimension the
//! index expression is split into terms over loops *below* the insertion
//! point (which sweep the copied region and need constant trip counts) and
//! an affine offset over outer induction variables (fixed at copy time).
//! Anything outside that form is a fatal internal error — the orchestrator
//! has already committed to rewriting this nest.

use log::debug;

use crate::analysis::{find_by_role_mut, Operands};
use crate::config::TileParams;
use crate::error::{OptError, OptResult};
use crate::ir::{
    visit_accesses, visit_accesses_mut, AccessKind, AffineExpr, BufferId, BufferTable,
    LayoutMap, Loop, LoopIdGen, MemSpace, Role, Stmt, Var,
};
use crate::ir::Expr;

/// Capacity ceiling for the cache-tier scratch buffers (LHS and RHS-L3).
pub const CACHE_TIER_CAPACITY: usize = 2 * 1024 * 1024;
/// Capacity ceiling for the register-adjacent RHS tier.
pub const L1_TIER_CAPACITY: usize = 256 * 1024;
/// Alignment forced on freshly allocated scratch buffers (256-bit).
pub const PACK_ALIGNMENT: u32 = 32;

/// The scratch buffers produced by one packing run. `rhs_l3` equals the
/// original RHS when the `kC` loop is absent (pass-through, no copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBuffers {
    pub lhs: BufferId,
    pub rhs_l3: BufferId,
    pub rhs_l1: BufferId,
}

/// Run all packing tiers against a nest whose `iC` and `jR` loops are known
/// to exist (the orchestrator guards that before calling).
pub fn pack_operands(
    nest: &mut Loop,
    buffers: &mut BufferTable,
    ids: &mut LoopIdGen,
    ops: &Operands,
    tiles: &TileParams,
) -> OptResult<PackedBuffers> {
    let lhs = {
        let ic = locate(nest, Role::IC, buffers, ops.lhs)?;
        pack_at(
            ic,
            ops.lhs,
            buffers,
            ids,
            CACHE_TIER_CAPACITY,
            Some(LayoutMap::row_panels(tiles.m_r)),
            "l2pack",
        )?
    };

    let rhs_l3 = match find_by_role_mut(nest, Role::KC) {
        Some(kc) => pack_at(kc, ops.rhs, buffers, ids, CACHE_TIER_CAPACITY, None, "l3pack")?,
        None => {
            debug!("rhs L3 tier passes through: kC not found");
            ops.rhs
        }
    };

    let rhs_l1 = {
        let jr = locate(nest, Role::JR, buffers, rhs_l3)?;
        pack_at(jr, rhs_l3, buffers, ids, L1_TIER_CAPACITY, None, "l1pack")?
    };

    buffers.get_mut(lhs).alignment = Some(PACK_ALIGNMENT);
    buffers.get_mut(rhs_l1).alignment = Some(PACK_ALIGNMENT);
    // The L3 tier may just be the original operand or a function argument;
    // only a buffer this pass allocated gets its alignment forced.
    if rhs_l3 != ops.rhs {
        buffers.get_mut(rhs_l3).alignment = Some(PACK_ALIGNMENT);
    }

    Ok(PackedBuffers { lhs, rhs_l3, rhs_l1 })
}

/// The orchestrator checks `iC`/`jR` presence before enabling packing, so a
/// miss here is an internal inconsistency, not a per-nest skip.
fn locate<'a>(
    nest: &'a mut Loop,
    role: Role,
    buffers: &BufferTable,
    src: BufferId,
) -> OptResult<&'a mut Loop> {
    let name = buffers.get(src).name.clone();
    find_by_role_mut(nest, role).ok_or_else(|| OptError::PackRegion {
        buffer: name,
        reason: format!("{} loop not found", role.as_str()),
    })
}

// ── Region analysis ────────────────────────────────────────────────

/// A loop below the copy insertion point: its iv sweeps the copied region.
struct InnerLoop {
    iv: Var,
    lower: AffineExpr,
    step: i64,
    trip: Option<i64>,
}

fn collect_inner(body: &[Stmt], out: &mut Vec<InnerLoop>) {
    for stmt in body {
        if let Stmt::Loop(l) = stmt {
            out.push(InnerLoop {
                iv: l.iv(),
                lower: l.lower.clone(),
                step: l.step,
                trip: l.trip_count(),
            });
            collect_inner(&l.body, out);
        }
    }
}

/// Reduce one index expression over the inner loops to `(offset, width)`:
/// an affine offset over outer ivs and the constant span the inner ivs
/// sweep. Extent of the region in this dimension is `width + lanes`.
///
/// Inner ivs are eliminated innermost-first; a loop's lower bound may
/// reference more-outer inner ivs, which later iterations then absorb.
fn region_of(expr: &AffineExpr, inner: &[InnerLoop]) -> Result<(AffineExpr, i64), String> {
    let mut cur = expr.clone();
    let mut width = 0i64;
    for l in inner.iter().rev() {
        let c = cur.coeff(l.iv);
        if c == 0 {
            continue;
        }
        let trip = l
            .trip
            .ok_or_else(|| format!("inner loop {:?} has a non-constant trip count", l.iv))?;
        let span = (trip.max(1) - 1) * l.step;
        width += c.abs() * span;
        let repl = if c > 0 { l.lower.clone() } else { l.lower.clone().add_const(span) };
        cur = cur.substitute(l.iv, &repl);
    }
    if inner.iter().any(|l| cur.uses(l.iv)) {
        return Err("inner induction variables survive bound substitution".into());
    }
    Ok((cur, width))
}

// ── Copy generation ────────────────────────────────────────────────

/// Insert a copy-in of `src` at the front of `target`'s body and retarget
/// all in-scope accesses to the fresh scratch buffer.
fn pack_at(
    target: &mut Loop,
    src: BufferId,
    buffers: &mut BufferTable,
    ids: &mut LoopIdGen,
    ceiling: usize,
    layout: Option<LayoutMap>,
    tier: &str,
) -> OptResult<BufferId> {
    let src_buf = buffers.get(src).clone();
    let region_err = |reason: String| OptError::PackRegion {
        buffer: src_buf.name.clone(),
        reason,
    };

    let mut inner = Vec::new();
    collect_inner(&target.body, &mut inner);

    // Gather the index tuples of every access to `src` in scope. Packing is
    // copy-in only, so a store to the source is a contract breach.
    let mut tuples: Vec<Vec<AffineExpr>> = Vec::new();
    let mut stored = false;
    visit_accesses(&target.body, &mut |kind, buf, indices| {
        if buf != src {
            return;
        }
        if kind == AccessKind::Store {
            stored = true;
        }
        tuples.push(indices.to_vec());
    });
    if stored {
        return Err(region_err("source buffer is written inside the packing scope".into()));
    }
    if tuples.is_empty() {
        return Err(region_err("no accesses to the source buffer in the packing scope".into()));
    }
    if tuples.iter().any(|t| t.len() != src_buf.shape.len()) {
        return Err(region_err("access rank differs from buffer rank".into()));
    }

    // Per-dimension region; every access must resolve to the same one.
    let ndims = src_buf.shape.len();
    let lanes = src_buf.elem.lanes() as i64;
    let mut offsets: Vec<AffineExpr> = Vec::with_capacity(ndims);
    let mut extents: Vec<i64> = Vec::with_capacity(ndims);
    for d in 0..ndims {
        let access_lanes = if d + 1 == ndims { lanes } else { 1 };
        let (offset, width) = region_of(&tuples[0][d], &inner).map_err(&region_err)?;
        for tuple in &tuples[1..] {
            let (o, w) = region_of(&tuple[d], &inner).map_err(&region_err)?;
            if o != offset || w != width {
                return Err(region_err(format!("accesses disagree on the dimension {d} region")));
            }
        }
        offsets.push(offset);
        extents.push(width + access_lanes);
    }

    // Capacity ceiling check against the physical footprint.
    let phys: i64 = match &layout {
        Some(map) => map.physical_shape(&extents).iter().product(),
        None => extents.iter().product(),
    };
    let needed = phys.max(0) as usize * src_buf.elem.scalar().size_bytes();
    if needed > ceiling {
        return Err(OptError::PackCapacity { buffer: src_buf.name.clone(), needed, ceiling });
    }

    let packed = buffers.alloc(
        format!("{}.{tier}", src_buf.name),
        src_buf.elem,
        extents.clone(),
        MemSpace::Scratch,
    );
    buffers.get_mut(packed).layout = layout;
    buffers.get_mut(packed).capacity_limit = Some(ceiling);

    // Retarget in-scope accesses first, then prepend the copy nest — the
    // copy itself must keep reading the original buffer.
    visit_accesses_mut(&mut target.body, &mut |_, buf, indices| {
        if *buf != src {
            return;
        }
        *buf = packed;
        for (idx, offset) in indices.iter_mut().zip(&offsets) {
            *idx = idx.sub(offset);
        }
    });
    let copy = build_copy_nest(src, packed, &offsets, &extents, lanes, ids);
    target.body.insert(0, copy);

    debug!(
        "packed {} into {} ({} bytes, ceiling {})",
        src_buf.name,
        buffers.get(packed).name,
        needed,
        ceiling
    );
    Ok(packed)
}

/// A rectangular copy loop nest: `packed[c0, .., cn] = src[offset + c]`,
/// stepping by the vector lane count in the last dimension.
fn build_copy_nest(
    src: BufferId,
    packed: BufferId,
    offsets: &[AffineExpr],
    extents: &[i64],
    lanes: i64,
    ids: &mut LoopIdGen,
) -> Stmt {
    let loop_ids: Vec<_> = extents.iter().map(|_| ids.fresh()).collect();
    let dst_idx: Vec<AffineExpr> = loop_ids.iter().map(|&id| AffineExpr::iv(id)).collect();
    let src_idx: Vec<AffineExpr> = dst_idx
        .iter()
        .zip(offsets)
        .map(|(iv, offset)| iv.add(offset))
        .collect();

    let mut stmt = Stmt::Store {
        buffer: packed,
        indices: dst_idx,
        value: Expr::Load { buffer: src, indices: src_idx },
    };
    for (d, (&id, &extent)) in loop_ids.iter().zip(extents).enumerate().rev() {
        let step = if d + 1 == extents.len() { lanes } else { 1 };
        stmt = Stmt::Loop(Loop {
            id,
            lower: AffineExpr::constant(0),
            upper: AffineExpr::constant(extent),
            step,
            body: vec![stmt],
            role: None,
            class: None,
            tiles: Default::default(),
        });
    }
    stmt
}

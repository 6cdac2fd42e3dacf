//! Unroll and unroll-and-jam for the register-tile loops.
//!
//! Factors clamp to the loop's constant trip count: a factor at or above
//! the trip count fully unrolls the loop (it dissolves into its parent, no
//! remainder); a smaller factor keeps the loop with a widened step and a
//! jammed (or straight-line) replicated body, plus a remainder loop for the
//! uncovered `trip mod factor` iterations. Jamming fuses the replicas of
//! each immediate inner loop into a single loop so the register tile stays
//! interleaved; straight replication is used for the innermost reduction
//! loop, where there is nothing to fuse.
//!
//! A non-constant trip count is a soft skip — the loop is left untouched
//! and a diagnostic logged.

use log::debug;

use crate::ir::{substitute_stmt, AffineExpr, Loop, LoopId, LoopIdGen, Stmt, Var};

/// Replication discipline for the unrolled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrollMode {
    /// Fuse replicas of immediate inner loops (unroll-and-jam).
    Jam,
    /// Concatenate whole-body replicas in sequence.
    Straight,
}

/// What an unroll attempt did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrollOutcome {
    /// Loop fully unrolled and dissolved into its parent.
    Full,
    /// Loop kept with a widened step; `remainder` tells whether a residual
    /// loop was split off.
    Partial { remainder: bool },
    /// Trip count not constant, or an inner loop's bounds depend on the
    /// unrolled iv under jamming; nothing was changed.
    Skipped,
    /// No loop with that id below the nest root.
    NotFound,
}

/// Unroll the loop `target` somewhere below `nest` by at most `factor`.
///
/// The target is looked up by id rather than borrowed directly because full
/// unrolling splices the body into the parent statement list.
pub fn unroll_up_to(
    nest: &mut Loop,
    target: LoopId,
    factor: i64,
    mode: UnrollMode,
    ids: &mut LoopIdGen,
) -> UnrollOutcome {
    if factor < 1 {
        return UnrollOutcome::Skipped;
    }
    unroll_in_body(&mut nest.body, target, factor, mode, ids)
}

fn unroll_in_body(
    body: &mut Vec<Stmt>,
    target: LoopId,
    factor: i64,
    mode: UnrollMode,
    ids: &mut LoopIdGen,
) -> UnrollOutcome {
    for pos in 0..body.len() {
        let Stmt::Loop(l) = &mut body[pos] else { continue };
        if l.id == target {
            let (stmts, outcome) = expand(std::mem::replace(l, placeholder()), factor, mode, ids);
            body.splice(pos..=pos, stmts);
            return outcome;
        }
        let inner = unroll_in_body(&mut l.body, target, factor, mode, ids);
        if inner != UnrollOutcome::NotFound {
            return inner;
        }
    }
    UnrollOutcome::NotFound
}

/// Zero-trip stand-in for the statement slot being spliced over.
fn placeholder() -> Loop {
    Loop {
        id: LoopId(u32::MAX),
        lower: AffineExpr::constant(0),
        upper: AffineExpr::constant(0),
        step: 1,
        body: Vec::new(),
        role: None,
        class: None,
        tiles: Default::default(),
    }
}

fn expand(l: Loop, factor: i64, mode: UnrollMode, ids: &mut LoopIdGen) -> (Vec<Stmt>, UnrollOutcome) {
    let Some(trip) = l.trip_count() else {
        debug!("unroll skipped: trip count of loop {:?} is not constant", l.id);
        return (vec![Stmt::Loop(l)], UnrollOutcome::Skipped);
    };
    if trip == 0 {
        return (Vec::new(), UnrollOutcome::Full);
    }
    let iv = l.iv();
    let f = factor.min(trip);

    if mode == UnrollMode::Jam && inner_bounds_use(&l.body, iv) {
        debug!("unroll-and-jam skipped: inner bounds depend on iv of {:?}", l.id);
        return (vec![Stmt::Loop(l)], UnrollOutcome::Skipped);
    }

    if f == trip {
        // Full unroll: iv r takes lb + r*step.
        let offsets: Vec<AffineExpr> =
            (0..trip).map(|r| l.lower.clone().add_const(r * l.step)).collect();
        return (replicate(&l.body, iv, &offsets, mode), UnrollOutcome::Full);
    }

    // Partial: the main loop keeps its iv and covers the divisible prefix;
    // replica r shifts the iv by r*step.
    let covered = trip - trip % f;
    let offsets: Vec<AffineExpr> =
        (0..f).map(|r| AffineExpr::var(iv).add_const(r * l.step)).collect();
    let main = Loop {
        id: l.id,
        lower: l.lower.clone(),
        upper: l.lower.clone().add_const(covered * l.step),
        step: l.step * f,
        body: replicate(&l.body, iv, &offsets, mode),
        role: l.role,
        class: l.class,
        tiles: l.tiles,
    };

    let mut out = vec![Stmt::Loop(main)];
    let remainder = trip % f != 0;
    if remainder {
        let rem_id = ids.fresh();
        let rem_iv = AffineExpr::iv(rem_id);
        out.push(Stmt::Loop(Loop {
            id: rem_id,
            lower: l.lower.clone().add_const(covered * l.step),
            upper: l.upper.clone(),
            step: l.step,
            body: l.body.iter().map(|s| substitute_stmt(s, iv, &rem_iv)).collect(),
            role: l.role,
            class: None,
            tiles: l.tiles,
        }));
    }
    (out, UnrollOutcome::Partial { remainder })
}

fn inner_bounds_use(body: &[Stmt], iv: Var) -> bool {
    body.iter().any(|s| match s {
        Stmt::Loop(l) => l.lower.uses(iv) || l.upper.uses(iv),
        Stmt::Store { .. } => false,
    })
}

/// Replicate `body` once per offset, substituting the iv, fusing inner
/// loops positionally under [`UnrollMode::Jam`].
fn replicate(body: &[Stmt], iv: Var, offsets: &[AffineExpr], mode: UnrollMode) -> Vec<Stmt> {
    match mode {
        UnrollMode::Straight => offsets
            .iter()
            .flat_map(|o| body.iter().map(|s| substitute_stmt(s, iv, o)))
            .collect(),
        UnrollMode::Jam => {
            let mut out = Vec::new();
            for stmt in body {
                match stmt {
                    Stmt::Loop(inner) => {
                        let fused: Vec<Stmt> = offsets
                            .iter()
                            .flat_map(|o| inner.body.iter().map(|s| substitute_stmt(s, iv, o)))
                            .collect();
                        out.push(Stmt::Loop(Loop { body: fused, ..inner.clone() }));
                    }
                    // Straight-line statements: replicas stay adjacent at
                    // their original position.
                    s => out.extend(offsets.iter().map(|o| substitute_stmt(s, iv, o))),
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BufferId, ElemType, Expr, Function, MemSpace, ScalarType};

    /// `for i in 0..trip { c[i] = src[i] }` wrapped in a single-trip parent.
    fn counted_nest(f: &mut Function, trip: i64) -> (Loop, LoopId, BufferId) {
        let elem = ElemType::Scalar(ScalarType::F64);
        let src = f.buffers.alloc("src", elem, vec![64], MemSpace::Global);
        let c = f.buffers.alloc("c", elem, vec![64], MemSpace::Global);

        let mut l = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(trip), 1);
        let target = l.id;
        let i = l.iv_expr();
        l.body.push(Stmt::Store {
            buffer: c,
            indices: vec![i.clone()],
            value: Expr::Load { buffer: src, indices: vec![i] },
        });

        let mut parent = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(1), 1);
        parent.body.push(Stmt::Loop(l));
        (parent, target, c)
    }

    /// Constant last-dim indices of every store under `body`, in order.
    fn store_offsets(body: &[Stmt], acc: &mut Vec<i64>) {
        for s in body {
            match s {
                Stmt::Loop(l) => store_offsets(&l.body, acc),
                Stmt::Store { indices, .. } => {
                    acc.push(indices.last().and_then(|e| e.as_constant()).unwrap_or(-1))
                }
            }
        }
    }

    #[test]
    fn test_factor_above_trip_fully_unrolls() {
        let mut f = Function::new("t");
        let (mut parent, target, _) = counted_nest(&mut f, 3);
        let out = unroll_up_to(&mut parent, target, 8, UnrollMode::Straight, &mut f.loop_ids);
        assert_eq!(out, UnrollOutcome::Full);
        // Loop dissolved: three straight-line stores at constant indices.
        let mut seen = Vec::new();
        store_offsets(&parent.body, &mut seen);
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(parent.body.iter().all(|s| matches!(s, Stmt::Store { .. })));
    }

    #[test]
    fn test_partial_unroll_leaves_remainder() {
        let mut f = Function::new("t");
        let (mut parent, target, _) = counted_nest(&mut f, 10);
        let out = unroll_up_to(&mut parent, target, 4, UnrollMode::Straight, &mut f.loop_ids);
        assert_eq!(out, UnrollOutcome::Partial { remainder: true });

        // Main loop: 0..8 step 4 with 4 replicas; remainder loop: 8..10.
        let Stmt::Loop(main) = &parent.body[0] else { panic!("expected main loop") };
        assert_eq!(main.id, target);
        assert_eq!(main.step, 4);
        assert_eq!(main.upper.as_constant(), Some(8));
        assert_eq!(main.body.len(), 4);

        let Stmt::Loop(rem) = &parent.body[1] else { panic!("expected remainder loop") };
        assert_ne!(rem.id, target);
        assert_eq!(rem.lower.as_constant(), Some(8));
        assert_eq!(rem.upper.as_constant(), Some(10));
        assert_eq!(rem.step, 1);
    }

    #[test]
    fn test_exact_factor_no_remainder() {
        let mut f = Function::new("t");
        let (mut parent, target, _) = counted_nest(&mut f, 12);
        let out = unroll_up_to(&mut parent, target, 4, UnrollMode::Straight, &mut f.loop_ids);
        assert_eq!(out, UnrollOutcome::Partial { remainder: false });
        assert_eq!(parent.body.len(), 1);
    }

    #[test]
    fn test_jam_fuses_inner_loop_copies() {
        // for i in 0..2 { for j in 0..4 { c[i*4 + j] = src[i*4 + j] } }
        let mut f = Function::new("t");
        let elem = ElemType::Scalar(ScalarType::F64);
        let src = f.buffers.alloc("src", elem, vec![8], MemSpace::Global);
        let c = f.buffers.alloc("c", elem, vec![8], MemSpace::Global);

        let mut outer = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(2), 1);
        let target = outer.id;
        let mut jloop = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(4), 1);
        let jid = jloop.id;
        let idx = outer.iv_expr().scale(4).add(&jloop.iv_expr());
        jloop.body.push(Stmt::Store {
            buffer: c,
            indices: vec![idx.clone()],
            value: Expr::Load { buffer: src, indices: vec![idx] },
        });
        outer.body.push(Stmt::Loop(jloop));

        let mut parent = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(1), 1);
        parent.body.push(Stmt::Loop(outer));

        let out = unroll_up_to(&mut parent, target, 2, UnrollMode::Jam, &mut f.loop_ids);
        assert_eq!(out, UnrollOutcome::Full);
        // One fused j loop with both replicas interleaved in its body.
        assert_eq!(parent.body.len(), 1);
        let Stmt::Loop(fused) = &parent.body[0] else { panic!("expected fused loop") };
        assert_eq!(fused.id, jid);
        assert_eq!(fused.body.len(), 2);
    }

    #[test]
    fn test_symbolic_trip_is_skipped() {
        let mut f = Function::new("t");
        let (mut parent, target, _) = counted_nest(&mut f, 4);
        if let Stmt::Loop(l) = &mut parent.body[0] {
            l.upper = AffineExpr::sym(0);
        }
        let before = parent.clone();
        let out = unroll_up_to(&mut parent, target, 4, UnrollMode::Straight, &mut f.loop_ids);
        assert_eq!(out, UnrollOutcome::Skipped);
        assert_eq!(parent, before);
    }
}

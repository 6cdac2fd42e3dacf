//! Vectorizer: widen the `jjR` loop to vector-width accesses.
//!
//! On success the `jjR` loop steps by the vector width and every buffer
//! whose accesses were fully vectorized across `jjR` is replaced by a fresh
//! vector-element buffer (scalar-unit indexing, see [`ElemType`]). The
//! caller's RHS and Output handles are updated from the replacement map so
//! that packing targets the post-vectorization identities; the LHS stays
//! scalar on purpose — its elements are broadcast into the register tile in
//! the BLIS micro-kernel style, not vector-loaded.

use std::collections::HashMap;

use log::debug;

use crate::analysis::{find_by_role_mut, Operands};
use crate::config::OptConfig;
use crate::error::{OptError, OptResult};
use crate::ir::{
    visit_accesses, visit_accesses_mut, AccessKind, AffineExpr, BufferId, BufferTable,
    ElemType, Loop, Role, Var,
};

/// How a buffer's accesses relate to the `jjR` induction variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessClass {
    /// Every access uses the iv with coefficient 1 in its last dimension.
    Vectorized,
    /// No access references the iv; loads become lane broadcasts.
    Invariant,
    /// Mixed or non-unit-stride uses; the whole attempt is abandoned.
    Unsupported,
}

/// Attempt to vectorize the nest at its `jjR` loop.
///
/// Preconditions (each unmet one is a soft skip, returning `Ok(false)`):
/// vectorization enabled, `jjR` present with step 1 and a constant trip
/// count divisible by the vector width, the Output not already
/// vector-element (idempotence guard), and every accessed buffer cleanly
/// vectorizable or invariant.
///
/// Post-condition (fatal when broken): the replacement map contains entries
/// for both the RHS and the Output buffer.
pub fn vectorize(
    nest: &mut Loop,
    buffers: &mut BufferTable,
    ops: &mut Operands,
    cfg: &OptConfig,
) -> OptResult<bool> {
    if !cfg.vectorize {
        return Ok(false);
    }
    if buffers.get(ops.output).elem.is_vector() {
        debug!("vectorize skipped: output is already vector-element");
        return Ok(false);
    }
    let width = cfg.vector_width;
    let Some(jjr) = find_by_role_mut(nest, Role::JJR) else {
        debug!("vectorize skipped: jjR not found");
        return Ok(false);
    };
    if jjr.step != 1 {
        debug!("vectorize skipped: jjR step is {}", jjr.step);
        return Ok(false);
    }
    match jjr.trip_count() {
        Some(trip) if trip % width == 0 => {}
        Some(trip) => {
            debug!("vectorize skipped: jjR trip count {trip} not divisible by width {width}");
            return Ok(false);
        }
        None => {
            debug!("vectorize skipped: jjR trip count is not constant");
            return Ok(false);
        }
    }

    let iv = Var::Iv(jjr.id);
    let mut classes: HashMap<BufferId, AccessClass> = HashMap::new();
    visit_accesses(&jjr.body, &mut |kind, buf, indices| {
        let class = classify_access(iv, kind, indices);
        classes
            .entry(buf)
            .and_modify(|c| {
                if *c != class {
                    *c = AccessClass::Unsupported;
                }
            })
            .or_insert(class);
    });

    if classes.values().any(|&c| c == AccessClass::Unsupported) {
        debug!("vectorize skipped: mixed or non-unit-stride accesses across jjR");
        return Ok(false);
    }

    // Commit: allocate vector twins and retarget all accesses.
    let mut map: HashMap<BufferId, BufferId> = HashMap::new();
    for (&old, &class) in &classes {
        if class != AccessClass::Vectorized {
            continue;
        }
        let src = buffers.get(old).clone();
        let new = buffers.alloc(
            format!("{}.vec", src.name),
            ElemType::Vector { scalar: src.elem.scalar(), lanes: width as usize },
            src.shape.clone(),
            src.space,
        );
        buffers.get_mut(new).alignment = src.alignment;
        map.insert(old, new);
    }
    visit_accesses_mut(&mut jjr.body, &mut |_, buf, _| {
        if let Some(&new) = map.get(buf) {
            *buf = new;
        }
    });
    jjr.step = width;

    // Contract with the caller: RHS and Output must have been vectorized.
    let new_rhs = *map.get(&ops.rhs).ok_or(OptError::VectorMapMissing("rhs"))?;
    let new_out = *map.get(&ops.output).ok_or(OptError::VectorMapMissing("output"))?;
    ops.rhs = new_rhs;
    ops.output = new_out;
    debug!("vectorized jjR at width {width}");
    Ok(true)
}

fn classify_access(iv: Var, kind: AccessKind, indices: &[AffineExpr]) -> AccessClass {
    let Some((last, rest)) = indices.split_last() else {
        return AccessClass::Unsupported;
    };
    if rest.iter().any(|e| e.uses(iv)) {
        return AccessClass::Unsupported;
    }
    match last.coeff(iv) {
        1 => AccessClass::Vectorized,
        // A store that ignores the iv would collapse distinct iterations.
        0 if kind == AccessKind::Load => AccessClass::Invariant,
        _ => AccessClass::Unsupported,
    }
}

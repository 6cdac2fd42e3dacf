//! Nest analysis: role-tag lookup and operand classification.

use crate::error::{OptError, OptResult};
use crate::ir::{visit_accesses, AccessKind, BufferId, Loop, Role, Stmt};

/// First loop in deterministic preorder (the nest root included) whose role
/// tag equals `role`; `None` when absent.
///
/// Traversal short-circuits on the first match. Duplicate tags are not a
/// supported input; first-match-wins is all callers may rely on.
pub fn find_by_role(nest: &Loop, role: Role) -> Option<&Loop> {
    if nest.role == Some(role) {
        return Some(nest);
    }
    find_in_body(&nest.body, role)
}

fn find_in_body(body: &[Stmt], role: Role) -> Option<&Loop> {
    for stmt in body {
        if let Stmt::Loop(l) = stmt {
            if let Some(found) = find_by_role(l, role) {
                return Some(found);
            }
        }
    }
    None
}

/// Mutable variant of [`find_by_role`].
pub fn find_by_role_mut(nest: &mut Loop, role: Role) -> Option<&mut Loop> {
    if nest.role == Some(role) {
        return Some(nest);
    }
    for stmt in &mut nest.body {
        if let Stmt::Loop(l) = stmt {
            if let Some(found) = find_by_role_mut(l, role) {
                return Some(found);
            }
        }
    }
    None
}

/// The three operand buffers of a matmul nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operands {
    pub output: BufferId,
    pub lhs: BufferId,
    pub rhs: BufferId,
}

/// Identify the Output, RHS, and LHS buffers of the nest.
///
/// Three passes: the store target is the Output; the first distinct load
/// target that is not the Output is the RHS; the next distinct load target
/// is the LHS. The load order is the deterministic preorder of
/// [`visit_accesses`], so classification depends on the operand order the
/// upstream tiling stage emitted — swapped multiplicands classify swapped.
/// That order dependence is inherited behavior and is kept as-is.
///
/// Any unresolved operand is a fatal contract breach: the nest does not have
/// the shape the tiling stage guarantees, and the whole run aborts.
pub fn classify_operands(nest: &Loop) -> OptResult<Operands> {
    let body = &nest.body;

    let mut output = None;
    visit_accesses(body, &mut |kind, buf, _| {
        if kind == AccessKind::Store && output.is_none() {
            output = Some(buf);
        }
    });

    let mut rhs = None;
    visit_accesses(body, &mut |kind, buf, _| {
        if kind == AccessKind::Load && rhs.is_none() && output != Some(buf) {
            rhs = Some(buf);
        }
    });

    let mut lhs = None;
    visit_accesses(body, &mut |kind, buf, _| {
        if kind == AccessKind::Load
            && lhs.is_none()
            && output != Some(buf)
            && rhs != Some(buf)
        {
            lhs = Some(buf);
        }
    });

    match (output, lhs, rhs) {
        (Some(output), Some(lhs), Some(rhs)) => Ok(Operands { output, lhs, rhs }),
        _ => Err(OptError::ClassifyFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AffineExpr, ElemType, Expr, Function, MemSpace, ScalarType};

    fn scalar_buf(f: &mut Function, name: &str) -> BufferId {
        f.buffers.alloc(name, ElemType::Scalar(ScalarType::F64), vec![8, 8], MemSpace::Global)
    }

    /// `for i { store c[i,i] = b[i,i] * a[i,i] }` with role tags on a chain
    /// of wrapper loops.
    fn tagged_chain(f: &mut Function, roles: &[Option<Role>]) -> Loop {
        let a = scalar_buf(f, "a");
        let b = scalar_buf(f, "b");
        let c = scalar_buf(f, "c");

        let mut inner = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(8), 1);
        let i = inner.iv_expr();
        inner.body.push(Stmt::Store {
            buffer: c,
            indices: vec![i.clone(), i.clone()],
            value: Expr::Mul(
                Box::new(Expr::Load { buffer: b, indices: vec![i.clone(), i.clone()] }),
                Box::new(Expr::Load { buffer: a, indices: vec![i.clone(), i] }),
            ),
        });

        let mut cur = inner;
        cur.role = *roles.last().unwrap();
        for role in roles[..roles.len() - 1].iter().rev() {
            let mut outer = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(1), 1);
            outer.role = *role;
            outer.body.push(Stmt::Loop(cur));
            cur = outer;
        }
        cur
    }

    #[test]
    fn test_find_by_role_first_match() {
        let mut f = Function::new("t");
        let nest = tagged_chain(&mut f, &[Some(Role::IC), Some(Role::JR), Some(Role::K)]);
        assert_eq!(find_by_role(&nest, Role::IC).map(|l| l.id), Some(nest.id));
        assert!(find_by_role(&nest, Role::JR).is_some());
        assert!(find_by_role(&nest, Role::JJR).is_none());
    }

    #[test]
    fn test_classify_order_dependence() {
        let mut f = Function::new("t");
        let nest = tagged_chain(&mut f, &[Some(Role::IC)]);
        let ops = classify_operands(&nest).unwrap();
        // Store target is the output; the first load (b) becomes RHS, the
        // second (a) LHS — classification tracks emission order.
        assert_eq!(f.buffers.get(ops.output).name, "c");
        assert_eq!(f.buffers.get(ops.rhs).name, "b");
        assert_eq!(f.buffers.get(ops.lhs).name, "a");
    }

    #[test]
    fn test_classify_fails_without_two_load_operands() {
        let mut f = Function::new("t");
        let c = scalar_buf(&mut f, "c");
        let mut l = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(8), 1);
        let i = l.iv_expr();
        l.body.push(Stmt::Store {
            buffer: c,
            indices: vec![i.clone(), i],
            value: Expr::Const(0.0),
        });
        assert!(matches!(classify_operands(&l), Err(OptError::ClassifyFailed)));
    }
}

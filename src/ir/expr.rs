//! Affine index arithmetic.
//!
//! Two expression families live here:
//!
//! - [`AffineExpr`] — a linear combination of loop induction variables and
//!   symbolic parameters plus a constant. Loop bounds and buffer index
//!   expressions are always of this form, which keeps region analysis and
//!   substitution (for unrolling) closed under the operations we need.
//! - [`LayoutMap`] — a per-physical-dimension mapping from a logical index
//!   tuple to a physical one, with `floordiv`/`mod` allowed. Only packed
//!   scratch buffers carry one; it is what expresses the register-friendly
//!   `(i / M_R, j, i mod M_R)` reorganization of a packed operand.

use std::collections::BTreeMap;

use super::LoopId;

/// A variable an affine expression can reference: a loop induction variable
/// or a symbolic parameter of the enclosing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Var {
    Iv(LoopId),
    Sym(u32),
}

/// Linear form `c0 + c1*v1 + c2*v2 + ...` over [`Var`]s.
///
/// Coefficients are kept in a `BTreeMap` so that equality and `Debug` output
/// are deterministic regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AffineExpr {
    terms: BTreeMap<Var, i64>,
    constant: i64,
}

impl AffineExpr {
    pub fn constant(c: i64) -> Self {
        AffineExpr { terms: BTreeMap::new(), constant: c }
    }

    pub fn iv(l: LoopId) -> Self {
        Self::var(Var::Iv(l))
    }

    pub fn sym(s: u32) -> Self {
        Self::var(Var::Sym(s))
    }

    pub fn var(v: Var) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(v, 1);
        AffineExpr { terms, constant: 0 }
    }

    /// Coefficient of `v`, zero when absent.
    pub fn coeff(&self, v: Var) -> i64 {
        self.terms.get(&v).copied().unwrap_or(0)
    }

    pub fn constant_term(&self) -> i64 {
        self.constant
    }

    /// `Some(c)` when the expression has no variable terms.
    pub fn as_constant(&self) -> Option<i64> {
        self.terms.is_empty().then_some(self.constant)
    }

    pub fn uses(&self, v: Var) -> bool {
        self.terms.contains_key(&v)
    }

    pub fn vars(&self) -> impl Iterator<Item = (Var, i64)> + '_ {
        self.terms.iter().map(|(&v, &c)| (v, c))
    }

    pub fn add(&self, other: &AffineExpr) -> AffineExpr {
        let mut out = self.clone();
        out.constant += other.constant;
        for (&v, &c) in &other.terms {
            out.add_term(v, c);
        }
        out
    }

    pub fn sub(&self, other: &AffineExpr) -> AffineExpr {
        self.add(&other.clone().scale(-1))
    }

    pub fn add_const(mut self, c: i64) -> AffineExpr {
        self.constant += c;
        self
    }

    pub fn scale(mut self, k: i64) -> AffineExpr {
        if k == 0 {
            return AffineExpr::constant(0);
        }
        self.constant *= k;
        for c in self.terms.values_mut() {
            *c *= k;
        }
        self
    }

    /// Replace every occurrence of `v` with `repl`:
    /// `expr - coeff(v)*v + coeff(v)*repl`.
    pub fn substitute(&self, v: Var, repl: &AffineExpr) -> AffineExpr {
        let c = self.coeff(v);
        if c == 0 {
            return self.clone();
        }
        let mut out = self.clone();
        out.terms.remove(&v);
        out.add(&repl.clone().scale(c))
    }

    /// Evaluate under an environment mapping variables to values.
    pub fn eval(&self, mut lookup: impl FnMut(Var) -> i64) -> i64 {
        let mut acc = self.constant;
        for (&v, &c) in &self.terms {
            acc += c * lookup(v);
        }
        acc
    }

    fn add_term(&mut self, v: Var, c: i64) {
        let entry = self.terms.entry(v).or_insert(0);
        *entry += c;
        if *entry == 0 {
            self.terms.remove(&v);
        }
    }
}

/// One physical dimension of a [`LayoutMap`], as a function of the logical
/// index tuple. `FloorDiv`/`Mod` divisors are always positive constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutExpr {
    /// The `d`-th logical index.
    Dim(usize),
    Const(i64),
    FloorDiv(Box<LayoutExpr>, i64),
    Mod(Box<LayoutExpr>, i64),
}

impl LayoutExpr {
    pub fn eval(&self, logical: &[i64]) -> i64 {
        match self {
            LayoutExpr::Dim(d) => logical[*d],
            LayoutExpr::Const(c) => *c,
            LayoutExpr::FloorDiv(e, k) => e.eval(logical).div_euclid(*k),
            LayoutExpr::Mod(e, k) => e.eval(logical).rem_euclid(*k),
        }
    }

    /// Maximum value over the logical box `[0, extents)`.
    ///
    /// All layout expressions we generate are monotone in each logical index,
    /// so evaluating bounds dimension-wise is exact.
    pub fn max_over(&self, extents: &[i64]) -> i64 {
        match self {
            LayoutExpr::Dim(d) => extents[*d] - 1,
            LayoutExpr::Const(c) => *c,
            LayoutExpr::FloorDiv(e, k) => e.max_over(extents).div_euclid(*k),
            LayoutExpr::Mod(e, k) => e.max_over(extents).min(*k - 1),
        }
    }
}

/// Affine map from a logical index tuple to a physical one, stored
/// row-major. Attached to packed buffers whose storage order differs from
/// their logical indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutMap {
    pub dims: Vec<LayoutExpr>,
}

impl LayoutMap {
    /// The LHS packing remap: `(i, j) -> (i / block, j, i mod block)`,
    /// reorganizing rows into contiguous `block`-row panels.
    pub fn row_panels(block: i64) -> LayoutMap {
        LayoutMap {
            dims: vec![
                LayoutExpr::FloorDiv(Box::new(LayoutExpr::Dim(0)), block),
                LayoutExpr::Dim(1),
                LayoutExpr::Mod(Box::new(LayoutExpr::Dim(0)), block),
            ],
        }
    }

    pub fn eval(&self, logical: &[i64]) -> Vec<i64> {
        self.dims.iter().map(|e| e.eval(logical)).collect()
    }

    /// Physical shape covering the logical box `[0, extents)`.
    pub fn physical_shape(&self, extents: &[i64]) -> Vec<i64> {
        self.dims.iter().map(|e| e.max_over(extents) + 1).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(n: u32) -> Var {
        Var::Iv(LoopId(n))
    }

    #[test]
    fn test_linear_arithmetic() {
        let e = AffineExpr::iv(LoopId(0))
            .scale(3)
            .add(&AffineExpr::iv(LoopId(1)))
            .add_const(7);
        assert_eq!(e.coeff(iv(0)), 3);
        assert_eq!(e.coeff(iv(1)), 1);
        assert_eq!(e.constant_term(), 7);
        assert_eq!(e.as_constant(), None);

        let d = e.sub(&AffineExpr::iv(LoopId(1)));
        assert_eq!(d.coeff(iv(1)), 0);
        assert!(!d.uses(iv(1)));
    }

    #[test]
    fn test_substitute() {
        // 2*i + j, with i := k + 5 -> 2*k + j + 10
        let e = AffineExpr::iv(LoopId(0)).scale(2).add(&AffineExpr::iv(LoopId(1)));
        let repl = AffineExpr::iv(LoopId(2)).add_const(5);
        let s = e.substitute(iv(0), &repl);
        assert_eq!(s.coeff(iv(0)), 0);
        assert_eq!(s.coeff(iv(2)), 2);
        assert_eq!(s.coeff(iv(1)), 1);
        assert_eq!(s.constant_term(), 10);
    }

    #[test]
    fn test_eval() {
        let e = AffineExpr::iv(LoopId(0)).scale(4).add_const(-3);
        assert_eq!(e.eval(|_| 10), 37);
    }

    #[test]
    fn test_row_panel_layout() {
        let map = LayoutMap::row_panels(4);
        assert_eq!(map.eval(&[0, 0]), vec![0, 0, 0]);
        assert_eq!(map.eval(&[5, 2]), vec![1, 2, 1]);
        assert_eq!(map.eval(&[7, 9]), vec![1, 9, 3]);
        // 8 rows of 16 columns in panels of 4 rows -> (2, 16, 4)
        assert_eq!(map.physical_shape(&[8, 16]), vec![2, 16, 4]);
        // Fewer rows than the panel height still allocates one full panel row.
        assert_eq!(map.physical_shape(&[3, 16]), vec![1, 16, 3]);
    }
}

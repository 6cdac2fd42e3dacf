//! Reference evaluator for the loop-nest IR.
//!
//! Executes a `Function` over concrete buffer contents so tests can check
//! that a rewrite preserved the numeric result, not just the structure.
//! Vector-element buffers are evaluated lane-wise: a load moves `lanes`
//! consecutive scalars, a scalar load inside a vector context broadcasts.
//!
//! Errors are plain `String`s — this is a validation harness, not part of
//! the transformation's error model.

use std::collections::HashMap;

use crate::ir::{AffineExpr, Buffer, BufferId, Expr, Function, Stmt, Var};

pub struct Evaluator<'f> {
    func: &'f Function,
    data: HashMap<BufferId, Vec<f64>>,
    env: HashMap<Var, i64>,
}

impl<'f> Evaluator<'f> {
    /// Allocate zeroed storage (physical footprint) for every buffer.
    pub fn new(func: &'f Function) -> Self {
        let data = func
            .buffers
            .iter()
            .map(|b| (b.id, vec![0.0; b.size_elems()]))
            .collect();
        Evaluator { func, data, env: HashMap::new() }
    }

    pub fn set_input(&mut self, id: BufferId, values: Vec<f64>) -> Result<(), String> {
        let buf = self.func.buffers.get(id);
        if values.len() != buf.size_elems() {
            return Err(format!(
                "buffer `{}` holds {} elements, got {}",
                buf.name,
                buf.size_elems(),
                values.len()
            ));
        }
        self.data.insert(id, values);
        Ok(())
    }

    pub fn set_sym(&mut self, sym: u32, value: i64) {
        self.env.insert(Var::Sym(sym), value);
    }

    pub fn buffer(&self, id: BufferId) -> &[f64] {
        &self.data[&id]
    }

    pub fn run(&mut self) -> Result<(), String> {
        let func = self.func;
        for stmt in &func.body {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &'f Stmt) -> Result<(), String> {
        match stmt {
            Stmt::Loop(l) => {
                let lb = self.eval_index(&l.lower)?;
                let ub = self.eval_index(&l.upper)?;
                let mut v = lb;
                while v < ub {
                    self.env.insert(Var::Iv(l.id), v);
                    for s in &l.body {
                        self.exec_stmt(s)?;
                    }
                    v += l.step;
                }
                self.env.remove(&Var::Iv(l.id));
                Ok(())
            }
            Stmt::Store { buffer, indices, value } => {
                let buf = self.func.buffers.get(*buffer);
                let lanes = buf.elem.lanes();
                let values = self.eval_value(value, lanes)?;
                let base = self.linearize(buf, indices, lanes)?;
                let storage = self
                    .data
                    .get_mut(buffer)
                    .ok_or_else(|| format!("no storage for buffer `{}`", buf.name))?;
                storage[base..base + lanes].copy_from_slice(&values);
                Ok(())
            }
        }
    }

    fn eval_value(&self, expr: &Expr, lanes: usize) -> Result<Vec<f64>, String> {
        match expr {
            Expr::Const(c) => Ok(vec![*c; lanes]),
            Expr::Load { buffer, indices } => {
                let buf = self.func.buffers.get(*buffer);
                let own = buf.elem.lanes();
                let base = self.linearize(buf, indices, own)?;
                let slice = &self.data[buffer][base..base + own];
                if own == lanes {
                    Ok(slice.to_vec())
                } else if own == 1 {
                    // Scalar operand broadcast across the vector lanes.
                    Ok(vec![slice[0]; lanes])
                } else {
                    Err(format!(
                        "lane mismatch: `{}` has {own} lanes in a {lanes}-lane context",
                        buf.name
                    ))
                }
            }
            Expr::Add(a, b) => self.zip_with(a, b, lanes, |x, y| x + y),
            Expr::Mul(a, b) => self.zip_with(a, b, lanes, |x, y| x * y),
        }
    }

    fn zip_with(
        &self,
        a: &Expr,
        b: &Expr,
        lanes: usize,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Vec<f64>, String> {
        let va = self.eval_value(a, lanes)?;
        let vb = self.eval_value(b, lanes)?;
        Ok(va.into_iter().zip(vb).map(|(x, y)| f(x, y)).collect())
    }

    fn eval_index(&self, expr: &AffineExpr) -> Result<i64, String> {
        let mut missing = None;
        let value = expr.eval(|v| match self.env.get(&v) {
            Some(&x) => x,
            None => {
                missing = Some(v);
                0
            }
        });
        match missing {
            Some(v) => Err(format!("unbound variable {v:?} in index expression")),
            None => Ok(value),
        }
    }

    /// Row-major linear offset of a logical index tuple, through the layout
    /// map when the buffer carries one. The access must fit: `lanes`
    /// consecutive scalars starting at the offset.
    fn linearize(
        &self,
        buf: &Buffer,
        indices: &[AffineExpr],
        lanes: usize,
    ) -> Result<usize, String> {
        if indices.len() != buf.shape.len() {
            return Err(format!(
                "rank mismatch on `{}`: {} indices for rank {}",
                buf.name,
                indices.len(),
                buf.shape.len()
            ));
        }
        let logical: Vec<i64> =
            indices.iter().map(|e| self.eval_index(e)).collect::<Result<_, _>>()?;

        let (tuple, shape) = match &buf.layout {
            Some(map) => (map.eval(&logical), buf.physical_shape()),
            None => (logical, buf.shape.clone()),
        };
        let mut offset = 0i64;
        for (d, (&x, &extent)) in tuple.iter().zip(&shape).enumerate() {
            if x < 0 || x >= extent {
                return Err(format!(
                    "index {x} out of bounds for dimension {d} of `{}` (extent {extent})",
                    buf.name
                ));
            }
            offset = offset * extent + x;
        }
        let base = offset as usize;
        if base + lanes > buf.size_elems() {
            return Err(format!("vector access past the end of `{}`", buf.name));
        }
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemType, LayoutMap, MemSpace, ScalarType};

    #[test]
    fn test_scalar_copy_loop() {
        let mut f = Function::new("t");
        let elem = ElemType::Scalar(ScalarType::F64);
        let src = f.buffers.alloc("src", elem, vec![4], MemSpace::Global);
        let dst = f.buffers.alloc("dst", elem, vec![4], MemSpace::Global);
        let mut l = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(4), 1);
        let i = l.iv_expr();
        l.body.push(Stmt::Store {
            buffer: dst,
            indices: vec![i.clone()],
            value: Expr::Load { buffer: src, indices: vec![i] },
        });
        f.body.push(Stmt::Loop(l));

        let mut ev = Evaluator::new(&f);
        ev.set_input(src, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        ev.run().unwrap();
        assert_eq!(ev.buffer(dst), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_symbolic_bound_from_environment() {
        // for i in 0..n { dst[i] = src[i] } with n supplied at run time.
        let mut f = Function::new("t");
        let elem = ElemType::Scalar(ScalarType::F64);
        let src = f.buffers.alloc("src", elem, vec![4], MemSpace::Global);
        let dst = f.buffers.alloc("dst", elem, vec![4], MemSpace::Global);
        let mut l = f.fresh_loop(AffineExpr::constant(0), AffineExpr::sym(0), 1);
        let i = l.iv_expr();
        l.body.push(Stmt::Store {
            buffer: dst,
            indices: vec![i.clone()],
            value: Expr::Load { buffer: src, indices: vec![i] },
        });
        f.body.push(Stmt::Loop(l));

        let mut ev = Evaluator::new(&f);
        ev.set_input(src, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        ev.set_sym(0, 3);
        ev.run().unwrap();
        assert_eq!(ev.buffer(dst), &[1.0, 2.0, 3.0, 0.0]);

        // Without the binding the bound is unevaluable.
        let mut unbound = Evaluator::new(&f);
        assert!(unbound.run().is_err());
    }

    #[test]
    fn test_layout_mapped_store() {
        // dst has the (i/2, j, i%2) panel layout; a plain element-wise copy
        // must land values at remapped physical offsets.
        let mut f = Function::new("t");
        let elem = ElemType::Scalar(ScalarType::F64);
        let src = f.buffers.alloc("src", elem, vec![4, 2], MemSpace::Global);
        let dst = f.buffers.alloc("dst", elem, vec![4, 2], MemSpace::Scratch);
        f.buffers.get_mut(dst).layout = Some(LayoutMap::row_panels(2));

        let mut li = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(4), 1);
        let mut lj = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(2), 1);
        let (i, j) = (li.iv_expr(), lj.iv_expr());
        lj.body.push(Stmt::Store {
            buffer: dst,
            indices: vec![i.clone(), j.clone()],
            value: Expr::Load { buffer: src, indices: vec![i, j] },
        });
        li.body.push(Stmt::Loop(lj));
        f.body.push(Stmt::Loop(li));

        let mut ev = Evaluator::new(&f);
        ev.set_input(src, (0..8).map(f64::from).collect()).unwrap();
        ev.run().unwrap();
        // Physical order (i/2, j, i%2): panel 0 holds rows 0-1 interleaved
        // by column, panel 1 rows 2-3.
        assert_eq!(ev.buffer(dst), &[0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
    }

    #[test]
    fn test_vector_store_with_broadcast() {
        let mut f = Function::new("t");
        let scalar = ElemType::Scalar(ScalarType::F64);
        let vec4 = ElemType::Vector { scalar: ScalarType::F64, lanes: 4 };
        let a = f.buffers.alloc("a", scalar, vec![1], MemSpace::Global);
        let b = f.buffers.alloc("b", vec4, vec![8], MemSpace::Global);
        let c = f.buffers.alloc("c", vec4, vec![8], MemSpace::Global);

        let mut l = f.fresh_loop(AffineExpr::constant(0), AffineExpr::constant(8), 4);
        let i = l.iv_expr();
        l.body.push(Stmt::Store {
            buffer: c,
            indices: vec![i.clone()],
            value: Expr::Mul(
                Box::new(Expr::Load { buffer: b, indices: vec![i] }),
                Box::new(Expr::Load { buffer: a, indices: vec![AffineExpr::constant(0)] }),
            ),
        });
        f.body.push(Stmt::Loop(l));

        let mut ev = Evaluator::new(&f);
        ev.set_input(a, vec![2.0]).unwrap();
        ev.set_input(b, (0..8).map(f64::from).collect()).unwrap();
        ev.run().unwrap();
        assert_eq!(ev.buffer(c), &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
    }
}

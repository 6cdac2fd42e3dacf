//! Loop-nest IR — the tree the BLIS rewrite operates on.
//!
//! A [`Function`] owns a list of top-level statements, a buffer table, and a
//! loop-id allocator. Loops form a tree of [`Stmt`]s; buffer data is only
//! touched through `Load`/`Store`, and every index is an [`AffineExpr`] over
//! enclosing induction variables and symbolic parameters.
//!
//! Loops carry two kinds of symbolic marking produced by the upstream tiling
//! stage: a [`Role`] tag placing the loop in the canonical blocked matmul
//! schedule, and a [`NestClass`] on the root loop of an eligible nest. Tag
//! lookup replaces positional/depth matching on purpose — tile sizes can make
//! individual loops degenerate and disappear, which would shift depths.

pub mod expr;

pub use expr::{AffineExpr, LayoutExpr, LayoutMap, Var};

// ── Identifiers ────────────────────────────────────────────────────

/// Unique loop identifier within a Function. Doubles as the identity of the
/// loop's induction variable (`Var::Iv`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub u32);

/// Unique buffer identifier within a Function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

// ── Element types and buffers ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    F32,
    F64,
}

impl ScalarType {
    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

/// Element type of a buffer.
///
/// A `Vector` buffer keeps its shape and indexing in *scalar* units: an
/// access at index `x` in the vectorized (last) dimension moves `lanes`
/// consecutive scalars starting at `x`. This keeps index expressions linear
/// across vectorization; only the buffer identity and the loop step change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    Scalar(ScalarType),
    Vector { scalar: ScalarType, lanes: usize },
}

impl ElemType {
    pub fn scalar(self) -> ScalarType {
        match self {
            ElemType::Scalar(s) | ElemType::Vector { scalar: s, .. } => s,
        }
    }

    /// Scalars moved per access: 1 for scalar buffers, `lanes` for vector.
    pub fn lanes(self) -> usize {
        match self {
            ElemType::Scalar(_) => 1,
            ElemType::Vector { lanes, .. } => lanes,
        }
    }

    pub fn is_vector(self) -> bool {
        matches!(self, ElemType::Vector { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSpace {
    /// Externally provided storage (function operands).
    Global,
    /// Pass-allocated staging storage with a capacity ceiling.
    Scratch,
}

/// An array abstraction accessed only through `Load`/`Store`.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub id: BufferId,
    pub name: String,
    pub elem: ElemType,
    /// Logical extents, in scalar units.
    pub shape: Vec<i64>,
    pub space: MemSpace,
    /// Physical storage order when it differs from row-major logical order.
    pub layout: Option<LayoutMap>,
    /// Alignment attribute in bytes, when one has been forced.
    pub alignment: Option<u32>,
    /// Capacity ceiling (bytes) a scratch buffer was allocated under.
    pub capacity_limit: Option<usize>,
}

impl Buffer {
    /// Physical extents: through the layout map when present, logical
    /// row-major otherwise.
    pub fn physical_shape(&self) -> Vec<i64> {
        match &self.layout {
            Some(map) => map.physical_shape(&self.shape),
            None => self.shape.clone(),
        }
    }

    pub fn size_elems(&self) -> usize {
        self.physical_shape().iter().product::<i64>().max(0) as usize
    }

    pub fn size_bytes(&self) -> usize {
        self.size_elems() * self.elem.scalar().size_bytes()
    }
}

/// Buffer arena. Ids are dense indices into the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferTable {
    bufs: Vec<Buffer>,
}

impl BufferTable {
    pub fn alloc(
        &mut self,
        name: impl Into<String>,
        elem: ElemType,
        shape: Vec<i64>,
        space: MemSpace,
    ) -> BufferId {
        let id = BufferId(self.bufs.len() as u32);
        self.bufs.push(Buffer {
            id,
            name: name.into(),
            elem,
            shape,
            space,
            layout: None,
            alignment: None,
            capacity_limit: None,
        });
        id
    }

    pub fn get(&self, id: BufferId) -> &Buffer {
        &self.bufs[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.bufs[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.bufs.iter()
    }
}

// ── Loop marking ───────────────────────────────────────────────────

/// Position of a loop in the canonical blocked matmul schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Cache-level blocking loops.
    IC,
    JC,
    KC,
    /// Register-tile panel loop (N_R panels).
    JR,
    /// Intra-register-tile loops.
    JJR,
    IIR,
    /// Innermost reduction loop.
    K,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::IC => "iC",
            Role::JC => "jC",
            Role::KC => "kC",
            Role::JR => "jR",
            Role::JJR => "jjR",
            Role::IIR => "iiR",
            Role::K => "k",
        }
    }
}

/// Class marker on the root loop of a nest eligible for a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestClass {
    Matmul,
}

/// Per-nest tile parameter annotations. Any `None` falls back to the
/// default configuration table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileOverrides {
    pub m_c: Option<i64>,
    pub n_c: Option<i64>,
    pub k_c: Option<i64>,
    pub m_r: Option<i64>,
    pub n_r: Option<i64>,
    pub k_u: Option<i64>,
}

// ── Statements and expressions ─────────────────────────────────────

/// Right-hand-side value expression. Loads are the only way buffer data
/// enters a computation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    Load { buffer: BufferId, indices: Vec<AffineExpr> },
    Add(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Loop(Loop),
    Store { buffer: BufferId, indices: Vec<AffineExpr>, value: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub id: LoopId,
    /// Inclusive lower bound.
    pub lower: AffineExpr,
    /// Exclusive upper bound.
    pub upper: AffineExpr,
    pub step: i64,
    pub body: Vec<Stmt>,
    pub role: Option<Role>,
    pub class: Option<NestClass>,
    pub tiles: TileOverrides,
}

impl Loop {
    /// The induction variable of this loop.
    pub fn iv(&self) -> Var {
        Var::Iv(self.id)
    }

    pub fn iv_expr(&self) -> AffineExpr {
        AffineExpr::iv(self.id)
    }

    /// Constant trip count, when both bounds are constant.
    pub fn trip_count(&self) -> Option<i64> {
        let lb = self.lower.as_constant()?;
        let ub = self.upper.as_constant()?;
        if ub <= lb {
            return Some(0);
        }
        Some((ub - lb + self.step - 1) / self.step)
    }
}

/// Allocator for fresh loop ids. Rewrites that create loops (packing copy
/// nests, unroll remainder loops) draw from here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopIdGen {
    next: u32,
}

impl LoopIdGen {
    pub fn fresh(&mut self) -> LoopId {
        let id = LoopId(self.next);
        self.next += 1;
        id
    }
}

/// One function body: the unit the driver scans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Function {
    pub name: String,
    pub body: Vec<Stmt>,
    pub buffers: BufferTable,
    pub loop_ids: LoopIdGen,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Function { name: name.into(), ..Default::default() }
    }

    /// Convenience builder: a fresh untagged loop with the given bounds.
    pub fn fresh_loop(&mut self, lower: AffineExpr, upper: AffineExpr, step: i64) -> Loop {
        Loop {
            id: self.loop_ids.fresh(),
            lower,
            upper,
            step,
            body: Vec::new(),
            role: None,
            class: None,
            tiles: TileOverrides::default(),
        }
    }
}

// ── Traversal utilities ────────────────────────────────────────────

/// Deterministic preorder over statements: each statement before its loop
/// body, in statement order.
pub fn visit_stmts<'a>(body: &'a [Stmt], f: &mut impl FnMut(&'a Stmt)) {
    for stmt in body {
        f(stmt);
        if let Stmt::Loop(l) = stmt {
            visit_stmts(&l.body, f);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
}

impl Expr {
    /// Visit every load in this expression, left to right.
    pub fn visit_loads(&self, f: &mut impl FnMut(BufferId, &[AffineExpr])) {
        match self {
            Expr::Const(_) => {}
            Expr::Load { buffer, indices } => f(*buffer, indices),
            Expr::Add(a, b) | Expr::Mul(a, b) => {
                a.visit_loads(f);
                b.visit_loads(f);
            }
        }
    }

    fn visit_loads_mut(&mut self, f: &mut impl FnMut(&mut BufferId, &mut Vec<AffineExpr>)) {
        match self {
            Expr::Const(_) => {}
            Expr::Load { buffer, indices } => f(buffer, indices),
            Expr::Add(a, b) | Expr::Mul(a, b) => {
                a.visit_loads_mut(f);
                b.visit_loads_mut(f);
            }
        }
    }
}

/// Visit every buffer access under `body` in preorder; stores are visited
/// before the loads of their value expression.
pub fn visit_accesses(
    body: &[Stmt],
    f: &mut impl FnMut(AccessKind, BufferId, &[AffineExpr]),
) {
    for stmt in body {
        match stmt {
            Stmt::Loop(l) => visit_accesses(&l.body, f),
            Stmt::Store { buffer, indices, value } => {
                f(AccessKind::Store, *buffer, indices);
                value.visit_loads(&mut |b, idx| f(AccessKind::Load, b, idx));
            }
        }
    }
}

/// Mutable access traversal; used by the vectorizer and the packing engine
/// to retarget accesses to replacement buffers.
pub fn visit_accesses_mut(
    body: &mut [Stmt],
    f: &mut impl FnMut(AccessKind, &mut BufferId, &mut Vec<AffineExpr>),
) {
    for stmt in body {
        match stmt {
            Stmt::Loop(l) => visit_accesses_mut(&mut l.body, f),
            Stmt::Store { buffer, indices, value } => {
                f(AccessKind::Store, buffer, indices);
                value.visit_loads_mut(&mut |b, idx| f(AccessKind::Load, b, idx));
            }
        }
    }
}

/// Substitute `v := repl` through a whole statement subtree, including
/// nested loop bounds. The workhorse of unrolling.
pub fn substitute_stmt(stmt: &Stmt, v: Var, repl: &AffineExpr) -> Stmt {
    match stmt {
        Stmt::Loop(l) => Stmt::Loop(Loop {
            id: l.id,
            lower: l.lower.substitute(v, repl),
            upper: l.upper.substitute(v, repl),
            step: l.step,
            body: l.body.iter().map(|s| substitute_stmt(s, v, repl)).collect(),
            role: l.role,
            class: l.class,
            tiles: l.tiles,
        }),
        Stmt::Store { buffer, indices, value } => Stmt::Store {
            buffer: *buffer,
            indices: indices.iter().map(|e| e.substitute(v, repl)).collect(),
            value: substitute_expr(value, v, repl),
        },
    }
}

fn substitute_expr(expr: &Expr, v: Var, repl: &AffineExpr) -> Expr {
    match expr {
        Expr::Const(c) => Expr::Const(*c),
        Expr::Load { buffer, indices } => Expr::Load {
            buffer: *buffer,
            indices: indices.iter().map(|e| e.substitute(v, repl)).collect(),
        },
        Expr::Add(a, b) => Expr::Add(
            Box::new(substitute_expr(a, v, repl)),
            Box::new(substitute_expr(b, v, repl)),
        ),
        Expr::Mul(a, b) => Expr::Mul(
            Box::new(substitute_expr(a, v, repl)),
            Box::new(substitute_expr(b, v, repl)),
        ),
    }
}

//! An arena-backed IR for buffer-level linear-algebra programs.
//!
//! Operations and values live in per-[Function] arenas and are referred to by
//! stable integer handles ([OpId], [ValueId]). Replacing an operation never
//! mutates shared state in place: new operations are appended to the arena,
//! operand handles pointing at the old result are retargeted, and the old
//! record is marked dead.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt;

use crate::common::{volume, DimSize, Dtype, MemorySpace, Shape};
use crate::stage::Stage;

pub mod builder;
pub mod printer;

pub use builder::{InsertionPoint, Rewriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Index,
    MemRef(MemRefType),
}

impl Type {
    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            Type::MemRef(m) => Some(m),
            Type::Index => None,
        }
    }
}

/// The per-dimension index mapping of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Layout {
    /// Row-major, contiguous, zero offset.
    Identity,
    /// An explicit offset (`None` when only known at run time) and strides.
    Strided {
        offset: Option<i64>,
        strides: SmallVec<[i64; 4]>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemRefType {
    pub shape: Shape,
    pub dtype: Dtype,
    pub layout: Layout,
    pub space: MemorySpace,
}

impl MemRefType {
    pub fn new(shape: &[DimSize], dtype: Dtype) -> Self {
        MemRefType {
            shape: Shape::from(shape),
            dtype,
            layout: Layout::Identity,
            space: MemorySpace::Global,
        }
    }

    #[must_use]
    pub fn in_space(mut self, space: MemorySpace) -> Self {
        self.space = space;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Element strides of each dimension.
    pub fn strides(&self) -> SmallVec<[i64; 4]> {
        match &self.layout {
            Layout::Identity => row_major_strides(&self.shape),
            Layout::Strided { strides, .. } => strides.clone(),
        }
    }

    /// The statically-known element offset of the first element, if any.
    pub fn offset(&self) -> Option<i64> {
        match &self.layout {
            Layout::Identity => Some(0),
            Layout::Strided { offset, .. } => *offset,
        }
    }

    pub fn bytes(&self) -> i64 {
        volume(&self.shape) * i64::from(self.dtype.size())
    }
}

pub fn row_major_strides(shape: &[DimSize]) -> SmallVec<[i64; 4]> {
    let mut strides: SmallVec<[i64; 4]> = smallvec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// One per-dimension offset slot of a sub-view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Offset {
    Static(i64),
    /// Supplied at run time by the next unconsumed dynamic offset operand.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubViewAttrs {
    pub offsets: SmallVec<[Offset; 4]>,
    pub sizes: Shape,
    pub strides: SmallVec<[i64; 4]>,
}

impl SubViewAttrs {
    /// A window of `sizes` at the origin with unit strides.
    pub fn origin(sizes: &[DimSize]) -> Self {
        SubViewAttrs {
            offsets: sizes.iter().map(|_| Offset::Static(0)).collect(),
            sizes: Shape::from(sizes),
            strides: smallvec![1; sizes.len()],
        }
    }

    pub fn dynamic_count(&self) -> usize {
        self.offsets
            .iter()
            .filter(|o| matches!(o, Offset::Dynamic))
            .count()
    }

    /// The type of a sub-view with these attributes over a buffer of type `source`.
    pub fn result_type(&self, source: &MemRefType) -> MemRefType {
        let source_strides = source.strides();
        let strides = source_strides
            .iter()
            .zip(&self.strides)
            .map(|(a, b)| a * b)
            .collect::<SmallVec<[i64; 4]>>();
        let offset = source.offset().and_then(|base| {
            self.offsets
                .iter()
                .zip(&source_strides)
                .try_fold(base, |acc, (o, s)| match o {
                    Offset::Static(v) => Some(acc + v * s),
                    Offset::Dynamic => None,
                })
        });
        MemRefType {
            shape: self.sizes.clone(),
            dtype: source.dtype,
            layout: Layout::Strided { offset, strides },
            space: source.space,
        }
    }
}

/// A single static loop dimension `lb..ub` stepping by `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct LoopDim {
    pub lb: i64,
    pub ub: i64,
    pub step: i64,
}

impl LoopDim {
    pub fn new(lb: i64, ub: i64, step: i64) -> Self {
        debug_assert!(step > 0);
        LoopDim { lb, ub, step }
    }

    pub fn trip_count(&self) -> i64 {
        if self.ub <= self.lb {
            0
        } else {
            divrem::DivCeil::div_ceil(self.ub - self.lb, self.step)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// An index constant.
    Constant(i64),
    /// Index addition.
    AddI,
    Alloc,
    Dealloc,
    /// Reinterprets a byte buffer as a typed buffer.
    View,
    SubView(SubViewAttrs),
    /// Copies operand 0 into operand 1.
    Copy,
    Matmul,
    Conv2dNchw,
    For(LoopDim),
    Parallel(SmallVec<[LoopDim; 3]>),
    Call(String),
    Return,
}

impl OpKind {
    pub fn is_linalg(&self) -> bool {
        matches!(self, OpKind::Matmul | OpKind::Conv2dNchw | OpKind::Copy)
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, OpKind::For(_) | OpKind::Parallel(_))
    }

    /// Whether the op may be erased once its result has no uses.
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            OpKind::Constant(_) | OpKind::AddI | OpKind::Alloc | OpKind::View | OpKind::SubView(_)
        )
    }

    pub fn loop_dims(&self) -> &[LoopDim] {
        match self {
            OpKind::For(d) => std::slice::from_ref(d),
            OpKind::Parallel(ds) => ds,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub operands: SmallVec<[ValueId; 4]>,
    pub result: Option<ValueId>,
    /// Position in the tiling/promotion pipeline, if the op is in one.
    pub marker: Option<Stage>,
    /// Body of a loop.
    pub region: Vec<OpId>,
    /// Induction variables of a loop, one per loop dimension.
    pub region_args: SmallVec<[ValueId; 3]>,
    parent: Option<OpId>,
    live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Argument(usize),
    OpResult(OpId),
    InductionVar(OpId, usize),
}

#[derive(Debug, Clone)]
struct ValueInfo {
    ty: Type,
    def: ValueDef,
}

/// A procedure: an ordered top-level body and the arenas owning every
/// operation and value reachable from it.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    ops: Vec<Operation>,
    values: Vec<ValueInfo>,
    args: Vec<ValueId>,
    body: Vec<OpId>,
}

impl Function {
    pub fn new<I>(name: impl Into<String>, arg_types: I) -> Self
    where
        I: IntoIterator<Item = Type>,
    {
        let mut f = Function {
            name: name.into(),
            ops: vec![],
            values: vec![],
            args: vec![],
            body: vec![],
        };
        for (i, ty) in arg_types.into_iter().enumerate() {
            let v = f.new_value(ty, ValueDef::Argument(i));
            f.args.push(v);
        }
        f
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    pub fn body(&self) -> &[OpId] {
        &self.body
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.index()]
    }

    pub fn is_live(&self, id: OpId) -> bool {
        self.ops[id.index()].live
    }

    pub fn parent(&self, id: OpId) -> Option<OpId> {
        self.ops[id.index()].parent
    }

    pub fn value_type(&self, v: ValueId) -> &Type {
        &self.values[v.index()].ty
    }

    pub fn memref_type(&self, v: ValueId) -> Option<&MemRefType> {
        self.value_type(v).as_memref()
    }

    pub fn value_def(&self, v: ValueId) -> ValueDef {
        self.values[v.index()].def
    }

    /// The live operation producing `v`, if `v` is an operation result.
    pub fn defining_op(&self, v: ValueId) -> Option<OpId> {
        match self.value_def(v) {
            ValueDef::OpResult(op) if self.is_live(op) => Some(op),
            _ => None,
        }
    }

    pub fn defining_kind(&self, v: ValueId) -> Option<&OpKind> {
        self.defining_op(v).map(|op| &self.op(op).kind)
    }

    /// The op's result; panics if the op produces no value.
    pub fn result(&self, op: OpId) -> ValueId {
        self.op(op)
            .result
            .unwrap_or_else(|| panic!("{op:?} has no result"))
    }

    /// All live operations in pre-order (parents before the ops in their bodies).
    pub fn walk(&self) -> Vec<OpId> {
        let mut out = Vec::with_capacity(self.ops.len());
        self.walk_region(&self.body, &mut out);
        out
    }

    fn walk_region(&self, region: &[OpId], out: &mut Vec<OpId>) {
        for &op in region {
            out.push(op);
            self.walk_region(&self.op(op).region, out);
        }
    }

    /// Live operations satisfying `pred`, in pre-order.
    pub fn collect_ops<F>(&self, mut pred: F) -> Vec<OpId>
    where
        F: FnMut(&Operation) -> bool,
    {
        self.walk()
            .into_iter()
            .filter(|&op| pred(self.op(op)))
            .collect()
    }

    /// Every `(user, operand position)` pair referencing `v`.
    pub fn uses(&self, v: ValueId) -> Vec<(OpId, usize)> {
        self.walk()
            .into_iter()
            .flat_map(|op| {
                self.op(op)
                    .operands
                    .iter()
                    .enumerate()
                    .filter(move |(_, o)| **o == v)
                    .map(move |(i, _)| (op, i))
            })
            .collect()
    }

    pub fn has_uses(&self, v: ValueId) -> bool {
        self.walk()
            .into_iter()
            .any(|op| self.op(op).operands.contains(&v))
    }

    /// Retargets every operand handle referencing `old` to `new`. Returns the
    /// number of retargeted operands.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut count = 0;
        for op in self.walk() {
            for operand in self.ops[op.index()].operands.iter_mut() {
                if *operand == old {
                    *operand = new;
                    count += 1;
                }
            }
        }
        count
    }

    /// Removes the op's stage marker. Returns the removed marker.
    pub fn strip_marker(&mut self, op: OpId) -> Option<Stage> {
        self.ops[op.index()].marker.take()
    }

    pub(crate) fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(u32::try_from(self.values.len()).expect("too many values"));
        self.values.push(ValueInfo { ty, def });
        id
    }

    /// Appends a record to the arena without placing it in any region.
    pub(crate) fn push_op(
        &mut self,
        kind: OpKind,
        operands: SmallVec<[ValueId; 4]>,
        result_ty: Option<Type>,
        marker: Option<Stage>,
    ) -> OpId {
        let id = OpId(u32::try_from(self.ops.len()).expect("too many operations"));
        let induction_vars = kind.loop_dims().len();
        self.ops.push(Operation {
            kind,
            operands,
            result: None,
            marker,
            region: vec![],
            region_args: SmallVec::new(),
            parent: None,
            live: true,
        });
        if let Some(ty) = result_ty {
            let v = self.new_value(ty, ValueDef::OpResult(id));
            self.ops[id.index()].result = Some(v);
        }
        for i in 0..induction_vars {
            let iv = self.new_value(Type::Index, ValueDef::InductionVar(id, i));
            self.ops[id.index()].region_args.push(iv);
        }
        id
    }

    fn region_mut(&mut self, parent: Option<OpId>) -> &mut Vec<OpId> {
        match parent {
            Some(p) => &mut self.ops[p.index()].region,
            None => &mut self.body,
        }
    }

    pub fn region(&self, parent: Option<OpId>) -> &[OpId] {
        match parent {
            Some(p) => &self.op(p).region,
            None => &self.body,
        }
    }

    fn detach(&mut self, op: OpId) {
        let parent = self.parent(op);
        self.region_mut(parent).retain(|o| *o != op);
    }

    /// Places a detached or attached op immediately before `anchor`.
    pub(crate) fn place_before(&mut self, op: OpId, anchor: OpId) {
        self.detach(op);
        let parent = self.parent(anchor);
        let region = self.region_mut(parent);
        let pos = region
            .iter()
            .position(|o| *o == anchor)
            .expect("anchor must be attached to its parent");
        region.insert(pos, op);
        self.ops[op.index()].parent = parent;
    }

    /// Places a detached or attached op at the end of `parent`'s region.
    pub(crate) fn place_at_end(&mut self, op: OpId, parent: Option<OpId>) {
        self.detach(op);
        self.region_mut(parent).push(op);
        self.ops[op.index()].parent = parent;
    }

    /// Removes the op (and, recursively, its body) from the program.
    pub fn erase_op(&mut self, op: OpId) {
        self.detach(op);
        let mut stack = vec![op];
        while let Some(o) = stack.pop() {
            let record = &mut self.ops[o.index()];
            record.live = false;
            stack.extend(record.region.drain(..));
        }
    }

    /// Erases unused side-effect-free ops until none remain. Returns the
    /// number erased.
    pub fn erase_trivially_dead(&mut self) -> usize {
        let mut erased = 0;
        loop {
            let dead = self
                .walk()
                .into_iter()
                .filter(|&op| {
                    let o = self.op(op);
                    o.kind.is_side_effect_free()
                        && o.result.map_or(true, |r| !self.has_uses(r))
                })
                .collect::<Vec<_>>();
            if dead.is_empty() {
                return erased;
            }
            for op in dead {
                if self.is_live(op) {
                    self.erase_op(op);
                    erased += 1;
                }
            }
        }
    }
}

/// A collection of uniquely-named [Function]s in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: IndexMap<String, Function>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    /// Adds `function`, replacing any function of the same name.
    pub fn add_function(&mut self, function: Function) {
        self.functions.insert(function.name.clone(), function);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.get_mut(name)
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    /// Returns `hint` if unused, otherwise the first free `hint_N`.
    pub fn unique_name(&self, hint: &str) -> String {
        if !self.functions.contains_key(hint) {
            return hint.to_owned();
        }
        (1..)
            .map(|i| format!("{hint}_{i}"))
            .find(|n| !self.functions.contains_key(n))
            .expect("unbounded search")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func) in self.functions.values().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

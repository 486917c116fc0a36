use smallvec::{smallvec, SmallVec};

use crate::ir::{Function, LoopDim, MemRefType, OpId, OpKind, SubViewAttrs, Type, ValueId};
use crate::stage::Stage;

/// Where the [Rewriter] places newly created operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    Before(OpId),
    /// The end of a loop body, or of the function body for `None`.
    End(Option<OpId>),
}

/// Creates, replaces, and erases operations of a [Function].
///
/// Every mutation made by a rewrite rule goes through a [Rewriter], so a rule
/// can only change the program by building new operations and retargeting
/// uses onto them.
pub struct Rewriter<'f> {
    func: &'f mut Function,
    ip: InsertionPoint,
}

impl<'f> Rewriter<'f> {
    /// A rewriter inserting at the end of the function body.
    pub fn new(func: &'f mut Function) -> Self {
        Rewriter {
            func,
            ip: InsertionPoint::End(None),
        }
    }

    pub fn func(&self) -> &Function {
        self.func
    }

    pub fn insertion_point(&self) -> InsertionPoint {
        self.ip
    }

    pub fn set_insertion_point(&mut self, ip: InsertionPoint) {
        self.ip = ip;
    }

    pub fn set_insertion_point_before(&mut self, op: OpId) {
        self.ip = InsertionPoint::Before(op);
    }

    pub fn set_insertion_point_to_end(&mut self, parent: Option<OpId>) {
        self.ip = InsertionPoint::End(parent);
    }

    pub fn insert(
        &mut self,
        kind: OpKind,
        operands: SmallVec<[ValueId; 4]>,
        result_ty: Option<Type>,
        marker: Option<Stage>,
    ) -> OpId {
        let op = self.func.push_op(kind, operands, result_ty, marker);
        match self.ip {
            InsertionPoint::Before(anchor) => self.func.place_before(op, anchor),
            InsertionPoint::End(parent) => self.func.place_at_end(op, parent),
        }
        op
    }

    fn insert_value(
        &mut self,
        kind: OpKind,
        operands: SmallVec<[ValueId; 4]>,
        result_ty: Type,
    ) -> ValueId {
        let op = self.insert(kind, operands, Some(result_ty), None);
        self.func.result(op)
    }

    pub fn constant(&mut self, value: i64) -> ValueId {
        self.insert_value(OpKind::Constant(value), smallvec![], Type::Index)
    }

    pub fn addi(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.insert_value(OpKind::AddI, smallvec![lhs, rhs], Type::Index)
    }

    pub fn alloc(&mut self, ty: MemRefType) -> ValueId {
        self.insert_value(OpKind::Alloc, smallvec![], Type::MemRef(ty))
    }

    pub fn dealloc(&mut self, buffer: ValueId) -> OpId {
        self.insert(OpKind::Dealloc, smallvec![buffer], None, None)
    }

    pub fn view(&mut self, source: ValueId, ty: MemRefType) -> ValueId {
        self.insert_value(OpKind::View, smallvec![source], Type::MemRef(ty))
    }

    /// Creates a sub-view; `dynamic_offsets` fills the [Offset::Dynamic]
    /// slots of `attrs` left to right.
    ///
    /// [Offset::Dynamic]: crate::ir::Offset::Dynamic
    pub fn subview_with_offsets(
        &mut self,
        source: ValueId,
        attrs: SubViewAttrs,
        dynamic_offsets: &[ValueId],
    ) -> ValueId {
        debug_assert_eq!(attrs.dynamic_count(), dynamic_offsets.len());
        let source_ty = self
            .func
            .memref_type(source)
            .expect("sub-view source must be a buffer");
        let ty = attrs.result_type(source_ty);
        let mut operands: SmallVec<[ValueId; 4]> = smallvec![source];
        operands.extend_from_slice(dynamic_offsets);
        self.insert_value(OpKind::SubView(attrs), operands, Type::MemRef(ty))
    }

    pub fn subview(&mut self, source: ValueId, attrs: SubViewAttrs) -> ValueId {
        self.subview_with_offsets(source, attrs, &[])
    }

    pub fn copy(&mut self, source: ValueId, destination: ValueId) -> OpId {
        self.insert(OpKind::Copy, smallvec![source, destination], None, None)
    }

    pub fn for_loop(&mut self, dim: LoopDim) -> (OpId, ValueId) {
        let op = self.insert(OpKind::For(dim), smallvec![], None, None);
        (op, self.func.op(op).region_args[0])
    }

    pub fn parallel(&mut self, dims: SmallVec<[LoopDim; 3]>) -> (OpId, SmallVec<[ValueId; 3]>) {
        let op = self.insert(OpKind::Parallel(dims), smallvec![], None, None);
        (op, self.func.op(op).region_args.clone())
    }

    pub fn call(&mut self, callee: impl Into<String>, args: &[ValueId]) -> OpId {
        self.insert(OpKind::Call(callee.into()), args.into(), None, None)
    }

    pub fn ret(&mut self) -> OpId {
        self.insert(OpKind::Return, smallvec![], None, None)
    }

    /// Moves an existing op to the insertion point.
    pub fn move_op(&mut self, op: OpId) {
        match self.ip {
            InsertionPoint::Before(anchor) => self.func.place_before(op, anchor),
            InsertionPoint::End(parent) => self.func.place_at_end(op, parent),
        }
    }

    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        self.func.replace_all_uses(old, new)
    }

    /// Retargets uses of `op`'s result onto `new_result` and erases `op`.
    pub fn replace_op(&mut self, op: OpId, new_result: Option<ValueId>) {
        if let (Some(old), Some(new)) = (self.func.op(op).result, new_result) {
            self.func.replace_all_uses(old, new);
        }
        self.func.erase_op(op);
    }

    pub fn erase_op(&mut self, op: OpId) {
        self.func.erase_op(op);
    }
}

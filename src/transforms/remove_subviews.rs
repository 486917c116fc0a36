use crate::common::MemorySpace;
use crate::ir::{Function, MemRefType, OpId, OpKind, Rewriter};
use crate::rewrite::{NotApplicableReason, RewritePattern};

/// Collapses `subview(view(alloc))` into a single allocation of the
/// sub-view's shape in `memory_space`.
///
/// Every use of the original allocation is retargeted to the new one; the
/// view and the original allocation are left for dead-code elimination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveSubViews {
    pub memory_space: MemorySpace,
}

impl Default for RemoveSubViews {
    fn default() -> Self {
        RemoveSubViews {
            memory_space: MemorySpace::L1,
        }
    }
}

impl RemoveSubViews {
    fn alloc_of(func: &Function, op: OpId) -> Result<OpId, NotApplicableReason> {
        let o = func.op(op);
        if !matches!(o.kind, OpKind::SubView(_)) {
            return Err(NotApplicableReason::WrongKind);
        }
        let view = func
            .defining_op(o.operands[0])
            .filter(|&v| func.op(v).kind == OpKind::View)
            .ok_or(NotApplicableReason::SourceNotViewOfAlloc)?;
        func.defining_op(func.op(view).operands[0])
            .filter(|&a| func.op(a).kind == OpKind::Alloc)
            .ok_or(NotApplicableReason::SourceNotViewOfAlloc)
    }
}

impl RewritePattern for RemoveSubViews {
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason> {
        Self::alloc_of(func, op).map(|_| ())
    }

    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId) {
        let func = rewriter.func();
        let Ok(alloc) = Self::alloc_of(func, op) else {
            unreachable!("checked by RemoveSubViews::check")
        };
        let old_buffer = func.result(alloc);
        let Some(ty) = func.memref_type(func.result(op)) else {
            unreachable!("sub-views produce buffers")
        };
        let ty = MemRefType::new(&ty.shape, ty.dtype).in_space(self.memory_space);
        let new_buffer = rewriter.alloc(ty);
        rewriter.replace_op(op, Some(new_buffer));
        rewriter.replace_all_uses(old_buffer, new_buffer);
    }
}

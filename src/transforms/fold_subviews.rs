use smallvec::SmallVec;

use crate::ir::{Function, OpId, OpKind, Offset, Rewriter, SubViewAttrs, ValueId};
use crate::rewrite::{NotApplicableReason, RewritePattern};

/// Folds a sub-view of a sub-view into a single sub-view of the inner
/// view's source.
///
/// Per dimension the offsets are added. Static sums stay static, an addition
/// with a static zero reuses the dynamic operand as is, and anything else is
/// materialized as an index addition. Sizes and strides come from the outer
/// view.
///
/// The chain is folded only when both views have the same strides, the inner
/// view has unit strides, and the outer window fits inside the inner one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldSubViews;

fn subview_attrs(func: &Function, op: OpId) -> Option<&SubViewAttrs> {
    match &func.op(op).kind {
        OpKind::SubView(attrs) => Some(attrs),
        _ => None,
    }
}

/// Pairs every offset slot with its dynamic operand, if it has one.
fn offset_operands(attrs: &SubViewAttrs, dynamic: &[ValueId]) -> Vec<(Offset, Option<ValueId>)> {
    let mut dynamic = dynamic.iter().copied();
    attrs
        .offsets
        .iter()
        .map(|&o| match o {
            Offset::Static(_) => (o, None),
            Offset::Dynamic => (o, dynamic.next()),
        })
        .collect()
}

impl RewritePattern for FoldSubViews {
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason> {
        let outer = subview_attrs(func, op).ok_or(NotApplicableReason::WrongKind)?;
        let outer_op = func.op(op);
        let inner_op = func
            .defining_op(outer_op.operands[0])
            .ok_or(NotApplicableReason::SourceNotSubView)?;
        let inner = subview_attrs(func, inner_op).ok_or(NotApplicableReason::SourceNotSubView)?;

        let outer_ty = func
            .memref_type(func.result(op))
            .ok_or(NotApplicableReason::LayoutMismatch)?;
        let inner_ty = func
            .memref_type(func.result(inner_op))
            .ok_or(NotApplicableReason::LayoutMismatch)?;
        if outer_ty.dtype != inner_ty.dtype || outer_ty.strides() != inner_ty.strides() {
            return Err(NotApplicableReason::LayoutMismatch);
        }

        if outer.offsets.len() != inner.sizes.len() || inner.strides.iter().any(|&s| s != 1) {
            return Err(NotApplicableReason::IncompatibleWindow);
        }
        for ((offset, &size), (&stride, &bound)) in outer
            .offsets
            .iter()
            .zip(&outer.sizes)
            .zip(outer.strides.iter().zip(&inner.sizes))
        {
            let span = (size - 1) * stride + 1;
            let start = match offset {
                Offset::Static(o) => *o,
                Offset::Dynamic => 0,
            };
            if start < 0 || start + span > bound {
                return Err(NotApplicableReason::IncompatibleWindow);
            }
        }
        Ok(())
    }

    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId) {
        let func = rewriter.func();
        let outer_op = func.op(op);
        let Some(inner_op) = func.defining_op(outer_op.operands[0]) else {
            unreachable!("checked by FoldSubViews::check")
        };
        let (Some(outer), Some(inner)) = (subview_attrs(func, op), subview_attrs(func, inner_op))
        else {
            unreachable!("checked by FoldSubViews::check")
        };
        let outer_offsets = offset_operands(outer, &outer_op.operands[1..]);
        let inner_offsets = offset_operands(inner, &func.op(inner_op).operands[1..]);
        let source = func.op(inner_op).operands[0];
        let mut combined = SubViewAttrs {
            offsets: SmallVec::new(),
            sizes: outer.sizes.clone(),
            strides: outer.strides.clone(),
        };

        let mut dynamic: Vec<ValueId> = vec![];
        for (o, i) in outer_offsets.into_iter().zip(inner_offsets) {
            let offset = match (o, i) {
                ((Offset::Static(a), _), (Offset::Static(b), _)) => Offset::Static(a + b),
                ((Offset::Dynamic, Some(x)), (Offset::Static(b), _))
                | ((Offset::Static(b), _), (Offset::Dynamic, Some(x))) => {
                    if b == 0 {
                        dynamic.push(x);
                    } else {
                        let c = rewriter.constant(b);
                        dynamic.push(rewriter.addi(x, c));
                    }
                    Offset::Dynamic
                }
                ((Offset::Dynamic, Some(x)), (Offset::Dynamic, Some(y))) => {
                    dynamic.push(rewriter.addi(y, x));
                    Offset::Dynamic
                }
                _ => unreachable!("dynamic offset without an operand"),
            };
            combined.offsets.push(offset);
        }

        let folded = rewriter.subview_with_offsets(source, combined, &dynamic);
        rewriter.replace_op(op, Some(folded));
    }
}

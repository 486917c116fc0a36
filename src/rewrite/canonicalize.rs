//! Simplifications for the loop nests and index arithmetic left behind by
//! tiling.

use smallvec::SmallVec;

use crate::ir::{Function, LoopDim, OpId, OpKind, Offset, Rewriter, ValueId};
use crate::rewrite::{NotApplicableReason, PatternSet, RewritePattern};

pub fn patterns() -> PatternSet {
    PatternSet::new()
        .with(SimplifyTrivialLoops)
        .with(FoldAddIConstants)
        .with(FoldSubViewConstantOffsets)
}

fn constant_value(func: &Function, v: ValueId) -> Option<i64> {
    match func.defining_kind(v) {
        Some(OpKind::Constant(c)) => Some(*c),
        _ => None,
    }
}

/// Removes loop dimensions running exactly once, and loops running zero times.
///
/// The induction variable of a removed dimension is replaced by its lower
/// bound. A loop with no dimensions left is inlined into its parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimplifyTrivialLoops;

impl RewritePattern for SimplifyTrivialLoops {
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason> {
        let dims = func.op(op).kind.loop_dims();
        if dims.is_empty() {
            return Err(NotApplicableReason::WrongKind);
        }
        if dims.iter().any(|d| d.trip_count() <= 1) {
            Ok(())
        } else {
            Err(NotApplicableReason::NoTrivialLoop)
        }
    }

    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId) {
        let record = rewriter.func().op(op).clone();
        let dims = record.kind.loop_dims();
        if dims.iter().any(|d| d.trip_count() == 0) {
            rewriter.erase_op(op);
            return;
        }

        let mut kept_dims: SmallVec<[LoopDim; 3]> = SmallVec::new();
        let mut kept_ivs: SmallVec<[ValueId; 3]> = SmallVec::new();
        for (dim, &iv) in dims.iter().zip(&record.region_args) {
            if dim.trip_count() == 1 {
                let lb = rewriter.constant(dim.lb);
                rewriter.replace_all_uses(iv, lb);
            } else {
                kept_dims.push(*dim);
                kept_ivs.push(iv);
            }
        }

        let new_parent = match kept_dims.len() {
            0 => None,
            _ => {
                let (new_loop, new_ivs) = match &record.kind {
                    OpKind::For(_) => {
                        let (l, iv) = rewriter.for_loop(kept_dims[0]);
                        (l, SmallVec::<[ValueId; 3]>::from_slice(&[iv]))
                    }
                    _ => rewriter.parallel(kept_dims),
                };
                for (old, new) in kept_ivs.into_iter().zip(new_ivs) {
                    rewriter.replace_all_uses(old, new);
                }
                Some(new_loop)
            }
        };
        match new_parent {
            Some(l) => rewriter.set_insertion_point_to_end(Some(l)),
            None => rewriter.set_insertion_point_before(op),
        }
        for child in record.region {
            rewriter.move_op(child);
        }
        rewriter.erase_op(op);
    }
}

/// Folds index additions of two constants, or of zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldAddIConstants;

impl RewritePattern for FoldAddIConstants {
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason> {
        let o = func.op(op);
        if o.kind != OpKind::AddI {
            return Err(NotApplicableReason::WrongKind);
        }
        match (
            constant_value(func, o.operands[0]),
            constant_value(func, o.operands[1]),
        ) {
            (Some(_), Some(_)) | (Some(0), None) | (None, Some(0)) => Ok(()),
            _ => Err(NotApplicableReason::NothingToFold),
        }
    }

    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId) {
        let func = rewriter.func();
        let (lhs, rhs) = (func.op(op).operands[0], func.op(op).operands[1]);
        let replacement = match (constant_value(func, lhs), constant_value(func, rhs)) {
            (Some(a), Some(b)) => rewriter.constant(a + b),
            (Some(0), _) => rhs,
            _ => lhs,
        };
        rewriter.replace_op(op, Some(replacement));
    }
}

/// Turns dynamic sub-view offsets supplied by constants into static offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldSubViewConstantOffsets;

impl RewritePattern for FoldSubViewConstantOffsets {
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason> {
        let o = func.op(op);
        if !matches!(o.kind, OpKind::SubView(_)) {
            return Err(NotApplicableReason::WrongKind);
        }
        if o.operands[1..]
            .iter()
            .any(|&v| constant_value(func, v).is_some())
        {
            Ok(())
        } else {
            Err(NotApplicableReason::NothingToFold)
        }
    }

    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId) {
        let func = rewriter.func();
        let o = func.op(op);
        let OpKind::SubView(attrs) = &o.kind else {
            unreachable!("checked by FoldSubViewConstantOffsets::check")
        };
        let mut attrs = attrs.clone();
        let source = o.operands[0];
        let mut dynamic = o.operands[1..].iter();
        let mut remaining = vec![];
        for offset in attrs.offsets.iter_mut() {
            if *offset != Offset::Dynamic {
                continue;
            }
            let Some(&v) = dynamic.next() else {
                break;
            };
            match constant_value(func, v) {
                Some(c) => *offset = Offset::Static(c),
                None => remaining.push(v),
            }
        }
        let new = rewriter.subview_with_offsets(source, attrs, &remaining);
        rewriter.replace_op(op, Some(new));
    }
}

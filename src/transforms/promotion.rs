use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::{Dtype, MemorySpace};
use crate::ir::{Function, MemRefType, OpId, OpKind, Rewriter, SubViewAttrs, ValueId};
use crate::kernel::KernelKind;
use crate::rewrite::{NotApplicableReason, RewritePattern};
use crate::transforms::StageFilter;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PromotionOptions {
    /// Operand positions to promote; `None` promotes every sub-view operand.
    pub operands_to_promote: Option<SmallVec<[usize; 3]>>,
    /// Where promoted buffers are allocated. Without a tier, each buffer is
    /// a byte allocation in the default tier viewed at the tile's type.
    pub memory_space: Option<MemorySpace>,
}

impl PromotionOptions {
    #[must_use]
    pub fn with_operands(mut self, operands: &[usize]) -> Self {
        self.operands_to_promote = Some(SmallVec::from_slice(operands));
        self
    }

    #[must_use]
    pub fn with_memory_space(mut self, space: MemorySpace) -> Self {
        self.memory_space = Some(space);
        self
    }
}

/// Copies a kernel's tile operands into fresh local buffers around the
/// kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinalgPromotion {
    pub kind: KernelKind,
    pub options: PromotionOptions,
    pub filter: StageFilter,
}

impl LinalgPromotion {
    fn candidates(&self, func: &Function, op: OpId) -> SmallVec<[usize; 3]> {
        let operands = &func.op(op).operands;
        let is_tile = |i: usize| {
            operands.get(i).map_or(false, |&v| {
                matches!(func.defining_kind(v), Some(OpKind::SubView(_)))
            })
        };
        match &self.options.operands_to_promote {
            Some(designated) => designated.iter().copied().filter(|&i| is_tile(i)).collect(),
            None => (0..operands.len()).filter(|&i| is_tile(i)).collect(),
        }
    }

    /// Allocates the local buffer for a tile of type `ty`. Returns the
    /// buffer to deallocate and the value the kernel will use.
    fn allocate(&self, rewriter: &mut Rewriter<'_>, ty: &MemRefType) -> (ValueId, ValueId) {
        let tile_ty = MemRefType::new(&ty.shape, ty.dtype);
        match self.options.memory_space {
            Some(space) => {
                let buffer = rewriter.alloc(tile_ty.in_space(space));
                (buffer, buffer)
            }
            None => {
                let bytes = rewriter.alloc(MemRefType::new(&[tile_ty.bytes()], Dtype::Uint8));
                let full = rewriter.view(bytes, tile_ty);
                let partial = rewriter.subview(full, SubViewAttrs::origin(&ty.shape));
                (bytes, partial)
            }
        }
    }
}

impl RewritePattern for LinalgPromotion {
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason> {
        let o = func.op(op);
        if KernelKind::of(&o.kind) != Some(self.kind) {
            return Err(NotApplicableReason::WrongKind);
        }
        self.filter.check(o)?;
        if self.candidates(func, op).is_empty() {
            return Err(NotApplicableReason::NothingToPromote);
        }
        Ok(())
    }

    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId) {
        let func = rewriter.func();
        let candidates = self.candidates(func, op);
        let operands = func.op(op).operands.clone();
        let types = candidates
            .iter()
            .filter_map(|&i| func.memref_type(operands[i]).cloned())
            .collect::<Vec<_>>();

        let mut promoted = operands.clone();
        let mut buffers = vec![];
        for (&i, ty) in candidates.iter().zip(&types) {
            let (buffer, local) = self.allocate(rewriter, ty);
            buffers.push(buffer);
            promoted[i] = local;
        }
        for &i in &candidates {
            rewriter.copy(operands[i], promoted[i]);
        }
        rewriter.insert(
            self.kind.op_kind(),
            promoted.clone(),
            None,
            Some(self.filter.next),
        );
        let output = self.kind.output_operand();
        if candidates.contains(&output) {
            rewriter.copy(promoted[output], operands[output]);
        }
        for buffer in buffers {
            rewriter.dealloc(buffer);
        }
        rewriter.erase_op(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DimSize;
    use crate::ir::{Offset, Type};
    use crate::stage::Stage;
    use proptest::prelude::*;
    use smallvec::smallvec;

    /// A matmul at `marker` over 32x32 tiles of 64x64 arguments.
    fn tiled_matmul(marker: Stage) -> (Function, OpId) {
        tiled_matmul_of(marker, Dtype::Sint32, [32, 32])
    }

    /// A matmul at `marker` over `tile`-shaped windows of 64x64 arguments.
    fn tiled_matmul_of(marker: Stage, dtype: Dtype, tile: [DimSize; 2]) -> (Function, OpId) {
        let ty = MemRefType::new(&[64, 64], dtype);
        let mut func = Function::new("f", [ty.clone(), ty.clone(), ty].map(Type::MemRef));
        let args = func.args().to_vec();
        let mut rw = Rewriter::new(&mut func);
        let tiles: SmallVec<[ValueId; 4]> = args
            .iter()
            .map(|&a| {
                rw.subview(
                    a,
                    SubViewAttrs {
                        offsets: smallvec![Offset::Static(64 - tile[0]), Offset::Static(0)],
                        sizes: SmallVec::from_slice(&tile),
                        strides: smallvec![1, 1],
                    },
                )
            })
            .collect();
        let op = rw.insert(OpKind::Matmul, tiles, None, Some(marker));
        (func, op)
    }

    fn promotion(options: PromotionOptions) -> LinalgPromotion {
        LinalgPromotion {
            kind: KernelKind::Matmul,
            options,
            filter: StageFilter::new(Stage::TiledLocal, Stage::PromotedLocal),
        }
    }

    #[test]
    fn test_default_promotion_builds_byte_buffers() {
        let (mut func, op) = tiled_matmul(Stage::TiledLocal);
        promotion(PromotionOptions::default())
            .match_and_rewrite(&mut Rewriter::new(&mut func), op)
            .unwrap();

        let kinds = func
            .body()
            .iter()
            .map(|&o| func.op(o).kind.clone())
            .filter(|k| !matches!(k, OpKind::SubView(_)))
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [
                vec![OpKind::Alloc, OpKind::View, OpKind::Alloc, OpKind::View, OpKind::Alloc, OpKind::View],
                vec![OpKind::Copy; 3],
                vec![OpKind::Matmul, OpKind::Copy],
                vec![OpKind::Dealloc; 3],
            ]
            .concat()
        );
        let allocs = func.collect_ops(|o| o.kind == OpKind::Alloc);
        let bytes = func.memref_type(func.result(allocs[0])).unwrap();
        assert_eq!(bytes.shape.as_slice(), &[32 * 32 * 4]);
        assert_eq!(bytes.dtype, Dtype::Uint8);

        let kernel = func.collect_ops(|o| o.kind == OpKind::Matmul)[0];
        assert_eq!(func.op(kernel).marker, Some(Stage::PromotedLocal));
        for &v in &func.op(kernel).operands {
            let src = func.defining_op(v).unwrap();
            assert!(matches!(func.op(src).kind, OpKind::SubView(_)));
            let view = func.defining_op(func.op(src).operands[0]).unwrap();
            assert_eq!(func.op(view).kind, OpKind::View);
        }
    }

    #[test]
    fn test_promotion_into_tier_with_selected_operands() {
        let (mut func, op) = tiled_matmul(Stage::TiledLocal);
        let options = PromotionOptions::default()
            .with_operands(&[0, 1])
            .with_memory_space(MemorySpace::L2);
        promotion(options)
            .match_and_rewrite(&mut Rewriter::new(&mut func), op)
            .unwrap();
        let allocs = func.collect_ops(|o| o.kind == OpKind::Alloc);
        assert_eq!(allocs.len(), 2);
        for a in allocs {
            let ty = func.memref_type(func.result(a)).unwrap();
            assert_eq!(ty.space, MemorySpace::L2);
            assert_eq!(ty.shape.as_slice(), &[32, 32]);
        }
        // The output was not promoted, so nothing is copied back.
        assert_eq!(func.collect_ops(|o| o.kind == OpKind::Copy).len(), 2);
    }

    #[test]
    fn test_declines_without_tiles_or_wrong_marker() {
        let (func, op) = tiled_matmul(Stage::TiledMid);
        assert!(matches!(
            promotion(PromotionOptions::default()).check(&func, op),
            Err(NotApplicableReason::MarkerMismatch { .. })
        ));

        let ty = Type::MemRef(MemRefType::new(&[32, 32], Dtype::Sint32));
        let mut func = Function::new("g", [ty.clone(), ty.clone(), ty]);
        let args = func.args().to_vec();
        let op = Rewriter::new(&mut func).insert(
            OpKind::Matmul,
            args.into(),
            None,
            Some(Stage::TiledLocal),
        );
        assert_eq!(
            promotion(PromotionOptions::default()).check(&func, op),
            Err(NotApplicableReason::NothingToPromote)
        );
    }

    proptest! {
        #[test]
        fn test_byte_buffers_hold_one_tile(
            dtype in any::<Dtype>(), rows in 1i64..=64, cols in 1i64..=64
        ) {
            let (mut func, op) = tiled_matmul_of(Stage::TiledLocal, dtype, [rows, cols]);
            promotion(PromotionOptions::default())
                .match_and_rewrite(&mut Rewriter::new(&mut func), op)
                .unwrap();
            let allocs = func.collect_ops(|o| o.kind == OpKind::Alloc);
            prop_assert_eq!(allocs.len(), 3);
            for a in allocs {
                let ty = func.memref_type(func.result(a)).unwrap();
                prop_assert_eq!(ty.dtype, Dtype::Uint8);
                prop_assert_eq!(ty.shape.as_slice(), &[rows * cols * i64::from(dtype.size())]);
            }
            for view in func.collect_ops(|o| o.kind == OpKind::View) {
                let ty = func.memref_type(func.result(view)).unwrap();
                prop_assert_eq!(ty.dtype, dtype);
                prop_assert_eq!(ty.shape.as_slice(), &[rows, cols]);
            }
        }

        #[test]
        fn test_tier_promotion_allocates_in_tier(
            space in any::<MemorySpace>(), dtype in any::<Dtype>()
        ) {
            let (mut func, op) = tiled_matmul_of(Stage::TiledLocal, dtype, [16, 8]);
            promotion(PromotionOptions::default().with_memory_space(space))
                .match_and_rewrite(&mut Rewriter::new(&mut func), op)
                .unwrap();
            prop_assert!(func.collect_ops(|o| o.kind == OpKind::View).is_empty());
            let allocs = func.collect_ops(|o| o.kind == OpKind::Alloc);
            prop_assert_eq!(allocs.len(), 3);
            for a in allocs {
                let ty = func.memref_type(func.result(a)).unwrap();
                prop_assert_eq!(ty.space, space);
                prop_assert_eq!(ty.dtype, dtype);
                prop_assert_eq!(ty.shape.as_slice(), &[16, 8]);
            }
        }
    }
}

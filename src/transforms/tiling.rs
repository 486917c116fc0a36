use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::common::{DimSize, Shape};
use crate::ir::{Function, LoopDim, MemRefType, OpId, Offset, Rewriter, SubViewAttrs, ValueId};
use crate::kernel::{IteratorKind, KernelKind, TileSizes};
use crate::rewrite::{NotApplicableReason, RewritePattern};
use crate::transforms::StageFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
pub enum LoopType {
    /// One sequential loop per tiled dimension.
    Loops,
    /// One data-parallel loop over the tiled parallel dimensions, with
    /// sequential loops for tiled reduction dimensions inside it.
    ParallelLoops,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TilingOptions {
    /// Per loop dimension; 0 (or a missing entry) leaves the dimension untiled.
    pub tile_sizes: TileSizes,
    /// Loop order, outermost first. Empty means the kernel's own order.
    pub interchange: SmallVec<[usize; 7]>,
    pub loop_type: LoopType,
}

impl TilingOptions {
    pub fn new(tile_sizes: &[DimSize]) -> Self {
        TilingOptions {
            tile_sizes: TileSizes::from_slice(tile_sizes),
            interchange: SmallVec::new(),
            loop_type: LoopType::Loops,
        }
    }

    #[must_use]
    pub fn with_interchange(mut self, interchange: &[usize]) -> Self {
        self.interchange = SmallVec::from_slice(interchange);
        self
    }

    #[must_use]
    pub fn with_loop_type(mut self, loop_type: LoopType) -> Self {
        self.loop_type = loop_type;
        self
    }
}

/// Tiles a kernel op into a loop nest over sub-views of its operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinalgTiling {
    pub kind: KernelKind,
    pub options: TilingOptions,
    pub filter: StageFilter,
}

struct TilePlan {
    operand_types: Vec<MemRefType>,
    extents: TileSizes,
    /// Clamped tile sizes; 0 for untiled dimensions.
    tiles: TileSizes,
    /// Tiled dimensions, outermost first.
    order: SmallVec<[usize; 7]>,
}

/// One loop nest of a tiling. Every tile it visits has the same static
/// sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Nest {
    /// Iteration range per loop dimension. Only tiled dimensions get loops.
    ranges: SmallVec<[LoopDim; 7]>,
    /// Tile size per loop dimension.
    sizes: TileSizes,
}

impl TilePlan {
    /// Splits each tiled dimension into the full tiles and, when the tile
    /// size does not divide the extent, one trailing partial tile. Returns
    /// one nest per combination of pieces, in program order.
    fn nests(&self) -> Vec<Nest> {
        let mut nests = vec![Nest {
            ranges: self.extents.iter().map(|&e| LoopDim::new(0, e, e.max(1))).collect(),
            sizes: self.extents.clone(),
        }];
        for &d in &self.order {
            let (extent, tile) = (self.extents[d], self.tiles[d]);
            let rem = extent % tile;
            let mut pieces = vec![(LoopDim::new(0, extent - rem, tile), tile)];
            if rem > 0 {
                pieces.push((LoopDim::new(extent - rem, extent, rem), rem));
            }
            nests = nests
                .into_iter()
                .cartesian_product(pieces)
                .map(|(mut nest, (range, size))| {
                    nest.ranges[d] = range;
                    nest.sizes[d] = size;
                    nest
                })
                .collect();
        }
        nests
    }
}

impl LinalgTiling {
    fn plan(&self, func: &Function, op: OpId) -> Result<TilePlan, NotApplicableReason> {
        let operand_types = func
            .op(op)
            .operands
            .iter()
            .map(|&v| func.memref_type(v).cloned())
            .collect::<Option<Vec<_>>>()
            .ok_or(NotApplicableReason::UnsupportedOperands)?;
        let extents = self
            .kind
            .iteration_extents(&operand_types.iter().collect::<Vec<_>>())
            .ok_or(NotApplicableReason::UnsupportedOperands)?;
        let rank = extents.len();

        let requested = &self.options.tile_sizes;
        if requested.len() > rank {
            return Err(NotApplicableReason::TileRankMismatch {
                rank,
                got: requested.len(),
            });
        }
        let mut tiles = TileSizes::new();
        for (dim, &extent) in extents.iter().enumerate() {
            tiles.push(requested.get(dim).copied().unwrap_or(0).max(0).min(extent));
        }

        let interchange: SmallVec<[usize; 7]> = if self.options.interchange.is_empty() {
            (0..rank).collect()
        } else {
            self.options.interchange.clone()
        };
        if interchange.len() != rank || !interchange.iter().sorted().copied().eq(0..rank) {
            return Err(NotApplicableReason::InvalidInterchange);
        }
        let order = interchange
            .into_iter()
            .filter(|&d| tiles[d] > 0)
            .collect();

        Ok(TilePlan {
            operand_types,
            extents,
            tiles,
            order,
        })
    }

    /// Emits the loops of `nest`, leaving the rewriter inside the innermost
    /// loop. Returns the induction variable of each tiled dimension.
    fn build_loops(
        &self,
        rewriter: &mut Rewriter<'_>,
        plan: &TilePlan,
        nest: &Nest,
    ) -> SmallVec<[Option<ValueId>; 7]> {
        let mut ivs: SmallVec<[Option<ValueId>; 7]> = smallvec![None; plan.extents.len()];
        let dim = |d: usize| nest.ranges[d];
        let sequential = match self.options.loop_type {
            LoopType::Loops => plan.order.clone(),
            LoopType::ParallelLoops => {
                let iterators = self.kind.iterators();
                let (parallel, reduction): (SmallVec<[usize; 7]>, SmallVec<[usize; 7]>) = plan
                    .order
                    .iter()
                    .copied()
                    .partition(|&d| iterators[d] == IteratorKind::Parallel);
                if !parallel.is_empty() {
                    let dims = parallel.iter().map(|&d| dim(d)).collect();
                    let (par, par_ivs) = rewriter.parallel(dims);
                    for (&d, iv) in parallel.iter().zip(par_ivs) {
                        ivs[d] = Some(iv);
                    }
                    rewriter.set_insertion_point_to_end(Some(par));
                }
                reduction
            }
        };
        for d in sequential {
            let (lp, iv) = rewriter.for_loop(dim(d));
            ivs[d] = Some(iv);
            rewriter.set_insertion_point_to_end(Some(lp));
        }
        ivs
    }

    /// Emits one loop nest holding a copy of the kernel over tiles of
    /// `operands`.
    fn emit_nest(
        &self,
        rewriter: &mut Rewriter<'_>,
        plan: &TilePlan,
        nest: &Nest,
        operands: &[ValueId],
    ) {
        let ivs = self.build_loops(rewriter, plan, nest);
        let mut tiled_operands = SmallVec::<[ValueId; 4]>::new();
        for ((&operand, ty), map) in operands
            .iter()
            .zip(&plan.operand_types)
            .zip(self.kind.operand_maps())
        {
            let mut offsets = SmallVec::new();
            let mut dynamic = vec![];
            let mut sizes = Shape::new();
            for terms in map.iter() {
                let term_ivs = terms.iter().filter_map(|&d| ivs[d]).collect::<Vec<_>>();
                match term_ivs.split_first() {
                    None => offsets.push(Offset::Static(0)),
                    Some((&first, rest)) => {
                        let sum = rest.iter().fold(first, |acc, &iv| rewriter.addi(acc, iv));
                        dynamic.push(sum);
                        offsets.push(Offset::Dynamic);
                    }
                }
                let window = terms.iter().map(|&d| nest.sizes[d]).sum::<DimSize>();
                sizes.push(window - (terms.len() as DimSize - 1));
            }
            if dynamic.is_empty() && sizes == ty.shape {
                tiled_operands.push(operand);
                continue;
            }
            let attrs = SubViewAttrs {
                strides: smallvec![1; sizes.len()],
                offsets,
                sizes,
            };
            tiled_operands.push(rewriter.subview_with_offsets(operand, attrs, &dynamic));
        }

        rewriter.insert(
            self.kind.op_kind(),
            tiled_operands,
            None,
            Some(self.filter.next),
        );
    }
}

impl RewritePattern for LinalgTiling {
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason> {
        let o = func.op(op);
        if KernelKind::of(&o.kind) != Some(self.kind) {
            return Err(NotApplicableReason::WrongKind);
        }
        self.filter.check(o)?;
        self.plan(func, op).map(|_| ())
    }

    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId) {
        let Ok(plan) = self.plan(rewriter.func(), op) else {
            unreachable!("checked by LinalgTiling::check")
        };
        let operands = rewriter.func().op(op).operands.clone();
        let anchor = rewriter.insertion_point();
        for nest in plan.nests() {
            rewriter.set_insertion_point(anchor);
            self.emit_nest(rewriter, &plan, &nest, &operands);
        }
        rewriter.erase_op(op);
    }
}

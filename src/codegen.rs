//! The codegen pass: kernel selection, outlining, and the per-kernel
//! tile/canonicalize/fold-views pipeline.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::{DimSize, MemorySpace};
use crate::ir::{Function, MemRefType, Module};
use crate::kernel::{
    conv2d_tile_sizes, matmul_tile_sizes, select_kernels, KernelInstance, KernelKind, TileSizes,
};
use crate::outline::{OutlineError, Outliner};
use crate::rewrite::{
    apply_patterns_greedily, canonicalize, Pattern, PatternSet, DEFAULT_MAX_ITERATIONS,
};
use crate::stage::{self, Stage, Step, Transition};
use crate::transforms::promotion::{LinalgPromotion, PromotionOptions};
use crate::transforms::tiling::{LinalgTiling, LoopType, TilingOptions};
use crate::transforms::{view_folding_patterns, StageFilter};

pub const DEFAULT_L1_SIZE: u64 = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, clap::Args)]
#[serde(default)]
pub struct CodegenOptions {
    /// Only run the view folding rules over every function.
    #[arg(long)]
    pub test_patterns: bool,

    /// Herd size to target, per matmul dimension.
    #[arg(long, value_delimiter = ',')]
    pub herd_size: Vec<u32>,

    /// Compute-tile tile size, per matmul dimension.
    #[arg(long, value_delimiter = ',')]
    pub l1_tile_size: Vec<DimSize>,

    /// Mid-tier tile size, per matmul dimension. Defaults to the compute-tile
    /// size scaled by the herd size.
    #[arg(long, value_delimiter = ',')]
    pub l2_tile_size: Vec<DimSize>,

    /// Size of the L1 buffer in bytes. Currently unused.
    #[arg(long = "l1-size", default_value_t = DEFAULT_L1_SIZE)]
    pub l1_size: u64,

    /// Also promote matmul tiles into the mid tier.
    #[arg(long)]
    pub promote_l2: bool,

    /// Maximum number of rewrite sweeps per stage.
    #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
    pub max_iterations: usize,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            test_patterns: false,
            herd_size: vec![],
            l1_tile_size: vec![],
            l2_tile_size: vec![],
            l1_size: DEFAULT_L1_SIZE,
            promote_l2: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("No function named `{0}`")]
    UnknownFunction(String),
    #[error("Outlining failed: {0}")]
    Outline(#[from] OutlineError),
}

/// The rules and parameters driving one kernel instance through its stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPlan {
    pub kind: KernelKind,
    pub promote_mid: bool,
    pub tile_mid: TilingOptions,
    pub promote_mid_options: PromotionOptions,
    pub tile_local: TilingOptions,
    pub promote_local_options: PromotionOptions,
}

impl KernelPlan {
    pub fn matmul(options: &CodegenOptions) -> Self {
        let (l1, l2) = matmul_tile_sizes(
            &options.herd_size,
            &options.l1_tile_size,
            &options.l2_tile_size,
        );
        KernelPlan {
            kind: KernelKind::Matmul,
            promote_mid: options.promote_l2,
            tile_mid: TilingOptions::new(&l2).with_interchange(&[2, 1, 0]),
            promote_mid_options: PromotionOptions::default().with_memory_space(MemorySpace::L2),
            // divide the mid-tier tile up evenly between compute tiles
            tile_local: TilingOptions::new(&l1).with_loop_type(LoopType::ParallelLoops),
            promote_local_options: PromotionOptions::default(),
        }
    }

    /// Operands that are not shaped like a convolution get no tile sizes,
    /// which leaves the instance at [Stage::Selected].
    pub fn conv2d(operand_types: &[&MemRefType]) -> Self {
        let (mid, local) = conv2d_tile_sizes(operand_types).unwrap_or_default();
        KernelPlan {
            kind: KernelKind::Conv2dNchw,
            promote_mid: true,
            tile_mid: TilingOptions::new(&mid).with_interchange(&[0, 2, 1, 3, 4, 5, 6]),
            promote_mid_options: PromotionOptions::default()
                .with_operands(&[0, 1, 2])
                .with_memory_space(MemorySpace::L2),
            tile_local: TilingOptions::new(&local).with_interchange(&[1, 0, 2, 3, 4, 5, 6]),
            promote_local_options: PromotionOptions::default().with_operands(&[0, 1, 2]),
        }
    }

    pub fn for_instance(instance: &KernelInstance, options: &CodegenOptions) -> Self {
        match instance.kind {
            KernelKind::Matmul => KernelPlan::matmul(options),
            KernelKind::Conv2dNchw => {
                KernelPlan::conv2d(&instance.operand_types.iter().collect::<Vec<_>>())
            }
        }
    }

    /// The transition taking this kernel out of `current`, if any.
    pub fn next_step(&self, current: Stage) -> Option<Step> {
        stage::next_step(self.kind, self.promote_mid, current)
    }

    pub fn terminal_stage(&self) -> Stage {
        stage::terminal_stage(self.kind, self.promote_mid)
    }

    /// Tile sizes per tiling step, outermost tier first.
    pub fn tile_sizes(&self) -> Vec<TileSizes> {
        vec![
            self.tile_mid.tile_sizes.clone(),
            self.tile_local.tile_sizes.clone(),
        ]
    }

    pub fn pattern(&self, step: &Step) -> Pattern {
        let filter = StageFilter::new(step.from, step.to);
        let tiling = |options: &TilingOptions| {
            Pattern::from(LinalgTiling {
                kind: self.kind,
                options: options.clone(),
                filter,
            })
        };
        let promotion = |options: &PromotionOptions| {
            Pattern::from(LinalgPromotion {
                kind: self.kind,
                options: options.clone(),
                filter,
            })
        };
        match step.transition {
            Transition::TileMid => tiling(&self.tile_mid),
            Transition::PromoteMid => promotion(&self.promote_mid_options),
            Transition::TileLocal => tiling(&self.tile_local),
            Transition::PromoteLocal => promotion(&self.promote_local_options),
        }
    }

    /// The rules of the tiling/promotion stage, one per transition, found by
    /// following the transition table from [Stage::Selected].
    pub fn stage_patterns(&self) -> PatternSet {
        std::iter::successors(self.next_step(Stage::Selected), |s| self.next_step(s.to))
            .map(|s| self.pattern(&s))
            .collect()
    }
}

/// What happened to one kernel instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
    pub caller: String,
    pub callee: String,
    pub kind: KernelKind,
    pub tile_sizes: Vec<TileSizes>,
    /// The stage the kernel reached, read before markers were stripped.
    /// `None` if the kernel op is gone.
    pub reached: Option<Stage>,
    pub stalled: bool,
    pub rewrites: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodegenReport {
    pub instances: Vec<InstanceReport>,
    /// Rewrites applied by the view folding rules in test-patterns mode.
    pub test_pattern_rewrites: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub reached: Option<Stage>,
    pub rewrites: usize,
    pub converged: bool,
}

/// Runs the tile, canonicalize, and fold-views stages over `func`, then
/// strips every stage marker from its linear-algebra ops.
pub fn run_pipeline(
    func: &mut Function,
    plan: &KernelPlan,
    max_iterations: usize,
) -> PipelineOutcome {
    let stages = [
        ("tile", plan.stage_patterns()),
        ("canonicalize", canonicalize::patterns()),
        ("fold-views", view_folding_patterns()),
    ];
    let mut rewrites = 0;
    let mut converged = true;
    for (name, patterns) in &stages {
        let result = apply_patterns_greedily(func, patterns, max_iterations);
        debug!(
            "Stage {name} on @{}: {} rewrites in {} sweeps",
            func.name(),
            result.rewrites,
            result.iterations
        );
        rewrites += result.rewrites;
        converged &= result.converged;
    }

    let kind = plan.kind.op_kind();
    let kernels = func.collect_ops(|o| o.kind == kind);
    let reached = kernels.iter().filter_map(|&op| func.op(op).marker).min();
    for op in func.collect_ops(|o| o.kind.is_linalg()) {
        func.strip_marker(op);
    }
    PipelineOutcome {
        reached,
        rewrites,
        converged,
    }
}

pub struct LinalgCodegen {
    options: CodegenOptions,
}

impl LinalgCodegen {
    pub fn new(options: CodegenOptions) -> Self {
        LinalgCodegen { options }
    }

    /// Runs the pass over every function currently in `module`. Functions it
    /// outlines are added to `module` but not processed again.
    pub fn run(&self, module: &mut Module) -> Result<CodegenReport, CodegenError> {
        debug!("L1 size is {} bytes", self.options.l1_size);
        let mut report = CodegenReport::default();
        for name in module.function_names() {
            if self.options.test_patterns {
                let func = module
                    .function_mut(&name)
                    .ok_or_else(|| CodegenError::UnknownFunction(name.clone()))?;
                let patterns = view_folding_patterns();
                let result = apply_patterns_greedily(func, &patterns, self.options.max_iterations);
                report.test_pattern_rewrites += result.rewrites;
                continue;
            }
            for kind in [KernelKind::Matmul, KernelKind::Conv2dNchw] {
                let func = module
                    .function(&name)
                    .ok_or_else(|| CodegenError::UnknownFunction(name.clone()))?;
                for instance in select_kernels(func, kind) {
                    let instance_report = self.run_instance(module, &name, &instance)?;
                    report.instances.push(instance_report);
                }
            }
        }
        Ok(report)
    }

    fn run_instance(
        &self,
        module: &mut Module,
        caller: &str,
        instance: &KernelInstance,
    ) -> Result<InstanceReport, CodegenError> {
        let plan = KernelPlan::for_instance(instance, &self.options);
        let outlined = Outliner::new().with_marker(Stage::Selected).outline(
            module,
            caller,
            instance.op,
            instance.kind.outline_name(),
        )?;
        let callee = module
            .function_mut(&outlined.callee)
            .ok_or_else(|| CodegenError::UnknownFunction(outlined.callee.clone()))?;
        let outcome = run_pipeline(callee, &plan, self.options.max_iterations);
        let stalled = outcome.reached != Some(plan.terminal_stage());
        if stalled {
            debug!(
                "{} kernel in @{} stopped at {:?}",
                instance.kind, outlined.callee, outcome.reached
            );
        }
        Ok(InstanceReport {
            caller: caller.to_owned(),
            callee: outlined.callee,
            kind: instance.kind,
            tile_sizes: plan.tile_sizes(),
            reached: outcome.reached,
            stalled,
            rewrites: outcome.rewrites,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::{OpId, OpKind, Type};
    use crate::kernel::{kernel_function, matmul_function};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn run(module: &mut Module, options: CodegenOptions) -> CodegenReport {
        LinalgCodegen::new(options).run(module).unwrap()
    }

    fn module_of(funcs: impl IntoIterator<Item = Function>) -> Module {
        let mut module = Module::new();
        for f in funcs {
            module.add_function(f);
        }
        module
    }

    fn loop_depth(func: &Function, mut op: OpId) -> usize {
        let mut depth = 0;
        while let Some(parent) = func.parent(op) {
            depth += 1;
            op = parent;
        }
        depth
    }

    /// (memory space, shape) of every allocation in `func`.
    fn allocations(func: &Function) -> BTreeSet<(MemorySpace, Vec<DimSize>)> {
        func.collect_ops(|o| o.kind == OpKind::Alloc)
            .into_iter()
            .map(|op| {
                let ty = func.memref_type(func.result(op)).unwrap();
                (ty.space, ty.shape.to_vec())
            })
            .collect()
    }

    fn assert_no_markers(module: &Module) {
        for func in module.functions() {
            for op in func.walk() {
                assert_eq!(func.op(op).marker, None, "marker left in @{}", func.name());
            }
        }
    }

    fn assert_no_subview_chains(func: &Function) {
        for op in func.collect_ops(|o| matches!(o.kind, OpKind::SubView(_))) {
            let source = func.op(op).operands[0];
            assert!(!matches!(
                func.defining_kind(source),
                Some(OpKind::SubView(_))
            ));
        }
    }

    #[test]
    fn test_matmul_end_to_end_with_two_tiers() {
        let mut module = module_of([matmul_function("forward", 128, 128, 128, Dtype::Sint32)]);
        let options = CodegenOptions {
            promote_l2: true,
            ..CodegenOptions::default()
        };
        let report = run(&mut module, options);

        assert_eq!(module.function_names(), vec!["forward", "call_mmult"]);
        let caller = module.function("forward").unwrap();
        let caller_kinds = caller
            .body()
            .iter()
            .map(|&op| caller.op(op).kind.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            caller_kinds,
            vec![OpKind::Call("call_mmult".to_owned()), OpKind::Return]
        );

        let callee = module.function("call_mmult").unwrap();
        let kernels = callee.collect_ops(|o| o.kind == OpKind::Matmul);
        assert_eq!(kernels.len(), 1);
        let loops = callee.collect_ops(|o| o.kind.is_loop());
        let parallel = loops
            .iter()
            .filter(|&&l| matches!(callee.op(l).kind, OpKind::Parallel(_)))
            .count();
        assert_eq!((loops.len(), parallel), (5, 1));
        assert_eq!(loop_depth(callee, kernels[0]), 5);

        assert_eq!(
            allocations(callee),
            BTreeSet::from([
                (MemorySpace::L2, vec![64, 64]),
                (MemorySpace::L1, vec![32, 32]),
            ])
        );
        assert_eq!(callee.collect_ops(|o| o.kind == OpKind::Alloc).len(), 6);
        assert!(callee.collect_ops(|o| o.kind == OpKind::View).is_empty());
        assert_no_subview_chains(callee);
        assert_no_markers(&module);

        assert_eq!(report.instances.len(), 1);
        let instance = &report.instances[0];
        assert_eq!(instance.callee, "call_mmult");
        assert_eq!(instance.reached, Some(Stage::PromotedLocal));
        assert!(!instance.stalled);
        assert_eq!(instance.tile_sizes[0].as_slice(), &[64, 64, 64]);
        assert_eq!(instance.tile_sizes[1].as_slice(), &[32, 32, 32]);
    }

    #[test]
    fn test_matmul_default_path_folds_views_into_arguments() {
        let mut module = module_of([matmul_function("forward", 128, 128, 128, Dtype::Float32)]);
        let report = run(&mut module, CodegenOptions::default());
        assert!(!report.instances[0].stalled);

        let callee = module.function("call_mmult").unwrap();
        assert_eq!(
            allocations(callee),
            BTreeSet::from([(MemorySpace::L1, vec![32, 32])])
        );
        assert_no_subview_chains(callee);
        let args = callee.args();
        for op in callee.collect_ops(|o| matches!(o.kind, OpKind::SubView(_))) {
            assert!(args.contains(&callee.op(op).operands[0]));
        }
        // Mid-tier and compute-tile offsets are added at run time.
        assert!(!callee.collect_ops(|o| o.kind == OpKind::AddI).is_empty());
        assert_no_markers(&module);
    }

    #[test]
    fn test_conv2d_end_to_end() {
        let func = kernel_function(
            "forward",
            KernelKind::Conv2dNchw,
            [&[1, 16, 34, 34], &[32, 16, 3, 3], &[1, 32, 32, 32]],
            Dtype::Float32,
        );
        let mut module = module_of([func]);
        let report = run(&mut module, CodegenOptions::default());

        assert_eq!(module.function_names(), vec!["forward", "call_conv_2d_nchw"]);
        let instance = &report.instances[0];
        assert_eq!(instance.reached, Some(Stage::PromotedLocal));
        assert_eq!(instance.tile_sizes[0].as_slice(), &[1, 32, 8, 34, 3, 3, 16]);
        assert_eq!(instance.tile_sizes[1].as_slice(), &[1, 8, 8, 34, 3, 3, 16]);

        let callee = module.function("call_conv_2d_nchw").unwrap();
        // Single-trip loops are gone: one loop over output rows, one over
        // output-channel quarters.
        let loops = callee.collect_ops(|o| o.kind.is_loop());
        let trips = loops
            .iter()
            .map(|&l| callee.op(l).kind.loop_dims()[0].trip_count())
            .collect::<Vec<_>>();
        assert_eq!(trips, vec![4, 4]);
        assert_eq!(
            allocations(callee),
            BTreeSet::from([
                (MemorySpace::L2, vec![1, 16, 10, 34]),
                (MemorySpace::L2, vec![32, 16, 3, 3]),
                (MemorySpace::L2, vec![1, 32, 8, 32]),
                (MemorySpace::L1, vec![1, 16, 10, 34]),
                (MemorySpace::L1, vec![8, 16, 3, 3]),
                (MemorySpace::L1, vec![1, 8, 8, 32]),
            ])
        );
        assert_no_markers(&module);
    }

    #[test]
    fn test_conv2d_with_partial_row_tiles() {
        let func = kernel_function(
            "forward",
            KernelKind::Conv2dNchw,
            [&[1, 16, 32, 32], &[32, 16, 3, 3], &[1, 32, 30, 30]],
            Dtype::Float32,
        );
        let mut module = module_of([func]);
        let report = run(&mut module, CodegenOptions::default());
        let instance = &report.instances[0];
        assert_eq!(instance.reached, Some(Stage::PromotedLocal));
        assert!(!instance.stalled);

        let callee = module.function("call_conv_2d_nchw").unwrap();
        // Rows 0..24 in three full tiles, then rows 24..30 in one partial tile.
        assert_eq!(callee.collect_ops(|o| o.kind == OpKind::Conv2dNchw).len(), 2);
        let trips = callee
            .collect_ops(|o| o.kind.is_loop())
            .iter()
            .map(|&l| callee.op(l).kind.loop_dims()[0].trip_count())
            .collect::<Vec<_>>();
        assert_eq!(trips, vec![3, 4, 4]);
        let allocs = allocations(callee);
        for expected in [
            (MemorySpace::L2, vec![1, 32, 8, 30]),
            (MemorySpace::L2, vec![1, 32, 6, 30]),
            (MemorySpace::L1, vec![1, 16, 10, 32]),
            (MemorySpace::L1, vec![1, 16, 8, 32]),
        ] {
            assert!(allocs.contains(&expected), "missing {expected:?}");
        }
        assert_no_subview_chains(callee);
        assert_no_markers(&module);
    }

    #[test]
    fn test_matmul_with_partial_row_tiles() {
        let mut module = module_of([matmul_function("forward", 100, 128, 128, Dtype::Sint32)]);
        let report = run(&mut module, CodegenOptions::default());
        let instance = &report.instances[0];
        assert_eq!(instance.reached, Some(Stage::PromotedLocal));
        assert!(!instance.stalled);

        let callee = module.function("call_mmult").unwrap();
        // Rows 0..64 take two compute tiles; rows 64..100 take one full and
        // one 4-row tile.
        assert_eq!(callee.collect_ops(|o| o.kind == OpKind::Matmul).len(), 3);
        assert_eq!(
            allocations(callee),
            BTreeSet::from([
                (MemorySpace::L1, vec![4, 32]),
                (MemorySpace::L1, vec![32, 32]),
            ])
        );
        assert_no_subview_chains(callee);
        assert_no_markers(&module);
    }

    #[test]
    fn test_mismatched_matmul_stalls_untouched() {
        let func = kernel_function(
            "forward",
            KernelKind::Matmul,
            [&[64, 32], &[64, 64], &[64, 64]],
            Dtype::Sint32,
        );
        let mut module = module_of([func]);
        let report = run(&mut module, CodegenOptions::default());
        let instance = &report.instances[0];
        assert!(instance.stalled);
        assert_eq!(instance.reached, Some(Stage::Selected));

        let callee = module.function("call_mmult").unwrap();
        assert!(callee.collect_ops(|o| o.kind.is_loop()).is_empty());
        assert_eq!(callee.collect_ops(|o| o.kind == OpKind::Matmul).len(), 1);
        assert_no_markers(&module);
    }

    #[test]
    fn test_explicit_tile_sizes_override_herd() {
        let mut module = module_of([matmul_function("forward", 128, 128, 128, Dtype::Sint32)]);
        let options = CodegenOptions {
            herd_size: vec![4, 4, 4],
            l1_tile_size: vec![32, 32, 32],
            l2_tile_size: vec![64, 64, 64],
            ..CodegenOptions::default()
        };
        let report = run(&mut module, options);
        let instance = &report.instances[0];
        assert_eq!(instance.tile_sizes[0].as_slice(), &[64, 64, 64]);
        assert_eq!(instance.tile_sizes[1].as_slice(), &[32, 32, 32]);
        assert_eq!(instance.reached, Some(Stage::PromotedLocal));

        let callee = module.function("call_mmult").unwrap();
        let trips = callee
            .collect_ops(|o| o.kind.is_loop())
            .iter()
            .flat_map(|&l| callee.op(l).kind.loop_dims().to_vec())
            .map(|d| d.trip_count())
            .collect::<Vec<_>>();
        assert_eq!(trips, vec![2, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn test_stage_patterns_follow_transition_table() {
        let default = CodegenOptions::default();
        assert_eq!(KernelPlan::matmul(&default).stage_patterns().len(), 3);
        let promoting = CodegenOptions {
            promote_l2: true,
            ..CodegenOptions::default()
        };
        let patterns = KernelPlan::matmul(&promoting).stage_patterns();
        let names = patterns
            .iter()
            .map(|p| <&'static str>::from(p))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["LinalgTiling", "LinalgPromotion", "LinalgTiling", "LinalgPromotion"]
        );
    }

    #[test]
    fn test_kernels_are_outlined_matmuls_first() {
        let shapes: [&[DimSize]; 6] = [
            &[64, 64],
            &[64, 64],
            &[64, 64],
            &[1, 4, 10, 10],
            &[8, 4, 3, 3],
            &[1, 8, 8, 8],
        ];
        let mut forward = Function::new(
            "forward",
            shapes.map(|s| Type::MemRef(MemRefType::new(s, Dtype::Float32))),
        );
        let a = forward.args().to_vec();
        let mut rw = crate::ir::Rewriter::new(&mut forward);
        rw.insert(OpKind::Conv2dNchw, smallvec::SmallVec::from_slice(&[a[3], a[4], a[5]]), None, None);
        rw.insert(OpKind::Matmul, smallvec::SmallVec::from_slice(&[a[0], a[1], a[2]]), None, None);
        rw.insert(OpKind::Matmul, smallvec::SmallVec::from_slice(&[a[1], a[0], a[2]]), None, None);
        rw.ret();
        let mut module = module_of([forward]);
        let report = run(&mut module, CodegenOptions::default());
        let callees = report
            .instances
            .iter()
            .map(|i| i.callee.as_str())
            .collect::<Vec<_>>();
        assert_eq!(callees, vec!["call_mmult", "call_mmult_1", "call_conv_2d_nchw"]);
    }

    #[test]
    fn test_herd_size_override() {
        let mut module = module_of([matmul_function("forward", 128, 64, 32, Dtype::Sint32)]);
        let options = CodegenOptions {
            herd_size: vec![4],
            ..CodegenOptions::default()
        };
        let report = run(&mut module, options);
        assert_eq!(report.instances[0].tile_sizes[0].as_slice(), &[128, 64, 64]);
        assert!(!report.instances[0].stalled);
    }

    #[test]
    fn test_test_patterns_only_folds_views() {
        let mut module = module_of([matmul_function("forward", 64, 64, 64, Dtype::Sint32)]);
        let func = module.function_mut("forward").unwrap();
        let arg = func.args()[0];
        let mut rw = crate::ir::Rewriter::new(func);
        rw.set_insertion_point_before(func_first_op(rw.func()));
        let inner = rw.subview(arg, crate::ir::SubViewAttrs::origin(&[32, 32]));
        let outer = rw.subview(inner, crate::ir::SubViewAttrs::origin(&[16, 16]));
        let dst = rw.alloc(MemRefType::new(&[16, 16], Dtype::Sint32));
        rw.copy(outer, dst);

        let options = CodegenOptions {
            test_patterns: true,
            ..CodegenOptions::default()
        };
        let report = run(&mut module, options);
        assert!(report.instances.is_empty());
        assert_eq!(report.test_pattern_rewrites, 1);
        assert_eq!(module.function_names(), vec!["forward"]);
        let func = module.function("forward").unwrap();
        assert_eq!(func.collect_ops(|o| o.kind == OpKind::Matmul).len(), 1);
        assert_no_subview_chains(func);
    }

    fn func_first_op(func: &Function) -> OpId {
        func.body()[0]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_matmuls_of_any_shape_finish(
            m in 1i64..=160, n in 1i64..=160, k in 1i64..=160,
            herd in proptest::collection::vec(1u32..=3, 0..=3),
            promote_l2 in any::<bool>(),
        ) {
            let mut module =
                module_of([matmul_function("forward", m, n, k, Dtype::Sint32)]);
            let options = CodegenOptions { herd_size: herd, promote_l2, ..CodegenOptions::default() };
            let report = run(&mut module, options);
            let instance = &report.instances[0];
            prop_assert_eq!(instance.reached, Some(Stage::PromotedLocal));
            prop_assert!(!instance.stalled);
            for func in module.functions() {
                for op in func.walk() {
                    prop_assert_eq!(func.op(op).marker, None);
                }
            }
        }
    }
}

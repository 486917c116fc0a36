//! Kernel kinds, their iteration spaces, kernel selection, and the
//! kind-specific tile-size derivation.

use log::warn;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::{DimSize, Dtype};
use crate::ir::{Function, MemRefType, OpId, OpKind, Rewriter, Type};

pub type TileSizes = SmallVec<[DimSize; 7]>;

/// Per-dimension compute-tile tile size for matmuls.
pub const MATMUL_L1_TILE_SIZE: [DimSize; 3] = [32, 32, 32];
pub const DEFAULT_HERD_SIZE: [DimSize; 3] = [2, 2, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
pub enum KernelKind {
    #[strum(serialize = "matmul")]
    Matmul,
    #[strum(serialize = "conv2d")]
    Conv2dNchw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IteratorKind {
    Parallel,
    Reduction,
}

/// For each operand dimension, the loop dimensions whose sum indexes it.
pub type OperandMap = &'static [&'static [usize]];

// Loop dimensions (i, j, k).
static MATMUL_MAPS: [OperandMap; 3] = [&[&[0], &[2]], &[&[2], &[1]], &[&[0], &[1]]];
static MATMUL_ITERATORS: [IteratorKind; 3] = [
    IteratorKind::Parallel,
    IteratorKind::Parallel,
    IteratorKind::Reduction,
];

// Loop dimensions (n, f, oh, ow, kh, kw, c).
static CONV2D_MAPS: [OperandMap; 3] = [
    &[&[0], &[6], &[2, 4], &[3, 5]],
    &[&[1], &[6], &[4], &[5]],
    &[&[0], &[1], &[2], &[3]],
];
static CONV2D_ITERATORS: [IteratorKind; 7] = [
    IteratorKind::Parallel,
    IteratorKind::Parallel,
    IteratorKind::Parallel,
    IteratorKind::Parallel,
    IteratorKind::Reduction,
    IteratorKind::Reduction,
    IteratorKind::Reduction,
];

impl KernelKind {
    pub fn of(kind: &OpKind) -> Option<Self> {
        match kind {
            OpKind::Matmul => Some(KernelKind::Matmul),
            OpKind::Conv2dNchw => Some(KernelKind::Conv2dNchw),
            _ => None,
        }
    }

    pub fn op_kind(self) -> OpKind {
        match self {
            KernelKind::Matmul => OpKind::Matmul,
            KernelKind::Conv2dNchw => OpKind::Conv2dNchw,
        }
    }

    /// The name hint given to procedures outlined from this kind of kernel.
    pub fn outline_name(self) -> &'static str {
        match self {
            KernelKind::Matmul => "call_mmult",
            KernelKind::Conv2dNchw => "call_conv_2d_nchw",
        }
    }

    pub fn loop_rank(self) -> usize {
        self.iterators().len()
    }

    pub fn iterators(self) -> &'static [IteratorKind] {
        match self {
            KernelKind::Matmul => &MATMUL_ITERATORS,
            KernelKind::Conv2dNchw => &CONV2D_ITERATORS,
        }
    }

    pub fn operand_maps(self) -> &'static [OperandMap] {
        match self {
            KernelKind::Matmul => &MATMUL_MAPS,
            KernelKind::Conv2dNchw => &CONV2D_MAPS,
        }
    }

    pub fn output_operand(self) -> usize {
        2
    }

    /// Computes the loop extents from operand types, or `None` when the
    /// operands are not shaped like this kernel expects.
    pub fn iteration_extents(self, operands: &[&MemRefType]) -> Option<TileSizes> {
        let [a, b, c] = operands else {
            return None;
        };
        let maps = self.operand_maps();
        if [a, b, c]
            .iter()
            .zip(maps)
            .any(|(ty, map)| ty.rank() != map.len())
        {
            return None;
        }
        let extents: TileSizes = match self {
            KernelKind::Matmul => {
                let (m, k, n) = (a.shape[0], a.shape[1], b.shape[1]);
                if b.shape[0] != k || c.shape[0] != m || c.shape[1] != n {
                    return None;
                }
                SmallVec::from_slice(&[m, n, k])
            }
            KernelKind::Conv2dNchw => {
                let (input, weight, output) = (a, b, c);
                let [n, f, oh, ow] = [0, 1, 2, 3].map(|i| output.shape[i]);
                let [kh, kw] = [2, 3].map(|i| weight.shape[i]);
                let ch = input.shape[1];
                if input.shape[0] != n
                    || weight.shape[0] != f
                    || weight.shape[1] != ch
                    || input.shape[2] < oh + kh - 1
                    || input.shape[3] < ow + kw - 1
                {
                    return None;
                }
                SmallVec::from_slice(&[n, f, oh, ow, kh, kw, ch])
            }
        };
        if extents.iter().any(|&e| e <= 0) {
            return None;
        }
        Some(extents)
    }
}

/// One occurrence of a matched kernel op in a function body.
#[derive(Debug, Clone)]
pub struct KernelInstance {
    pub op: OpId,
    pub kind: KernelKind,
    pub operand_types: Vec<MemRefType>,
}

/// Collects kernels of `kind` in encounter order.
pub fn select_kernels(func: &Function, kind: KernelKind) -> Vec<KernelInstance> {
    func.walk()
        .into_iter()
        .filter(|&op| KernelKind::of(&func.op(op).kind) == Some(kind))
        .filter_map(|op| {
            let operand_types = func
                .op(op)
                .operands
                .iter()
                .map(|&v| func.memref_type(v).cloned())
                .collect::<Option<Vec<_>>>()?;
            Some(KernelInstance {
                op,
                kind,
                operand_types,
            })
        })
        .collect()
}

/// Replaces the leading entries of `defaults` with `configured`. Entries
/// beyond the matmul rank are ignored.
fn override_defaults<T>(
    mut defaults: [DimSize; 3],
    configured: &[T],
    option: &str,
) -> [DimSize; 3]
where
    T: Copy + Into<DimSize> + std::fmt::Debug,
{
    if configured.len() > defaults.len() {
        warn!(
            "Ignoring {option} entries beyond rank {}: {:?}",
            defaults.len(),
            &configured[defaults.len()..]
        );
    }
    for (d, c) in defaults.iter_mut().zip(configured) {
        *d = (*c).into();
    }
    defaults
}

/// Resolves the configured herd shape. Missing entries keep the default.
pub fn herd_size(configured: &[u32]) -> [DimSize; 3] {
    override_defaults(DEFAULT_HERD_SIZE, configured, "herd-size")
}

/// Returns the compute-tile and mid-tier tile sizes for a matmul.
///
/// The compute-tile size defaults to [MATMUL_L1_TILE_SIZE] and the mid-tier
/// size to the compute-tile size scaled by the herd. Explicit sizes replace
/// the leading dimensions of either.
pub fn matmul_tile_sizes(
    configured_herd: &[u32],
    l1_tile_size: &[DimSize],
    l2_tile_size: &[DimSize],
) -> (TileSizes, TileSizes) {
    let herd = herd_size(configured_herd);
    let l1 = override_defaults(MATMUL_L1_TILE_SIZE, l1_tile_size, "l1-tile-size");
    let scaled = [0, 1, 2].map(|i| l1[i] * herd[i]);
    let l2 = override_defaults(scaled, l2_tile_size, "l2-tile-size");
    (TileSizes::from_slice(&l1), TileSizes::from_slice(&l2))
}

/// Returns the mid-tier and compute-tile tile sizes for an NCHW convolution,
/// derived from the input, weight, and output shapes.
pub fn conv2d_tile_sizes(operands: &[&MemRefType]) -> Option<(TileSizes, TileSizes)> {
    KernelKind::Conv2dNchw.iteration_extents(operands)?;
    let (input, weight, output) = (operands[0], operands[1], operands[2]);
    let batch_hw = 1;
    let ifm_channels = input.shape[1];
    let ifm_height = input.shape[2];
    let ifm_width = input.shape[3];
    let ofm_channels = output.shape[1];
    let kernel_h = weight.shape[2];
    let kernel_w = weight.shape[3];
    let mid = TileSizes::from_slice(&[
        batch_hw,
        ofm_channels,
        ifm_height / 4,
        ifm_width,
        kernel_h,
        kernel_w,
        ifm_channels,
    ]);
    let local = TileSizes::from_slice(&[
        batch_hw,
        ofm_channels / 4,
        ifm_height / 4,
        ifm_width,
        kernel_h,
        kernel_w,
        ifm_channels,
    ]);
    Some((mid, local))
}

/// Builds a function applying one `kind` kernel to its three buffer
/// arguments, in the form kernels arrive in before this crate's passes.
pub fn kernel_function(
    name: &str,
    kind: KernelKind,
    operand_shapes: [&[DimSize]; 3],
    dtype: Dtype,
) -> Function {
    let types = operand_shapes.map(|s| Type::MemRef(MemRefType::new(s, dtype)));
    let mut func = Function::new(name, types);
    let args = func.args().into();
    let mut rw = Rewriter::new(&mut func);
    rw.insert(kind.op_kind(), args, None, None);
    rw.ret();
    func
}

pub fn matmul_function(name: &str, m: DimSize, n: DimSize, k: DimSize, dtype: Dtype) -> Function {
    kernel_function(name, KernelKind::Matmul, [&[m, k], &[k, n], &[m, n]], dtype)
}

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;

/// A static extent. Shapes in this crate are always fully static.
pub type DimSize = i64;
pub type Shape = SmallVec<[DimSize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Float32,
    Bfloat16,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Uint16 | Dtype::Sint16 | Dtype::Bfloat16 => 2,
            Dtype::Uint32 | Dtype::Sint32 | Dtype::Float32 => 4,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Bfloat16 => write!(f, "bf16"),
        }
    }
}

/// The memory tier a buffer lives in.
///
/// The numeric ids match the accelerator's memory-space numbering: global
/// memory is the default space 0, the mid-tier (shared) buffer is space 1 and
/// the compute-tile-local buffer is space 2.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum MemorySpace {
    #[default]
    Global,
    L2,
    L1,
}

impl MemorySpace {
    pub fn id(&self) -> u8 {
        match self {
            MemorySpace::Global => 0,
            MemorySpace::L2 => 1,
            MemorySpace::L1 => 2,
        }
    }
}

impl Display for MemorySpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Returns the number of elements in a shape.
pub fn volume(shape: &[DimSize]) -> DimSize {
    shape.iter().product()
}

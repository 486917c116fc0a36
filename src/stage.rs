//! Pipeline stage markers and the per-kernel transition table.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::kernel::KernelKind;

/// The position of a kernel op in the tiling/promotion sequence.
///
/// Stages are totally ordered; a transition always moves an op to a strictly
/// later stage.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    Display,
    EnumIter,
    EnumString,
)]
pub enum Stage {
    #[strum(serialize = "kernel-selected")]
    Selected,
    #[strum(serialize = "tiled-to-mid-tier")]
    TiledMid,
    #[strum(serialize = "promoted-to-mid-tier")]
    PromotedMid,
    #[strum(serialize = "tiled-to-compute-tile")]
    TiledLocal,
    #[strum(serialize = "promoted-to-compute-tile")]
    PromotedLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Transition {
    TileMid,
    PromoteMid,
    TileLocal,
    PromoteLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub from: Stage,
    pub transition: Transition,
    pub to: Stage,
}

const fn step(from: Stage, transition: Transition, to: Stage) -> Step {
    Step {
        from,
        transition,
        to,
    }
}

static MATMUL_STEPS: [Step; 3] = [
    step(Stage::Selected, Transition::TileMid, Stage::TiledMid),
    // divide the mid-tier tile up evenly between compute tiles
    step(Stage::TiledMid, Transition::TileLocal, Stage::TiledLocal),
    step(Stage::TiledLocal, Transition::PromoteLocal, Stage::PromotedLocal),
];

static PROMOTING_STEPS: [Step; 4] = [
    step(Stage::Selected, Transition::TileMid, Stage::TiledMid),
    step(Stage::TiledMid, Transition::PromoteMid, Stage::PromotedMid),
    step(Stage::PromotedMid, Transition::TileLocal, Stage::TiledLocal),
    step(Stage::TiledLocal, Transition::PromoteLocal, Stage::PromotedLocal),
];

/// The ordered transitions a kernel instance goes through.
///
/// Convolutions always promote at the mid tier. Matmuls do so only when
/// `promote_mid` is set.
pub fn steps(kind: KernelKind, promote_mid: bool) -> &'static [Step] {
    match (kind, promote_mid) {
        (KernelKind::Matmul, false) => &MATMUL_STEPS,
        (KernelKind::Matmul, true) | (KernelKind::Conv2dNchw, _) => &PROMOTING_STEPS,
    }
}

/// The transition applicable to an op of `kind` currently at `current`, if any.
pub fn next_step(kind: KernelKind, promote_mid: bool, current: Stage) -> Option<Step> {
    steps(kind, promote_mid)
        .iter()
        .find(|s| s.from == current)
        .copied()
}

pub fn terminal_stage(kind: KernelKind, promote_mid: bool) -> Stage {
    steps(kind, promote_mid)
        .last()
        .map_or(Stage::Selected, |s| s.to)
}

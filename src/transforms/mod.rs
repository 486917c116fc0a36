use serde::{Deserialize, Serialize};

use crate::ir::Operation;
use crate::rewrite::{NotApplicableReason, PatternSet};
use crate::stage::Stage;

use fold_subviews::FoldSubViews;
use remove_subviews::RemoveSubViews;

pub mod fold_subviews;
pub mod promotion;
pub mod remove_subviews;
pub mod tiling;

/// Guards a rule on an op's current stage marker and names the marker the
/// rule leaves on the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct StageFilter {
    pub current: Stage,
    pub next: Stage,
}

impl StageFilter {
    pub fn new(current: Stage, next: Stage) -> Self {
        debug_assert!(current < next);
        StageFilter { current, next }
    }

    pub fn check(&self, op: &Operation) -> Result<(), NotApplicableReason> {
        if op.marker == Some(self.current) {
            Ok(())
        } else {
            Err(NotApplicableReason::MarkerMismatch {
                expected: Some(self.current),
                found: op.marker,
            })
        }
    }
}

/// The view clean-up rules: reallocate promoted buffers, then fold
/// sub-view chains.
pub fn view_folding_patterns() -> PatternSet {
    PatternSet::new()
        .with(RemoveSubViews::default())
        .with(FoldSubViews)
}

use enum_dispatch::enum_dispatch;
use log::{debug, trace, warn};

use crate::ir::{Function, OpId, Rewriter};
use crate::stage::Stage;
use crate::transforms::fold_subviews::FoldSubViews;
use crate::transforms::promotion::LinalgPromotion;
use crate::transforms::remove_subviews::RemoveSubViews;
use crate::transforms::tiling::LinalgTiling;

use canonicalize::{FoldAddIConstants, FoldSubViewConstantOffsets, SimplifyTrivialLoops};

pub mod canonicalize;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// A local match-and-rewrite rule.
#[enum_dispatch]
pub trait RewritePattern {
    /// Checks whether the rule applies to `op` without changing anything.
    fn check(&self, func: &Function, op: OpId) -> Result<(), NotApplicableReason>;

    /// Rewrites `op`. The caller must first establish that [RewritePattern::check]
    /// succeeds for the same `op`; calling this otherwise is a logic error.
    fn rewrite(&self, rewriter: &mut Rewriter<'_>, op: OpId);

    fn match_and_rewrite(
        &self,
        rewriter: &mut Rewriter<'_>,
        op: OpId,
    ) -> Result<(), NotApplicableReason> {
        self.check(rewriter.func(), op)?;
        rewriter.set_insertion_point_before(op);
        self.rewrite(rewriter, op);
        Ok(())
    }
}

/// The closed set of rules applied by this crate's passes.
#[derive(Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[enum_dispatch(RewritePattern)]
pub enum Pattern {
    LinalgTiling(LinalgTiling),
    LinalgPromotion(LinalgPromotion),
    FoldSubViews(FoldSubViews),
    RemoveSubViews(RemoveSubViews),
    SimplifyTrivialLoops(SimplifyTrivialLoops),
    FoldAddIConstants(FoldAddIConstants),
    FoldSubViewConstantOffsets(FoldSubViewConstantOffsets),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotApplicableReason {
    #[error("Op kind does not match the rule")]
    WrongKind,
    #[error("Expected marker {expected:?}, found {found:?}")]
    MarkerMismatch {
        expected: Option<Stage>,
        found: Option<Stage>,
    },
    #[error("Operands are not shaped like the kernel expects")]
    UnsupportedOperands,
    #[error("Expected at most {rank} tile sizes, got {got}")]
    TileRankMismatch { rank: usize, got: usize },
    #[error("Interchange is not a permutation of the loop dimensions")]
    InvalidInterchange,
    #[error("No designated operand is a sub-view")]
    NothingToPromote,
    #[error("Sub-view source is not itself a sub-view")]
    SourceNotSubView,
    #[error("Chained sub-views have different index mappings")]
    LayoutMismatch,
    #[error("Outer window does not fit the inner view")]
    IncompatibleWindow,
    #[error("Sub-view source is not a view of an allocation")]
    SourceNotViewOfAlloc,
    #[error("No trivial loop dimension")]
    NoTrivialLoop,
    #[error("Nothing to fold")]
    NothingToFold,
}

/// An ordered collection of rules. Earlier rules are tried first.
#[derive(Clone, Debug, Default)]
pub struct PatternSet(Vec<Pattern>);

impl PatternSet {
    pub fn new() -> Self {
        PatternSet::default()
    }

    #[must_use]
    pub fn with(mut self, pattern: impl Into<Pattern>) -> Self {
        self.push(pattern);
        self
    }

    pub fn push(&mut self, pattern: impl Into<Pattern>) {
        self.0.push(pattern.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Pattern> for PatternSet {
    fn from_iter<T: IntoIterator<Item = Pattern>>(iter: T) -> Self {
        PatternSet(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub iterations: usize,
    pub rewrites: usize,
    pub converged: bool,
}

/// Applies `patterns` to every op of `func` until no rule applies.
///
/// Each sweep visits the ops live at its start in pre-order and applies the
/// first rule that matches each, then erases trivially dead ops. Sweeps
/// repeat until one changes nothing or `max_iterations` sweeps have run.
pub fn apply_patterns_greedily(
    func: &mut Function,
    patterns: &PatternSet,
    max_iterations: usize,
) -> ApplyResult {
    let mut result = ApplyResult::default();
    while result.iterations < max_iterations {
        result.iterations += 1;
        let mut sweep_rewrites = 0;
        for op in func.walk() {
            if !func.is_live(op) {
                continue;
            }
            for pattern in patterns.iter() {
                let mut rewriter = Rewriter::new(func);
                match pattern.match_and_rewrite(&mut rewriter, op) {
                    Ok(()) => {
                        let name: &'static str = pattern.into();
                        trace!("Applied {name} to {op:?}");
                        sweep_rewrites += 1;
                        break;
                    }
                    Err(reason) => {
                        let name: &'static str = pattern.into();
                        trace!("{name} declined {op:?}: {reason}");
                    }
                }
            }
        }
        let erased = func.erase_trivially_dead();
        result.rewrites += sweep_rewrites;
        if sweep_rewrites == 0 && erased == 0 {
            result.converged = true;
            break;
        }
    }
    if result.converged {
        debug!(
            "Converged on @{} after {} sweeps and {} rewrites",
            func.name(),
            result.iterations,
            result.rewrites
        );
    } else {
        warn!(
            "Rewriting @{} did not converge within {} sweeps",
            func.name(),
            max_iterations
        );
    }
    result
}

use log::debug;

use crate::ir::{Function, Module, OpId, Rewriter};
use crate::stage::Stage;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OutlineError {
    #[error("No function named `{0}`")]
    UnknownFunction(String),
    #[error("{0:?} has been erased")]
    ErasedOp(OpId),
    #[error("{0:?} produces a value and cannot be replaced by a call")]
    ProducesValue(OpId),
}

/// The result of outlining a single op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outlined {
    /// The call left in the caller in place of the op.
    pub call: OpId,
    pub callee: String,
    /// The op's copy inside the callee.
    pub op: OpId,
}

/// Extracts single operations into their own functions.
#[derive(Debug, Clone, Default)]
pub struct Outliner {
    marker: Option<Stage>,
}

impl Outliner {
    pub fn new() -> Self {
        Outliner::default()
    }

    /// Tags the outlined copy with `marker`, replacing whatever it carried.
    #[must_use]
    pub fn with_marker(mut self, marker: Stage) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Moves `op` out of `caller` into a new function named after
    /// `name_hint`, and calls that function in its place.
    ///
    /// The new function takes the op's operands as arguments, in order.
    pub fn outline(
        &self,
        module: &mut Module,
        caller: &str,
        op: OpId,
        name_hint: &str,
    ) -> Result<Outlined, OutlineError> {
        let name = module.unique_name(name_hint);
        let func = module
            .function_mut(caller)
            .ok_or_else(|| OutlineError::UnknownFunction(caller.to_owned()))?;
        if !func.is_live(op) {
            return Err(OutlineError::ErasedOp(op));
        }
        let original = func.op(op).clone();
        if original.result.is_some() {
            return Err(OutlineError::ProducesValue(op));
        }

        let arg_types = original
            .operands
            .iter()
            .map(|&v| func.value_type(v).clone())
            .collect::<Vec<_>>();
        let mut callee = Function::new(name.clone(), arg_types);
        let params = callee.args().into();
        let mut body = Rewriter::new(&mut callee);
        let cloned = body.insert(
            original.kind,
            params,
            None,
            self.marker.or(original.marker),
        );
        body.ret();

        let mut rewriter = Rewriter::new(func);
        rewriter.set_insertion_point_before(op);
        let call = rewriter.call(name.clone(), &original.operands);
        rewriter.erase_op(op);

        debug!("Outlined {op:?} from @{caller} into @{name}");
        module.add_function(callee);
        Ok(Outlined {
            call,
            callee: name,
            op: cloned,
        })
    }
}

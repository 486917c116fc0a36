//! Concrete evaluation of buffer views, for checking that view rewrites keep
//! addressing the same elements.

use ndarray::{ArrayD, IxDyn, Slice};
use std::collections::HashMap;

use crate::ir::{Function, OpKind, Offset, ValueId};

/// Run-time values of index-typed values (usually function arguments).
pub type Bindings = HashMap<ValueId, i64>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("No binding for index value {0:?}")]
    Unbound(ValueId),
    #[error("Value {0:?} is not a buffer")]
    NotABuffer(ValueId),
    #[error("Window of {0:?} leaves its source")]
    OutOfBounds(ValueId),
}

/// The elements a buffer value addresses: its root buffer, plus the linear
/// (row-major) index into the root of each addressed element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedElements {
    pub root: ValueId,
    pub indices: ArrayD<i64>,
}

pub fn eval_index(func: &Function, v: ValueId, bindings: &Bindings) -> Result<i64, EvalError> {
    if let Some(value) = bindings.get(&v) {
        return Ok(*value);
    }
    let Some(op) = func.defining_op(v) else {
        return Err(EvalError::Unbound(v));
    };
    let o = func.op(op);
    match o.kind {
        OpKind::Constant(c) => Ok(c),
        OpKind::AddI => Ok(eval_index(func, o.operands[0], bindings)?
            + eval_index(func, o.operands[1], bindings)?),
        _ => Err(EvalError::Unbound(v)),
    }
}

/// Follows `v` through its chain of sub-views to the underlying buffer.
pub fn addressed_elements(
    func: &Function,
    v: ValueId,
    bindings: &Bindings,
) -> Result<AddressedElements, EvalError> {
    let ty = func.memref_type(v).ok_or(EvalError::NotABuffer(v))?;
    let sub = func.defining_op(v).and_then(|op| match &func.op(op).kind {
        OpKind::SubView(attrs) => Some((op, attrs)),
        _ => None,
    });
    let Some((op, attrs)) = sub else {
        let shape = ty.shape.iter().map(|&d| d as usize).collect::<Vec<_>>();
        let cols = shape.clone();
        let indices = ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
            let mut linear = 0i64;
            for (i, d) in cols.iter().enumerate() {
                linear = linear * *d as i64 + idx[i] as i64;
            }
            linear
        });
        return Ok(AddressedElements { root: v, indices });
    };

    let operands = &func.op(op).operands;
    let source = addressed_elements(func, operands[0], bindings)?;
    let mut dynamic = operands[1..].iter();
    let mut starts = Vec::with_capacity(attrs.offsets.len());
    for offset in &attrs.offsets {
        starts.push(match offset {
            Offset::Static(s) => *s,
            Offset::Dynamic => {
                let operand = dynamic.next().ok_or(EvalError::Unbound(v))?;
                eval_index(func, *operand, bindings)?
            }
        });
    }
    let source_shape = source.indices.shape().to_vec();
    for (axis, &start) in starts.iter().enumerate() {
        let last = start + (attrs.sizes[axis] - 1) * attrs.strides[axis];
        if start < 0 || last >= source_shape[axis] as i64 {
            return Err(EvalError::OutOfBounds(v));
        }
    }
    let indices = source
        .indices
        .slice_each_axis(|ax| {
            let axis = ax.axis.index();
            let start = starts[axis];
            let end = start + (attrs.sizes[axis] - 1) * attrs.strides[axis] + 1;
            Slice::new(start as isize, Some(end as isize), attrs.strides[axis] as isize)
        })
        .to_owned();
    Ok(AddressedElements {
        root: source.root,
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::{MemRefType, Rewriter, SubViewAttrs, Type};
    use smallvec::smallvec;

    #[test]
    fn test_nested_windows_address_root_elements() {
        let ty = MemRefType::new(&[4, 6], Dtype::Float32);
        let mut func = Function::new("f", [Type::MemRef(ty), Type::Index]);
        let (buf, i) = (func.args()[0], func.args()[1]);
        let mut rw = Rewriter::new(&mut func);
        let outer = rw.subview_with_offsets(
            buf,
            SubViewAttrs {
                offsets: smallvec![Offset::Dynamic, Offset::Static(2)],
                sizes: smallvec![2, 4],
                strides: smallvec![1, 1],
            },
            &[i],
        );
        let inner = rw.subview(
            outer,
            SubViewAttrs {
                offsets: smallvec![Offset::Static(1), Offset::Static(0)],
                sizes: smallvec![1, 2],
                strides: smallvec![1, 2],
            },
        );
        let bindings = Bindings::from([(i, 1)]);
        let elems = addressed_elements(&func, inner, &bindings).unwrap();
        assert_eq!(elems.root, buf);
        assert_eq!(elems.indices.shape(), &[1, 2]);
        assert_eq!(elems.indices.iter().copied().collect::<Vec<_>>(), vec![14, 16]);
    }

    #[test]
    fn test_unbound_offset_is_reported() {
        let ty = MemRefType::new(&[8], Dtype::Uint8);
        let mut func = Function::new("f", [Type::MemRef(ty), Type::Index]);
        let (buf, i) = (func.args()[0], func.args()[1]);
        let mut rw = Rewriter::new(&mut func);
        let attrs = SubViewAttrs {
            offsets: smallvec![Offset::Dynamic],
            sizes: smallvec![4],
            strides: smallvec![1],
        };
        let sv = rw.subview_with_offsets(buf, attrs, &[i]);
        assert_eq!(
            addressed_elements(&func, sv, &Bindings::new()),
            Err(EvalError::Unbound(i))
        );
        let far = Bindings::from([(i, 5)]);
        assert_eq!(
            addressed_elements(&func, sv, &far),
            Err(EvalError::OutOfBounds(sv))
        );
    }
}

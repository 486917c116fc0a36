use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::{self, Display, Write};

use crate::common::MemorySpace;
use crate::ir::{Function, Layout, MemRefType, OpId, OpKind, Offset, Type, ValueDef, ValueId};
use crate::utils::indent;

impl Display for MemRefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memref<")?;
        for d in &self.shape {
            write!(f, "{d}x")?;
        }
        write!(f, "{}", self.dtype)?;
        if let Layout::Strided { offset, strides } = &self.layout {
            let offset_str = offset.map_or_else(|| "?".to_owned(), |o| o.to_string());
            write!(
                f,
                ", strided<[{}], offset: {}>",
                strides.iter().join(", "),
                offset_str
            )?;
        }
        if self.space != MemorySpace::Global {
            write!(f, ", {}", self.space)?;
        }
        write!(f, ">")
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Index => write!(f, "index"),
            Type::MemRef(m) => write!(f, "{m}"),
        }
    }
}

/// Assigns printable names to values in order of first definition.
struct ValueNames {
    names: HashMap<ValueId, String>,
    next: usize,
}

impl ValueNames {
    fn new(func: &Function) -> Self {
        let names = func
            .args()
            .iter()
            .map(|&a| match func.value_def(a) {
                ValueDef::Argument(i) => (a, format!("%arg{i}")),
                _ => unreachable!(),
            })
            .collect();
        ValueNames { names, next: 0 }
    }

    fn define(&mut self, v: ValueId) -> &str {
        let next = &mut self.next;
        self.names.entry(v).or_insert_with(|| {
            let name = format!("%{next}");
            *next += 1;
            name
        })
    }

    fn get(&self, v: ValueId) -> String {
        self.names
            .get(&v)
            .cloned()
            .unwrap_or_else(|| format!("%<undef{}>", v.index()))
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = ValueNames::new(self);
        let args = self
            .args()
            .iter()
            .map(|&a| format!("{}: {}", names.get(a), self.value_type(a)))
            .join(", ");
        writeln!(f, "func @{}({}) {{", self.name(), args)?;
        let mut out = String::new();
        for &op in self.body() {
            print_op(self, op, &mut names, 1, &mut out)?;
        }
        write!(f, "{out}")?;
        writeln!(f, "}}")
    }
}

fn print_op(
    func: &Function,
    op: OpId,
    names: &mut ValueNames,
    depth: usize,
    out: &mut String,
) -> fmt::Result {
    let o = func.op(op);
    let pad = indent(depth);
    let operand_names = o.operands.iter().map(|&v| names.get(v)).collect::<Vec<_>>();
    let typed = |i: usize| format!("{}", func.value_type(o.operands[i]));
    let marker = o
        .marker
        .map(|m| format!(" {{marker = \"{m}\"}}"))
        .unwrap_or_default();
    let lhs = o
        .result
        .map(|r| format!("{} = ", names.define(r)))
        .unwrap_or_default();
    match &o.kind {
        OpKind::Constant(c) => writeln!(out, "{pad}{lhs}arith.constant {c} : index"),
        OpKind::AddI => writeln!(
            out,
            "{pad}{lhs}arith.addi {}, {} : index",
            operand_names[0], operand_names[1]
        ),
        OpKind::Alloc => writeln!(
            out,
            "{pad}{lhs}memref.alloc() : {}",
            func.value_type(func.result(op))
        ),
        OpKind::Dealloc => writeln!(out, "{pad}memref.dealloc {} : {}", operand_names[0], typed(0)),
        OpKind::View => writeln!(
            out,
            "{pad}{lhs}memref.view {}[][] : {} to {}",
            operand_names[0],
            typed(0),
            func.value_type(func.result(op))
        ),
        OpKind::SubView(attrs) => {
            let mut dynamic = operand_names[1..].iter();
            let offsets = attrs
                .offsets
                .iter()
                .map(|off| match off {
                    Offset::Static(v) => v.to_string(),
                    Offset::Dynamic => dynamic
                        .next()
                        .cloned()
                        .unwrap_or_else(|| "<missing>".to_owned()),
                })
                .join(", ");
            writeln!(
                out,
                "{pad}{lhs}memref.subview {}[{}] [{}] [{}] : {} to {}",
                operand_names[0],
                offsets,
                attrs.sizes.iter().join(", "),
                attrs.strides.iter().join(", "),
                typed(0),
                func.value_type(func.result(op))
            )
        }
        OpKind::Copy => writeln!(
            out,
            "{pad}linalg.copy({}, {}) : {}, {}",
            operand_names[0],
            operand_names[1],
            typed(0),
            typed(1)
        ),
        OpKind::Matmul | OpKind::Conv2dNchw => {
            let name = if o.kind == OpKind::Matmul {
                "linalg.matmul"
            } else {
                "linalg.conv_2d_nchw"
            };
            let n = operand_names.len();
            writeln!(
                out,
                "{pad}{name}{marker} ins({} : {}) outs({} : {})",
                operand_names[..n - 1].join(", "),
                (0..n - 1).map(typed).join(", "),
                operand_names[n - 1],
                typed(n - 1)
            )
        }
        OpKind::For(dim) => {
            let iv = names.define(o.region_args[0]).to_owned();
            writeln!(
                out,
                "{pad}scf.for {iv} = {} to {} step {} {{",
                dim.lb, dim.ub, dim.step
            )?;
            print_region(func, op, names, depth, out)
        }
        OpKind::Parallel(dims) => {
            let ivs = o
                .region_args
                .iter()
                .map(|&iv| names.define(iv).to_owned())
                .join(", ");
            writeln!(
                out,
                "{pad}scf.parallel ({ivs}) = ({}) to ({}) step ({}) {{",
                dims.iter().map(|d| d.lb).join(", "),
                dims.iter().map(|d| d.ub).join(", "),
                dims.iter().map(|d| d.step).join(", "),
            )?;
            print_region(func, op, names, depth, out)
        }
        OpKind::Call(callee) => writeln!(
            out,
            "{pad}call @{callee}({}) : ({}) -> ()",
            operand_names.join(", "),
            (0..operand_names.len()).map(typed).join(", ")
        ),
        OpKind::Return => writeln!(out, "{pad}return"),
    }
}

fn print_region(
    func: &Function,
    op: OpId,
    names: &mut ValueNames,
    depth: usize,
    out: &mut String,
) -> fmt::Result {
    for &child in &func.op(op).region {
        print_op(func, child, names, depth + 1, out)?;
    }
    writeln!(out, "{}}}", indent(depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ir::{LoopDim, Rewriter, SubViewAttrs};
    use smallvec::smallvec;

    #[test]
    fn test_memref_type_display() {
        let ty = MemRefType::new(&[64, 64], Dtype::Sint32).in_space(MemorySpace::L2);
        assert_eq!(ty.to_string(), "memref<64x64xi32, 1>");
        let sub = SubViewAttrs {
            offsets: smallvec![Offset::Dynamic, Offset::Static(0)],
            sizes: smallvec![32, 64],
            strides: smallvec![1, 1],
        }
        .result_type(&MemRefType::new(&[128, 64], Dtype::Float32));
        assert_eq!(
            sub.to_string(),
            "memref<32x64xf32, strided<[64, 1], offset: ?>>"
        );
    }

    #[test]
    fn test_print_loop_nest() {
        let a = MemRefType::new(&[8], Dtype::Sint32);
        let mut func = Function::new("f", [Type::MemRef(a)]);
        let arg = func.args()[0];
        let mut rw = Rewriter::new(&mut func);
        let (lp, iv) = rw.for_loop(LoopDim::new(0, 8, 4));
        rw.set_insertion_point_to_end(Some(lp));
        let attrs = SubViewAttrs {
            offsets: smallvec![Offset::Dynamic],
            sizes: smallvec![4],
            strides: smallvec![1],
        };
        rw.subview_with_offsets(arg, attrs, &[iv]);
        rw.set_insertion_point_to_end(None);
        rw.ret();
        let text = func.to_string();
        assert!(text.contains("func @f(%arg0: memref<8xi32>) {"));
        assert!(text.contains("scf.for %0 = 0 to 8 step 4 {"));
        assert!(text.contains("memref.subview %arg0[%0] [4] [1]"));
        assert!(text.trim_end().ends_with('}'));
    }
}

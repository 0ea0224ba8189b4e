//! Evaluates nodes whose inputs are all known constants on the host.

use crate::{
    array::StridedArray,
    operation::{Operation, ProcessingOp},
};

use super::post_order;

fn constant_input(operand: &StridedArray) -> Option<f32> {
    if operand.is_lazy() {
        None
    } else {
        operand.constant_value()
    }
}

fn fold(node: &StridedArray) -> Option<f32> {
    let descriptor = node.descriptor()?;
    let operands = &descriptor.operands;
    match &descriptor.operation {
        Operation::Elementwise {
            body, out: None, ..
        } => {
            let values = operands
                .iter()
                .map(constant_input)
                .collect::<Option<Vec<f32>>>()?;
            Some(body.eval(&|name| values[name.0], 0.0))
        }
        // Results written into a destination have to land in its buffer.
        Operation::Elementwise { .. } => None,
        Operation::View(_) => constant_input(operands.first()?),
        Operation::Reduce { op, axis, .. } => {
            let source = operands.first()?;
            let value = constant_input(source)?;
            let shape = source.shape();
            let count = match axis {
                Some(axis) => shape[*axis],
                None => shape.iter().product(),
            };
            Some(op.fold_constant(value, count))
        }
        Operation::Processing {
            op: ProcessingOp::MatMul,
            epilogue: None,
            out: None,
        } => {
            let [a, b] = operands.as_slice() else {
                return None;
            };
            let inner = a.shape()[2];
            Some(constant_input(a)? * constant_input(b)? * inner as f32)
        }
        Operation::Processing { .. } => None,
    }
}

pub(crate) fn run(root: &StridedArray) {
    let mut folded = 0;
    for node in post_order(root) {
        if let Some(value) = fold(&node) {
            log::trace!("folded {node:?} to {value}");
            node.become_constant(value);
            folded += 1;
        }
    }
    if folded > 0 {
        log::debug!("constant folding removed {folded} nodes");
    }
}

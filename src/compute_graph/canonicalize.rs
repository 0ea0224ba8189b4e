//! Operand canonicalization: every elementwise node reads each distinct array once,
//! and only the arrays its body actually uses.

use std::collections::HashMap;

use crate::{
    array::{NodeId, StridedArray},
    expr::Expr,
    operation::{Operation, OperationDescriptor},
};

use super::post_order;

/// Dedupe `operands[first..]` by node and drop the ones `body` never reads.
///
/// Operands before `first` keep their positions. The rest are renumbered in order of
/// first use in `body`.
pub(crate) fn canonical_operands(
    body: &Expr,
    operands: &[StridedArray],
    first: usize,
) -> (Expr, Vec<StridedArray>) {
    let mut kept: Vec<StridedArray> = operands[..first.min(operands.len())].to_vec();
    let mut slots: HashMap<NodeId, usize> = HashMap::new();
    let mut renamed: HashMap<usize, usize> = HashMap::new();

    for name in body.operands() {
        let index = name.0;
        if index < first {
            continue;
        }
        let Some(operand) = operands.get(index) else {
            continue;
        };
        let slot = *slots.entry(operand.id()).or_insert_with(|| {
            kept.push(operand.clone());
            kept.len() - 1
        });
        renamed.insert(index, slot);
    }

    let body = body.substitute(&mut |name| {
        Expr::operand(renamed.get(&name.0).copied().unwrap_or(name.0))
    });
    (body, kept)
}

pub(crate) fn run(root: &StridedArray) {
    for node in post_order(root) {
        let Some(descriptor) = node.descriptor() else {
            continue;
        };
        let Operation::Elementwise { op, body, out } = descriptor.operation else {
            continue;
        };
        let (body, operands) = canonical_operands(&body, &descriptor.operands, 0);
        if operands.len() != descriptor.operands.len() {
            log::trace!(
                "canonicalized {op:?} from {} to {} operands",
                descriptor.operands.len(),
                operands.len()
            );
        }
        node.set_descriptor(OperationDescriptor::new(
            Operation::Elementwise { op, body, out },
            operands,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DeviceConfig, expr::BinaryFn, test_util::test_device_with};

    #[tokio::test]
    async fn repeated_operands_are_merged() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let x = StridedArray::full(&device, &[3], 2.0).unwrap();
        let y = StridedArray::full(&device, &[3], 3.0).unwrap();
        // C * (A + C) with A = x, B = y (unused), C = x
        let body = Expr::binary(
            BinaryFn::Mul,
            Expr::operand(2),
            Expr::binary(BinaryFn::Add, Expr::operand(0), Expr::operand(2)),
        );
        let (body, operands) = canonical_operands(&body, &[x.clone(), y.clone(), x.clone()], 0);
        assert_eq!(body.to_string(), "(A * (A + A))");
        assert_eq!(operands.len(), 1);
        assert_eq!(operands[0].id(), x.id());

        // Leading operands stay put even when unused.
        let (body, operands) =
            canonical_operands(&Expr::operand(3), &[x.clone(), y, x.clone(), x], 2);
        assert_eq!(body.to_string(), "C");
        assert_eq!(operands.len(), 3);
    }

    #[tokio::test]
    async fn squaring_reads_one_buffer() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let x = StridedArray::new(&device, &[1., 2., 3.]).unwrap();
        let squared = x.mul(&x).unwrap();
        run(&squared);
        let descriptor = squared.descriptor().unwrap();
        assert_eq!(descriptor.operands.len(), 1);
        assert_eq!(squared.to_host().unwrap().as_slice(), &[1., 4., 9.]);
    }
}

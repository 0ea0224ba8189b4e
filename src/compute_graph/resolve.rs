use crate::{
    array::{KernelOperand, StridedArray},
    element_wise,
    error::{ArrayError, Result},
    matmul,
    operation::{Operation, ProcessingOp},
    reduce,
};

use super::post_order;

/// Execute every lazy node behind `root`, operands first.
pub(crate) fn resolve(root: &StridedArray) -> Result<()> {
    for node in post_order(root) {
        resolve_node(&node)?;
    }
    Ok(())
}

fn resolve_node(node: &StridedArray) -> Result<()> {
    let Some(descriptor) = node.descriptor() else {
        return Ok(());
    };
    if !node.is_lazy() {
        return Ok(());
    }
    let device = node.device();
    let operands = &descriptor.operands;
    log::trace!("resolving {}", descriptor.label());

    match &descriptor.operation {
        Operation::View(op) => {
            let source = operands.first().ok_or_else(|| {
                ArrayError::unsupported(format!("{op:?} view without a source array"))
            })?;
            let (buffer, constant) = {
                let state = source.state();
                (state.buffer.clone(), state.constant)
            };
            node.materialize(buffer, constant, None);
        }
        Operation::Elementwise { op, body, out } => {
            let (buffer, layout) =
                element_wise::run(device, *op, body, &node.shape(), operands, out.as_ref())?;
            node.materialize(Some(buffer), None, Some(layout));
        }
        Operation::Reduce { op, axis, .. } => {
            let source = operands.first().ok_or_else(|| {
                ArrayError::unsupported(format!("{op:?} reduction without an input array"))
            })?;
            match source.kernel_operand()? {
                KernelOperand::Constant(value) => {
                    let shape = source.shape();
                    let count = match axis {
                        Some(axis) => shape[*axis],
                        None => shape.iter().product(),
                    };
                    node.materialize(None, Some(op.fold_constant(value, count)), None);
                }
                KernelOperand::Buffer { buffer, layout } => {
                    let buffer = reduce::run(device, *op, buffer, &layout, *axis)?;
                    node.materialize(Some(buffer), None, None);
                }
            }
        }
        Operation::Processing {
            op: ProcessingOp::MatMul,
            epilogue,
            out,
        } => {
            let [a, b, extra @ ..] = operands.as_slice() else {
                return Err(ArrayError::unsupported("matmul needs two operands"));
            };
            let (buffer, layout) = matmul::run(
                device,
                &node.shape(),
                a,
                b,
                epilogue.as_ref(),
                extra,
                out.as_ref(),
            )?;
            node.materialize(Some(buffer), None, Some(layout));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{DeviceConfig, OptimizerConfig},
        operation::{ElementwiseOp, Operator, ProcessingOp, ReduceOp},
        test_util::test_device_with,
        StridedArray,
    };

    #[tokio::test]
    async fn every_node_launches_once_without_optimization() {
        let config = DeviceConfig::default().with_optimizer(OptimizerConfig::disabled());
        let Some(device) = test_device_with(config).await else {
            return;
        };
        let a = StridedArray::new(&device, &[[1., 2.], [3., 4.]]).unwrap();
        let shared = a.matmul(&a).unwrap();
        let y = shared
            .add(&shared)
            .unwrap()
            .exp()
            .unwrap()
            .sum(Some(1), false)
            .unwrap()
            .log()
            .unwrap();
        let result = y.to_host().unwrap();

        let stats = device.kernel_stats();
        assert_eq!(stats.launches(Operator::Processing(ProcessingOp::MatMul)), 1);
        assert_eq!(stats.launches(Operator::Elementwise(ElementwiseOp::Add)), 1);
        assert_eq!(stats.launches(Operator::Elementwise(ElementwiseOp::Exp)), 1);
        assert_eq!(stats.launches(Operator::Reduce(ReduceOp::Sum)), 1);
        assert_eq!(stats.launches(Operator::Elementwise(ElementwiseOp::Log)), 1);

        // a @ a = [[7, 10], [15, 22]]
        let expected = [
            (14f32.exp() + 20f32.exp()).ln(),
            (30f32.exp() + 44f32.exp()).ln(),
        ];
        for (value, expected) in result.as_slice().iter().zip(expected) {
            assert!((value - expected).abs() <= 1e-4 * expected);
        }
        assert!(!shared.is_lazy());
    }
}

//! Kernel fusion.
//!
//! Elementwise fusion inlines an elementwise dependency into its consumer when
//! nothing else reads the dependency, including when the consumer reads it through
//! a view. Processing fusion then folds an elementwise consumer of a matmul into the
//! matmul as an epilogue applied to the accumulator.

use std::collections::HashMap;

use crate::{
    array::{NodeId, StridedArray},
    device::Device,
    expr::Expr,
    layout::Layout,
    operation::{Operation, OperationDescriptor, ViewOp},
};

use super::{canonicalize::canonical_operands, consumer_counts, post_order};

/// Storage bindings every kernel needs besides its inputs: params and output.
const FIXED_BINDINGS: usize = 2;

/// Inputs that will be bound as buffers. Constants are inlined into the kernel.
fn buffer_count(operands: &[StridedArray]) -> usize {
    operands
        .iter()
        .filter(|operand| operand.is_lazy() || operand.constant_value().is_none())
        .count()
}

fn max_bindings(device: &Device) -> usize {
    device.limits().max_storage_buffers_per_shader_stage as usize
}

fn single_consumer(node: &StridedArray, counts: &HashMap<NodeId, usize>) -> bool {
    node.is_lazy() && counts.get(&node.id()).copied() == Some(1)
}

/// Body and operands of a lazy elementwise node that writes its own buffer.
fn elementwise_parts(node: &StridedArray) -> Option<(Expr, Vec<StridedArray>)> {
    let descriptor = node.descriptor()?;
    match descriptor.operation {
        Operation::Elementwise {
            body, out: None, ..
        } => Some((body, descriptor.operands)),
        _ => None,
    }
}

/// `operand` of a viewed elementwise node, read through `view` instead. `view` was
/// taken over the node's row-major result of shape `source_shape`.
fn view_operand(
    operand: &StridedArray,
    op: ViewOp,
    view: &Layout,
    source_shape: &[usize],
) -> Option<StridedArray> {
    if *operand.shape() != *source_shape {
        return None;
    }
    if !operand.is_lazy() && operand.constant_value().is_some() {
        return Some(operand.view(op, Layout::contiguous(view.shape())));
    }
    let descriptor = operand.descriptor().filter(|_| operand.is_lazy());
    if descriptor.as_ref().is_some_and(|d| d.has_destination()) {
        return None;
    }
    let layout = view.rebase(&operand.layout())?;
    // A lazy view shares its source's buffer, so the new view can read the source.
    match descriptor.filter(|d| d.is_view()).map(|d| d.operands) {
        Some(sources) => match sources.as_slice() {
            [source] => Some(source.view(op, layout)),
            _ => None,
        },
        None => Some(operand.view(op, layout)),
    }
}

/// The body of `dep` when it can be inlined into a consumer of the given shape.
///
/// A view of an elementwise node is inlined by reading the node's operands through
/// the view.
fn inlinable_body(
    dep: &StridedArray,
    shape: &[usize],
    counts: &HashMap<NodeId, usize>,
) -> Option<(Expr, Vec<StridedArray>)> {
    if !single_consumer(dep, counts) || *dep.shape() != *shape {
        return None;
    }
    let descriptor = dep.descriptor()?;
    let Operation::View(op) = descriptor.operation else {
        return elementwise_parts(dep);
    };
    let [source] = descriptor.operands.as_slice() else {
        return None;
    };
    let source_layout = source.layout();
    if !single_consumer(source, counts)
        || !source_layout.is_c_contiguous()
        || source_layout.offset() != 0
    {
        return None;
    }
    let (body, operands) = elementwise_parts(source)?;
    let view = dep.layout();
    let operands = operands
        .iter()
        .map(|operand| view_operand(operand, op, &view, source_layout.shape()))
        .collect::<Option<Vec<_>>>()?;
    log::trace!("reading {source:?} through its {op:?} view");
    Some((body, operands))
}

/// Inline every eligible dependency of `node`. Returns whether anything changed.
fn inline_dependencies(node: &StridedArray, counts: &HashMap<NodeId, usize>) -> bool {
    let Some(descriptor) = node.descriptor() else {
        return false;
    };
    let Operation::Elementwise { op, body, out } = descriptor.operation else {
        return false;
    };
    let shape = node.shape();
    let limit = max_bindings(node.device());
    let mut body = body;
    let mut operands = descriptor.operands.clone();
    let mut changed = false;

    for (index, dep) in descriptor.operands.iter().enumerate() {
        let Some((dep_body, dep_operands)) = inlinable_body(dep, &shape, counts) else {
            continue;
        };
        // The dependency's operands are appended, so earlier indices stay valid.
        let base = operands.len();
        operands.extend(dep_operands);
        let inlined = dep_body.substitute(&mut |name| Expr::operand(base + name.0));
        let candidate = body.substitute(&mut |name| {
            if name.0 == index {
                inlined.clone()
            } else {
                Expr::Operand(name)
            }
        });
        let (_, used) = canonical_operands(&candidate, &operands, 0);
        if buffer_count(&used) + FIXED_BINDINGS > limit {
            log::debug!("not fusing {dep:?} into {op:?}: binding limit {limit} reached");
            operands.truncate(base);
            continue;
        }
        log::trace!("fusing {dep:?} into {op:?}");
        body = candidate;
        changed = true;
    }

    if changed {
        let (body, operands) = canonical_operands(&body, &operands, 0);
        node.set_descriptor(OperationDescriptor::new(
            Operation::Elementwise { op, body, out },
            operands,
        ));
    }
    changed
}

/// Fuse elementwise chains until no consumer can absorb another dependency.
pub(crate) fn elementwise(root: &StridedArray) {
    loop {
        let nodes = post_order(root);
        let counts = consumer_counts(&nodes);
        // Consumers first, so whole chains collapse into the outermost node.
        let changed = nodes
            .iter()
            .rev()
            .any(|node| inline_dependencies(node, &counts));
        if !changed {
            break;
        }
    }
}

/// Turn `node` into a matmul with `node`'s body as its epilogue.
fn absorb_into_matmul(node: &StridedArray, counts: &HashMap<NodeId, usize>) -> bool {
    let Some(descriptor) = node.descriptor() else {
        return false;
    };
    let Operation::Elementwise { op, body, out } = descriptor.operation else {
        return false;
    };
    let mut products = descriptor
        .operands
        .iter()
        .enumerate()
        .filter(|(_, operand)| {
            operand.is_lazy() && operand.descriptor().is_some_and(|d| d.is_processing())
        });
    let (Some((index, product)), None) = (products.next(), products.next()) else {
        return false;
    };
    if counts.get(&product.id()).copied() != Some(1) || product.shape() != node.shape() {
        return false;
    }
    let Some(product_descriptor) = product.descriptor() else {
        return false;
    };
    let Operation::Processing {
        op: matmul,
        epilogue: None,
        out: None,
    } = product_descriptor.operation
    else {
        return false;
    };

    let epilogue = body.substitute(&mut |name| {
        if name.0 == index {
            Expr::Accumulator
        } else {
            Expr::operand(name.0 + 2)
        }
    });
    let mut operands = product_descriptor.operands;
    operands.extend(descriptor.operands.iter().cloned());
    let (epilogue, operands) = canonical_operands(&epilogue, &operands, 2);
    let limit = max_bindings(node.device());
    if 2 + buffer_count(&operands[2..]) + FIXED_BINDINGS > limit {
        log::debug!("not fusing {op:?} into {matmul:?}: binding limit {limit} reached");
        return false;
    }

    log::trace!("fusing {op:?} into {matmul:?} as `{epilogue}`");
    node.set_descriptor(OperationDescriptor::new(
        Operation::Processing {
            op: matmul,
            epilogue: Some(epilogue),
            out,
        },
        operands,
    ));
    true
}

/// Fold elementwise consumers into the matmuls they read.
pub(crate) fn processing(root: &StridedArray) {
    let nodes = post_order(root);
    let counts = consumer_counts(&nodes);
    let fused = nodes
        .iter()
        .filter(|node| absorb_into_matmul(node, &counts))
        .count();
    if fused > 0 {
        log::debug!("fused {fused} epilogues into matmuls");
    }
}

//! Collapses chains of views. Every view node records its full layout, so a view
//! of a view can read the grandparent directly.

use crate::{
    array::StridedArray,
    operation::{Operation, OperationDescriptor},
};

use super::post_order;

pub(crate) fn run(root: &StridedArray) {
    // Operands are rewired before their consumers, so one pass flattens a chain.
    for node in post_order(root) {
        let Some(descriptor) = node.descriptor() else {
            continue;
        };
        let Operation::View(op) = descriptor.operation else {
            continue;
        };
        let [source] = descriptor.operands.as_slice() else {
            continue;
        };
        if !source.is_lazy() {
            continue;
        }
        let Some(parent) = source.descriptor().filter(|parent| parent.is_view()) else {
            continue;
        };
        log::trace!("pruned {:?} view between {op:?} and its source", parent.operator());
        node.set_descriptor(OperationDescriptor::new(
            Operation::View(op),
            parent.operands,
        ));
    }
}

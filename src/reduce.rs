//! Segmented tree reductions over one axis, or over every axis.
//!
//! The reduced input is viewed as `[P1, SIZE, P2]`: every axis before the reduced
//! one merges into `P1` and every axis after it into `P2`. Each work-group folds one
//! segment of the reduced axis in workgroup memory and writes one partial result.
//! Passes repeat over the partial results until one segment covers the axis.

use std::{fmt::Write, sync::Arc};

use crate::{
    device::{Device, PooledBuffer},
    error::{ArrayError, Result},
    kernel::{dispatch_size, GenericKernel},
    layout::Layout,
    operation::{Operator, ReduceOp},
};

/// Largest power of two no greater than `size` or `max`.
pub(crate) fn group_size(size: usize, max: u32) -> u32 {
    let limit = (size.min(max as usize)).max(1) as u32;
    1 << (u32::BITS - 1 - limit.leading_zeros())
}

/// `(P1, SIZE, P2)` for a reduction of `shape` along `axis`.
pub(crate) fn merged_dims(shape: &[usize], axis: Option<usize>) -> (usize, usize, usize) {
    match axis {
        None => (1, shape.iter().product(), 1),
        Some(axis) => (
            shape[..axis].iter().product(),
            shape[axis],
            shape[axis + 1..].iter().product(),
        ),
    }
}

/// Shape of the reduction result.
pub(crate) fn reduced_shape(shape: &[usize], axis: Option<usize>, keepdims: bool) -> Vec<usize> {
    match (axis, keepdims) {
        (None, true) => vec![1; shape.len()],
        (None, false) => Vec::new(),
        (Some(axis), true) => {
            let mut shape = shape.to_vec();
            shape[axis] = 1;
            shape
        }
        (Some(axis), false) => {
            let mut shape = shape.to_vec();
            shape.remove(axis);
            shape
        }
    }
}

struct ReducePass {
    op: ReduceOp,
    group: u32,
    size: usize,
    batch_before: usize,
    batch_after: usize,
}

impl ReducePass {
    fn groups(&self) -> usize {
        self.size.div_ceil(self.group as usize)
    }

    fn kernel(&self) -> GenericKernel {
        let mut kernel = GenericKernel::new("reduce");
        kernel.set_workgroup_size([self.group, 1, 1]);
        let input = kernel.add_input();
        let grp = kernel.add_constant("GRP", self.group);
        let size = kernel.add_constant("SIZE", self.size as u32);
        kernel.add_constant("P1", self.batch_before as u32);
        let p2 = kernel.add_constant("P2", self.batch_after as u32);
        let ngrps = kernel.add_constant("NGRPS", self.groups() as u32);
        let total = kernel.add_constant(
            "TOTAL",
            (self.batch_before * self.groups() * self.batch_after) as u32,
        );
        let lcl = kernel.add_workgroup_array("lcl", format!("array<f32, {}>", self.group));
        let workgroup_index = kernel.workgroup_index();
        let local_index = kernel.local_index();
        let padding = self.op.wgsl_padding();
        let combine = self
            .op
            .wgsl_combine(&format!("{lcl}[{local_index}]"), &format!("{lcl}[{local_index} + half]"));

        let mut body = String::new();
        _ = writeln!(body, "\tlet wg = {workgroup_index};");
        _ = writeln!(body, "\tif wg >= {total} {{\n\t\treturn;\n\t}}");
        _ = writeln!(body, "\tlet b2 = wg % {p2};");
        _ = writeln!(body, "\tlet seg = (wg / {p2}) % {ngrps};");
        _ = writeln!(body, "\tlet b1 = wg / ({p2} * {ngrps});");
        _ = writeln!(body, "\tlet pos = seg * {grp} + {local_index};");
        _ = writeln!(body, "\tvar value = {padding};");
        _ = writeln!(body, "\tif pos < {size} {{");
        _ = writeln!(
            body,
            "\t\tvalue = {input}[params[0] + b1 * {size} * {p2} + pos * {p2} + b2];"
        );
        body.push_str("\t}\n");
        _ = writeln!(body, "\t{lcl}[{local_index}] = value;");
        body.push_str("\tworkgroupBarrier();\n");
        _ = writeln!(
            body,
            "\tfor (var half = {grp} / 2u; half > 0u; half = half / 2u) {{"
        );
        _ = writeln!(body, "\t\tif {local_index} < half {{");
        _ = writeln!(body, "\t\t\t{lcl}[{local_index}] = {combine};");
        body.push_str("\t\t}\n\t\tworkgroupBarrier();\n\t}\n");
        _ = writeln!(body, "\tif {local_index} == 0u {{");
        _ = writeln!(
            body,
            "\t\toutput[b1 * {ngrps} * {p2} + seg * {p2} + b2] = {lcl}[0];"
        );
        body.push_str("\t}");
        kernel.set_body(body);
        kernel
    }
}

/// Reduce a C-contiguous buffer. Returns a row-major buffer of the reduced shape.
pub(crate) fn run(
    device: &Device,
    op: ReduceOp,
    input: Arc<PooledBuffer>,
    layout: &Layout,
    axis: Option<usize>,
) -> Result<Arc<PooledBuffer>> {
    if !layout.is_c_contiguous() {
        return Err(ArrayError::unsupported(format!(
            "reductions read row-major inputs, got {layout}"
        )));
    }
    let (batch_before, mut size, batch_after) = merged_dims(layout.shape(), axis);
    let mut input = input;
    let mut offset = layout.offset();
    loop {
        let pass = ReducePass {
            op,
            group: group_size(size, device.max_workgroup_size()),
            size,
            batch_before,
            batch_after,
        };
        let groups = pass.groups();
        let total = batch_before * groups * batch_after;
        let output = Arc::new(device.alloc(total)?);
        pass.kernel().run(
            device,
            Operator::Reduce(op),
            &[&**input],
            &output,
            &[offset as u32],
            dispatch_size(device, total as u32)?,
        )?;
        log::trace!("reduce pass folded {size} elements into {groups} segments");
        input = output;
        offset = 0;
        size = groups;
        if size == 1 {
            return Ok(input);
        }
    }
}

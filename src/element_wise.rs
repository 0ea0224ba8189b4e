//! Strided elementwise kernels, including fused bodies.
//!
//! Every launch index is decomposed into an N-dimensional index with the output's
//! row-major strides, and each input recomputes its own flat offset from that index.
//! Broadcast operands carry zero strides, so no input is ever copied first.

use std::{fmt::Write, sync::Arc};

use crate::{
    array::{KernelOperand, StridedArray},
    device::{Device, PooledBuffer},
    error::Result,
    expr::Expr,
    kernel::{dispatch_size, GenericKernel},
    layout::{continuous_strides, Layout},
    operation::{ElementwiseOp, Operator},
};

pub(crate) const WORKGROUP_SIZE: u32 = 256;

/// `let i_0 = ...;` for every dimension of `shape`, decomposing the flat row-major
/// index `flat`. Returns the names of the per-dimension indices.
pub(crate) fn decompose_index(
    kernel: &mut String,
    flat: &str,
    shape: &[usize],
    params: &mut Vec<u32>,
) -> Vec<String> {
    let strides = continuous_strides(shape);
    let mut indices = Vec::with_capacity(shape.len());
    _ = writeln!(kernel, "\tvar remaining = {flat};");
    for (dim, stride) in strides.iter().enumerate() {
        let param = params.len();
        params.push(*stride as u32);
        _ = writeln!(kernel, "\tlet i_{dim} = remaining / params[{param}];");
        _ = writeln!(kernel, "\tremaining = remaining % params[{param}];");
        indices.push(format!("i_{dim}"));
    }
    indices
}

/// A WGSL expression for the flat position of `indices` in `layout`. The offset and
/// strides are passed through `params`.
pub(crate) fn strided_offset(layout: &Layout, indices: &[String], params: &mut Vec<u32>) -> String {
    debug_assert_eq!(layout.rank(), indices.len());
    let mut offset = format!("params[{}]", params.len());
    params.push(layout.offset() as u32);
    for (index, stride) in indices.iter().zip(layout.strides()) {
        // Broadcast dimensions never move the offset.
        if *stride == 0 {
            continue;
        }
        _ = write!(offset, " + {index} * params[{}]", params.len());
        params.push(*stride as u32);
    }
    offset
}

/// Emit `let v_{first + i} = ...;` for every operand at the element addressed by
/// `indices`. Constants become immediate parameters; buffers become kernel inputs
/// in the order they appear.
pub(crate) fn load_operands(
    kernel: &mut GenericKernel,
    body: &mut String,
    operands: &[KernelOperand],
    first: usize,
    indices: &[String],
    params: &mut Vec<u32>,
) {
    for (i, operand) in operands.iter().enumerate() {
        let name = first + i;
        match operand {
            KernelOperand::Constant(value) => {
                _ = writeln!(
                    body,
                    "\tlet v_{name} = bitcast<f32>(params[{}]);",
                    params.len()
                );
                params.push(value.to_bits());
            }
            KernelOperand::Buffer { layout, .. } => {
                let input = kernel.add_input();
                let offset = strided_offset(layout, indices, params);
                _ = writeln!(body, "\tlet v_{name} = {input}[{offset}];");
            }
        }
    }
}

pub(crate) fn operand_buffers(operands: &[KernelOperand]) -> Vec<&wgpu::Buffer> {
    operands
        .iter()
        .filter_map(|operand| match operand {
            KernelOperand::Buffer { buffer, .. } => Some(&***buffer),
            KernelOperand::Constant(_) => None,
        })
        .collect()
}

pub(crate) fn emit_value(expr: &Expr) -> String {
    let mut value = String::new();
    _ = expr.emit(&mut value, &|name| format!("v_{}", name.0));
    value
}

/// Run `body` over `operands` and write every element of a `shape` sized result.
///
/// The result lands in `out` when given, otherwise in a fresh row-major buffer.
pub(crate) fn run(
    device: &Device,
    op: ElementwiseOp,
    body: &Expr,
    shape: &[usize],
    operands: &[StridedArray],
    out: Option<&StridedArray>,
) -> Result<(Arc<PooledBuffer>, Layout)> {
    let (output, output_layout) = match out {
        Some(out) => out.buffer_operand()?,
        None => {
            let layout = Layout::contiguous(shape);
            (Arc::new(device.alloc(layout.num_elements())?), layout)
        }
    };
    let operands = operands
        .iter()
        .map(StridedArray::kernel_operand)
        .collect::<Result<Vec<_>>>()?;
    let elements = output_layout.num_elements();

    let mut kernel = GenericKernel::new("elementwise");
    kernel.set_workgroup_size([WORKGROUP_SIZE, 1, 1]);
    let workgroup_index = kernel.workgroup_index();
    let local_index = kernel.local_index();

    let mut params = vec![elements as u32];
    let mut source = String::new();
    _ = writeln!(
        source,
        "\tlet index = {workgroup_index} * {WORKGROUP_SIZE}u + {local_index};"
    );
    source.push_str("\tif index >= params[0] {\n\t\treturn;\n\t}\n");
    let indices = decompose_index(&mut source, "index", shape, &mut params);
    let destination = strided_offset(&output_layout, &indices, &mut params);
    load_operands(&mut kernel, &mut source, &operands, 0, &indices, &mut params);
    _ = writeln!(source, "\toutput[{destination}] = {};", emit_value(body));
    kernel.set_body(source);

    let groups = (elements as u32).div_ceil(WORKGROUP_SIZE);
    kernel.run(
        device,
        Operator::Elementwise(op),
        &operand_buffers(&operands),
        &output,
        &params,
        dispatch_size(device, groups)?,
    )?;
    Ok((output, output_layout))
}

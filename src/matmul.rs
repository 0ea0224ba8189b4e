//! Batched, tiled matrix multiplication with an optional fused epilogue.
//!
//! Both inputs arrive as `[batch, rows, cols]` strided views. Each work-group computes
//! a `GS x GS` output tile, staging `GS x GS` tiles of both inputs in workgroup memory
//! for every step along the contraction dimension.

use std::{fmt::Write, sync::Arc};

use crate::{
    array::StridedArray,
    device::{Device, PooledBuffer},
    element_wise::{decompose_index, emit_value, load_operands, operand_buffers, strided_offset},
    error::{ArrayError, Result},
    expr::Expr,
    kernel::GenericKernel,
    layout::Layout,
    operation::{Operator, ProcessingOp},
};

/// Largest power of two up to 8 that divides every matmul dimension.
pub(crate) fn tile_size(m: usize, n: usize, k: usize) -> u32 {
    [8, 4, 2]
        .into_iter()
        .find(|gs| m % gs == 0 && n % gs == 0 && k % gs == 0)
        .unwrap_or(1) as u32
}

/// Work-groups launched for a `[batch, m, k] x [batch, k, n]` product.
pub(crate) fn dispatch(
    device: &Device,
    batch: usize,
    m: usize,
    n: usize,
    k: usize,
) -> Result<[u32; 3]> {
    let gs = tile_size(m, n, k) as usize;
    let dispatch = [n / gs, m / gs, batch];
    let max = device.limits().max_compute_workgroups_per_dimension as usize;
    if dispatch.iter().any(|&groups| groups > max) {
        return Err(ArrayError::unsupported(format!(
            "a [{batch}, {m}, {k}] x [{batch}, {k}, {n}] matmul needs {dispatch:?} work-groups, more than the device limit of {max} per dimension"
        )));
    }
    Ok(dispatch.map(|groups| groups as u32))
}

/// Multiply `a` by `b` into a result of `shape` (`batch dims + [m, n]`), passing the
/// accumulator through `epilogue` when one is fused in. `extra` holds the epilogue
/// operands, named from `C` onward.
pub(crate) fn run(
    device: &Device,
    shape: &[usize],
    a: &StridedArray,
    b: &StridedArray,
    epilogue: Option<&Expr>,
    extra: &[StridedArray],
    out: Option<&StridedArray>,
) -> Result<(Arc<PooledBuffer>, Layout)> {
    let (a_buffer, a_layout) = a.buffer_operand()?;
    let (b_buffer, b_layout) = b.buffer_operand()?;
    let &[batch, m, k] = a_layout.shape() else {
        return Err(ArrayError::shape(format!(
            "matmul expects a rank 3 left operand, got {a_layout}"
        )));
    };
    let &[_, _, n] = b_layout.shape() else {
        return Err(ArrayError::shape(format!(
            "matmul expects a rank 3 right operand, got {b_layout}"
        )));
    };
    let dispatch = dispatch(device, batch, m, n, k)?;
    let gs = tile_size(m, n, k);

    let (output, output_layout) = match out {
        Some(out) => out.buffer_operand()?,
        None => {
            let layout = Layout::contiguous(shape);
            (Arc::new(device.alloc(layout.num_elements())?), layout)
        }
    };
    let extra = extra
        .iter()
        .map(StridedArray::kernel_operand)
        .collect::<Result<Vec<_>>>()?;

    let mut kernel = GenericKernel::new("matmul");
    kernel.set_workgroup_size([gs, gs, 1]);
    let in_a = kernel.add_input();
    let in_b = kernel.add_input();
    kernel.add_constant("BS", batch as u32);
    kernel.add_constant("M", m as u32);
    kernel.add_constant("N", n as u32);
    kernel.add_constant("K", k as u32);
    kernel.add_constant("GS", gs);
    kernel.add_workgroup_array("tile_a", format!("array<f32, {}>", gs * gs));
    kernel.add_workgroup_array("tile_b", format!("array<f32, {}>", gs * gs));
    let global_id = kernel.global_id();
    let local_id = kernel.local_id();

    let mut params = Vec::new();
    for layout in [&a_layout, &b_layout] {
        params.push(layout.offset() as u32);
        params.extend(layout.strides().iter().map(|&stride| stride as u32));
    }

    let mut body = String::new();
    _ = writeln!(body, "\tlet col = {local_id}.x;");
    _ = writeln!(body, "\tlet row = {local_id}.y;");
    _ = writeln!(body, "\tlet n = {global_id}.x;");
    _ = writeln!(body, "\tlet m = {global_id}.y;");
    _ = writeln!(body, "\tlet batch = {global_id}.z;");
    body.push_str("\tvar acc = 0.0;\n");
    body.push_str("\tfor (var t = 0u; t < K; t = t + GS) {\n");
    _ = writeln!(
        body,
        "\t\ttile_a[row * GS + col] = {in_a}[params[0] + batch * params[1] + m * params[2] + (t + col) * params[3]];"
    );
    _ = writeln!(
        body,
        "\t\ttile_b[row * GS + col] = {in_b}[params[4] + batch * params[5] + (t + row) * params[6] + n * params[7]];"
    );
    body.push_str("\t\tworkgroupBarrier();\n");
    body.push_str("\t\tfor (var i = 0u; i < GS; i = i + 1u) {\n");
    body.push_str("\t\t\tacc = acc + tile_a[row * GS + i] * tile_b[i * GS + col];\n");
    body.push_str("\t\t}\n\t\tworkgroupBarrier();\n\t}\n");
    body.push_str("\tlet flat = batch * M * N + m * N + n;\n");

    let value = match epilogue {
        Some(epilogue) => emit_value(epilogue),
        None => "acc".to_string(),
    };
    let row_major = output_layout.is_c_contiguous() && output_layout.offset() == 0;
    if extra.is_empty() && row_major {
        _ = writeln!(body, "\toutput[flat] = {value};");
    } else {
        let indices = decompose_index(&mut body, "flat", shape, &mut params);
        let destination = strided_offset(&output_layout, &indices, &mut params);
        load_operands(&mut kernel, &mut body, &extra, 2, &indices, &mut params);
        _ = writeln!(body, "\toutput[{destination}] = {value};");
    }
    kernel.set_body(body);

    let mut inputs: Vec<&wgpu::Buffer> = vec![&**a_buffer, &**b_buffer];
    inputs.extend(operand_buffers(&extra));
    kernel.run(
        device,
        Operator::Processing(ProcessingOp::MatMul),
        &inputs,
        &output,
        &params,
        dispatch,
    )?;
    Ok((output, output_layout))
}

//! Elementwise, reduce and matmul operations on [`StridedArray`].
//!
//! Every operation validates its arguments up front and returns a lazy node, which
//! is forced right away when the device runs eagerly.

use crate::{
    array::StridedArray,
    compute_graph,
    error::{ArrayError, Result},
    layout::{broadcast_shapes, normalize_axis},
    matmul,
    operation::{ElementwiseOp, Operation, OperationDescriptor, ProcessingOp, ReduceOp},
    reduce::reduced_shape,
};

macro_rules! unary_ops {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(&self) -> Result<Self> {
                self.elementwise(ElementwiseOp::$op, &[])
            }
        )*
    };
}

macro_rules! binary_ops {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(&self, other: &StridedArray) -> Result<Self> {
                self.elementwise(ElementwiseOp::$op, &[other])
            }
        )*
    };
}

impl StridedArray {
    unary_ops! {
        neg => Neg,
        exp => Exp,
        log => Log,
        relu => Relu,
        /// A row-major copy. Elides nothing: even contiguous arrays are copied.
        contiguous => Identity,
    }

    binary_ops! {
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        pow => Pow,
        /// `1.0` where the elements are equal, `0.0` elsewhere.
        eq => Eq,
        ge => Ge,
        gt => Gt,
        /// `self` where `other > 0`, `0.0` elsewhere.
        relu_grad => ReluGrad,
    }

    /// Apply `op` to `self` followed by `others`, broadcasting every operand to a
    /// common shape.
    pub fn elementwise(&self, op: ElementwiseOp, others: &[&StridedArray]) -> Result<Self> {
        let (shape, operands) = self.elementwise_operands(op, others)?;
        let operation = Operation::Elementwise {
            op,
            body: op.expr(),
            out: None,
        };
        StridedArray::lazy(
            self.device(),
            &shape,
            OperationDescriptor::new(operation, operands),
        )
        .finish()
    }

    /// Like [`Self::elementwise`], writing the result into `out`.
    ///
    /// `out` must be a materialized, row-major array of the result shape that shares
    /// no memory with the operands.
    pub fn elementwise_into(
        &self,
        op: ElementwiseOp,
        others: &[&StridedArray],
        out: &StridedArray,
    ) -> Result<Self> {
        let (shape, operands) = self.elementwise_operands(op, others)?;
        validate_out(out, &shape, &operands)?;
        let operation = Operation::Elementwise {
            op,
            body: op.expr(),
            out: Some(out.clone()),
        };
        StridedArray::lazy(
            self.device(),
            &shape,
            OperationDescriptor::new(operation, operands),
        )
        .finish()
    }

    fn elementwise_operands(
        &self,
        op: ElementwiseOp,
        others: &[&StridedArray],
    ) -> Result<(Box<[usize]>, Vec<StridedArray>)> {
        if others.len() + 1 != op.arity() {
            return Err(ArrayError::unsupported(format!(
                "{op:?} takes {} operands, got {}",
                op.arity(),
                others.len() + 1
            )));
        }
        let mut shape = self.shape();
        for other in others {
            self.check_device(other)?;
            shape = broadcast_shapes(&shape, &other.shape())?;
        }
        let operands = std::iter::once(self)
            .chain(others.iter().copied())
            .map(|operand| {
                if *operand.shape() == *shape {
                    Ok(operand.clone())
                } else {
                    operand.expand(&shape)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((shape, operands))
    }

    fn check_device(&self, other: &StridedArray) -> Result<()> {
        if !self.device().same_device(other.device()) {
            return Err(ArrayError::unsupported(
                "operands belong to different devices",
            ));
        }
        Ok(())
    }

    /// Sum over `axis`, or over every axis when `None`.
    pub fn sum(&self, axis: Option<isize>, keepdims: bool) -> Result<Self> {
        self.reduce(ReduceOp::Sum, axis, keepdims)
    }

    /// Maximum over `axis`, or over every axis when `None`.
    pub fn max(&self, axis: Option<isize>, keepdims: bool) -> Result<Self> {
        self.reduce(ReduceOp::Max, axis, keepdims)
    }

    pub fn reduce(&self, op: ReduceOp, axis: Option<isize>, keepdims: bool) -> Result<Self> {
        let shape = self.shape();
        let axis = axis
            .map(|axis| normalize_axis(axis, shape.len()))
            .transpose()?;
        let mut input = self.clone();
        if input.constant_value().is_none() && !input.is_c_contiguous() {
            input = input.contiguous()?;
        }
        let operation = Operation::Reduce { op, axis, keepdims };
        StridedArray::lazy(
            self.device(),
            &reduced_shape(&shape, axis, keepdims),
            OperationDescriptor::new(operation, vec![input]),
        )
        .finish()
    }

    /// NumPy style matrix product. Leading batch axes broadcast; 1-D operands are
    /// promoted to matrices and the promoted axis is dropped from the result.
    pub fn matmul(&self, other: &StridedArray) -> Result<Self> {
        self.matmul_node(other, None)
    }

    /// Like [`Self::matmul`], writing the result into `out`.
    pub fn matmul_into(&self, other: &StridedArray, out: &StridedArray) -> Result<Self> {
        self.matmul_node(other, Some(out))
    }

    fn matmul_node(&self, other: &StridedArray, out: Option<&StridedArray>) -> Result<Self> {
        self.check_device(other)?;
        let (a_rank, b_rank) = (self.ndim(), other.ndim());
        if a_rank == 0 || b_rank == 0 {
            return Err(ArrayError::shape("matmul operands need at least one axis"));
        }
        let a = match a_rank {
            1 => self.reshape_to(&[1, self.num_elements()])?,
            _ => self.clone(),
        };
        let b = match b_rank {
            1 => other.reshape_to(&[other.num_elements(), 1])?,
            _ => other.clone(),
        };
        let (a_shape, b_shape) = (a.shape(), b.shape());
        let [m, k] = [a_shape[a_shape.len() - 2], a_shape[a_shape.len() - 1]];
        let [k2, n] = [b_shape[b_shape.len() - 2], b_shape[b_shape.len() - 1]];
        if k != k2 {
            return Err(ArrayError::shape(format!(
                "cannot multiply {a_shape:?} by {b_shape:?}: contraction sizes {k} and {k2} differ"
            )));
        }
        let batch = broadcast_shapes(
            &a_shape[..a_shape.len() - 2],
            &b_shape[..b_shape.len() - 2],
        )?;
        let batch_size: usize = batch.iter().product();
        matmul::dispatch(self.device(), batch_size, m, n, k)?;

        let mut shape = batch.to_vec();
        shape.extend([m, n]);
        let mut squeezed = batch.to_vec();
        if a_rank > 1 {
            squeezed.push(m);
        }
        if b_rank > 1 {
            squeezed.push(n);
        }

        let a = batch_operand(&a, &batch, m, k)?;
        let b = batch_operand(&b, &batch, k, n)?;
        let out = match out {
            Some(out) => {
                validate_out(out, &squeezed, &[a.clone(), b.clone()])?;
                Some(out.reshape_to(&shape)?)
            }
            None => None,
        };
        let operation = Operation::Processing {
            op: ProcessingOp::MatMul,
            epilogue: None,
            out,
        };
        let product = StridedArray::lazy(
            self.device(),
            &shape,
            OperationDescriptor::new(operation, vec![a, b]),
        )
        .finish()?;
        if squeezed.len() == shape.len() {
            Ok(product)
        } else {
            product.reshape_to(&squeezed)
        }
    }
}

/// View `array` (`[..batch, rows, cols]`) as `[batch size, rows, cols]`, broadcasting
/// its batch axes to `batch`.
fn batch_operand(
    array: &StridedArray,
    batch: &[usize],
    rows: usize,
    cols: usize,
) -> Result<StridedArray> {
    let shape = array.shape();
    let own_batch = &shape[..shape.len() - 2];
    let batch_size: usize = batch.iter().product();
    if own_batch.iter().product::<usize>() == 1 {
        let matrix = array.reshape_to(&[1, rows, cols])?;
        if batch_size == 1 {
            return Ok(matrix);
        }
        return matrix.expand(&[batch_size, rows, cols]);
    }
    if own_batch == batch {
        return array.reshape_to(&[batch_size, rows, cols]);
    }
    let mut full = batch.to_vec();
    full.extend([rows, cols]);
    array.expand(&full)?.reshape_to(&[batch_size, rows, cols])
}

fn validate_out(out: &StridedArray, shape: &[usize], operands: &[StridedArray]) -> Result<()> {
    if out.is_lazy() || out.constant_value().is_some() {
        return Err(ArrayError::unsupported(
            "destination arrays must already own device memory",
        ));
    }
    if *out.shape() != *shape {
        return Err(ArrayError::shape(format!(
            "destination has shape {:?}, the result has shape {shape:?}",
            out.shape()
        )));
    }
    if !out.is_c_contiguous() || out.offset() != 0 {
        return Err(ArrayError::shape(format!(
            "destination must be row-major with no offset, got {}",
            out.layout()
        )));
    }
    for operand in operands {
        out.check_device(operand)?;
        if compute_graph::reads_buffer_of(operand, out) {
            return Err(ArrayError::unsupported(
                "destination shares memory with an operand",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DeviceConfig, test_util::test_device_with};

    #[tokio::test]
    async fn arity_and_shapes_are_checked_eagerly() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let a = StridedArray::full(&device, &[2, 3], 1.0).unwrap();
        let b = StridedArray::full(&device, &[4, 3], 1.0).unwrap();
        assert!(matches!(a.add(&b), Err(ArrayError::Shape(_))));
        assert!(matches!(
            a.elementwise(ElementwiseOp::Add, &[]),
            Err(ArrayError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            a.elementwise(ElementwiseOp::Exp, &[&b]),
            Err(ArrayError::UnsupportedOperation(_))
        ));
        assert!(matches!(a.max(Some(-3), false), Err(ArrayError::Index(_))));
        assert_eq!(device.kernel_stats().total_launches(), 0);

        let Some(other_device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let c = StridedArray::full(&other_device, &[2, 3], 1.0).unwrap();
        assert!(matches!(a.add(&c), Err(ArrayError::UnsupportedOperation(_))));
    }

    #[tokio::test]
    async fn eager_mode_materializes_immediately() {
        let Some(device) = test_device_with(DeviceConfig::eager()).await else {
            return;
        };
        let a = StridedArray::new(&device, &[1., 2., 3., 4.]).unwrap();
        let b = a.mul(&a).unwrap();
        assert!(!b.is_lazy());
        assert_eq!(device.kernel_stats().total_launches(), 1);
        let c = b.sum(None, false).unwrap();
        assert!(!c.is_lazy());
        assert_eq!(c.to_host().unwrap().as_slice(), &[30.]);
    }

    #[tokio::test]
    async fn lazy_mode_defers_until_forced() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let a = StridedArray::new(&device, &[1., 2., 3., 4.]).unwrap();
        let b = a.sub(&a.exp().unwrap()).unwrap();
        assert!(b.is_lazy());
        assert_eq!(device.kernel_stats().total_launches(), 0);
        b.realize().unwrap();
        assert!(!b.is_lazy());
        assert!(b.descriptor().is_none());
        // Forcing again is a no-op.
        b.realize().unwrap();
        assert_eq!(device.kernel_stats().total_launches(), 1);
    }

    #[tokio::test]
    async fn destinations_are_validated() {
        let Some(device) = test_device_with(DeviceConfig::default()).await else {
            return;
        };
        let a = StridedArray::new(&device, &[[1., 2.], [3., 4.]]).unwrap();
        let out = StridedArray::empty(&device, &[2, 2]).unwrap();
        let sum = a.elementwise_into(ElementwiseOp::Add, &[&a], &out).unwrap();
        sum.realize().unwrap();
        assert_eq!(out.to_host().unwrap().as_slice(), &[2., 4., 6., 8.]);
        assert_eq!(sum.to_host().unwrap().as_slice(), &[2., 4., 6., 8.]);

        let transposed = out.permute(&[1, 0]).unwrap();
        assert!(matches!(
            a.elementwise_into(ElementwiseOp::Neg, &[], &transposed),
            Err(ArrayError::Shape(_))
        ));
        let lazy = a.exp().unwrap();
        assert!(matches!(
            a.elementwise_into(ElementwiseOp::Neg, &[], &lazy),
            Err(ArrayError::UnsupportedOperation(_))
        ));
        let reads_out = out.exp().unwrap();
        assert!(matches!(
            reads_out.elementwise_into(ElementwiseOp::Neg, &[], &out),
            Err(ArrayError::UnsupportedOperation(_))
        ));
        let small = StridedArray::empty(&device, &[2]).unwrap();
        assert!(matches!(
            a.elementwise_into(ElementwiseOp::Neg, &[], &small),
            Err(ArrayError::Shape(_))
        ));
    }
}

//! Metadata-only views: every operation here shares the source buffer.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::{
    array::{ArrayState, StridedArray},
    error::{ArrayError, Result},
    layout::{normalize_axis, resolve_shape, Layout},
    operation::{Operation, OperationDescriptor, ViewOp},
};

/// One axis of a [`StridedArray::slice`] key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SliceArg {
    /// Select one position and drop the axis.
    Index(isize),
    /// Keep `[start, stop)` of the axis. Missing bounds span to the edge.
    Range {
        start: Option<isize>,
        stop: Option<isize>,
    },
    Full,
    /// Integer-list indexing. Always rejected.
    Indices(Vec<isize>),
}

impl From<isize> for SliceArg {
    fn from(index: isize) -> Self {
        Self::Index(index)
    }
}

impl From<Range<isize>> for SliceArg {
    fn from(range: Range<isize>) -> Self {
        Self::Range {
            start: Some(range.start),
            stop: Some(range.end),
        }
    }
}

impl From<RangeFrom<isize>> for SliceArg {
    fn from(range: RangeFrom<isize>) -> Self {
        Self::Range {
            start: Some(range.start),
            stop: None,
        }
    }
}

impl From<RangeTo<isize>> for SliceArg {
    fn from(range: RangeTo<isize>) -> Self {
        Self::Range {
            start: None,
            stop: Some(range.end),
        }
    }
}

impl From<RangeFull> for SliceArg {
    fn from(_: RangeFull) -> Self {
        Self::Full
    }
}

impl From<Vec<isize>> for SliceArg {
    fn from(indices: Vec<isize>) -> Self {
        Self::Indices(indices)
    }
}

fn normalize_index(index: isize, dim: usize) -> Result<usize> {
    let normalized = if index < 0 { index + dim as isize } else { index };
    if normalized < 0 || normalized >= dim as isize {
        return Err(ArrayError::index(format!(
            "index {index} is out of bounds for an axis of size {dim}"
        )));
    }
    Ok(normalized as usize)
}

fn normalize_bound(bound: isize, dim: usize) -> usize {
    if bound < 0 {
        (bound + dim as isize).max(0) as usize
    } else {
        bound as usize
    }
}

impl StridedArray {
    /// A new node over the same data with a different layout.
    ///
    /// Views of lazy arrays stay lazy and record the view so the optimizer can see it;
    /// views of materialized arrays are materialized immediately.
    pub(crate) fn view(&self, op: ViewOp, layout: Layout) -> Self {
        let state = self.state();
        let op = state
            .lazy
            .then(|| OperationDescriptor::new(Operation::View(op), vec![self.clone()]));
        Self::from_state(
            self.device(),
            ArrayState {
                layout,
                buffer: state.buffer.clone(),
                constant: state.constant,
                op,
                lazy: state.lazy,
            },
        )
    }

    /// Reshape to `shape`, which may contain one `-1` wildcard.
    ///
    /// Strided inputs that are not C-contiguous are copied into a contiguous buffer
    /// first.
    pub fn reshape(&self, shape: &[isize]) -> Result<Self> {
        let shape = resolve_shape(shape, self.num_elements())?;
        self.reshape_to(&shape)
    }

    pub(crate) fn reshape_to(&self, shape: &[usize]) -> Result<Self> {
        let elements: usize = shape.iter().product();
        if elements != self.num_elements() || shape.contains(&0) {
            return Err(ArrayError::shape(format!(
                "cannot reshape {:?} into {shape:?}",
                self.shape()
            )));
        }
        if self.constant_value().is_some() {
            return Ok(self.view(ViewOp::Reshape, Layout::contiguous(shape)));
        }
        if let Some(layout) = self.layout().reshape(shape) {
            return Ok(self.view(ViewOp::Reshape, layout));
        }
        let contiguous = self.contiguous()?;
        let layout = contiguous.layout().reshape(shape).ok_or_else(|| {
            ArrayError::shape(format!("cannot reshape {} into {shape:?}", self.layout()))
        })?;
        Ok(contiguous.view(ViewOp::Reshape, layout))
    }

    /// Broadcast to `shape`. New leading axes may be added; axes of size one may grow.
    pub fn expand(&self, shape: &[usize]) -> Result<Self> {
        let layout = self.layout().expand(shape)?;
        Ok(self.view(ViewOp::Expand, layout))
    }

    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        let layout = self.layout().permute(axes)?;
        Ok(self.view(ViewOp::Permute, layout))
    }

    /// Drop the given axes, or every axis of size one.
    pub fn squeeze(&self, axes: Option<&[isize]>) -> Result<Self> {
        let shape = self.shape();
        let squeezed: Vec<usize> = match axes {
            None => shape.iter().copied().filter(|&dim| dim != 1).collect(),
            Some(axes) => {
                let mut drop = vec![false; shape.len()];
                for &axis in axes {
                    let axis = normalize_axis(axis, shape.len())?;
                    if shape[axis] != 1 {
                        return Err(ArrayError::shape(format!(
                            "cannot squeeze axis {axis} of size {}",
                            shape[axis]
                        )));
                    }
                    drop[axis] = true;
                }
                shape
                    .iter()
                    .zip(drop)
                    .filter(|(_, drop)| !drop)
                    .map(|(&dim, _)| dim)
                    .collect()
            }
        };
        self.reshape_to(&squeezed)
    }

    /// Integer and range indexing, one key per leading axis.
    pub fn slice(&self, key: &[SliceArg]) -> Result<Self> {
        if key.iter().any(|arg| matches!(arg, SliceArg::Indices(_))) {
            return Err(ArrayError::unsupported(
                "advanced indexing with integer lists is not supported",
            ));
        }
        let mut layout = self.layout();
        if key.len() > layout.rank() {
            return Err(ArrayError::index(format!(
                "{} indices for an array of rank {}",
                key.len(),
                layout.rank()
            )));
        }
        let mut axis = 0;
        for arg in key {
            let dim = layout.shape()[axis];
            match arg {
                SliceArg::Index(index) => {
                    layout = layout.index(axis, normalize_index(*index, dim)?);
                }
                SliceArg::Range { start, stop } => {
                    let start = start.map_or(0, |start| normalize_bound(start, dim));
                    let stop = stop.map_or(dim, |stop| normalize_bound(stop, dim));
                    if start >= stop || stop > dim {
                        return Err(ArrayError::index(format!(
                            "slice {start}..{stop} is empty or out of bounds for an axis of size {dim}"
                        )));
                    }
                    layout = layout.slice(axis, start, stop);
                    axis += 1;
                }
                SliceArg::Full => axis += 1,
                SliceArg::Indices(_) => unreachable!("rejected above"),
            }
        }
        Ok(self.view(ViewOp::Slice, layout))
    }

    /// `self[index]` along the first axis.
    pub fn index(&self, index: isize) -> Result<Self> {
        self.slice(&[SliceArg::Index(index)])
    }

    /// `len` positions of `axis` starting at `start`.
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Self> {
        let axis = normalize_axis(axis, self.ndim())?;
        let mut key = vec![SliceArg::Full; axis];
        key.push(SliceArg::Range {
            start: Some(start as isize),
            stop: Some((start + len) as isize),
        });
        self.slice(&key)
    }

    /// Writing through a view is not supported; arrays are immutable once created.
    pub fn assign(&self, _key: &[SliceArg], _value: &StridedArray) -> Result<()> {
        Err(ArrayError::unsupported(
            "assignment into a view is not supported",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_device;

    #[tokio::test]
    async fn views_share_buffers() {
        let Some(device) = test_device().await else {
            return;
        };
        let matrix = StridedArray::from_vec(
            &device,
            &(0..12).map(|v| v as f32).collect::<Vec<_>>(),
            &[3, 4],
        )
        .unwrap();

        let reshaped = matrix.reshape(&[2, -1]).unwrap();
        assert_eq!(&*reshaped.shape(), &[2, 6]);
        assert!(reshaped.shares_buffer(&matrix));
        assert!(!reshaped.is_lazy());
        assert!(reshaped.descriptor().is_none());

        let row = matrix.index(-1).unwrap();
        assert_eq!(&*row.shape(), &[4]);
        assert_eq!(row.offset(), 8);
        assert_eq!(row.to_host().unwrap().as_slice(), &[8., 9., 10., 11.]);

        let column = matrix
            .slice(&[SliceArg::Full, SliceArg::Index(1)])
            .unwrap();
        assert_eq!(column.to_host().unwrap().as_slice(), &[1., 5., 9.]);

        let block = matrix
            .slice(&[(1..3).into(), SliceArg::Range { start: None, stop: Some(-2) }])
            .unwrap();
        assert_eq!(&*block.strides(), &[4, 1]);
        assert_eq!(block.to_host().unwrap().as_slice(), &[4., 5., 8., 9.]);

        let narrowed = matrix.narrow(1, 2, 2).unwrap();
        assert_eq!(narrowed.to_host().unwrap().as_slice(), &[2., 3., 6., 7., 10., 11.]);

        let expanded = row.reshape(&[1, 4]).unwrap().expand(&[2, 4]).unwrap();
        assert_eq!(&*expanded.strides(), &[0, 1]);
        assert_eq!(
            expanded.to_host().unwrap().as_slice(),
            &[8., 9., 10., 11., 8., 9., 10., 11.]
        );
        assert!(expanded.shares_buffer(&matrix));
    }

    #[tokio::test]
    async fn permutes_compose() {
        let Some(device) = test_device().await else {
            return;
        };
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let array = StridedArray::from_vec(&device, &data, &[2, 3, 4]).unwrap();
        let twice = array
            .permute(&[2, 0, 1])
            .unwrap()
            .permute(&[1, 2, 0])
            .unwrap();
        assert_eq!(twice.to_host().unwrap(), array.to_host().unwrap());

        // p1 = [2, 0, 1], p2 = [0, 2, 1] compose to [2, 1, 0].
        let composed = array.permute(&[2, 0, 1]).unwrap().permute(&[0, 2, 1]).unwrap();
        let direct = array.permute(&[2, 1, 0]).unwrap();
        assert_eq!(composed.to_host().unwrap(), direct.to_host().unwrap());

        // Reshaping a strided view copies it first.
        let transposed = array.permute(&[2, 1, 0]).unwrap();
        let flat = transposed.reshape(&[-1]).unwrap();
        assert!(!flat.shares_buffer(&array));
        assert_eq!(flat.to_host().unwrap().as_slice()[..3], [0., 12., 4.]);
        let back = flat.reshape(&[4, 3, 2]).unwrap();
        assert_eq!(back.to_host().unwrap(), transposed.to_host().unwrap());
    }

    #[tokio::test]
    async fn invalid_views_fail_eagerly() {
        let Some(device) = test_device().await else {
            return;
        };
        let array = StridedArray::full(&device, &[2, 1, 3], 1.0).unwrap();
        assert!(matches!(array.reshape(&[4, -1]), Err(ArrayError::Shape(_))));
        assert!(matches!(array.reshape(&[-1, -1]), Err(ArrayError::Shape(_))));
        assert!(matches!(array.permute(&[0, 0, 1]), Err(ArrayError::Shape(_))));
        assert!(matches!(array.expand(&[4, 1, 3]), Err(ArrayError::Shape(_))));
        assert!(matches!(array.index(2), Err(ArrayError::Index(_))));
        assert!(matches!(
            array.slice(&[SliceArg::Range { start: Some(1), stop: Some(1) }]),
            Err(ArrayError::Index(_))
        ));
        assert!(matches!(
            array.slice(&[SliceArg::Full, SliceArg::Full, SliceArg::Full, SliceArg::Full]),
            Err(ArrayError::Index(_))
        ));
        assert!(matches!(
            array.slice(&[SliceArg::Indices(vec![0, 1])]),
            Err(ArrayError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            array.assign(&[SliceArg::Index(0)], &array),
            Err(ArrayError::UnsupportedOperation(_))
        ));
        assert!(matches!(array.squeeze(Some(&[0])), Err(ArrayError::Shape(_))));

        let squeezed = array.squeeze(None).unwrap();
        assert_eq!(&*squeezed.shape(), &[2, 3]);
        let squeezed = array.squeeze(Some(&[-2])).unwrap();
        assert_eq!(&*squeezed.shape(), &[2, 3]);
        assert_eq!(device.kernel_stats().total_launches(), 0);
    }

    #[tokio::test]
    async fn views_of_lazy_arrays_are_recorded() {
        let Some(device) = test_device().await else {
            return;
        };
        let array = StridedArray::full(&device, &[2, 3], 2.0).unwrap();
        let lazy = array.exp().unwrap();
        let view = lazy.permute(&[1, 0]).unwrap().reshape(&[-1]).unwrap();
        assert!(view.is_lazy());
        let descriptor = view.descriptor().unwrap();
        assert!(descriptor.is_view());
        let expected = 2.0f32.exp();
        for value in view.to_host().unwrap().as_slice() {
            assert!((value - expected).abs() < 1e-4);
        }
        assert!(!lazy.is_lazy());
    }
}

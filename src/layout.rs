use std::fmt::Display;

use crate::error::{ArrayError, Result};

/// Row-major strides for `shape`.
pub(crate) fn continuous_strides(shape: &[usize]) -> Box<[usize]> {
    let mut acc = 1;
    let mut strides = vec![0; shape.len()].into_boxed_slice();
    for i in (0..shape.len()).rev() {
        strides[i] = acc;
        acc *= shape[i];
    }
    strides
}

/// Column-major strides for `shape`.
fn fortran_strides(shape: &[usize]) -> Box<[usize]> {
    let mut acc = 1;
    let mut strides = vec![0; shape.len()].into_boxed_slice();
    for i in 0..shape.len() {
        strides[i] = acc;
        acc *= shape[i];
    }
    strides
}

// Dimensions of size one never move the read position, so their stride is ignored.
fn matches_strides(shape: &[usize], strides: &[usize], expected: &[usize]) -> bool {
    shape
        .iter()
        .zip(strides)
        .zip(expected)
        .all(|((&size, &stride), &expected)| size == 1 || stride == expected)
}

/// Shape, strides and element offset of an array into its buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    offset: usize,
    shape: Box<[usize]>,
    strides: Box<[usize]>,
    c_contiguous: bool,
    f_contiguous: bool,
}

impl Layout {
    pub fn contiguous(shape: &[usize]) -> Self {
        let strides = continuous_strides(shape);
        Self::from_parts(0, shape.into(), strides)
    }

    pub fn from_parts(offset: usize, shape: Box<[usize]>, strides: Box<[usize]>) -> Self {
        debug_assert_eq!(shape.len(), strides.len());
        let c_contiguous = matches_strides(&shape, &strides, &continuous_strides(&shape));
        let f_contiguous = matches_strides(&shape, &strides, &fortran_strides(&shape));
        Self {
            offset,
            shape,
            strides,
            c_contiguous,
            f_contiguous,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_c_contiguous(&self) -> bool {
        self.c_contiguous
    }

    pub fn is_f_contiguous(&self) -> bool {
        self.f_contiguous
    }

    /// Buffer position of the element at `index`.
    pub fn linear_index(&self, index: &[usize]) -> usize {
        self.offset
            + index
                .iter()
                .zip(self.strides.iter())
                .map(|(i, stride)| i * stride)
                .sum::<usize>()
    }

    /// Fix `axis` at `index`, dropping the dimension.
    pub(crate) fn index(&self, axis: usize, index: usize) -> Self {
        let mut shape = self.shape.to_vec();
        let mut strides = self.strides.to_vec();
        let offset = self.offset + strides[axis] * index;
        shape.remove(axis);
        strides.remove(axis);
        Self::from_parts(offset, shape.into(), strides.into())
    }

    /// Keep `start..stop` of `axis`.
    pub(crate) fn slice(&self, axis: usize, start: usize, stop: usize) -> Self {
        let mut shape = self.shape.clone();
        shape[axis] = stop - start;
        let offset = self.offset + self.strides[axis] * start;
        Self::from_parts(offset, shape, self.strides.clone())
    }

    /// Reinterpret a C-contiguous layout under a new shape of the same size.
    pub(crate) fn reshape(&self, shape: &[usize]) -> Option<Self> {
        if !self.c_contiguous || shape.iter().product::<usize>() != self.num_elements() {
            return None;
        }
        Some(Self::from_parts(
            self.offset,
            shape.into(),
            continuous_strides(shape),
        ))
    }

    /// Broadcast to `shape`, prepending dimensions as needed. Grown dimensions read
    /// with a zero stride.
    pub(crate) fn expand(&self, shape: &[usize]) -> Result<Self> {
        if shape.len() < self.rank() {
            return Err(ArrayError::shape(format!(
                "cannot expand {:?} to the lower rank shape {shape:?}",
                self.shape
            )));
        }
        let leading = shape.len() - self.rank();
        let mut strides = vec![0; shape.len()];
        for (i, &target) in shape.iter().enumerate().skip(leading) {
            let size = self.shape[i - leading];
            let stride = self.strides[i - leading];
            strides[i] = match (size, target) {
                (size, target) if size == target => stride,
                (1, _) => 0,
                _ => {
                    return Err(ArrayError::shape(format!(
                        "cannot expand {:?} to {shape:?}: dimension {} has size {size}, expected 1 or {target}",
                        self.shape,
                        i - leading
                    )))
                }
            };
        }
        Ok(Self::from_parts(self.offset, shape.into(), strides.into()))
    }

    pub(crate) fn permute(&self, axes: &[usize]) -> Result<Self> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if axes.len() != rank {
            return Err(ArrayError::shape(format!(
                "permutation {axes:?} does not cover {rank} axes"
            )));
        }
        for &axis in axes {
            if axis >= rank || std::mem::replace(&mut seen[axis], true) {
                return Err(ArrayError::shape(format!(
                    "{axes:?} is not a permutation of 0..{rank}"
                )));
            }
        }
        let shape = axes.iter().map(|&a| self.shape[a]).collect();
        let strides = axes.iter().map(|&a| self.strides[a]).collect();
        Ok(Self::from_parts(self.offset, shape, strides))
    }

    /// Treat `self` as a view taken over a row-major array of `source.shape()` and
    /// return the same view over `source`'s memory instead.
    ///
    /// `None` when the view's reads do not form a strided pattern in `source`.
    pub(crate) fn rebase(&self, source: &Layout) -> Option<Self> {
        self.rebase_axes(source).or_else(|| {
            source.c_contiguous.then(|| {
                Self::from_parts(
                    source.offset + self.offset,
                    self.shape.clone(),
                    self.strides.clone(),
                )
            })
        })
    }

    // Every view axis must step along one source axis without carrying into the next.
    fn rebase_axes(&self, source: &Layout) -> Option<Self> {
        let shape = source.shape();
        let row_major = continuous_strides(shape);
        let start: Vec<usize> = shape
            .iter()
            .zip(row_major.iter())
            .map(|(&dim, &stride)| (self.offset / stride) % dim)
            .collect();
        let mut reach = start.clone();
        let mut strides = Vec::with_capacity(self.rank());
        for (&dim, &stride) in self.shape.iter().zip(&self.strides) {
            if dim == 1 || stride == 0 {
                strides.push(0);
                continue;
            }
            let axis = (0..shape.len()).find(|&axis| {
                shape[axis] > 1 && row_major[axis] <= stride && stride % row_major[axis] == 0
            })?;
            let step = stride / row_major[axis];
            reach[axis] += step * (dim - 1);
            strides.push(step * source.strides[axis]);
        }
        if reach.iter().zip(shape).any(|(&reach, &dim)| reach >= dim) {
            return None;
        }
        Some(Self::from_parts(
            source.linear_index(&start),
            self.shape.clone(),
            strides.into(),
        ))
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.shape)?;
        if !self.c_contiguous {
            write!(f, " strides={:?}", self.strides)?;
        }
        if self.offset != 0 {
            write!(f, " offset={}", self.offset)?;
        }
        Ok(())
    }
}

/// NumPy broadcasting: right aligned, size one stretches.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Box<[usize]>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        let a_dim = (i + a.len()).checked_sub(rank).map_or(1, |i| a[i]);
        let b_dim = (i + b.len()).checked_sub(rank).map_or(1, |i| b[i]);
        shape[i] = match (a_dim, b_dim) {
            (a_dim, b_dim) if a_dim == b_dim => a_dim,
            (1, other) | (other, 1) => other,
            _ => {
                return Err(ArrayError::shape(format!(
                    "shapes {a:?} and {b:?} cannot be broadcast together"
                )))
            }
        };
    }
    Ok(shape.into())
}

/// Resolve a reshape target with at most one `-1` wildcard.
pub(crate) fn resolve_shape(shape: &[isize], num_elements: usize) -> Result<Box<[usize]>> {
    let mut wildcard = None;
    let mut known = 1usize;
    for (i, &dim) in shape.iter().enumerate() {
        match dim {
            -1 if wildcard.is_none() => wildcard = Some(i),
            -1 => return Err(ArrayError::shape("only one dimension can be inferred")),
            dim if dim > 0 => known *= dim as usize,
            dim => return Err(ArrayError::shape(format!("invalid dimension {dim}"))),
        }
    }
    let mut resolved: Vec<usize> = shape.iter().map(|&dim| dim.max(0) as usize).collect();
    if let Some(i) = wildcard {
        if num_elements % known != 0 {
            return Err(ArrayError::shape(format!(
                "cannot infer a dimension of {shape:?} from {num_elements} elements"
            )));
        }
        resolved[i] = num_elements / known;
    }
    if resolved.iter().product::<usize>() != num_elements {
        return Err(ArrayError::shape(format!(
            "cannot reshape {num_elements} elements into {shape:?}"
        )));
    }
    Ok(resolved.into())
}

pub(crate) fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let normalized = if axis < 0 { axis + rank as isize } else { axis };
    if normalized < 0 || normalized as usize >= rank {
        return Err(ArrayError::index(format!(
            "axis {axis} is out of bounds for rank {rank}"
        )));
    }
    Ok(normalized as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every row-major position must agree with the strided read.
    fn reads_row_major(layout: &Layout) -> bool {
        let shape = layout.shape();
        let row_major = continuous_strides(shape);
        (0..layout.num_elements()).all(|k| {
            let mut rest = k;
            let index: Vec<usize> = row_major
                .iter()
                .map(|stride| {
                    let i = rest / stride;
                    rest %= stride;
                    i
                })
                .collect();
            layout.linear_index(&index) == layout.offset() + k
        })
    }

    #[test]
    fn contiguity_flags() {
        let layout = Layout::contiguous(&[2, 3, 4]);
        assert!(layout.is_c_contiguous());
        assert!(!layout.is_f_contiguous());
        assert!(reads_row_major(&layout));

        let transposed = layout.permute(&[2, 1, 0]).unwrap();
        assert!(!transposed.is_c_contiguous());
        assert!(transposed.is_f_contiguous());
        assert!(!reads_row_major(&transposed));

        let scalar = Layout::contiguous(&[]);
        assert!(scalar.is_c_contiguous() && scalar.is_f_contiguous());

        // Size one dimensions do not affect contiguity.
        let odd = Layout::from_parts(0, [1, 3].into(), [17, 1].into());
        assert!(odd.is_c_contiguous());
        assert!(reads_row_major(&odd));
    }

    #[test]
    fn slicing_moves_offset() {
        let layout = Layout::contiguous(&[3, 4]);
        let row = layout.index(0, 2);
        assert_eq!(row.shape(), &[4]);
        assert_eq!(row.offset(), 8);
        assert!(row.is_c_contiguous());

        let column = layout.index(1, 1);
        assert_eq!(column.shape(), &[3]);
        assert_eq!(column.strides(), &[4]);
        assert!(!column.is_c_contiguous());

        let block = layout.slice(1, 1, 3);
        assert_eq!(block.shape(), &[3, 2]);
        assert_eq!(block.offset(), 1);
        assert_eq!(block.linear_index(&[2, 1]), 10);
    }

    #[test]
    fn expand_uses_zero_strides() {
        let layout = Layout::contiguous(&[3, 1]);
        let expanded = layout.expand(&[2, 3, 4]).unwrap();
        assert_eq!(expanded.strides(), &[0, 1, 0]);
        assert_eq!(expanded.linear_index(&[1, 2, 3]), 2);
        assert!(layout.expand(&[3, 5]).is_ok());
        assert!(matches!(layout.expand(&[2, 4]), Err(ArrayError::Shape(_))));
        assert!(matches!(layout.expand(&[4]), Err(ArrayError::Shape(_))));
    }

    #[test]
    fn permutations_compose() {
        let layout = Layout::from_parts(5, [2, 3, 4].into(), [12, 4, 1].into());
        let p1 = [1, 2, 0];
        let p2 = [2, 0, 1];
        let composed: Vec<usize> = p2.iter().map(|&i| p1[i]).collect();
        let twice = layout.permute(&p1).unwrap().permute(&p2).unwrap();
        assert_eq!(twice, layout.permute(&composed).unwrap());
        assert!(layout.permute(&[0, 0, 1]).is_err());
        assert!(layout.permute(&[0, 1]).is_err());
    }

    #[test]
    fn reshape_requires_c_contiguity() {
        let layout = Layout::contiguous(&[2, 6]).slice(0, 1, 2);
        let reshaped = layout.reshape(&[3, 2]).unwrap();
        assert_eq!(reshaped.offset(), 6);
        assert_eq!(reshaped.strides(), &[2, 1]);
        assert_eq!(reshaped.reshape(&[1, 6]).unwrap().shape(), &[1, 6]);
        assert!(Layout::contiguous(&[2, 3])
            .permute(&[1, 0])
            .unwrap()
            .reshape(&[6])
            .is_none());
    }

    #[test]
    fn views_rebase_onto_strided_sources() {
        let transposed = Layout::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
        let row = Layout::contiguous(&[1, 3]).expand(&[2, 3]).unwrap();
        assert_eq!(
            transposed.rebase(&row),
            Some(Layout::from_parts(0, [3, 2].into(), [1, 0].into()))
        );

        let block = Layout::contiguous(&[4, 4]).slice(1, 1, 3);
        let column_major = Layout::contiguous(&[4, 4]).permute(&[1, 0]).unwrap();
        let rebased = block.rebase(&column_major).unwrap();
        assert_eq!(rebased.strides(), &[1, 4]);
        assert_eq!(rebased.offset(), 4);
        assert_eq!(rebased.linear_index(&[2, 1]), 10);

        let split = Layout::contiguous(&[6]).reshape(&[2, 3]).unwrap();
        let every_other = Layout::from_parts(0, [6].into(), [2].into());
        assert_eq!(split.rebase(&every_other).unwrap().strides(), &[6, 2]);
    }

    #[test]
    fn merged_axes_need_contiguous_sources() {
        let flat = Layout::contiguous(&[2, 3]).reshape(&[6]).unwrap();
        let shifted = Layout::from_parts(5, [2, 3].into(), [3, 1].into());
        assert_eq!(
            flat.rebase(&shifted),
            Some(Layout::from_parts(5, [6].into(), [1].into()))
        );
        let row = Layout::contiguous(&[1, 3]).expand(&[2, 3]).unwrap();
        assert_eq!(flat.rebase(&row), None);
    }

    #[test]
    fn broadcasting() {
        assert_eq!(&*broadcast_shapes(&[3, 1], &[4]).unwrap(), &[3, 4]);
        assert_eq!(&*broadcast_shapes(&[], &[2, 2]).unwrap(), &[2, 2]);
        assert_eq!(&*broadcast_shapes(&[5, 1, 2], &[3, 1]).unwrap(), &[5, 3, 2]);
        assert!(broadcast_shapes(&[3], &[4]).is_err());
    }

    #[test]
    fn wildcard_dimensions() {
        assert_eq!(&*resolve_shape(&[-1, 4], 12).unwrap(), &[3, 4]);
        assert_eq!(&*resolve_shape(&[2, 3], 6).unwrap(), &[2, 3]);
        assert!(resolve_shape(&[-1, 5], 12).is_err());
        assert!(resolve_shape(&[-1, -1], 12).is_err());
        assert!(resolve_shape(&[2, 2], 12).is_err());
        assert!(resolve_shape(&[0, 2], 0).is_err());
    }

    #[test]
    fn axis_normalization() {
        assert_eq!(normalize_axis(-1, 3).unwrap(), 2);
        assert_eq!(normalize_axis(0, 1).unwrap(), 0);
        assert!(matches!(normalize_axis(3, 3), Err(ArrayError::Index(_))));
        assert!(normalize_axis(-4, 3).is_err());
    }
}

use std::{fmt::Debug, ops::Index};

use crate::layout::continuous_strides;

/// A row-major copy of an array in host memory.
#[derive(Clone, PartialEq)]
pub struct HostArray {
    data: Vec<f32>,
    shape: Box<[usize]>,
    strides: Box<[usize]>,
}

impl HostArray {
    pub(crate) fn new(data: Vec<f32>, shape: Box<[usize]>) -> Self {
        let strides = continuous_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, index: &[usize]) -> Option<f32> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut position = 0;
        for ((&i, &size), &stride) in index.iter().zip(&self.shape).zip(&self.strides) {
            if i >= size {
                return None;
            }
            position += i * stride;
        }
        self.data.get(position).copied()
    }
}

impl<const R: usize> Index<[usize; R]> for HostArray {
    type Output = f32;

    fn index(&self, index: [usize; R]) -> &Self::Output {
        assert_eq!(R, self.shape.len(), "index rank does not match the array");
        let position: usize = index
            .iter()
            .zip(&self.shape)
            .zip(&self.strides)
            .map(|((&i, &size), &stride)| {
                assert!(i < size, "index {index:?} out of bounds for {:?}", self.shape);
                i * stride
            })
            .sum();
        &self.data[position]
    }
}

impl Debug for HostArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn nested(
            f: &mut std::fmt::Formatter<'_>,
            data: &[f32],
            shape: &[usize],
        ) -> std::fmt::Result {
            match shape {
                [] => write!(f, "{:?}", data[0]),
                [_] => write!(f, "{data:?}"),
                [rows, rest @ ..] => {
                    let chunk = data.len() / rows;
                    f.write_str("[")?;
                    for (i, row) in data.chunks(chunk).enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        nested(f, row, rest)?;
                    }
                    f.write_str("]")
                }
            }
        }
        nested(f, &self.data, &self.shape)
    }
}

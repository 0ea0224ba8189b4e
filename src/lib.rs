//! Lazily evaluated strided arrays on the GPU.
//!
//! Operations on a [`StridedArray`] record nodes of a deferred graph. Forcing an
//! array rewrites the graph behind it into as few generated WGSL kernels as it can
//! and dispatches them through `wgpu`.

pub use array::{DType, IntoArray, StridedArray};
pub use config::{DeviceConfig, OptimizerConfig};
pub use device::{Device, KernelStats};
pub use error::{ArrayError, Result};
pub use host::HostArray;
pub use layout::Layout;
pub use operation::{ElementwiseOp, Operator, ProcessingOp, ReduceOp, ViewOp};
pub use view::SliceArg;

mod array;
mod compute_graph;
mod config;
mod device;
mod element_wise;
mod error;
mod expr;
mod host;
mod kernel;
mod layout;
mod matmul;
mod operation;
mod ops;
mod reduce;
#[cfg(test)]
mod test_util;
mod view;

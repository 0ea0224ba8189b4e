use std::fmt::Display;

use crate::{
    array::StridedArray,
    expr::{BinaryFn, Expr, UnaryFn},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementwiseOp {
    Neg,
    Exp,
    Log,
    Add,
    Sub,
    Div,
    Mul,
    Pow,
    Eq,
    Ge,
    Gt,
    Relu,
    ReluGrad,
    Identity,
}

impl ElementwiseOp {
    pub fn arity(self) -> usize {
        match self {
            Self::Neg | Self::Exp | Self::Log | Self::Relu | Self::Identity => 1,
            Self::Add
            | Self::Sub
            | Self::Div
            | Self::Mul
            | Self::Pow
            | Self::Eq
            | Self::Ge
            | Self::Gt
            | Self::ReluGrad => 2,
        }
    }

    /// The scalar body over operands `A` and `B`.
    pub(crate) fn expr(self) -> Expr {
        let unary = |function| Expr::unary(function, Expr::operand(0));
        let binary = |function| Expr::binary(function, Expr::operand(0), Expr::operand(1));
        match self {
            Self::Identity => Expr::operand(0),
            Self::Neg => unary(UnaryFn::Neg),
            Self::Exp => unary(UnaryFn::Exp),
            Self::Log => unary(UnaryFn::Log),
            Self::Relu => unary(UnaryFn::Relu),
            Self::Add => binary(BinaryFn::Add),
            Self::Sub => binary(BinaryFn::Sub),
            Self::Div => binary(BinaryFn::Div),
            Self::Mul => binary(BinaryFn::Mul),
            Self::Pow => binary(BinaryFn::Pow),
            Self::Eq => binary(BinaryFn::Eq),
            Self::Ge => binary(BinaryFn::Ge),
            Self::Gt => binary(BinaryFn::Gt),
            Self::ReluGrad => binary(BinaryFn::ReluGrad),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    /// Value of out-of-range lanes in the tree fold.
    pub(crate) fn wgsl_padding(self) -> &'static str {
        match self {
            Self::Sum => "0.0",
            // -inf
            Self::Max => "bitcast<f32>(0xff800000u)",
        }
    }

    pub(crate) fn wgsl_combine(self, a: &str, b: &str) -> String {
        match self {
            Self::Sum => format!("{a} + {b}"),
            Self::Max => format!("max({a}, {b})"),
        }
    }

    /// Reduce `count` copies of `value`.
    pub(crate) fn fold_constant(self, value: f32, count: usize) -> f32 {
        match self {
            Self::Sum => value * count as f32,
            Self::Max => value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessingOp {
    MatMul,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewOp {
    Reshape,
    Expand,
    Permute,
    Slice,
}

/// Operator tag of a graph node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    Elementwise(ElementwiseOp),
    Reduce(ReduceOp),
    Processing(ProcessingOp),
    View(ViewOp),
}

impl Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::Elementwise(op) => write!(f, "{op:?}"),
            Operator::Reduce(op) => write!(f, "{op:?}"),
            Operator::Processing(op) => write!(f, "{op:?}"),
            Operator::View(op) => write!(f, "{op:?}"),
        }
    }
}

/// What a lazy node computes, with its non-array arguments.
#[derive(Clone)]
pub(crate) enum Operation {
    Elementwise {
        op: ElementwiseOp,
        /// Scalar body over the node's operands. Starts as `op.expr()` and grows
        /// when fusion absorbs dependencies.
        body: Expr,
        out: Option<StridedArray>,
    },
    Reduce {
        op: ReduceOp,
        /// `None` reduces every axis.
        axis: Option<usize>,
        keepdims: bool,
    },
    Processing {
        op: ProcessingOp,
        /// Applied to the accumulator; reads operands after the two matmul inputs.
        epilogue: Option<Expr>,
        out: Option<StridedArray>,
    },
    View(ViewOp),
}

/// A node of the deferred graph: an operation and the arrays it reads.
#[derive(Clone)]
pub(crate) struct OperationDescriptor {
    pub(crate) operation: Operation,
    pub(crate) operands: Vec<StridedArray>,
}

impl OperationDescriptor {
    pub(crate) fn new(operation: Operation, operands: Vec<StridedArray>) -> Self {
        Self {
            operation,
            operands,
        }
    }

    pub(crate) fn operator(&self) -> Operator {
        match &self.operation {
            Operation::Elementwise { op, .. } => Operator::Elementwise(*op),
            Operation::Reduce { op, .. } => Operator::Reduce(*op),
            Operation::Processing { op, .. } => Operator::Processing(*op),
            Operation::View(op) => Operator::View(*op),
        }
    }

    pub(crate) fn is_view(&self) -> bool {
        matches!(self.operation, Operation::View(_))
    }

    pub(crate) fn is_processing(&self) -> bool {
        matches!(self.operation, Operation::Processing { .. })
    }

    /// Whether the result lands in a caller supplied array instead of the node's
    /// own layout.
    pub(crate) fn has_destination(&self) -> bool {
        matches!(
            self.operation,
            Operation::Elementwise { out: Some(_), .. } | Operation::Processing { out: Some(_), .. }
        )
    }

    /// Short label for logs and graph dumps.
    pub(crate) fn label(&self) -> String {
        match &self.operation {
            Operation::Elementwise { body, .. } => format!("{} = {body}", self.operator()),
            Operation::Reduce { op, axis, keepdims } => {
                format!("{op:?}(axis={axis:?}, keepdims={keepdims})")
            }
            Operation::Processing { op, epilogue, .. } => match epilogue {
                Some(epilogue) => format!("{op:?} -> {epilogue}"),
                None => format!("{op:?}"),
            },
            Operation::View(op) => format!("{op:?}"),
        }
    }
}

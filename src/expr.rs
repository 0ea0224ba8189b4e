//! Scalar expression trees for elementwise kernel bodies and matmul epilogues.
//!
//! Fusion composes these trees instead of splicing strings; the WGSL text is only
//! produced at code generation time.

use std::fmt::{Display, Write};

/// Position of an operand in its node's operand list, printed as `A`, `B`, ...
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct OperandName(pub(crate) usize);

impl Display for OperandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut index = self.0;
        let mut name = Vec::new();
        loop {
            name.push(b'A' + (index % 26) as u8);
            if index < 26 {
                break;
            }
            index = index / 26 - 1;
        }
        name.reverse();
        f.write_str(&String::from_utf8_lossy(&name))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum UnaryFn {
    Neg,
    Exp,
    Log,
    Relu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum BinaryFn {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Eq,
    Ge,
    Gt,
    /// `rhs > 0 ? lhs : 0`
    ReluGrad,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Operand(OperandName),
    /// The matmul accumulator inside an epilogue.
    Accumulator,
    Unary(UnaryFn, Box<Expr>),
    Binary(BinaryFn, Box<Expr>, Box<Expr>),
}

/// WGSL `pow` is undefined for negative bases; integral exponents follow the host.
pub(crate) const WGSL_PRELUDE: &str = "fn pow_f32(a: f32, b: f32) -> f32 {
    if b == round(b) {
        let magnitude = pow(abs(a), b);
        if a < 0.0 && abs(b % 2.0) == 1.0 {
            return -magnitude;
        }
        return magnitude;
    }
    return pow(a, b);
}
";

impl Expr {
    pub(crate) fn operand(index: usize) -> Self {
        Self::Operand(OperandName(index))
    }

    pub(crate) fn unary(function: UnaryFn, value: Expr) -> Self {
        Self::Unary(function, Box::new(value))
    }

    pub(crate) fn binary(function: BinaryFn, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary(function, Box::new(lhs), Box::new(rhs))
    }

    /// Replace every operand leaf with `f(name)`.
    pub(crate) fn substitute(&self, f: &mut impl FnMut(OperandName) -> Expr) -> Expr {
        match self {
            Expr::Operand(name) => f(*name),
            Expr::Accumulator => Expr::Accumulator,
            Expr::Unary(function, value) => Expr::unary(*function, value.substitute(f)),
            Expr::Binary(function, lhs, rhs) => {
                Expr::binary(*function, lhs.substitute(f), rhs.substitute(f))
            }
        }
    }

    /// Operands in order of first use, without repeats.
    pub(crate) fn operands(&self) -> Vec<OperandName> {
        fn visit(expr: &Expr, out: &mut Vec<OperandName>) {
            match expr {
                Expr::Operand(name) => {
                    if !out.contains(name) {
                        out.push(*name);
                    }
                }
                Expr::Accumulator => {}
                Expr::Unary(_, value) => visit(value, out),
                Expr::Binary(_, lhs, rhs) => {
                    visit(lhs, out);
                    visit(rhs, out);
                }
            }
        }
        let mut out = Vec::new();
        visit(self, &mut out);
        out
    }

    pub(crate) fn uses_accumulator(&self) -> bool {
        match self {
            Expr::Accumulator => true,
            Expr::Operand(_) => false,
            Expr::Unary(_, value) => value.uses_accumulator(),
            Expr::Binary(_, lhs, rhs) => lhs.uses_accumulator() || rhs.uses_accumulator(),
        }
    }

    /// Evaluate on the host with the same semantics as the generated kernel.
    pub(crate) fn eval(&self, operand: &impl Fn(OperandName) -> f32, accumulator: f32) -> f32 {
        match self {
            Expr::Operand(name) => operand(*name),
            Expr::Accumulator => accumulator,
            Expr::Unary(function, value) => {
                let value = value.eval(operand, accumulator);
                match function {
                    UnaryFn::Neg => -value,
                    UnaryFn::Exp => value.exp(),
                    UnaryFn::Log => value.ln(),
                    UnaryFn::Relu => value.max(0.0),
                }
            }
            Expr::Binary(function, lhs, rhs) => {
                let a = lhs.eval(operand, accumulator);
                let b = rhs.eval(operand, accumulator);
                match function {
                    BinaryFn::Add => a + b,
                    BinaryFn::Sub => a - b,
                    BinaryFn::Mul => a * b,
                    BinaryFn::Div => a / b,
                    BinaryFn::Pow => a.powf(b),
                    BinaryFn::Eq => f32::from(a == b),
                    BinaryFn::Ge => f32::from(a >= b),
                    BinaryFn::Gt => f32::from(a > b),
                    BinaryFn::ReluGrad => {
                        if b > 0.0 {
                            a
                        } else {
                            0.0
                        }
                    }
                }
            }
        }
    }

    /// Write the expression as WGSL. `operand` names the local holding each operand.
    pub(crate) fn emit(
        &self,
        f: &mut String,
        operand: &impl Fn(OperandName) -> String,
    ) -> std::fmt::Result {
        match self {
            Expr::Operand(name) => write!(f, "{}", operand(*name)),
            Expr::Accumulator => write!(f, "acc"),
            Expr::Unary(function, value) => {
                let (open, close) = match function {
                    UnaryFn::Neg => ("(-", ")"),
                    UnaryFn::Exp => ("exp(", ")"),
                    UnaryFn::Log => ("log(", ")"),
                    UnaryFn::Relu => ("max(", ", 0.0)"),
                };
                f.push_str(open);
                value.emit(f, operand)?;
                f.push_str(close);
                Ok(())
            }
            Expr::Binary(function, lhs, rhs) => {
                let infix = match function {
                    BinaryFn::Add => Some(" + "),
                    BinaryFn::Sub => Some(" - "),
                    BinaryFn::Mul => Some(" * "),
                    BinaryFn::Div => Some(" / "),
                    _ => None,
                };
                if let Some(infix) = infix {
                    f.push('(');
                    lhs.emit(f, operand)?;
                    f.push_str(infix);
                    rhs.emit(f, operand)?;
                    f.push(')');
                    return Ok(());
                }
                match function {
                    BinaryFn::Pow => {
                        f.push_str("pow_f32(");
                        lhs.emit(f, operand)?;
                        f.push_str(", ");
                        rhs.emit(f, operand)?;
                        f.push(')');
                    }
                    BinaryFn::Eq | BinaryFn::Ge | BinaryFn::Gt => {
                        let comparison = match function {
                            BinaryFn::Eq => " == ",
                            BinaryFn::Ge => " >= ",
                            _ => " > ",
                        };
                        f.push_str("select(0.0, 1.0, ");
                        lhs.emit(f, operand)?;
                        f.push_str(comparison);
                        rhs.emit(f, operand)?;
                        f.push(')');
                    }
                    BinaryFn::ReluGrad => {
                        f.push_str("select(0.0, ");
                        lhs.emit(f, operand)?;
                        f.push_str(", ");
                        rhs.emit(f, operand)?;
                        f.push_str(" > 0.0)");
                    }
                    BinaryFn::Add | BinaryFn::Sub | BinaryFn::Mul | BinaryFn::Div => {
                        unreachable!("infix operators are emitted above")
                    }
                }
                Ok(())
            }
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        self.emit(&mut out, &|name| name.to_string())?;
        f.write_str(&out)
    }
}

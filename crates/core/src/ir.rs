use crate::bank::BankId;
use crate::def::DefId;
use crate::expr::Expression;
use crate::platform::Operand;
use crate::span::Span;

/// One operand of a selected instruction: the reduced source expression it
/// came from (re-reduced during the write pass once addresses are known)
/// plus the operand tree used for pattern matching.
#[derive(Debug, Clone)]
pub struct OperandRoot {
    pub expression: Option<Expression>,
    pub operand: Operand,
}

impl OperandRoot {
    pub fn new(expression: Option<Expression>, operand: Operand) -> Self {
        Self {
            expression,
            operand,
        }
    }

    pub fn fixed(operand: Operand) -> Self {
        Self {
            expression: None,
            operand,
        }
    }
}

/// Linear intermediate representation consumed by the two codegen passes.
#[derive(Debug)]
pub enum IrNode {
    /// Switch to a bank (optionally seeking to an absolute address),
    /// remembering the previous one.
    PushRelocation {
        bank: BankId,
        address: Option<u64>,
        span: Span,
    },
    PopRelocation,
    /// Pin a function or label definition to the current bank address.
    Label(DefId),
    /// A selected instruction awaiting sizing and encoding.
    Code {
        instruction: usize,
        operands: Vec<OperandRoot>,
        span: Span,
    },
    /// Storage for a variable (reservation in ram banks, initializer bytes in
    /// stored banks).
    Var(DefId),
}

use indexmap::IndexMap;

use crate::ast::Statement;
use crate::def::DefId;
use crate::span::{Span, Spanned};
use crate::types::TypeExpression;

/// When the value of an expression becomes known.
///
/// Ordered: a composite expression's context is the max of its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvaluationContext {
    /// Fully known while compiling.
    CompileTime,
    /// Depends on addresses assigned during the first codegen pass.
    LinkTime,
    /// Only known on the target machine; becomes instruction operands.
    RunTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueQualifiers {
    pub lvalue: bool,
    pub is_const: bool,
    pub is_writeonly: bool,
    pub is_far: bool,
}

impl ValueQualifiers {
    pub fn lvalue() -> Self {
        Self {
            lvalue: true,
            ..Self::default()
        }
    }
}

/// Populated on every node of a reduced expression tree.
#[derive(Debug, Clone)]
pub struct ExpressionInfo {
    pub context: EvaluationContext,
    pub ty: TypeExpression,
    pub qualifiers: ValueQualifiers,
}

impl ExpressionInfo {
    pub fn new(context: EvaluationContext, ty: TypeExpression) -> Self {
        Self {
            context,
            ty,
            qualifiers: ValueQualifiers::default(),
        }
    }

    pub fn with_qualifiers(mut self, qualifiers: ValueQualifiers) -> Self {
        self.qualifiers = qualifiers;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Assignment,
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Modulo,
    LeftShift,
    RightShift,
    LogicalLeftShift,
    LogicalRightShift,
    LeftRotate,
    RightRotate,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    Concatenation,
    Indexing,
    BitIndexing,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Assignment => "=",
            Self::Addition => "+",
            Self::Subtraction => "-",
            Self::Multiplication => "*",
            Self::Division => "/",
            Self::Modulo => "%",
            Self::LeftShift => "<<",
            Self::RightShift => ">>",
            Self::LogicalLeftShift => "<<<",
            Self::LogicalRightShift => ">>>",
            Self::LeftRotate => "<<<<",
            Self::RightRotate => ">>>>",
            Self::BitwiseAnd => "&",
            Self::BitwiseOr => "|",
            Self::BitwiseXor => "^",
            Self::Concatenation => "~",
            Self::Indexing => "[]",
            Self::BitIndexing => "$",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LogicalAnd => "&&",
            Self::LogicalOr => "||",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Addition
                | Self::Subtraction
                | Self::Multiplication
                | Self::Division
                | Self::Modulo
                | Self::LeftShift
                | Self::RightShift
                | Self::LogicalLeftShift
                | Self::LogicalRightShift
                | Self::BitwiseAnd
                | Self::BitwiseOr
                | Self::BitwiseXor
        )
    }

    /// Logical complement of a comparison: `!(a op b)` == `a complement(op) b`.
    pub fn complement(self) -> Option<BinaryOp> {
        Some(match self {
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::LessThan => Self::GreaterThanOrEqual,
            Self::GreaterThanOrEqual => Self::LessThan,
            Self::GreaterThan => Self::LessThanOrEqual,
            Self::LessThanOrEqual => Self::GreaterThan,
            _ => return None,
        })
    }

    /// Mirror of a comparison with swapped operands: `a op b` == `b reverse(op) a`.
    pub fn reverse(self) -> Option<BinaryOp> {
        Some(match self {
            Self::Equal => Self::Equal,
            Self::NotEqual => Self::NotEqual,
            Self::LessThan => Self::GreaterThan,
            Self::GreaterThan => Self::LessThan,
            Self::LessThanOrEqual => Self::GreaterThanOrEqual,
            Self::GreaterThanOrEqual => Self::LessThanOrEqual,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Minus,
    BitwiseNegation,
    LogicalNegation,
    PreIncrement,
    PostIncrement,
    PreDecrement,
    PostDecrement,
    AddressOf,
    FarAddressOf,
    Indirection,
    LowByte,
    HighByte,
    BankByte,
    /// `@expr`: reserve storage for a constant and take its address.
    AddressReserve,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Minus => "-",
            Self::BitwiseNegation => "~",
            Self::LogicalNegation => "!",
            Self::PreIncrement | Self::PostIncrement => "++",
            Self::PreDecrement | Self::PostDecrement => "--",
            Self::AddressOf => "&",
            Self::FarAddressOf => "far &",
            Self::Indirection => "*",
            Self::LowByte => "<:",
            Self::HighByte => ">:",
            Self::BankByte => "#:",
            Self::AddressReserve => "@",
        }
    }

    pub fn is_increment(self) -> bool {
        matches!(
            self,
            Self::PreIncrement | Self::PostIncrement | Self::PreDecrement | Self::PostDecrement
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeQueryKind {
    SizeOf,
    AlignOf,
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExpressionKind,
    pub span: Span,
    pub info: Option<ExpressionInfo>,
}

#[derive(Debug, Clone)]
pub enum ExpressionKind {
    ArrayLiteral(Vec<Expression>),
    /// `[value; length]`
    ArrayPadLiteral {
        value: Box<Expression>,
        length: Box<Expression>,
    },
    /// `[body for name in sequence]`
    ArrayComprehension {
        name: String,
        sequence: Box<Expression>,
        body: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Call {
        inlined: bool,
        function: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Cast {
        operand: Box<Expression>,
        target: TypeExpression,
    },
    Embed(String),
    FieldAccess {
        operand: Box<Expression>,
        field: String,
    },
    Identifier(Vec<String>),
    ResolvedIdentifier {
        def: DefId,
        pieces: Vec<String>,
    },
    IntegerLiteral(i128),
    BooleanLiteral(bool),
    StringLiteral(Vec<u8>),
    StructLiteral {
        type_expression: TypeExpression,
        members: IndexMap<String, Expression>,
    },
    TupleLiteral(Vec<Expression>),
    RangeLiteral {
        start: Box<Expression>,
        end: Box<Expression>,
        step: Option<Box<Expression>>,
    },
    OffsetOf {
        type_expression: TypeExpression,
        field: String,
    },
    /// A statement evaluated for effect before yielding `result`; produced
    /// internally when lowering calls with side effects.
    SideEffect {
        statement: Box<Spanned<Statement>>,
        result: Box<Expression>,
    },
    TypeOf(Box<Expression>),
    TypeQuery {
        kind: TypeQueryKind,
        target: TypeExpression,
    },
}

impl Expression {
    pub fn new(kind: ExpressionKind, span: Span) -> Self {
        Self {
            kind,
            span,
            info: None,
        }
    }

    pub fn with_info(kind: ExpressionKind, span: Span, info: ExpressionInfo) -> Self {
        Self {
            kind,
            span,
            info: Some(info),
        }
    }

    pub fn identifier(pieces: Vec<String>, span: Span) -> Self {
        Self::new(ExpressionKind::Identifier(pieces), span)
    }

    pub fn integer(value: i128, span: Span) -> Self {
        Self::new(ExpressionKind::IntegerLiteral(value), span)
    }

    pub fn context(&self) -> Option<EvaluationContext> {
        self.info.as_ref().map(|info| info.context)
    }

    pub fn ty(&self) -> Option<&TypeExpression> {
        self.info.as_ref().map(|info| &info.ty)
    }

    /// The value of a reduced compile-time integer literal.
    pub fn known_integer(&self) -> Option<i128> {
        match &self.kind {
            ExpressionKind::IntegerLiteral(value) => Some(*value),
            _ => None,
        }
    }

    pub fn known_boolean(&self) -> Option<bool> {
        match &self.kind {
            ExpressionKind::BooleanLiteral(value) => Some(*value),
            _ => None,
        }
    }

    pub fn resolved_def(&self) -> Option<DefId> {
        match &self.kind {
            ExpressionKind::ResolvedIdentifier { def, .. } => Some(*def),
            _ => None,
        }
    }

    /// Compact rendering for diagnostics; not a source-fidelity printer.
    pub fn describe(&self) -> String {
        match &self.kind {
            ExpressionKind::ArrayLiteral(items) => format!("[... x{}]", items.len()),
            ExpressionKind::ArrayPadLiteral { .. } => "[...; ...]".into(),
            ExpressionKind::ArrayComprehension { name, .. } => format!("[... for {name} in ...]"),
            ExpressionKind::Binary { op, left, right } => {
                format!("{} {} {}", left.describe(), op.symbol(), right.describe())
            }
            ExpressionKind::Unary { op, operand } => {
                format!("{}{}", op.symbol(), operand.describe())
            }
            ExpressionKind::Call { function, .. } => format!("{}(...)", function.describe()),
            ExpressionKind::Cast { operand, target } => {
                format!("{} as {}", operand.describe(), target.describe())
            }
            ExpressionKind::Embed(path) => format!("embed \"{path}\""),
            ExpressionKind::FieldAccess { operand, field } => {
                format!("{}.{field}", operand.describe())
            }
            ExpressionKind::Identifier(pieces) => pieces.join("."),
            ExpressionKind::ResolvedIdentifier { pieces, .. } => pieces.join("."),
            ExpressionKind::IntegerLiteral(value) => value.to_string(),
            ExpressionKind::BooleanLiteral(value) => value.to_string(),
            ExpressionKind::StringLiteral(bytes) => format!("\"{} bytes\"", bytes.len()),
            ExpressionKind::StructLiteral { .. } => "{ ... }".into(),
            ExpressionKind::TupleLiteral(items) => format!("(... x{})", items.len()),
            ExpressionKind::RangeLiteral { .. } => "..".into(),
            ExpressionKind::OffsetOf { field, .. } => format!("offsetof(..., {field})"),
            ExpressionKind::SideEffect { result, .. } => result.describe(),
            ExpressionKind::TypeOf(_) => "typeof(...)".into(),
            ExpressionKind::TypeQuery { kind, .. } => match kind {
                TypeQueryKind::SizeOf => "sizeof(...)".into(),
                TypeQueryKind::AlignOf => "alignof(...)".into(),
            },
        }
    }
}

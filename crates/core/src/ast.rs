use crate::expr::Expression;
use crate::span::{Span, Spanned};
use crate::types::TypeExpression;

/// `#[name(args...)]`
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub arguments: Vec<Expression>,
    pub span: Span,
}

/// Qualifiers on a `var`/`const` declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qualifiers {
    pub is_const: bool,
    pub is_writeonly: bool,
    pub is_extern: bool,
    pub is_far: bool,
}

impl Qualifiers {
    pub fn constant() -> Self {
        Self {
            is_const: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistanceHint {
    #[default]
    None,
    Near,
    Far,
}

/// The kind of control transfer a branch statement performs, doubling as a
/// function's declared way of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    None,
    Return,
    FarReturn,
    IrqReturn,
    NmiReturn,
    Goto,
    FarGoto,
    Call,
    FarCall,
    Break,
    Continue,
}

impl BranchKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::None => "(none)",
            Self::Return => "return",
            Self::FarReturn => "far return",
            Self::IrqReturn => "irq return",
            Self::NmiReturn => "nmi return",
            Self::Goto => "goto",
            Self::FarGoto => "far goto",
            Self::Call => "call",
            Self::FarCall => "far call",
            Self::Break => "break",
            Self::Continue => "continue",
        }
    }

    /// Promote a near transfer to its far form, when one exists.
    pub fn far_form(self) -> BranchKind {
        match self {
            Self::Goto => Self::FarGoto,
            Self::Call => Self::FarCall,
            Self::Return => Self::FarReturn,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructKind {
    Struct,
    Union,
}

#[derive(Debug, Clone)]
pub struct EnumMemberDecl {
    pub name: String,
    pub value: Option<Expression>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct StructMemberDecl {
    pub name: String,
    pub type_expression: TypeExpression,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ParameterDecl {
    pub name: String,
    pub type_expression: TypeExpression,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub name: String,
    pub value: Expression,
    pub span: Span,
}

/// The statement tree handed to the compiler by the (external) parser.
#[derive(Debug, Clone)]
pub enum Statement {
    Attribution {
        attributes: Vec<Attribute>,
        body: Box<Spanned<Statement>>,
    },
    Bank {
        names: Vec<String>,
        addresses: Vec<Option<Expression>>,
        type_expression: TypeExpression,
    },
    Block(Vec<Spanned<Statement>>),
    Config(Vec<ConfigEntry>),
    DoWhile {
        body: Box<Spanned<Statement>>,
        condition: Expression,
        distance_hint: DistanceHint,
    },
    Enum {
        name: String,
        underlying_type: Option<TypeExpression>,
        members: Vec<EnumMemberDecl>,
    },
    ExpressionStatement(Expression),
    File {
        path: String,
        items: Vec<Spanned<Statement>>,
    },
    For {
        counter: Expression,
        sequence: Expression,
        body: Box<Spanned<Statement>>,
        distance_hint: DistanceHint,
    },
    Func {
        name: String,
        far: bool,
        inlined: bool,
        parameters: Vec<ParameterDecl>,
        return_type: Option<TypeExpression>,
        body: Box<Spanned<Statement>>,
    },
    If {
        condition: Expression,
        body: Box<Spanned<Statement>>,
        alternative: Option<Box<Spanned<Statement>>>,
        distance_hint: DistanceHint,
    },
    In {
        pieces: Vec<String>,
        dest: Option<Expression>,
        body: Box<Spanned<Statement>>,
    },
    InlineFor {
        name: String,
        sequence: Expression,
        body: Box<Spanned<Statement>>,
    },
    ImportReference {
        expanded_path: String,
    },
    /// Marker for declarations minted by the compiler itself; carries no
    /// source behavior.
    InternalDeclaration,
    Branch {
        kind: BranchKind,
        distance_hint: DistanceHint,
        destination: Option<Expression>,
        return_value: Option<Expression>,
        condition: Option<Expression>,
    },
    Label {
        name: String,
        far: bool,
    },
    Let {
        name: String,
        parameters: Vec<String>,
        value: Expression,
    },
    Namespace {
        name: String,
        body: Box<Spanned<Statement>>,
    },
    Struct {
        kind: StructKind,
        name: String,
        members: Vec<StructMemberDecl>,
    },
    TypeAlias {
        name: String,
        type_expression: TypeExpression,
    },
    Var {
        qualifiers: Qualifiers,
        names: Vec<String>,
        addresses: Vec<Option<Expression>>,
        type_expression: Option<TypeExpression>,
        value: Option<Expression>,
    },
    While {
        condition: Expression,
        body: Box<Spanned<Statement>>,
        distance_hint: DistanceHint,
    },
}

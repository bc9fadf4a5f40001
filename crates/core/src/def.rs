use crate::ast::{BranchKind, Qualifiers, Statement, StructKind};
use crate::bank::{BankId, BankKind};
use crate::expr::Expression;
use crate::scope::ScopeId;
use crate::span::{Span, Spanned};
use crate::types::TypeExpression;

/// Stable handle to a definition. Handles are minted in the reservation phase
/// and never invalidated; later phases fill in the fields behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefId(pub u32);

/// Where a stored entity ends up in the target address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Address {
    pub absolute: Option<u64>,
    pub relative: Option<usize>,
    pub bank: Option<BankId>,
}

#[derive(Debug, Clone, Default)]
pub struct VarDef {
    pub qualifiers: Qualifiers,
    pub enclosing_function: Option<DefId>,
    pub type_expression: Option<TypeExpression>,
    pub address_expression: Option<Expression>,
    pub resolved_type: Option<TypeExpression>,
    pub storage_size: Option<usize>,
    pub address: Option<Address>,
    pub initializer: Option<Expression>,
    /// Anonymous constants minted by `@expr` inside this var's initializer.
    pub nested_constants: Vec<DefId>,
}

#[derive(Debug, Clone)]
pub struct FuncDef<'ast> {
    pub fallthrough: bool,
    pub inlined: bool,
    pub far: bool,
    pub return_kind: BranchKind,
    pub return_type_expression: Option<TypeExpression>,
    pub resolved_return_type: Option<TypeExpression>,
    pub enclosing_scope: Option<ScopeId>,
    /// Absent for labels and extern declarations.
    pub body: Option<&'ast Spanned<Statement>>,
    pub parameters: Vec<DefId>,
    pub address: Option<Address>,
    pub has_unconditional_return: bool,
}

impl<'ast> FuncDef<'ast> {
    /// A plain code location: no body of its own, placed wherever the
    /// surrounding code happens to be during the sizing pass.
    pub fn label(far: bool) -> Self {
        Self {
            fallthrough: true,
            inlined: false,
            far,
            return_kind: BranchKind::None,
            return_type_expression: None,
            resolved_return_type: None,
            enclosing_scope: None,
            body: None,
            parameters: Vec::new(),
            address: None,
            has_unconditional_return: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LetDef {
    pub parameters: Vec<String>,
    pub body: Expression,
}

#[derive(Debug, Clone)]
pub struct BankDef {
    pub address_expression: Option<Expression>,
    pub type_expression: TypeExpression,
    pub resolved_type: Option<TypeExpression>,
    pub bank: Option<BankId>,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub underlying_type_expression: Option<TypeExpression>,
    pub resolved_underlying_type: Option<TypeExpression>,
    pub members: Vec<DefId>,
    pub scope: ScopeId,
}

#[derive(Debug, Clone)]
pub struct EnumMemberDef {
    pub owner: DefId,
    pub base_expression: Option<Expression>,
    /// Distance from the most recent explicit member value (or from zero).
    pub offset: u64,
    pub reduced_expression: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub kind: StructKind,
    pub members: Vec<DefId>,
    pub size: Option<usize>,
    pub scope: ScopeId,
}

#[derive(Debug, Clone)]
pub struct StructMemberDef {
    pub owner: DefId,
    pub type_expression: TypeExpression,
    pub resolved_type: Option<TypeExpression>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NamespaceDef {
    pub scope: ScopeId,
}

#[derive(Debug, Clone)]
pub struct TypeAliasDef {
    pub type_expression: TypeExpression,
    pub resolved_type: Option<TypeExpression>,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinRegisterDef {
    /// The builtin integer type describing the register's width.
    pub ty: DefId,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinIntegerTypeDef {
    pub size: usize,
    pub min: i128,
    pub max: i128,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinBankTypeDef {
    pub kind: BankKind,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinLoadIntrinsicDef {
    /// The type the intrinsic produces.
    pub ty: DefId,
}

#[derive(Debug, Clone)]
pub enum DefKind<'ast> {
    Var(VarDef),
    Func(FuncDef<'ast>),
    Let(LetDef),
    Bank(BankDef),
    Enum(EnumDef),
    EnumMember(EnumMemberDef),
    Struct(StructDef),
    StructMember(StructMemberDef),
    Namespace(NamespaceDef),
    TypeAlias(TypeAliasDef),
    BuiltinRegister(BuiltinRegisterDef),
    BuiltinIntegerType(BuiltinIntegerTypeDef),
    BuiltinBoolType,
    /// `iexpr`: the arbitrary-precision compile-time integer type.
    BuiltinIntegerExpressionType,
    BuiltinBankType(BuiltinBankTypeDef),
    BuiltinRangeType,
    BuiltinTypeOfType,
    BuiltinLoadIntrinsic(BuiltinLoadIntrinsicDef),
    BuiltinVoidIntrinsic,
}

impl DefKind<'_> {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Var(_) => "variable",
            Self::Func(_) => "function",
            Self::Let(_) => "let expression",
            Self::Bank(_) => "bank",
            Self::Enum(_) => "enum",
            Self::EnumMember(_) => "enum member",
            Self::Struct(_) => "struct",
            Self::StructMember(_) => "struct member",
            Self::Namespace(_) => "namespace",
            Self::TypeAlias(_) => "type alias",
            Self::BuiltinRegister(_) => "register",
            Self::BuiltinIntegerType(_)
            | Self::BuiltinBoolType
            | Self::BuiltinIntegerExpressionType
            | Self::BuiltinBankType(_)
            | Self::BuiltinRangeType
            | Self::BuiltinTypeOfType => "built-in type",
            Self::BuiltinLoadIntrinsic(_) | Self::BuiltinVoidIntrinsic => "intrinsic",
        }
    }

    /// Whether this definition names a type.
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            Self::Enum(_)
                | Self::Struct(_)
                | Self::TypeAlias(_)
                | Self::BuiltinIntegerType(_)
                | Self::BuiltinBoolType
                | Self::BuiltinIntegerExpressionType
                | Self::BuiltinBankType(_)
                | Self::BuiltinRangeType
                | Self::BuiltinTypeOfType
        )
    }
}

#[derive(Debug, Clone)]
pub struct Def<'ast> {
    pub name: String,
    pub decl_span: Span,
    /// The scope the definition was declared in; type and expression
    /// reduction for this definition happen there.
    pub scope: ScopeId,
    pub kind: DefKind<'ast>,
}

/// Arena of all definitions created during a compile.
#[derive(Debug, Default)]
pub struct DefPool<'ast> {
    entries: Vec<Def<'ast>>,
}

impl<'ast> DefPool<'ast> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, def: Def<'ast>) -> DefId {
        let id = DefId(self.entries.len() as u32);
        self.entries.push(def);
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: DefId) -> &Def<'ast> {
        &self.entries[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: DefId) -> &mut Def<'ast> {
        &mut self.entries[id.0 as usize]
    }

    pub fn name(&self, id: DefId) -> &str {
        &self.get(id).name
    }

    pub fn ids(&self) -> impl Iterator<Item = DefId> {
        (0..self.entries.len() as u32).map(DefId)
    }

    pub fn as_var(&self, id: DefId) -> Option<&VarDef> {
        match &self.get(id).kind {
            DefKind::Var(var) => Some(var),
            _ => None,
        }
    }

    pub fn as_var_mut(&mut self, id: DefId) -> Option<&mut VarDef> {
        match &mut self.get_mut(id).kind {
            DefKind::Var(var) => Some(var),
            _ => None,
        }
    }

    pub fn as_func(&self, id: DefId) -> Option<&FuncDef<'ast>> {
        match &self.get(id).kind {
            DefKind::Func(func) => Some(func),
            _ => None,
        }
    }

    pub fn as_func_mut(&mut self, id: DefId) -> Option<&mut FuncDef<'ast>> {
        match &mut self.get_mut(id).kind {
            DefKind::Func(func) => Some(func),
            _ => None,
        }
    }

    pub fn as_namespace(&self, id: DefId) -> Option<&NamespaceDef> {
        match &self.get(id).kind {
            DefKind::Namespace(namespace) => Some(namespace),
            _ => None,
        }
    }

    pub fn as_integer_type(&self, id: DefId) -> Option<&BuiltinIntegerTypeDef> {
        match &self.get(id).kind {
            DefKind::BuiltinIntegerType(ty) => Some(ty),
            _ => None,
        }
    }
}

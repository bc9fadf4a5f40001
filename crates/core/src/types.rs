use crate::def::DefId;
use crate::expr::Expression;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerQualifiers {
    pub is_const: bool,
    pub is_writeonly: bool,
    pub is_far: bool,
}

/// A type as written in source or canonicalized by the type reducer.
///
/// Canonical forms only contain `ResolvedIdentifier` leaves; `Identifier` and
/// `TypeOf` never survive reduction.
#[derive(Debug, Clone)]
pub enum TypeExpression {
    Array {
        element: Box<TypeExpression>,
        /// Reduced to a compile-time integer literal during canonicalization.
        length: Option<Box<Expression>>,
    },
    Pointer {
        element: Box<TypeExpression>,
        qualifiers: PointerQualifiers,
    },
    Function {
        far: bool,
        parameters: Vec<TypeExpression>,
        return_type: Box<TypeExpression>,
    },
    Tuple(Vec<TypeExpression>),
    /// A logical type bound to a physical storage holder (register or memory
    /// l-value of the same storage size).
    DesignatedStorage {
        element: Box<TypeExpression>,
        holder: Box<Expression>,
    },
    Identifier(Vec<String>),
    ResolvedIdentifier {
        def: DefId,
        pieces: Vec<String>,
    },
    TypeOf(Box<Expression>),
}

impl TypeExpression {
    pub fn resolved(def: DefId, pieces: Vec<String>) -> Self {
        Self::ResolvedIdentifier { def, pieces }
    }

    /// The unit type, used as the return type of functions that return
    /// nothing.
    pub fn unit() -> Self {
        Self::Tuple(Vec::new())
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Tuple(elements) if elements.is_empty())
    }

    pub fn resolved_def(&self) -> Option<DefId> {
        match self {
            Self::ResolvedIdentifier { def, .. } => Some(*def),
            _ => None,
        }
    }

    /// Strip `DesignatedStorage` wrappers down to the logical element type.
    pub fn storage_element(&self) -> &TypeExpression {
        match self {
            Self::DesignatedStorage { element, .. } => element.storage_element(),
            other => other,
        }
    }

    /// Human-readable form for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Array { element, length } => match length {
                Some(_) => format!("[{}; ...]", element.describe()),
                None => format!("[{}]", element.describe()),
            },
            Self::Pointer {
                element,
                qualifiers,
            } => {
                let mut out = String::from("*");
                if qualifiers.is_far {
                    out.push_str("far ");
                }
                if qualifiers.is_const {
                    out.push_str("const ");
                } else if qualifiers.is_writeonly {
                    out.push_str("writeonly ");
                } else {
                    out.push_str("mut ");
                }
                out.push_str(&element.describe());
                out
            }
            Self::Function {
                far,
                parameters,
                return_type,
            } => {
                let params = parameters
                    .iter()
                    .map(TypeExpression::describe)
                    .collect::<Vec<_>>()
                    .join(", ");
                let prefix = if *far { "far func" } else { "func" };
                if return_type.is_unit() {
                    format!("{prefix}({params})")
                } else {
                    format!("{prefix}({params}) : {}", return_type.describe())
                }
            }
            Self::Tuple(elements) => {
                let inner = elements
                    .iter()
                    .map(TypeExpression::describe)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({inner})")
            }
            Self::DesignatedStorage { element, .. } => {
                format!("{} in <storage>", element.describe())
            }
            Self::Identifier(pieces) => pieces.join("."),
            Self::ResolvedIdentifier { pieces, .. } => pieces.join("."),
            Self::TypeOf(_) => "typeof(...)".to_string(),
        }
    }
}

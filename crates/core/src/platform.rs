use thiserror::Error;

use crate::ast::{BranchKind, DistanceHint};
use crate::builtins::Builtins;
use crate::def::{Def, DefId, DefKind, DefPool, BuiltinRegisterDef};
use crate::expr::{BinaryOp, UnaryOp};
use crate::scope::{Declared, ScopePool};

/// An operand tree produced from a reduced run-time expression, matched
/// against the platform's pattern table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Boolean(bool),
    Integer(i128),
    Register(DefId),
    /// `*addr` with the accessed width in bytes.
    Dereference {
        far: bool,
        size: usize,
        operand: Box<Operand>,
    },
    /// `base[subscript]` where the subscript stays run-time.
    Index {
        far: bool,
        size: usize,
        operand: Box<Operand>,
        subscript: Box<Operand>,
        scale: usize,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Operand>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Operand>,
        right: Box<Operand>,
    },
}

impl Operand {
    pub fn describe(&self, defs: &DefPool<'_>) -> String {
        match self {
            Self::Boolean(value) => value.to_string(),
            Self::Integer(value) => format!("{value:#X}"),
            Self::Register(def) => defs.name(*def).to_string(),
            Self::Dereference { far, size, operand } => {
                let far = if *far { "far " } else { "" };
                format!("*({far}{}):{size}", operand.describe(defs))
            }
            Self::Index {
                operand, subscript, ..
            } => format!(
                "{}[{}]",
                operand.describe(defs),
                subscript.describe(defs)
            ),
            Self::Unary { op, operand } => {
                format!("{}{}", op.symbol(), operand.describe(defs))
            }
            Self::Binary { op, left, right } => format!(
                "{} {} {}",
                left.describe(defs),
                op.symbol(),
                right.describe(defs)
            ),
        }
    }
}

/// One matcher in an instruction signature.
#[derive(Debug, Clone)]
pub enum OperandPattern {
    Boolean(bool),
    IntegerRange { min: i128, max: i128 },
    Register(DefId),
    Dereference {
        far: bool,
        size: usize,
        pattern: Box<OperandPattern>,
    },
    Index {
        far: bool,
        size: usize,
        pattern: Box<OperandPattern>,
        subscript: Box<OperandPattern>,
    },
    /// Matches like the inner pattern and records the matched integer as an
    /// encoding capture.
    Capture(Box<OperandPattern>),
    Unary {
        op: UnaryOp,
        pattern: Box<OperandPattern>,
    },
    Binary {
        op: BinaryOp,
        left: Box<OperandPattern>,
        right: Box<OperandPattern>,
    },
}

impl OperandPattern {
    pub fn imm(max: i128) -> Self {
        Self::IntegerRange { min: 0, max }
    }

    pub fn capture(inner: OperandPattern) -> Self {
        Self::Capture(Box::new(inner))
    }

    pub fn deref(size: usize, inner: OperandPattern) -> Self {
        Self::Dereference {
            far: false,
            size,
            pattern: Box::new(inner),
        }
    }

    /// Match one operand, collecting captures in order.
    pub fn matches(&self, operand: &Operand, captures: &mut Vec<i128>) -> bool {
        match (self, operand) {
            (Self::Boolean(expected), Operand::Boolean(actual)) => expected == actual,
            (Self::IntegerRange { min, max }, Operand::Integer(value)) => {
                value >= min && value <= max
            }
            (Self::Register(expected), Operand::Register(actual)) => expected == actual,
            (
                Self::Dereference { far, size, pattern },
                Operand::Dereference {
                    far: actual_far,
                    size: actual_size,
                    operand: inner,
                },
            ) => far == actual_far && size == actual_size && pattern.matches(inner, captures),
            (
                Self::Index {
                    far,
                    size,
                    pattern,
                    subscript,
                },
                Operand::Index {
                    far: actual_far,
                    size: actual_size,
                    operand: inner,
                    subscript: actual_subscript,
                    scale,
                },
            ) => {
                far == actual_far
                    && size == actual_size
                    && *scale == 1
                    && pattern.matches(inner, captures)
                    && subscript.matches(actual_subscript, captures)
            }
            (Self::Capture(inner), _) => {
                if !inner.matches(operand, captures) {
                    return false;
                }
                match operand {
                    Operand::Integer(value) => {
                        captures.push(*value);
                        true
                    }
                    _ => false,
                }
            }
            (
                Self::Unary { op, pattern },
                Operand::Unary {
                    op: actual,
                    operand: inner,
                },
            ) => op == actual && pattern.matches(inner, captures),
            (
                Self::Binary { op, left, right },
                Operand::Binary {
                    op: actual,
                    left: actual_left,
                    right: actual_right,
                },
            ) => {
                op == actual
                    && left.matches(actual_left, captures)
                    && right.matches(actual_right, captures)
            }
            _ => false,
        }
    }

    pub fn describe(&self, defs: &DefPool<'_>) -> String {
        match self {
            Self::Boolean(value) => value.to_string(),
            Self::IntegerRange { min, max } => format!("{{{min:#X}..{max:#X}}}"),
            Self::Register(def) => defs.name(*def).to_string(),
            Self::Dereference { far, size, pattern } => {
                let far = if *far { "far " } else { "" };
                format!("*({far}{}):{size}", pattern.describe(defs))
            }
            Self::Index {
                pattern, subscript, ..
            } => format!(
                "{}[{}]",
                pattern.describe(defs),
                subscript.describe(defs)
            ),
            Self::Capture(inner) => inner.describe(defs),
            Self::Unary { op, pattern } => {
                format!("{}{}", op.symbol(), pattern.describe(defs))
            }
            Self::Binary { op, left, right } => format!(
                "{} {} {}",
                left.describe(defs),
                op.symbol(),
                right.describe(defs)
            ),
        }
    }
}

/// The operation an instruction implements, used as the selection key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstructionType {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Branch(BranchKind),
    Intrinsic(String),
}

impl InstructionType {
    pub fn intrinsic(name: &str) -> Self {
        Self::Intrinsic(name.to_string())
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Unary(op) => format!("unary '{}'", op.symbol()),
            Self::Binary(op) => format!("binary '{}'", op.symbol()),
            Self::Branch(kind) => format!("branch '{}'", kind.describe()),
            Self::Intrinsic(name) => format!("intrinsic '{name}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstructionSignature {
    pub instruction_type: InstructionType,
    pub operand_patterns: Vec<OperandPattern>,
    /// Set of mode-flag bits under which this candidate is legal. Must cover
    /// every active mode bit for the candidate to apply; zero means
    /// mode-independent.
    pub mode_filter: u32,
}

impl InstructionSignature {
    pub fn new(instruction_type: InstructionType, operand_patterns: Vec<OperandPattern>) -> Self {
        Self {
            instruction_type,
            operand_patterns,
            mode_filter: 0,
        }
    }

    pub fn matches(&self, mode: u32, operands: &[Operand], captures: &mut Vec<i128>) -> bool {
        if self.mode_filter != 0 && (mode & !self.mode_filter) != 0 {
            return false;
        }
        if self.operand_patterns.len() != operands.len() {
            return false;
        }
        self.operand_patterns
            .iter()
            .zip(operands)
            .all(|(pattern, operand)| pattern.matches(operand, captures))
    }

    pub fn describe(&self, defs: &DefPool<'_>) -> String {
        let operands = self
            .operand_patterns
            .iter()
            .map(|pattern| pattern.describe(defs))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} ({operands})", self.instruction_type.describe())
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("operand value {value:#X} does not fit in {width} byte(s)")]
    OperandOutOfRange { value: i128, width: usize },
    #[error("branch target {target:#X} is out of relative range from {from:#X}")]
    BranchOutOfRange { target: i128, from: u64 },
    #[error("instruction encoding expected a captured operand")]
    MissingCapture,
}

/// How a matched instruction turns into bytes. Sizing must not depend on
/// values that are still placeholders during the first pass.
#[derive(Debug, Clone)]
pub enum InstructionEncoding {
    /// Opcode bytes only.
    Fixed(Vec<u8>),
    /// Opcode bytes followed by the first capture, little-endian.
    Operand { opcode: Vec<u8>, width: usize },
    /// Opcode byte followed by a signed 8-bit displacement to the captured
    /// absolute target.
    Relative { opcode: Vec<u8> },
}

impl InstructionEncoding {
    pub fn size(&self) -> usize {
        match self {
            Self::Fixed(opcode) => opcode.len(),
            Self::Operand { opcode, width } => opcode.len() + width,
            Self::Relative { opcode } => opcode.len() + 1,
        }
    }

    /// Produce the instruction bytes. `address` is the location the opcode
    /// will occupy, needed for relative displacements.
    pub fn encode(&self, address: u64, captures: &[i128]) -> Result<Vec<u8>, EncodeError> {
        match self {
            Self::Fixed(opcode) => Ok(opcode.clone()),
            Self::Operand { opcode, width } => {
                let value = *captures.first().ok_or(EncodeError::MissingCapture)?;
                let mask = (1i128 << (8 * width)) - 1;
                let masked = value & mask;
                if value < 0 || value > mask {
                    return Err(EncodeError::OperandOutOfRange {
                        value,
                        width: *width,
                    });
                }
                let mut bytes = opcode.clone();
                for index in 0..*width {
                    bytes.push(((masked >> (8 * index)) & 0xFF) as u8);
                }
                Ok(bytes)
            }
            Self::Relative { opcode } => {
                let target = *captures.first().ok_or(EncodeError::MissingCapture)?;
                let next = address as i128 + opcode.len() as i128 + 1;
                let delta = target - next;
                if delta < i8::MIN as i128 || delta > i8::MAX as i128 {
                    return Err(EncodeError::BranchOutOfRange {
                        target,
                        from: address,
                    });
                }
                let mut bytes = opcode.clone();
                bytes.push(delta as i8 as u8);
                Ok(bytes)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub signature: InstructionSignature,
    pub encoding: InstructionEncoding,
}

impl Instruction {
    pub fn new(
        instruction_type: InstructionType,
        operand_patterns: Vec<OperandPattern>,
        encoding: InstructionEncoding,
    ) -> Self {
        Self {
            signature: InstructionSignature::new(instruction_type, operand_patterns),
            encoding,
        }
    }
}

/// One conditional edge of a comparison lowering: branch when `flag` holds
/// `value`. Non-success edges route around the branch through a synthetic
/// skip label.
#[derive(Debug, Clone, Copy)]
pub struct FlagBranch {
    pub flag: DefId,
    pub value: bool,
    pub on_success: bool,
}

/// Platform recipe for lowering `left op right` into a flag test plus
/// conditional branches.
#[derive(Debug, Clone)]
pub struct TestAndBranch {
    pub test: InstructionType,
    pub operands: Vec<Operand>,
    pub branches: Vec<FlagBranch>,
}

/// A mode attribute: `#[name]` switches the bits of its group to `flag`.
#[derive(Debug, Clone, Copy)]
pub struct ModeAttribute {
    pub name: &'static str,
    pub flag: u32,
    /// All bits belonging to the attribute's mutually-exclusive group.
    pub group_mask: u32,
}

/// Scope access handed to a platform while it installs its registers and
/// intrinsics into the builtin scope.
pub struct PlatformRegistrar<'r, 'ast> {
    pub defs: &'r mut DefPool<'ast>,
    pub scopes: &'r mut ScopePool,
    pub builtins: &'r Builtins,
}

impl<'r, 'ast> PlatformRegistrar<'r, 'ast> {
    pub fn register(&mut self, name: &str, ty: DefId) -> DefId {
        self.declare(
            name,
            DefKind::BuiltinRegister(BuiltinRegisterDef { ty }),
        )
    }

    pub fn void_intrinsic(&mut self, name: &str) -> DefId {
        self.declare(name, DefKind::BuiltinVoidIntrinsic)
    }

    pub fn load_intrinsic(&mut self, name: &str, ty: DefId) -> DefId {
        self.declare(
            name,
            DefKind::BuiltinLoadIntrinsic(crate::def::BuiltinLoadIntrinsicDef { ty }),
        )
    }

    fn declare(&mut self, name: &str, kind: DefKind<'ast>) -> DefId {
        let scope = self.builtins.scope;
        let def = self.defs.add(Def {
            name: name.to_string(),
            decl_span: Builtins::builtin_span(),
            scope,
            kind,
        });
        match self.scopes.declare(scope, name, def) {
            Declared::Fresh(id) => id,
            Declared::Duplicate(_) => {
                panic!("platform redefined builtin '{name}'")
            }
        }
    }
}

/// Everything the core needs to know about a target CPU.
pub trait Platform {
    fn name(&self) -> &'static str;

    /// Install registers and intrinsics into the builtin scope; called once
    /// before any phase runs.
    fn reserve_definitions(&mut self, registrar: &mut PlatformRegistrar<'_, '_>);

    /// Builtin integer type for near pointers.
    fn pointer_sized_type(&self) -> DefId;

    /// Builtin integer type for far pointers.
    fn far_pointer_sized_type(&self) -> DefId;

    /// Sentinel operand value standing in for link-time-unknown addresses
    /// during the sizing pass.
    fn placeholder_value(&self) -> i128;

    /// The register tested by plain-register branch conditions, if the CPU
    /// has one.
    fn zero_flag(&self) -> Option<DefId>;

    fn mode_attributes(&self) -> &[ModeAttribute];

    fn instructions(&self) -> &[Instruction];

    fn get_test_and_branch(
        &self,
        common_type: DefId,
        op: BinaryOp,
        left: &Operand,
        right: &Operand,
        distance_hint: DistanceHint,
    ) -> Option<TestAndBranch>;
}

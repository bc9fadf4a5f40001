use indexmap::IndexMap;

use crate::bank::BankKind;
use crate::def::{
    BuiltinBankTypeDef, BuiltinIntegerTypeDef, BuiltinLoadIntrinsicDef, Def, DefId, DefKind,
    DefPool,
};
use crate::expr::Expression;
use crate::scope::{Declared, ScopeId, ScopePool};
use crate::span::{SourceId, Span};

/// Function attributes understood by the core, independent of platform.
pub const FUNC_ATTRIBUTES: &[&str] = &["irq", "nmi", "fallthrough"];

/// Conditional-compilation attribute; takes one boolean argument.
pub const COMPILE_IF: &str = "compile_if";

/// The platform-agnostic definitions every module scope inherits, plus the
/// compile-time define map supplied by the embedder.
#[derive(Debug)]
pub struct Builtins {
    /// Root parent of every module scope.
    pub scope: ScopeId,
    pub bool_type: DefId,
    pub iexpr_type: DefId,
    pub range_type: DefId,
    pub typeof_type: DefId,
    pub u8_type: DefId,
    pub u16_type: DefId,
    pub u24_type: DefId,
    pub u32_type: DefId,
    pub i8_type: DefId,
    pub i16_type: DefId,
    pub i24_type: DefId,
    pub i32_type: DefId,
    /// `vardata`: reservation-only ram.
    pub ram_bank_type: DefId,
    /// `prgdata`: stored program rom.
    pub prg_bank_type: DefId,
    /// `constdata`: stored data rom.
    pub const_bank_type: DefId,
    /// `chrdata`: stored character rom.
    pub chr_bank_type: DefId,
    pub has_def: DefId,
    pub get_def: DefId,
    pub defines: IndexMap<String, Expression>,
}

impl Builtins {
    /// Synthetic location for definitions without source text.
    pub fn builtin_span() -> Span {
        Span::point(SourceId(u32::MAX), 0)
    }

    pub fn register(
        defs: &mut DefPool<'_>,
        scopes: &mut ScopePool,
        defines: IndexMap<String, Expression>,
    ) -> Self {
        let scope = scopes.create(None, "<builtins>");

        let mut declare = |defs: &mut DefPool<'_>, scopes: &mut ScopePool, name: &str, kind| {
            let def = defs.add(Def {
                name: name.to_string(),
                decl_span: Self::builtin_span(),
                scope,
                kind,
            });
            match scopes.declare(scope, name, def) {
                Declared::Fresh(id) => id,
                Declared::Duplicate(_) => unreachable!("duplicate builtin '{name}'"),
            }
        };

        let mut integer = |defs: &mut DefPool<'_>, scopes: &mut ScopePool, name: &str, size: usize| {
            let bits = 8 * size as u32;
            let (min, max) = if name.starts_with('i') {
                (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
            } else {
                (0, (1i128 << bits) - 1)
            };
            declare(
                defs,
                scopes,
                name,
                DefKind::BuiltinIntegerType(BuiltinIntegerTypeDef { size, min, max }),
            )
        };

        let u8_type = integer(defs, scopes, "u8", 1);
        let u16_type = integer(defs, scopes, "u16", 2);
        let u24_type = integer(defs, scopes, "u24", 3);
        let u32_type = integer(defs, scopes, "u32", 4);
        let i8_type = integer(defs, scopes, "i8", 1);
        let i16_type = integer(defs, scopes, "i16", 2);
        let i24_type = integer(defs, scopes, "i24", 3);
        let i32_type = integer(defs, scopes, "i32", 4);

        let bool_type = declare(defs, scopes, "bool", DefKind::BuiltinBoolType);
        let iexpr_type = declare(defs, scopes, "iexpr", DefKind::BuiltinIntegerExpressionType);
        let range_type = declare(defs, scopes, "range", DefKind::BuiltinRangeType);
        let typeof_type = declare(defs, scopes, "typeof", DefKind::BuiltinTypeOfType);

        let mut bank_type = |defs: &mut DefPool<'_>, scopes: &mut ScopePool, name, kind| {
            declare(
                defs,
                scopes,
                name,
                DefKind::BuiltinBankType(BuiltinBankTypeDef { kind }),
            )
        };
        let ram_bank_type = bank_type(defs, scopes, "vardata", BankKind::Ram);
        let prg_bank_type = bank_type(defs, scopes, "prgdata", BankKind::Rom);
        let const_bank_type = bank_type(defs, scopes, "constdata", BankKind::Rom);
        let chr_bank_type = bank_type(defs, scopes, "chrdata", BankKind::CharacterRom);

        let has_def = declare(
            defs,
            scopes,
            "hasdef",
            DefKind::BuiltinLoadIntrinsic(BuiltinLoadIntrinsicDef { ty: bool_type }),
        );
        let get_def = declare(
            defs,
            scopes,
            "getdef",
            DefKind::BuiltinLoadIntrinsic(BuiltinLoadIntrinsicDef { ty: iexpr_type }),
        );

        Self {
            scope,
            bool_type,
            iexpr_type,
            range_type,
            typeof_type,
            u8_type,
            u16_type,
            u24_type,
            u32_type,
            i8_type,
            i16_type,
            i24_type,
            i32_type,
            ram_bank_type,
            prg_bank_type,
            const_bank_type,
            chr_bank_type,
            has_def,
            get_def,
            defines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_types_have_expected_ranges() {
        let mut defs = DefPool::new();
        let mut scopes = ScopePool::new();
        let builtins = Builtins::register(&mut defs, &mut scopes, IndexMap::new());

        let u8_type = defs.as_integer_type(builtins.u8_type).expect("u8");
        assert_eq!((u8_type.size, u8_type.min, u8_type.max), (1, 0, 255));

        let i16_type = defs.as_integer_type(builtins.i16_type).expect("i16");
        assert_eq!((i16_type.size, i16_type.min, i16_type.max), (2, -32768, 32767));
    }

    #[test]
    fn builtin_scope_resolves_names() {
        let mut defs = DefPool::new();
        let mut scopes = ScopePool::new();
        let builtins = Builtins::register(&mut defs, &mut scopes, IndexMap::new());

        let mut results = Vec::new();
        scopes.find_unqualified(builtins.scope, "iexpr", &mut results);
        assert_eq!(results, vec![builtins.iexpr_type]);
    }
}

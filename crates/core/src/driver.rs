use indexmap::IndexMap;

use crate::ast::Statement;
use crate::bank::BankKind;
use crate::compiler::Compiler;
use crate::diag::Report;
use crate::expr::Expression;
use crate::platform::Platform;
use crate::sources::SourceReader;
use crate::span::Spanned;

/// The finished contents of one bank, ready for a format writer. Ram banks
/// carry no bytes; stored banks render at full capacity with the pad byte
/// filling unwritten space.
#[derive(Debug, Clone)]
pub struct BankImage {
    pub name: String,
    pub kind: BankKind,
    pub origin: Option<u64>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Stored and reserved banks, in declaration order.
    pub banks: Vec<BankImage>,
    /// Reduced `config { ... }` entries.
    pub config: IndexMap<String, Expression>,
}

/// Run the whole pipeline over a parsed program. Diagnostics accumulate in
/// `report`; `None` means at least one phase failed.
pub fn compile(
    program: &Spanned<Statement>,
    platform: &mut dyn Platform,
    reader: &dyn SourceReader,
    defines: IndexMap<String, Expression>,
    report: &mut Report,
) -> Option<CompileOutput> {
    let mut compiler = Compiler::new(report, platform, reader, defines);
    if !compiler.compile(program) {
        return None;
    }

    let banks = compiler
        .banks
        .iter()
        .map(|bank| BankImage {
            name: bank.name.clone(),
            kind: bank.kind,
            origin: bank.origin,
            bytes: if bank.kind.stores_bytes() {
                bank.image().to_vec()
            } else {
                Vec::new()
            },
        })
        .collect();

    Some(CompileOutput {
        banks,
        config: compiler.config.clone(),
    })
}

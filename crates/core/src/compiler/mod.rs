mod codegen;
mod reduce;
mod reserve;
mod resolve;
mod select;
mod serialize;
mod stmt;
mod storage;

#[cfg(test)]
mod tests;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::ast::{Attribute, Statement};
use crate::bank::{Bank, BankId};
use crate::builtins::{Builtins, COMPILE_IF, FUNC_ATTRIBUTES};
use crate::def::{Def, DefId, DefKind, DefPool, FuncDef};
use crate::diag::{Diagnostic, Report};
use crate::expr::Expression;
use crate::ir::IrNode;
use crate::platform::{Platform, PlatformRegistrar};
use crate::scope::{ScopeId, ScopePool};
use crate::sources::SourceReader;
use crate::span::{Span, Spanned};

/// Identity key for a statement node, used to find the scope a statement
/// owns when a later phase walks the same tree again. Distinct inline
/// expansions of one body keep separate maps, so the key only needs to be
/// unique within the borrowed AST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementKey(usize);

impl StatementKey {
    pub fn of(statement: &Spanned<Statement>) -> Self {
        Self(statement as *const _ as usize)
    }
}

/// Nested compilation context for `inline func` expansion and `inline for`
/// unrolling: its own statement-scope map and anonymous-label numbering so
/// repeated expansions of one body do not collide.
#[derive(Debug, Default)]
pub struct InlineSite {
    statement_scopes: FxHashMap<StatementKey, ScopeId>,
    anonymous_labels: usize,
    pub return_label: Option<DefId>,
}

/// Labels the innermost loop exposes to `break` and `continue`.
#[derive(Debug, Clone, Copy)]
pub struct LoopLabels {
    pub break_label: DefId,
    pub continue_label: DefId,
}

struct AttributeFrame {
    saved_mode: u32,
    popped: bool,
}

/// Owns every piece of state the five phases share.
pub struct Compiler<'a> {
    pub report: &'a mut Report,
    pub platform: &'a mut dyn Platform,
    pub reader: &'a dyn SourceReader,
    pub defs: DefPool<'a>,
    pub scopes: ScopePool,
    pub banks: Vec<Bank>,
    pub builtins: Builtins,
    pub ir: Vec<IrNode>,
    pub config: IndexMap<String, Expression>,

    current_scope: ScopeId,
    scope_stack: Vec<ScopeId>,
    current_bank: Option<BankId>,
    bank_stack: Vec<Option<BankId>>,
    current_function: Option<DefId>,
    function_stack: Vec<Option<DefId>>,
    inline_sites: Vec<InlineSite>,
    mode_flags: u32,
    mode_flags_stack: Vec<u32>,
    loop_stack: Vec<LoopLabels>,
    /// Active `let` invocations, for the recursion bound and its backtrace.
    let_stack: Vec<(String, Span)>,
    /// The var currently having its initializer reduced; `@expr` attaches
    /// anonymous constants here and is illegal when empty.
    reserved_constant_owner: Vec<DefId>,
    embed_cache: FxHashMap<String, Vec<u8>>,
    /// Function attributes seen on the attribution wrapping the statement
    /// being reserved.
    pending_func_attributes: Vec<(String, Span)>,
    /// Module scope per expanded import path, for `ImportReference` edges.
    module_scopes: FxHashMap<String, ScopeId>,
}

pub const LET_RECURSION_LIMIT: usize = 1024;

impl<'a> Compiler<'a> {
    pub fn new(
        report: &'a mut Report,
        platform: &'a mut dyn Platform,
        reader: &'a dyn SourceReader,
        defines: IndexMap<String, Expression>,
    ) -> Self {
        let mut defs = DefPool::new();
        let mut scopes = ScopePool::new();
        let builtins = Builtins::register(&mut defs, &mut scopes, defines);
        platform.reserve_definitions(&mut PlatformRegistrar {
            defs: &mut defs,
            scopes: &mut scopes,
            builtins: &builtins,
        });
        let root_scope = builtins.scope;

        Self {
            report,
            platform,
            reader,
            defs,
            scopes,
            banks: Vec::new(),
            builtins,
            ir: Vec::new(),
            config: IndexMap::new(),
            current_scope: root_scope,
            scope_stack: Vec::new(),
            current_bank: None,
            bank_stack: Vec::new(),
            current_function: None,
            function_stack: Vec::new(),
            inline_sites: vec![InlineSite::default()],
            mode_flags: 0,
            mode_flags_stack: Vec::new(),
            loop_stack: Vec::new(),
            let_stack: Vec::new(),
            reserved_constant_owner: Vec::new(),
            embed_cache: FxHashMap::default(),
            pending_func_attributes: Vec::new(),
            module_scopes: FxHashMap::default(),
        }
    }

    /// Run every phase in order, stopping at the first phase boundary with
    /// accumulated errors. Returns whether a full image was produced.
    pub fn compile(&mut self, program: &'a Spanned<Statement>) -> bool {
        self.reserve_definitions(program);
        if !self.report.validate() {
            return false;
        }

        self.resolve_definition_types();
        if !self.report.validate() {
            return false;
        }

        self.reserve_storage(program);
        if !self.report.validate() {
            return false;
        }

        self.emit_statement_ir(program);
        if !self.report.validate() {
            return false;
        }

        let ok = self.generate_code();
        debug_assert!(self.scope_stack.is_empty());
        debug_assert!(self.bank_stack.is_empty());
        debug_assert!(self.mode_flags_stack.is_empty());
        debug_assert_eq!(self.inline_sites.len(), 1);
        ok
    }

    // --- scope stack -------------------------------------------------------

    pub fn current_scope(&self) -> ScopeId {
        self.current_scope
    }

    pub fn enter_scope(&mut self, scope: ScopeId) {
        self.scope_stack.push(self.current_scope);
        self.current_scope = scope;
    }

    pub fn exit_scope(&mut self) {
        self.current_scope = self
            .scope_stack
            .pop()
            .expect("scope stack must be balanced");
    }

    // --- bank stack --------------------------------------------------------

    pub fn current_bank(&self) -> Option<BankId> {
        self.current_bank
    }

    pub fn enter_bank(&mut self, bank: Option<BankId>) {
        self.bank_stack.push(self.current_bank);
        self.current_bank = bank;
    }

    pub fn exit_bank(&mut self) {
        self.current_bank = self.bank_stack.pop().expect("bank stack must be balanced");
    }

    pub fn bank(&self, id: BankId) -> &Bank {
        &self.banks[id.0 as usize]
    }

    pub fn bank_mut(&mut self, id: BankId) -> &mut Bank {
        &mut self.banks[id.0 as usize]
    }

    // --- function stack ----------------------------------------------------

    pub fn current_function(&self) -> Option<DefId> {
        self.current_function
    }

    pub fn enter_function(&mut self, func: Option<DefId>) {
        self.function_stack.push(self.current_function);
        self.current_function = func;
    }

    pub fn exit_function(&mut self) {
        self.current_function = self
            .function_stack
            .pop()
            .expect("function stack must be balanced");
    }

    // --- inline sites ------------------------------------------------------

    pub fn enter_inline_site(&mut self) {
        self.inline_sites.push(InlineSite::default());
    }

    pub fn exit_inline_site(&mut self) {
        assert!(
            self.inline_sites.len() > 1,
            "the root inline site must stay"
        );
        self.inline_sites.pop();
    }

    pub fn inline_site(&self) -> &InlineSite {
        self.inline_sites.last().expect("root inline site")
    }

    pub fn inline_site_mut(&mut self) -> &mut InlineSite {
        self.inline_sites.last_mut().expect("root inline site")
    }

    pub fn in_inline_expansion(&self) -> bool {
        self.inline_sites.len() > 1
    }

    /// Scope owned by `statement` in the current inline site, creating it on
    /// first use (reservation phase).
    pub fn create_statement_scope(
        &mut self,
        statement: &Spanned<Statement>,
        debug_name: impl Into<String>,
    ) -> ScopeId {
        let key = StatementKey::of(statement);
        let scope = self.scopes.create(Some(self.current_scope), debug_name);
        self.inline_site_mut().statement_scopes.insert(key, scope);
        scope
    }

    pub fn statement_scope(&mut self, statement: &Spanned<Statement>) -> ScopeId {
        let key = StatementKey::of(statement);
        match self.inline_site().statement_scopes.get(&key) {
            Some(scope) => *scope,
            None => {
                self.report.internal_error(
                    statement.span,
                    "statement scope missing; reservation did not visit this statement",
                );
                self.current_scope
            }
        }
    }

    /// Create a compiler-internal label definition. Anonymous labels live in
    /// the definition pool but are never declared in a scope.
    pub fn mint_label(&mut self, prefix: &str, span: Span) -> DefId {
        let counter = {
            let site = self.inline_site_mut();
            site.anonymous_labels += 1;
            site.anonymous_labels
        };
        self.defs.add(Def {
            name: format!("${prefix}{counter}"),
            decl_span: span,
            scope: self.current_scope,
            kind: DefKind::Func(FuncDef::label(false)),
        })
    }

    // --- loops -------------------------------------------------------------

    pub fn enter_loop(&mut self, labels: LoopLabels) {
        self.loop_stack.push(labels);
    }

    pub fn exit_loop(&mut self) {
        self.loop_stack.pop().expect("loop stack must be balanced");
    }

    pub fn current_loop(&self) -> Option<LoopLabels> {
        self.loop_stack.last().copied()
    }

    // --- let recursion guard ----------------------------------------------

    pub fn push_let(&mut self, name: &str, span: Span) -> bool {
        if self.let_stack.len() >= LET_RECURSION_LIMIT {
            let mut diagnostic = Diagnostic::error(
                span,
                format!(
                    "evaluation of let expression '{name}' exceeded the recursion limit of {LET_RECURSION_LIMIT}"
                ),
            );
            for (frame_name, _) in self.let_stack.iter().rev().take(8) {
                diagnostic = diagnostic.with_continued(format!("  ... while evaluating '{frame_name}'"));
            }
            self.report.error(diagnostic);
            return false;
        }
        self.let_stack.push((name.to_string(), span));
        true
    }

    pub fn pop_let(&mut self) {
        self.let_stack.pop().expect("let stack must be balanced");
    }

    // --- reserved constants (`@expr`) --------------------------------------

    pub fn push_reserved_constant_owner(&mut self, owner: DefId) {
        self.reserved_constant_owner.push(owner);
    }

    pub fn pop_reserved_constant_owner(&mut self) {
        self.reserved_constant_owner
            .pop()
            .expect("reserved constant owner stack must be balanced");
    }

    pub fn reserved_constant_owner(&self) -> Option<DefId> {
        self.reserved_constant_owner.last().copied()
    }

    // --- embed cache -------------------------------------------------------

    pub fn embed_file(&mut self, path: &str, span: Span) -> Option<Vec<u8>> {
        if let Some(bytes) = self.embed_cache.get(path) {
            return Some(bytes.clone());
        }
        match self.reader.read(std::path::Path::new(path)) {
            Ok(bytes) => {
                self.embed_cache.insert(path.to_string(), bytes.clone());
                Some(bytes)
            }
            Err(err) => {
                self.report
                    .error(Diagnostic::error(span, format!("embed failed: {err}")));
                None
            }
        }
    }

    // --- mode flags and attributes ----------------------------------------

    pub fn mode_flags(&self) -> u32 {
        self.mode_flags
    }

    /// Apply an attribute list. Returns `None` when a `compile_if` gate
    /// evaluated false and the body must be skipped; otherwise the caller
    /// must pass the frame back to `pop_attributes`.
    ///
    /// `reservation` selects the one phase that reports attribute mistakes,
    /// so repeated walks do not duplicate diagnostics.
    fn push_attributes(
        &mut self,
        attributes: &[Attribute],
        reservation: bool,
    ) -> Option<AttributeFrame> {
        let saved_mode = self.mode_flags;
        let mut skip = false;

        for attribute in attributes {
            if attribute.name == COMPILE_IF {
                match self.evaluate_compile_if(attribute, reservation) {
                    Some(true) => {}
                    Some(false) => skip = true,
                    None => {}
                }
                continue;
            }

            if let Some(mode) = self
                .platform
                .mode_attributes()
                .iter()
                .find(|mode| mode.name == attribute.name)
                .copied()
            {
                if reservation && !attribute.arguments.is_empty() {
                    self.report.error(Diagnostic::error(
                        attribute.span,
                        format!("mode attribute '{}' takes no arguments", attribute.name),
                    ));
                }
                self.mode_flags = (self.mode_flags & !mode.group_mask) | mode.flag;
                continue;
            }

            if FUNC_ATTRIBUTES.contains(&attribute.name.as_str()) {
                if reservation {
                    if !attribute.arguments.is_empty() {
                        self.report.error(Diagnostic::error(
                            attribute.span,
                            format!("attribute '{}' takes no arguments", attribute.name),
                        ));
                    }
                    self.pending_func_attributes
                        .push((attribute.name.clone(), attribute.span));
                }
                continue;
            }

            if reservation {
                self.report.error(
                    Diagnostic::error(
                        attribute.span,
                        format!("unknown attribute '{}'", attribute.name),
                    )
                    .with_hint("expected a platform mode attribute, 'irq', 'nmi', 'fallthrough', or 'compile_if'"),
                );
            }
        }

        if skip {
            self.mode_flags = saved_mode;
            self.pending_func_attributes.clear();
            return None;
        }

        self.mode_flags_stack.push(saved_mode);
        Some(AttributeFrame {
            saved_mode,
            popped: false,
        })
    }

    fn pop_attributes(&mut self, mut frame: AttributeFrame) {
        assert!(!frame.popped);
        frame.popped = true;
        self.mode_flags = frame.saved_mode;
        self.mode_flags_stack
            .pop()
            .expect("mode flag stack must be balanced");
        self.pending_func_attributes.clear();
    }

    fn evaluate_compile_if(&mut self, attribute: &Attribute, reservation: bool) -> Option<bool> {
        if attribute.arguments.len() != 1 {
            if reservation {
                self.report.error(Diagnostic::error(
                    attribute.span,
                    "compile_if takes exactly one boolean argument",
                ));
            }
            return None;
        }
        let argument = attribute.arguments[0].clone();
        let reduced = self.reduce_expression(&argument)?;
        match reduced.known_boolean() {
            Some(value) => Some(value),
            None => {
                if reservation {
                    self.report.error(Diagnostic::error(
                        attribute.span,
                        "compile_if argument must be a compile-time boolean",
                    ));
                }
                None
            }
        }
    }

    /// Shared walk for `Attribution` statements: apply attributes, run `f`
    /// over the body unless gated away, restore.
    pub fn with_attributes(
        &mut self,
        attributes: &[Attribute],
        reservation: bool,
        f: impl FnOnce(&mut Self),
    ) {
        let Some(frame) = self.push_attributes(attributes, reservation) else {
            return;
        };
        f(self);
        self.pop_attributes(frame);
    }

    pub fn take_pending_func_attributes(&mut self) -> Vec<(String, Span)> {
        std::mem::take(&mut self.pending_func_attributes)
    }

    // --- identifier resolution --------------------------------------------

    /// Resolve a dotted identifier. `pieces[0]` uses unqualified lookup from
    /// the current scope; later pieces traverse namespaces by member lookup.
    /// Stops early at the first non-namespace and returns the index of the
    /// last resolved piece.
    pub fn resolve_identifier(&mut self, pieces: &[String], span: Span) -> Option<(DefId, usize)> {
        let mut results = Vec::new();
        self.scopes
            .find_unqualified(self.current_scope, &pieces[0], &mut results);
        let mut def = self.disambiguate(&results, pieces, 0, span)?;

        let mut last = 0;
        for (index, piece) in pieces.iter().enumerate().skip(1) {
            let DefKind::Namespace(namespace) = &self.defs.get(def).kind else {
                break;
            };
            let scope = namespace.scope;
            let mut results = Vec::new();
            self.scopes.find_member(scope, piece, &mut results);
            def = self.disambiguate(&results, pieces, index, span)?;
            last = index;
        }

        Some((def, last))
    }

    fn disambiguate(
        &mut self,
        results: &[DefId],
        pieces: &[String],
        index: usize,
        span: Span,
    ) -> Option<DefId> {
        match results {
            [] => {
                self.report.error(Diagnostic::error(
                    span,
                    format!("could not resolve '{}'", pieces[..=index].join(".")),
                ));
                None
            }
            [single] => Some(*single),
            many => {
                // More pieces to traverse and exactly one namespace among the
                // candidates: the namespace is the only way forward.
                if index + 1 < pieces.len() {
                    let namespaces: Vec<DefId> = many
                        .iter()
                        .copied()
                        .filter(|candidate| self.defs.as_namespace(*candidate).is_some())
                        .collect();
                    if let [only] = namespaces.as_slice() {
                        return Some(*only);
                    }
                }

                let mut diagnostic = Diagnostic::error(
                    span,
                    format!("'{}' is ambiguous", pieces[..=index].join(".")),
                );
                for candidate in many {
                    let def = self.defs.get(*candidate);
                    diagnostic = diagnostic.with_label(
                        def.decl_span,
                        format!("candidate {} '{}'", def.kind.category(), def.name),
                    );
                }
                self.report.error(diagnostic);
                None
            }
        }
    }
}

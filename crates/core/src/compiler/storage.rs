use crate::ast::Statement;
use crate::bank::BankId;
use crate::def::{Address, DefId, DefKind};
use crate::diag::Diagnostic;
use crate::span::{Span, Spanned};

use super::Compiler;

impl<'a> Compiler<'a> {
    /// Phase 3: give every stored `var`/`const` a home (the surrounding
    /// `in` bank or an explicit `@address`) and reduce initializers, which
    /// lays out the anonymous constants minted by the `@` operator.
    pub(super) fn reserve_storage(&mut self, statement: &'a Spanned<Statement>) {
        match &statement.node {
            Statement::Attribution { attributes, body } => {
                self.with_attributes(attributes, false, |compiler| {
                    compiler.reserve_storage(body);
                });
            }
            Statement::File { items, .. } | Statement::Block(items) => {
                let scope = self.statement_scope(statement);
                self.enter_scope(scope);
                for item in items {
                    self.reserve_storage(item);
                }
                self.exit_scope();
            }
            Statement::Namespace { name, body } => {
                let scope = self
                    .scopes
                    .find_local(self.current_scope(), name)
                    .and_then(|def| self.defs.as_namespace(def))
                    .map(|namespace| namespace.scope);
                if let Some(scope) = scope {
                    self.enter_scope(scope);
                    self.reserve_storage(body);
                    self.exit_scope();
                }
            }
            Statement::Func { name, body, .. } => {
                let Some(func) = self.scopes.find_local(self.current_scope(), name) else {
                    return;
                };
                // Inline bodies get fresh storage per expansion site.
                if self.defs.as_func(func).is_some_and(|f| f.inlined) {
                    return;
                }
                let scope = self.statement_scope(statement);
                self.enter_scope(scope);
                self.enter_function(Some(func));
                self.reserve_storage(body);
                self.exit_function();
                self.exit_scope();
            }
            Statement::In { pieces, body, .. } => {
                let bank = self.resolve_bank_reference(pieces, statement.span);
                self.enter_bank(bank);
                self.reserve_storage(body);
                self.exit_bank();
            }
            Statement::Var { names, .. } => {
                for name in names {
                    let Some(def) = self.scopes.find_local(self.current_scope(), name) else {
                        continue;
                    };
                    if self.defs.as_var(def).is_some() {
                        self.reserve_var_storage(def, statement.span);
                    }
                }
            }
            Statement::If {
                body, alternative, ..
            } => {
                self.reserve_storage(body);
                if let Some(alternative) = alternative {
                    self.reserve_storage(alternative);
                }
            }
            Statement::While { body, .. }
            | Statement::DoWhile { body, .. }
            | Statement::For { body, .. } => {
                self.reserve_storage(body);
            }
            Statement::InlineFor { .. }
            | Statement::Bank { .. }
            | Statement::Config(_)
            | Statement::Enum { .. }
            | Statement::ExpressionStatement(_)
            | Statement::ImportReference { .. }
            | Statement::InternalDeclaration
            | Statement::Branch { .. }
            | Statement::Label { .. }
            | Statement::Let { .. }
            | Statement::Struct { .. }
            | Statement::TypeAlias { .. } => {}
        }
    }

    /// Place one variable: bank membership, explicit address, reduced
    /// initializer, and final storage size.
    pub(super) fn reserve_var_storage(&mut self, def: DefId, span: Span) {
        let (qualifiers, address_expression, initializer, declared_type) = {
            let Some(var) = self.defs.as_var(def) else {
                return;
            };
            if var.storage_size.is_some() || var.address.is_some() {
                // Already placed (nested constants, repeat visits).
                return;
            }
            (
                var.qualifiers,
                var.address_expression.clone(),
                var.initializer.clone(),
                var.resolved_type.clone(),
            )
        };

        if qualifiers.is_extern {
            return;
        }

        // Reduce the initializer first: it can carry `@` reservations, and
        // untyped declarations take their type from it.
        let mut resolved_type = declared_type;
        let mut reduced_initializer = None;
        if let Some(initializer) = &initializer {
            self.push_reserved_constant_owner(def);
            let reduced = self.reduce_expression(initializer);
            self.pop_reserved_constant_owner();
            let Some(reduced) = reduced else {
                return;
            };

            let narrowed = match &resolved_type {
                Some(target) => {
                    let Some(narrowed) = self.narrow_expression(&reduced, target, span) else {
                        return;
                    };
                    narrowed
                }
                None => reduced,
            };
            // Unsized declarations (or none at all) adopt the initializer's
            // concrete type.
            let narrowed_type = narrowed.ty().cloned();
            match (&resolved_type, narrowed_type) {
                (_, Some(ty)) if self.storage_size(&ty).is_some() => {
                    resolved_type = Some(ty);
                }
                (Some(_), _) => {}
                (None, _) => {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "cannot infer a storable type for '{}'",
                            self.defs.name(def)
                        ),
                    ));
                    return;
                }
            }
            reduced_initializer = Some(narrowed);
        }

        let Some(resolved_type) = resolved_type else {
            self.report.error(Diagnostic::error(
                span,
                format!(
                    "variable '{}' needs a type or an initializer",
                    self.defs.name(def)
                ),
            ));
            return;
        };
        let Some(size) = self.storage_size(&resolved_type) else {
            self.report.error(Diagnostic::error(
                span,
                format!(
                    "variable '{}' has no known storage size (type '{}')",
                    self.defs.name(def),
                    resolved_type.describe()
                ),
            ));
            return;
        };

        let address = match address_expression {
            Some(expression) => {
                let Some(reduced) = self.reduce_expression(&expression) else {
                    return;
                };
                match reduced.known_integer() {
                    Some(value) if value >= 0 => Address {
                        absolute: Some(value as u64),
                        relative: None,
                        bank: self.current_bank(),
                    },
                    _ => {
                        self.report.error(Diagnostic::error(
                            expression.span,
                            "an explicit address must be a non-negative compile-time integer",
                        ));
                        return;
                    }
                }
            }
            None => {
                let Some(bank) = self.current_bank() else {
                    self.report.error(
                        Diagnostic::error(
                            span,
                            format!(
                                "variable '{}' must be declared inside an 'in BANK' block or given an explicit address",
                                self.defs.name(def)
                            ),
                        )
                        .with_hint("wrap the declaration in 'in some_bank { ... }'"),
                    );
                    return;
                };
                if qualifiers.is_const && !self.bank(bank).kind.stores_bytes() {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "constant '{}' needs a stored (rom) bank, but '{}' is {}",
                            self.defs.name(def),
                            self.bank(bank).name,
                            self.bank(bank).kind.describe()
                        ),
                    ));
                    return;
                }
                Address {
                    absolute: None,
                    relative: None,
                    bank: Some(bank),
                }
            }
        };

        let bank = address.bank;
        if let Some(var) = self.defs.as_var_mut(def) {
            var.resolved_type = Some(resolved_type);
            var.storage_size = Some(size);
            var.address = Some(address);
            if reduced_initializer.is_some() {
                var.initializer = reduced_initializer;
            }
        }

        // `@` reservations ride along in the same bank as their owner.
        let nested = self
            .defs
            .as_var(def)
            .map(|var| var.nested_constants.clone())
            .unwrap_or_default();
        for constant in nested {
            if let Some(var) = self.defs.as_var_mut(constant) {
                if var.address.is_none() {
                    var.address = Some(Address {
                        absolute: None,
                        relative: None,
                        bank,
                    });
                }
            }
        }
    }

    /// Resolve the bank named by an `in` statement.
    pub(super) fn resolve_bank_reference(
        &mut self,
        pieces: &[String],
        span: Span,
    ) -> Option<BankId> {
        let (def, last) = self.resolve_identifier(pieces, span)?;
        if last + 1 != pieces.len() {
            self.report.error(Diagnostic::error(
                span,
                format!("'{}' does not name a bank", pieces.join(".")),
            ));
            return None;
        }
        match &self.defs.get(def).kind {
            DefKind::Bank(bank) => match bank.bank {
                Some(bank) => Some(bank),
                None => {
                    self.report.error(Diagnostic::error(
                        span,
                        format!("bank '{}' was not resolved", self.defs.name(def)),
                    ));
                    None
                }
            },
            kind => {
                self.report.error(Diagnostic::error(
                    span,
                    format!(
                        "expected a bank, but '{}' is a {}",
                        self.defs.name(def),
                        kind.category()
                    ),
                ));
                None
            }
        }
    }
}

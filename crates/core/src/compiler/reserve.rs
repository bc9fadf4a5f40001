use crate::ast::{
    BranchKind, EnumMemberDecl, ParameterDecl, Qualifiers, Statement, StructMemberDecl,
};
use crate::def::{
    BankDef, Def, DefId, DefKind, EnumDef, EnumMemberDef, FuncDef, LetDef, NamespaceDef,
    StructDef, StructMemberDef, TypeAliasDef, VarDef,
};
use crate::diag::Diagnostic;
use crate::scope::Declared;
use crate::span::{Span, Spanned};
use crate::types::TypeExpression;

use super::Compiler;

impl<'a> Compiler<'a> {
    /// Phase 1: walk the tree, create a definition for every declared entity
    /// and a scope for every scope-introducing statement.
    pub(super) fn reserve_definitions(&mut self, statement: &'a Spanned<Statement>) {
        match &statement.node {
            Statement::Attribution { attributes, body } => {
                self.with_attributes(attributes, true, |compiler| {
                    compiler.reserve_definitions(body);
                    let leftover = compiler.take_pending_func_attributes();
                    for (name, span) in leftover {
                        compiler.report.error(Diagnostic::error(
                            span,
                            format!("attribute '{name}' can only be applied to a func"),
                        ));
                    }
                });
            }
            Statement::File { path, items } => {
                let scope =
                    self.create_statement_scope_with_parent(statement, self.builtins.scope, path);
                self.module_scopes.insert(path.clone(), scope);
                if self.current_scope() != self.builtins.scope {
                    let importer = self.current_scope();
                    self.scopes.add_import(importer, scope);
                }
                self.enter_scope(scope);
                for item in items {
                    self.reserve_definitions(item);
                }
                self.exit_scope();
            }
            Statement::ImportReference { expanded_path } => {
                match self.module_scopes.get(expanded_path) {
                    Some(module) => {
                        let module = *module;
                        let importer = self.current_scope();
                        self.scopes.add_import(importer, module);
                    }
                    None => {
                        self.report.error(Diagnostic::error(
                            statement.span,
                            format!("import '{expanded_path}' was not expanded before compilation"),
                        ));
                    }
                }
            }
            Statement::Block(items) => {
                let scope = self.create_statement_scope(statement, "<block>");
                self.enter_scope(scope);
                for item in items {
                    self.reserve_definitions(item);
                }
                self.exit_scope();
            }
            Statement::Namespace { name, body } => {
                let scope = self.reserve_namespace(name, statement.span);
                self.enter_scope(scope);
                self.reserve_definitions(body);
                self.exit_scope();
            }
            Statement::Func {
                name,
                far,
                inlined,
                parameters,
                return_type,
                body,
            } => {
                self.reserve_func(
                    statement,
                    name,
                    *far,
                    *inlined,
                    parameters,
                    return_type.as_ref(),
                    body,
                );
            }
            Statement::Var {
                qualifiers,
                names,
                addresses,
                type_expression,
                value,
            } => {
                self.reserve_vars(
                    statement.span,
                    *qualifiers,
                    names,
                    addresses,
                    type_expression.as_ref(),
                    value.as_ref(),
                );
            }
            Statement::Let {
                name,
                parameters,
                value,
            } => {
                self.declare(
                    name,
                    statement.span,
                    DefKind::Let(LetDef {
                        parameters: parameters.clone(),
                        body: value.clone(),
                    }),
                );
            }
            Statement::Bank {
                names,
                addresses,
                type_expression,
            } => {
                for (index, name) in names.iter().enumerate() {
                    let address_expression = addresses.get(index).cloned().flatten();
                    self.declare(
                        name,
                        statement.span,
                        DefKind::Bank(BankDef {
                            address_expression,
                            type_expression: type_expression.clone(),
                            resolved_type: None,
                            bank: None,
                        }),
                    );
                }
            }
            Statement::Enum {
                name,
                underlying_type,
                members,
            } => {
                self.reserve_enum(statement.span, name, underlying_type.as_ref(), members);
            }
            Statement::Struct {
                kind,
                name,
                members,
            } => {
                self.reserve_struct(statement.span, *kind, name, members);
            }
            Statement::TypeAlias {
                name,
                type_expression,
            } => {
                self.declare(
                    name,
                    statement.span,
                    DefKind::TypeAlias(TypeAliasDef {
                        type_expression: type_expression.clone(),
                        resolved_type: None,
                    }),
                );
            }
            Statement::Label { name, far } => {
                self.declare(name, statement.span, DefKind::Func(FuncDef::label(*far)));
            }
            Statement::In { body, .. } => {
                self.reserve_definitions(body);
            }
            Statement::If {
                body, alternative, ..
            } => {
                self.reserve_definitions(body);
                if let Some(alternative) = alternative {
                    self.reserve_definitions(alternative);
                }
            }
            Statement::While { body, .. } | Statement::DoWhile { body, .. } => {
                self.reserve_definitions(body);
            }
            Statement::For { body, .. } => {
                self.reserve_definitions(body);
            }
            // Unrolled per iteration with its own inline site; nothing to
            // reserve at the declaration site.
            Statement::InlineFor { .. } => {}
            Statement::Branch { .. }
            | Statement::ExpressionStatement(_)
            | Statement::Config(_)
            | Statement::InternalDeclaration => {}
        }
    }

    fn reserve_namespace(&mut self, name: &str, span: Span) -> crate::scope::ScopeId {
        // Reopening an existing namespace of the same name extends it.
        if let Some(existing) = self.scopes.find_local(self.current_scope(), name) {
            if let Some(namespace) = self.defs.as_namespace(existing) {
                return namespace.scope;
            }
        }

        let scope = self
            .scopes
            .create(Some(self.current_scope()), format!("namespace {name}"));
        self.declare(name, span, DefKind::Namespace(NamespaceDef { scope }));
        scope
    }

    #[allow(clippy::too_many_arguments)]
    fn reserve_func(
        &mut self,
        statement: &'a Spanned<Statement>,
        name: &str,
        far: bool,
        inlined: bool,
        parameters: &[ParameterDecl],
        return_type: Option<&TypeExpression>,
        body: &'a Spanned<Statement>,
    ) {
        let attributes = self.take_pending_func_attributes();
        let mut fallthrough = false;
        let mut return_kind = if far {
            BranchKind::FarReturn
        } else {
            BranchKind::Return
        };
        for (attribute, _span) in &attributes {
            match attribute.as_str() {
                "irq" => return_kind = BranchKind::IrqReturn,
                "nmi" => return_kind = BranchKind::NmiReturn,
                "fallthrough" => fallthrough = true,
                _ => unreachable!("unchecked func attribute"),
            }
        }
        if inlined {
            // Expanded bodies end at a synthetic label instead of a return
            // instruction.
            return_kind = BranchKind::None;
        }

        let enclosing = self.current_scope();
        let func_scope = self.create_statement_scope(statement, format!("func {name}"));

        let func = self.declare(
            name,
            statement.span,
            DefKind::Func(FuncDef {
                fallthrough,
                inlined,
                far,
                return_kind,
                return_type_expression: return_type.cloned(),
                resolved_return_type: None,
                enclosing_scope: Some(enclosing),
                body: Some(body),
                parameters: Vec::new(),
                address: None,
                has_unconditional_return: false,
            }),
        );

        self.enter_scope(func_scope);
        let mut parameter_defs = Vec::new();
        for parameter in parameters {
            let def = self.declare(
                &parameter.name,
                parameter.span,
                DefKind::Var(VarDef {
                    qualifiers: Qualifiers::default(),
                    enclosing_function: func,
                    type_expression: Some(parameter.type_expression.clone()),
                    ..VarDef::default()
                }),
            );
            if let Some(def) = def {
                parameter_defs.push(def);
            }
        }

        self.enter_function(func);
        self.reserve_definitions(body);
        self.exit_function();
        self.exit_scope();

        if let Some(func) = func {
            if let Some(func_def) = self.defs.as_func_mut(func) {
                func_def.parameters = parameter_defs;
            }
        }
    }

    fn reserve_vars(
        &mut self,
        span: Span,
        qualifiers: Qualifiers,
        names: &[String],
        addresses: &[Option<crate::expr::Expression>],
        type_expression: Option<&TypeExpression>,
        value: Option<&crate::expr::Expression>,
    ) {
        if value.is_some() && names.len() != 1 {
            self.report.error(Diagnostic::error(
                span,
                "an initializer requires exactly one declared name",
            ));
        }

        for (index, name) in names.iter().enumerate() {
            let initializer = if index == 0 { value.cloned() } else { None };
            self.declare(
                name,
                span,
                DefKind::Var(VarDef {
                    qualifiers,
                    enclosing_function: self.current_function(),
                    type_expression: type_expression.cloned(),
                    address_expression: addresses.get(index).cloned().flatten(),
                    initializer,
                    ..VarDef::default()
                }),
            );
        }
    }

    fn reserve_enum(
        &mut self,
        span: Span,
        name: &str,
        underlying_type: Option<&TypeExpression>,
        members: &[EnumMemberDecl],
    ) {
        let scope = self
            .scopes
            .create(Some(self.current_scope()), format!("enum {name}"));
        let Some(owner) = self.declare(
            name,
            span,
            DefKind::Enum(EnumDef {
                underlying_type_expression: underlying_type.cloned(),
                resolved_underlying_type: None,
                members: Vec::new(),
                scope,
            }),
        ) else {
            return;
        };

        let mut member_defs = Vec::new();
        let mut base: Option<crate::expr::Expression> = None;
        let mut offset = 0u64;
        for member in members {
            if let Some(value) = &member.value {
                base = Some(value.clone());
                offset = 0;
            }

            let def = self.defs.add(Def {
                name: member.name.clone(),
                decl_span: member.span,
                scope,
                kind: DefKind::EnumMember(EnumMemberDef {
                    owner,
                    base_expression: base.clone(),
                    offset,
                    reduced_expression: None,
                }),
            });
            match self.scopes.declare(scope, &member.name, def) {
                Declared::Fresh(def) => member_defs.push(def),
                Declared::Duplicate(existing) => {
                    self.duplicate_error(&member.name, member.span, existing);
                }
            }
            offset += 1;
        }

        if let DefKind::Enum(enum_def) = &mut self.defs.get_mut(owner).kind {
            enum_def.members = member_defs;
        }
    }

    fn reserve_struct(
        &mut self,
        span: Span,
        kind: crate::ast::StructKind,
        name: &str,
        members: &[StructMemberDecl],
    ) {
        let scope = self
            .scopes
            .create(Some(self.current_scope()), format!("struct {name}"));
        let Some(owner) = self.declare(
            name,
            span,
            DefKind::Struct(StructDef {
                kind,
                members: Vec::new(),
                size: None,
                scope,
            }),
        ) else {
            return;
        };

        let mut member_defs = Vec::new();
        for member in members {
            let def = self.defs.add(Def {
                name: member.name.clone(),
                decl_span: member.span,
                scope,
                kind: DefKind::StructMember(StructMemberDef {
                    owner,
                    type_expression: member.type_expression.clone(),
                    resolved_type: None,
                    offset: None,
                }),
            });
            match self.scopes.declare(scope, &member.name, def) {
                Declared::Fresh(def) => member_defs.push(def),
                Declared::Duplicate(existing) => {
                    self.duplicate_error(&member.name, member.span, existing);
                }
            }
        }

        if let DefKind::Struct(struct_def) = &mut self.defs.get_mut(owner).kind {
            struct_def.members = member_defs;
        }
    }

    /// Create a definition and bind its name in the current scope.
    pub(super) fn declare(
        &mut self,
        name: &str,
        span: Span,
        kind: DefKind<'a>,
    ) -> Option<DefId> {
        let scope = self.current_scope();
        let def = self.defs.add(Def {
            name: name.to_string(),
            decl_span: span,
            scope,
            kind,
        });
        match self.scopes.declare(scope, name, def) {
            Declared::Fresh(def) => Some(def),
            Declared::Duplicate(existing) => {
                self.duplicate_error(name, span, existing);
                None
            }
        }
    }

    fn duplicate_error(&mut self, name: &str, span: Span, existing: DefId) {
        let existing = self.defs.get(existing);
        self.report.error(
            Diagnostic::error(span, format!("duplicate symbol '{name}'"))
                .with_label(existing.decl_span, "previously declared here")
                .with_hint("rename one of the declarations to keep symbols unique"),
        );
    }

    fn create_statement_scope_with_parent(
        &mut self,
        statement: &Spanned<Statement>,
        parent: crate::scope::ScopeId,
        debug_name: &str,
    ) -> crate::scope::ScopeId {
        let key = super::StatementKey::of(statement);
        let scope = self.scopes.create(Some(parent), debug_name);
        self.inline_site_mut().statement_scopes.insert(key, scope);
        scope
    }
}

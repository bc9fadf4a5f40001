use crate::ast::{BranchKind, DistanceHint, Statement};
use crate::def::{Def, DefId, DefKind, LetDef};
use crate::diag::Diagnostic;
use crate::expr::{
    BinaryOp, EvaluationContext, Expression, ExpressionInfo, ExpressionKind, UnaryOp,
};
use crate::ir::{IrNode, OperandRoot};
use crate::platform::{InstructionType, Operand};
use crate::span::{Span, Spanned};
use crate::types::TypeExpression;

use super::{Compiler, LoopLabels};

impl<'a> Compiler<'a> {
    /// Phase 4: lower statements to linear IR (labels, relocations, selected
    /// instructions, and var placeholders).
    pub(super) fn emit_statement_ir(&mut self, statement: &'a Spanned<Statement>) {
        let span = statement.span;
        match &statement.node {
            Statement::Attribution { attributes, body } => {
                self.with_attributes(attributes, false, |compiler| {
                    compiler.emit_statement_ir(body);
                });
            }
            Statement::File { items, .. } | Statement::Block(items) => {
                let scope = self.statement_scope(statement);
                self.enter_scope(scope);
                for item in items {
                    self.emit_statement_ir(item);
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
                    self.emit_statement_ir(body);
                    self.exit_scope();
                }
            }
            Statement::Config(entries) => {
                for entry in entries {
                    if let Some(reduced) = self.reduce_expression(&entry.value) {
                        if reduced.context() != Some(EvaluationContext::CompileTime) {
                            self.report.error(Diagnostic::error(
                                entry.span,
                                format!("config '{}' must be a compile-time value", entry.name),
                            ));
                            continue;
                        }
                        self.config.insert(entry.name.clone(), reduced);
                    }
                }
            }
            Statement::In {
                pieces,
                dest,
                body,
            } => {
                let Some(bank) = self.resolve_bank_reference(pieces, span) else {
                    return;
                };
                let address = dest.as_ref().and_then(|dest| {
                    let reduced = self.reduce_expression(dest)?;
                    match reduced.known_integer() {
                        Some(value) if value >= 0 => Some(value as u64),
                        _ => {
                            self.report.error(Diagnostic::error(
                                dest.span,
                                "a relocation address must be a non-negative compile-time integer",
                            ));
                            None
                        }
                    }
                });
                self.ir.push(IrNode::PushRelocation {
                    bank,
                    address,
                    span,
                });
                self.enter_bank(Some(bank));
                self.emit_statement_ir(body);
                self.exit_bank();
                self.ir.push(IrNode::PopRelocation);
            }
            Statement::Var { names, .. } => {
                for name in names {
                    let Some(def) = self.scopes.find_local(self.current_scope(), name) else {
                        continue;
                    };
                    let Some(var) = self.defs.as_var(def) else {
                        continue;
                    };
                    if var.qualifiers.is_extern || var.address.is_none() {
                        continue;
                    }
                    let nested = var.nested_constants.clone();
                    self.ir.push(IrNode::Var(def));
                    for constant in nested {
                        self.ir.push(IrNode::Var(constant));
                    }
                }
            }
            Statement::Func {
                name,
                inlined,
                body,
                ..
            } => {
                if *inlined {
                    return;
                }
                let Some(func) = self.scopes.find_local(self.current_scope(), name) else {
                    return;
                };
                let (fallthrough, return_kind) = match self.defs.as_func(func) {
                    Some(f) => (f.fallthrough, f.return_kind),
                    None => return,
                };

                let ends_terminated = Self::ends_with_unconditional_branch(body);
                if let Some(f) = self.defs.as_func_mut(func) {
                    f.has_unconditional_return = ends_terminated;
                }

                self.ir.push(IrNode::Label(func));
                let scope = self.statement_scope(statement);
                self.enter_scope(scope);
                self.enter_function(Some(func));
                self.emit_statement_ir(body);
                self.exit_function();
                self.exit_scope();

                if !fallthrough && !ends_terminated {
                    self.emit_branch(
                        DistanceHint::None,
                        return_kind,
                        None,
                        None,
                        false,
                        None,
                        span,
                    );
                }
            }
            Statement::Label { name, .. } => {
                let mut results = Vec::new();
                self.scopes
                    .find_unqualified(self.current_scope(), name, &mut results);
                match results.as_slice() {
                    [def] if self.defs.as_func(*def).is_some() => {
                        self.ir.push(IrNode::Label(*def));
                    }
                    _ => {
                        self.report.error(Diagnostic::error(
                            span,
                            format!("label '{name}' was not reserved"),
                        ));
                    }
                }
            }
            Statement::ExpressionStatement(expr) => {
                self.emit_expression_statement(expr, span);
            }
            Statement::Branch {
                kind,
                distance_hint,
                destination,
                return_value,
                condition,
            } => {
                self.emit_branch_statement(
                    *kind,
                    *distance_hint,
                    destination.as_ref(),
                    return_value.as_ref(),
                    condition.as_ref(),
                    span,
                );
            }
            Statement::If {
                condition,
                body,
                alternative,
                distance_hint,
            } => {
                self.emit_if(condition, body, alternative.as_deref(), *distance_hint, span);
            }
            Statement::While {
                condition,
                body,
                distance_hint,
            } => {
                self.emit_while(condition, body, *distance_hint, span);
            }
            Statement::DoWhile {
                body,
                condition,
                distance_hint,
            } => {
                self.emit_do_while(body, condition, *distance_hint, span);
            }
            Statement::For {
                counter,
                sequence,
                body,
                distance_hint,
            } => {
                self.emit_for(counter, sequence, body, *distance_hint, span);
            }
            Statement::InlineFor {
                name,
                sequence,
                body,
            } => {
                self.emit_inline_for(name, sequence, body, span);
            }
            Statement::Bank { .. }
            | Statement::Enum { .. }
            | Statement::Struct { .. }
            | Statement::TypeAlias { .. }
            | Statement::Let { .. }
            | Statement::ImportReference { .. }
            | Statement::InternalDeclaration => {}
        }
    }

    /// Whether control cannot fall out of the bottom of this statement.
    fn ends_with_unconditional_branch(statement: &Spanned<Statement>) -> bool {
        match &statement.node {
            Statement::Block(items) => items
                .last()
                .is_some_and(Self::ends_with_unconditional_branch),
            Statement::Branch {
                kind, condition, ..
            } => {
                condition.is_none()
                    && matches!(
                        kind,
                        BranchKind::Return
                            | BranchKind::FarReturn
                            | BranchKind::IrqReturn
                            | BranchKind::NmiReturn
                            | BranchKind::Goto
                            | BranchKind::FarGoto
                    )
            }
            Statement::Attribution { body, .. } => Self::ends_with_unconditional_branch(body),
            _ => false,
        }
    }

    // --- expression statements ---------------------------------------------

    fn emit_expression_statement(&mut self, expr: &Expression, span: Span) {
        let Some(reduced) = self.reduce_expression(expr) else {
            return;
        };
        match &reduced.kind {
            ExpressionKind::Call { .. } => {
                self.emit_call(&reduced, span);
            }
            ExpressionKind::Binary {
                op: BinaryOp::Assignment,
                left,
                right,
            } => {
                self.emit_assignment(left, right, span);
            }
            ExpressionKind::Unary { op, operand } if op.is_increment() => {
                let Some(operand_tree) = self.operand_from_expression(operand, true, span) else {
                    return;
                };
                let roots = vec![OperandRoot::new(Some((**operand).clone()), operand_tree)];
                self.emit_code(InstructionType::Unary(*op), roots, span);
            }
            _ if reduced.context() == Some(EvaluationContext::CompileTime) => {
                self.report.warning(Diagnostic::warning(
                    span,
                    "compile-time expression has no effect as a statement",
                ));
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    format!("expression '{}' is not a statement", reduced.describe()),
                ));
            }
        }
    }

    /// `left = right` where both sides are already reduced. Recognizes
    /// read-modify-write forms (`a = a + x` selects the binary operation
    /// directly) and calls on the right-hand side.
    fn emit_assignment(&mut self, left: &Expression, right: &Expression, span: Span) {
        if let ExpressionKind::Call { .. } = &right.kind {
            let Some(result) = self.emit_call(right, span) else {
                return;
            };
            let Some(result) = result else {
                self.report.error(Diagnostic::error(
                    span,
                    "the called function does not return a value",
                ));
                return;
            };
            self.emit_assignment(left, &result, span);
            return;
        }

        if let ExpressionKind::Binary { op, left: a, right: b } = &right.kind {
            if op.is_arithmetic() && Self::expressions_match(left, a) {
                let Some(left_tree) = self.operand_from_expression(left, true, span) else {
                    return;
                };
                let Some(b_tree) = self.operand_from_expression(b, true, span) else {
                    return;
                };
                let roots = vec![
                    OperandRoot::new(Some(left.clone()), left_tree),
                    OperandRoot::new(Some((**b).clone()), b_tree),
                ];
                self.emit_code(InstructionType::Binary(*op), roots, span);
                return;
            }
        }

        let Some(left_tree) = self.operand_from_expression(left, true, span) else {
            return;
        };
        let Some(right_tree) = self.operand_from_expression(right, true, span) else {
            return;
        };
        let roots = vec![
            OperandRoot::new(Some(left.clone()), left_tree),
            OperandRoot::new(Some(right.clone()), right_tree),
        ];
        self.emit_code(InstructionType::Binary(BinaryOp::Assignment), roots, span);
    }

    /// Structural equality of reduced expressions, for recognizing
    /// read-modify-write assignments.
    fn expressions_match(a: &Expression, b: &Expression) -> bool {
        match (&a.kind, &b.kind) {
            (
                ExpressionKind::ResolvedIdentifier { def: a, .. },
                ExpressionKind::ResolvedIdentifier { def: b, .. },
            ) => a == b,
            (ExpressionKind::IntegerLiteral(a), ExpressionKind::IntegerLiteral(b)) => a == b,
            (
                ExpressionKind::Unary {
                    op: oa,
                    operand: ia,
                },
                ExpressionKind::Unary {
                    op: ob,
                    operand: ib,
                },
            ) => oa == ob && Self::expressions_match(ia, ib),
            (
                ExpressionKind::Binary {
                    op: oa,
                    left: la,
                    right: ra,
                },
                ExpressionKind::Binary {
                    op: ob,
                    left: lb,
                    right: rb,
                },
            ) => oa == ob && Self::expressions_match(la, lb) && Self::expressions_match(ra, rb),
            _ => false,
        }
    }

    /// Emit a reduced call. Returns `None` on failure; `Some(holder)` carries
    /// the designated-storage expression holding the return value, if any.
    fn emit_call(&mut self, call: &Expression, span: Span) -> Option<Option<Expression>> {
        let ExpressionKind::Call {
            inlined,
            function,
            arguments,
        } = &call.kind
        else {
            return None;
        };

        let Some(def) = function.resolved_def() else {
            self.report.error(Diagnostic::error(
                span,
                "indirect calls through values are not supported",
            ));
            return None;
        };

        match &self.defs.get(def).kind {
            DefKind::Func(func) => {
                let far = func.far;
                let is_inline = func.inlined || *inlined;
                let parameters = func.parameters.clone();
                let return_type = func.resolved_return_type.clone();

                if is_inline {
                    self.expand_inline_call(def, arguments, span)?;
                } else {
                    // Arguments land in each parameter's designated storage.
                    for (parameter, argument) in parameters.iter().zip(arguments) {
                        let holder = self.parameter_holder(*parameter, span)?;
                        self.emit_assignment(&holder, argument, span);
                    }

                    let dest = self.reduce_resolved_identifier(def, span)?;
                    let dest_tree = self.operand_from_expression(&dest, true, span)?;
                    let kind = if far {
                        BranchKind::FarCall
                    } else {
                        BranchKind::Call
                    };
                    let roots = vec![OperandRoot::new(Some(dest), dest_tree)];
                    if !self.emit_code(InstructionType::Branch(kind), roots, span) {
                        return None;
                    }
                }

                let holder = match return_type {
                    Some(TypeExpression::DesignatedStorage { holder, .. }) => Some(*holder),
                    _ => None,
                };
                Some(holder)
            }
            DefKind::BuiltinVoidIntrinsic | DefKind::BuiltinLoadIntrinsic(_) => {
                let name = self.defs.name(def).to_string();
                let mut roots = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    let tree = self.operand_from_expression(argument, true, span)?;
                    roots.push(OperandRoot::new(Some(argument.clone()), tree));
                }
                if !self.emit_code(InstructionType::Intrinsic(name), roots, span) {
                    return None;
                }
                Some(None)
            }
            kind => {
                self.report.error(Diagnostic::error(
                    span,
                    format!("{} cannot be called", kind.category()),
                ));
                None
            }
        }
    }

    /// The reduced holder expression of a designated-storage parameter.
    fn parameter_holder(&mut self, parameter: DefId, span: Span) -> Option<Expression> {
        let ty = self
            .defs
            .as_var(parameter)
            .and_then(|var| var.resolved_type.clone());
        match ty {
            Some(TypeExpression::DesignatedStorage { holder, .. }) => Some(*holder),
            _ => {
                let name = self.defs.name(parameter).to_string();
                self.report.error(Diagnostic::error(
                    span,
                    format!(
                        "parameter '{name}' needs a designated-storage type (e.g. 'u8 in a') to be passed at run time"
                    ),
                ));
                None
            }
        }
    }

    /// Expand an `inline func` call: a fresh inline site, compile-time lets
    /// for compile-time arguments, re-run reservation/typing/storage over the
    /// body, emit it, and close with the synthetic return label.
    fn expand_inline_call(
        &mut self,
        def: DefId,
        arguments: &[Expression],
        span: Span,
    ) -> Option<()> {
        let (body, enclosing_scope, parameters, name) = {
            let func = self.defs.as_func(def)?;
            (
                func.body,
                func.enclosing_scope,
                func.parameters.clone(),
                self.defs.name(def).to_string(),
            )
        };
        let Some(body) = body else {
            self.report.error(Diagnostic::error(
                span,
                format!("inline func '{name}' has no body to expand"),
            ));
            return None;
        };

        let parent = enclosing_scope.unwrap_or_else(|| self.current_scope());
        let expansion_scope = self
            .scopes
            .create(Some(parent), format!("inline {name}"));

        // Bind arguments: compile-time values become lets, run-time values
        // flow through designated storage. Either way the parameter name is
        // rebound inside the expansion scope so the copied body resolves it.
        for (parameter, argument) in parameters.iter().zip(arguments) {
            let parameter_name = self.defs.name(*parameter).to_string();
            if argument.context() == Some(EvaluationContext::CompileTime) {
                let bound = self.defs.add(Def {
                    name: parameter_name.clone(),
                    decl_span: span,
                    scope: expansion_scope,
                    kind: DefKind::Let(LetDef {
                        parameters: Vec::new(),
                        body: argument.clone(),
                    }),
                });
                self.scopes.declare(expansion_scope, &parameter_name, bound);
            } else {
                let holder = self.parameter_holder(*parameter, span)?;
                self.emit_assignment(&holder, argument, span);
                let parameter_type = self
                    .defs
                    .as_var(*parameter)
                    .and_then(|var| var.resolved_type.clone());
                let bound = self.defs.add(Def {
                    name: parameter_name.clone(),
                    decl_span: span,
                    scope: expansion_scope,
                    kind: DefKind::Var(crate::def::VarDef {
                        resolved_type: parameter_type,
                        ..crate::def::VarDef::default()
                    }),
                });
                self.scopes.declare(expansion_scope, &parameter_name, bound);
            }
        }

        self.enter_inline_site();
        self.enter_scope(expansion_scope);
        self.enter_function(Some(def));

        let return_label = self.mint_label("inline_ret", span);
        self.inline_site_mut().return_label = Some(return_label);

        // The expanded body runs its own reservation, typing, and storage
        // sub-phases inside this site.
        self.reserve_definitions(body);
        self.resolve_definition_types();
        self.reserve_storage(body);
        self.emit_statement_ir(body);

        self.ir.push(IrNode::Label(return_label));

        self.exit_function();
        self.exit_scope();
        self.exit_inline_site();
        Some(())
    }

    // --- branches ----------------------------------------------------------

    fn emit_branch_statement(
        &mut self,
        kind: BranchKind,
        distance_hint: DistanceHint,
        destination: Option<&Expression>,
        return_value: Option<&Expression>,
        condition: Option<&Expression>,
        span: Span,
    ) {
        let condition = match condition {
            Some(condition) => match self.reduce_expression(condition) {
                Some(reduced) => Some(reduced),
                None => return,
            },
            None => None,
        };

        match kind {
            BranchKind::Break | BranchKind::Continue => {
                let Some(labels) = self.current_loop() else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!("'{}' used outside of a loop", kind.describe()),
                    ));
                    return;
                };
                let label = match kind {
                    BranchKind::Break => labels.break_label,
                    _ => labels.continue_label,
                };
                let Some(dest) = self.reduce_resolved_identifier(label, span) else {
                    return;
                };
                self.emit_branch(
                    distance_hint,
                    BranchKind::Goto,
                    Some(&dest),
                    None,
                    false,
                    condition.as_ref(),
                    span,
                );
            }
            _ => {
                let destination = match destination {
                    Some(destination) => match self.reduce_expression(destination) {
                        Some(reduced) => Some(reduced),
                        None => return,
                    },
                    None => None,
                };
                self.emit_branch(
                    distance_hint,
                    kind,
                    destination.as_ref(),
                    return_value,
                    false,
                    condition.as_ref(),
                    span,
                );
            }
        }
    }

    /// Lower a branch of `kind` to `destination`, optionally conditional.
    /// The condition is a reduced expression; `negated` tracks stripped `!`
    /// operators.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn emit_branch(
        &mut self,
        distance_hint: DistanceHint,
        kind: BranchKind,
        destination: Option<&Expression>,
        return_value: Option<&Expression>,
        negated: bool,
        condition: Option<&Expression>,
        span: Span,
    ) {
        // Returns inside an inline expansion jump to the synthetic end label
        // instead of leaving the enclosing function.
        if matches!(
            kind,
            BranchKind::Return | BranchKind::FarReturn | BranchKind::IrqReturn | BranchKind::NmiReturn
        ) {
            if let Some(label) = self.inline_site().return_label {
                let value = return_value.and_then(|value| self.reduce_expression(value));
                if return_value.is_some() && value.is_none() {
                    return;
                }
                if let Some(value) = &value {
                    self.emit_return_value(value, span);
                }
                let Some(dest) = self.reduce_resolved_identifier(label, span) else {
                    return;
                };
                self.emit_branch(
                    distance_hint,
                    BranchKind::Goto,
                    Some(&dest),
                    None,
                    negated,
                    condition,
                    span,
                );
                return;
            }
        }

        // `return value when cond`: evaluate the value only on the taken
        // path, via a synthetic skip label.
        if return_value.is_some() || condition.is_some() {
            if matches!(
                kind,
                BranchKind::Return
                    | BranchKind::FarReturn
                    | BranchKind::IrqReturn
                    | BranchKind::NmiReturn
            ) {
                if let Some(condition) = condition {
                    let skip = self.mint_label("skip", span);
                    let Some(skip_dest) = self.reduce_resolved_identifier(skip, span) else {
                        return;
                    };
                    self.emit_branch(
                        distance_hint,
                        BranchKind::Goto,
                        Some(&skip_dest),
                        None,
                        !negated,
                        Some(condition),
                        span,
                    );
                    self.emit_branch(
                        distance_hint,
                        kind,
                        destination,
                        return_value,
                        false,
                        None,
                        span,
                    );
                    self.ir.push(IrNode::Label(skip));
                    return;
                }
                if let Some(value) = return_value {
                    let Some(value) = self.reduce_expression(value) else {
                        return;
                    };
                    self.emit_return_value(&value, span);
                    self.emit_branch(distance_hint, kind, destination, None, false, None, span);
                    return;
                }
            }
        }

        match condition {
            None => self.emit_unconditional_branch(kind, destination, span),
            Some(condition) => {
                self.emit_conditional_branch(distance_hint, kind, destination, negated, condition, span)
            }
        }
    }

    /// Move a return value into the function's return designated storage.
    fn emit_return_value(&mut self, value: &Expression, span: Span) {
        let return_type = self
            .current_function()
            .and_then(|func| self.defs.as_func(func))
            .and_then(|func| func.resolved_return_type.clone());
        match return_type {
            Some(TypeExpression::DesignatedStorage { holder, element }) => {
                let Some(narrowed) = self.narrow_expression(value, &element, span) else {
                    return;
                };
                self.emit_assignment(&holder, &narrowed, span);
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    "returning a value requires a designated-storage return type (e.g. ': u8 in a')",
                ));
            }
        }
    }

    fn emit_unconditional_branch(
        &mut self,
        kind: BranchKind,
        destination: Option<&Expression>,
        span: Span,
    ) {
        match destination {
            None => {
                self.emit_code(InstructionType::Branch(kind), Vec::new(), span);
            }
            Some(destination) => {
                // Far-qualified destinations promote the transfer kind.
                let far = match destination.resolved_def() {
                    Some(def) => self
                        .defs
                        .as_func(def)
                        .map(|func| func.far)
                        .unwrap_or(false),
                    None => matches!(
                        destination.ty().map(TypeExpression::storage_element),
                        Some(TypeExpression::Pointer { qualifiers, .. }) if qualifiers.is_far
                    ),
                };
                let kind = if far { kind.far_form() } else { kind };
                let Some(tree) = self.operand_from_expression(destination, true, span) else {
                    return;
                };
                let roots = vec![OperandRoot::new(Some(destination.clone()), tree)];
                self.emit_code(InstructionType::Branch(kind), roots, span);
            }
        }
    }

    fn emit_conditional_branch(
        &mut self,
        distance_hint: DistanceHint,
        kind: BranchKind,
        destination: Option<&Expression>,
        negated: bool,
        condition: &Expression,
        span: Span,
    ) {
        // Constant conditions collapse.
        if let Some(value) = condition.known_boolean() {
            if value != negated {
                self.emit_branch(distance_hint, kind, destination, None, false, None, span);
            }
            return;
        }

        match &condition.kind {
            // Strip `!`, flipping the negation.
            ExpressionKind::Unary {
                op: UnaryOp::LogicalNegation,
                operand,
            } => {
                self.emit_branch(
                    distance_hint,
                    kind,
                    destination,
                    None,
                    !negated,
                    Some(operand),
                    span,
                );
            }
            ExpressionKind::Binary { op, left, right } if op.is_comparison() => {
                self.emit_comparison_branch(
                    distance_hint,
                    kind,
                    destination,
                    negated,
                    *op,
                    left,
                    right,
                    span,
                );
            }
            ExpressionKind::Binary {
                op: op @ (BinaryOp::LogicalAnd | BinaryOp::LogicalOr),
                left,
                right,
            } => {
                // Short-circuit lowering; negation rewrites through
                // De Morgan's laws.
                let conjunction = (*op == BinaryOp::LogicalAnd) != negated;
                if conjunction {
                    let skip = self.mint_label("skip", span);
                    let Some(skip_dest) = self.reduce_resolved_identifier(skip, span) else {
                        return;
                    };
                    self.emit_branch(
                        distance_hint,
                        BranchKind::Goto,
                        Some(&skip_dest),
                        None,
                        !negated,
                        Some(left),
                        span,
                    );
                    self.emit_branch(
                        distance_hint,
                        kind,
                        destination,
                        None,
                        negated,
                        Some(right),
                        span,
                    );
                    self.ir.push(IrNode::Label(skip));
                } else {
                    self.emit_branch(
                        distance_hint,
                        kind,
                        destination,
                        None,
                        negated,
                        Some(left),
                        span,
                    );
                    self.emit_branch(
                        distance_hint,
                        kind,
                        destination,
                        None,
                        negated,
                        Some(right),
                        span,
                    );
                }
            }
            ExpressionKind::ResolvedIdentifier { def, .. }
                if matches!(self.defs.get(*def).kind, DefKind::BuiltinRegister(_)) =>
            {
                let is_flag = match &self.defs.get(*def).kind {
                    DefKind::BuiltinRegister(register) => {
                        register.ty == self.builtins.bool_type
                    }
                    _ => false,
                };
                if is_flag {
                    let Some(dest) = destination else {
                        self.report
                            .error(Diagnostic::error(span, "conditional branch needs a target"));
                        return;
                    };
                    let Some(tree) = self.operand_from_expression(dest, true, span) else {
                        return;
                    };
                    let roots = vec![
                        OperandRoot::new(Some(dest.clone()), tree),
                        OperandRoot::fixed(Operand::Register(*def)),
                        OperandRoot::fixed(Operand::Boolean(!negated)),
                    ];
                    self.emit_code(InstructionType::Branch(kind), roots, span);
                } else {
                    // A data register tests against zero.
                    let zero = Expression::with_info(
                        ExpressionKind::IntegerLiteral(0),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
                    );
                    self.emit_comparison_branch(
                        distance_hint,
                        kind,
                        destination,
                        negated,
                        BinaryOp::NotEqual,
                        condition,
                        &zero,
                        span,
                    );
                }
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    format!(
                        "cannot branch on condition '{}'",
                        condition.describe()
                    ),
                ));
            }
        }
    }

    /// Ask the platform how to test `left op right` and branch on the
    /// resulting flags.
    #[allow(clippy::too_many_arguments)]
    fn emit_comparison_branch(
        &mut self,
        distance_hint: DistanceHint,
        kind: BranchKind,
        destination: Option<&Expression>,
        negated: bool,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) {
        let op = if negated {
            match op.complement() {
                Some(op) => op,
                None => {
                    self.report
                        .internal_error(span, "comparison operator has no complement");
                    return;
                }
            }
        } else {
            op
        };

        let Some(left_tree) = self.operand_from_expression(left, true, span) else {
            return;
        };
        let Some(right_tree) = self.operand_from_expression(right, true, span) else {
            return;
        };

        let common_type = left
            .ty()
            .and_then(|ty| ty.storage_element().resolved_def())
            .or_else(|| right.ty().and_then(|ty| ty.storage_element().resolved_def()))
            .unwrap_or(self.builtins.iexpr_type);

        let mut lowering = self.platform.get_test_and_branch(
            common_type,
            op,
            &left_tree,
            &right_tree,
            distance_hint,
        );
        if lowering.is_none() {
            // Commutative reversal: `5 == a` tests as `a == 5`.
            if let Some(reversed) = op.reverse() {
                lowering = self.platform.get_test_and_branch(
                    common_type,
                    reversed,
                    &right_tree,
                    &left_tree,
                    distance_hint,
                );
            }
        }
        let Some(lowering) = lowering else {
            self.report.error(Diagnostic::error(
                span,
                format!(
                    "the {} platform cannot test '{} {} {}'",
                    self.platform.name(),
                    left.describe(),
                    op.symbol(),
                    right.describe()
                ),
            ));
            return;
        };

        // The test instruction reads the operands.
        let test_roots: Vec<OperandRoot> = lowering
            .operands
            .iter()
            .map(|operand| OperandRoot::fixed(operand.clone()))
            .collect();
        if !self.emit_code(lowering.test.clone(), test_roots, span) {
            return;
        }

        if lowering.branches.is_empty() {
            return;
        }

        let Some(dest) = destination else {
            self.report
                .error(Diagnostic::error(span, "conditional branch needs a target"));
            return;
        };

        let mut skip: Option<DefId> = None;
        for branch in &lowering.branches {
            let (target, value) = if branch.on_success {
                (dest.clone(), branch.value)
            } else {
                let label = match skip {
                    Some(label) => label,
                    None => {
                        let label = self.mint_label("skip", span);
                        skip = Some(label);
                        label
                    }
                };
                let Some(target) = self.reduce_resolved_identifier(label, span) else {
                    return;
                };
                (target, branch.value)
            };
            let Some(tree) = self.operand_from_expression(&target, true, span) else {
                return;
            };
            let roots = vec![
                OperandRoot::new(Some(target), tree),
                OperandRoot::fixed(Operand::Register(branch.flag)),
                OperandRoot::fixed(Operand::Boolean(value)),
            ];
            if !self.emit_code(InstructionType::Branch(kind), roots, span) {
                return;
            }
        }
        if let Some(skip) = skip {
            self.ir.push(IrNode::Label(skip));
        }
    }

    // --- structured control flow -------------------------------------------

    fn emit_if(
        &mut self,
        condition: &Expression,
        body: &'a Spanned<Statement>,
        alternative: Option<&'a Spanned<Statement>>,
        distance_hint: DistanceHint,
        span: Span,
    ) {
        let Some(condition) = self.reduce_expression(condition) else {
            return;
        };

        // A constant condition keeps only the live branch.
        if let Some(value) = condition.known_boolean() {
            if value {
                self.emit_statement_ir(body);
            } else if let Some(alternative) = alternative {
                self.emit_statement_ir(alternative);
            }
            return;
        }

        let else_label = self.mint_label("else", span);
        let Some(else_dest) = self.reduce_resolved_identifier(else_label, span) else {
            return;
        };
        self.emit_branch(
            distance_hint,
            BranchKind::Goto,
            Some(&else_dest),
            None,
            true,
            Some(&condition),
            span,
        );
        self.emit_statement_ir(body);

        match alternative {
            Some(alternative) => {
                let end_label = self.mint_label("endif", span);
                let Some(end_dest) = self.reduce_resolved_identifier(end_label, span) else {
                    return;
                };
                self.emit_branch(
                    distance_hint,
                    BranchKind::Goto,
                    Some(&end_dest),
                    None,
                    false,
                    None,
                    span,
                );
                self.ir.push(IrNode::Label(else_label));
                self.emit_statement_ir(alternative);
                self.ir.push(IrNode::Label(end_label));
            }
            None => {
                self.ir.push(IrNode::Label(else_label));
            }
        }
    }

    fn emit_while(
        &mut self,
        condition: &Expression,
        body: &'a Spanned<Statement>,
        distance_hint: DistanceHint,
        span: Span,
    ) {
        let Some(condition) = self.reduce_expression(condition) else {
            return;
        };
        if condition.known_boolean() == Some(false) {
            return;
        }

        let begin = self.mint_label("while", span);
        let end = self.mint_label("endwhile", span);
        self.ir.push(IrNode::Label(begin));

        if condition.known_boolean() != Some(true) {
            let Some(end_dest) = self.reduce_resolved_identifier(end, span) else {
                return;
            };
            self.emit_branch(
                distance_hint,
                BranchKind::Goto,
                Some(&end_dest),
                None,
                true,
                Some(&condition),
                span,
            );
        }

        self.enter_loop(LoopLabels {
            break_label: end,
            continue_label: begin,
        });
        self.emit_statement_ir(body);
        self.exit_loop();

        let Some(begin_dest) = self.reduce_resolved_identifier(begin, span) else {
            return;
        };
        self.emit_branch(
            distance_hint,
            BranchKind::Goto,
            Some(&begin_dest),
            None,
            false,
            None,
            span,
        );
        self.ir.push(IrNode::Label(end));
    }

    fn emit_do_while(
        &mut self,
        body: &'a Spanned<Statement>,
        condition: &Expression,
        distance_hint: DistanceHint,
        span: Span,
    ) {
        let begin = self.mint_label("do", span);
        let check = self.mint_label("docheck", span);
        let end = self.mint_label("enddo", span);
        self.ir.push(IrNode::Label(begin));

        self.enter_loop(LoopLabels {
            break_label: end,
            continue_label: check,
        });
        self.emit_statement_ir(body);
        self.exit_loop();

        self.ir.push(IrNode::Label(check));
        let Some(condition) = self.reduce_expression(condition) else {
            return;
        };
        let Some(begin_dest) = self.reduce_resolved_identifier(begin, span) else {
            return;
        };
        self.emit_branch(
            distance_hint,
            BranchKind::Goto,
            Some(&begin_dest),
            None,
            false,
            Some(&condition),
            span,
        );
        self.ir.push(IrNode::Label(end));
    }

    fn emit_for(
        &mut self,
        counter: &Expression,
        sequence: &Expression,
        body: &'a Spanned<Statement>,
        distance_hint: DistanceHint,
        span: Span,
    ) {
        let Some(sequence) = self.reduce_expression(sequence) else {
            return;
        };
        let ExpressionKind::RangeLiteral { start, end, step } = &sequence.kind else {
            self.report.error(Diagnostic::error(
                sequence.span,
                "for loops iterate over a compile-time range",
            ));
            return;
        };
        let (Some(first), Some(last)) = (start.known_integer(), end.known_integer()) else {
            return;
        };
        let step_value = step
            .as_ref()
            .and_then(|step| step.known_integer())
            .unwrap_or(1);

        let Some(counter) = self.reduce_expression(counter) else {
            return;
        };
        let counter_type = match counter.ty() {
            Some(ty) => ty.storage_element().clone(),
            None => return,
        };

        // counter = first
        let first_literal = Expression::with_info(
            ExpressionKind::IntegerLiteral(first),
            span,
            ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
        );
        let Some(first_narrowed) = self.narrow_expression(&first_literal, &counter_type, span)
        else {
            return;
        };
        self.emit_assignment(&counter, &first_narrowed, span);

        let begin = self.mint_label("for", span);
        let advance = self.mint_label("fornext", span);
        let end_label = self.mint_label("endfor", span);
        self.ir.push(IrNode::Label(begin));

        self.enter_loop(LoopLabels {
            break_label: end_label,
            continue_label: advance,
        });
        self.emit_statement_ir(body);
        self.exit_loop();

        self.ir.push(IrNode::Label(advance));

        // Counter update: a single increment/decrement when the stride
        // allows, otherwise an in-place addition.
        if step_value == 1 || step_value == -1 {
            let op = if step_value == 1 {
                UnaryOp::PreIncrement
            } else {
                UnaryOp::PreDecrement
            };
            let Some(tree) = self.operand_from_expression(&counter, true, span) else {
                return;
            };
            let roots = vec![OperandRoot::new(Some(counter.clone()), tree)];
            if !self.emit_code(InstructionType::Unary(op), roots, span) {
                return;
            }
        } else {
            let step_literal = Expression::with_info(
                ExpressionKind::IntegerLiteral(step_value.abs()),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
            );
            let Some(step_narrowed) = self.narrow_expression(&step_literal, &counter_type, span)
            else {
                return;
            };
            let Some(counter_tree) = self.operand_from_expression(&counter, true, span) else {
                return;
            };
            let Some(step_tree) = self.operand_from_expression(&step_narrowed, true, span) else {
                return;
            };
            let op = if step_value > 0 {
                BinaryOp::Addition
            } else {
                BinaryOp::Subtraction
            };
            let roots = vec![
                OperandRoot::new(Some(counter.clone()), counter_tree),
                OperandRoot::new(Some(step_narrowed), step_tree),
            ];
            if !self.emit_code(InstructionType::Binary(op), roots, span) {
                return;
            }
        }

        let stop = last + step_value;
        let wraps_to_zero = self
            .storage_size(&counter_type)
            .map(|size| {
                let modulus = 1i128 << (8 * size);
                stop.rem_euclid(modulus) == 0
            })
            .unwrap_or(false);

        let Some(begin_dest) = self.reduce_resolved_identifier(begin, span) else {
            return;
        };
        if wraps_to_zero {
            // The update instruction leaves the zero flag when the counter
            // wraps past the type boundary, so no separate test is needed.
            if let Some(zero) = self.platform.zero_flag() {
                let Some(tree) = self.operand_from_expression(&begin_dest, true, span) else {
                    return;
                };
                let roots = vec![
                    OperandRoot::new(Some(begin_dest), tree),
                    OperandRoot::fixed(Operand::Register(zero)),
                    OperandRoot::fixed(Operand::Boolean(false)),
                ];
                self.emit_code(InstructionType::Branch(BranchKind::Goto), roots, span);
                self.ir.push(IrNode::Label(end_label));
                return;
            }
        }

        let stop_literal = Expression::with_info(
            ExpressionKind::IntegerLiteral(stop),
            span,
            ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
        );
        let Some(stop_narrowed) = self.narrow_expression(&stop_literal, &counter_type, span)
        else {
            return;
        };
        self.emit_comparison_branch(
            distance_hint,
            BranchKind::Goto,
            Some(&begin_dest),
            false,
            BinaryOp::NotEqual,
            &counter,
            &stop_narrowed,
            span,
        );
        self.ir.push(IrNode::Label(end_label));
    }

    fn emit_inline_for(
        &mut self,
        name: &str,
        sequence: &Expression,
        body: &'a Spanned<Statement>,
        span: Span,
    ) {
        let Some(sequence) = self.reduce_expression(sequence) else {
            return;
        };
        let Some(elements) = self.sequence_elements(&sequence) else {
            return;
        };

        // Each iteration is its own inline site with a fresh binding of the
        // loop name, and runs the reservation/typing/storage sub-phases over
        // the body before emitting it.
        for element in elements {
            let binding_scope = self
                .scopes
                .create(Some(self.current_scope()), format!("inline for {name}"));
            let bound = self.defs.add(Def {
                name: name.to_string(),
                decl_span: span,
                scope: binding_scope,
                kind: DefKind::Let(LetDef {
                    parameters: Vec::new(),
                    body: element,
                }),
            });
            self.scopes.declare(binding_scope, name, bound);

            self.enter_inline_site();
            self.enter_scope(binding_scope);
            self.reserve_definitions(body);
            self.resolve_definition_types();
            self.reserve_storage(body);
            self.emit_statement_ir(body);
            self.exit_scope();
            self.exit_inline_site();
        }
    }

    // --- shared emission ---------------------------------------------------

    /// Select and append one instruction. Returns false when selection
    /// failed (the diagnostic is already reported).
    pub(super) fn emit_code(
        &mut self,
        instruction_type: InstructionType,
        roots: Vec<OperandRoot>,
        span: Span,
    ) -> bool {
        let operands: Vec<Operand> = roots.iter().map(|root| root.operand.clone()).collect();
        let Some(instruction) = self.select_instruction(&instruction_type, &operands, span)
        else {
            return false;
        };
        self.ir.push(IrNode::Code {
            instruction,
            operands: roots,
            span,
        });
        true
    }
}

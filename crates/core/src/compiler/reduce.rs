use indexmap::IndexMap;

use crate::ast::StructKind;
use crate::def::{Def, DefId, DefKind, LetDef, VarDef};
use crate::diag::Diagnostic;
use crate::expr::{
    BinaryOp, EvaluationContext, Expression, ExpressionInfo, ExpressionKind, TypeQueryKind,
    UnaryOp, ValueQualifiers,
};
use crate::span::Span;
use crate::types::{PointerQualifiers, TypeExpression};

use super::Compiler;

impl<'a> Compiler<'a> {
    /// Recursively reduce an expression. Every node of the returned tree has
    /// a populated `ExpressionInfo`; compile-time subtrees are folded into
    /// literals, link-time subtrees keep their operator shape, and run-time
    /// subtrees survive for instruction selection.
    ///
    /// Returns `None` after reporting a diagnostic; callers recover at the
    /// nearest statement or expression boundary.
    pub fn reduce_expression(&mut self, expr: &Expression) -> Option<Expression> {
        let span = expr.span;
        match &expr.kind {
            ExpressionKind::IntegerLiteral(value) => Some(Expression::with_info(
                ExpressionKind::IntegerLiteral(*value),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
            )),
            ExpressionKind::BooleanLiteral(value) => Some(Expression::with_info(
                ExpressionKind::BooleanLiteral(*value),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, self.bool_type()),
            )),
            ExpressionKind::StringLiteral(bytes) => {
                let ty = self.u8_array_type(bytes.len(), span);
                Some(Expression::with_info(
                    ExpressionKind::StringLiteral(bytes.clone()),
                    span,
                    ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                ))
            }
            ExpressionKind::Identifier(pieces) => {
                let (def, last) = self.resolve_identifier(pieces, span)?;
                let mut remaining = &pieces[last + 1..];
                let mut def = def;

                // Enum members are reachable through the enum's own scope.
                while let (DefKind::Enum(enum_def), [piece, rest @ ..]) =
                    (&self.defs.get(def).kind, remaining)
                {
                    let mut results = Vec::new();
                    self.scopes.find_member(enum_def.scope, piece, &mut results);
                    match results.as_slice() {
                        [member] => {
                            def = *member;
                            remaining = rest;
                        }
                        _ => {
                            self.report.error(Diagnostic::error(
                                span,
                                format!(
                                    "'{}' has no member '{piece}'",
                                    self.defs.name(def)
                                ),
                            ));
                            return None;
                        }
                    }
                }

                let mut result = self.reduce_resolved_identifier(def, span)?;
                for piece in remaining {
                    result = self.reduce_field_access(&result, piece, span)?;
                }
                Some(result)
            }
            ExpressionKind::ResolvedIdentifier { def, .. } => {
                self.reduce_resolved_identifier(*def, span)
            }
            ExpressionKind::FieldAccess { operand, field } => {
                let operand = self.reduce_expression(operand)?;
                self.reduce_field_access(&operand, field, span)
            }
            ExpressionKind::Binary { op, left, right } => {
                self.reduce_binary(*op, left, right, span)
            }
            ExpressionKind::Unary { op, operand } => self.reduce_unary(*op, operand, span),
            ExpressionKind::Call {
                inlined,
                function,
                arguments,
            } => self.reduce_call(*inlined, function, arguments, span),
            ExpressionKind::Cast { operand, target } => self.reduce_cast(operand, target, span),
            ExpressionKind::Embed(path) => {
                let bytes = self.embed_file(path, span)?;
                let ty = self.u8_array_type(bytes.len(), span);
                Some(Expression::with_info(
                    ExpressionKind::StringLiteral(bytes),
                    span,
                    ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                ))
            }
            ExpressionKind::ArrayLiteral(items) => {
                let items = items
                    .iter()
                    .map(|item| self.reduce_expression(item))
                    .collect::<Option<Vec<_>>>()?;
                Some(self.array_literal(items, span))
            }
            ExpressionKind::ArrayPadLiteral { value, length } => {
                let value = self.reduce_expression(value)?;
                let length = self.reduce_expression(length)?;
                let Some(count) = length.known_integer().and_then(|v| usize::try_from(v).ok())
                else {
                    self.report.error(Diagnostic::error(
                        length.span,
                        "array pad length must be a non-negative compile-time integer",
                    ));
                    return None;
                };
                let items = vec![value; count];
                Some(self.array_literal(items, span))
            }
            ExpressionKind::ArrayComprehension {
                name,
                sequence,
                body,
            } => self.reduce_array_comprehension(name, sequence, body, span),
            ExpressionKind::StructLiteral {
                type_expression,
                members,
            } => self.reduce_struct_literal(type_expression, members, span),
            ExpressionKind::TupleLiteral(items) => {
                let items = items
                    .iter()
                    .map(|item| self.reduce_expression(item))
                    .collect::<Option<Vec<_>>>()?;
                let context = items
                    .iter()
                    .filter_map(Expression::context)
                    .max()
                    .unwrap_or(EvaluationContext::CompileTime);
                let ty = TypeExpression::Tuple(
                    items
                        .iter()
                        .map(|item| item.ty().cloned().unwrap_or_else(TypeExpression::unit))
                        .collect(),
                );
                Some(Expression::with_info(
                    ExpressionKind::TupleLiteral(items),
                    span,
                    ExpressionInfo::new(context, ty),
                ))
            }
            ExpressionKind::RangeLiteral { start, end, step } => {
                let start = self.reduce_expression(start)?;
                let end = self.reduce_expression(end)?;
                let step = match step {
                    Some(step) => Some(self.reduce_expression(step)?),
                    None => None,
                };
                for part in [Some(&start), Some(&end), step.as_ref()].into_iter().flatten() {
                    if part.known_integer().is_none() {
                        self.report.error(Diagnostic::error(
                            part.span,
                            "range bounds must be compile-time integers",
                        ));
                        return None;
                    }
                }
                if step.as_ref().and_then(|s| s.known_integer()) == Some(0) {
                    self.report
                        .error(Diagnostic::error(span, "range step cannot be zero"));
                    return None;
                }
                let ty = TypeExpression::resolved(self.builtins.range_type, vec!["range".into()]);
                Some(Expression::with_info(
                    ExpressionKind::RangeLiteral {
                        start: Box::new(start),
                        end: Box::new(end),
                        step: step.map(Box::new),
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                ))
            }
            ExpressionKind::OffsetOf {
                type_expression,
                field,
            } => {
                let ty = self.reduce_type(type_expression, span)?;
                let Some(def) = ty.resolved_def() else {
                    self.report
                        .error(Diagnostic::error(span, "offsetof requires a struct type"));
                    return None;
                };
                let DefKind::Struct(struct_def) = &self.defs.get(def).kind else {
                    self.report
                        .error(Diagnostic::error(span, "offsetof requires a struct type"));
                    return None;
                };
                let member = struct_def
                    .members
                    .iter()
                    .copied()
                    .find(|member| self.defs.name(*member) == field);
                let offset = member.and_then(|member| match &self.defs.get(member).kind {
                    DefKind::StructMember(m) => m.offset,
                    _ => None,
                });
                match offset {
                    Some(offset) => Some(Expression::with_info(
                        ExpressionKind::IntegerLiteral(offset as i128),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
                    )),
                    None => {
                        self.report.error(Diagnostic::error(
                            span,
                            format!("'{}' has no member '{field}'", ty.describe()),
                        ));
                        None
                    }
                }
            }
            ExpressionKind::TypeQuery { kind, target } => {
                let ty = self.reduce_type(target, span)?;
                match kind {
                    TypeQueryKind::SizeOf => match self.storage_size(&ty) {
                        Some(size) => Some(Expression::with_info(
                            ExpressionKind::IntegerLiteral(size as i128),
                            span,
                            ExpressionInfo::new(
                                EvaluationContext::CompileTime,
                                self.iexpr_type(),
                            ),
                        )),
                        None => {
                            self.report.error(Diagnostic::error(
                                span,
                                format!("'{}' has no known storage size", ty.describe()),
                            ));
                            None
                        }
                    },
                    TypeQueryKind::AlignOf => {
                        self.report
                            .error(Diagnostic::error(span, "alignof is not implemented"));
                        None
                    }
                }
            }
            ExpressionKind::TypeOf(_) => {
                self.report.error(Diagnostic::error(
                    span,
                    "typeof names a type and cannot be used as a value",
                ));
                None
            }
            ExpressionKind::SideEffect { statement, result } => {
                let result = self.reduce_expression(result)?;
                let info = result.info.clone()?;
                Some(Expression::with_info(
                    ExpressionKind::SideEffect {
                        statement: statement.clone(),
                        result: Box::new(result),
                    },
                    span,
                    info,
                ))
            }
        }
    }

    fn array_literal(&mut self, items: Vec<Expression>, span: Span) -> Expression {
        let context = items
            .iter()
            .filter_map(Expression::context)
            .max()
            .unwrap_or(EvaluationContext::CompileTime);
        let element = items
            .first()
            .and_then(|item| item.ty().cloned())
            .unwrap_or_else(|| self.iexpr_type());
        let length = Expression::with_info(
            ExpressionKind::IntegerLiteral(items.len() as i128),
            span,
            ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
        );
        Expression::with_info(
            ExpressionKind::ArrayLiteral(items),
            span,
            ExpressionInfo::new(
                context,
                TypeExpression::Array {
                    element: Box::new(element),
                    length: Some(Box::new(length)),
                },
            ),
        )
    }

    // --- identifiers -------------------------------------------------------

    pub(crate) fn reduce_resolved_identifier(&mut self, def: DefId, span: Span) -> Option<Expression> {
        let name = self.defs.name(def).to_string();
        match &self.defs.get(def).kind {
            DefKind::Var(var) => {
                let Some(ty) = var.resolved_type.clone() else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!("variable '{name}' has no resolved type yet"),
                    ));
                    return None;
                };
                // A designated-storage variable is just a name for its
                // holder.
                if let TypeExpression::DesignatedStorage { holder, .. } = &ty {
                    let mut holder = (**holder).clone();
                    holder.span = span;
                    return Some(holder);
                }
                let qualifiers = ValueQualifiers {
                    lvalue: true,
                    is_const: var.qualifiers.is_const,
                    is_writeonly: var.qualifiers.is_writeonly,
                    is_far: var.qualifiers.is_far,
                };
                Some(Expression::with_info(
                    ExpressionKind::ResolvedIdentifier {
                        def,
                        pieces: vec![name],
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::RunTime, ty)
                        .with_qualifiers(qualifiers),
                ))
            }
            DefKind::EnumMember(member) => match &member.reduced_expression {
                Some(reduced) => {
                    let mut reduced = reduced.clone();
                    reduced.span = span;
                    Some(reduced)
                }
                None => {
                    self.report.error(Diagnostic::error(
                        span,
                        format!("enum member '{name}' is not resolved yet"),
                    ));
                    None
                }
            },
            DefKind::Func(func) => {
                let parameters = func
                    .parameters
                    .iter()
                    .map(|parameter| {
                        self.defs
                            .as_var(*parameter)
                            .and_then(|var| var.resolved_type.clone())
                            .unwrap_or_else(TypeExpression::unit)
                    })
                    .collect();
                let return_type = func
                    .resolved_return_type
                    .clone()
                    .unwrap_or_else(TypeExpression::unit);
                let ty = TypeExpression::Function {
                    far: func.far,
                    parameters,
                    return_type: Box::new(return_type),
                };
                Some(Expression::with_info(
                    ExpressionKind::ResolvedIdentifier {
                        def,
                        pieces: vec![name],
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::LinkTime, ty),
                ))
            }
            DefKind::BuiltinRegister(register) => {
                let ty = TypeExpression::resolved(
                    register.ty,
                    vec![self.defs.name(register.ty).to_string()],
                );
                Some(Expression::with_info(
                    ExpressionKind::ResolvedIdentifier {
                        def,
                        pieces: vec![name],
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::RunTime, ty)
                        .with_qualifiers(ValueQualifiers::lvalue()),
                ))
            }
            DefKind::Let(let_def) => {
                if !let_def.parameters.is_empty() {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "let expression '{name}' takes {} argument(s)",
                            let_def.parameters.len()
                        ),
                    ));
                    return None;
                }
                let body = let_def.body.clone();
                let scope = self.defs.get(def).scope;
                if !self.push_let(&name, span) {
                    return None;
                }
                self.enter_scope(scope);
                let reduced = self.reduce_expression(&body);
                self.exit_scope();
                self.pop_let();
                reduced
            }
            DefKind::BuiltinLoadIntrinsic(_) | DefKind::BuiltinVoidIntrinsic => {
                Some(Expression::with_info(
                    ExpressionKind::ResolvedIdentifier {
                        def,
                        pieces: vec![name],
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::RunTime, TypeExpression::unit()),
                ))
            }
            kind => {
                self.report.error(Diagnostic::error(
                    span,
                    format!("{} '{name}' cannot be used as a value", kind.category()),
                ));
                None
            }
        }
    }

    fn reduce_field_access(
        &mut self,
        operand: &Expression,
        field: &str,
        span: Span,
    ) -> Option<Expression> {
        let info = operand.info.as_ref()?;

        // Compile-time struct literal: pick the member value.
        if let ExpressionKind::StructLiteral { members, .. } = &operand.kind {
            if let Some(member) = members.get(field) {
                return Some(member.clone());
            }
        }

        let Some(struct_id) = info.ty.storage_element().resolved_def() else {
            self.report.error(Diagnostic::error(
                span,
                format!("type '{}' has no member '{field}'", info.ty.describe()),
            ));
            return None;
        };
        let DefKind::Struct(struct_def) = &self.defs.get(struct_id).kind else {
            self.report.error(Diagnostic::error(
                span,
                format!("type '{}' has no member '{field}'", info.ty.describe()),
            ));
            return None;
        };

        let member = struct_def
            .members
            .iter()
            .copied()
            .find(|member| self.defs.name(*member) == field);
        let (offset, member_type) = match member.map(|member| &self.defs.get(member).kind) {
            Some(DefKind::StructMember(m)) => {
                (m.offset?, m.resolved_type.clone()?)
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    format!("'{}' has no member '{field}'", info.ty.describe()),
                ));
                return None;
            }
        };

        let qualifiers = info.qualifiers;
        let address = self.address_of_expression(operand, qualifiers.is_far, span)?;
        let address = self.offset_address(address, offset, span)?;
        Some(Expression::with_info(
            ExpressionKind::Unary {
                op: UnaryOp::Indirection,
                operand: Box::new(address),
            },
            span,
            ExpressionInfo::new(EvaluationContext::RunTime, member_type)
                .with_qualifiers(qualifiers),
        ))
    }

    // --- binary operators --------------------------------------------------

    fn reduce_binary(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<Expression> {
        match op {
            BinaryOp::Assignment => self.reduce_assignment(left, right, span),
            BinaryOp::Indexing => self.reduce_indexing(left, right, span),
            BinaryOp::BitIndexing => {
                let left = self.reduce_expression(left)?;
                let right = self.reduce_expression(right)?;
                Some(Expression::with_info(
                    ExpressionKind::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::RunTime, self.bool_type()),
                ))
            }
            BinaryOp::Concatenation => self.reduce_concatenation(left, right, span),
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => {
                self.reduce_logical(op, left, right, span)
            }
            op if op.is_comparison() => self.reduce_comparison(op, left, right, span),
            _ => self.reduce_arithmetic(op, left, right, span),
        }
    }

    fn reduce_assignment(
        &mut self,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let left = self.reduce_expression(left)?;
        let info = left.info.clone()?;
        if !info.qualifiers.lvalue {
            self.report.error(Diagnostic::error(
                left.span,
                "left side of assignment must be an l-value",
            ));
            return None;
        }
        if info.qualifiers.is_const {
            self.report.error(Diagnostic::error(
                left.span,
                format!("cannot assign to constant '{}'", left.describe()),
            ));
            return None;
        }

        let right = self.reduce_expression(right)?;
        let right = self.narrow_expression(&right, &info.ty, span)?;

        Some(Expression::with_info(
            ExpressionKind::Binary {
                op: BinaryOp::Assignment,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
            ExpressionInfo::new(EvaluationContext::RunTime, info.ty)
                .with_qualifiers(info.qualifiers),
        ))
    }

    fn reduce_indexing(
        &mut self,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let left = self.reduce_expression(left)?;
        let right = self.reduce_expression(right)?;
        let info = left.info.clone()?;

        // Compile-time aggregate indexed by a compile-time integer folds.
        if let Some(index) = right.known_integer() {
            match &left.kind {
                ExpressionKind::ArrayLiteral(items) => {
                    return match usize::try_from(index).ok().and_then(|i| items.get(i)) {
                        Some(item) => Some(item.clone()),
                        None => {
                            self.report.error(Diagnostic::error(
                                span,
                                format!("index {index} is out of bounds"),
                            ));
                            None
                        }
                    };
                }
                ExpressionKind::StringLiteral(bytes) => {
                    return match usize::try_from(index).ok().and_then(|i| bytes.get(i)) {
                        Some(byte) => Some(Expression::with_info(
                            ExpressionKind::IntegerLiteral(*byte as i128),
                            span,
                            ExpressionInfo::new(
                                EvaluationContext::CompileTime,
                                self.iexpr_type(),
                            ),
                        )),
                        None => {
                            self.report.error(Diagnostic::error(
                                span,
                                format!("index {index} is out of bounds"),
                            ));
                            None
                        }
                    };
                }
                ExpressionKind::TupleLiteral(items) => {
                    return match usize::try_from(index).ok().and_then(|i| items.get(i)) {
                        Some(item) => Some(item.clone()),
                        None => {
                            self.report.error(Diagnostic::error(
                                span,
                                format!("index {index} is out of bounds"),
                            ));
                            None
                        }
                    };
                }
                ExpressionKind::RangeLiteral { .. } => {
                    let elements = self.sequence_elements(&left)?;
                    return match usize::try_from(index).ok().and_then(|i| elements.get(i)) {
                        Some(item) => Some(item.clone()),
                        None => {
                            self.report.error(Diagnostic::error(
                                span,
                                format!("index {index} is out of bounds"),
                            ));
                            None
                        }
                    };
                }
                _ => {}
            }
        }

        // Indexing into stored arrays lowers to pointer arithmetic.
        let TypeExpression::Array { element, .. } = info.ty.storage_element().clone() else {
            self.report.error(Diagnostic::error(
                span,
                format!("type '{}' cannot be indexed", info.ty.describe()),
            ));
            return None;
        };
        let Some(element_size) = self.storage_size(&element) else {
            self.report.error(Diagnostic::error(
                span,
                format!("'{}' has no known storage size", element.describe()),
            ));
            return None;
        };

        if let Some(index) = right.known_integer() {
            if index < 0 {
                self.report.error(Diagnostic::error(
                    span,
                    format!("index {index} is out of bounds"),
                ));
                return None;
            }
            if let TypeExpression::Array {
                length: Some(length),
                ..
            } = info.ty.storage_element()
            {
                if let Some(length) = length.known_integer() {
                    if index >= length {
                        self.report.error(Diagnostic::error(
                            span,
                            format!("index {index} is out of bounds for length {length}"),
                        ));
                        return None;
                    }
                }
            }
            let address = self.address_of_expression(&left, info.qualifiers.is_far, span)?;
            let address =
                self.offset_address(address, index as usize * element_size, span)?;
            return Some(Expression::with_info(
                ExpressionKind::Unary {
                    op: UnaryOp::Indirection,
                    operand: Box::new(address),
                },
                span,
                ExpressionInfo::new(EvaluationContext::RunTime, (*element).clone())
                    .with_qualifiers(info.qualifiers),
            ));
        }

        // Run-time subscript: selection needs the whole shape.
        let qualifiers = info.qualifiers;
        Some(Expression::with_info(
            ExpressionKind::Binary {
                op: BinaryOp::Indexing,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
            ExpressionInfo::new(EvaluationContext::RunTime, (*element).clone())
                .with_qualifiers(qualifiers),
        ))
    }

    fn reduce_concatenation(
        &mut self,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let left = self.reduce_expression(left)?;
        let right = self.reduce_expression(right)?;

        match (&left.kind, &right.kind) {
            (ExpressionKind::StringLiteral(a), ExpressionKind::StringLiteral(b)) => {
                let mut bytes = a.clone();
                bytes.extend_from_slice(b);
                let ty = self.u8_array_type(bytes.len(), span);
                Some(Expression::with_info(
                    ExpressionKind::StringLiteral(bytes),
                    span,
                    ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                ))
            }
            (ExpressionKind::ArrayLiteral(a), ExpressionKind::ArrayLiteral(b)) => {
                // The element check inspects the right operand's array type;
                // see DESIGN.md.
                let right_ty = right.ty()?.storage_element();
                let TypeExpression::Array { element, .. } = right_ty else {
                    self.report.error(Diagnostic::error(
                        span,
                        "concatenation requires two compile-time arrays",
                    ));
                    return None;
                };
                if let Some(left_ty) = left.ty() {
                    if let TypeExpression::Array {
                        element: left_element,
                        ..
                    } = left_ty.storage_element()
                    {
                        let compatible = self.is_type_equivalent(left_element, element)
                            || self.is_iexpr(left_element)
                            || self.is_iexpr(element);
                        if !compatible {
                            self.report.error(Diagnostic::error(
                                span,
                                "concatenated arrays have incompatible element types",
                            ));
                            return None;
                        }
                    }
                }
                let mut items = a.clone();
                items.extend(b.iter().cloned());
                Some(self.array_literal(items, span))
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    "concatenation requires two compile-time arrays or strings",
                ));
                None
            }
        }
    }

    fn reduce_logical(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let left = self.reduce_expression(left)?;
        if let Some(value) = left.known_boolean() {
            // Short-circuit on a known operand.
            let shortcut = match op {
                BinaryOp::LogicalAnd => !value,
                BinaryOp::LogicalOr => value,
                _ => unreachable!(),
            };
            if shortcut {
                return Some(Expression::with_info(
                    ExpressionKind::BooleanLiteral(value),
                    span,
                    ExpressionInfo::new(EvaluationContext::CompileTime, self.bool_type()),
                ));
            }
            return self.reduce_expression(right);
        }

        let right = self.reduce_expression(right)?;
        Some(Expression::with_info(
            ExpressionKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
            ExpressionInfo::new(EvaluationContext::RunTime, self.bool_type()),
        ))
    }

    fn reduce_comparison(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let left = self.reduce_expression(left)?;
        let right = self.reduce_expression(right)?;

        if let (Some(a), Some(b)) = (left.known_integer(), right.known_integer()) {
            let value = match op {
                BinaryOp::Equal => a == b,
                BinaryOp::NotEqual => a != b,
                BinaryOp::LessThan => a < b,
                BinaryOp::LessThanOrEqual => a <= b,
                BinaryOp::GreaterThan => a > b,
                BinaryOp::GreaterThanOrEqual => a >= b,
                _ => unreachable!(),
            };
            return Some(Expression::with_info(
                ExpressionKind::BooleanLiteral(value),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, self.bool_type()),
            ));
        }
        if let (Some(a), Some(b)) = (left.known_boolean(), right.known_boolean()) {
            let value = match op {
                BinaryOp::Equal => a == b,
                BinaryOp::NotEqual => a != b,
                _ => {
                    self.report.error(Diagnostic::error(
                        span,
                        "booleans only support equality comparisons",
                    ));
                    return None;
                }
            };
            return Some(Expression::with_info(
                ExpressionKind::BooleanLiteral(value),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, self.bool_type()),
            ));
        }

        // The operands must share an arithmetic type; the comparison itself
        // yields a bool.
        self.common_arithmetic_type(&left, &right, span)?;
        Some(Expression::with_info(
            ExpressionKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
            ExpressionInfo::new(EvaluationContext::RunTime, self.bool_type()),
        ))
    }

    fn reduce_arithmetic(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let left = self.reduce_expression(left)?;
        let right = self.reduce_expression(right)?;
        let ty = self.common_arithmetic_type(&left, &right, span)?;

        if let (Some(a), Some(b)) = (left.known_integer(), right.known_integer()) {
            let width_bits = self
                .storage_size(&ty)
                .map(|size| 8 * size as u32)
                .filter(|_| !self.is_iexpr(&ty));
            let value = self.fold_integer_binary(op, a, b, width_bits, span)?;

            if !self.is_iexpr(&ty) {
                if let Some(def) = ty.storage_element().resolved_def() {
                    if let Some(int) = self.defs.as_integer_type(def) {
                        if value < int.min || value > int.max {
                            self.report.error(Diagnostic::error(
                                span,
                                format!(
                                    "arithmetic overflow: {value} does not fit in '{}'",
                                    ty.describe()
                                ),
                            ));
                            return None;
                        }
                    }
                }
            }

            return Some(Expression::with_info(
                ExpressionKind::IntegerLiteral(value),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, ty),
            ));
        }

        let context = left
            .context()
            .unwrap_or(EvaluationContext::RunTime)
            .max(right.context().unwrap_or(EvaluationContext::RunTime));
        Some(Expression::with_info(
            ExpressionKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
            ExpressionInfo::new(context, ty),
        ))
    }

    fn fold_integer_binary(
        &mut self,
        op: BinaryOp,
        a: i128,
        b: i128,
        width_bits: Option<u32>,
        span: Span,
    ) -> Option<i128> {
        let overflow = |compiler: &mut Self| {
            compiler
                .report
                .error(Diagnostic::error(span, "compile-time arithmetic overflow"));
            None
        };

        match op {
            BinaryOp::Addition => a.checked_add(b).or_else(|| overflow(self)),
            BinaryOp::Subtraction => a.checked_sub(b).or_else(|| overflow(self)),
            BinaryOp::Multiplication => a.checked_mul(b).or_else(|| overflow(self)),
            BinaryOp::Division => {
                if b == 0 {
                    self.report
                        .error(Diagnostic::error(span, "division by zero"));
                    return None;
                }
                a.checked_div(b).or_else(|| overflow(self))
            }
            BinaryOp::Modulo => {
                if b == 0 {
                    self.report
                        .error(Diagnostic::error(span, "division by zero"));
                    return None;
                }
                a.checked_rem(b).or_else(|| overflow(self))
            }
            BinaryOp::LeftShift | BinaryOp::LogicalLeftShift => {
                let shift = u32::try_from(b).ok().filter(|shift| *shift < 128);
                match shift {
                    Some(shift) => a.checked_shl(shift).or_else(|| overflow(self)),
                    None => overflow(self),
                }
            }
            BinaryOp::RightShift => {
                let shift = u32::try_from(b).ok().filter(|shift| *shift < 128);
                match shift {
                    Some(shift) => Some(a >> shift),
                    None => overflow(self),
                }
            }
            BinaryOp::LogicalRightShift => {
                let Some(bits) = width_bits else {
                    self.report.error(Diagnostic::error(
                        span,
                        "logical shift right requires a sized integer type",
                    ));
                    return None;
                };
                let shift = match u32::try_from(b).ok().filter(|shift| *shift < bits) {
                    Some(shift) => shift,
                    None => return overflow(self),
                };
                let mask = (1i128 << bits) - 1;
                Some(((a & mask) as u128 >> shift) as i128)
            }
            BinaryOp::LeftRotate | BinaryOp::RightRotate => {
                let Some(bits) = width_bits else {
                    self.report.error(Diagnostic::error(
                        span,
                        "rotation requires a sized integer type",
                    ));
                    return None;
                };
                let amount = (b.rem_euclid(bits as i128)) as u32;
                let mask = (1i128 << bits) - 1;
                let value = (a & mask) as u128;
                let rotated = match op {
                    BinaryOp::LeftRotate => {
                        ((value << amount) | (value >> (bits - amount).min(127))) as i128 & mask
                    }
                    _ => ((value >> amount) | (value << (bits - amount).min(127))) as i128 & mask,
                };
                Some(rotated)
            }
            BinaryOp::BitwiseAnd => Some(a & b),
            BinaryOp::BitwiseOr => Some(a | b),
            BinaryOp::BitwiseXor => Some(a ^ b),
            _ => {
                self.report.internal_error(
                    span,
                    format!("operator '{}' is not foldable", op.symbol()),
                );
                None
            }
        }
    }

    /// The shared type of a binary operation's operands: `iexpr` gives way to
    /// a sized operand; two sized operands must agree.
    fn common_arithmetic_type(
        &mut self,
        left: &Expression,
        right: &Expression,
        span: Span,
    ) -> Option<TypeExpression> {
        let left_ty = left.ty()?.storage_element().clone();
        let right_ty = right.ty()?.storage_element().clone();
        let left_iexpr = self.is_iexpr(&left_ty);
        let right_iexpr = self.is_iexpr(&right_ty);

        match (left_iexpr, right_iexpr) {
            (true, true) => Some(self.iexpr_type()),
            (true, false) => Some(right_ty),
            (false, true) => Some(left_ty),
            (false, false) => {
                if self.is_type_equivalent(&left_ty, &right_ty) {
                    Some(left_ty)
                } else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "type mismatch: '{}' vs '{}'",
                            left_ty.describe(),
                            right_ty.describe()
                        ),
                    ));
                    None
                }
            }
        }
    }

    // --- unary operators ---------------------------------------------------

    fn reduce_unary(
        &mut self,
        op: UnaryOp,
        operand: &Expression,
        span: Span,
    ) -> Option<Expression> {
        match op {
            UnaryOp::AddressOf | UnaryOp::FarAddressOf => {
                let operand = self.reduce_expression(operand)?;
                self.address_of_expression(&operand, op == UnaryOp::FarAddressOf, span)
            }
            UnaryOp::AddressReserve => self.reduce_address_reserve(operand, span),
            UnaryOp::Indirection => {
                let operand = self.reduce_expression(operand)?;
                let ty = operand.ty()?.storage_element().clone();
                let TypeExpression::Pointer {
                    element,
                    qualifiers,
                } = ty
                else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "cannot dereference non-pointer type '{}'",
                            operand.ty()?.describe()
                        ),
                    ));
                    return None;
                };
                let value_qualifiers = ValueQualifiers {
                    lvalue: true,
                    is_const: qualifiers.is_const,
                    is_writeonly: qualifiers.is_writeonly,
                    is_far: qualifiers.is_far,
                };
                Some(Expression::with_info(
                    ExpressionKind::Unary {
                        op: UnaryOp::Indirection,
                        operand: Box::new(operand),
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::RunTime, *element)
                        .with_qualifiers(value_qualifiers),
                ))
            }
            UnaryOp::Minus => {
                let operand = self.reduce_expression(operand)?;
                if let Some(value) = operand.known_integer() {
                    let Some(value) = value.checked_neg() else {
                        self.report
                            .error(Diagnostic::error(span, "compile-time arithmetic overflow"));
                        return None;
                    };
                    let ty = operand.ty()?.clone();
                    return Some(Expression::with_info(
                        ExpressionKind::IntegerLiteral(value),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                    ));
                }
                self.passthrough_unary(op, operand, span)
            }
            UnaryOp::BitwiseNegation => {
                let operand = self.reduce_expression(operand)?;
                if let Some(value) = operand.known_integer() {
                    let ty = operand.ty()?.clone();
                    let folded = match self.storage_size(&ty).filter(|_| !self.is_iexpr(&ty)) {
                        Some(size) => !value & ((1i128 << (8 * size)) - 1),
                        None => !value,
                    };
                    return Some(Expression::with_info(
                        ExpressionKind::IntegerLiteral(folded),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                    ));
                }
                self.passthrough_unary(op, operand, span)
            }
            UnaryOp::LogicalNegation => {
                let operand = self.reduce_expression(operand)?;
                if let Some(value) = operand.known_boolean() {
                    return Some(Expression::with_info(
                        ExpressionKind::BooleanLiteral(!value),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, self.bool_type()),
                    ));
                }
                let ty = operand.ty()?.storage_element().clone();
                if ty.resolved_def() != Some(self.builtins.bool_type)
                    && !matches!(
                        operand.kind,
                        ExpressionKind::Binary { .. } | ExpressionKind::ResolvedIdentifier { .. }
                    )
                {
                    self.report.error(Diagnostic::error(
                        span,
                        "logical negation requires a boolean operand",
                    ));
                    return None;
                }
                Some(Expression::with_info(
                    ExpressionKind::Unary {
                        op: UnaryOp::LogicalNegation,
                        operand: Box::new(operand),
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::RunTime, self.bool_type()),
                ))
            }
            UnaryOp::LowByte | UnaryOp::HighByte | UnaryOp::BankByte => {
                let operand = self.reduce_expression(operand)?;
                let shift = match op {
                    UnaryOp::LowByte => 0,
                    UnaryOp::HighByte => 8,
                    _ => 16,
                };
                let byte_index = shift / 8;
                if let Some(size) = operand.ty().and_then(|ty| self.storage_size(ty)) {
                    if byte_index >= size && !self.is_iexpr(operand.ty()?) {
                        self.report.error(Diagnostic::error(
                            span,
                            format!(
                                "byte {byte_index} is outside the {size}-byte storage of '{}'",
                                operand.describe()
                            ),
                        ));
                        return None;
                    }
                }
                if let Some(value) = operand.known_integer() {
                    let u8_ty =
                        TypeExpression::resolved(self.builtins.u8_type, vec!["u8".into()]);
                    return Some(Expression::with_info(
                        ExpressionKind::IntegerLiteral((value >> shift) & 0xFF),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, u8_ty),
                    ));
                }
                let context = operand.context().unwrap_or(EvaluationContext::RunTime);
                let u8_ty = TypeExpression::resolved(self.builtins.u8_type, vec!["u8".into()]);
                Some(Expression::with_info(
                    ExpressionKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                    ExpressionInfo::new(context, u8_ty),
                ))
            }
            UnaryOp::PreIncrement
            | UnaryOp::PostIncrement
            | UnaryOp::PreDecrement
            | UnaryOp::PostDecrement => {
                let operand = self.reduce_expression(operand)?;
                let info = operand.info.clone()?;
                if !info.qualifiers.lvalue || info.qualifiers.is_const {
                    self.report.error(Diagnostic::error(
                        span,
                        "increment and decrement require a writable l-value",
                    ));
                    return None;
                }
                Some(Expression::with_info(
                    ExpressionKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::RunTime, info.ty)
                        .with_qualifiers(info.qualifiers),
                ))
            }
        }
    }

    fn passthrough_unary(
        &mut self,
        op: UnaryOp,
        operand: Expression,
        span: Span,
    ) -> Option<Expression> {
        let info = operand.info.clone()?;
        let context = info.context.max(EvaluationContext::LinkTime);
        Some(Expression::with_info(
            ExpressionKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
            ExpressionInfo::new(context, info.ty),
        ))
    }

    /// `&expr`: compile-time integer when the location is already assigned,
    /// a link-time node otherwise.
    pub(super) fn address_of_expression(
        &mut self,
        operand: &Expression,
        far: bool,
        span: Span,
    ) -> Option<Expression> {
        // `& *ptr` cancels to the pointer value.
        if let ExpressionKind::Unary {
            op: UnaryOp::Indirection,
            operand: inner,
        } = &operand.kind
        {
            return Some((**inner).clone());
        }

        let Some(def) = operand.resolved_def() else {
            self.report.error(Diagnostic::error(
                span,
                format!("cannot take the address of '{}'", operand.describe()),
            ));
            return None;
        };

        match &self.defs.get(def).kind {
            DefKind::Var(var) => {
                let element = var
                    .resolved_type
                    .clone()
                    .unwrap_or_else(TypeExpression::unit);
                let qualifiers = PointerQualifiers {
                    is_const: var.qualifiers.is_const,
                    is_writeonly: var.qualifiers.is_writeonly,
                    is_far: far,
                };
                let ty = self.pointer_type(element.storage_element().clone(), qualifiers);
                match var.address.and_then(|address| address.absolute) {
                    Some(address) => Some(Expression::with_info(
                        ExpressionKind::IntegerLiteral(address as i128),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                    )),
                    None => Some(Expression::with_info(
                        ExpressionKind::Unary {
                            op: if far {
                                UnaryOp::FarAddressOf
                            } else {
                                UnaryOp::AddressOf
                            },
                            operand: Box::new(operand.clone()),
                        },
                        span,
                        ExpressionInfo::new(EvaluationContext::LinkTime, ty),
                    )),
                }
            }
            DefKind::Func(func) => {
                if func.inlined {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "cannot take the address of inline func '{}'",
                            self.defs.name(def)
                        ),
                    ));
                    return None;
                }
                let ty = operand.ty()?.clone();
                match func.address.and_then(|address| address.absolute) {
                    Some(address) => Some(Expression::with_info(
                        ExpressionKind::IntegerLiteral(address as i128),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, ty),
                    )),
                    None => Some(Expression::with_info(
                        ExpressionKind::Unary {
                            op: if far {
                                UnaryOp::FarAddressOf
                            } else {
                                UnaryOp::AddressOf
                            },
                            operand: Box::new(operand.clone()),
                        },
                        span,
                        ExpressionInfo::new(EvaluationContext::LinkTime, ty),
                    )),
                }
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    format!("cannot take the address of '{}'", operand.describe()),
                ));
                None
            }
        }
    }

    /// Add a byte offset to an address expression, masked to pointer width.
    fn offset_address(
        &mut self,
        address: Expression,
        offset: usize,
        span: Span,
    ) -> Option<Expression> {
        if offset == 0 {
            return Some(address);
        }
        let ty = address.ty()?.clone();
        if let Some(base) = address.known_integer() {
            let masked = (base + offset as i128) & self.pointer_mask(&ty);
            return Some(Expression::with_info(
                ExpressionKind::IntegerLiteral(masked),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, ty),
            ));
        }
        let offset = Expression::with_info(
            ExpressionKind::IntegerLiteral(offset as i128),
            span,
            ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
        );
        Some(Expression::with_info(
            ExpressionKind::Binary {
                op: BinaryOp::Addition,
                left: Box::new(address),
                right: Box::new(offset),
            },
            span,
            ExpressionInfo::new(EvaluationContext::LinkTime, ty),
        ))
    }

    fn pointer_mask(&self, ty: &TypeExpression) -> i128 {
        let far = matches!(
            ty.storage_element(),
            TypeExpression::Pointer { qualifiers, .. } if qualifiers.is_far
        );
        let def = if far {
            self.platform.far_pointer_sized_type()
        } else {
            self.platform.pointer_sized_type()
        };
        let size = self
            .defs
            .as_integer_type(def)
            .map(|int| int.size)
            .unwrap_or(2);
        (1i128 << (8 * size)) - 1
    }

    fn reduce_address_reserve(
        &mut self,
        operand: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let Some(owner) = self.reserved_constant_owner() else {
            self.report.error(Diagnostic::error(
                span,
                "'@' can only reserve storage inside a variable initializer",
            ));
            return None;
        };

        let reduced = self.reduce_expression(operand)?;
        if reduced.context() == Some(EvaluationContext::RunTime) {
            self.report.error(Diagnostic::error(
                span,
                "'@' requires a compile-time or link-time value",
            ));
            return None;
        }

        // An untyped integer picks the smallest unsigned type it fits in.
        let element = {
            let ty = reduced.ty()?.clone();
            if self.is_iexpr(&ty) {
                let value = reduced.known_integer().unwrap_or(0);
                let candidates = [
                    self.builtins.u8_type,
                    self.builtins.u16_type,
                    self.builtins.u24_type,
                    self.builtins.u32_type,
                ];
                let mut chosen = None;
                for candidate in candidates {
                    let int = self.defs.as_integer_type(candidate)?;
                    if value >= int.min && value <= int.max {
                        chosen = Some(candidate);
                        break;
                    }
                }
                let Some(chosen) = chosen else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!("value {value} is too large for reserved storage"),
                    ));
                    return None;
                };
                TypeExpression::resolved(chosen, vec![self.defs.name(chosen).to_string()])
            } else {
                ty
            }
        };

        let initializer = self.narrow_expression(&reduced, &element, span)?;
        let Some(size) = self.storage_size(&element) else {
            self.report.error(Diagnostic::error(
                span,
                format!("'{}' has no known storage size", element.describe()),
            ));
            return None;
        };

        let owner_name = self.defs.name(owner).to_string();
        let index = self
            .defs
            .as_var(owner)
            .map(|var| var.nested_constants.len())
            .unwrap_or(0);
        let scope = self.current_scope();
        let nested = self.defs.add(Def {
            name: format!("${owner_name}$reserved{index}"),
            decl_span: span,
            scope,
            kind: DefKind::Var(VarDef {
                qualifiers: crate::ast::Qualifiers::constant(),
                resolved_type: Some(element.clone()),
                storage_size: Some(size),
                initializer: Some(initializer),
                ..VarDef::default()
            }),
        });
        if let Some(owner_var) = self.defs.as_var_mut(owner) {
            owner_var.nested_constants.push(nested);
        }

        let qualifiers = PointerQualifiers {
            is_const: true,
            is_writeonly: false,
            is_far: false,
        };
        let ty = self.pointer_type(element, qualifiers);
        Some(Expression::with_info(
            ExpressionKind::Unary {
                op: UnaryOp::AddressOf,
                operand: Box::new(Expression::with_info(
                    ExpressionKind::ResolvedIdentifier {
                        def: nested,
                        pieces: vec![format!("${owner_name}$reserved{index}")],
                    },
                    span,
                    ExpressionInfo::new(EvaluationContext::LinkTime, ty.clone()),
                )),
            },
            span,
            ExpressionInfo::new(EvaluationContext::LinkTime, ty),
        ))
    }

    // --- calls -------------------------------------------------------------

    fn reduce_call(
        &mut self,
        inlined: bool,
        function: &Expression,
        arguments: &[Expression],
        span: Span,
    ) -> Option<Expression> {
        // Dotted or plain identifiers resolve to a definition first; other
        // callees (e.g. dereferenced function pointers) reduce as values.
        let callee_def = match &function.kind {
            ExpressionKind::Identifier(pieces) => {
                let (def, last) = self.resolve_identifier(pieces, function.span)?;
                if last + 1 != pieces.len() {
                    self.report.error(Diagnostic::error(
                        function.span,
                        format!("'{}' is not callable", pieces.join(".")),
                    ));
                    return None;
                }
                Some(def)
            }
            ExpressionKind::ResolvedIdentifier { def, .. } => Some(*def),
            _ => None,
        };

        if let Some(def) = callee_def {
            if def == self.builtins.has_def || def == self.builtins.get_def {
                return self.reduce_define_query(def, arguments, span);
            }

            match &self.defs.get(def).kind {
                DefKind::Let(let_def) => {
                    return self.reduce_let_call(def, let_def.clone(), arguments, span);
                }
                DefKind::Func(_) => {
                    return self.reduce_func_call(def, inlined, arguments, span);
                }
                DefKind::BuiltinLoadIntrinsic(intrinsic) => {
                    let ty = TypeExpression::resolved(
                        intrinsic.ty,
                        vec![self.defs.name(intrinsic.ty).to_string()],
                    );
                    let function = self.reduce_resolved_identifier(def, function.span)?;
                    let arguments = arguments
                        .iter()
                        .map(|argument| self.reduce_expression(argument))
                        .collect::<Option<Vec<_>>>()?;
                    return Some(Expression::with_info(
                        ExpressionKind::Call {
                            inlined,
                            function: Box::new(function),
                            arguments,
                        },
                        span,
                        ExpressionInfo::new(EvaluationContext::RunTime, ty),
                    ));
                }
                DefKind::BuiltinVoidIntrinsic => {
                    let function = self.reduce_resolved_identifier(def, function.span)?;
                    let arguments = arguments
                        .iter()
                        .map(|argument| self.reduce_expression(argument))
                        .collect::<Option<Vec<_>>>()?;
                    return Some(Expression::with_info(
                        ExpressionKind::Call {
                            inlined,
                            function: Box::new(function),
                            arguments,
                        },
                        span,
                        ExpressionInfo::new(EvaluationContext::RunTime, TypeExpression::unit()),
                    ));
                }
                kind => {
                    self.report.error(Diagnostic::error(
                        function.span,
                        format!(
                            "{} '{}' is not callable",
                            kind.category(),
                            self.defs.name(def)
                        ),
                    ));
                    return None;
                }
            }
        }

        let function = self.reduce_expression(function)?;
        let ty = function.ty()?.storage_element().clone();
        let TypeExpression::Function { return_type, .. } = ty else {
            self.report.error(Diagnostic::error(
                function.span,
                format!("'{}' is not callable", function.describe()),
            ));
            return None;
        };
        let arguments = arguments
            .iter()
            .map(|argument| self.reduce_expression(argument))
            .collect::<Option<Vec<_>>>()?;
        Some(Expression::with_info(
            ExpressionKind::Call {
                inlined,
                function: Box::new(function),
                arguments,
            },
            span,
            ExpressionInfo::new(EvaluationContext::RunTime, *return_type),
        ))
    }

    fn reduce_define_query(
        &mut self,
        def: DefId,
        arguments: &[Expression],
        span: Span,
    ) -> Option<Expression> {
        let is_hasdef = def == self.builtins.has_def;
        let expected = if is_hasdef { 1 } else { 2 };
        if arguments.len() != expected {
            self.report.error(Diagnostic::error(
                span,
                format!(
                    "'{}' expects {expected} argument(s), found {}",
                    self.defs.name(def),
                    arguments.len()
                ),
            ));
            return None;
        }

        let name = self.reduce_expression(&arguments[0])?;
        let ExpressionKind::StringLiteral(bytes) = &name.kind else {
            self.report.error(Diagnostic::error(
                name.span,
                "the define name must be a compile-time string",
            ));
            return None;
        };
        let key = String::from_utf8_lossy(bytes).into_owned();

        if is_hasdef {
            let value = self.builtins.defines.contains_key(&key);
            return Some(Expression::with_info(
                ExpressionKind::BooleanLiteral(value),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, self.bool_type()),
            ));
        }

        match self.builtins.defines.get(&key).cloned() {
            Some(expr) => self.reduce_expression(&expr),
            None => self.reduce_expression(&arguments[1]),
        }
    }

    fn reduce_let_call(
        &mut self,
        def: DefId,
        let_def: LetDef,
        arguments: &[Expression],
        span: Span,
    ) -> Option<Expression> {
        let name = self.defs.name(def).to_string();
        if arguments.len() != let_def.parameters.len() {
            self.report.error(Diagnostic::error(
                span,
                format!(
                    "let expression '{name}' expects {} argument(s), found {}",
                    let_def.parameters.len(),
                    arguments.len()
                ),
            ));
            return None;
        }

        // Arguments reduce in the caller's scope before the binding scope
        // shadows anything.
        let reduced_arguments = arguments
            .iter()
            .map(|argument| self.reduce_expression(argument))
            .collect::<Option<Vec<_>>>()?;

        let decl_scope = self.defs.get(def).scope;
        let binding_scope = self
            .scopes
            .create(Some(decl_scope), format!("let {name} call"));
        for (parameter, argument) in let_def.parameters.iter().zip(reduced_arguments) {
            let bound = self.defs.add(Def {
                name: parameter.clone(),
                decl_span: span,
                scope: binding_scope,
                kind: DefKind::Let(LetDef {
                    parameters: Vec::new(),
                    body: argument,
                }),
            });
            self.scopes.declare(binding_scope, parameter, bound);
        }

        if !self.push_let(&name, span) {
            return None;
        }
        self.enter_scope(binding_scope);
        let result = self.reduce_expression(&let_def.body);
        self.exit_scope();
        self.pop_let();
        result
    }

    fn reduce_func_call(
        &mut self,
        def: DefId,
        inlined: bool,
        arguments: &[Expression],
        span: Span,
    ) -> Option<Expression> {
        let (parameters, return_type, is_inline_func) = {
            let func = self.defs.as_func(def)?;
            (
                func.parameters.clone(),
                func.resolved_return_type
                    .clone()
                    .unwrap_or_else(TypeExpression::unit),
                func.inlined,
            )
        };

        if arguments.len() != parameters.len() {
            self.report.error(Diagnostic::error(
                span,
                format!(
                    "function '{}' expects {} argument(s), found {}",
                    self.defs.name(def),
                    parameters.len(),
                    arguments.len()
                ),
            ));
            return None;
        }

        let mut narrowed = Vec::with_capacity(arguments.len());
        for (argument, parameter) in arguments.iter().zip(&parameters) {
            let parameter_type = self
                .defs
                .as_var(*parameter)
                .and_then(|var| var.resolved_type.clone());
            let reduced = self.reduce_expression(argument)?;
            let narrowed_argument = match parameter_type {
                Some(parameter_type) => {
                    self.narrow_expression(&reduced, &parameter_type, argument.span)?
                }
                None => reduced,
            };
            narrowed.push(narrowed_argument);
        }

        let function = self.reduce_resolved_identifier(def, span)?;
        Some(Expression::with_info(
            ExpressionKind::Call {
                inlined: inlined || is_inline_func,
                function: Box::new(function),
                arguments: narrowed,
            },
            span,
            ExpressionInfo::new(EvaluationContext::RunTime, return_type),
        ))
    }

    // --- casts -------------------------------------------------------------

    fn reduce_cast(
        &mut self,
        operand: &Expression,
        target: &TypeExpression,
        span: Span,
    ) -> Option<Expression> {
        let operand = self.reduce_expression(operand)?;
        let target = self.reduce_type(target, span)?;
        let source = operand.ty()?.storage_element().clone();

        // Compile-time folds.
        if let Some(value) = operand.known_integer() {
            let folded = match self.storage_size(&target).filter(|_| !self.is_iexpr(&target)) {
                Some(size) => {
                    let mask = (1i128 << (8 * size)) - 1;
                    let mut folded = value & mask;
                    // Sign-extend into signed targets.
                    if let Some(int) = target
                        .storage_element()
                        .resolved_def()
                        .and_then(|def| self.defs.as_integer_type(def))
                    {
                        if int.min < 0 && folded > int.max {
                            folded -= mask + 1;
                        }
                    }
                    folded
                }
                None => value,
            };
            return Some(Expression::with_info(
                ExpressionKind::IntegerLiteral(folded),
                span,
                ExpressionInfo::new(EvaluationContext::CompileTime, target),
            ));
        }
        if let Some(value) = operand.known_boolean() {
            // Booleans cast to 0 or 1 in any sized integer target.
            if self.storage_size(&target).is_some() {
                return Some(Expression::with_info(
                    ExpressionKind::IntegerLiteral(value as i128),
                    span,
                    ExpressionInfo::new(EvaluationContext::CompileTime, target),
                ));
            }
        }

        // Otherwise a cast reinterprets storage; the sizes must agree.
        let source_size = self.storage_size(&source);
        let target_size = self.storage_size(&target);
        if source_size.is_some() && source_size == target_size {
            let mut converted = operand.clone();
            if let Some(info) = &mut converted.info {
                info.ty = target;
            }
            return Some(converted);
        }

        self.report.error(Diagnostic::error(
            span,
            format!(
                "cannot cast '{}' to '{}'",
                source.describe(),
                target.describe()
            ),
        ));
        None
    }

    // --- sequences and comprehensions -------------------------------------

    /// Enumerate a compile-time sequence (inclusive range, array, or string)
    /// as a list of reduced element expressions.
    pub(super) fn sequence_elements(&mut self, sequence: &Expression) -> Option<Vec<Expression>> {
        match &sequence.kind {
            ExpressionKind::RangeLiteral { start, end, step } => {
                let start = start.known_integer()?;
                let end = end.known_integer()?;
                let step = match step {
                    Some(step) => step.known_integer()?,
                    None => 1,
                };
                let mut elements = Vec::new();
                let mut value = start;
                loop {
                    if (step > 0 && value > end) || (step < 0 && value < end) {
                        break;
                    }
                    elements.push(Expression::with_info(
                        ExpressionKind::IntegerLiteral(value),
                        sequence.span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
                    ));
                    value += step;
                }
                Some(elements)
            }
            ExpressionKind::ArrayLiteral(items) => Some(items.clone()),
            ExpressionKind::StringLiteral(bytes) => Some(
                bytes
                    .iter()
                    .map(|byte| {
                        Expression::with_info(
                            ExpressionKind::IntegerLiteral(*byte as i128),
                            sequence.span,
                            ExpressionInfo::new(
                                EvaluationContext::CompileTime,
                                self.iexpr_type(),
                            ),
                        )
                    })
                    .collect(),
            ),
            _ => {
                self.report.error(Diagnostic::error(
                    sequence.span,
                    "expected a compile-time sequence (range, array, or string)",
                ));
                None
            }
        }
    }

    fn reduce_array_comprehension(
        &mut self,
        name: &str,
        sequence: &Expression,
        body: &Expression,
        span: Span,
    ) -> Option<Expression> {
        let sequence = self.reduce_expression(sequence)?;
        let elements = self.sequence_elements(&sequence)?;

        let mut items: Vec<Expression> = Vec::with_capacity(elements.len());
        for element in elements {
            let binding_scope = self
                .scopes
                .create(Some(self.current_scope()), format!("comprehension {name}"));
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

            self.enter_scope(binding_scope);
            let reduced = self.reduce_expression(body);
            self.exit_scope();
            let reduced = reduced?;

            // Element types unify by narrowing into the first element's type.
            let item = match items.first().and_then(|first| first.ty().cloned()) {
                Some(first_ty) if !self.is_iexpr(&first_ty) => {
                    self.narrow_expression(&reduced, &first_ty, reduced.span)?
                }
                _ => reduced,
            };
            items.push(item);
        }

        Some(self.array_literal(items, span))
    }

    fn reduce_struct_literal(
        &mut self,
        type_expression: &TypeExpression,
        members: &IndexMap<String, Expression>,
        span: Span,
    ) -> Option<Expression> {
        let ty = self.reduce_type(type_expression, span)?;
        let Some(def) = ty.resolved_def() else {
            self.report
                .error(Diagnostic::error(span, "expected a struct or union type"));
            return None;
        };
        let DefKind::Struct(struct_def) = &self.defs.get(def).kind else {
            self.report
                .error(Diagnostic::error(span, "expected a struct or union type"));
            return None;
        };
        let kind = struct_def.kind;
        let declared: Vec<DefId> = struct_def.members.clone();

        match kind {
            StructKind::Struct => {
                // Every member must be provided, each exactly once.
                for member in &declared {
                    if !members.contains_key(self.defs.name(*member)) {
                        self.report.error(Diagnostic::error(
                            span,
                            format!(
                                "struct literal is missing member '{}'",
                                self.defs.name(*member)
                            ),
                        ));
                        return None;
                    }
                }
            }
            StructKind::Union => {
                if members.len() != 1 {
                    self.report.error(Diagnostic::error(
                        span,
                        "a union literal provides exactly one member",
                    ));
                    return None;
                }
            }
        }

        let mut reduced_members = IndexMap::new();
        for (member_name, value) in members {
            let member = declared
                .iter()
                .copied()
                .find(|member| self.defs.name(*member) == member_name);
            let Some(member) = member else {
                self.report.error(Diagnostic::error(
                    value.span,
                    format!("'{}' has no member '{member_name}'", ty.describe()),
                ));
                return None;
            };
            let member_type = match &self.defs.get(member).kind {
                DefKind::StructMember(m) => m.resolved_type.clone(),
                _ => None,
            };
            let reduced = self.reduce_expression(value)?;
            let reduced = match member_type {
                Some(member_type) => self.narrow_expression(&reduced, &member_type, value.span)?,
                None => reduced,
            };
            reduced_members.insert(member_name.clone(), reduced);
        }

        let context = reduced_members
            .values()
            .filter_map(Expression::context)
            .max()
            .unwrap_or(EvaluationContext::CompileTime);
        Some(Expression::with_info(
            ExpressionKind::StructLiteral {
                type_expression: ty.clone(),
                members: reduced_members,
            },
            span,
            ExpressionInfo::new(context, ty),
        ))
    }
}

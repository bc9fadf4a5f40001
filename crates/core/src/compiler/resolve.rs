use crate::bank::{Bank, BankId, BankKind};
use crate::def::{DefId, DefKind};
use crate::diag::Diagnostic;
use crate::expr::{
    EvaluationContext, Expression, ExpressionInfo, ExpressionKind, ValueQualifiers,
};
use crate::span::Span;
use crate::types::{PointerQualifiers, TypeExpression};

use super::Compiler;

impl<'a> Compiler<'a> {
    /// Phase 2: canonicalize every declared type, resolve enum member values
    /// and struct layouts, and materialize banks.
    ///
    /// Definitions are visited in creation order, so a type alias that
    /// mentions a later alias fails with an unresolved-alias error rather
    /// than recursing.
    pub(super) fn resolve_definition_types(&mut self) {
        let count = self.defs.len();
        for index in 0..count {
            let id = DefId(index as u32);
            match &self.defs.get(id).kind {
                DefKind::TypeAlias(_) => self.resolve_type_alias(id),
                DefKind::Var(_) => self.resolve_var_type(id),
                DefKind::Func(_) => self.resolve_func_signature(id),
                DefKind::Enum(_) => self.resolve_enum(id),
                DefKind::Struct(_) => self.resolve_struct(id),
                DefKind::Bank(_) => self.resolve_bank(id),
                _ => {}
            }
        }
    }

    fn resolve_type_alias(&mut self, id: DefId) {
        let (scope, span, expr) = {
            let def = self.defs.get(id);
            let DefKind::TypeAlias(alias) = &def.kind else {
                return;
            };
            if alias.resolved_type.is_some() {
                return;
            }
            (def.scope, def.decl_span, alias.type_expression.clone())
        };

        self.enter_scope(scope);
        let resolved = self.reduce_type(&expr, span);
        self.exit_scope();

        if let DefKind::TypeAlias(alias) = &mut self.defs.get_mut(id).kind {
            alias.resolved_type = resolved;
        }
    }

    fn resolve_var_type(&mut self, id: DefId) {
        let (scope, span, expr) = {
            let def = self.defs.get(id);
            let DefKind::Var(var) = &def.kind else {
                return;
            };
            if var.resolved_type.is_some() {
                return;
            }
            let Some(expr) = var.type_expression.clone() else {
                // Type inferred from the initializer during storage
                // reservation.
                return;
            };
            (def.scope, def.decl_span, expr)
        };

        self.enter_scope(scope);
        let resolved = self.reduce_type(&expr, span);
        self.exit_scope();

        if let Some(var) = self.defs.as_var_mut(id) {
            var.resolved_type = resolved;
        }
    }

    fn resolve_func_signature(&mut self, id: DefId) {
        let (scope, span, expr) = {
            let def = self.defs.get(id);
            let DefKind::Func(func) = &def.kind else {
                return;
            };
            if func.resolved_return_type.is_some() {
                return;
            }
            (def.scope, def.decl_span, func.return_type_expression.clone())
        };

        let resolved = match expr {
            Some(expr) => {
                self.enter_scope(scope);
                let resolved = self.reduce_type(&expr, span);
                self.exit_scope();
                resolved
            }
            None => Some(TypeExpression::unit()),
        };

        if let Some(func) = self.defs.as_func_mut(id) {
            func.resolved_return_type = resolved;
        }
    }

    fn resolve_enum(&mut self, id: DefId) {
        let (span, decl_scope, underlying_expr, members, scope) = {
            let def = self.defs.get(id);
            let DefKind::Enum(enum_def) = &def.kind else {
                return;
            };
            if enum_def.resolved_underlying_type.is_some() {
                return;
            }
            (
                def.decl_span,
                def.scope,
                enum_def.underlying_type_expression.clone(),
                enum_def.members.clone(),
                enum_def.scope,
            )
        };

        let underlying = match &underlying_expr {
            Some(expr) => {
                self.enter_scope(decl_scope);
                let underlying = self.reduce_type(expr, span);
                self.exit_scope();
                underlying
            }
            // An enum without a declared underlying type stays a
            // compile-time value and cannot be stored.
            None => None,
        };
        let range = underlying
            .as_ref()
            .and_then(TypeExpression::resolved_def)
            .and_then(|def| self.defs.as_integer_type(def).copied());

        if let DefKind::Enum(enum_def) = &mut self.defs.get_mut(id).kind {
            enum_def.resolved_underlying_type = underlying;
        }

        let enum_name = self.defs.name(id).to_string();
        self.enter_scope(scope);
        for member in members {
            let (member_span, base, offset) = {
                let DefKind::EnumMember(m) = &self.defs.get(member).kind else {
                    continue;
                };
                (self.defs.get(member).decl_span, m.base_expression.clone(), m.offset)
            };

            let base_value = match base {
                Some(expr) => {
                    let Some(reduced) = self.reduce_expression(&expr) else {
                        continue;
                    };
                    match reduced.known_integer() {
                        Some(value) => value,
                        None => {
                            self.report.error(Diagnostic::error(
                                member_span,
                                "enum member value must be a compile-time integer",
                            ));
                            continue;
                        }
                    }
                }
                None => 0,
            };
            let value = base_value + offset as i128;

            if let Some(range) = range {
                if value < range.min || value > range.max {
                    self.report.error(Diagnostic::error(
                        member_span,
                        format!(
                            "enum member value {value} does not fit the underlying type of '{enum_name}'"
                        ),
                    ));
                    continue;
                }
            }

            let member_name = self.defs.name(member).to_string();
            let reduced = Expression::with_info(
                ExpressionKind::IntegerLiteral(value),
                member_span,
                ExpressionInfo::new(
                    EvaluationContext::CompileTime,
                    TypeExpression::resolved(id, vec![enum_name.clone(), member_name]),
                ),
            );
            if let DefKind::EnumMember(m) = &mut self.defs.get_mut(member).kind {
                m.reduced_expression = Some(reduced);
            }
        }
        self.exit_scope();
    }

    fn resolve_struct(&mut self, id: DefId) {
        let (kind, members) = {
            let def = self.defs.get(id);
            let DefKind::Struct(struct_def) = &def.kind else {
                return;
            };
            if struct_def.size.is_some() {
                return;
            }
            (struct_def.kind, struct_def.members.clone())
        };

        let mut offset = 0usize;
        let mut max_size = 0usize;
        let mut failed = false;
        for member in members {
            let (scope, member_span, expr) = {
                let def = self.defs.get(member);
                let DefKind::StructMember(m) = &def.kind else {
                    continue;
                };
                (def.scope, def.decl_span, m.type_expression.clone())
            };

            self.enter_scope(scope);
            let resolved = self.reduce_type(&expr, member_span);
            self.exit_scope();

            let size = resolved.as_ref().and_then(|ty| self.storage_size(ty));
            let Some(size) = size else {
                self.report.error(Diagnostic::error(
                    member_span,
                    format!(
                        "struct member '{}' has no known storage size",
                        self.defs.name(member)
                    ),
                ));
                failed = true;
                continue;
            };

            let member_offset = match kind {
                crate::ast::StructKind::Struct => {
                    let current = offset;
                    offset += size;
                    current
                }
                crate::ast::StructKind::Union => {
                    max_size = max_size.max(size);
                    0
                }
            };

            if let DefKind::StructMember(m) = &mut self.defs.get_mut(member).kind {
                m.resolved_type = resolved;
                m.offset = Some(member_offset);
            }
        }

        if failed {
            return;
        }
        let size = match kind {
            crate::ast::StructKind::Struct => offset,
            crate::ast::StructKind::Union => max_size,
        };
        if let DefKind::Struct(struct_def) = &mut self.defs.get_mut(id).kind {
            struct_def.size = Some(size);
        }
    }

    fn resolve_bank(&mut self, id: DefId) {
        let (scope, span, type_expr, address_expr) = {
            let def = self.defs.get(id);
            let DefKind::Bank(bank) = &def.kind else {
                return;
            };
            if bank.bank.is_some() {
                return;
            }
            (
                def.scope,
                def.decl_span,
                bank.type_expression.clone(),
                bank.address_expression.clone(),
            )
        };

        self.enter_scope(scope);
        let resolved = self.reduce_type(&type_expr, span);
        let origin = address_expr.and_then(|expr| {
            let reduced = self.reduce_expression(&expr)?;
            match reduced.known_integer() {
                Some(value) if value >= 0 => Some(value as u64),
                _ => {
                    self.report.error(Diagnostic::error(
                        span,
                        "bank address must be a non-negative compile-time integer",
                    ));
                    None
                }
            }
        });
        self.exit_scope();

        let Some(resolved) = resolved else {
            return;
        };

        // A bank's type is an array of one of the builtin bank element
        // types; the array length is its capacity.
        let (kind, capacity) = match &resolved {
            TypeExpression::Array { element, length } => {
                let kind = element
                    .resolved_def()
                    .and_then(|def| match &self.defs.get(def).kind {
                        DefKind::BuiltinBankType(bank_type) => Some(bank_type.kind),
                        _ => None,
                    });
                let capacity = length
                    .as_ref()
                    .and_then(|length| length.known_integer())
                    .and_then(|value| usize::try_from(value).ok());
                match (kind, capacity) {
                    (Some(kind), Some(capacity)) => (kind, capacity),
                    _ => {
                        self.report.error(Diagnostic::error(
                            span,
                            format!(
                                "bank '{}' must have a type like [vardata; SIZE]",
                                self.defs.name(id)
                            ),
                        ));
                        return;
                    }
                }
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    format!(
                        "bank '{}' must have a type like [vardata; SIZE]",
                        self.defs.name(id)
                    ),
                ));
                return;
            }
        };

        let pad_byte = if kind.stores_bytes() { 0xFF } else { 0x00 };
        let name = self.defs.name(id).to_string();
        let bank_id = BankId(self.banks.len() as u32);
        self.banks
            .push(Bank::new(name, kind, origin, capacity, pad_byte));

        if let DefKind::Bank(bank) = &mut self.defs.get_mut(id).kind {
            bank.resolved_type = Some(resolved);
            bank.bank = Some(bank_id);
        }
    }

    // --- type reduction ----------------------------------------------------

    /// Canonicalize a type expression: identifiers resolve to definitions,
    /// aliases substitute, `typeof` collapses to the operand's type, array
    /// lengths reduce to literals.
    pub fn reduce_type(&mut self, ty: &TypeExpression, span: Span) -> Option<TypeExpression> {
        match ty {
            TypeExpression::Identifier(pieces) => {
                let (def, last) = self.resolve_identifier(pieces, span)?;
                if last + 1 != pieces.len() {
                    self.report.error(Diagnostic::error(
                        span,
                        format!("'{}' does not name a type", pieces.join(".")),
                    ));
                    return None;
                }
                self.reduce_resolved_type(def, pieces.clone(), span)
            }
            TypeExpression::ResolvedIdentifier { def, pieces } => {
                self.reduce_resolved_type(*def, pieces.clone(), span)
            }
            TypeExpression::TypeOf(expr) => {
                let reduced = self.reduce_expression(expr)?;
                reduced.ty().cloned()
            }
            TypeExpression::Array { element, length } => {
                let element = self.reduce_type(element, span)?;
                let length = match length {
                    Some(length) => {
                        let reduced = self.reduce_expression(length)?;
                        match reduced.known_integer() {
                            Some(value) if value >= 0 => Some(Box::new(reduced)),
                            _ => {
                                self.report.error(Diagnostic::error(
                                    length.span,
                                    "array length must be a non-negative compile-time integer",
                                ));
                                return None;
                            }
                        }
                    }
                    None => None,
                };
                Some(TypeExpression::Array {
                    element: Box::new(element),
                    length,
                })
            }
            TypeExpression::Pointer {
                element,
                qualifiers,
            } => {
                let element = self.reduce_type(element, span)?;
                Some(TypeExpression::Pointer {
                    element: Box::new(element),
                    qualifiers: *qualifiers,
                })
            }
            TypeExpression::Function {
                far,
                parameters,
                return_type,
            } => {
                let parameters = parameters
                    .iter()
                    .map(|parameter| self.reduce_type(parameter, span))
                    .collect::<Option<Vec<_>>>()?;
                let return_type = self.reduce_type(return_type, span)?;
                Some(TypeExpression::Function {
                    far: *far,
                    parameters,
                    return_type: Box::new(return_type),
                })
            }
            TypeExpression::Tuple(elements) => {
                let elements = elements
                    .iter()
                    .map(|element| self.reduce_type(element, span))
                    .collect::<Option<Vec<_>>>()?;
                Some(TypeExpression::Tuple(elements))
            }
            TypeExpression::DesignatedStorage { element, holder } => {
                let element = self.reduce_type(element, span)?;
                let holder = self.reduce_expression(holder)?;
                let Some(info) = &holder.info else {
                    return None;
                };
                if !info.qualifiers.lvalue
                    || info.qualifiers.is_const
                    || info.qualifiers.is_writeonly
                {
                    self.report.error(Diagnostic::error(
                        holder.span,
                        "designated storage must be a writable l-value",
                    ));
                    return None;
                }
                let holder_size = self.storage_size(&info.ty);
                let element_size = self.storage_size(&element);
                if holder_size != element_size || element_size.is_none() {
                    self.report.error(Diagnostic::error(
                        holder.span,
                        format!(
                            "designated storage holder has a different size than '{}'",
                            element.describe()
                        ),
                    ));
                    return None;
                }
                Some(TypeExpression::DesignatedStorage {
                    element: Box::new(element),
                    holder: Box::new(holder),
                })
            }
        }
    }

    fn reduce_resolved_type(
        &mut self,
        def: DefId,
        pieces: Vec<String>,
        span: Span,
    ) -> Option<TypeExpression> {
        match &self.defs.get(def).kind {
            DefKind::TypeAlias(alias) => match &alias.resolved_type {
                Some(resolved) => Some(resolved.clone()),
                None => {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "type alias '{}' is used before its definition is resolved",
                            self.defs.name(def)
                        ),
                    ));
                    None
                }
            },
            kind if kind.is_type() => Some(TypeExpression::resolved(def, pieces)),
            kind => {
                self.report.error(Diagnostic::error(
                    span,
                    format!(
                        "expected a type, but '{}' is a {}",
                        self.defs.name(def),
                        kind.category()
                    ),
                ));
                None
            }
        }
    }

    // --- storage size ------------------------------------------------------

    /// Bytes a value of this type occupies, if it can be stored at all.
    pub fn storage_size(&self, ty: &TypeExpression) -> Option<usize> {
        match ty {
            TypeExpression::ResolvedIdentifier { def, .. } => match &self.defs.get(*def).kind {
                DefKind::BuiltinIntegerType(int) => Some(int.size),
                DefKind::BuiltinBoolType => Some(1),
                DefKind::Enum(enum_def) => enum_def
                    .resolved_underlying_type
                    .as_ref()
                    .and_then(|underlying| self.storage_size(underlying)),
                DefKind::Struct(struct_def) => struct_def.size,
                DefKind::TypeAlias(alias) => alias
                    .resolved_type
                    .as_ref()
                    .and_then(|resolved| self.storage_size(resolved)),
                _ => None,
            },
            TypeExpression::Pointer { qualifiers, .. } => {
                let ty = if qualifiers.is_far {
                    self.platform.far_pointer_sized_type()
                } else {
                    self.platform.pointer_sized_type()
                };
                self.defs.as_integer_type(ty).map(|int| int.size)
            }
            TypeExpression::Function { far, .. } => {
                let ty = if *far {
                    self.platform.far_pointer_sized_type()
                } else {
                    self.platform.pointer_sized_type()
                };
                self.defs.as_integer_type(ty).map(|int| int.size)
            }
            TypeExpression::Tuple(elements) => {
                let mut total = 0usize;
                for element in elements {
                    total = total.checked_add(self.storage_size(element)?)?;
                }
                Some(total)
            }
            TypeExpression::Array { element, length } => {
                let element_size = self.storage_size(element)?;
                let length = length.as_ref()?.known_integer()?;
                let length = usize::try_from(length).ok()?;
                element_size.checked_mul(length)
            }
            TypeExpression::DesignatedStorage { element, .. } => self.storage_size(element),
            TypeExpression::Identifier(_) | TypeExpression::TypeOf(_) => None,
        }
    }

    // --- equivalence -------------------------------------------------------

    /// Structural type equality. `DesignatedStorage` wrappers are
    /// storage-compatible with anything of the same size.
    pub fn is_type_equivalent(&self, left: &TypeExpression, right: &TypeExpression) -> bool {
        if matches!(left, TypeExpression::DesignatedStorage { .. })
            || matches!(right, TypeExpression::DesignatedStorage { .. })
        {
            let left_size = self.storage_size(left);
            return left_size.is_some() && left_size == self.storage_size(right);
        }

        match (left, right) {
            (
                TypeExpression::ResolvedIdentifier { def: a, .. },
                TypeExpression::ResolvedIdentifier { def: b, .. },
            ) => a == b,
            (
                TypeExpression::Array {
                    element: a,
                    length: la,
                },
                TypeExpression::Array {
                    element: b,
                    length: lb,
                },
            ) => {
                self.is_type_equivalent(a, b)
                    && match (la, lb) {
                        (Some(la), Some(lb)) => la.known_integer() == lb.known_integer(),
                        (None, None) => true,
                        _ => false,
                    }
            }
            (
                TypeExpression::Pointer {
                    element: a,
                    qualifiers: qa,
                },
                TypeExpression::Pointer {
                    element: b,
                    qualifiers: qb,
                },
            ) => qa == qb && self.is_type_equivalent(a, b),
            (
                TypeExpression::Function {
                    far: fa,
                    parameters: pa,
                    return_type: ra,
                },
                TypeExpression::Function {
                    far: fb,
                    parameters: pb,
                    return_type: rb,
                },
            ) => {
                fa == fb
                    && pa.len() == pb.len()
                    && pa
                        .iter()
                        .zip(pb)
                        .all(|(a, b)| self.is_type_equivalent(a, b))
                    && self.is_type_equivalent(ra, rb)
            }
            (TypeExpression::Tuple(a), TypeExpression::Tuple(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|(a, b)| self.is_type_equivalent(a, b))
            }
            _ => false,
        }
    }

    // --- narrowing ---------------------------------------------------------

    pub fn is_iexpr(&self, ty: &TypeExpression) -> bool {
        ty.resolved_def() == Some(self.builtins.iexpr_type)
    }

    pub fn iexpr_type(&self) -> TypeExpression {
        TypeExpression::resolved(self.builtins.iexpr_type, vec!["iexpr".into()])
    }

    pub fn bool_type(&self) -> TypeExpression {
        TypeExpression::resolved(self.builtins.bool_type, vec!["bool".into()])
    }

    /// Range of a sized integer type (or enum underlying), for narrowing.
    fn integer_range(&self, ty: &TypeExpression) -> Option<(i128, i128)> {
        let def = ty.storage_element().resolved_def()?;
        self.defs.as_integer_type(def).map(|int| (int.min, int.max))
    }

    /// Implicitly convert `expr` to `target`, or report why it cannot be.
    /// The returned expression carries `target` as its type.
    pub fn narrow_expression(
        &mut self,
        expr: &Expression,
        target: &TypeExpression,
        span: Span,
    ) -> Option<Expression> {
        let info = expr.info.as_ref()?;
        let source = info.ty.clone();

        // Passing through designated storage on either side.
        let logical_target = target.storage_element().clone();

        if self.is_type_equivalent(&source, &logical_target)
            || self.is_type_equivalent(&source, target)
        {
            let mut converted = expr.clone();
            if let Some(info) = &mut converted.info {
                info.ty = target.clone();
            }
            return Some(converted);
        }

        // iexpr literal into a sized integer, when the value fits.
        if self.is_iexpr(&source) {
            if let Some((min, max)) = self.integer_range(&logical_target) {
                return match expr.known_integer() {
                    Some(value) if value >= min && value <= max => {
                        let mut converted = expr.clone();
                        if let Some(info) = &mut converted.info {
                            info.ty = target.clone();
                        }
                        Some(converted)
                    }
                    Some(value) => {
                        self.report.error(Diagnostic::error(
                            span,
                            format!(
                                "value {value} does not fit in type '{}'",
                                logical_target.describe()
                            ),
                        ));
                        None
                    }
                    // Link-time address arithmetic: the value is checked when
                    // it is finally encoded.
                    None => {
                        let mut converted = expr.clone();
                        if let Some(info) = &mut converted.info {
                            info.ty = target.clone();
                        }
                        Some(converted)
                    }
                };
            }
        }

        // Pointer qualifier adjustments.
        if let (
            TypeExpression::Pointer {
                element: source_element,
                qualifiers: source_quals,
            },
            TypeExpression::Pointer {
                element: target_element,
                qualifiers: target_quals,
            },
        ) = (&source, &logical_target)
        {
            let adds_access = (!source_quals.is_const || target_quals.is_const)
                && (!source_quals.is_writeonly || target_quals.is_writeonly);
            let far_ok = source_quals.is_far == target_quals.is_far
                || (source_quals.is_far && !target_quals.is_far);
            if adds_access && far_ok && self.is_type_equivalent(source_element, target_element) {
                let mut converted = expr.clone();
                if let Some(info) = &mut converted.info {
                    info.ty = target.clone();
                }
                return Some(converted);
            }
        }

        // Array of iexpr literals into a sized element type, element-wise.
        if let TypeExpression::Array {
            element: target_element,
            length: target_length,
        } = &logical_target
        {
            match &expr.kind {
                ExpressionKind::ArrayLiteral(items) => {
                    if let Some(target_length) =
                        target_length.as_ref().and_then(|l| l.known_integer())
                    {
                        if target_length != items.len() as i128 {
                            self.report.error(Diagnostic::error(
                                span,
                                format!(
                                    "expected {target_length} array elements, found {}",
                                    items.len()
                                ),
                            ));
                            return None;
                        }
                    }
                    let converted = items
                        .iter()
                        .map(|item| self.narrow_expression(item, target_element, item.span))
                        .collect::<Option<Vec<_>>>()?;
                    let length = Expression::with_info(
                        ExpressionKind::IntegerLiteral(converted.len() as i128),
                        span,
                        ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
                    );
                    let ty = TypeExpression::Array {
                        element: Box::new((**target_element).clone()),
                        length: Some(Box::new(length)),
                    };
                    let context = converted
                        .iter()
                        .filter_map(Expression::context)
                        .max()
                        .unwrap_or(EvaluationContext::CompileTime);
                    return Some(Expression::with_info(
                        ExpressionKind::ArrayLiteral(converted),
                        span,
                        ExpressionInfo::new(context, ty),
                    ));
                }
                ExpressionKind::StringLiteral(bytes) => {
                    let element_ok = target_element.resolved_def() == Some(self.builtins.u8_type);
                    let length_ok = match target_length.as_ref().and_then(|l| l.known_integer()) {
                        Some(length) => length == bytes.len() as i128,
                        None => true,
                    };
                    if element_ok && length_ok {
                        let mut converted = expr.clone();
                        if let Some(info) = &mut converted.info {
                            info.ty = self.u8_array_type(bytes.len(), span);
                        }
                        return Some(converted);
                    }
                }
                _ => {}
            }
        }

        self.report.error(Diagnostic::error(
            span,
            format!(
                "cannot implicitly convert '{}' (of type '{}') to type '{}'",
                expr.describe(),
                source.describe(),
                target.describe()
            ),
        ));
        None
    }

    pub fn u8_array_type(&self, length: usize, span: Span) -> TypeExpression {
        let length = Expression::with_info(
            ExpressionKind::IntegerLiteral(length as i128),
            span,
            ExpressionInfo::new(EvaluationContext::CompileTime, self.iexpr_type()),
        );
        TypeExpression::Array {
            element: Box::new(TypeExpression::resolved(
                self.builtins.u8_type,
                vec!["u8".into()],
            )),
            length: Some(Box::new(length)),
        }
    }

    /// Type for a pointer to `element` with the given qualifiers.
    pub fn pointer_type(
        &self,
        element: TypeExpression,
        qualifiers: PointerQualifiers,
    ) -> TypeExpression {
        TypeExpression::Pointer {
            element: Box::new(element),
            qualifiers,
        }
    }

    pub fn expression_qualifiers(expr: &Expression) -> ValueQualifiers {
        expr.info
            .as_ref()
            .map(|info| info.qualifiers)
            .unwrap_or_default()
    }
}

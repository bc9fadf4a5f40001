use crate::def::DefKind;
use crate::diag::Diagnostic;
use crate::expr::{Expression, ExpressionKind};
use crate::span::Span;
use crate::types::TypeExpression;

use super::Compiler;

impl<'a> Compiler<'a> {
    /// Serialize a fully reduced initializer into little-endian bytes of
    /// exactly the type's storage size. Anything still symbolic at this
    /// point is not a constant initializer.
    pub(super) fn serialize_constant(
        &mut self,
        expr: &Expression,
        ty: &TypeExpression,
        out: &mut Vec<u8>,
        span: Span,
    ) -> bool {
        let ty = ty.storage_element();
        match &expr.kind {
            ExpressionKind::IntegerLiteral(value) => {
                let Some(size) = self.storage_size(ty) else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "integer initializer needs a sized type, found '{}'",
                            ty.describe()
                        ),
                    ));
                    return false;
                };
                let mask = (1i128 << (8 * size)) - 1;
                let masked = value & mask;
                for index in 0..size {
                    out.push(((masked >> (8 * index)) & 0xFF) as u8);
                }
                true
            }
            ExpressionKind::BooleanLiteral(value) => {
                out.push(*value as u8);
                true
            }
            ExpressionKind::StringLiteral(bytes) => {
                out.extend_from_slice(bytes);
                true
            }
            ExpressionKind::ArrayLiteral(items) => {
                let element = match ty {
                    TypeExpression::Array { element, .. } => (**element).clone(),
                    _ => self.iexpr_type(),
                };
                for item in items {
                    if !self.serialize_constant(item, &element, out, item.span) {
                        return false;
                    }
                }
                true
            }
            ExpressionKind::TupleLiteral(items) => {
                let elements = match ty {
                    TypeExpression::Tuple(elements) => elements.clone(),
                    _ => Vec::new(),
                };
                for (index, item) in items.iter().enumerate() {
                    let element = elements
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| self.iexpr_type());
                    if !self.serialize_constant(item, &element, out, item.span) {
                        return false;
                    }
                }
                true
            }
            ExpressionKind::StructLiteral { members, .. } => {
                self.serialize_struct_literal(expr, members, ty, out, span)
            }
            ExpressionKind::ResolvedIdentifier { def, .. } => {
                let DefKind::Func(func) = &self.defs.get(*def).kind else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "initializer '{}' is not a compile-time constant",
                            expr.describe()
                        ),
                    ));
                    return false;
                };
                if func.inlined {
                    self.report.error(Diagnostic::error(
                        span,
                        format!(
                            "inline func '{}' has no address to store",
                            self.defs.name(*def)
                        ),
                    ));
                    return false;
                }
                let Some(address) = func.address.and_then(|address| address.absolute) else {
                    self.report.internal_error(
                        span,
                        format!(
                            "function '{}' has no address while serializing",
                            self.defs.name(*def)
                        ),
                    );
                    return false;
                };
                let pointer = if func.far {
                    self.platform.far_pointer_sized_type()
                } else {
                    self.platform.pointer_sized_type()
                };
                let size = self
                    .defs
                    .as_integer_type(pointer)
                    .map(|int| int.size)
                    .unwrap_or(2);
                for index in 0..size {
                    out.push(((address >> (8 * index)) & 0xFF) as u8);
                }
                true
            }
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    format!(
                        "initializer '{}' is not a compile-time constant",
                        expr.describe()
                    ),
                ));
                false
            }
        }
    }

    fn serialize_struct_literal(
        &mut self,
        expr: &Expression,
        members: &indexmap::IndexMap<String, Expression>,
        ty: &TypeExpression,
        out: &mut Vec<u8>,
        span: Span,
    ) -> bool {
        let Some(def) = ty.resolved_def() else {
            self.report.error(Diagnostic::error(
                span,
                format!("cannot serialize '{}' without a struct type", expr.describe()),
            ));
            return false;
        };
        let DefKind::Struct(struct_def) = &self.defs.get(def).kind else {
            self.report.error(Diagnostic::error(
                span,
                format!("cannot serialize '{}' without a struct type", expr.describe()),
            ));
            return false;
        };
        let kind = struct_def.kind;
        let total = struct_def.size;
        let declared = struct_def.members.clone();

        match kind {
            crate::ast::StructKind::Struct => {
                // Members serialize in declaration order, naturally packed.
                for member in declared {
                    let name = self.defs.name(member).to_string();
                    let member_type = match &self.defs.get(member).kind {
                        DefKind::StructMember(m) => m.resolved_type.clone(),
                        _ => None,
                    };
                    let (Some(value), Some(member_type)) = (members.get(&name), member_type)
                    else {
                        self.report.error(Diagnostic::error(
                            span,
                            format!("struct literal is missing member '{name}'"),
                        ));
                        return false;
                    };
                    let value = value.clone();
                    if !self.serialize_constant(&value, &member_type, out, value.span) {
                        return false;
                    }
                }
                true
            }
            crate::ast::StructKind::Union => {
                let start = out.len();
                let Some((name, value)) = members.first() else {
                    self.report.error(Diagnostic::error(
                        span,
                        "a union literal provides exactly one member",
                    ));
                    return false;
                };
                let member_type = declared
                    .iter()
                    .copied()
                    .find(|member| self.defs.name(*member) == name)
                    .and_then(|member| match &self.defs.get(member).kind {
                        DefKind::StructMember(m) => m.resolved_type.clone(),
                        _ => None,
                    });
                let Some(member_type) = member_type else {
                    self.report.error(Diagnostic::error(
                        span,
                        format!("union has no member '{name}'"),
                    ));
                    return false;
                };
                let value = value.clone();
                if !self.serialize_constant(&value, &member_type, out, value.span) {
                    return false;
                }
                // Zero-fill up to the widest member.
                if let Some(total) = total {
                    while out.len() - start < total {
                        out.push(0);
                    }
                }
                true
            }
        }
    }
}

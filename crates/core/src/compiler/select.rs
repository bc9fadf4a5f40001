use crate::def::DefKind;
use crate::diag::Diagnostic;
use crate::expr::{BinaryOp, EvaluationContext, Expression, ExpressionKind, UnaryOp};
use crate::platform::{InstructionType, Operand};
use crate::span::Span;
use crate::types::TypeExpression;

use super::Compiler;

impl<'a> Compiler<'a> {
    /// Pick the first platform instruction whose mode filter covers the
    /// active mode flags and whose patterns match the operands. On failure,
    /// the diagnostic lists every candidate signature next to the actual
    /// operand shape.
    pub(super) fn select_instruction(
        &mut self,
        instruction_type: &InstructionType,
        operands: &[Operand],
        span: Span,
    ) -> Option<usize> {
        let mode = self.mode_flags();
        let mut candidates = Vec::new();
        for (index, instruction) in self.platform.instructions().iter().enumerate() {
            if instruction.signature.instruction_type != *instruction_type {
                continue;
            }
            let mut captures = Vec::new();
            if instruction.signature.matches(mode, operands, &mut captures) {
                return Some(index);
            }
            candidates.push(instruction.signature.describe(&self.defs));
        }

        let shape = operands
            .iter()
            .map(|operand| operand.describe(&self.defs))
            .collect::<Vec<_>>()
            .join(", ");
        let mut diagnostic = Diagnostic::error(
            span,
            format!(
                "no instruction matches {} with operands ({shape})",
                instruction_type.describe()
            ),
        );
        if candidates.is_empty() {
            diagnostic = diagnostic.with_continued(format!(
                "the {} platform has no instruction for this operation",
                self.platform.name()
            ));
        } else {
            diagnostic = diagnostic.with_continued("candidates considered:");
            for candidate in candidates {
                diagnostic = diagnostic.with_continued(format!("  {candidate}"));
            }
        }
        self.report.error(diagnostic);
        None
    }

    /// Re-match a chosen instruction against (re-reduced) operands to pull
    /// out its encoding captures.
    pub(super) fn extract_captures(
        &mut self,
        instruction: usize,
        operands: &[Operand],
        span: Span,
    ) -> Option<Vec<i128>> {
        let mode = self.mode_flags();
        let mut captures = Vec::new();
        let matched = self.platform.instructions()[instruction]
            .signature
            .matches(mode, operands, &mut captures);
        if !matched {
            self.report.internal_error(
                span,
                "operands no longer match the selected instruction in the write pass",
            );
            return None;
        }
        Some(captures)
    }

    /// Turn a reduced expression into the operand tree instruction selection
    /// matches on. During the sizing pass (`sizing == true`), link-time
    /// values stand in as the platform's placeholder; during the write pass
    /// every address must already have folded.
    pub(super) fn operand_from_expression(
        &mut self,
        expr: &Expression,
        sizing: bool,
        span: Span,
    ) -> Option<Operand> {
        if expr.info.is_none() {
            self.report
                .internal_error(span, "operand expression was not reduced");
            return None;
        }

        // Link-time operator shapes (e.g. `&var + 1`) stand in as the
        // platform placeholder while sizing; identifiers are handled below,
        // where their own addresses (or placeholders) apply.
        if expr.context() == Some(EvaluationContext::LinkTime)
            && !matches!(expr.kind, ExpressionKind::ResolvedIdentifier { .. })
        {
            return if sizing {
                // Narrower link-time values (e.g. a low byte) mask down so
                // the same instruction is picked in both passes.
                let placeholder = self.platform.placeholder_value();
                let masked = match expr.ty().and_then(|ty| self.storage_size(ty)) {
                    Some(size) if size < 16 => placeholder & ((1i128 << (8 * size)) - 1),
                    _ => placeholder,
                };
                Some(Operand::Integer(masked))
            } else {
                self.report.internal_error(
                    span,
                    format!(
                        "link-time value '{}' did not resolve before encoding",
                        expr.describe()
                    ),
                );
                None
            };
        }

        match &expr.kind {
            ExpressionKind::IntegerLiteral(value) => Some(Operand::Integer(*value)),
            ExpressionKind::BooleanLiteral(value) => Some(Operand::Boolean(*value)),
            ExpressionKind::ResolvedIdentifier { def, .. } => {
                match &self.defs.get(*def).kind {
                    DefKind::BuiltinRegister(_) => Some(Operand::Register(*def)),
                    DefKind::Var(var) => {
                        let size = var.storage_size.unwrap_or(1);
                        let far = var.qualifiers.is_far;
                        let address = var.address.and_then(|address| address.absolute);
                        let inner = match address {
                            Some(address) => Operand::Integer(address as i128),
                            None if sizing => {
                                Operand::Integer(self.platform.placeholder_value())
                            }
                            None => {
                                let name = self.defs.name(*def).to_string();
                                self.report.internal_error(
                                    span,
                                    format!("variable '{name}' has no address in the write pass"),
                                );
                                return None;
                            }
                        };
                        Some(Operand::Dereference {
                            far,
                            size,
                            operand: Box::new(inner),
                        })
                    }
                    DefKind::Func(func) => {
                        if func.inlined {
                            let name = self.defs.name(*def).to_string();
                            self.report.error(Diagnostic::error(
                                span,
                                format!("inline func '{name}' has no address"),
                            ));
                            return None;
                        }
                        match func.address.and_then(|address| address.absolute) {
                            Some(address) => Some(Operand::Integer(address as i128)),
                            None if sizing => {
                                Some(Operand::Integer(self.platform.placeholder_value()))
                            }
                            None => {
                                let name = self.defs.name(*def).to_string();
                                self.report.internal_error(
                                    span,
                                    format!("function '{name}' has no address in the write pass"),
                                );
                                None
                            }
                        }
                    }
                    kind => {
                        let category = kind.category();
                        self.report.error(Diagnostic::error(
                            span,
                            format!("{category} cannot be an instruction operand"),
                        ));
                        None
                    }
                }
            }
            ExpressionKind::Unary { op, operand } => match op {
                UnaryOp::Indirection => {
                    let size = expr
                        .ty()
                        .and_then(|ty| self.storage_size(ty))
                        .unwrap_or(1);
                    let far = operand
                        .ty()
                        .map(|ty| {
                            matches!(
                                ty.storage_element(),
                                TypeExpression::Pointer { qualifiers, .. } if qualifiers.is_far
                            )
                        })
                        .unwrap_or(false);
                    let inner = self.operand_from_expression(operand, sizing, span)?;
                    Some(Operand::Dereference {
                        far,
                        size,
                        operand: Box::new(inner),
                    })
                }
                _ => {
                    let inner = self.operand_from_expression(operand, sizing, span)?;
                    Some(Operand::Unary {
                        op: *op,
                        operand: Box::new(inner),
                    })
                }
            },
            ExpressionKind::Binary { op, left, right } => match op {
                BinaryOp::Indexing => {
                    let element_size = expr
                        .ty()
                        .and_then(|ty| self.storage_size(ty))
                        .unwrap_or(1);
                    let far = left
                        .info
                        .as_ref()
                        .map(|info| info.qualifiers.is_far)
                        .unwrap_or(false);
                    let base = self.address_operand(left, sizing, span)?;
                    let subscript = self.operand_from_expression(right, sizing, span)?;
                    Some(Operand::Index {
                        far,
                        size: element_size,
                        operand: Box::new(base),
                        subscript: Box::new(subscript),
                        scale: element_size,
                    })
                }
                _ => {
                    let left = self.operand_from_expression(left, sizing, span)?;
                    let right = self.operand_from_expression(right, sizing, span)?;
                    Some(Operand::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    })
                }
            },
            _ => {
                self.report.error(Diagnostic::error(
                    span,
                    format!(
                        "'{}' cannot be used as an instruction operand",
                        expr.describe()
                    ),
                ));
                None
            }
        }
    }

    /// The bare address of an array-like operand, for indexed addressing.
    fn address_operand(
        &mut self,
        expr: &Expression,
        sizing: bool,
        span: Span,
    ) -> Option<Operand> {
        if let Some(def) = expr.resolved_def() {
            if let DefKind::Var(var) = &self.defs.get(def).kind {
                return match var.address.and_then(|address| address.absolute) {
                    Some(address) => Some(Operand::Integer(address as i128)),
                    None if sizing => Some(Operand::Integer(self.platform.placeholder_value())),
                    None => {
                        let name = self.defs.name(def).to_string();
                        self.report.internal_error(
                            span,
                            format!("variable '{name}' has no address in the write pass"),
                        );
                        None
                    }
                };
            }
        }
        self.operand_from_expression(expr, sizing, span)
    }
}

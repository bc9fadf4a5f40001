use crate::ast::BranchKind;
use crate::bank::BankId;
use crate::def::{Address, DefId};
use crate::diag::Diagnostic;
use crate::expr::Expression;
use crate::ir::{IrNode, OperandRoot};
use crate::platform::{InstructionType, Operand};
use crate::span::Span;

use super::Compiler;

impl<'a> Compiler<'a> {
    /// Phase 5: two-pass assembly. The sizing pass drops redundant jumps,
    /// measures every instruction, and pins labels and vars to addresses;
    /// the write pass re-reduces operands with those addresses known and
    /// commits bytes to the banks.
    pub(super) fn generate_code(&mut self) -> bool {
        self.drop_redundant_gotos();

        self.run_sizing_pass();
        if !self.report.validate() {
            return false;
        }

        for bank in &mut self.banks {
            bank.rewind();
        }

        self.run_write_pass();
        self.report.validate()
    }

    /// Peephole: a `goto L` that only skips over labels before reaching `L`
    /// is dead weight. This runs before sizing because removing a jump
    /// changes every later address.
    fn drop_redundant_gotos(&mut self) {
        let mut keep = vec![true; self.ir.len()];
        for index in 0..self.ir.len() {
            let IrNode::Code {
                instruction,
                operands,
                ..
            } = &self.ir[index]
            else {
                continue;
            };
            let signature = &self.platform.instructions()[*instruction].signature;
            if !matches!(
                signature.instruction_type,
                InstructionType::Branch(BranchKind::Goto | BranchKind::FarGoto)
            ) {
                continue;
            }
            if operands.len() != 1 {
                continue;
            }
            let Some(dest) = operands[0]
                .expression
                .as_ref()
                .and_then(Expression::resolved_def)
            else {
                continue;
            };

            let mut ahead = index + 1;
            while let Some(IrNode::Label(label)) = self.ir.get(ahead) {
                if *label == dest {
                    keep[index] = false;
                    break;
                }
                ahead += 1;
            }
        }

        let mut index = 0;
        self.ir.retain(|_| {
            let kept = keep[index];
            index += 1;
            kept
        });
    }

    fn run_sizing_pass(&mut self) {
        let mut bank_stack: Vec<Option<BankId>> = Vec::new();
        let mut current: Option<BankId> = None;

        for index in 0..self.ir.len() {
            match &self.ir[index] {
                IrNode::PushRelocation {
                    bank,
                    address,
                    span,
                } => {
                    let (bank, address, span) = (*bank, *address, *span);
                    bank_stack.push(current);
                    current = Some(bank);
                    if let Some(address) = address {
                        if let Err(err) = self.bank_mut(bank).absolute_seek(address) {
                            self.report.error(Diagnostic::error(span, err.to_string()));
                        }
                    }
                }
                IrNode::PopRelocation => {
                    current = bank_stack.pop().unwrap_or(None);
                }
                IrNode::Label(def) => {
                    let def = *def;
                    self.assign_label_address(def, current);
                }
                IrNode::Code {
                    instruction,
                    operands,
                    span,
                } => {
                    let instruction = *instruction;
                    let span = *span;
                    let operands: Vec<Operand> =
                        operands.iter().map(|root| root.operand.clone()).collect();
                    let Some(_captures) = self.extract_captures(instruction, &operands, span)
                    else {
                        continue;
                    };
                    let size = self.platform.instructions()[instruction].encoding.size();
                    let Some(bank) = current else {
                        self.report.error(Diagnostic::error(
                            span,
                            "instructions must be placed inside an 'in BANK' block",
                        ));
                        continue;
                    };
                    if let Err(err) = self.bank_mut(bank).reserve("instruction", size) {
                        self.report.error(Diagnostic::error(span, err.to_string()));
                    }
                }
                IrNode::Var(def) => {
                    let def = *def;
                    self.place_var(def, true);
                }
            }
        }
    }

    fn run_write_pass(&mut self) {
        let mut bank_stack: Vec<Option<BankId>> = Vec::new();
        let mut current: Option<BankId> = None;

        for index in 0..self.ir.len() {
            match &self.ir[index] {
                IrNode::PushRelocation {
                    bank,
                    address,
                    span,
                } => {
                    let (bank, address, span) = (*bank, *address, *span);
                    bank_stack.push(current);
                    current = Some(bank);
                    if let Some(address) = address {
                        if let Err(err) = self.bank_mut(bank).absolute_seek(address) {
                            self.report.error(Diagnostic::error(span, err.to_string()));
                        }
                    }
                }
                IrNode::PopRelocation => {
                    current = bank_stack.pop().unwrap_or(None);
                }
                IrNode::Label(def) => {
                    let def = *def;
                    self.check_label_address(def, current);
                }
                IrNode::Code {
                    instruction,
                    operands,
                    span,
                } => {
                    let instruction = *instruction;
                    let span = *span;
                    let roots: Vec<OperandRoot> = operands.clone();
                    self.write_code(instruction, roots, current, span);
                }
                IrNode::Var(def) => {
                    let def = *def;
                    self.place_var(def, false);
                }
            }
        }
    }

    fn assign_label_address(&mut self, def: DefId, current: Option<BankId>) {
        let span = self.defs.get(def).decl_span;
        let Some(bank_id) = current else {
            self.report.error(Diagnostic::error(
                span,
                format!(
                    "label '{}' must be placed inside an 'in BANK' block",
                    self.defs.name(def)
                ),
            ));
            return;
        };
        let bank = self.bank(bank_id);
        let address = Address {
            absolute: bank.current_address(),
            relative: Some(bank.relative_position()),
            bank: Some(bank_id),
        };
        if let Some(func) = self.defs.as_func_mut(def) {
            func.address = Some(address);
        }
    }

    /// The write pass must see the cursor exactly where the sizing pass
    /// recorded each label; drift means the passes disagreed on a size.
    fn check_label_address(&mut self, def: DefId, current: Option<BankId>) {
        let span = self.defs.get(def).decl_span;
        let recorded = self.defs.as_func(def).and_then(|func| func.address);
        let Some(recorded) = recorded else {
            self.report.internal_error(
                span,
                format!("label '{}' was never sized", self.defs.name(def)),
            );
            return;
        };
        let Some(bank) = current else {
            return;
        };
        let cursor = self.bank(bank).relative_position();
        if recorded.bank != Some(bank) || recorded.relative != Some(cursor) {
            self.report.internal_error(
                span,
                format!(
                    "label '{}' drifted between passes (sized at {:?}, written at {cursor:#X})",
                    self.defs.name(def),
                    recorded.relative,
                ),
            );
        }
    }

    fn write_code(
        &mut self,
        instruction: usize,
        roots: Vec<OperandRoot>,
        current: Option<BankId>,
        span: Span,
    ) {
        let Some(bank_id) = current else {
            return;
        };

        // Re-reduce every expression-backed operand: link-time addresses are
        // all assigned now, so the trees fold to concrete values.
        let mut operands = Vec::with_capacity(roots.len());
        for root in &roots {
            let operand = match &root.expression {
                Some(expression) => {
                    let Some(reduced) = self.reduce_expression(expression) else {
                        return;
                    };
                    let Some(operand) = self.operand_from_expression(&reduced, false, span)
                    else {
                        return;
                    };
                    operand
                }
                None => root.operand.clone(),
            };
            operands.push(operand);
        }

        let Some(captures) = self.extract_captures(instruction, &operands, span) else {
            return;
        };
        let bank = self.bank(bank_id);
        let address = bank
            .current_address()
            .unwrap_or(bank.relative_position() as u64);
        let encoding = &self.platform.instructions()[instruction].encoding;
        let bytes = match encoding.encode(address, &captures) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.report.error(Diagnostic::error(span, err.to_string()));
                return;
            }
        };
        if let Err(err) = self.bank_mut(bank_id).write("instruction", &bytes) {
            self.report.error(Diagnostic::error(span, err.to_string()));
        }
    }

    /// Shared var handling for both passes. The sizing pass assigns the
    /// address and reserves the span; the write pass re-reduces the
    /// initializer and commits bytes (stored banks) or re-reserves (ram).
    fn place_var(&mut self, def: DefId, sizing: bool) {
        let span = self.defs.get(def).decl_span;
        let (size, address, explicit, initializer, resolved_type) = {
            let Some(var) = self.defs.as_var(def) else {
                return;
            };
            (
                var.storage_size,
                var.address,
                var.address_expression.is_some(),
                var.initializer.clone(),
                var.resolved_type.clone(),
            )
        };
        let Some(size) = size else {
            return;
        };
        let Some(address) = address else {
            return;
        };
        let description = format!("var '{}'", self.defs.name(def));

        if explicit {
            // Explicitly addressed: place out-of-line, restore the cursor
            // afterwards. Without a bank (memory-mapped IO) there is no
            // image space to claim.
            let (Some(absolute), Some(bank_id)) = (address.absolute, address.bank) else {
                return;
            };
            let saved = self.bank(bank_id).relative_position();
            if let Err(err) = self.bank_mut(bank_id).absolute_seek(absolute) {
                self.report.error(Diagnostic::error(span, err.to_string()));
                return;
            }
            self.commit_var(
                bank_id,
                size,
                sizing,
                initializer,
                resolved_type,
                &description,
                span,
            );
            self.bank_mut(bank_id).seek_relative(saved);
            return;
        }

        // Bank-allocated: the sizing pass pins the address at the cursor,
        // the write pass commits in the same stream position.
        let Some(bank_id) = address.bank else {
            return;
        };
        if sizing {
            let start = match self.bank_mut(bank_id).reserve(&description, size) {
                Ok(start) => start,
                Err(err) => {
                    self.report.error(Diagnostic::error(span, err.to_string()));
                    return;
                }
            };
            let absolute = self.bank(bank_id).origin.map(|origin| origin + start as u64);
            if let Some(var) = self.defs.as_var_mut(def) {
                var.address = Some(Address {
                    absolute,
                    relative: Some(start),
                    bank: Some(bank_id),
                });
            }
        } else {
            self.commit_var(
                bank_id,
                size,
                false,
                initializer,
                resolved_type,
                &description,
                span,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_var(
        &mut self,
        bank_id: BankId,
        size: usize,
        sizing: bool,
        initializer: Option<Expression>,
        resolved_type: Option<crate::types::TypeExpression>,
        description: &str,
        span: Span,
    ) {
        let stores = self.bank(bank_id).kind.stores_bytes();
        if sizing || !stores {
            if let Err(err) = self.bank_mut(bank_id).reserve(description, size) {
                self.report.error(Diagnostic::error(span, err.to_string()));
            }
            return;
        }

        let bytes = match (&initializer, &resolved_type) {
            (Some(initializer), Some(ty)) => {
                let Some(reduced) = self.reduce_expression(initializer) else {
                    return;
                };
                let ty = ty.clone();
                let Some(narrowed) = self.narrow_expression(&reduced, &ty, span) else {
                    return;
                };
                let mut bytes = Vec::with_capacity(size);
                if !self.serialize_constant(&narrowed, &ty, &mut bytes, span) {
                    return;
                }
                if bytes.len() != size {
                    self.report.internal_error(
                        span,
                        format!(
                            "{description} serialized to {} byte(s), expected {size}",
                            bytes.len()
                        ),
                    );
                    return;
                }
                bytes
            }
            _ => vec![0; size],
        };

        if let Err(err) = self.bank_mut(bank_id).write(description, &bytes) {
            self.report.error(Diagnostic::error(span, err.to_string()));
        }
    }
}

//! MOS 6502 platform: registers, the instruction pattern table, and the
//! comparison lowering used by the branch emitter.

use wizc_core::ast::{BranchKind, DistanceHint};
use wizc_core::def::DefId;
use wizc_core::expr::{BinaryOp, UnaryOp};
use wizc_core::platform::{
    FlagBranch, Instruction, InstructionEncoding, InstructionType, ModeAttribute, Operand,
    OperandPattern, Platform, PlatformRegistrar, TestAndBranch,
};

const UNSET: DefId = DefId(u32::MAX);

pub struct Mos6502 {
    a: DefId,
    x: DefId,
    y: DefId,
    zero: DefId,
    carry: DefId,
    negative: DefId,
    overflow: DefId,
    u16_type: DefId,
    u24_type: DefId,
    signed_types: Vec<DefId>,
    instructions: Vec<Instruction>,
}

impl Default for Mos6502 {
    fn default() -> Self {
        Self::new()
    }
}

impl Mos6502 {
    pub fn new() -> Self {
        Self {
            a: UNSET,
            x: UNSET,
            y: UNSET,
            zero: UNSET,
            carry: UNSET,
            negative: UNSET,
            overflow: UNSET,
            u16_type: UNSET,
            u24_type: UNSET,
            signed_types: Vec::new(),
            instructions: Vec::new(),
        }
    }

    fn flag_for_comparison(&self, op: BinaryOp) -> Option<Vec<FlagBranch>> {
        let success = |flag, value| FlagBranch {
            flag,
            value,
            on_success: true,
        };
        let skip = |flag, value| FlagBranch {
            flag,
            value,
            on_success: false,
        };
        Some(match op {
            BinaryOp::Equal => vec![success(self.zero, true)],
            BinaryOp::NotEqual => vec![success(self.zero, false)],
            // Unsigned ordering comes from the carry flag after CMP.
            BinaryOp::LessThan => vec![success(self.carry, false)],
            BinaryOp::GreaterThanOrEqual => vec![success(self.carry, true)],
            BinaryOp::GreaterThan => {
                vec![skip(self.zero, true), success(self.carry, true)]
            }
            BinaryOp::LessThanOrEqual => {
                vec![success(self.zero, true), success(self.carry, false)]
            }
            _ => return None,
        })
    }

    fn build_instructions(&mut self) {
        let imm8 = || OperandPattern::capture(OperandPattern::imm(0xFF));
        let addr16 = || OperandPattern::capture(OperandPattern::imm(0xFFFF));
        let mem8 = || OperandPattern::deref(1, addr16());
        let indexed8 = |index: DefId| OperandPattern::Index {
            far: false,
            size: 1,
            pattern: Box::new(addr16()),
            subscript: Box::new(OperandPattern::Register(index)),
        };
        let reg = OperandPattern::Register;
        let implied = |opcode: u8| InstructionEncoding::Fixed(vec![opcode]);
        let with_imm = |opcode: u8| InstructionEncoding::Operand {
            opcode: vec![opcode],
            width: 1,
        };
        let with_addr = |opcode: u8| InstructionEncoding::Operand {
            opcode: vec![opcode],
            width: 2,
        };
        let relative = |opcode: u8| InstructionEncoding::Relative {
            opcode: vec![opcode],
        };

        let assign = InstructionType::Binary(BinaryOp::Assignment);
        let mut table = vec![
            // Loads.
            Instruction::new(assign.clone(), vec![reg(self.a), imm8()], with_imm(0xA9)),
            Instruction::new(assign.clone(), vec![reg(self.a), mem8()], with_addr(0xAD)),
            Instruction::new(
                assign.clone(),
                vec![reg(self.a), indexed8(self.x)],
                with_addr(0xBD),
            ),
            Instruction::new(
                assign.clone(),
                vec![reg(self.a), indexed8(self.y)],
                with_addr(0xB9),
            ),
            Instruction::new(assign.clone(), vec![reg(self.x), imm8()], with_imm(0xA2)),
            Instruction::new(assign.clone(), vec![reg(self.x), mem8()], with_addr(0xAE)),
            Instruction::new(assign.clone(), vec![reg(self.y), imm8()], with_imm(0xA0)),
            Instruction::new(assign.clone(), vec![reg(self.y), mem8()], with_addr(0xAC)),
            // Stores.
            Instruction::new(assign.clone(), vec![mem8(), reg(self.a)], with_addr(0x8D)),
            Instruction::new(
                assign.clone(),
                vec![indexed8(self.x), reg(self.a)],
                with_addr(0x9D),
            ),
            Instruction::new(
                assign.clone(),
                vec![indexed8(self.y), reg(self.a)],
                with_addr(0x99),
            ),
            Instruction::new(assign.clone(), vec![mem8(), reg(self.x)], with_addr(0x8E)),
            Instruction::new(assign.clone(), vec![mem8(), reg(self.y)], with_addr(0x8C)),
            // Transfers.
            Instruction::new(assign.clone(), vec![reg(self.a), reg(self.x)], implied(0x8A)),
            Instruction::new(assign.clone(), vec![reg(self.a), reg(self.y)], implied(0x98)),
            Instruction::new(assign.clone(), vec![reg(self.x), reg(self.a)], implied(0xAA)),
            Instruction::new(assign.clone(), vec![reg(self.y), reg(self.a)], implied(0xA8)),
        ];

        // Accumulator arithmetic and bitwise operations.
        let alu = [
            (BinaryOp::Addition, 0x69, 0x6D),
            (BinaryOp::Subtraction, 0xE9, 0xED),
            (BinaryOp::BitwiseAnd, 0x29, 0x2D),
            (BinaryOp::BitwiseOr, 0x09, 0x0D),
            (BinaryOp::BitwiseXor, 0x49, 0x4D),
        ];
        for (op, imm_opcode, abs_opcode) in alu {
            table.push(Instruction::new(
                InstructionType::Binary(op),
                vec![reg(self.a), imm8()],
                with_imm(imm_opcode),
            ));
            table.push(Instruction::new(
                InstructionType::Binary(op),
                vec![reg(self.a), mem8()],
                with_addr(abs_opcode),
            ));
        }

        // Single-bit shifts on the accumulator.
        for op in [BinaryOp::LeftShift, BinaryOp::LogicalLeftShift] {
            table.push(Instruction::new(
                InstructionType::Binary(op),
                vec![reg(self.a), OperandPattern::IntegerRange { min: 1, max: 1 }],
                implied(0x0A),
            ));
        }
        for op in [BinaryOp::RightShift, BinaryOp::LogicalRightShift] {
            table.push(Instruction::new(
                InstructionType::Binary(op),
                vec![reg(self.a), OperandPattern::IntegerRange { min: 1, max: 1 }],
                implied(0x4A),
            ));
        }

        // Increments and decrements; pre and post forms encode identically.
        for op in [UnaryOp::PreIncrement, UnaryOp::PostIncrement] {
            table.push(Instruction::new(
                InstructionType::Unary(op),
                vec![reg(self.x)],
                implied(0xE8),
            ));
            table.push(Instruction::new(
                InstructionType::Unary(op),
                vec![reg(self.y)],
                implied(0xC8),
            ));
            table.push(Instruction::new(
                InstructionType::Unary(op),
                vec![mem8()],
                with_addr(0xEE),
            ));
        }
        for op in [UnaryOp::PreDecrement, UnaryOp::PostDecrement] {
            table.push(Instruction::new(
                InstructionType::Unary(op),
                vec![reg(self.x)],
                implied(0xCA),
            ));
            table.push(Instruction::new(
                InstructionType::Unary(op),
                vec![reg(self.y)],
                implied(0x88),
            ));
            table.push(Instruction::new(
                InstructionType::Unary(op),
                vec![mem8()],
                with_addr(0xCE),
            ));
        }

        // Comparison tests feeding the flag branches.
        let compares = [
            (self.a, 0xC9, 0xCD),
            (self.x, 0xE0, 0xEC),
            (self.y, 0xC0, 0xCC),
        ];
        for (register, imm_opcode, abs_opcode) in compares {
            table.push(Instruction::new(
                InstructionType::intrinsic("cmp"),
                vec![reg(register), imm8()],
                with_imm(imm_opcode),
            ));
            table.push(Instruction::new(
                InstructionType::intrinsic("cmp"),
                vec![reg(register), mem8()],
                with_addr(abs_opcode),
            ));
        }

        // Conditional branches on flag values.
        let branches = [
            (self.zero, true, 0xF0),
            (self.zero, false, 0xD0),
            (self.carry, true, 0xB0),
            (self.carry, false, 0x90),
            (self.negative, true, 0x30),
            (self.negative, false, 0x10),
            (self.overflow, true, 0x70),
            (self.overflow, false, 0x50),
        ];
        for (flag, value, opcode) in branches {
            table.push(Instruction::new(
                InstructionType::Branch(BranchKind::Goto),
                vec![addr16(), reg(flag), OperandPattern::Boolean(value)],
                relative(opcode),
            ));
        }

        // Unconditional transfers.
        table.push(Instruction::new(
            InstructionType::Branch(BranchKind::Goto),
            vec![addr16()],
            with_addr(0x4C),
        ));
        table.push(Instruction::new(
            InstructionType::Branch(BranchKind::Call),
            vec![addr16()],
            with_addr(0x20),
        ));
        table.push(Instruction::new(
            InstructionType::Branch(BranchKind::Return),
            Vec::new(),
            implied(0x60),
        ));
        table.push(Instruction::new(
            InstructionType::Branch(BranchKind::IrqReturn),
            Vec::new(),
            implied(0x40),
        ));
        table.push(Instruction::new(
            InstructionType::Branch(BranchKind::NmiReturn),
            Vec::new(),
            implied(0x40),
        ));

        // Intrinsics.
        table.push(Instruction::new(
            InstructionType::intrinsic("nop"),
            Vec::new(),
            implied(0xEA),
        ));
        table.push(Instruction::new(
            InstructionType::intrinsic("push"),
            vec![reg(self.a)],
            implied(0x48),
        ));
        table.push(Instruction::new(
            InstructionType::intrinsic("pop"),
            vec![reg(self.a)],
            implied(0x68),
        ));
        table.push(Instruction::new(
            InstructionType::intrinsic("bit"),
            vec![mem8()],
            with_addr(0x2C),
        ));
        table.push(Instruction::new(
            InstructionType::intrinsic("clear_carry"),
            Vec::new(),
            implied(0x18),
        ));
        table.push(Instruction::new(
            InstructionType::intrinsic("set_carry"),
            Vec::new(),
            implied(0x38),
        ));
        table.push(Instruction::new(
            InstructionType::intrinsic("disable_irq"),
            Vec::new(),
            implied(0x78),
        ));
        table.push(Instruction::new(
            InstructionType::intrinsic("enable_irq"),
            Vec::new(),
            implied(0x58),
        ));

        self.instructions = table;
    }
}

impl Platform for Mos6502 {
    fn name(&self) -> &'static str {
        "mos6502"
    }

    fn reserve_definitions(&mut self, registrar: &mut PlatformRegistrar<'_, '_>) {
        let u8_type = registrar.builtins.u8_type;
        let bool_type = registrar.builtins.bool_type;
        self.u16_type = registrar.builtins.u16_type;
        self.u24_type = registrar.builtins.u24_type;
        self.signed_types = vec![
            registrar.builtins.i8_type,
            registrar.builtins.i16_type,
            registrar.builtins.i24_type,
            registrar.builtins.i32_type,
        ];

        self.a = registrar.register("a", u8_type);
        self.x = registrar.register("x", u8_type);
        self.y = registrar.register("y", u8_type);
        self.zero = registrar.register("zero", bool_type);
        self.carry = registrar.register("carry", bool_type);
        self.negative = registrar.register("negative", bool_type);
        self.overflow = registrar.register("overflow", bool_type);

        registrar.void_intrinsic("nop");
        registrar.void_intrinsic("push");
        registrar.void_intrinsic("pop");
        registrar.void_intrinsic("bit");
        registrar.void_intrinsic("clear_carry");
        registrar.void_intrinsic("set_carry");
        registrar.void_intrinsic("disable_irq");
        registrar.void_intrinsic("enable_irq");

        self.build_instructions();
    }

    fn pointer_sized_type(&self) -> DefId {
        self.u16_type
    }

    fn far_pointer_sized_type(&self) -> DefId {
        self.u24_type
    }

    fn placeholder_value(&self) -> i128 {
        0xFFFF
    }

    fn zero_flag(&self) -> Option<DefId> {
        Some(self.zero)
    }

    fn mode_attributes(&self) -> &[ModeAttribute] {
        &[]
    }

    fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    fn get_test_and_branch(
        &self,
        common_type: DefId,
        op: BinaryOp,
        left: &Operand,
        right: &Operand,
        _distance_hint: DistanceHint,
    ) -> Option<TestAndBranch> {
        // CMP only compares registers against immediates or memory.
        if !matches!(left, Operand::Register(register)
            if [self.a, self.x, self.y].contains(register))
        {
            return None;
        }
        if !matches!(
            right,
            Operand::Integer(_) | Operand::Dereference { .. }
        ) {
            return None;
        }

        // Signed ordering needs an overflow-aware sequence this table does
        // not provide; equality is sign-agnostic.
        if self.signed_types.contains(&common_type)
            && !matches!(op, BinaryOp::Equal | BinaryOp::NotEqual)
        {
            return None;
        }

        let branches = self.flag_for_comparison(op)?;
        Some(TestAndBranch {
            test: InstructionType::intrinsic("cmp"),
            operands: vec![left.clone(), right.clone()],
            branches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use wizc_core::builtins::Builtins;
    use wizc_core::def::DefPool;
    use wizc_core::scope::ScopePool;

    fn platform() -> (Mos6502, DefPool<'static>, Builtins) {
        let mut defs = DefPool::new();
        let mut scopes = ScopePool::new();
        let builtins = Builtins::register(&mut defs, &mut scopes, IndexMap::new());
        let mut platform = Mos6502::new();
        platform.reserve_definitions(&mut PlatformRegistrar {
            defs: &mut defs,
            scopes: &mut scopes,
            builtins: &builtins,
        });
        (platform, defs, builtins)
    }

    #[test]
    fn selects_lda_immediate_for_accumulator_load() {
        let (platform, _defs, _builtins) = platform();
        let operands = [
            Operand::Register(platform.a),
            Operand::Integer(0x42),
        ];
        let mut found = None;
        for instruction in platform.instructions() {
            let mut captures = Vec::new();
            if instruction
                .signature
                .matches(0, &operands, &mut captures)
            {
                found = Some((instruction, captures));
                break;
            }
        }
        let (instruction, captures) = found.expect("lda # should match");
        assert_eq!(captures, vec![0x42]);
        let bytes = instruction.encoding.encode(0x8000, &captures).expect("encode");
        assert_eq!(bytes, vec![0xA9, 0x42]);
    }

    #[test]
    fn equality_test_branches_on_the_zero_flag() {
        let (platform, _defs, builtins) = platform();
        let lowering = platform
            .get_test_and_branch(
                builtins.u8_type,
                BinaryOp::Equal,
                &Operand::Register(platform.a),
                &Operand::Integer(0),
                DistanceHint::None,
            )
            .expect("lowering");
        assert_eq!(lowering.branches.len(), 1);
        assert_eq!(lowering.branches[0].flag, platform.zero);
        assert!(lowering.branches[0].value);
        assert!(lowering.branches[0].on_success);
    }

    #[test]
    fn unsigned_greater_than_needs_a_skip_edge() {
        let (platform, _defs, builtins) = platform();
        let lowering = platform
            .get_test_and_branch(
                builtins.u8_type,
                BinaryOp::GreaterThan,
                &Operand::Register(platform.a),
                &Operand::Integer(5),
                DistanceHint::None,
            )
            .expect("lowering");
        assert_eq!(lowering.branches.len(), 2);
        assert!(!lowering.branches[0].on_success);
        assert!(lowering.branches[1].on_success);
    }

    #[test]
    fn signed_ordering_is_not_lowered() {
        let (platform, _defs, builtins) = platform();
        assert!(platform
            .get_test_and_branch(
                builtins.i8_type,
                BinaryOp::LessThan,
                &Operand::Register(platform.a),
                &Operand::Integer(5),
                DistanceHint::None,
            )
            .is_none());
    }

    #[test]
    fn relative_branch_encodes_signed_displacement() {
        let encoding = InstructionEncoding::Relative { opcode: vec![0xD0] };
        let bytes = encoding.encode(0x8000, &[0x8005]).expect("encode");
        assert_eq!(bytes, vec![0xD0, 0x03]);
        let bytes = encoding.encode(0x8005, &[0x8000]).expect("encode");
        assert_eq!(bytes, vec![0xD0, 0xF9]);
        assert!(encoding.encode(0x8000, &[0x9000]).is_err());
    }
}

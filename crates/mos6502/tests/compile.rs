//! End-to-end lowering tests: AST in, 6502 machine code out.

use indexmap::IndexMap;
use wizc_core::ast::{BranchKind, DistanceHint, ParameterDecl, Qualifiers, Statement};
use wizc_core::diag::Report;
use wizc_core::expr::{BinaryOp, Expression, ExpressionKind, UnaryOp};
use wizc_core::sources::MemorySourceReader;
use wizc_core::span::{SourceId, Span, Spanned};
use wizc_core::types::TypeExpression;
use wizc_core::{compile, CompileOutput};
use wizc_mos6502::Mos6502;

fn sp() -> Span {
    Span::point(SourceId(0), 0)
}

fn stmt(node: Statement) -> Spanned<Statement> {
    Spanned::new(node, sp())
}

fn block(items: Vec<Spanned<Statement>>) -> Box<Spanned<Statement>> {
    Box::new(stmt(Statement::Block(items)))
}

fn ident(name: &str) -> Expression {
    Expression::identifier(vec![name.to_string()], sp())
}

fn int(value: i128) -> Expression {
    Expression::integer(value, sp())
}

fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::new(
        ExpressionKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        sp(),
    )
}

fn assign(left: Expression, right: Expression) -> Spanned<Statement> {
    stmt(Statement::ExpressionStatement(binary(
        BinaryOp::Assignment,
        left,
        right,
    )))
}

fn named_type(name: &str) -> TypeExpression {
    TypeExpression::Identifier(vec![name.to_string()])
}

/// `*(address as *u8)`
fn memory(address: i128) -> Expression {
    let pointer = TypeExpression::Pointer {
        element: Box::new(named_type("u8")),
        qualifiers: Default::default(),
    };
    Expression::new(
        ExpressionKind::Unary {
            op: UnaryOp::Indirection,
            operand: Box::new(Expression::new(
                ExpressionKind::Cast {
                    operand: Box::new(int(address)),
                    target: pointer,
                },
                sp(),
            )),
        },
        sp(),
    )
}

fn func(name: &str, body: Vec<Spanned<Statement>>) -> Spanned<Statement> {
    stmt(Statement::Func {
        name: name.to_string(),
        far: false,
        inlined: false,
        parameters: Vec::new(),
        return_type: None,
        body: block(body),
    })
}

fn bank_and_program(body: Vec<Spanned<Statement>>) -> Spanned<Statement> {
    let bank = stmt(Statement::Bank {
        names: vec!["prg".to_string()],
        addresses: vec![Some(int(0x8000))],
        type_expression: TypeExpression::Array {
            element: Box::new(named_type("prgdata")),
            length: Some(Box::new(int(0x100))),
        },
    });
    let in_prg = stmt(Statement::In {
        pieces: vec!["prg".to_string()],
        dest: None,
        body: block(body),
    });
    stmt(Statement::File {
        path: "main.wiz".to_string(),
        items: vec![bank, in_prg],
    })
}

fn compile_program(program: &Spanned<Statement>) -> (Option<CompileOutput>, Report) {
    let mut platform = Mos6502::new();
    let reader = MemorySourceReader::new();
    let mut report = Report::new();
    let output = compile(
        program,
        &mut platform,
        &reader,
        IndexMap::new(),
        &mut report,
    );
    (output, report)
}

fn code_bytes(body: Vec<Spanned<Statement>>) -> Vec<u8> {
    let program = bank_and_program(body);
    let (output, report) = compile_program(&program);
    let messages: Vec<&str> = report
        .diagnostics()
        .iter()
        .map(|diagnostic| diagnostic.message.as_str())
        .collect();
    let output = output.unwrap_or_else(|| panic!("compilation failed: {messages:?}"));
    let bank = output
        .banks
        .iter()
        .find(|bank| bank.name == "prg")
        .expect("prg bank");
    // Trim the pad tail so assertions read naturally.
    let written = bank
        .bytes
        .iter()
        .rposition(|byte| *byte != 0xFF)
        .map(|index| index + 1)
        .unwrap_or(0);
    bank.bytes[..written].to_vec()
}

#[test]
fn if_else_lowers_to_test_branch_and_jump() {
    let condition = binary(BinaryOp::Equal, ident("a"), int(0));
    let body = vec![func(
        "main",
        vec![stmt(Statement::If {
            condition,
            body: block(vec![assign(ident("x"), ident("a"))]),
            alternative: Some(block(vec![assign(ident("y"), ident("a"))])),
            distance_hint: DistanceHint::None,
        })],
    )];

    // cmp #0; bne else; tax; jmp end; else: tay; end: rts
    assert_eq!(
        code_bytes(body),
        vec![0xC9, 0x00, 0xD0, 0x04, 0xAA, 0x4C, 0x09, 0x80, 0xA8, 0x60]
    );
}

#[test]
fn constant_condition_collapses_to_the_live_branch() {
    let condition = binary(BinaryOp::Equal, int(5), int(0));
    let body = vec![func(
        "main",
        vec![stmt(Statement::If {
            condition,
            body: block(vec![assign(ident("x"), ident("a"))]),
            alternative: Some(block(vec![assign(ident("y"), ident("a"))])),
            distance_hint: DistanceHint::None,
        })],
    )];

    // Only tay and the implicit rts survive.
    assert_eq!(code_bytes(body), vec![0xA8, 0x60]);
}

#[test]
fn inline_for_unrolls_with_independent_literals() {
    let body = vec![func(
        "main",
        vec![stmt(Statement::InlineFor {
            name: "i".to_string(),
            sequence: Expression::new(
                ExpressionKind::RangeLiteral {
                    start: Box::new(int(1)),
                    end: Box::new(int(3)),
                    step: None,
                },
                sp(),
            ),
            body: block(vec![assign(ident("a"), ident("i"))]),
        })],
    )];

    assert_eq!(
        code_bytes(body),
        vec![0xA9, 0x01, 0xA9, 0x02, 0xA9, 0x03, 0x60]
    );
}

#[test]
fn redundant_goto_to_the_next_label_is_dropped() {
    let body = vec![func(
        "main",
        vec![
            stmt(Statement::Branch {
                kind: BranchKind::Goto,
                distance_hint: DistanceHint::None,
                destination: Some(ident("done")),
                return_value: None,
                condition: None,
            }),
            stmt(Statement::Label {
                name: "done".to_string(),
                far: false,
            }),
        ],
    )];

    // The jump would land on the very next address; only rts remains.
    assert_eq!(code_bytes(body), vec![0x60]);
}

#[test]
fn calls_pass_arguments_through_designated_storage() {
    let poke = stmt(Statement::Func {
        name: "poke".to_string(),
        far: false,
        inlined: false,
        parameters: vec![ParameterDecl {
            name: "value".to_string(),
            type_expression: TypeExpression::DesignatedStorage {
                element: Box::new(named_type("u8")),
                holder: Box::new(ident("a")),
            },
            span: sp(),
        }],
        return_type: None,
        body: block(vec![assign(memory(0x2007), ident("value"))]),
    });
    let main = func(
        "main",
        vec![stmt(Statement::ExpressionStatement(Expression::new(
            ExpressionKind::Call {
                inlined: false,
                function: Box::new(ident("poke")),
                arguments: vec![int(0x41)],
            },
            sp(),
        )))],
    );

    // poke: sta $2007; rts / main: lda #$41; jsr poke; rts
    assert_eq!(
        code_bytes(vec![poke, main]),
        vec![0x8D, 0x07, 0x20, 0x60, 0xA9, 0x41, 0x20, 0x00, 0x80, 0x60]
    );
}

#[test]
fn for_loop_over_a_full_byte_range_uses_the_zero_flag() {
    let body = vec![func(
        "main",
        vec![stmt(Statement::For {
            counter: ident("x"),
            sequence: Expression::new(
                ExpressionKind::RangeLiteral {
                    start: Box::new(int(0)),
                    end: Box::new(int(255)),
                    step: None,
                },
                sp(),
            ),
            body: block(Vec::new()),
            distance_hint: DistanceHint::None,
        })],
    )];

    // ldx #0; loop: inx; bne loop; rts; the wrap to zero is the exit test.
    assert_eq!(code_bytes(body), vec![0xA2, 0x00, 0xE8, 0xD0, 0xFD, 0x60]);
}

#[test]
fn for_loop_with_interior_bound_compares_against_the_stop_value() {
    let body = vec![func(
        "main",
        vec![stmt(Statement::For {
            counter: ident("x"),
            sequence: Expression::new(
                ExpressionKind::RangeLiteral {
                    start: Box::new(int(0)),
                    end: Box::new(int(9)),
                    step: None,
                },
                sp(),
            ),
            body: block(Vec::new()),
            distance_hint: DistanceHint::None,
        })],
    )];

    // ldx #0; loop: inx; cpx #10; bne loop; rts
    assert_eq!(
        code_bytes(body),
        vec![0xA2, 0x00, 0xE8, 0xE0, 0x0A, 0xD0, 0xFB, 0x60]
    );
}

#[test]
fn while_loop_tests_at_the_top_and_jumps_back() {
    let condition = binary(BinaryOp::NotEqual, ident("a"), int(0));
    let body = vec![func(
        "main",
        vec![stmt(Statement::While {
            condition,
            body: block(vec![assign(
                ident("a"),
                binary(BinaryOp::Subtraction, ident("a"), int(1)),
            )]),
            distance_hint: DistanceHint::None,
        })],
    )];

    // loop: cmp #0; beq end; sbc #1; jmp loop; end: rts
    assert_eq!(
        code_bytes(body),
        vec![0xC9, 0x00, 0xF0, 0x05, 0xE9, 0x01, 0x4C, 0x00, 0x80, 0x60]
    );
}

#[test]
fn do_while_tests_at_the_bottom() {
    let condition = binary(BinaryOp::NotEqual, ident("x"), int(0));
    let body = vec![func(
        "main",
        vec![stmt(Statement::DoWhile {
            body: block(vec![stmt(Statement::ExpressionStatement(
                Expression::new(
                    ExpressionKind::Unary {
                        op: UnaryOp::PreDecrement,
                        operand: Box::new(ident("x")),
                    },
                    sp(),
                ),
            ))]),
            condition,
            distance_hint: DistanceHint::None,
        })],
    )];

    // loop: dex; cpx #0; bne loop; rts
    assert_eq!(
        code_bytes(body),
        vec![0xCA, 0xE0, 0x00, 0xD0, 0xFB, 0x60]
    );
}

#[test]
fn conditional_return_evaluates_through_a_skip_label() {
    let nop = stmt(Statement::ExpressionStatement(Expression::new(
        ExpressionKind::Call {
            inlined: false,
            function: Box::new(ident("nop")),
            arguments: Vec::new(),
        },
        sp(),
    )));
    let body = vec![func(
        "main",
        vec![
            stmt(Statement::Branch {
                kind: BranchKind::Return,
                distance_hint: DistanceHint::None,
                destination: None,
                return_value: None,
                condition: Some(ident("zero")),
            }),
            nop,
        ],
    )];

    // bne skip; rts; skip: nop; rts
    assert_eq!(code_bytes(body), vec![0xD0, 0x01, 0x60, 0xEA, 0x60]);
}

#[test]
fn logical_and_short_circuits_with_a_skip_label() {
    let condition = binary(
        BinaryOp::LogicalAnd,
        binary(BinaryOp::Equal, ident("a"), int(1)),
        binary(BinaryOp::Equal, ident("x"), int(2)),
    );
    let body = vec![func(
        "main",
        vec![stmt(Statement::If {
            condition,
            body: block(vec![assign(ident("y"), ident("a"))]),
            alternative: None,
            distance_hint: DistanceHint::None,
        })],
    )];

    // The `if` branches to else when the condition is false:
    // cmp #1; bne else; cpx #2; bne else; tay; else: rts
    assert_eq!(
        code_bytes(body),
        vec![0xC9, 0x01, 0xD0, 0x05, 0xE0, 0x02, 0xD0, 0x01, 0xA8, 0x60]
    );
}

#[test]
fn unsigned_greater_than_branches_through_two_flags() {
    let condition = binary(BinaryOp::GreaterThan, ident("a"), int(5));
    let body = vec![func(
        "main",
        vec![stmt(Statement::If {
            condition,
            body: block(vec![assign(ident("x"), ident("a"))]),
            alternative: None,
            distance_hint: DistanceHint::None,
        })],
    )];

    // !(a > 5) is a <= 5: beq taken (equal) or bcc taken (below).
    // cmp #5; beq else; bcc else; tax; else: rts
    assert_eq!(
        code_bytes(body),
        vec![0xC9, 0x05, 0xF0, 0x03, 0x90, 0x01, 0xAA, 0x60]
    );
}

#[test]
fn irq_functions_return_with_rti() {
    let handler = stmt(Statement::Attribution {
        attributes: vec![wizc_core::ast::Attribute {
            name: "irq".to_string(),
            arguments: Vec::new(),
            span: sp(),
        }],
        body: Box::new(func("on_irq", Vec::new())),
    });

    assert_eq!(code_bytes(vec![handler]), vec![0x40]);
}

#[test]
fn fallthrough_functions_emit_no_implicit_return() {
    let first = stmt(Statement::Attribution {
        attributes: vec![wizc_core::ast::Attribute {
            name: "fallthrough".to_string(),
            arguments: Vec::new(),
            span: sp(),
        }],
        body: Box::new(func(
            "first",
            vec![assign(ident("a"), int(1))],
        )),
    });
    let second = func("second", vec![assign(ident("x"), ident("a"))]);

    // first: lda #1 (no rts), second: tax; rts
    assert_eq!(
        code_bytes(vec![first, second]),
        vec![0xA9, 0x01, 0xAA, 0x60]
    );
}

#[test]
fn function_pointers_serialize_assigned_addresses() {
    let handler = func("handler", Vec::new());
    let vector = stmt(Statement::Var {
        qualifiers: Qualifiers::constant(),
        names: vec!["vector".to_string()],
        addresses: vec![None],
        type_expression: Some(TypeExpression::Function {
            far: false,
            parameters: Vec::new(),
            return_type: Box::new(TypeExpression::unit()),
        }),
        value: Some(ident("handler")),
    });

    // handler: rts at $8000; vector holds $8000 little-endian.
    assert_eq!(code_bytes(vec![handler, vector]), vec![0x60, 0x00, 0x80]);
}

#[test]
fn selection_failure_lists_candidates() {
    // There is no 6502 instruction moving y into x directly.
    let body = vec![func("main", vec![assign(ident("x"), ident("y"))])];
    let program = bank_and_program(body);
    let (output, report) = compile_program(&program);
    assert!(output.is_none());
    let failure = report
        .diagnostics()
        .iter()
        .find(|diagnostic| diagnostic.message.contains("no instruction matches"))
        .expect("selection diagnostic");
    assert!(failure
        .continued
        .iter()
        .any(|line| line.contains("candidates considered")));
}

#[test]
fn break_and_continue_need_an_enclosing_loop() {
    let body = vec![func(
        "main",
        vec![stmt(Statement::Branch {
            kind: BranchKind::Break,
            distance_hint: DistanceHint::None,
            destination: None,
            return_value: None,
            condition: None,
        })],
    )];
    let program = bank_and_program(body);
    let (output, report) = compile_program(&program);
    assert!(output.is_none());
    assert!(report
        .diagnostics()
        .iter()
        .any(|diagnostic| diagnostic.message.contains("outside of a loop")));
}

#[test]
fn break_exits_the_innermost_loop() {
    let body = vec![func(
        "main",
        vec![stmt(Statement::While {
            condition: Expression::new(ExpressionKind::BooleanLiteral(true), sp()),
            body: block(vec![stmt(Statement::Branch {
                kind: BranchKind::Break,
                distance_hint: DistanceHint::None,
                destination: None,
                return_value: None,
                condition: Some(ident("zero")),
            })]),
            distance_hint: DistanceHint::None,
        })],
    )];

    // loop: beq end; jmp loop; end: rts
    assert_eq!(
        code_bytes(body),
        vec![0xF0, 0x03, 0x4C, 0x00, 0x80, 0x60]
    );
}

use indexmap::IndexMap;

use crate::ast::{
    Attribute, ConfigEntry, EnumMemberDecl, Qualifiers, Statement, StructKind, StructMemberDecl,
};
use crate::bank::BankKind;
use crate::def::DefId;
use crate::diag::Report;
use crate::driver::{compile, CompileOutput};
use crate::expr::{BinaryOp, Expression, ExpressionKind, TypeQueryKind, UnaryOp};
use crate::platform::{
    Instruction, ModeAttribute, Operand, Platform, PlatformRegistrar, TestAndBranch,
};
use crate::sources::MemorySourceReader;
use crate::span::{SourceId, Span, Spanned};
use crate::types::{PointerQualifiers, TypeExpression};

/// A stub target with no instruction table: enough for every data-only
/// program. Control-flow emission is exercised end-to-end in the mos6502
/// crate's integration tests.
struct DataPlatform {
    u16_type: DefId,
    u24_type: DefId,
    instructions: Vec<Instruction>,
}

impl DataPlatform {
    fn new() -> Self {
        Self {
            u16_type: DefId(u32::MAX),
            u24_type: DefId(u32::MAX),
            instructions: Vec::new(),
        }
    }
}

impl Platform for DataPlatform {
    fn name(&self) -> &'static str {
        "data-only"
    }

    fn reserve_definitions(&mut self, registrar: &mut PlatformRegistrar<'_, '_>) {
        self.u16_type = registrar.builtins.u16_type;
        self.u24_type = registrar.builtins.u24_type;
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
        None
    }

    fn mode_attributes(&self) -> &[ModeAttribute] {
        &[]
    }

    fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    fn get_test_and_branch(
        &self,
        _common_type: DefId,
        _op: BinaryOp,
        _left: &Operand,
        _right: &Operand,
        _distance_hint: crate::ast::DistanceHint,
    ) -> Option<TestAndBranch> {
        None
    }
}

// --- AST construction helpers ------------------------------------------

fn sp() -> Span {
    Span::point(SourceId(0), 0)
}

fn stmt(node: Statement) -> Spanned<Statement> {
    Spanned::new(node, sp())
}

fn file(items: Vec<Spanned<Statement>>) -> Spanned<Statement> {
    stmt(Statement::File {
        path: "main.wiz".to_string(),
        items,
    })
}

fn block(items: Vec<Spanned<Statement>>) -> Box<Spanned<Statement>> {
    Box::new(stmt(Statement::Block(items)))
}

fn ident(pieces: &[&str]) -> Expression {
    Expression::identifier(pieces.iter().map(|piece| piece.to_string()).collect(), sp())
}

fn int(value: i128) -> Expression {
    Expression::integer(value, sp())
}

fn string(value: &str) -> Expression {
    Expression::new(
        ExpressionKind::StringLiteral(value.as_bytes().to_vec()),
        sp(),
    )
}

fn boolean(value: bool) -> Expression {
    Expression::new(ExpressionKind::BooleanLiteral(value), sp())
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

fn unary(op: UnaryOp, operand: Expression) -> Expression {
    Expression::new(
        ExpressionKind::Unary {
            op,
            operand: Box::new(operand),
        },
        sp(),
    )
}

fn call(name: &str, arguments: Vec<Expression>) -> Expression {
    Expression::new(
        ExpressionKind::Call {
            inlined: false,
            function: Box::new(ident(&[name])),
            arguments,
        },
        sp(),
    )
}

fn named_type(name: &str) -> TypeExpression {
    TypeExpression::Identifier(vec![name.to_string()])
}

fn array_type(element: TypeExpression, length: Option<i128>) -> TypeExpression {
    TypeExpression::Array {
        element: Box::new(element),
        length: length.map(|value| Box::new(int(value))),
    }
}

fn pointer_type(element: TypeExpression, is_const: bool) -> TypeExpression {
    TypeExpression::Pointer {
        element: Box::new(element),
        qualifiers: PointerQualifiers {
            is_const,
            is_writeonly: false,
            is_far: false,
        },
    }
}

fn bank_decl(name: &str, origin: i128, element: &str, capacity: i128) -> Spanned<Statement> {
    stmt(Statement::Bank {
        names: vec![name.to_string()],
        addresses: vec![Some(int(origin))],
        type_expression: array_type(named_type(element), Some(capacity)),
    })
}

fn in_bank(name: &str, items: Vec<Spanned<Statement>>) -> Spanned<Statement> {
    stmt(Statement::In {
        pieces: vec![name.to_string()],
        dest: None,
        body: block(items),
    })
}

fn const_decl(name: &str, ty: Option<TypeExpression>, value: Expression) -> Spanned<Statement> {
    stmt(Statement::Var {
        qualifiers: Qualifiers::constant(),
        names: vec![name.to_string()],
        addresses: vec![None],
        type_expression: ty,
        value: Some(value),
    })
}

fn var_decl(name: &str, ty: TypeExpression, address: Option<i128>) -> Spanned<Statement> {
    stmt(Statement::Var {
        qualifiers: Qualifiers::default(),
        names: vec![name.to_string()],
        addresses: vec![address.map(int)],
        type_expression: Some(ty),
        value: None,
    })
}

fn let_decl(name: &str, parameters: &[&str], value: Expression) -> Spanned<Statement> {
    stmt(Statement::Let {
        name: name.to_string(),
        parameters: parameters.iter().map(|parameter| parameter.to_string()).collect(),
        value,
    })
}

// --- harness ------------------------------------------------------------

fn run_with(
    items: Vec<Spanned<Statement>>,
    defines: IndexMap<String, Expression>,
    reader: &MemorySourceReader,
) -> (Option<CompileOutput>, Report) {
    let program = file(items);
    let mut platform = DataPlatform::new();
    let mut report = Report::new();
    let output = compile(&program, &mut platform, reader, defines, &mut report);
    (output, report)
}

fn run(items: Vec<Spanned<Statement>>) -> (Option<CompileOutput>, Report) {
    run_with(items, IndexMap::new(), &MemorySourceReader::new())
}

fn run_ok(items: Vec<Spanned<Statement>>) -> CompileOutput {
    let (output, report) = run(items);
    let messages: Vec<&str> = report
        .diagnostics()
        .iter()
        .map(|diagnostic| diagnostic.message.as_str())
        .collect();
    output.unwrap_or_else(|| panic!("compilation failed: {messages:?}"))
}

fn run_err(items: Vec<Spanned<Statement>>) -> Vec<String> {
    let (output, report) = run(items);
    assert!(output.is_none(), "compilation should have failed");
    report
        .diagnostics()
        .iter()
        .map(|diagnostic| diagnostic.message.clone())
        .collect()
}

fn rom<'a>(output: &'a CompileOutput, name: &str) -> &'a [u8] {
    &output
        .banks
        .iter()
        .find(|bank| bank.name == name)
        .unwrap_or_else(|| panic!("bank '{name}' missing"))
        .bytes
}

// --- end-to-end scenarios -----------------------------------------------

#[test]
fn places_string_constant_at_bank_origin() {
    let output = run_ok(vec![
        bank_decl("prg", 0x8000, "constdata", 0x4000),
        in_bank(
            "prg",
            vec![const_decl(
                "greeting",
                Some(array_type(named_type("u8"), None)),
                string("hi"),
            )],
        ),
    ]);

    let prg = rom(&output, "prg");
    assert_eq!(prg.len(), 0x4000);
    assert_eq!(&prg[..2], &[0x68, 0x69]);
    assert!(prg[2..].iter().all(|byte| *byte == 0xFF));

    let bank = &output.banks[0];
    assert_eq!(bank.kind, BankKind::Rom);
    assert_eq!(bank.origin, Some(0x8000));
}

#[test]
fn enum_members_take_default_and_explicit_values() {
    let members = vec![
        EnumMemberDecl {
            name: "A".to_string(),
            value: None,
            span: sp(),
        },
        EnumMemberDecl {
            name: "B".to_string(),
            value: Some(int(10)),
            span: sp(),
        },
        EnumMemberDecl {
            name: "C".to_string(),
            value: None,
            span: sp(),
        },
    ];
    let output = run_ok(vec![
        stmt(Statement::Enum {
            name: "E".to_string(),
            underlying_type: Some(named_type("u8")),
            members,
        }),
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![
                const_decl("a", Some(named_type("E")), ident(&["E", "A"])),
                const_decl("b", Some(named_type("E")), ident(&["E", "B"])),
                const_decl("c", Some(named_type("E")), ident(&["E", "C"])),
            ],
        ),
    ]);

    assert_eq!(&rom(&output, "prg")[..3], &[0x00, 0x0A, 0x0B]);
}

#[test]
fn let_expression_with_parameters_folds() {
    let output = run_ok(vec![
        let_decl(
            "double",
            &["n"],
            binary(BinaryOp::Addition, ident(&["n"]), ident(&["n"])),
        ),
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "x",
                Some(named_type("u16")),
                call("double", vec![int(21)]),
            )],
        ),
    ]);

    assert_eq!(&rom(&output, "prg")[..2], &[0x2A, 0x00]);
}

#[test]
fn let_recursion_past_the_limit_is_rejected() {
    // The reducer recurses natively once per let frame; give the guard the
    // room to trip before the test thread's own stack would.
    let handle = std::thread::Builder::new()
        .stack_size(32 * 1024 * 1024)
        .spawn(|| {
            run_err(vec![
                let_decl("forever", &[], call("forever", vec![])),
                bank_decl("prg", 0x8000, "constdata", 0x10),
                in_bank(
                    "prg",
                    vec![const_decl(
                        "x",
                        Some(named_type("u8")),
                        call("forever", vec![]),
                    )],
                ),
            ])
        })
        .expect("spawn");
    let messages = handle.join().expect("join");

    assert!(messages
        .iter()
        .any(|message| message.contains("recursion limit")));
}

#[test]
fn concatenation_joins_compile_time_strings() {
    let output = run_ok(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "msg",
                Some(array_type(named_type("u8"), None)),
                binary(BinaryOp::Concatenation, string("hi"), string("!")),
            )],
        ),
    ]);

    assert_eq!(&rom(&output, "prg")[..3], b"hi!");
}

#[test]
fn array_comprehension_unrolls_over_a_range() {
    let body = binary(BinaryOp::Multiplication, ident(&["n"]), ident(&["n"]));
    let comprehension = Expression::new(
        ExpressionKind::ArrayComprehension {
            name: "n".to_string(),
            sequence: Box::new(Expression::new(
                ExpressionKind::RangeLiteral {
                    start: Box::new(int(0)),
                    end: Box::new(int(3)),
                    step: None,
                },
                sp(),
            )),
            body: Box::new(body),
        },
        sp(),
    );

    let output = run_ok(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "squares",
                Some(array_type(named_type("u8"), None)),
                comprehension,
            )],
        ),
    ]);

    assert_eq!(&rom(&output, "prg")[..4], &[0, 1, 4, 9]);
}

#[test]
fn address_reserve_places_an_anonymous_constant() {
    let output = run_ok(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "p",
                Some(pointer_type(named_type("u16"), true)),
                unary(UnaryOp::AddressReserve, int(0x1234)),
            )],
        ),
    ]);

    // The pointer lands first and points at the two reserved bytes that
    // follow it.
    assert_eq!(&rom(&output, "prg")[..4], &[0x02, 0x80, 0x34, 0x12]);
}

#[test]
fn address_reserve_outside_an_initializer_is_rejected() {
    let messages = run_err(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![stmt(Statement::ExpressionStatement(unary(
                UnaryOp::AddressReserve,
                int(5),
            )))],
        ),
    ]);

    assert!(messages
        .iter()
        .any(|message| message.contains("variable initializer")));
}

#[test]
fn embed_reads_file_bytes_through_the_reader() {
    let mut reader = MemorySourceReader::new();
    reader.insert("tiles.bin", vec![0xDE, 0xAD, 0xBE, 0xEF]);

    let items = vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "tiles",
                Some(array_type(named_type("u8"), None)),
                Expression::new(ExpressionKind::Embed("tiles.bin".to_string()), sp()),
            )],
        ),
    ];
    let (output, report) = run_with(items, IndexMap::new(), &reader);
    assert!(report.diagnostics().is_empty());
    let output = output.expect("compile");
    assert_eq!(&rom(&output, "prg")[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn missing_embed_file_is_reported() {
    let messages = run_err(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "tiles",
                Some(array_type(named_type("u8"), None)),
                Expression::new(ExpressionKind::Embed("missing.bin".to_string()), sp()),
            )],
        ),
    ]);

    assert!(messages.iter().any(|message| message.contains("embed failed")));
}

#[test]
fn defines_answer_hasdef_and_getdef() {
    let mut defines = IndexMap::new();
    defines.insert("DEBUG".to_string(), int(3));

    let items = vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![
                const_decl(
                    "level",
                    Some(named_type("u8")),
                    call("getdef", vec![string("DEBUG"), int(0)]),
                ),
                const_decl(
                    "fallback",
                    Some(named_type("u8")),
                    call("getdef", vec![string("MISSING"), int(7)]),
                ),
                const_decl(
                    "flag",
                    Some(named_type("bool")),
                    call("hasdef", vec![string("DEBUG")]),
                ),
            ],
        ),
    ];
    let (output, report) = run_with(items, defines, &MemorySourceReader::new());
    assert!(report.diagnostics().is_empty());
    let output = output.expect("compile");
    assert_eq!(&rom(&output, "prg")[..3], &[3, 7, 1]);
}

#[test]
fn compile_if_false_drops_the_gated_declaration() {
    let gated = stmt(Statement::Attribution {
        attributes: vec![Attribute {
            name: "compile_if".to_string(),
            arguments: vec![boolean(false)],
            span: sp(),
        }],
        body: Box::new(const_decl("hidden", Some(named_type("u8")), int(0x55))),
    });

    let output = run_ok(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![gated, const_decl("kept", Some(named_type("u8")), int(9))],
        ),
    ]);

    // The gated constant takes no space, so `kept` sits at the origin.
    assert_eq!(rom(&output, "prg")[0], 9);
}

#[test]
fn duplicate_symbols_are_rejected() {
    let messages = run_err(vec![
        let_decl("dup", &[], int(1)),
        stmt(Statement::Var {
            qualifiers: Qualifiers::default(),
            names: vec!["dup".to_string()],
            addresses: vec![Some(int(0x10))],
            type_expression: Some(named_type("u8")),
            value: None,
        }),
    ]);

    assert!(messages
        .iter()
        .any(|message| message.contains("duplicate symbol 'dup'")));
}

#[test]
fn vars_need_a_bank_or_an_explicit_address() {
    let messages = run_err(vec![var_decl("stray", named_type("u8"), None)]);
    assert!(messages
        .iter()
        .any(|message| message.contains("'in BANK' block")));
}

#[test]
fn struct_layout_serializes_in_declaration_order() {
    let point = stmt(Statement::Struct {
        kind: StructKind::Struct,
        name: "Point".to_string(),
        members: vec![
            StructMemberDecl {
                name: "x".to_string(),
                type_expression: named_type("u8"),
                span: sp(),
            },
            StructMemberDecl {
                name: "y".to_string(),
                type_expression: named_type("u16"),
                span: sp(),
            },
        ],
    });

    let mut members = IndexMap::new();
    members.insert("x".to_string(), int(1));
    members.insert("y".to_string(), int(0x0203));
    let literal = Expression::new(
        ExpressionKind::StructLiteral {
            type_expression: named_type("Point"),
            members,
        },
        sp(),
    );

    let output = run_ok(vec![
        point,
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![
                const_decl("origin", Some(named_type("Point")), literal),
                const_decl(
                    "size",
                    Some(named_type("u8")),
                    Expression::new(
                        ExpressionKind::TypeQuery {
                            kind: TypeQueryKind::SizeOf,
                            target: named_type("Point"),
                        },
                        sp(),
                    ),
                ),
            ],
        ),
    ]);

    // Natural-order packing: u8 then u16, no padding; sizeof agrees.
    assert_eq!(&rom(&output, "prg")[..4], &[0x01, 0x03, 0x02, 0x03]);
}

#[test]
fn union_literal_zero_pads_to_widest_member() {
    let word = stmt(Statement::Struct {
        kind: StructKind::Union,
        name: "Word".to_string(),
        members: vec![
            StructMemberDecl {
                name: "lo".to_string(),
                type_expression: named_type("u8"),
                span: sp(),
            },
            StructMemberDecl {
                name: "full".to_string(),
                type_expression: named_type("u16"),
                span: sp(),
            },
        ],
    });

    let mut members = IndexMap::new();
    members.insert("lo".to_string(), int(5));
    let literal = Expression::new(
        ExpressionKind::StructLiteral {
            type_expression: named_type("Word"),
            members,
        },
        sp(),
    );

    let output = run_ok(vec![
        word,
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![
                const_decl("w", Some(named_type("Word")), literal),
                const_decl("sentinel", Some(named_type("u8")), int(0xAB)),
            ],
        ),
    ]);

    assert_eq!(&rom(&output, "prg")[..3], &[0x05, 0x00, 0xAB]);
}

#[test]
fn ram_vars_get_addresses_without_output_bytes() {
    let output = run_ok(vec![
        bank_decl("zp", 0x10, "vardata", 0x20),
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "zp",
            vec![
                var_decl("counter", named_type("u8"), None),
                var_decl("pair", named_type("u16"), None),
            ],
        ),
        in_bank(
            "prg",
            vec![
                const_decl(
                    "counter_ptr",
                    Some(pointer_type(named_type("u8"), false)),
                    unary(UnaryOp::AddressOf, ident(&["counter"])),
                ),
                const_decl(
                    "pair_ptr",
                    Some(pointer_type(named_type("u16"), false)),
                    unary(UnaryOp::AddressOf, ident(&["pair"])),
                ),
            ],
        ),
    ]);

    let zp = output.banks.iter().find(|bank| bank.name == "zp").expect("zp");
    assert_eq!(zp.kind, BankKind::Ram);
    assert!(zp.bytes.is_empty());

    // Pointers into ram resolve at link time: counter at 0x10, pair at 0x11.
    assert_eq!(&rom(&output, "prg")[..4], &[0x10, 0x00, 0x11, 0x00]);
}

#[test]
fn bank_overflow_is_reported() {
    let messages = run_err(vec![
        bank_decl("prg", 0x8000, "constdata", 0x2),
        in_bank(
            "prg",
            vec![const_decl(
                "big",
                Some(array_type(named_type("u8"), None)),
                string("toolarge"),
            )],
        ),
    ]);

    assert!(messages
        .iter()
        .any(|message| message.contains("byte(s) left")));
}

#[test]
fn overlapping_explicit_addresses_are_rejected() {
    let messages = run_err(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![
                var_decl("first", named_type("u16"), Some(0x8000)),
                var_decl("second", named_type("u8"), Some(0x8001)),
            ],
        ),
    ]);

    assert!(messages.iter().any(|message| message.contains("overlaps")));
}

#[test]
fn imported_module_names_resolve_through_transclusion() {
    let library = stmt(Statement::File {
        path: "lib.wiz".to_string(),
        items: vec![let_decl("magic", &[], int(0x2A))],
    });

    let output = run_ok(vec![
        library,
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl("m", Some(named_type("u8")), ident(&["magic"]))],
        ),
    ]);

    assert_eq!(rom(&output, "prg")[0], 0x2A);
}

#[test]
fn typeof_collapses_to_the_operand_type() {
    let cast = Expression::new(
        ExpressionKind::Cast {
            operand: Box::new(int(0)),
            target: named_type("u16"),
        },
        sp(),
    );
    let output = run_ok(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "q",
                Some(TypeExpression::TypeOf(Box::new(cast))),
                int(5),
            )],
        ),
    ]);

    assert_eq!(&rom(&output, "prg")[..2], &[0x05, 0x00]);
}

#[test]
fn alignof_is_reported_as_unimplemented() {
    let messages = run_err(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "a",
                Some(named_type("u8")),
                Expression::new(
                    ExpressionKind::TypeQuery {
                        kind: TypeQueryKind::AlignOf,
                        target: named_type("u8"),
                    },
                    sp(),
                ),
            )],
        ),
    ]);

    assert!(messages
        .iter()
        .any(|message| message.contains("alignof is not implemented")));
}

#[test]
fn narrowing_rejects_out_of_range_literals() {
    let messages = run_err(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl("x", Some(named_type("u8")), int(300))],
        ),
    ]);

    assert!(messages
        .iter()
        .any(|message| message.contains("does not fit")));
}

#[test]
fn division_by_zero_is_reported() {
    let messages = run_err(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl(
                "x",
                Some(named_type("u8")),
                binary(BinaryOp::Division, int(1), int(0)),
            )],
        ),
    ]);

    assert!(messages
        .iter()
        .any(|message| message.contains("division by zero")));
}

#[test]
fn config_entries_surface_in_the_output() {
    let output = run_ok(vec![
        stmt(Statement::Config(vec![ConfigEntry {
            name: "format".to_string(),
            value: string("gb"),
            span: sp(),
        }])),
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl("x", Some(named_type("u8")), int(1))],
        ),
    ]);

    let format = output.config.get("format").expect("format entry");
    assert!(matches!(
        &format.kind,
        ExpressionKind::StringLiteral(bytes) if bytes == b"gb"
    ));
}

#[test]
fn constant_folding_covers_shifts_and_bitwise_operators() {
    let value = binary(
        BinaryOp::BitwiseOr,
        binary(BinaryOp::LeftShift, int(1), int(4)),
        binary(BinaryOp::BitwiseAnd, int(0x0F), int(0x03)),
    );
    let output = run_ok(vec![
        bank_decl("prg", 0x8000, "constdata", 0x10),
        in_bank(
            "prg",
            vec![const_decl("x", Some(named_type("u8")), value)],
        ),
    ]);

    assert_eq!(rom(&output, "prg")[0], 0x13);
}

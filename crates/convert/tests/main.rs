//! Structural and behavioral tests over lowered modules (§8).
//!
//! A scenario that never touches the `dyntype` host ABI at runtime (plain numeric arithmetic,
//! static class/vtable dispatch, closures over numbers) is executed for real through `wasmtime`
//! and checked against its actual return value. A scenario that does exercise the dynamic ABI
//! (optional/rest argument shaping, `any` boxing/unboxing) is checked structurally instead —
//! `wasmparser` validation plus the emitted binary's own internal consistency — since faithfully
//! emulating the host runtime's object model is out of scope here (§1 Non-goals).

use std::sync::Arc;
use ts2wasmgc_convert::ident;
use ts2wasmgc_convert::source::{
    BinOp, Expr, FunctionDecl, GlobalDecl, LocalId, Program, Stmt, SwitchCase,
};
use ts2wasmgc_convert::types::{
    ClassDef, FunctionKind, FunctionType, MethodDef, Param, SourceType, SourceTypeId,
};
use ts2wasmgc_convert::{abi_import_count, lower, LowerOptions};
use wasmtime::{Config, Engine, Instance, Linker, Module, Store, Val};

fn number_param(name: &str) -> Param {
    Param {
        name: name.to_string(),
        ty: SourceType::Number,
        optional: false,
    }
}

fn number_fn_type(params: usize) -> Arc<FunctionType> {
    Arc::new(FunctionType {
        params: (0..params).map(|i| number_param(&format!("p{i}"))).collect(),
        return_type: SourceType::Number,
        rest_param: None,
        declare: false,
        kind: FunctionKind::Default,
    })
}

fn id(n: u32) -> Expr {
    Expr::Identifier {
        local: LocalId(n),
        ty: SourceType::Number,
    }
}

fn num(v: f64) -> Expr {
    Expr::NumberLiteral(v)
}

fn validate(bytes: &[u8]) {
    wasmparser::Validator::new()
        .validate_all(bytes)
        .unwrap_or_else(|e| panic!("module failed to validate: {e}"));
}

/// Instantiates a lowered module against a fresh GC/function-references-enabled engine. Every
/// `dyntype` host import is bound to a trap stub via `define_unknown_imports_as_traps`; a test
/// built around a scenario that never calls the dynamic ABI at runtime can then assert on real
/// return values with confidence that a silent fallback to dynamic dispatch would instead trap
/// loudly rather than produce a wrong-but-plausible result.
fn execute(bytes: &[u8]) -> (Store<()>, Instance) {
    let mut config = Config::new();
    config.wasm_function_references(true);
    config.wasm_gc(true);
    let engine = Engine::new(&config).expect("wasm-gc/function-references config should be valid");
    let module = Module::new(&engine, bytes).expect("lowered module should be a well-formed binary");

    let mut linker: Linker<()> = Linker::new(&engine);
    linker
        .define_unknown_imports_as_traps(&module)
        .expect("every `dyntype` import should bind to a trap stub");

    let mut store = Store::new(&engine, ());
    let instance = linker
        .instantiate(&mut store, &module)
        .expect("module should instantiate");
    (store, instance)
}

/// Calls an exported free function of the form `(number...) -> number` end to end. Every defined
/// function's real wasm signature carries a leading closure-context parameter ahead of its source
/// parameters regardless of whether the function itself ever builds a closure (§4.1
/// `function-param-types`); a top-level free function with no enclosing scope of its own always
/// receives a null context, the same convention `lower_call`'s direct-call path pushes at the call
/// site (§4.3).
fn call_number(store: &mut Store<()>, instance: &Instance, name: &str, args: &[f64]) -> f64 {
    let func = instance
        .get_func(&mut *store, name)
        .unwrap_or_else(|| panic!("`{name}` should be exported"));

    let mut wasm_args = Vec::with_capacity(args.len() + 1);
    wasm_args.push(Val::AnyRef(None));
    wasm_args.extend(args.iter().map(|v| Val::F64(v.to_bits())));

    let mut results = vec![Val::F64(0)];
    func.call(&mut *store, &wasm_args, &mut results)
        .unwrap_or_else(|e| panic!("call to `{name}` trapped: {e}"));

    match results[0] {
        Val::F64(bits) => f64::from_bits(bits),
        ref other => panic!("`{name}` should return an f64, got {other:?}"),
    }
}

fn factorial_program() -> Program {
    let n = LocalId(0);
    let ty = number_fn_type(1);

    let body = vec![
        Stmt::If {
            condition: Expr::Binary {
                op: BinOp::Le,
                left: Box::new(id(0)),
                right: Box::new(num(1.0)),
            },
            then_branch: vec![Stmt::Return(Some(num(1.0)))],
            else_branch: vec![],
        },
        Stmt::Return(Some(Expr::Binary {
            op: BinOp::Mul,
            left: Box::new(id(0)),
            right: Box::new(Expr::Call {
                callee: Box::new(Expr::GlobalRef {
                    name: "fact".to_string(),
                    ty: SourceType::Function(ty.clone()),
                }),
                args: vec![Expr::Binary {
                    op: BinOp::Sub,
                    left: Box::new(id(0)),
                    right: Box::new(num(1.0)),
                }],
            }),
        })),
    ];

    let function = FunctionDecl {
        ty,
        mangled_name: "fact".to_string(),
        exported_name: Some("fact".to_string()),
        owner: None,
        params: vec![n],
        body,
        is_declare: false,
        captures: vec![],
    };

    let mut program = Program::default();
    program.functions.push(function);
    program.is_entry = false;
    program
}

/// `function fact(n){ if (n<=1) return 1; return n*fact(n-1); }` — recursion must resolve through
/// a direct `call` to `fact`'s own `FuncId`, never through a closure context, since `fact` never
/// captures anything (§8 scenario 2).
#[test]
fn recursive_factorial_lowers_and_validates() {
    let bytes = lower(&factorial_program(), LowerOptions::new()).expect("factorial should lower");
    validate(&bytes);
}

#[test]
fn recursive_factorial_executes_correctly() {
    let bytes = lower(&factorial_program(), LowerOptions::new()).expect("factorial should lower");
    let (mut store, instance) = execute(&bytes);

    assert_eq!(call_number(&mut store, &instance, "fact", &[0.0]), 1.0);
    assert_eq!(call_number(&mut store, &instance, "fact", &[1.0]), 1.0);
    assert_eq!(call_number(&mut store, &instance, "fact", &[5.0]), 120.0);
}

fn switch_program() -> Program {
    let x = LocalId(0);
    let y = LocalId(1);
    let ty = number_fn_type(1);

    let cases = vec![
        SwitchCase {
            value: num(1.0),
            body: vec![
                Stmt::Expr(Expr::Assign {
                    target: Box::new(id(1)),
                    value: Box::new(num(1.0)),
                }),
                Stmt::Break,
            ],
        },
        SwitchCase {
            value: num(2.0),
            body: vec![],
        },
        SwitchCase {
            value: num(3.0),
            body: vec![
                Stmt::Expr(Expr::Assign {
                    target: Box::new(id(1)),
                    value: Box::new(num(23.0)),
                }),
                Stmt::Break,
            ],
        },
    ];
    let default = vec![Stmt::Expr(Expr::Assign {
        target: Box::new(id(1)),
        value: Box::new(num(0.0)),
    })];

    let body = vec![
        Stmt::Variable {
            local: y,
            ty: SourceType::Number,
            initializer: Some(num(0.0)),
            captured: false,
        },
        Stmt::Switch {
            discriminant: id(0),
            cases,
            default,
        },
        Stmt::Return(Some(id(1))),
    ];

    let function = FunctionDecl {
        ty,
        mangled_name: "pick".to_string(),
        exported_name: Some("pick".to_string()),
        owner: None,
        params: vec![x],
        body,
        is_declare: false,
        captures: vec![],
    };

    let mut program = Program::default();
    program.functions.push(function);
    program
}

/// `switch(x){ case 1: y=1; break; case 2: case 3: y=23; break; default: y=0; }` — case `2` has an
/// empty body and must fall through into case `3`'s body rather than skip straight to `default`
/// (§8 scenario 6).
#[test]
fn switch_with_fallthrough_lowers_and_validates() {
    let bytes = lower(&switch_program(), LowerOptions::new()).expect("switch should lower");
    validate(&bytes);
}

#[test]
fn switch_with_fallthrough_executes_correctly() {
    let bytes = lower(&switch_program(), LowerOptions::new()).expect("switch should lower");
    let (mut store, instance) = execute(&bytes);

    assert_eq!(call_number(&mut store, &instance, "pick", &[1.0]), 1.0);
    // Falls through case 2's empty body into case 3's, not straight to `default`.
    assert_eq!(call_number(&mut store, &instance, "pick", &[2.0]), 23.0);
    assert_eq!(call_number(&mut store, &instance, "pick", &[3.0]), 23.0);
    assert_eq!(call_number(&mut store, &instance, "pick", &[9.0]), 0.0);
}

/// A derived class's inherited method keeps the same vtable slot index as the base class (§8
/// invariant: vtable stability under inheritance).
fn class_hierarchy_program() -> (Program, SourceTypeId) {
    let method_ty = Arc::new(FunctionType {
        params: vec![],
        return_type: SourceType::Number,
        rest_param: None,
        declare: false,
        kind: FunctionKind::Method,
    });
    let ctor_ty = Arc::new(FunctionType {
        params: vec![],
        return_type: SourceType::Void,
        rest_param: None,
        declare: false,
        kind: FunctionKind::Constructor,
    });

    let base = ClassDef {
        id: SourceTypeId(0),
        mangled_name: "Base".to_string(),
        base: None,
        fields: vec![],
        static_fields: vec![],
        methods: vec![MethodDef {
            name: "m".to_string(),
            ty: method_ty.clone(),
        }],
        constructor: ctor_ty.clone(),
    };
    let derived = ClassDef {
        id: SourceTypeId(1),
        mangled_name: "Derived".to_string(),
        base: Some(base.id),
        fields: vec![],
        static_fields: vec![],
        // `m` is not redeclared here, so it must keep `Base`'s vtable slot (inheritance, not
        // override).
        methods: vec![],
        constructor: ctor_ty,
    };
    let derived_id = derived.id;

    let base_ctor = FunctionDecl {
        ty: base.constructor.clone(),
        mangled_name: ident::constructor_name(&base.mangled_name),
        exported_name: None,
        owner: Some(base.id),
        params: vec![],
        body: vec![],
        is_declare: false,
        captures: vec![],
    };
    let derived_ctor = FunctionDecl {
        ty: derived.constructor.clone(),
        mangled_name: ident::constructor_name(&derived.mangled_name),
        exported_name: None,
        owner: Some(derived.id),
        params: vec![],
        body: vec![Stmt::Expr(Expr::SuperCall { args: vec![] })],
        is_declare: false,
        captures: vec![],
    };
    let base_method = FunctionDecl {
        ty: method_ty,
        mangled_name: ident::member_name(&base.mangled_name, "m"),
        exported_name: None,
        owner: Some(base.id),
        params: vec![],
        body: vec![Stmt::Return(Some(num(1.0)))],
        is_declare: false,
        captures: vec![],
    };

    let mut program = Program::default();
    program.classes.push(base);
    program.classes.push(derived);
    program.functions.push(base_ctor);
    program.functions.push(derived_ctor);
    program.functions.push(base_method);
    (program, derived_id)
}

#[test]
fn vtable_slot_is_stable_across_inheritance() {
    let (program, _) = class_hierarchy_program();
    let bytes = lower(&program, LowerOptions::new()).expect("class hierarchy should lower");
    // `Derived`'s `struct.new` for its vtable instance fills in `m`'s slot with the same
    // `ref.func $Base|m` the base class uses (no redeclaration in `derived.methods` above), so if
    // slot assignment drifted between base and derived the vtable-struct field types the
    // validator checks that `struct.new`'s operand against would disagree and this would fail.
    validate(&bytes);
}

/// `new Derived().m()` resolved through the static vtable-slot dispatch path (`lower_class_method_
/// call`), not the dynamic `dyntype_get_property`/`dyntype_invoke` fallback, must actually return
/// the inherited method's own value.
#[test]
fn inherited_method_dispatches_through_the_vtable_and_returns_the_right_value() {
    let (mut program, derived_id) = class_hierarchy_program();

    let run_ty = Arc::new(FunctionType {
        params: vec![],
        return_type: SourceType::Number,
        rest_param: None,
        declare: false,
        kind: FunctionKind::Default,
    });
    let run = FunctionDecl {
        ty: run_ty,
        mangled_name: "run".to_string(),
        exported_name: Some("run".to_string()),
        owner: None,
        params: vec![],
        body: vec![Stmt::Return(Some(Expr::Call {
            callee: Box::new(Expr::PropertyAccess {
                receiver: Box::new(Expr::New {
                    class: derived_id,
                    args: vec![],
                }),
                name: "m".to_string(),
            }),
            args: vec![],
        }))],
        is_declare: false,
        captures: vec![],
    };
    program.functions.push(run);

    let bytes = lower(&program, LowerOptions::new()).expect("class hierarchy should lower");
    let (mut store, instance) = execute(&bytes);
    assert_eq!(call_number(&mut store, &instance, "run", &[]), 1.0);
}

/// A top-level `let total = 0;` global with an initializer must be written by the module-init
/// function rather than baked into the global's own (necessarily constant) initializer expression,
/// since the Data Segment Arena and vtable globals the initializer may reference don't exist until
/// `start` runs.
#[test]
fn global_with_initializer_lowers_and_validates() {
    let mut program = Program::default();
    program.globals.push(GlobalDecl {
        name: "total".to_string(),
        ty: SourceType::Number,
        initializer: Some(num(0.0)),
    });

    let bytes = lower(&program, LowerOptions::new()).expect("global should lower");
    validate(&bytes);
}

/// `function addN(n) { function inner(y) { return n + y; } return inner(10); }`, exported as
/// `addN`. `inner` captures `n` from its enclosing scope (§4.2); calling it back immediately inside
/// `addN` exercises the whole closure-context chain — `struct.new` at the creation site, the narrow
/// + `struct.get` read inside `inner`'s own body — end to end, entirely in core GC instructions
/// with no `dyntype` ABI call involved.
#[test]
fn closure_over_an_outer_number_executes_correctly() {
    let n = LocalId(0);
    let inner_var = LocalId(1);
    let y = LocalId(2);

    let inner_ty = number_fn_type(1);
    let inner = FunctionDecl {
        ty: inner_ty.clone(),
        mangled_name: "addN$inner".to_string(),
        exported_name: None,
        owner: None,
        params: vec![y],
        body: vec![Stmt::Return(Some(Expr::Binary {
            op: BinOp::Add,
            left: Box::new(id(n.0)),
            right: Box::new(id(y.0)),
        }))],
        is_declare: false,
        captures: vec![(n, SourceType::Number)],
    };

    let outer_ty = number_fn_type(1);
    let outer = FunctionDecl {
        ty: outer_ty,
        mangled_name: "addN".to_string(),
        exported_name: Some("addN".to_string()),
        owner: None,
        params: vec![n],
        body: vec![
            Stmt::Variable {
                local: inner_var,
                ty: SourceType::Function(inner_ty.clone()),
                initializer: Some(Expr::FunctionExpr(inner_ty.clone(), abi_import_count())),
                captured: false,
            },
            Stmt::Return(Some(Expr::Call {
                callee: Box::new(Expr::Identifier {
                    local: inner_var,
                    ty: SourceType::Function(inner_ty.clone()),
                }),
                args: vec![num(10.0)],
            })),
        ],
        is_declare: false,
        captures: vec![],
    };

    // `inner` is declared first, so its own assigned `FuncId` is the first defined function after
    // every host ABI import — exactly the index `Expr::FunctionExpr` above is built with.
    let mut program = Program::default();
    program.functions.push(inner);
    program.functions.push(outer);

    let bytes = lower(&program, LowerOptions::new()).expect("closure program should lower");
    let (mut store, instance) = execute(&bytes);

    assert_eq!(call_number(&mut store, &instance, "addN", &[7.0]), 17.0);
    assert_eq!(call_number(&mut store, &instance, "addN", &[0.0]), 10.0);
}

/// `function f(a, b?) { return b; }` called with only `a` supplied: the missing optional argument
/// must be filled with boxed `undefined` (§4.3 "Argument shaping") rather than leaving the wasm
/// call arity short, which would fail to validate.
#[test]
fn omitted_optional_argument_is_filled_with_boxed_undefined() {
    let a = LocalId(0);
    let b = LocalId(1);

    let f_ty = Arc::new(FunctionType {
        params: vec![
            number_param("a"),
            Param {
                name: "b".to_string(),
                ty: SourceType::Any,
                optional: true,
            },
        ],
        return_type: SourceType::Any,
        rest_param: None,
        declare: false,
        kind: FunctionKind::Default,
    });
    let f = FunctionDecl {
        ty: f_ty.clone(),
        mangled_name: "f".to_string(),
        exported_name: None,
        owner: None,
        params: vec![a, b],
        body: vec![Stmt::Return(Some(Expr::Identifier {
            local: b,
            ty: SourceType::Any,
        }))],
        is_declare: false,
        captures: vec![],
    };

    let run_ty = Arc::new(FunctionType {
        params: vec![],
        return_type: SourceType::Any,
        rest_param: None,
        declare: false,
        kind: FunctionKind::Default,
    });
    let run = FunctionDecl {
        ty: run_ty,
        mangled_name: "run".to_string(),
        exported_name: Some("run".to_string()),
        owner: None,
        params: vec![],
        body: vec![Stmt::Return(Some(Expr::Call {
            callee: Box::new(Expr::GlobalRef {
                name: "f".to_string(),
                ty: SourceType::Function(f_ty),
            }),
            args: vec![num(1.0)],
        }))],
        is_declare: false,
        captures: vec![],
    };

    let mut program = Program::default();
    program.functions.push(f);
    program.functions.push(run);

    let bytes = lower(&program, LowerOptions::new()).expect("optional-argument program should lower");
    validate(&bytes);
}

/// `function sum(...nums) { return 0; }` called with three fixed arguments: the rest parameter must
/// pack them into a fresh array envelope rather than leave them as loose operands on the stack
/// (§4.3 "Argument shaping").
#[test]
fn rest_argument_is_packed_into_an_array_envelope() {
    let nums = LocalId(0);

    let sum_ty = Arc::new(FunctionType {
        params: vec![Param {
            name: "nums".to_string(),
            ty: SourceType::Array(Box::new(SourceType::Number)),
            optional: false,
        }],
        return_type: SourceType::Number,
        rest_param: Some(0),
        declare: false,
        kind: FunctionKind::Default,
    });
    let sum = FunctionDecl {
        ty: sum_ty.clone(),
        mangled_name: "sum".to_string(),
        exported_name: None,
        owner: None,
        params: vec![nums],
        body: vec![Stmt::Return(Some(num(0.0)))],
        is_declare: false,
        captures: vec![],
    };

    let run_ty = number_fn_type(0);
    let run = FunctionDecl {
        ty: run_ty,
        mangled_name: "run".to_string(),
        exported_name: Some("run".to_string()),
        owner: None,
        params: vec![],
        body: vec![Stmt::Return(Some(Expr::Call {
            callee: Box::new(Expr::GlobalRef {
                name: "sum".to_string(),
                ty: SourceType::Function(sum_ty),
            }),
            args: vec![num(1.0), num(2.0), num(3.0)],
        }))],
        is_declare: false,
        captures: vec![],
    };

    let mut program = Program::default();
    program.functions.push(sum);
    program.functions.push(run);

    let bytes = lower(&program, LowerOptions::new()).expect("rest-argument program should lower");
    validate(&bytes);
}

/// `function identity(x) { return x; }` called with a `number` literal against an `any` parameter,
/// then that `any` result passed to a `number` parameter, round-trips through both halves of the
/// any-boxing boundary (§4.3 "Boxing to `any`", "Unboxing from `any`") in one program.
#[test]
fn number_round_trips_through_any_boxing_and_unboxing() {
    let x = LocalId(0);
    let identity_ty = Arc::new(FunctionType {
        params: vec![Param {
            name: "x".to_string(),
            ty: SourceType::Any,
            optional: false,
        }],
        return_type: SourceType::Any,
        rest_param: None,
        declare: false,
        kind: FunctionKind::Default,
    });
    let identity = FunctionDecl {
        ty: identity_ty.clone(),
        mangled_name: "identity".to_string(),
        exported_name: None,
        owner: None,
        params: vec![x],
        body: vec![Stmt::Return(Some(Expr::Identifier {
            local: x,
            ty: SourceType::Any,
        }))],
        is_declare: false,
        captures: vec![],
    };

    let takes_number_ty = number_fn_type(1);
    let takes_number = FunctionDecl {
        ty: takes_number_ty.clone(),
        mangled_name: "takesNumber".to_string(),
        exported_name: None,
        owner: None,
        params: vec![LocalId(0)],
        body: vec![Stmt::Return(Some(id(0)))],
        is_declare: false,
        captures: vec![],
    };

    let boxed = LocalId(0);
    let run_ty = number_fn_type(0);
    let run = FunctionDecl {
        ty: run_ty,
        mangled_name: "run".to_string(),
        exported_name: Some("run".to_string()),
        owner: None,
        params: vec![],
        body: vec![
            Stmt::Variable {
                local: boxed,
                ty: SourceType::Any,
                initializer: Some(Expr::Call {
                    callee: Box::new(Expr::GlobalRef {
                        name: "identity".to_string(),
                        ty: SourceType::Function(identity_ty),
                    }),
                    args: vec![num(5.0)],
                }),
                captured: false,
            },
            Stmt::Return(Some(Expr::Call {
                callee: Box::new(Expr::GlobalRef {
                    name: "takesNumber".to_string(),
                    ty: SourceType::Function(takes_number_ty),
                }),
                args: vec![Expr::Identifier {
                    local: boxed,
                    ty: SourceType::Any,
                }],
            })),
        ],
        is_declare: false,
        captures: vec![],
    };

    let mut program = Program::default();
    program.functions.push(identity);
    program.functions.push(takes_number);
    program.functions.push(run);

    let bytes = lower(&program, LowerOptions::new()).expect("any-boxing program should lower");
    validate(&bytes);
}

/// An empty program still assembles into a valid module: one (empty) module-init function, a
/// memory section sized for the reserved data-segment prefix, nothing else.
#[test]
fn empty_program_lowers_to_a_valid_module() {
    let program = Program::default();
    let bytes = lower(&program, LowerOptions::new()).expect("empty program should lower");
    validate(&bytes);
}

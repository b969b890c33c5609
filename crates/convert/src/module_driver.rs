//! The Module Driver (§4.5): walks a resolved [`crate::source::Program`], registers every
//! declaration into a [`ModuleContext`], lowers each function body, and assembles the final
//! [`wasm_encoder::Module`].

use crate::abi::ABI_MODULE;
use crate::access::Access;
use crate::closure::ClosureArena;
use crate::context::{CallKind, FuncId, ModuleContext};
use crate::expr_lower::ExprLowerer;
use crate::function_context::FunctionContext;
use crate::source::{FunctionDecl, Program};
use crate::stmt_lower::StmtLowerer;
use std::collections::HashMap;
use std::sync::Mutex;
use wasm_encoder::{
    CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection, Function,
    FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction, MemorySection,
    MemoryType, Module, StartSection, TypeSection, ValType,
};

/// WebAssembly page size, for sizing the module's own linear memory against the data segment.
const WASM_PAGE_SIZE: u32 = 65536;

/// Knobs controlling how [`lower`] runs, following the same builder-style options pattern as a
/// `Convert` entry point (§10 "Configuration" in the ambient engineering stack).
#[derive(Clone, Debug)]
pub struct LowerOptions {
    /// Run the final [`wasmparser::Validator`] pass over the emitted bytes before returning them
    /// (§4.5 step 6). Defaults to `true`; only ever disabled for debugging this crate itself.
    pub validate: bool,
    /// Lower independent function bodies across a `rayon` thread pool when the `rayon` feature is
    /// enabled (§5 "Parallel function lowering"). Has no effect otherwise.
    pub parallel: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            validate: true,
            parallel: true,
        }
    }
}

impl LowerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Lowers `program` into a complete, (by default) validated `.wasm` binary (§4.5).
pub fn lower(program: &Program, options: LowerOptions) -> crate::Result<Vec<u8>> {
    let mut ctx = ModuleContext::new();

    register_classes(&mut ctx, program)?;
    register_vtable_globals(&mut ctx, program)?;
    register_itables(&mut ctx, program)?;

    for iface in &program.interfaces {
        ctx.type_lower.interface_layout(iface);
    }

    for global in &program.globals {
        ctx.declare_global(global.name.clone(), global.ty.clone())?;
    }

    // Ambient `declare` functions' plain host imports must occupy their index-space block before
    // any defined function (including their own forwarding wrapper) is assigned an id (§4.5).
    for function in &program.functions {
        if function.is_declare {
            let extern_ty = ctx.type_lower.extern_signature_type(&function.ty)?;
            ctx.declare_extern_import(extern_import_name(&function.mangled_name), extern_ty)?;
        }
    }

    for function in &program.functions {
        let func_id = ctx.declare_function(function.mangled_name.clone(), call_kind_of(function), function.ty.clone())?;
        ctx.register_closure_layout(func_id, &function.captures)?;
    }

    let init_func_id = ctx.declare_init_function()?;

    let mut bodies = lower_function_bodies(&mut ctx, program, &options)?;
    let init_body = lower_init_function(&mut ctx, program)?;
    bodies.push(LoweredFunction {
        func_id: init_func_id,
        body: init_body,
    });

    assemble_module(&ctx, program, bodies, init_func_id, &options)
}

fn extern_import_name(mangled_name: &str) -> String {
    format!("{mangled_name}$extern")
}

/// Whether `function` takes a bound `this` (§4.1): an instance method or a constructor, but not a
/// static method, even though a static method still has `owner.is_some()`.
fn call_kind_of(function: &FunctionDecl) -> CallKind {
    if function.owner.is_some() && !matches!(function.ty.kind, crate::types::FunctionKind::Static) {
        CallKind::Method
    } else {
        CallKind::Function
    }
}

/// Registers every class in base-before-derived order (§4.1 invariant), topologically sorting by
/// repeatedly registering classes whose base (if any) is already registered.
fn register_classes(ctx: &mut ModuleContext, program: &Program) -> crate::Result<()> {
    let mut remaining: Vec<&crate::types::ClassDef> = program.classes.iter().collect();
    let mut registered = std::collections::HashSet::new();

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut ready_classes = Vec::new();
        remaining.retain(|class| {
            let ready = class.base.map_or(true, |base| registered.contains(&base));
            if ready {
                ready_classes.push(*class);
                registered.insert(class.id);
            }
            !ready
        });

        for class in ready_classes {
            ctx.type_lower.class_layout(class)?;
            ctx.register_class_meta(class.id, class.mangled_name.clone(), class.base);
        }

        if remaining.len() == before {
            return Err(crate::error::LowerError::invariant(
                "class hierarchy contains a cycle or references an unregistered base",
            ));
        }
    }

    Ok(())
}

/// Declares one vtable global per registered class (§4.5), written once by the module-init
/// function built in [`lower_init_function`].
fn register_vtable_globals(ctx: &mut ModuleContext, program: &Program) -> crate::Result<()> {
    for class in &program.classes {
        let heap_type = ctx.type_lower.class_layout_by_id(class.id)?.vtable_struct.heap_type;
        ctx.declare_class_vtable_global(class.id, heap_type);
    }
    Ok(())
}

/// Writes every registered class's itable bytes into the data segment up front (§3 "Itable
/// layout"), so a `Class`-to-`Interface` cast anywhere in a function body can assume the offset
/// already exists rather than racing its own construction during per-function lowering.
fn register_itables(ctx: &mut ModuleContext, program: &Program) -> crate::Result<()> {
    for class in &program.classes {
        ctx.itable_offset_for_class(class.id)?;
    }
    Ok(())
}

struct LoweredFunction {
    func_id: FuncId,
    body: Function,
}

/// Lowers every function's body, optionally in parallel (§5). The whole registration tables are
/// only ever read once lowering starts, but `StmtLowerer`/`ExprLowerer` require genuine `&mut
/// ModuleContext` access (memoized type-lowering caches mutate on a miss) — so `ctx` is wrapped in
/// a [`Mutex`] and each worker locks it for the full duration of one function's lowering. This is
/// correct but coarse: it serializes most of the actual work, trading true parallelism for
/// soundness without redesigning every lowering call site to thread a finer-grained lock. A future
/// pass could split `ModuleContext` into a read-only registration snapshot and a separately locked
/// mutable cache to recover real concurrency.
fn lower_function_bodies(
    ctx: &mut ModuleContext,
    program: &Program,
    options: &LowerOptions,
) -> crate::Result<Vec<LoweredFunction>> {
    let allocations = crate::allocations::Allocations::new();
    let ctx_lock = Mutex::new(std::mem::take(ctx));

    let result = run_lowering(&ctx_lock, program, &allocations, options);

    *ctx = ctx_lock
        .into_inner()
        .expect("module context mutex poisoned by a prior panic");
    result
}

#[cfg(feature = "rayon")]
fn run_lowering(
    ctx_lock: &Mutex<ModuleContext>,
    program: &Program,
    allocations: &crate::allocations::Allocations,
    options: &LowerOptions,
) -> crate::Result<Vec<LoweredFunction>> {
    if options.parallel {
        use rayon::prelude::*;
        return program
            .functions
            .par_iter()
            .map(|function| lower_one_function(ctx_lock, function, allocations))
            .collect();
    }

    program
        .functions
        .iter()
        .map(|function| lower_one_function(ctx_lock, function, allocations))
        .collect()
}

#[cfg(not(feature = "rayon"))]
fn run_lowering(
    ctx_lock: &Mutex<ModuleContext>,
    program: &Program,
    allocations: &crate::allocations::Allocations,
    options: &LowerOptions,
) -> crate::Result<Vec<LoweredFunction>> {
    let _ = options;
    program
        .functions
        .iter()
        .map(|function| lower_one_function(ctx_lock, function, allocations))
        .collect()
}

fn lower_one_function(
    ctx_lock: &Mutex<ModuleContext>,
    function: &FunctionDecl,
    allocations: &crate::allocations::Allocations,
) -> crate::Result<LoweredFunction> {
    let mut ctx_guard = ctx_lock
        .lock()
        .expect("module context mutex poisoned by a prior panic");
    let ctx: &mut ModuleContext = &mut ctx_guard;

    let func_id = ctx.function_id(&function.mangled_name)?;

    if function.is_declare {
        let body = lower_declare_wrapper(ctx, function, allocations)?;
        return Ok(LoweredFunction { func_id, body });
    }

    let has_this = matches!(call_kind_of(function), CallKind::Method);
    // Real wasm parameter 0 is always the closure-context ref; parameter 1 is `this` for an
    // instance method or constructor. Source parameters start right after (§4.1
    // `function-param-types`). `FunctionContext` must be told the *real* leading count or its
    // local allocator silently reuses a source parameter's index for the first scratch local
    // (`alloc_local` just returns `param_count + extra_locals.len()`).
    let leading = 1 + if has_this { 1 } else { 0 };
    let param_count = leading + function.params.len() as u32;
    let mut func_ctx = FunctionContext::new(allocations, param_count);
    let mut locals = HashMap::new();
    let mut closures = ClosureArena::new();

    // §4.2 "On scope entry": a function that itself captures variables from its enclosing scope
    // receives them through wasm local 0, typed generically as `anyref` by the calling convention
    // (the same function type is shared across every closure with a different concrete capture
    // shape, per `function-closure-struct`'s own uniform `funcref`). Narrow it once, up front,
    // exactly like `this`'s own narrowing below, so every capture read downstream is a plain
    // `struct.get` rather than a `ref.cast` at every use.
    let scope = match ctx.closure_layout_of(func_id).cloned() {
        Some(layout) => {
            let context_ref = wasm_encoder::RefType {
                nullable: true,
                heap_type: layout.struct_type.heap_type,
            };
            let own_context_local = func_ctx.alloc_local(ValType::Ref(context_ref));
            func_ctx.emit(&Instruction::LocalGet(0));
            func_ctx.emit(&Instruction::RefCast(context_ref));
            func_ctx.emit(&Instruction::LocalSet(own_context_local.0));
            closures.root_with_layout(own_context_local, layout)
        }
        None => {
            let context_heap = ctx.type_lower.function_closure_struct().heap_type;
            closures.root(crate::function_context::LocalIndex(0), context_heap)
        }
    };

    for (index, param_local) in function.params.iter().enumerate() {
        let ty = function
            .ty
            .params
            .get(index)
            .map(|p| p.ty.clone())
            .unwrap_or(crate::types::SourceType::Any);
        locals.insert(
            *param_local,
            Access::LocalSlot {
                local: crate::function_context::LocalIndex(leading + index as u32),
                ty,
            },
        );
    }

    // `this` (wasm local 1, plain nullable `anyref` per `func_signature_type`) is narrowed once,
    // up front, into a fresh local typed as the owning class's own instance struct, so every
    // member access against it downstream is a concrete `struct.get`/`struct.set`, not a cast at
    // every use (§4.5 step 3). The downcast is always legal at validation time: every concrete
    // struct type is an implicit subtype of `anyref`, so `ref.cast` from `anyref` never fails to
    // validate (only to execute, if the runtime value is actually some other type).
    let mut this_local = None;
    if has_this {
        let owner = function
            .owner
            .ok_or_else(|| crate::error::LowerError::invariant("method call kind implies an owner"))?;
        let instance_heap = ctx.type_lower.class_layout_by_id(owner)?.instance_struct.heap_type;
        let instance_ref = wasm_encoder::RefType {
            nullable: false,
            heap_type: instance_heap,
        };
        let local = func_ctx.alloc_local(ValType::Ref(instance_ref));
        func_ctx.emit(&Instruction::LocalGet(1));
        func_ctx.emit(&Instruction::RefCast(instance_ref));
        func_ctx.emit(&Instruction::LocalSet(local.0));
        locals.insert(
            crate::source::LocalId::THIS,
            Access::LocalSlot {
                local,
                ty: crate::types::SourceType::Class(owner),
            },
        );
        this_local = Some(local);
    }

    if matches!(function.ty.kind, crate::types::FunctionKind::Constructor) {
        let this_local = this_local
            .ok_or_else(|| crate::error::LowerError::invariant("constructor has no bound `this`"))?;
        func_ctx.set_return_slot(this_local);
    }

    {
        let mut stmt_lowerer = StmtLowerer {
            ctx,
            func: &mut func_ctx,
            locals: &mut locals,
            closures: &closures,
            scope,
            owner_class: function.owner,
        };

        // §4.5 step 4: a constructor with a base class but no explicit leading `super(...)` call
        // gets one emitted implicitly, exactly as if the body had started with `super();`.
        if matches!(function.ty.kind, crate::types::FunctionKind::Constructor) {
            if let Some(base) = ctx.class_base(function.owner.expect("constructor has an owner"))? {
                let has_explicit_super = matches!(
                    function.body.first(),
                    Some(crate::source::Stmt::Expr(crate::source::Expr::SuperCall { .. }))
                );
                if !has_explicit_super {
                    stmt_lowerer.lower_implicit_super_call(base)?;
                }
            }
        }

        stmt_lowerer.lower_block(&function.body)?;
    }

    // A path that doesn't explicitly `return` is a front-end bug for a non-`void` function, but
    // the validator still requires every reachable fallthrough to type-check; `unreachable` plugs
    // that without asserting anything about whether the path is actually reachable. `void`
    // functions legitimately fall off the end, so they get a bare close.
    if !matches!(function.ty.return_type, crate::types::SourceType::Void) {
        func_ctx.emit(&Instruction::Unreachable);
    }
    func_ctx.emit(&Instruction::End);

    let body = func_ctx.finish().into_function();
    Ok(LoweredFunction { func_id, body })
}

/// Synthesizes the thin forwarding wrapper an ambient `declare` function gets (§4.5): it has the
/// calling-convention-complete signature every call site expects, and simply forwards its source
/// parameters into the plain host import registered for it during registration, skipping the
/// leading context (and, for a declared method, `this`) parameter the import itself doesn't take.
fn lower_declare_wrapper(
    ctx: &ModuleContext,
    function: &FunctionDecl,
    allocations: &crate::allocations::Allocations,
) -> crate::Result<Function> {
    let leading = 1 + if matches!(call_kind_of(function), CallKind::Method) { 1 } else { 0 };
    let param_count = leading + function.params.len() as u32;
    let mut func_ctx = FunctionContext::new(allocations, param_count);

    for index in 0..function.ty.params.len() as u32 {
        func_ctx.emit(&Instruction::LocalGet(leading + index));
    }

    let extern_id = ctx.function_id(&extern_import_name(&function.mangled_name))?;
    func_ctx.emit(&Instruction::Call(extern_id.0));
    func_ctx.emit(&Instruction::End);

    Ok(func_ctx.finish().into_function())
}

/// Builds the module-init function (§4.4, §4.5): runs every global initializer in declaration
/// order, then populates every class's vtable instance, then — for the entry module — calls
/// `main`. Registered as the module's `start` function unconditionally, since vtable population
/// must happen before any constructor runs regardless of whether this module is the entry module.
///
/// Global initializers are assumed not to themselves allocate a closure (no expression here
/// creates or captures into a nested scope); the throwaway root scope below exists only so
/// `ExprLowerer` has somewhere to resolve identifiers against.
fn lower_init_function(ctx: &mut ModuleContext, program: &Program) -> crate::Result<Function> {
    let allocations = crate::allocations::Allocations::new();
    let mut func_ctx = FunctionContext::new(&allocations, 0);
    let locals = HashMap::new();
    let mut closures = ClosureArena::new();
    let context_heap = ctx.type_lower.function_closure_struct().heap_type;
    let scope = closures.root(crate::function_context::LocalIndex(0), context_heap);

    for global in &program.globals {
        if let Some(initializer) = &global.initializer {
            let id = ctx.global_id(&global.name)?;
            let mut lowerer = ExprLowerer {
                ctx,
                func: &mut func_ctx,
                locals: &locals,
                closures: &closures,
                scope,
                owner_class: None,
            };
            lowerer.lower_value(initializer)?;
            func_ctx.emit(&Instruction::GlobalSet(id.0));
        }
    }

    for class in &program.classes {
        let layout = ctx.type_lower.class_layout_by_id(class.id)?.clone();
        for method_name in &layout.vtable_slot_order {
            let impl_name = layout
                .method_impls
                .get(method_name)
                .expect("every vtable slot has a recorded implementation");
            let func_id = ctx.function_id(impl_name)?;
            func_ctx.emit(&Instruction::RefFunc(func_id.0));
        }
        func_ctx.emit(&Instruction::StructNew(layout.vtable_struct.wasm_type.0));
        let vtable_global = ctx.class_vtable_global(class.id)?;
        func_ctx.emit(&Instruction::GlobalSet(vtable_global.0));
    }

    if program.is_entry {
        if let Some(entry) = program.functions.iter().find(|f| f.mangled_name == "main") {
            let id = ctx.function_id(&entry.mangled_name)?;
            func_ctx.emit(&Instruction::Call(id.0));
            if !matches!(entry.ty.return_type, crate::types::SourceType::Void) {
                func_ctx.emit(&Instruction::Drop);
            }
        }
    }

    func_ctx.emit(&Instruction::End);
    Ok(func_ctx.finish().into_function())
}

fn default_const_expr(val_type: ValType) -> ConstExpr {
    match val_type {
        ValType::I32 => ConstExpr::i32_const(0),
        ValType::I64 => ConstExpr::i64_const(0),
        ValType::F32 => ConstExpr::f32_const(0.0),
        ValType::F64 => ConstExpr::f64_const(0.0),
        ValType::Ref(r) => ConstExpr::ref_null(r.heap_type),
        ValType::V128 => unreachable!("no source type lowers to v128"),
    }
}

fn assemble_module(
    ctx: &ModuleContext,
    program: &Program,
    bodies: Vec<LoweredFunction>,
    init_func_id: FuncId,
    options: &LowerOptions,
) -> crate::Result<Vec<u8>> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    for sub_type in ctx.type_lower.definitions() {
        types.rec(std::iter::once(sub_type.clone()));
    }
    module.section(&types);

    let mut imports = ImportSection::new();
    for (abi_function, _func_id) in ctx.abi.imports_in_order() {
        let wasm_type = ctx.abi_function_wasm_type(abi_function);
        imports.import(ABI_MODULE, abi_function.import_name(), EntityType::Function(wasm_type.0));
    }
    for (function, wasm_type) in program
        .functions
        .iter()
        .filter(|f| f.is_declare)
        .zip(ctx.extern_imports())
    {
        imports.import(
            ABI_MODULE,
            &extern_import_name(&function.mangled_name),
            EntityType::Function(wasm_type.0),
        );
    }
    module.section(&imports);

    let mut functions = FunctionSection::new();
    let mut code = CodeSection::new();
    let mut bodies = bodies;
    bodies.sort_by_key(|f| f.func_id.0);
    for lowered in &bodies {
        let wasm_type = ctx.function_signature(lowered.func_id).wasm_type;
        functions.function(wasm_type.0);
        code.function(&lowered.body);
    }
    module.section(&functions);

    // Name pointers passed to the host ABI are offsets into this module's own linear memory
    // (§6), so the module must own (not import) memory 0, sized to hold the whole data segment.
    let data_bytes = ctx.data_segment.bytes();
    let min_pages = (data_bytes.len() as u32).div_ceil(WASM_PAGE_SIZE).max(1);
    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: min_pages as u64,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut globals = GlobalSection::new();
    for (index, source_global) in program.globals.iter().enumerate() {
        let _ = source_global;
        let val_type = ctx.global_val_type(crate::context::GlobalId(index as u32));
        globals.global(
            GlobalType {
                val_type,
                mutable: true,
                shared: false,
            },
            &default_const_expr(val_type),
        );
    }
    for val_type in ctx.synthetic_global_val_types() {
        globals.global(
            GlobalType {
                val_type,
                mutable: true,
                shared: false,
            },
            &default_const_expr(val_type),
        );
    }
    module.section(&globals);

    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    for function in &program.functions {
        if let Some(name) = &function.exported_name {
            let id = ctx.function_id(&function.mangled_name)?;
            exports.export(name, ExportKind::Func, id.0);
        }
    }
    module.section(&exports);

    // Global initializers and vtable population must run before anything else touches a global
    // or constructs an instance, so the module-init function is always the `start` function, not
    // only for the entry module (§4.4, §4.5).
    module.section(&StartSection {
        function_index: init_func_id.0,
    });

    module.section(&code);

    let mut data = DataSection::new();
    data.active(0, &ConstExpr::i32_const(0), ctx.data_segment.bytes().to_vec());
    module.section(&data);

    let bytes = module.finish();

    if options.validate {
        let mut validator = wasmparser::Validator::new();
        validator
            .validate_all(&bytes)
            .map_err(|e| crate::error::LowerError::ValidationFailure(e.to_string()))?;
    }

    Ok(bytes)
}

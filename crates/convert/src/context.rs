//! The [`ModuleContext`]: the driver's registration tables for functions, globals, and the host
//! ABI, plus the two caches the whole lowering engine shares (§5).
//!
//! One struct holding every table a later lowering phase needs to look an identifier up in, built
//! incrementally during the Module Driver's registration walk and then only *read* during
//! per-function lowering (§5 "Parallel function lowering").

use crate::abi::{AbiFunction, AbiTable};
use crate::data_segment::DataSegmentArena;
use crate::type_lower::TypeLowerer;
use crate::types::SourceTypeId;
use indexmap::IndexMap;
use wasm_encoder::{HeapType, RefType, ValType};

/// Index of a function in the eventual module's function index space (imports first, then
/// defined functions, matching core WebAssembly's index space rules).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Index of a global in the eventual module's global index space.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

/// Index of a WebAssembly type (a recursive group member) registered with the module's type
/// section.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct WasmTypeId(pub u32);

/// Whether a call site needs to pass `this` as an extra argument: the usual distinction between
/// plain calls and method calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallKind {
    Function,
    Method,
}

/// A class's mangled name and base, recorded once during registration (§4.5).
#[derive(Clone, Debug)]
struct ClassMeta {
    mangled_name: String,
    base: Option<SourceTypeId>,
}

/// A function's calling-convention-complete signature: context parameter, optional `this`, then
/// the source parameters (§4.1 `function-param-types`).
#[derive(Clone, Debug)]
pub struct FunctionSignature {
    pub call_kind: CallKind,
    pub ty: std::sync::Arc<crate::types::FunctionType>,
    pub wasm_type: WasmTypeId,
}

/// The shared state built during the Module Driver's registration pass (§4.5) and consulted
/// read-only during expression/statement lowering (§5).
///
/// The module's function index space is imports-then-defined, in three fixed blocks: the host ABI
/// (§6, always `AbiTable::new`'s full fixed set, imported before anything else), then one plain
/// import per ambient `declare` binding (§4.5), then every defined function body. The first two
/// blocks are only ever grown during registration, before any function body is lowered, so
/// `abi_import_count` and `extern_types.len()` are stable offsets by the time anything indexes into
/// `func_signatures`.
pub struct ModuleContext {
    /// Mangled name → assigned function index. Also the dedup key preventing a function from
    /// being registered twice. Covers both ambient imports (keyed by the bare mangled name) and
    /// defined functions.
    func_ids: IndexMap<String, FuncId>,
    func_signatures: Vec<FunctionSignature>,
    extern_types: Vec<WasmTypeId>,
    abi_import_count: u32,
    /// `AbiFunction`'s assigned import index → its `func` type index, parallel to
    /// `abi.imports_in_order()`.
    abi_wasm_types: Vec<WasmTypeId>,
    global_ids: IndexMap<String, GlobalId>,
    global_types: Vec<crate::types::SourceType>,
    global_val_types: Vec<ValType>,
    /// Class id → the global holding that class's singleton vtable instance (§4.5). Populated by
    /// the Module Driver once per registered class, written once by the module-init function.
    class_vtable_globals: IndexMap<SourceTypeId, GlobalId>,
    /// `ValType` for each vtable global, parallel to (appended after) `global_val_types`, since
    /// vtable globals share the module's global index space with source-level globals but aren't
    /// themselves declared by any `GlobalDecl`.
    synthetic_global_types: Vec<ValType>,
    /// Class id → mangled name and base class, recorded during registration (§4.5) so method
    /// dispatch and `super(...)` can resolve a class's constructor/vtable members without needing
    /// the original `ClassDef` again.
    class_meta: IndexMap<SourceTypeId, ClassMeta>,
    /// A function's own closure-context struct layout (§4.2), registered once up front during
    /// the Module Driver's registration pass so the function's own body (narrowing its context
    /// parameter) and every call site that creates a closure value over it (building the struct)
    /// agree on the exact same wasm struct type.
    closure_layouts: IndexMap<FuncId, crate::type_lower::ClosureContextLayout>,
    /// The raw capture list backing each entry in `closure_layouts`, in field order, so a
    /// `Expr::FunctionExpr` creation site can read each captured local's current value by its
    /// original id without having to parse it back out of the layout's string-keyed slots.
    closure_captures: IndexMap<FuncId, Vec<(crate::source::LocalId, crate::types::SourceType)>>,

    pub type_lower: TypeLowerer,
    pub data_segment: DataSegmentArena,
    pub abi: AbiTable,
}

impl ModuleContext {
    pub fn new() -> Self {
        let abi = AbiTable::new();
        let mut type_lower = TypeLowerer::new();
        let abi_import_count = abi.imports_in_order().count() as u32;
        let abi_wasm_types = abi
            .imports_in_order()
            .map(|(function, _)| {
                let (params, results) = function.wasm_signature();
                type_lower.func_type_index_raw(params, results)
            })
            .collect();

        Self {
            func_ids: IndexMap::new(),
            func_signatures: Vec::new(),
            extern_types: Vec::new(),
            abi_import_count,
            global_ids: IndexMap::new(),
            global_types: Vec::new(),
            global_val_types: Vec::new(),
            class_vtable_globals: IndexMap::new(),
            synthetic_global_types: Vec::new(),
            class_meta: IndexMap::new(),
            closure_layouts: IndexMap::new(),
            closure_captures: IndexMap::new(),
            type_lower,
            data_segment: DataSegmentArena::new(),
            abi,
            abi_wasm_types,
        }
    }

    /// The [`WasmTypeId`] of the `func` type for `function`'s import (§6). Every [`AbiFunction`]
    /// is imported eagerly at construction, so this is always a plain lookup.
    pub fn abi_function_wasm_type(&self, function: AbiFunction) -> WasmTypeId {
        self.abi_wasm_types[self.abi.get(function).0 as usize]
    }

    /// Registers the plain host import backing an ambient `declare` function (§4.5), occupying
    /// the next unused index in the "extern imports" block. Must be called for every ambient
    /// function before any [`Self::declare_function`] call, since the two blocks' sizes must be
    /// final before defined-function indices are assigned.
    pub fn declare_extern_import(&mut self, mangled_name: String, wasm_type: WasmTypeId) -> crate::Result<FuncId> {
        let id = FuncId(self.abi_import_count + self.extern_types.len() as u32);
        self.extern_types.push(wasm_type);

        if self.func_ids.insert(mangled_name.clone(), id).is_some() {
            return Err(crate::error::LowerError::invariant(format!(
                "function `{mangled_name}` registered more than once"
            )));
        }

        Ok(id)
    }

    /// Every extern import registered via [`Self::declare_extern_import`], in assigned order —
    /// consumed once by the Module Driver's import-section pass.
    pub fn extern_imports(&self) -> impl Iterator<Item = WasmTypeId> + '_ {
        self.extern_types.iter().copied()
    }

    /// Registers a function, returning its assigned [`FuncId`]. Calling this twice for the same
    /// `mangled_name` is an [`crate::error::LowerError::InvariantViolation`]: mangled names are
    /// meant to be unique per declaration (§3 "Mangled name"). For an ambient `declare` function,
    /// this registers the thin forwarding wrapper (§4.5), not the extern import itself — callers
    /// look the import up separately via the `$extern`-suffixed name registered by
    /// [`Self::declare_extern_import`].
    pub fn declare_function(
        &mut self,
        mangled_name: String,
        call_kind: CallKind,
        ty: std::sync::Arc<crate::types::FunctionType>,
    ) -> crate::Result<FuncId> {
        let wasm_type = self.type_lower.func_signature_type(call_kind, &ty)?;
        let id = FuncId(
            self.abi_import_count + self.extern_types.len() as u32 + self.func_signatures.len() as u32,
        );
        self.func_signatures.push(FunctionSignature {
            call_kind,
            ty,
            wasm_type,
        });

        if self.func_ids.insert(mangled_name.clone(), id).is_some() {
            return Err(crate::error::LowerError::invariant(format!(
                "function `{mangled_name}` registered more than once"
            )));
        }

        Ok(id)
    }

    pub fn function_id(&self, mangled_name: &str) -> crate::Result<FuncId> {
        self.func_ids.get(mangled_name).copied().ok_or_else(|| {
            anyhow::Error::from(crate::error::LowerError::Resolution {
                name: mangled_name.to_string(),
            })
        })
    }

    /// The signature of a defined function (not an extern import or ABI import — callers never
    /// hold a [`FuncId`] for those except to emit a bare `call`).
    pub fn function_signature(&self, id: FuncId) -> &FunctionSignature {
        let index = id.0 - self.abi_import_count - self.extern_types.len() as u32;
        &self.func_signatures[index as usize]
    }

    /// The [`WasmTypeId`] to record in the `FunctionSection`/`ImportSection` entry for `id`,
    /// whichever of the three index-space blocks it falls in.
    pub fn wasm_type_of(&self, id: FuncId) -> WasmTypeId {
        let extern_start = self.abi_import_count;
        let defined_start = extern_start + self.extern_types.len() as u32;

        if id.0 < extern_start {
            // Resolved by iterating `abi.imports_in_order()` directly at the call site; ABI
            // imports never reach this path since the Module Driver writes them up front.
            unreachable!("ABI import ids are written directly from `AbiTable::imports_in_order`")
        } else if id.0 < defined_start {
            self.extern_types[(id.0 - extern_start) as usize]
        } else {
            self.func_signatures[(id.0 - defined_start) as usize].wasm_type
        }
    }

    pub fn function_count(&self) -> u32 {
        self.abi_import_count + self.extern_types.len() as u32 + self.func_signatures.len() as u32
    }

    /// Registers the synthetic module-init function (§4.4 "module-init ordering", §4.5): the
    /// `start` section target that runs every global initializer and populates every class's
    /// vtable instance before `main` (if any) runs. Unlike [`Self::declare_function`], this skips
    /// the calling-convention-complete wrapping — a `start` function must take no parameters and
    /// return nothing, so it gets a bare `() -> ()` type instead of the usual leading context
    /// parameter.
    pub fn declare_init_function(&mut self) -> crate::Result<FuncId> {
        let wasm_type = self.type_lower.func_type_index_raw(Vec::new(), Vec::new());
        let ty = std::sync::Arc::new(crate::types::FunctionType {
            params: Vec::new(),
            return_type: crate::types::SourceType::Void,
            rest_param: None,
            declare: false,
            kind: crate::types::FunctionKind::Default,
        });
        let id = FuncId(
            self.abi_import_count + self.extern_types.len() as u32 + self.func_signatures.len() as u32,
        );
        self.func_signatures.push(FunctionSignature {
            call_kind: CallKind::Function,
            ty,
            wasm_type,
        });
        Ok(id)
    }

    /// Records `class`'s mangled name and base, for later resolution of its constructor and
    /// vtable members by id alone (§4.5). Must be called once per class during registration,
    /// before any function body is lowered.
    pub fn register_class_meta(&mut self, class: SourceTypeId, mangled_name: String, base: Option<SourceTypeId>) {
        self.class_meta.insert(class, ClassMeta { mangled_name, base });
    }

    pub fn class_mangled_name(&self, class: SourceTypeId) -> crate::Result<&str> {
        self.class_meta
            .get(&class)
            .map(|meta| meta.mangled_name.as_str())
            .ok_or_else(|| {
                crate::error::LowerError::invariant(format!("class {class:?} was never registered")).into()
            })
    }

    pub fn class_base(&self, class: SourceTypeId) -> crate::Result<Option<SourceTypeId>> {
        self.class_meta
            .get(&class)
            .map(|meta| meta.base)
            .ok_or_else(|| {
                crate::error::LowerError::invariant(format!("class {class:?} was never registered")).into()
            })
    }

    /// Declares the global holding `class`'s singleton vtable instance, returning its assigned
    /// [`GlobalId`] in the module's shared global index space (source globals first, then one
    /// vtable global per class, in registration order). The value is written once by the
    /// module-init function (§4.5); nothing else ever writes it.
    pub fn declare_class_vtable_global(&mut self, class: SourceTypeId, vtable_heap_type: HeapType) -> GlobalId {
        let id = GlobalId(self.global_types.len() as u32 + self.synthetic_global_types.len() as u32);
        self.synthetic_global_types.push(ValType::Ref(RefType {
            nullable: true,
            heap_type: vtable_heap_type,
        }));
        self.class_vtable_globals.insert(class, id);
        id
    }

    pub fn class_vtable_global(&self, class: SourceTypeId) -> crate::Result<GlobalId> {
        self.class_vtable_globals.get(&class).copied().ok_or_else(|| {
            crate::error::LowerError::invariant(format!("class {class:?} has no vtable global")).into()
        })
    }

    /// Returns `class`'s itable offset in the data segment, writing the itable's bytes on first
    /// reference (§3 "Itable layout"). Every declared field and method contributes one entry,
    /// since interfaces here are structural: any class can be viewed through any interface its
    /// members happen to satisfy, so the itable can't be scoped to a particular declared interface
    /// ahead of time.
    pub fn itable_offset_for_class(&mut self, class: SourceTypeId) -> crate::Result<u32> {
        let layout = self.type_lower.class_layout_by_id(class)?.clone();
        let mut entries: Vec<crate::data_segment::ItableEntry> = layout
            .field_slots
            .iter()
            .map(|(name, &slot)| crate::data_segment::ItableEntry {
                name: name.clone(),
                kind: crate::data_segment::ItableEntryKind::Field,
                slot_index: slot,
            })
            .chain(
                layout
                    .method_slots
                    .iter()
                    .map(|(name, &slot)| crate::data_segment::ItableEntry {
                        name: name.clone(),
                        kind: crate::data_segment::ItableEntryKind::Method,
                        slot_index: slot,
                    }),
            )
            .collect();
        // HashMap iteration order isn't stable across runs; entries are sorted so the same class
        // always produces the same itable bytes.
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(self.data_segment.itable_offset(class.0, move || entries))
    }

    /// Registers `id`'s own closure-context struct layout (§4.2), if it captures anything.
    /// Must run during registration, before any function body is lowered, so both the function's
    /// own body and any call site that creates a closure value over it see the same layout.
    pub fn register_closure_layout(
        &mut self,
        id: FuncId,
        captures: &[(crate::source::LocalId, crate::types::SourceType)],
    ) -> crate::Result<()> {
        if captures.is_empty() {
            return Ok(());
        }
        let named: Vec<(String, crate::types::SourceType)> = captures
            .iter()
            .map(|(local, ty)| (crate::closure::capture_key(*local), ty.clone()))
            .collect();
        let layout = self.type_lower.closure_context_layout(&named)?;
        self.closure_layouts.insert(id, layout);
        self.closure_captures.insert(id, captures.to_vec());
        Ok(())
    }

    /// The closure-context struct layout registered for `id`, if it captures anything.
    pub fn closure_layout_of(&self, id: FuncId) -> Option<&crate::type_lower::ClosureContextLayout> {
        self.closure_layouts.get(&id)
    }

    /// The raw `(local, type)` capture list registered for `id`, in the same field order as its
    /// `closure_layout_of` struct, if it captures anything.
    pub fn closure_captures_of(&self, id: FuncId) -> Option<&[(crate::source::LocalId, crate::types::SourceType)]> {
        self.closure_captures.get(&id).map(Vec::as_slice)
    }

    /// Every synthetic (vtable) global's `ValType`, in the order they occupy the tail of the
    /// global index space — consumed once by the Module Driver's global-section pass.
    pub fn synthetic_global_val_types(&self) -> impl Iterator<Item = ValType> + '_ {
        self.synthetic_global_types.iter().copied()
    }

    pub fn declare_global(
        &mut self,
        name: String,
        ty: crate::types::SourceType,
    ) -> crate::Result<GlobalId> {
        let val_type = self.type_lower.wasm_value_type(&ty)?;
        let id = GlobalId(self.global_types.len() as u32);
        self.global_types.push(ty);
        self.global_val_types.push(val_type);

        if self.global_ids.insert(name.clone(), id).is_some() {
            return Err(crate::error::LowerError::invariant(format!(
                "global `{name}` registered more than once"
            )));
        }

        Ok(id)
    }

    pub fn global_id(&self, name: &str) -> crate::Result<GlobalId> {
        self.global_ids.get(name).copied().ok_or_else(|| {
            anyhow::Error::from(crate::error::LowerError::Resolution {
                name: name.to_string(),
            })
        })
    }

    pub fn global_type(&self, id: GlobalId) -> &crate::types::SourceType {
        &self.global_types[id.0 as usize]
    }

    pub fn global_val_type(&self, id: GlobalId) -> ValType {
        self.global_val_types[id.0 as usize]
    }

    pub fn global_count(&self) -> u32 {
        self.global_types.len() as u32
    }

    /// Total size of the module's global index space: source globals plus one vtable global per
    /// registered class.
    pub fn total_global_count(&self) -> u32 {
        self.global_types.len() as u32 + self.synthetic_global_types.len() as u32
    }
}

impl Default for ModuleContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("functions", &self.func_signatures.len())
            .field("globals", &self.global_types.len())
            .finish_non_exhaustive()
    }
}

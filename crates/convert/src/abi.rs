//! The host runtime ABI import table (§6).
//!
//! Every `dyntype_*`/`struct_get_dyn_*`/`find_index` import is represented as a `static` table
//! entry rather than constructed ad hoc at each call site, following the same named-import
//! registration table pattern as [`crate::context`]: callers ask for an import by a typed enum
//! variant, and [`AbiTable`] is responsible for importing it into the module on first reference,
//! memoized exactly like the Type Lowerer memoizes types.

use crate::context::FuncId;
use indexmap::IndexMap;
use wasm_encoder::ValType;

/// The fixed dynamic-runtime import namespace every emitted module imports from.
pub const ABI_MODULE: &str = "dyntype";

/// One entry in the host ABI (§6), identified by a typed variant rather than a bare string so
/// call sites in [`crate::expr_lower`] can't typo an import name.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AbiFunction {
    ContextInit,
    NewNumber,
    NewBoolean,
    NewString,
    NewNull,
    NewUndefined,
    NewArray,
    NewObject,
    NewExtref,
    IsNumber,
    IsBoolean,
    IsString,
    IsNull,
    IsUndefined,
    IsObject,
    IsExtref,
    ToNumber,
    ToBool,
    ToString,
    ToExtref,
    TypeEq,
    Cmp,
    GetProperty,
    SetProperty,
    HasProperty,
    GetElem,
    SetElem,
    GetPrototype,
    SetPrototype,
    Invoke,
    NewObjectWithClass,
    StructGetDynI32,
    StructGetDynI64,
    StructGetDynF32,
    StructGetDynF64,
    StructGetDynAnyref,
    StructGetDynFuncref,
    StructSetDynI32,
    StructSetDynI64,
    StructSetDynF32,
    StructSetDynF64,
    StructSetDynAnyref,
    StructSetDynFuncref,
    FindIndex,
}

impl AbiFunction {
    /// The import name exactly as listed in §6's table.
    pub fn import_name(self) -> &'static str {
        match self {
            Self::ContextInit => "dyntype_context_init",
            Self::NewNumber => "dyntype_new_number",
            Self::NewBoolean => "dyntype_new_boolean",
            Self::NewString => "dyntype_new_string",
            Self::NewNull => "dyntype_new_null",
            Self::NewUndefined => "dyntype_new_undefined",
            Self::NewArray => "dyntype_new_array",
            Self::NewObject => "dyntype_new_object",
            Self::NewExtref => "dyntype_new_extref",
            Self::IsNumber => "dyntype_is_number",
            Self::IsBoolean => "dyntype_is_boolean",
            Self::IsString => "dyntype_is_string",
            Self::IsNull => "dyntype_is_null",
            Self::IsUndefined => "dyntype_is_undefined",
            Self::IsObject => "dyntype_is_object",
            Self::IsExtref => "dyntype_is_extref",
            Self::ToNumber => "dyntype_to_number",
            Self::ToBool => "dyntype_to_bool",
            Self::ToString => "dyntype_to_string",
            Self::ToExtref => "dyntype_to_extref",
            Self::TypeEq => "dyntype_type_eq",
            Self::Cmp => "dyntype_cmp",
            Self::GetProperty => "dyntype_get_property",
            Self::SetProperty => "dyntype_set_property",
            Self::HasProperty => "dyntype_has_property",
            Self::GetElem => "dyntype_get_elem",
            Self::SetElem => "dyntype_set_elem",
            Self::GetPrototype => "dyntype_get_prototype",
            Self::SetPrototype => "dyntype_set_prototype",
            Self::Invoke => "dyntype_invoke",
            Self::NewObjectWithClass => "dyntype_new_object_with_class",
            Self::StructGetDynI32 => "struct_get_dyn_i32",
            Self::StructGetDynI64 => "struct_get_dyn_i64",
            Self::StructGetDynF32 => "struct_get_dyn_f32",
            Self::StructGetDynF64 => "struct_get_dyn_f64",
            Self::StructGetDynAnyref => "struct_get_dyn_anyref",
            Self::StructGetDynFuncref => "struct_get_dyn_funcref",
            Self::StructSetDynI32 => "struct_set_dyn_i32",
            Self::StructSetDynI64 => "struct_set_dyn_i64",
            Self::StructSetDynF32 => "struct_set_dyn_f32",
            Self::StructSetDynF64 => "struct_set_dyn_f64",
            Self::StructSetDynAnyref => "struct_set_dyn_anyref",
            Self::StructSetDynFuncref => "struct_set_dyn_funcref",
            Self::FindIndex => "find_index",
        }
    }

    /// Returns the interface-slow-path getter/setter variant for a given WebAssembly value-type
    /// class, per §4.3 "Interface field/method dispatch protocol" step 4.
    pub fn struct_get_dyn_for(val_type: ValType) -> Self {
        match val_type {
            ValType::I32 => Self::StructGetDynI32,
            ValType::I64 => Self::StructGetDynI64,
            ValType::F32 => Self::StructGetDynF32,
            ValType::F64 => Self::StructGetDynF64,
            ValType::Ref(r) if crate::type_lower::is_funcref(r) => Self::StructGetDynFuncref,
            ValType::Ref(_) => Self::StructGetDynAnyref,
            ValType::V128 => unreachable!("SIMD is not part of the source type universe"),
        }
    }

    /// The setter counterpart of [`Self::struct_get_dyn_for`].
    pub fn struct_set_dyn_for(val_type: ValType) -> Self {
        match val_type {
            ValType::I32 => Self::StructSetDynI32,
            ValType::I64 => Self::StructSetDynI64,
            ValType::F32 => Self::StructSetDynF32,
            ValType::F64 => Self::StructSetDynF64,
            ValType::Ref(r) if crate::type_lower::is_funcref(r) => Self::StructSetDynFuncref,
            ValType::Ref(_) => Self::StructSetDynAnyref,
            ValType::V128 => unreachable!("SIMD is not part of the source type universe"),
        }
    }

    /// The raw WASM `(params, results)` signature this import is declared with — plain value
    /// types and `anyref`/`funcref`, since the host runtime ABI operates below the source type
    /// universe (§6).
    pub fn wasm_signature(self) -> (Vec<ValType>, Vec<ValType>) {
        let anyref = ValType::Ref(RefType {
            nullable: true,
            heap_type: HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Any,
            },
        });
        let funcref = ValType::Ref(RefType {
            nullable: true,
            heap_type: HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Func,
            },
        });

        use ValType::{F32, F64, I32, I64};
        match self {
            Self::ContextInit => (vec![], vec![anyref]),
            Self::NewNumber => (vec![F64], vec![anyref]),
            Self::NewBoolean => (vec![I32], vec![anyref]),
            Self::NewString => (vec![I32, I32], vec![anyref]),
            Self::NewNull | Self::NewUndefined | Self::NewObject => (vec![], vec![anyref]),
            Self::NewArray => (vec![I32], vec![anyref]),
            Self::NewObjectWithClass => (vec![I32], vec![anyref]),
            Self::NewExtref => (vec![anyref], vec![anyref]),
            Self::IsNumber
            | Self::IsBoolean
            | Self::IsString
            | Self::IsNull
            | Self::IsUndefined
            | Self::IsObject
            | Self::IsExtref => (vec![anyref], vec![I32]),
            Self::ToNumber => (vec![anyref], vec![F64]),
            Self::ToBool => (vec![anyref], vec![I32]),
            Self::ToString | Self::ToExtref | Self::GetPrototype => (vec![anyref], vec![anyref]),
            Self::TypeEq | Self::Cmp => (vec![anyref, anyref], vec![I32]),
            Self::GetProperty => (vec![anyref, I32, I32], vec![anyref]),
            Self::SetProperty => (vec![anyref, I32, I32, anyref], vec![]),
            Self::HasProperty => (vec![anyref, I32, I32], vec![I32]),
            Self::GetElem => (vec![anyref, I32], vec![anyref]),
            Self::SetElem => (vec![anyref, I32, anyref], vec![]),
            Self::SetPrototype => (vec![anyref, anyref], vec![]),
            Self::Invoke => (vec![anyref, anyref, I32], vec![anyref]),
            Self::StructGetDynI32 => (vec![anyref, I32], vec![I32]),
            Self::StructGetDynI64 => (vec![anyref, I32], vec![I64]),
            Self::StructGetDynF32 => (vec![anyref, I32], vec![F32]),
            Self::StructGetDynF64 => (vec![anyref, I32], vec![F64]),
            Self::StructGetDynAnyref => (vec![anyref, I32], vec![anyref]),
            Self::StructGetDynFuncref => (vec![anyref, I32], vec![funcref]),
            Self::StructSetDynI32 => (vec![anyref, I32, I32], vec![]),
            Self::StructSetDynI64 => (vec![anyref, I32, I64], vec![]),
            Self::StructSetDynF32 => (vec![anyref, I32, F32], vec![]),
            Self::StructSetDynF64 => (vec![anyref, I32, F64], vec![]),
            Self::StructSetDynAnyref => (vec![anyref, I32, anyref], vec![]),
            Self::StructSetDynFuncref => (vec![anyref, I32, funcref], vec![]),
            Self::FindIndex => (vec![anyref, I32, I32], vec![I32]),
        }
    }
}

/// Every `AbiFunction` variant, in the fixed order they are imported (§6). Kept as an explicit
/// list (rather than derived) so the import order is stable independent of enum declaration order.
const ALL: &[AbiFunction] = &[
    AbiFunction::ContextInit,
    AbiFunction::NewNumber,
    AbiFunction::NewBoolean,
    AbiFunction::NewString,
    AbiFunction::NewNull,
    AbiFunction::NewUndefined,
    AbiFunction::NewArray,
    AbiFunction::NewObject,
    AbiFunction::NewExtref,
    AbiFunction::IsNumber,
    AbiFunction::IsBoolean,
    AbiFunction::IsString,
    AbiFunction::IsNull,
    AbiFunction::IsUndefined,
    AbiFunction::IsObject,
    AbiFunction::IsExtref,
    AbiFunction::ToNumber,
    AbiFunction::ToBool,
    AbiFunction::ToString,
    AbiFunction::ToExtref,
    AbiFunction::TypeEq,
    AbiFunction::Cmp,
    AbiFunction::GetProperty,
    AbiFunction::SetProperty,
    AbiFunction::HasProperty,
    AbiFunction::GetElem,
    AbiFunction::SetElem,
    AbiFunction::GetPrototype,
    AbiFunction::SetPrototype,
    AbiFunction::Invoke,
    AbiFunction::NewObjectWithClass,
    AbiFunction::StructGetDynI32,
    AbiFunction::StructGetDynI64,
    AbiFunction::StructGetDynF32,
    AbiFunction::StructGetDynF64,
    AbiFunction::StructGetDynAnyref,
    AbiFunction::StructGetDynFuncref,
    AbiFunction::StructSetDynI32,
    AbiFunction::StructSetDynI64,
    AbiFunction::StructSetDynF32,
    AbiFunction::StructSetDynF64,
    AbiFunction::StructSetDynAnyref,
    AbiFunction::StructSetDynFuncref,
    AbiFunction::FindIndex,
];

/// Registration table mapping each [`AbiFunction`] to its assigned [`FuncId`] in the module's
/// function index space. Host ABI imports always occupy the lowest-numbered function indices
/// (§4.5), and every one of them is imported unconditionally at construction — the table is the
/// fixed contract with the host runtime, not an a-la-carte selection — which makes every lookup a
/// read-only operation, safe to call from parallel per-function lowering (§5) without any locking.
#[derive(Debug)]
pub struct AbiTable {
    imported: IndexMap<AbiFunction, FuncId>,
}

impl AbiTable {
    pub fn new() -> Self {
        let imported = ALL
            .iter()
            .enumerate()
            .map(|(index, function)| (*function, FuncId(index as u32)))
            .collect();
        Self { imported }
    }

    /// The [`FuncId`] assigned to `function`. Every variant is imported up front, so this never
    /// needs to mutate the table.
    pub fn get(&self, function: AbiFunction) -> FuncId {
        self.imported[&function]
    }

    /// Iterates the imports in their fixed declaration order — the order they must be written
    /// into the import section (§5 "function emission order is stable").
    pub fn imports_in_order(&self) -> impl Iterator<Item = (AbiFunction, FuncId)> + '_ {
        self.imported.iter().map(|(k, v)| (*k, *v))
    }
}

impl Default for AbiTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Total number of host ABI imports, fixed regardless of program contents (§6 imports every entry
/// unconditionally). A front end needs this to compute the final wasm function index one of its
/// own declared functions will occupy before lowering even runs — `Expr::FunctionExpr`'s own index
/// is already the post-import function index (§4.5's three-block index space), not a position
/// within the program's own function list.
pub fn import_count() -> u32 {
    ALL.len() as u32
}

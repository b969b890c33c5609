//! Access Descriptors (§3): the result of resolving an lvalue-shaped expression (an identifier, a
//! property access, an element access) to a concrete storage location.
//!
//! Per the redesign flag in §9 ("Access Descriptors as heterogeneous objects" → "a tagged sum with
//! a single `load`/`store` match"), every addressable place the Expression Lowerer can produce is
//! one variant of [`Access`], and reading or writing it goes through exactly one `match` each,
//! rather than through a family of small per-kind types implementing a shared trait.

use crate::context::{FuncId, GlobalId};
use crate::function_context::{FunctionContext, LocalIndex};
use crate::types::SourceType;
use wasm_encoder::Instruction;

/// A resolved, addressable storage location (§3).
#[derive(Clone, Debug)]
pub enum Access {
    /// A local variable or parameter.
    LocalSlot { local: LocalIndex, ty: SourceType },
    /// A module-level global.
    GlobalSlot { global: GlobalId, ty: SourceType },
    /// A field of a statically-known class or closure-context struct, addressed by slot index
    /// (§3 "Itable layout", §4.2).
    StructField {
        struct_type_index: u32,
        field_index: u32,
        ty: SourceType,
    },
    /// A field reached through an interface view, requiring the fast/slow-path dispatch protocol
    /// (§4.3 "Interface field/method dispatch protocol").
    InterfaceField {
        itable_slot: u32,
        ty: SourceType,
    },
    /// An element of a statically-typed array.
    ArrayElement {
        array_type_index: u32,
        element_ty: SourceType,
    },
    /// A property reached only through the dynamic "any" ABI (§6 `dyntype_get_property` /
    /// `dyntype_set_property`).
    DynamicField { name: String },
    /// An element reached only through the dynamic "any" ABI (§6 `dyntype_get_elem` /
    /// `dyntype_set_elem`).
    DynamicElement,
    /// A reference to a free function or static method, by function index — never itself
    /// assignable (§3 "bindings are read-only").
    FunctionBinding { func: FuncId, ty: SourceType },
    /// A reference to an instance method found through the static vtable slot (§3, §4.3). The
    /// receiver (already narrowed to `instance_type_index`) must be on the stack; reading it
    /// consumes the receiver to produce a bare `funcref`, for use as a first-class value rather
    /// than an immediate call (an immediate `obj.method(...)` call is lowered directly by the
    /// Expression Lowerer instead, since it additionally needs the receiver preserved as `this`).
    MethodBinding {
        instance_type_index: u32,
        vtable_type_index: u32,
        vtable_slot: u32,
        ty: SourceType,
    },
    /// A reference to an instance method found only through an interface's itable.
    InfcMethodBinding { itable_slot: u32, ty: SourceType },
    /// A reference to an instance getter found through the static vtable slot (§3, §4.3). Unlike
    /// `MethodBinding`, loading this access actually calls the getter (a property read, not a bare
    /// function value), so it holds its own receiver local rather than expecting one pre-pushed.
    GetterBinding {
        receiver_local: LocalIndex,
        instance_type_index: u32,
        vtable_type_index: u32,
        vtable_slot: u32,
        func_type_index: u32,
        ty: SourceType,
    },
    /// A reference to an instance getter found only through an interface's itable.
    InfcGetterBinding { itable_slot: u32, ty: SourceType },
    /// A reference to a class or interface used as a value (e.g. `new`'s callee) — never loaded or
    /// stored through, only inspected by the caller for its type id.
    TypeBinding { type_id: u32 },
}

impl Access {
    /// Whether this access may appear on the left of an assignment (§3 "bindings are read-only").
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Self::LocalSlot { .. }
                | Self::GlobalSlot { .. }
                | Self::StructField { .. }
                | Self::InterfaceField { .. }
                | Self::ArrayElement { .. }
                | Self::DynamicField { .. }
                | Self::DynamicElement
        )
    }

    /// Emits the instructions that leave this access's current value on the stack.
    ///
    /// `receiver` must already have been lowered and left on the stack for every variant that
    /// needs one (`StructField`, `InterfaceField`, `ArrayElement`, `DynamicField`,
    /// `DynamicElement`, `MethodBinding`, `InfcMethodBinding`, `GetterBinding`,
    /// `InfcGetterBinding`); callers without a receiver (`LocalSlot`, `GlobalSlot`,
    /// `FunctionBinding`, `TypeBinding`) must not push one.
    pub fn emit_load(&self, func: &mut FunctionContext) -> crate::Result<()> {
        match self {
            Self::LocalSlot { local, .. } => {
                func.emit(&Instruction::LocalGet(local.0));
                Ok(())
            }
            Self::GlobalSlot { global, .. } => {
                func.emit(&Instruction::GlobalGet(global.0));
                Ok(())
            }
            Self::StructField {
                struct_type_index,
                field_index,
                ..
            } => {
                func.emit(&Instruction::StructGet(*struct_type_index, *field_index));
                Ok(())
            }
            Self::ArrayElement {
                array_type_index, ..
            } => {
                func.emit(&Instruction::ArrayGet(*array_type_index));
                Ok(())
            }
            Self::InterfaceField { .. }
            | Self::InfcMethodBinding { .. }
            | Self::InfcGetterBinding { .. } => {
                // §4.3 step 4: the interface's own fast-path slot check is emitted by the
                // Expression Lowerer around this call (it owns the `if`/`else` shape); by the
                // time `emit_load` runs the receiver has already been narrowed onto the slow-path
                // `struct_get_dyn_*` ABI call, which this descriptor cannot emit on its own
                // because the import id depends on the field's resolved WebAssembly value type.
                Err(crate::error::LowerError::invariant(
                    "interface access must be lowered by the Expression Lowerer's dispatch protocol, not loaded directly",
                ))
            }
            Self::DynamicField { .. } | Self::DynamicElement => Err(crate::error::LowerError::invariant(
                "dynamic access must be lowered through the `dyntype` ABI call by the Expression Lowerer",
            )),
            Self::FunctionBinding { func: target, .. } => {
                func.emit(&Instruction::RefFunc(target.0));
                Ok(())
            }
            Self::MethodBinding {
                instance_type_index,
                vtable_type_index,
                vtable_slot,
                ..
            } => {
                // Receiver (the instance) is already on the stack; read its vtable then the slot.
                func.emit(&Instruction::StructGet(*instance_type_index, 0));
                func.emit(&Instruction::StructGet(*vtable_type_index, *vtable_slot));
                Ok(())
            }
            Self::GetterBinding {
                receiver_local,
                instance_type_index,
                vtable_type_index,
                vtable_slot,
                func_type_index,
                ..
            } => {
                // Calling convention is `(context, this, ...)` (§4.1), same as any other instance
                // method; the getter takes no further arguments of its own.
                func.emit(&Instruction::RefNull(wasm_encoder::HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Any,
                }));
                func.emit(&Instruction::LocalGet(receiver_local.0));
                func.emit(&Instruction::LocalGet(receiver_local.0));
                func.emit(&Instruction::StructGet(*instance_type_index, 0));
                func.emit(&Instruction::StructGet(*vtable_type_index, *vtable_slot));
                func.emit(&Instruction::CallRef(*func_type_index));
                Ok(())
            }
            Self::TypeBinding { .. } => Err(crate::error::LowerError::invariant(
                "type bindings have no runtime value to load",
            )),
        }
    }

    /// Emits the instructions that store the value already on top of the stack into this access.
    pub fn emit_store(&self, func: &mut FunctionContext) -> crate::Result<()> {
        match self {
            Self::LocalSlot { local, .. } => {
                func.emit(&Instruction::LocalSet(local.0));
                Ok(())
            }
            Self::GlobalSlot { global, .. } => {
                func.emit(&Instruction::GlobalSet(global.0));
                Ok(())
            }
            Self::StructField {
                struct_type_index,
                field_index,
                ..
            } => {
                func.emit(&Instruction::StructSet(*struct_type_index, *field_index));
                Ok(())
            }
            Self::ArrayElement {
                array_type_index, ..
            } => {
                func.emit(&Instruction::ArraySet(*array_type_index));
                Ok(())
            }
            Self::InterfaceField { .. } => Err(crate::error::LowerError::invariant(
                "interface field writes must be lowered by the Expression Lowerer's dispatch protocol",
            )),
            Self::DynamicField { .. } | Self::DynamicElement => Err(crate::error::LowerError::invariant(
                "dynamic writes must be lowered through the `dyntype` ABI call by the Expression Lowerer",
            )),
            Self::FunctionBinding { .. }
            | Self::MethodBinding { .. }
            | Self::InfcMethodBinding { .. }
            | Self::GetterBinding { .. }
            | Self::InfcGetterBinding { .. }
            | Self::TypeBinding { .. } => {
                Err(crate::error::LowerError::invariant("this access is not assignable"))
            }
        }
    }

    /// The source-level type this access yields when loaded, where one is meaningful.
    pub fn source_type(&self) -> Option<&SourceType> {
        match self {
            Self::LocalSlot { ty, .. }
            | Self::GlobalSlot { ty, .. }
            | Self::StructField { ty, .. }
            | Self::InterfaceField { ty, .. }
            | Self::FunctionBinding { ty, .. }
            | Self::MethodBinding { ty, .. }
            | Self::InfcMethodBinding { ty, .. }
            | Self::GetterBinding { ty, .. }
            | Self::InfcGetterBinding { ty, .. } => Some(ty),
            Self::ArrayElement { element_ty, .. } => Some(element_ty),
            Self::DynamicField { .. } | Self::DynamicElement | Self::TypeBinding { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_and_interface_accesses_reject_direct_load() {
        let allocations = crate::allocations::Allocations::new();
        let mut func = FunctionContext::new(&allocations, 0);
        let access = Access::DynamicField {
            name: "x".to_string(),
        };
        assert!(access.emit_load(&mut func).is_err());
    }

    #[test]
    fn type_binding_is_not_assignable() {
        let access = Access::TypeBinding { type_id: 0 };
        assert!(!access.is_assignable());
    }

    #[test]
    fn local_slot_round_trips_through_load_and_store() {
        let allocations = crate::allocations::Allocations::new();
        let mut func = FunctionContext::new(&allocations, 1);
        let access = Access::LocalSlot {
            local: LocalIndex(0),
            ty: SourceType::Number,
        };
        assert!(access.emit_load(&mut func).is_ok());
        assert!(access.emit_store(&mut func).is_ok());
    }
}

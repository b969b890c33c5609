//! The Type Lowerer (§4.1): deterministic, memoized mapping from source types to WebAssembly
//! types, and synthesis of vtables, itables, closure-context shapes, and array envelopes.
//!
//! The single cache keyed by [`SourceTypeId`] follows the same type-caching idiom as a module
//! context keyed by a validator's own type registry, except keyed here by the front end's own
//! type identity — it guarantees `wasm_value_type` never produces two distinct WebAssembly types
//! for the same source type (§4.1 invariant).

use crate::context::{CallKind, WasmTypeId};
use crate::types::{ClassDef, FunctionType, InterfaceDef, SourceType, SourceTypeId};
use std::collections::HashMap;
use wasm_encoder::{
    ArrayType, CompositeInnerType, CompositeType, FieldType, FuncType, HeapType, RefType,
    StorageType, StructType, SubType, ValType,
};

/// `true` if `r` is `funcref` (the abstract `func` heap type), used to pick the `_funcref` variant
/// of the interface slow-path helpers (§4.3 step 4).
pub fn is_funcref(r: RefType) -> bool {
    matches!(
        r.heap_type,
        HeapType::Abstract {
            ty: wasm_encoder::AbstractHeapType::Func,
            ..
        }
    )
}

fn non_null(heap_type: HeapType) -> RefType {
    RefType {
        nullable: false,
        heap_type,
    }
}

fn nullable(heap_type: HeapType) -> RefType {
    RefType {
        nullable: true,
        heap_type,
    }
}

/// The synthesized WebAssembly struct/array layout for a class, interface, or auxiliary shape
/// (closure context, array envelope, function-value wrapper).
#[derive(Clone, Copy, Debug)]
pub struct AggregateType {
    pub wasm_type: WasmTypeId,
    pub heap_type: HeapType,
    pub sub_type: SubTypeHandle,
}

/// Cheap handle standing in for the actual [`SubType`] definition, which the Module Driver
/// collects separately (via [`TypeLowerer::definitions`]) when assembling the type section, so
/// that synthesizing a layout here never requires borrowing the definitions list mutably while
/// also looking something up in it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubTypeHandle(pub u32);

fn concrete(id: WasmTypeId) -> HeapType {
    HeapType::Concrete(id.0)
}

/// Per-class synthesized layout: the struct type for instances, the vtable's own struct type, and
/// the method-name → vtable-slot table used by both direct and interface dispatch (§4.1).
#[derive(Clone, Debug)]
pub struct ClassLayout {
    pub instance_struct: AggregateType,
    pub vtable_struct: AggregateType,
    /// Field name → 1-based field index (field 0 is always the vtable, §3 invariant 3).
    pub field_slots: HashMap<String, u32>,
    /// Method name → vtable slot index, stable across overrides per §4.1's "Invariants and
    /// decisions": base-class slots first, overrides substituted in place.
    pub method_slots: HashMap<String, u32>,
    /// Vtable slot index → method name, the inverse of `method_slots`, in the order `vtable_struct`
    /// expects its `ref.func` operands.
    pub vtable_slot_order: Vec<String>,
    /// Method name → the mangled name of the function that currently implements it (the declaring
    /// class's own, or an inherited one left untouched by an override). Used to resolve which
    /// `ref.func` goes in each vtable slot when a class's vtable instance is synthesized (§4.5).
    pub method_impls: HashMap<String, String>,
    /// Field name → declared source type, inherited fields included. Lets the Expression Lowerer
    /// resolve a static `obj.field` access to a typed `Access::StructField` without re-walking the
    /// originating `ClassDef`.
    pub field_types: HashMap<String, SourceType>,
}

/// Per-interface synthesized layout: the field/method name tables used for the dispatch
/// protocol's fast path and for building the itable (§4.3, §3).
#[derive(Clone, Debug)]
pub struct InterfaceLayout {
    pub field_names: Vec<String>,
    pub method_names: Vec<String>,
}

/// Per-scope closure-context struct shape (§4.2): field 0 is always the parent context, remaining
/// fields are the captured variables in declaration order.
#[derive(Clone, Debug)]
pub struct ClosureContextLayout {
    pub struct_type: AggregateType,
    /// Captured variable name → (1-based field index, its source type); field 0 is always the
    /// parent pointer (§3 invariant 3).
    pub capture_slots: HashMap<String, (u32, SourceType)>,
}

/// The Type Lowerer's memo tables, owned by [`crate::context::ModuleContext`].
pub struct TypeLowerer {
    classes: HashMap<SourceTypeId, ClassLayout>,
    interfaces: HashMap<SourceTypeId, InterfaceLayout>,
    array_envelopes: HashMap<ValType, (AggregateType, AggregateType)>,
    string_codepoints_array: Option<AggregateType>,
    string_struct: Option<AggregateType>,
    interface_view_struct: Option<AggregateType>,
    empty_closure_struct: Option<AggregateType>,
    /// Memoized `func` type indices, keyed by their already-lowered `(params, results)` shape so
    /// unrelated declarations sharing a calling-convention-complete signature share one type-section
    /// entry (§4.1).
    func_types: HashMap<(Vec<ValType>, Vec<ValType>), WasmTypeId>,
    /// Every `SubType` synthesized so far, in registration order; `WasmTypeId`/`SubTypeHandle`
    /// are indices into this list. Drained by the Module Driver when it builds the type section.
    definitions: Vec<SubType>,
}

impl TypeLowerer {
    pub fn new() -> Self {
        Self {
            classes: HashMap::new(),
            interfaces: HashMap::new(),
            array_envelopes: HashMap::new(),
            string_codepoints_array: None,
            string_struct: None,
            interface_view_struct: None,
            empty_closure_struct: None,
            func_types: HashMap::new(),
            definitions: Vec::new(),
        }
    }

    fn register(&mut self, sub_type: SubType) -> AggregateType {
        let id = WasmTypeId(self.definitions.len() as u32);
        self.definitions.push(sub_type);
        AggregateType {
            wasm_type: id,
            heap_type: concrete(id),
            sub_type: SubTypeHandle(id.0),
        }
    }

    fn struct_of(&mut self, fields: Vec<FieldType>) -> AggregateType {
        self.register(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Struct(StructType {
                    fields: fields.into_boxed_slice(),
                }),
                shared: false,
            },
        })
    }

    fn func_of(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> AggregateType {
        self.register(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Func(FuncType::new(params, results)),
                shared: false,
            },
        })
    }

    /// Memoized `func` type index for a raw, already-lowered `(params, results)` shape — used for
    /// host ABI imports and ambient `declare` bindings, which don't go through the calling-
    /// convention-complete wrapping [`Self::func_signature_type`] applies to declared functions.
    pub fn func_type_index_raw(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> WasmTypeId {
        let key = (params, results);
        if let Some(id) = self.func_types.get(&key) {
            return *id;
        }

        let (params, results) = key.clone();
        let agg = self.func_of(params, results);
        self.func_types.insert(key, agg.wasm_type);
        agg.wasm_type
    }

    /// `function-param-types(F)` (§4.1): the calling-convention-complete WASM function type for a
    /// declared function — a leading closure-context parameter, `this` for methods, then the
    /// source parameters, then the (possibly empty) result.
    pub fn func_signature_type(
        &mut self,
        call_kind: CallKind,
        ty: &FunctionType,
    ) -> crate::Result<WasmTypeId> {
        let anyref = ValType::Ref(nullable(HeapType::Abstract {
            shared: false,
            ty: wasm_encoder::AbstractHeapType::Any,
        }));

        let mut params = vec![anyref];
        if matches!(call_kind, CallKind::Method) {
            params.push(anyref);
        }
        for param in &ty.params {
            params.push(self.wasm_value_type(&param.ty)?);
        }

        let results = match &ty.return_type {
            SourceType::Void => Vec::new(),
            other => vec![self.wasm_value_type(other)?],
        };

        Ok(self.func_type_index_raw(params, results))
    }

    /// The plain (no context, no `this`) WASM function type for an ambient `declare` binding —
    /// these are real host functions, called only from inside the thin forwarding wrapper the
    /// Module Driver synthesizes for them (§4.5).
    pub fn extern_signature_type(&mut self, ty: &FunctionType) -> crate::Result<WasmTypeId> {
        let mut params = Vec::with_capacity(ty.params.len());
        for param in &ty.params {
            params.push(self.wasm_value_type(&param.ty)?);
        }
        let results = match &ty.return_type {
            SourceType::Void => Vec::new(),
            other => vec![self.wasm_value_type(other)?],
        };
        Ok(self.func_type_index_raw(params, results))
    }

    fn array_of(&mut self, element_type: StorageType, mutable: bool) -> AggregateType {
        self.register(SubType {
            is_final: true,
            supertype_idx: None,
            composite_type: CompositeType {
                inner: CompositeInnerType::Array(ArrayType(FieldType {
                    element_type,
                    mutable,
                })),
                shared: false,
            },
        })
    }

    /// Every synthesized type definition, in the order real WebAssembly type indices must be
    /// assigned. Consumed once by the Module Driver's type-section pass.
    pub fn definitions(&self) -> &[SubType] {
        &self.definitions
    }

    /// `wasm-value-type(T)` (§4.1): one WebAssembly value type for a [`SourceType`].
    ///
    /// `SourceType::Class`/`SourceType::Interface` require the corresponding [`ClassDef`]/
    /// [`InterfaceDef`] to already be registered via [`Self::class_layout`]/
    /// [`Self::interface_layout`] — callers reach those through [`crate::context::ModuleContext`],
    /// which registers every declared class and interface during the driver's registration pass
    /// before any expression lowering begins (§4.5).
    pub fn wasm_value_type(&mut self, ty: &SourceType) -> crate::Result<ValType> {
        Ok(match ty {
            SourceType::Number => ValType::F64,
            SourceType::Boolean => ValType::I32,
            SourceType::Void => {
                return Err(crate::error::LowerError::invariant(
                    "`void` has no value type; only valid as a return type",
                ))
            }
            SourceType::String => ValType::Ref(non_null(self.string_struct_type().heap_type)),
            SourceType::Any | SourceType::Null | SourceType::Undefined => {
                ValType::Ref(nullable(HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Any,
                }))
            }
            SourceType::Array(element) => {
                let layout = self.array_envelope(element)?;
                ValType::Ref(non_null(layout.heap_type))
            }
            SourceType::Function(_) => {
                // Every closure shares the same 2-field wrapper shape per §3.
                ValType::Ref(non_null(self.function_closure_struct().heap_type))
            }
            SourceType::Class(_) => {
                return Err(crate::error::LowerError::invariant(
                    "class value type requires the ClassDef; call `class_layout` instead",
                ))
            }
            SourceType::Interface(_) => ValType::Ref(non_null(self.interface_view_type().heap_type)),
        })
    }

    /// The `array<i32>` type backing every string's codepoints (§3), memoized separately from the
    /// wrapping struct so literal construction (`array.new_fixed`) can name its type index
    /// directly.
    pub fn string_codepoints_array_type(&mut self) -> AggregateType {
        if let Some(layout) = self.string_codepoints_array {
            return layout;
        }

        let layout = self.array_of(StorageType::Val(ValType::I32), false);
        self.string_codepoints_array = Some(layout);
        layout
    }

    /// The `{ i32 flag, array<i32> codepoints }` struct shared by every `string` value (§3).
    pub fn string_struct_type(&mut self) -> AggregateType {
        if let Some(layout) = self.string_struct {
            return layout;
        }

        let codepoints = self.string_codepoints_array_type();
        let layout = self.struct_of(vec![
            FieldType {
                element_type: StorageType::Val(ValType::I32),
                mutable: false,
            },
            FieldType {
                element_type: StorageType::Val(ValType::Ref(non_null(codepoints.heap_type))),
                mutable: false,
            },
        ]);
        self.string_struct = Some(layout);
        layout
    }

    /// The fixed 3-field `{ i32 itable-ptr, i32 type-id, ref any-object }` struct for interface
    /// values (§3, `interface-view-type()` in §4.1).
    pub fn interface_view_type(&mut self) -> AggregateType {
        if let Some(layout) = self.interface_view_struct {
            return layout;
        }

        let layout = self.struct_of(vec![
            FieldType {
                element_type: StorageType::Val(ValType::I32),
                mutable: false,
            },
            FieldType {
                element_type: StorageType::Val(ValType::I32),
                mutable: false,
            },
            FieldType {
                element_type: StorageType::Val(ValType::Ref(nullable(HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Any,
                }))),
                mutable: false,
            },
        ]);
        self.interface_view_struct = Some(layout);
        layout
    }

    /// `function-closure-struct(F)` (§4.1): the 2-field `{context, funcref}` wrapper, shared by
    /// every function value regardless of its signature (the signature only matters at the
    /// `call-ref` site, via the funcref's own type).
    pub fn function_closure_struct(&mut self) -> AggregateType {
        if let Some(layout) = self.empty_closure_struct {
            return layout;
        }

        let layout = self.struct_of(vec![
            FieldType {
                element_type: StorageType::Val(ValType::Ref(nullable(HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Any,
                }))),
                mutable: false,
            },
            FieldType {
                element_type: StorageType::Val(ValType::Ref(non_null(HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Func,
                }))),
                mutable: false,
            },
        ]);
        self.empty_closure_struct = Some(layout);
        layout
    }

    /// `class-struct-type(C)` / `class-vtable-type(C)` (§4.1), computed together since the
    /// instance struct's field 0 type depends on the vtable struct's heap type. Requires `C`'s
    /// base class, if any, to already be registered (the Module Driver walks classes in
    /// base-before-derived order, per §4.1's inheritance-slot-order invariant).
    pub fn class_layout(&mut self, class: &ClassDef) -> crate::Result<&ClassLayout> {
        if !self.classes.contains_key(&class.id) {
            let layout = self.build_class_layout(class)?;
            self.classes.insert(class.id, layout);
        }

        Ok(&self.classes[&class.id])
    }

    /// Looks up an already-registered class's layout by id alone, for call sites downstream of
    /// registration (e.g. `Expr::New` lowering) that only have the `SourceTypeId`, not the
    /// `ClassDef` the Module Driver walked earlier.
    pub fn class_layout_by_id(&self, id: SourceTypeId) -> crate::Result<&ClassLayout> {
        self.classes.get(&id).ok_or_else(|| {
            crate::error::LowerError::invariant(format!("class {id:?} was never registered")).into()
        })
    }

    fn build_class_layout(&mut self, class: &ClassDef) -> crate::Result<ClassLayout> {
        let (mut method_slots, mut method_order, mut method_impls, mut field_slots, mut field_count, mut field_types) =
            if let Some(base_id) = class.base {
                let base = self.classes.get(&base_id).ok_or_else(|| {
                    crate::error::LowerError::invariant(format!(
                        "base class {base_id:?} of class {:?} was not registered first",
                        class.id
                    ))
                })?;
                (
                    base.method_slots.clone(),
                    base.vtable_slot_order.clone(),
                    base.method_impls.clone(),
                    base.field_slots.clone(),
                    base.field_slots.len() as u32,
                    base.field_types.clone(),
                )
            } else {
                (
                    HashMap::new(),
                    Vec::new(),
                    HashMap::new(),
                    HashMap::new(),
                    0u32,
                    HashMap::new(),
                )
            };

        for method in &class.methods {
            if !method_slots.contains_key(&method.name) {
                let slot = method_order.len() as u32;
                method_slots.insert(method.name.clone(), slot);
                method_order.push(method.name.clone());
            }
            // An override keeps the inherited slot index in place, per §4.1.
            method_impls.insert(
                method.name.clone(),
                crate::ident::member_name(&class.mangled_name, &method.name),
            );
        }

        for field in &class.fields {
            field_count += 1;
            field_slots.insert(field.name.clone(), field_count); // 1-based, field 0 is the vtable
            field_types.insert(field.name.clone(), field.ty.clone());
        }

        let vtable_fields = method_order
            .iter()
            .map(|_| FieldType {
                element_type: StorageType::Val(ValType::Ref(non_null(HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Func,
                }))),
                mutable: false,
            })
            .collect();
        let vtable_struct = self.struct_of(vtable_fields);

        let mut instance_fields = vec![FieldType {
            element_type: StorageType::Val(ValType::Ref(non_null(vtable_struct.heap_type))),
            mutable: false,
        }];
        for field in &class.fields {
            instance_fields.push(FieldType {
                element_type: StorageType::Val(self.wasm_value_type(&field.ty)?),
                mutable: !field.read_only,
            });
        }
        let instance_struct = self.struct_of(instance_fields);

        Ok(ClassLayout {
            instance_struct,
            vtable_struct,
            field_slots,
            method_slots,
            vtable_slot_order: method_order,
            method_impls,
            field_types,
        })
    }

    /// Registers an interface's structural member table (§4.1, used by `InterfaceField`'s
    /// `static-index` per §3).
    pub fn interface_layout(&mut self, iface: &InterfaceDef) -> &InterfaceLayout {
        self.interfaces.entry(iface.id).or_insert_with(|| InterfaceLayout {
            field_names: iface.fields.iter().map(|f| f.name.clone()).collect(),
            method_names: iface.methods.iter().map(|m| m.name.clone()).collect(),
        })
    }

    /// Envelope shape `{ array<T> data, i32 length }` for `Array<T>` (§3).
    pub fn array_envelope(&mut self, element: &SourceType) -> crate::Result<AggregateType> {
        Ok(self.array_envelope_parts(element)?.1)
    }

    /// Same as [`Self::array_envelope`], but also returns the inner `array` type itself — needed
    /// by callers that must emit `array.new_fixed`/`array.new_default` directly (§4.1 `Expr::New`
    /// for `Array<T>`), rather than only the wrapping envelope struct.
    pub fn array_envelope_parts(
        &mut self,
        element: &SourceType,
    ) -> crate::Result<(AggregateType, AggregateType)> {
        let element_val = self.wasm_value_type(element)?;

        if let Some(parts) = self.array_envelopes.get(&element_val) {
            return Ok(*parts);
        }

        let array = self.array_of(StorageType::Val(element_val), true);
        let envelope = self.struct_of(vec![
            FieldType {
                element_type: StorageType::Val(ValType::Ref(non_null(array.heap_type))),
                mutable: false,
            },
            FieldType {
                element_type: StorageType::Val(ValType::I32),
                mutable: false,
            },
        ]);

        self.array_envelopes.insert(element_val, (array, envelope));
        Ok((array, envelope))
    }

    /// Materializes a fresh closure-context struct shape for a scope with the given captured
    /// variables (§4.2). The parent context's heap type is passed in by the caller (the Closure
    /// Context Builder), since it depends on walk-time state, not on anything memoizable here.
    /// Builds the struct type for one scope's closure context (§4.2 "On scope entry"). Field 0 is
    /// always the parent context pointer, stored as plain nullable `anyref` rather than a
    /// concretely-typed reference: a scope's parent may itself be any of many different concrete
    /// closure-context shapes depending on where the enclosing function was invoked from, so the
    /// link is only ever narrowed with a `ref.cast` immediately before each hop reads through it
    /// (mirroring `this`'s own anyref-then-cast narrowing at `module_driver.rs`'s function entry).
    pub fn closure_context_layout(&mut self, captures: &[(String, SourceType)]) -> crate::Result<ClosureContextLayout> {
        let mut field_types = Vec::with_capacity(captures.len());
        for (_, ty) in captures {
            field_types.push(self.wasm_value_type(ty)?);
        }

        let mut capture_slots = HashMap::new();
        let mut fields = vec![FieldType {
            element_type: StorageType::Val(ValType::Ref(nullable(HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Any,
            }))),
            mutable: false,
        }];

        for (index, ((name, ty), val_type)) in captures.iter().zip(field_types).enumerate() {
            fields.push(FieldType {
                element_type: StorageType::Val(val_type),
                mutable: true,
            });
            capture_slots.insert(name.clone(), ((index + 1) as u32, ty.clone()));
        }

        let struct_type = self.struct_of(fields);

        Ok(ClosureContextLayout {
            struct_type,
            capture_slots,
        })
    }
}

impl Default for TypeLowerer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeLowerer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeLowerer")
            .field("classes", &self.classes.len())
            .field("interfaces", &self.interfaces.len())
            .field("definitions", &self.definitions.len())
            .finish_non_exhaustive()
    }
}

//! The Expression Lowerer (§4.3): turns one resolved [`Expr`] into WebAssembly instructions,
//! either leaving its value on the stack (`lower_value`) or resolving it to an [`Access`] an
//! assignment or a `&`-style reference can use (`lower_access`).

use crate::access::Access;
use crate::closure::{capture_key, ClosureArena, ContextFrameId};
use crate::context::ModuleContext;
use crate::function_context::{FunctionContext, LocalIndex};
use crate::source::{BinOp, Expr, LocalId, NewArrayKind, UnOp};
use crate::types::SourceType;
use std::collections::HashMap;
use wasm_encoder::{Instruction, ValType};

/// Everything the Expression Lowerer needs beyond the expression itself: the module-wide tables,
/// the function currently being built, the local-variable scope, and the closure-context chain
/// (§4.2) for resolving captured names.
pub struct ExprLowerer<'a> {
    pub ctx: &'a mut ModuleContext,
    pub func: &'a mut FunctionContext,
    /// `LocalId` → concrete storage, populated by the Statement Lowerer as it walks declarations
    /// and parameters (§4.4). A name absent here but present in `closures` is a captured variable.
    pub locals: &'a HashMap<LocalId, Access>,
    pub closures: &'a ClosureArena,
    pub scope: ContextFrameId,
    /// The class owning the function currently being lowered, for resolving `super(...)` (§4.3).
    /// `None` outside a method/constructor body.
    pub owner_class: Option<crate::types::SourceTypeId>,
}

/// Best-effort static type of `expr`, used only to pick the right row of the binary-operator
/// dispatch matrix (§4.3). Every node that actually carries a `SourceType` reports it exactly;
/// nodes that don't (most obviously `Binary`/`Unary`, which are built straight from syntactic
/// operator tags with no annotation slot of their own) fall back to the type their own operator
/// always produces. This never needs to be exact for nodes the matrix doesn't key on.
fn static_type_of(expr: &Expr) -> SourceType {
    match expr {
        Expr::NumberLiteral(_) => SourceType::Number,
        Expr::BooleanLiteral(_) => SourceType::Boolean,
        Expr::StringLiteral(_) => SourceType::String,
        Expr::NullLiteral => SourceType::Null,
        Expr::UndefinedLiteral => SourceType::Undefined,
        Expr::Identifier { ty, .. } | Expr::GlobalRef { ty, .. } => ty.clone(),
        Expr::Assign { target, .. } => static_type_of(target),
        Expr::PropertyAccess { .. } | Expr::ElementAccess { .. } | Expr::Call { .. } => SourceType::Any,
        Expr::New { class, .. } => SourceType::Class(*class),
        Expr::NewArray(_) => SourceType::Any,
        Expr::SuperCall { .. } => SourceType::Void,
        Expr::FunctionExpr(ty, _) => SourceType::Function(ty.clone()),
        Expr::Cast { target, .. } => target.clone(),
        Expr::Box { .. } => SourceType::Any,
        Expr::Unbox { target, .. } => target.clone(),
        Expr::Unary { op, .. } => match op {
            UnOp::Neg | UnOp::BitNot => SourceType::Number,
            UnOp::Not | UnOp::Truthiness => SourceType::Boolean,
        },
        Expr::Binary { op, left, .. } => match op {
            BinOp::Eq
            | BinOp::Ne
            | BinOp::Lt
            | BinOp::Le
            | BinOp::Gt
            | BinOp::Ge
            | BinOp::LogicalAnd
            | BinOp::LogicalOr => SourceType::Boolean,
            _ => static_type_of(left),
        },
    }
}

impl<'a> ExprLowerer<'a> {
    /// Lowers `expr` for its value, leaving exactly one WebAssembly value on the stack.
    pub fn lower_value(&mut self, expr: &Expr) -> crate::Result<()> {
        match expr {
            Expr::NumberLiteral(value) => {
                self.func.emit(&Instruction::F64Const(*value));
                Ok(())
            }
            Expr::BooleanLiteral(value) => {
                self.func.emit(&Instruction::I32Const(*value as i32));
                Ok(())
            }
            Expr::StringLiteral(value) => self.lower_string_literal(value),
            Expr::NullLiteral | Expr::UndefinedLiteral => {
                self.func.emit(&Instruction::RefNull(wasm_encoder::HeapType::Abstract {
                    shared: false,
                    ty: wasm_encoder::AbstractHeapType::Any,
                }));
                Ok(())
            }
            Expr::Identifier { local, .. } => {
                let access = self.resolve_local(*local)?;
                access.emit_load(self.func)
            }
            Expr::GlobalRef { name, .. } => {
                let global = self.ctx.global_id(name)?;
                let ty = self.ctx.global_type(global).clone();
                Access::GlobalSlot { global, ty }.emit_load(self.func)
            }
            Expr::Binary { op, left, right } => self.lower_binary(*op, left, right),
            Expr::Unary { op, operand } => self.lower_unary(*op, operand),
            Expr::Assign { target, value } => {
                // `lower_access` pushes any receiver the target needs (struct/array/dynamic
                // kinds) before the store's own operands are pushed.
                let access = self.lower_access(target)?;
                self.store_through_access(&access, value)
            }
            Expr::PropertyAccess { .. } | Expr::ElementAccess { .. } => {
                let access = self.lower_access(expr)?;
                self.load_through_access(expr, access)
            }
            Expr::Call { callee, args } => self.lower_call(callee, args),
            Expr::New { class, args } => self.lower_new(*class, args),
            Expr::NewArray(kind) => self.lower_new_array(kind),
            Expr::SuperCall { args } => self.lower_super_call(args),
            Expr::FunctionExpr(ty, function_index) => self.lower_function_expr(ty, *function_index),
            Expr::Cast { value, target } => self.lower_cast(value, target),
            Expr::Box { value, source_ty } => self.lower_box(value, source_ty),
            Expr::Unbox { value, target } => self.lower_unbox(value, target),
        }
    }

    /// Resolves `expr` to an [`Access`] without reading its value, for assignment targets and
    /// reference-taking contexts. Any receiver expression along the way is lowered for its value
    /// and left on the stack, ready for the access's own `emit_load`/`emit_store`.
    pub fn lower_access(&mut self, expr: &Expr) -> crate::Result<Access> {
        match expr {
            Expr::Identifier { local, .. } => self.resolve_local(*local),
            Expr::GlobalRef { name, ty } => {
                let global = self.ctx.global_id(name)?;
                Ok(Access::GlobalSlot {
                    global,
                    ty: ty.clone(),
                })
            }
            Expr::PropertyAccess { receiver, name } => self.lower_property_access(receiver, name),
            Expr::ElementAccess { receiver, index } => self.lower_element_access(receiver, index),
            _ => Err(crate::error::LowerError::invariant(
                "expression is not assignable to an Access",
            )),
        }
    }

    fn resolve_local(&mut self, local: LocalId) -> crate::Result<Access> {
        if let Some(access) = self.locals.get(&local) {
            return Ok(access.clone());
        }

        // Not a plain local: must be a captured variable reached through the closure-context
        // chain (§4.2). The Statement Lowerer and the Module Driver both derive a capture's slot
        // name the same way, from the `LocalId` it was originally declared under, so no separate
        // debug-name table is needed to key the two sides consistently.
        self.resolve_captured(&capture_key(local))
    }

    /// Resolves a captured variable by name through the closure-context chain, emitting the
    /// `ref.cast`-then-`struct.get $parent` hops (§4.2, §9) and returning the final field access.
    /// Every hop's parent field is stored as bare `anyref` (§4.2), so each hop must narrow it to
    /// the next frame's concrete struct type before it can be read again.
    pub fn resolve_captured(&mut self, name: &str) -> crate::Result<Access> {
        let resolution = self.closures.resolve(self.scope, name)?;
        let own_local = self.closures.local_of(self.scope);

        self.func.emit(&Instruction::LocalGet(own_local.0));
        for type_index in &resolution.hop_type_indices {
            self.func.emit(&Instruction::RefCast(wasm_encoder::RefType {
                nullable: true,
                heap_type: wasm_encoder::HeapType::Concrete(*type_index),
            }));
            // Field 0 is always the parent context pointer (§3 invariant 3).
            self.func.emit(&Instruction::StructGet(*type_index, 0));
        }
        self.func.emit(&Instruction::RefCast(wasm_encoder::RefType {
            nullable: true,
            heap_type: wasm_encoder::HeapType::Concrete(resolution.struct_type_index),
        }));

        Ok(Access::StructField {
            struct_type_index: resolution.struct_type_index,
            field_index: resolution.field_index,
            ty: resolution.ty,
        })
    }

    fn lower_string_literal(&mut self, value: &str) -> crate::Result<()> {
        let codepoints = self.ctx.type_lower.string_codepoints_array_type();
        let string_struct = self.ctx.type_lower.string_struct_type();

        self.func.emit(&Instruction::I32Const(0));
        for ch in value.chars() {
            self.func.emit(&Instruction::I32Const(ch as i32));
        }
        self.func.emit(&Instruction::ArrayNewFixed(
            codepoints.wasm_type.0,
            value.chars().count() as u32,
        ));
        self.func.emit(&Instruction::StructNew(string_struct.wasm_type.0));
        Ok(())
    }

    /// Operator dispatch (§4.3): routes to the row matching the operands' static shapes. `&&`/`||`
    /// are type-agnostic and short-circuit regardless of row, so they're peeled off before any
    /// shape inspection happens.
    fn lower_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        if matches!(op, BinOp::LogicalAnd | BinOp::LogicalOr) {
            return self.lower_short_circuit(op, left, right);
        }

        let left_ty = static_type_of(left);
        let right_ty = static_type_of(right);

        if left_ty.is_null_or_undefined() || right_ty.is_null_or_undefined() {
            return self.lower_nullish_binary(op, left, right, &left_ty, &right_ty);
        }

        match (&left_ty, &right_ty) {
            (SourceType::Number, SourceType::Number) => self.lower_numeric_binary(op, left, right),
            (SourceType::Boolean, SourceType::Boolean) => self.lower_boolean_binary(op, left, right),
            (SourceType::Number, SourceType::Boolean) | (SourceType::Boolean, SourceType::Number) => {
                self.lower_mixed_numeric_boolean_binary(op, left, right)
            }
            (SourceType::String, SourceType::String) => self.lower_string_binary(op, left, right),
            (SourceType::Any, SourceType::Any) => self.lower_any_binary(op, left, right),
            (SourceType::Any, _) | (_, SourceType::Any) => self.lower_any_static_binary(op, left, right, &left_ty, &right_ty),
            _ => self.lower_reference_equality_binary(op, left, right),
        }
    }

    fn lower_numeric_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        self.lower_value(left)?;
        self.lower_value(right)?;

        match op {
            BinOp::Add => self.func.emit(&Instruction::F64Add),
            BinOp::Sub => self.func.emit(&Instruction::F64Sub),
            BinOp::Mul => self.func.emit(&Instruction::F64Mul),
            BinOp::Div => self.func.emit(&Instruction::F64Div),
            BinOp::Mod => {
                return Err(crate::error::LowerError::unsupported(
                    "`%` lowers through the host ABI, not a core instruction",
                ))
            }
            BinOp::Shl | BinOp::Shr | BinOp::ShrUnsigned | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                // Both operands are still `f64` on the stack; bitwise/shift ops need `i32`
                // operands, so each is truncated, then the result is converted back (§4.3
                // "number,number" row covers the full arithmetic/bitwise/comparison set, not just
                // floating-point ops).
                self.func.emit(&Instruction::I32TruncF64S);
                let right_local = self.func.alloc_local(ValType::I32);
                self.func.emit(&Instruction::LocalSet(right_local.0));
                self.func.emit(&Instruction::I32TruncF64S);
                self.func.emit(&Instruction::LocalGet(right_local.0));
                let instruction = match op {
                    BinOp::Shl => Instruction::I32Shl,
                    BinOp::Shr => Instruction::I32ShrS,
                    BinOp::ShrUnsigned => Instruction::I32ShrU,
                    BinOp::BitAnd => Instruction::I32And,
                    BinOp::BitOr => Instruction::I32Or,
                    BinOp::BitXor => Instruction::I32Xor,
                    _ => unreachable!("matched above"),
                };
                self.func.emit(&instruction);
                self.func.emit(&Instruction::F64ConvertI32S);
            }
            BinOp::Eq => self.func.emit(&Instruction::F64Eq),
            BinOp::Ne => self.func.emit(&Instruction::F64Ne),
            BinOp::Lt => self.func.emit(&Instruction::F64Lt),
            BinOp::Le => self.func.emit(&Instruction::F64Le),
            BinOp::Gt => self.func.emit(&Instruction::F64Gt),
            BinOp::Ge => self.func.emit(&Instruction::F64Ge),
            BinOp::LogicalAnd | BinOp::LogicalOr => unreachable!("handled by the caller"),
        }
        Ok(())
    }

    /// `boolean,boolean` row (§4.3): both operands are already `i32`, so every comparison and
    /// bitwise op is a direct `i32` instruction; `&&`/`||` never reach here (peeled off earlier).
    fn lower_boolean_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        self.lower_value(left)?;
        self.lower_value(right)?;

        let instruction = match op {
            BinOp::Eq => Instruction::I32Eq,
            BinOp::Ne => Instruction::I32Ne,
            BinOp::BitAnd => Instruction::I32And,
            BinOp::BitOr => Instruction::I32Or,
            BinOp::BitXor => Instruction::I32Xor,
            BinOp::Lt => Instruction::I32LtS,
            BinOp::Le => Instruction::I32LeS,
            BinOp::Gt => Instruction::I32GtS,
            BinOp::Ge => Instruction::I32GeS,
            _ => {
                return Err(crate::error::LowerError::unsupported(
                    "operator is not defined over two booleans",
                ))
            }
        };
        self.func.emit(&instruction);
        Ok(())
    }

    /// `number,boolean`/`boolean,number` row (§4.3): the boolean side is promoted to `f64` and the
    /// numeric op table is reused, matching how the language's own implicit numeric coercion of
    /// booleans behaves.
    fn lower_mixed_numeric_boolean_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        self.lower_value(left)?;
        if matches!(static_type_of(left), SourceType::Boolean) {
            self.func.emit(&Instruction::F64ConvertI32S);
        }
        self.lower_value(right)?;
        if matches!(static_type_of(right), SourceType::Boolean) {
            self.func.emit(&Instruction::F64ConvertI32S);
        }

        let instruction = match op {
            BinOp::Add => Instruction::F64Add,
            BinOp::Sub => Instruction::F64Sub,
            BinOp::Mul => Instruction::F64Mul,
            BinOp::Div => Instruction::F64Div,
            BinOp::Eq => Instruction::F64Eq,
            BinOp::Ne => Instruction::F64Ne,
            BinOp::Lt => Instruction::F64Lt,
            BinOp::Le => Instruction::F64Le,
            BinOp::Gt => Instruction::F64Gt,
            BinOp::Ge => Instruction::F64Ge,
            _ => {
                return Err(crate::error::LowerError::unsupported(
                    "operator is not defined over a mixed number/boolean pair",
                ))
            }
        };
        self.func.emit(&instruction);
        Ok(())
    }

    /// `string,string` row (§4.3): only (in)equality is defined. There is no host ABI entry for
    /// comparing the GC-struct string representation `lower_string_literal` builds directly (the
    /// `dyntype_new_string`/`dyntype_to_string` pair works over a distinct offset+length host
    /// representation), so equality is a hand-rolled element-wise comparison over the codepoints
    /// array: same length, then every codepoint equal.
    fn lower_string_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        if !matches!(op, BinOp::Eq | BinOp::Ne) {
            return Err(crate::error::LowerError::unsupported(
                "only `==`/`!=` are defined over two strings",
            ));
        }

        let string_struct = self.ctx.type_lower.string_struct_type();
        let codepoints = self.ctx.type_lower.string_codepoints_array_type();
        let array_ref = ValType::Ref(wasm_encoder::RefType {
            nullable: false,
            heap_type: codepoints.heap_type,
        });

        self.lower_value(left)?;
        self.func.emit(&Instruction::StructGet(string_struct.wasm_type.0, 1));
        let left_array = self.func.alloc_local(array_ref);
        self.func.emit(&Instruction::LocalSet(left_array.0));

        self.lower_value(right)?;
        self.func.emit(&Instruction::StructGet(string_struct.wasm_type.0, 1));
        let right_array = self.func.alloc_local(array_ref);
        self.func.emit(&Instruction::LocalSet(right_array.0));

        let result = self.func.alloc_local(ValType::I32);
        self.func.emit(&Instruction::I32Const(0));
        self.func.emit(&Instruction::LocalSet(result.0));

        self.func.emit(&Instruction::LocalGet(left_array.0));
        self.func.emit(&Instruction::ArrayLen);
        self.func.emit(&Instruction::LocalGet(right_array.0));
        self.func.emit(&Instruction::ArrayLen);
        self.func.emit(&Instruction::I32Eq);
        self.func.emit(&Instruction::If(wasm_encoder::BlockType::Empty));
        self.func.enter_block();

        self.func.emit(&Instruction::I32Const(1));
        self.func.emit(&Instruction::LocalSet(result.0));

        let i = self.func.alloc_local(ValType::I32);
        self.func.emit(&Instruction::I32Const(0));
        self.func.emit(&Instruction::LocalSet(i.0));

        self.func.emit(&Instruction::Block(wasm_encoder::BlockType::Empty));
        let exit = self.func.enter_block();
        self.func.emit(&Instruction::Loop(wasm_encoder::BlockType::Empty));
        let loop_start = self.func.enter_block();

        self.func.emit(&Instruction::LocalGet(i.0));
        self.func.emit(&Instruction::LocalGet(left_array.0));
        self.func.emit(&Instruction::ArrayLen);
        self.func.emit(&Instruction::I32GeU);
        let exit_depth = self.func.branch_depth_to(exit)?;
        self.func.emit(&Instruction::BrIf(exit_depth));

        self.func.emit(&Instruction::LocalGet(left_array.0));
        self.func.emit(&Instruction::LocalGet(i.0));
        self.func.emit(&Instruction::ArrayGet(codepoints.wasm_type.0));
        self.func.emit(&Instruction::LocalGet(right_array.0));
        self.func.emit(&Instruction::LocalGet(i.0));
        self.func.emit(&Instruction::ArrayGet(codepoints.wasm_type.0));
        self.func.emit(&Instruction::I32Ne);
        self.func.emit(&Instruction::If(wasm_encoder::BlockType::Empty));
        self.func.enter_block();
        self.func.emit(&Instruction::I32Const(0));
        self.func.emit(&Instruction::LocalSet(result.0));
        let exit_depth2 = self.func.branch_depth_to(exit)?;
        self.func.emit(&Instruction::Br(exit_depth2));
        self.func.emit(&Instruction::End);
        self.func.exit_block();

        self.func.emit(&Instruction::LocalGet(i.0));
        self.func.emit(&Instruction::I32Const(1));
        self.func.emit(&Instruction::I32Add);
        self.func.emit(&Instruction::LocalSet(i.0));
        let loop_depth = self.func.branch_depth_to(loop_start)?;
        self.func.emit(&Instruction::Br(loop_depth));

        self.func.emit(&Instruction::End);
        self.func.exit_block();
        self.func.emit(&Instruction::End);
        self.func.exit_block();

        self.func.emit(&Instruction::End);
        self.func.exit_block();

        self.func.emit(&Instruction::LocalGet(result.0));
        if matches!(op, BinOp::Ne) {
            self.func.emit(&Instruction::I32Eqz);
        }
        Ok(())
    }

    /// `any,any` row (§4.3): both sides are already `anyref`; equality/ordering go through the
    /// dyntype ABI's generic comparison entries.
    fn lower_any_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        self.lower_value(left)?;
        self.lower_value(right)?;
        match op {
            BinOp::Eq | BinOp::Ne => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::TypeEq);
                self.func.emit(&Instruction::Call(import.0));
                if matches!(op, BinOp::Ne) {
                    self.func.emit(&Instruction::I32Eqz);
                }
                Ok(())
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::Cmp);
                self.func.emit(&Instruction::Call(import.0));
                self.func.emit(&Instruction::I32Const(0));
                let instruction = match op {
                    BinOp::Lt => Instruction::I32LtS,
                    BinOp::Le => Instruction::I32LeS,
                    BinOp::Gt => Instruction::I32GtS,
                    BinOp::Ge => Instruction::I32GeS,
                    _ => unreachable!("matched above"),
                };
                self.func.emit(&instruction);
                Ok(())
            }
            _ => Err(crate::error::LowerError::unsupported(
                "operator is not defined over two `any` values",
            )),
        }
    }

    /// `any,static` / `static,any` row (§4.3): the statically typed side is boxed to `any` first
    /// (the boxing a `let a: any = x` assignment would do anyway), then the `any,any` row runs.
    /// Simpler than unboxing the `any` side and reusing the static row, and avoids ever unboxing a
    /// value whose runtime type might not actually match the static side's type.
    fn lower_any_static_binary(
        &mut self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        left_ty: &SourceType,
        right_ty: &SourceType,
    ) -> crate::Result<()> {
        self.lower_value(left)?;
        if !matches!(left_ty, SourceType::Any) {
            self.box_value_of_type(left_ty)?;
        }
        self.lower_value(right)?;
        if !matches!(right_ty, SourceType::Any) {
            self.box_value_of_type(right_ty)?;
        }

        match op {
            BinOp::Eq | BinOp::Ne => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::TypeEq);
                self.func.emit(&Instruction::Call(import.0));
                if matches!(op, BinOp::Ne) {
                    self.func.emit(&Instruction::I32Eqz);
                }
                Ok(())
            }
            _ => Err(crate::error::LowerError::unsupported(
                "only (in)equality is defined between an `any` and a statically typed value",
            )),
        }
    }

    /// Boxes a value of static type `ty` already on the stack, in place, without re-lowering it.
    fn box_value_of_type(&mut self, ty: &SourceType) -> crate::Result<()> {
        match ty {
            SourceType::Number => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::NewNumber);
                self.func.emit(&Instruction::Call(import.0));
            }
            SourceType::Boolean => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::NewBoolean);
                self.func.emit(&Instruction::Call(import.0));
            }
            _ => {}
        }
        Ok(())
    }

    /// Class/array (and any other reference pair not already handled above) row (§4.3):
    /// `ref.eq`, the GC proposal's identity comparison. No other operator is defined.
    fn lower_reference_equality_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        if !matches!(op, BinOp::Eq | BinOp::Ne) {
            return Err(crate::error::LowerError::unsupported(
                "only `==`/`!=` are defined over two object references",
            ));
        }
        self.lower_value(left)?;
        self.lower_value(right)?;
        self.func.emit(&Instruction::RefEq);
        if matches!(op, BinOp::Ne) {
            self.func.emit(&Instruction::I32Eqz);
        }
        Ok(())
    }

    /// `null`/`undefined` row (§4.3): same-kind nullish-literal comparisons resolve to a
    /// compile-time constant; comparing a reference-typed value against a nullish literal lowers
    /// to `ref.is_null`; comparing a non-reference static type (`number`/`boolean`/`void`, the only
    /// ones `SourceType::is_reference` excludes) against a nullish literal is always false/true,
    /// but both sides are still evaluated for their side effects before the result is dropped.
    fn lower_nullish_binary(
        &mut self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        left_ty: &SourceType,
        right_ty: &SourceType,
    ) -> crate::Result<()> {
        if !matches!(op, BinOp::Eq | BinOp::Ne) {
            return Err(crate::error::LowerError::unsupported(
                "only `==`/`!=` are defined when either operand is `null`/`undefined`",
            ));
        }

        let both_nullish = left_ty.is_null_or_undefined() && right_ty.is_null_or_undefined();
        if both_nullish {
            self.lower_value(left)?;
            self.func.emit(&Instruction::Drop);
            self.lower_value(right)?;
            self.func.emit(&Instruction::Drop);
            self.func.emit(&Instruction::I32Const(matches!(op, BinOp::Eq) as i32));
            return Ok(());
        }

        let (value_expr, value_ty) = if left_ty.is_null_or_undefined() {
            (right, right_ty)
        } else {
            (left, left_ty)
        };

        if !value_ty.is_reference() {
            self.lower_value(left)?;
            if !matches!(left, Expr::NullLiteral | Expr::UndefinedLiteral) {
                self.func.emit(&Instruction::Drop);
            }
            self.lower_value(right)?;
            if !matches!(right, Expr::NullLiteral | Expr::UndefinedLiteral) {
                self.func.emit(&Instruction::Drop);
            }
            self.func.emit(&Instruction::I32Const(matches!(op, BinOp::Ne) as i32));
            return Ok(());
        }

        self.lower_value(value_expr)?;
        self.func.emit(&Instruction::RefIsNull);
        if matches!(op, BinOp::Ne) {
            self.func.emit(&Instruction::I32Eqz);
        }
        Ok(())
    }

    /// `&&`/`||` must not evaluate their right operand unconditionally (§4.3).
    fn lower_short_circuit(&mut self, op: BinOp, left: &Expr, right: &Expr) -> crate::Result<()> {
        self.lower_value(left)?;
        self.func.emit(&Instruction::If(wasm_encoder::BlockType::Result(ValType::I32)));
        let block = self.func.enter_block();
        match op {
            BinOp::LogicalAnd => self.lower_value(right)?,
            BinOp::LogicalOr => self.func.emit(&Instruction::I32Const(1)),
            _ => unreachable!(),
        }
        self.func.emit(&Instruction::Else);
        match op {
            BinOp::LogicalAnd => self.func.emit(&Instruction::I32Const(0)),
            BinOp::LogicalOr => self.lower_value(right)?,
            _ => unreachable!(),
        }
        self.func.emit(&Instruction::End);
        self.func.exit_block();
        let _ = block;
        Ok(())
    }

    fn lower_unary(&mut self, op: UnOp, operand: &Expr) -> crate::Result<()> {
        self.lower_value(operand)?;
        match op {
            UnOp::Neg => self.func.emit(&Instruction::F64Neg),
            UnOp::Not => {
                self.func.emit(&Instruction::I32Eqz);
            }
            UnOp::BitNot => {
                self.func.emit(&Instruction::I32Const(-1));
                self.func.emit(&Instruction::I32Xor);
            }
            UnOp::Truthiness => {
                // Already boolean/number/reference specific truthiness is resolved by the front
                // end into the concrete operations above; a bare `Truthiness` tag reaching here
                // means the operand's own type determines the test (§4.3 "truthiness coercion").
                self.func.emit(&Instruction::I32Eqz);
                self.func.emit(&Instruction::I32Eqz);
            }
        }
        Ok(())
    }

    fn lower_property_access(&mut self, receiver: &Expr, name: &str) -> crate::Result<Access> {
        // The static-field/static-method/interface/dynamic dispatch matrix (§4.3 "Property access
        // dispatch") is driven by `receiver`'s resolved [`SourceType`]; the Module Driver's
        // registration pass guarantees every class/interface is already registered by the time any
        // function body is lowered (§4.5), so slot lookups here never race construction.
        match static_type_of(receiver) {
            SourceType::Class(class) => self.lower_class_property_access(receiver, class, name),
            SourceType::Interface(_) => {
                // Structural interface access unwraps the view down to the underlying object and
                // falls back to the dynamic ABI, rather than resolving a per-class vtable slot at
                // runtime: the itable records which slot a matching class uses, but different
                // classes satisfying the same interface generally place the member at different
                // vtable slots, and each class's vtable is its own nominal struct type with no
                // shared shape a slot index could be read out of uniformly.
                self.lower_value(receiver)?;
                let view = self.ctx.type_lower.interface_view_type();
                self.func.emit(&Instruction::StructGet(view.wasm_type.0, 2));
                Ok(Access::DynamicField {
                    name: name.to_string(),
                })
            }
            _ => {
                self.lower_value(receiver)?;
                Ok(Access::DynamicField {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Static field/method/getter dispatch for a receiver whose class is known at lowering time
    /// (§4.3, §4.1). The receiver is narrowed once via `ref.cast` to its declared instance type, the
    /// same trick `lower_one_function` uses to bind `this` — always legal to validate since every
    /// concrete struct type implicitly subtypes `anyref`.
    fn lower_class_property_access(
        &mut self,
        receiver: &Expr,
        class: crate::types::SourceTypeId,
        name: &str,
    ) -> crate::Result<Access> {
        let layout = self.ctx.type_lower.class_layout_by_id(class)?.clone();
        let instance_ref = wasm_encoder::RefType {
            nullable: false,
            heap_type: layout.instance_struct.heap_type,
        };

        if let Some(&field_index) = layout.field_slots.get(name) {
            self.lower_value(receiver)?;
            self.func.emit(&Instruction::RefCast(instance_ref));
            let ty = layout.field_types.get(name).cloned().unwrap_or(SourceType::Any);
            return Ok(Access::StructField {
                struct_type_index: layout.instance_struct.wasm_type.0,
                field_index,
                ty,
            });
        }

        if let Some(&vtable_slot) = layout.method_slots.get(name) {
            let mangled = layout.method_impls.get(name).cloned().ok_or_else(|| {
                crate::error::LowerError::invariant(format!("method `{name}` has no registered implementation"))
            })?;
            let func_id = self.ctx.function_id(&mangled)?;
            let sig = self.ctx.function_signature(func_id).clone();

            if matches!(sig.ty.kind, crate::types::FunctionKind::Getter) {
                self.lower_value(receiver)?;
                self.func.emit(&Instruction::RefCast(instance_ref));
                let receiver_local = self.func.alloc_local(ValType::Ref(instance_ref));
                self.func.emit(&Instruction::LocalSet(receiver_local.0));
                return Ok(Access::GetterBinding {
                    receiver_local,
                    instance_type_index: layout.instance_struct.wasm_type.0,
                    vtable_type_index: layout.vtable_struct.wasm_type.0,
                    vtable_slot,
                    func_type_index: sig.wasm_type.0,
                    ty: sig.ty.return_type.clone(),
                });
            }

            self.lower_value(receiver)?;
            self.func.emit(&Instruction::RefCast(instance_ref));
            return Ok(Access::MethodBinding {
                instance_type_index: layout.instance_struct.wasm_type.0,
                vtable_type_index: layout.vtable_struct.wasm_type.0,
                vtable_slot,
                ty: SourceType::Function(sig.ty.clone()),
            });
        }

        Err(crate::error::LowerError::invariant(format!(
            "class has no field or method named `{name}`"
        )))
    }

    fn lower_element_access(&mut self, receiver: &Expr, index: &Expr) -> crate::Result<Access> {
        if let SourceType::Array(element) = static_type_of(receiver) {
            let (array, envelope) = self.ctx.type_lower.array_envelope_parts(&element)?;
            self.lower_value(receiver)?;
            self.func.emit(&Instruction::StructGet(envelope.wasm_type.0, 0));
            self.lower_value(index)?;
            return Ok(Access::ArrayElement {
                array_type_index: array.wasm_type.0,
                element_ty: *element,
            });
        }

        self.lower_value(receiver)?;
        self.lower_value(index)?;
        Ok(Access::DynamicElement)
    }

    fn load_through_access(&mut self, _expr: &Expr, access: Access) -> crate::Result<()> {
        match &access {
            Access::DynamicField { name } => {
                // `intern_string` prefixes the 4-byte length before the codepoint bytes (§6
                // string-constant layout); `GetProperty` wants a raw `(ptr, len)` pair, not the
                // interned offset on its own.
                let offset = self.ctx.data_segment.intern_string(name);
                self.func.emit(&Instruction::I32Const((offset + 4) as i32));
                self.func.emit(&Instruction::I32Const(name.len() as i32));
                let import = self.ctx.abi.get(crate::abi::AbiFunction::GetProperty);
                self.func.emit(&Instruction::Call(import.0));
                Ok(())
            }
            Access::DynamicElement => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::GetElem);
                self.func.emit(&Instruction::Call(import.0));
                Ok(())
            }
            _ => access.emit_load(self.func),
        }
    }

    /// Stores `value` through `access`, leaving the stored value on the stack as the
    /// assignment's own result (§3 "assignment is itself an expression"). `DynamicField`/
    /// `DynamicElement` route through the `dyntype` ABI's setters, which `Access::emit_store`
    /// can't emit on its own since the import id and operand order depend on the interned name;
    /// every other variant reuses the tee-then-store-then-reload shape directly.
    fn store_through_access(&mut self, access: &Access, value: &Expr) -> crate::Result<()> {
        let anyref = ValType::Ref(wasm_encoder::RefType {
            nullable: true,
            heap_type: wasm_encoder::HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Any,
            },
        });

        match access {
            Access::DynamicField { name } => {
                let offset = self.ctx.data_segment.intern_string(name);
                self.func.emit(&Instruction::I32Const((offset + 4) as i32));
                self.func.emit(&Instruction::I32Const(name.len() as i32));
                self.lower_value(value)?;
                let temp = self.func.alloc_local(anyref);
                self.func.emit(&Instruction::LocalTee(temp.0));
                let import = self.ctx.abi.get(crate::abi::AbiFunction::SetProperty);
                self.func.emit(&Instruction::Call(import.0));
                self.func.emit(&Instruction::LocalGet(temp.0));
                Ok(())
            }
            Access::DynamicElement => {
                self.lower_value(value)?;
                let temp = self.func.alloc_local(anyref);
                self.func.emit(&Instruction::LocalTee(temp.0));
                let import = self.ctx.abi.get(crate::abi::AbiFunction::SetElem);
                self.func.emit(&Instruction::Call(import.0));
                self.func.emit(&Instruction::LocalGet(temp.0));
                Ok(())
            }
            _ => {
                self.lower_value(value)?;
                match access.source_type().cloned() {
                    Some(ty) => {
                        let val_type = self.ctx.type_lower.wasm_value_type(&ty)?;
                        let temp = self.func.alloc_local(val_type);
                        self.func.emit(&Instruction::LocalTee(temp.0));
                        access.emit_store(self.func)?;
                        self.func.emit(&Instruction::LocalGet(temp.0));
                    }
                    None => access.emit_store(self.func)?,
                }
                Ok(())
            }
        }
    }

    fn lower_call(&mut self, callee: &Expr, args: &[Expr]) -> crate::Result<()> {
        match callee {
            Expr::PropertyAccess { receiver, name } => {
                if let SourceType::Class(class) = static_type_of(receiver) {
                    return self.lower_class_method_call(receiver, class, name, args);
                }

                // Interface/any/dynamic receiver: unwrap an interface view to its wrapped object
                // (same as `lower_property_access`'s interface row), resolve the method by name
                // through the dynamic ABI, then invoke it through `dyntype_invoke` rather than
                // `call_ref` — the resolved method's real function type isn't known until the
                // host looks it up at runtime, and `call_ref` needs a concrete type known here.
                let object_ty = static_type_of(receiver);
                self.lower_value(receiver)?;
                if matches!(object_ty, SourceType::Interface(_)) {
                    let view = self.ctx.type_lower.interface_view_type();
                    self.func.emit(&Instruction::StructGet(view.wasm_type.0, 2));
                }
                let offset = self.ctx.data_segment.intern_string(name);
                self.func.emit(&Instruction::I32Const((offset + 4) as i32));
                self.func.emit(&Instruction::I32Const(name.len() as i32));
                let get_property = self.ctx.abi.get(crate::abi::AbiFunction::GetProperty);
                self.func.emit(&Instruction::Call(get_property.0));

                self.dynamic_invoke(args)
            }
            _ => {
                let callee_ty = static_type_of(callee);
                let access = self.lower_access_or_value_callee(callee)?;
                match access {
                    Some(Access::FunctionBinding { func, ty }) => {
                        // Calling convention is `(context, args...)` (§4.1); a free function or
                        // static method called directly by name has no enclosing closure of its own
                        // to chain into, so the context is always null here (same convention as
                        // `lower_class_method_call`/`lower_super_call`'s own null context push).
                        self.func.emit(&Instruction::RefNull(wasm_encoder::HeapType::Abstract {
                            shared: false,
                            ty: wasm_encoder::AbstractHeapType::Any,
                        }));
                        match ty {
                            SourceType::Function(ty) => self.lower_args_for(&ty, args)?,
                            _ => {
                                for arg in args {
                                    self.lower_value(arg)?;
                                }
                            }
                        }
                        self.func.emit(&Instruction::Call(func.0));
                        Ok(())
                    }
                    _ => self.call_function_value(callee_ty, args),
                }
            }
        }
    }

    /// Argument shaping (§4.3): converts each positional argument across the any↔static boxing
    /// boundary against its declared parameter's type, fills a missing optional argument with
    /// boxed `undefined`, and packs a trailing rest parameter into a fresh array envelope.
    fn lower_args_for(&mut self, ty: &crate::types::FunctionType, args: &[Expr]) -> crate::Result<()> {
        let fixed_len = ty.rest_param.unwrap_or(ty.params.len());

        for (i, param) in ty.params.iter().take(fixed_len).enumerate() {
            match args.get(i) {
                Some(arg) => self.lower_argument(arg, &param.ty)?,
                None => self.push_boxed_undefined()?,
            }
        }

        if let Some(idx) = ty.rest_param {
            let element = match &ty.params[idx].ty {
                SourceType::Array(element) => (**element).clone(),
                other => other.clone(),
            };
            let (array, envelope) = self.ctx.type_lower.array_envelope_parts(&element)?;
            let rest_args = args.get(idx..).unwrap_or(&[]);
            for arg in rest_args {
                self.lower_argument(arg, &element)?;
            }
            self.func
                .emit(&Instruction::ArrayNewFixed(array.wasm_type.0, rest_args.len() as u32));
            self.func.emit(&Instruction::I32Const(rest_args.len() as i32));
            self.func.emit(&Instruction::StructNew(envelope.wasm_type.0));
        }

        Ok(())
    }

    /// Lowers one call argument, boxing/unboxing it across the any↔static boundary when its
    /// static type and the declared parameter type disagree on it (§4.3 "Argument shaping").
    fn lower_argument(&mut self, arg: &Expr, param_ty: &SourceType) -> crate::Result<()> {
        let arg_ty = static_type_of(arg);
        match (param_ty, &arg_ty) {
            (SourceType::Any, other) if !matches!(other, SourceType::Any) => {
                self.lower_value(arg)?;
                self.box_value_of_type(other)
            }
            (other, SourceType::Any) if !matches!(other, SourceType::Any) => self.lower_unbox(arg, other),
            _ => self.lower_value(arg),
        }
    }

    /// Pushes the boxed `undefined` value a missing optional parameter is filled with (§4.3).
    fn push_boxed_undefined(&mut self) -> crate::Result<()> {
        let import = self.ctx.abi.get(crate::abi::AbiFunction::NewUndefined);
        self.func.emit(&Instruction::Call(import.0));
        Ok(())
    }

    /// Invokes a dynamically-resolved callee value already on the stack (§6 `dyntype_invoke`):
    /// boxes every argument into a host-owned array and lets the host perform the call, since the
    /// callee's real function type is resolved by the host at runtime and `call_ref` needs a
    /// concrete type known here.
    fn dynamic_invoke(&mut self, args: &[Expr]) -> crate::Result<()> {
        let anyref = ValType::Ref(wasm_encoder::RefType {
            nullable: true,
            heap_type: wasm_encoder::HeapType::Abstract {
                shared: false,
                ty: wasm_encoder::AbstractHeapType::Any,
            },
        });

        let callee_local = self.func.alloc_local(anyref);
        self.func.emit(&Instruction::LocalSet(callee_local.0));

        self.func.emit(&Instruction::I32Const(args.len() as i32));
        let new_array = self.ctx.abi.get(crate::abi::AbiFunction::NewArray);
        self.func.emit(&Instruction::Call(new_array.0));
        let array_local = self.func.alloc_local(anyref);
        self.func.emit(&Instruction::LocalSet(array_local.0));

        for (index, arg) in args.iter().enumerate() {
            self.func.emit(&Instruction::LocalGet(array_local.0));
            self.func.emit(&Instruction::I32Const(index as i32));
            self.lower_value(arg)?;
            self.box_value_of_type(&static_type_of(arg))?;
            let set_elem = self.ctx.abi.get(crate::abi::AbiFunction::SetElem);
            self.func.emit(&Instruction::Call(set_elem.0));
        }

        self.func.emit(&Instruction::LocalGet(callee_local.0));
        self.func.emit(&Instruction::LocalGet(array_local.0));
        self.func.emit(&Instruction::I32Const(args.len() as i32));
        let invoke = self.ctx.abi.get(crate::abi::AbiFunction::Invoke);
        self.func.emit(&Instruction::Call(invoke.0));
        Ok(())
    }

    /// Static instance-method call dispatch for a receiver whose class is known at lowering time
    /// (§4.3, §4.1): narrows the receiver once via `ref.cast`, stashes it in a scratch local since
    /// it's needed twice (bound as `this`, then again to read the vtable slot), and resolves the
    /// callee's real function type from its registered [`crate::context::FunctionSignature`]
    /// rather than a placeholder.
    fn lower_class_method_call(
        &mut self,
        receiver: &Expr,
        class: crate::types::SourceTypeId,
        name: &str,
        args: &[Expr],
    ) -> crate::Result<()> {
        let layout = self.ctx.type_lower.class_layout_by_id(class)?.clone();
        let vtable_slot = *layout.method_slots.get(name).ok_or_else(|| {
            crate::error::LowerError::invariant(format!("class has no method named `{name}`"))
        })?;
        let mangled = layout.method_impls.get(name).cloned().ok_or_else(|| {
            crate::error::LowerError::invariant(format!("method `{name}` has no registered implementation"))
        })?;
        let func_id = self.ctx.function_id(&mangled)?;
        let sig = self.ctx.function_signature(func_id).clone();

        let instance_ref = wasm_encoder::RefType {
            nullable: false,
            heap_type: layout.instance_struct.heap_type,
        };
        self.lower_value(receiver)?;
        self.func.emit(&Instruction::RefCast(instance_ref));
        let receiver_local = self.func.alloc_local(ValType::Ref(instance_ref));
        self.func.emit(&Instruction::LocalSet(receiver_local.0));

        // Calling convention is `(context, this, args...)` (§4.1); a plain method call has no
        // enclosing closure of its own to chain into, so the context is always null here.
        self.func.emit(&Instruction::RefNull(wasm_encoder::HeapType::Abstract {
            shared: false,
            ty: wasm_encoder::AbstractHeapType::Any,
        }));
        self.func.emit(&Instruction::LocalGet(receiver_local.0));
        self.lower_args_for(&sig.ty, args)?;
        self.func.emit(&Instruction::LocalGet(receiver_local.0));
        self.func.emit(&Instruction::StructGet(layout.instance_struct.wasm_type.0, 0));
        self.func.emit(&Instruction::StructGet(layout.vtable_struct.wasm_type.0, vtable_slot));
        self.func.emit(&Instruction::CallRef(sig.wasm_type.0));
        Ok(())
    }

    /// Calls a first-class function value already left on the stack as a `function-closure-struct`
    /// (§4.1) — the shared 2-field `{context, funcref}` wrapper every function value uses
    /// regardless of its own signature. The wrapper's `funcref` field is stored as the abstract
    /// `func` heap type since no single concrete function type fits every callee, so the concrete
    /// type only becomes known at the call site, resolved from `callee_ty`, and a `ref.cast`
    /// narrows the funcref to it immediately before `call_ref`.
    fn call_function_value(&mut self, callee_ty: SourceType, args: &[Expr]) -> crate::Result<()> {
        let ty = match callee_ty {
            SourceType::Function(ty) => ty,
            _ => {
                return Err(crate::error::LowerError::invariant(
                    "called expression has no statically known function type",
                ))
            }
        };

        let wrapper = self.ctx.type_lower.function_closure_struct();
        let wrapper_ref = wasm_encoder::RefType {
            nullable: false,
            heap_type: wrapper.heap_type,
        };
        let closure_local = self.func.alloc_local(ValType::Ref(wrapper_ref));
        self.func.emit(&Instruction::LocalSet(closure_local.0));

        self.func.emit(&Instruction::LocalGet(closure_local.0));
        self.func.emit(&Instruction::StructGet(wrapper.wasm_type.0, 0));
        self.lower_args_for(&ty, args)?;

        let func_type = self
            .ctx
            .type_lower
            .func_signature_type(crate::context::CallKind::Function, &ty)?;
        let typed_funcref = wasm_encoder::RefType {
            nullable: false,
            heap_type: wasm_encoder::HeapType::Concrete(func_type.0),
        };
        self.func.emit(&Instruction::LocalGet(closure_local.0));
        self.func.emit(&Instruction::StructGet(wrapper.wasm_type.0, 1));
        self.func.emit(&Instruction::RefCast(typed_funcref));
        self.func.emit(&Instruction::CallRef(func_type.0));
        Ok(())
    }

    fn lower_access_or_value_callee(&mut self, callee: &Expr) -> crate::Result<Option<Access>> {
        if let Expr::Identifier { local, .. } = callee {
            if let Ok(access @ Access::FunctionBinding { .. }) = self.resolve_local(*local) {
                return Ok(Some(access));
            }
        }
        if let Expr::GlobalRef { name, .. } = callee {
            if let Ok(func) = self.ctx.function_id(name) {
                let ty = self.ctx.function_signature(func).ty.clone();
                return Ok(Some(Access::FunctionBinding {
                    func,
                    ty: SourceType::Function(ty),
                }));
            }
        }
        self.lower_value(callee)?;
        Ok(None)
    }

    fn lower_new(&mut self, class: crate::types::SourceTypeId, args: &[Expr]) -> crate::Result<()> {
        let layout = self.ctx.type_lower.class_layout_by_id(class)?;
        let instance_type = layout.instance_struct.wasm_type.0;
        let vtable_global = self.ctx.class_vtable_global(class)?;

        // Field 0 is always the vtable reference (§3 invariant 3); it is pushed before the
        // constructor's own arguments, matching `instance_struct`'s field order.
        self.func.emit(&Instruction::GlobalGet(vtable_global.0));
        for arg in args {
            self.lower_value(arg)?;
        }
        self.func.emit(&Instruction::StructNew(instance_type));
        Ok(())
    }

    fn lower_new_array(&mut self, kind: &NewArrayKind) -> crate::Result<()> {
        match kind {
            NewArrayKind::DefaultFilled { length, element } | NewArrayKind::Sized { length, element } => {
                let (array, envelope) = self.ctx.type_lower.array_envelope_parts(element)?;
                self.lower_value(length)?;
                self.func.emit(&Instruction::ArrayNewDefault(array.wasm_type.0));
                self.func.emit(&Instruction::I32Const(0));
                self.func.emit(&Instruction::StructNew(envelope.wasm_type.0));
                Ok(())
            }
            NewArrayKind::FromElements { elements, element } => {
                let (array, envelope) = self.ctx.type_lower.array_envelope_parts(element)?;
                for elem in elements {
                    self.lower_value(elem)?;
                }
                self.func
                    .emit(&Instruction::ArrayNewFixed(array.wasm_type.0, elements.len() as u32));
                self.func.emit(&Instruction::I32Const(elements.len() as i32));
                self.func.emit(&Instruction::StructNew(envelope.wasm_type.0));
                Ok(())
            }
        }
    }

    fn lower_super_call(&mut self, args: &[Expr]) -> crate::Result<()> {
        let owner = self.owner_class.ok_or_else(|| {
            crate::error::LowerError::invariant("`super(...)` outside a class constructor")
        })?;
        let base = self.ctx.class_base(owner)?.ok_or_else(|| {
            crate::error::LowerError::invariant("`super(...)` in a class with no base class")
        })?;
        let base_name = self.ctx.class_mangled_name(base)?.to_string();
        let ctor = self.ctx.function_id(&crate::ident::constructor_name(&base_name))?;
        let this_access = self.resolve_local(LocalId::THIS)?;

        // The base constructor's own signature is `(context, this, args...)` (§4.1), same as any
        // other instance method: a null context (the base constructor has no enclosing closure of
        // its own to chain into) and the already-bound `this` local, widened for free to `anyref`
        // since every concrete struct type implicitly subtypes it — no `ref.cast` needed, which
        // matters because the derived and base instance structs declare no `supertype_idx`
        // relationship to each other that a cast between their two concrete types could use.
        self.func.emit(&Instruction::RefNull(wasm_encoder::HeapType::Abstract {
            shared: false,
            ty: wasm_encoder::AbstractHeapType::Any,
        }));
        this_access.emit_load(self.func)?;
        for arg in args {
            self.lower_value(arg)?;
        }
        self.func.emit(&Instruction::Call(ctor.0));
        Ok(())
    }

    /// Builds a `function-closure-struct` value for a nested function literal (§4.1, §4.2): when
    /// the target function itself captures anything, a fresh context struct is built for it here,
    /// reading each captured variable's current value out of the *creating* scope (itself possibly
    /// a capture read, recursively, if this scope is nested); a target with no captures of its own
    /// simply reuses the creating scope's own context value, since it will never be read through.
    fn lower_function_expr(&mut self, ty: &std::sync::Arc<crate::types::FunctionType>, function_index: u32) -> crate::Result<()> {
        let _ = ty;
        let target = crate::context::FuncId(function_index);

        match self.ctx.closure_layout_of(target).cloned() {
            Some(layout) => {
                let captures = self
                    .ctx
                    .closure_captures_of(target)
                    .expect("a registered closure layout always has a matching capture list")
                    .to_vec();
                let parent_local = self.closures.local_of(self.scope);
                self.func.emit(&Instruction::LocalGet(parent_local.0));
                for (local, _) in &captures {
                    let access = self.resolve_local(*local)?;
                    access.emit_load(self.func)?;
                }
                self.func.emit(&Instruction::StructNew(layout.struct_type.wasm_type.0));
            }
            None => {
                let own_local = self.closures.local_of(self.scope);
                self.func.emit(&Instruction::LocalGet(own_local.0));
            }
        }

        self.func.emit(&Instruction::RefFunc(function_index));
        let wrapper = self.ctx.type_lower.function_closure_struct();
        self.func.emit(&Instruction::StructNew(wrapper.wasm_type.0));
        Ok(())
    }

    fn lower_cast(&mut self, value: &Expr, target: &SourceType) -> crate::Result<()> {
        if let (SourceType::Interface(_), SourceType::Class(class)) = (target, static_type_of(value)) {
            return self.lower_cast_to_interface(value, class);
        }

        self.lower_value(value)?;
        let val_type = self.ctx.type_lower.wasm_value_type(target)?;
        if let ValType::Ref(r) = val_type {
            self.func.emit(&Instruction::RefCast(wasm_encoder::RefType {
                nullable: r.nullable,
                heap_type: r.heap_type,
            }));
        }
        Ok(())
    }

    /// Builds an interface view (§3 "Itable layout") for a statically `Class`-typed value rather
    /// than `ref.cast`ing to it: the view struct declares no `supertype_idx` relationship to any
    /// class's instance struct (structural interfaces are satisfied by unrelated classes, so no
    /// single nominal supertype could serve), and `ref.cast` between two unrelated concrete struct
    /// types never validates. The object operand only ever widens to `anyref`, which every
    /// concrete struct type subtypes for free.
    fn lower_cast_to_interface(&mut self, value: &Expr, class: crate::types::SourceTypeId) -> crate::Result<()> {
        let offset = self.ctx.itable_offset_for_class(class)?;
        let view = self.ctx.type_lower.interface_view_type();
        self.func.emit(&Instruction::I32Const(offset as i32));
        self.func.emit(&Instruction::I32Const(class.0 as i32));
        self.lower_value(value)?;
        self.func.emit(&Instruction::StructNew(view.wasm_type.0));
        Ok(())
    }

    /// Boxing to `any` (§4.3 "Boxing to `any`") only needs a host constructor call for the two
    /// primitive, non-reference source shapes; everything else is already `anyref`-compatible and
    /// widens for free (every concrete reference type implicitly subtypes `anyref`).
    fn lower_box(&mut self, value: &Expr, source_ty: &SourceType) -> crate::Result<()> {
        self.lower_value(value)?;
        match source_ty {
            SourceType::Number => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::NewNumber);
                self.func.emit(&Instruction::Call(import.0));
            }
            SourceType::Boolean => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::NewBoolean);
                self.func.emit(&Instruction::Call(import.0));
            }
            _ => {}
        }
        Ok(())
    }

    /// Unboxing from `any` (§4.3 "Unboxing from `any`") dispatches on the target type: a primitive
    /// target goes through a host accessor, a reference-shaped target is a plain `ref.cast`
    /// (mirroring `lower_cast`).
    fn lower_unbox(&mut self, value: &Expr, target: &SourceType) -> crate::Result<()> {
        self.lower_value(value)?;
        match target {
            SourceType::Number => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::ToNumber);
                self.func.emit(&Instruction::Call(import.0));
            }
            SourceType::Boolean => {
                let import = self.ctx.abi.get(crate::abi::AbiFunction::ToBool);
                self.func.emit(&Instruction::Call(import.0));
            }
            _ => {
                let val_type = self.ctx.type_lower.wasm_value_type(target)?;
                if let ValType::Ref(r) = val_type {
                    self.func.emit(&Instruction::RefCast(wasm_encoder::RefType {
                        nullable: r.nullable,
                        heap_type: r.heap_type,
                    }));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModuleContext;

    #[test]
    fn number_literal_emits_f64_const() {
        let allocations = crate::allocations::Allocations::new();
        let mut func = FunctionContext::new(&allocations, 0);
        let mut ctx = ModuleContext::new();
        let locals = HashMap::new();
        let mut closures = ClosureArena::new();
        let heap = ctx.type_lower.function_closure_struct().heap_type;
        let scope = closures.root(LocalIndex(0), heap);
        let mut lowerer = ExprLowerer {
            ctx: &mut ctx,
            func: &mut func,
            locals: &locals,
            closures: &closures,
            scope,
            owner_class: None,
        };
        assert!(lowerer.lower_value(&Expr::NumberLiteral(1.0)).is_ok());
    }
}

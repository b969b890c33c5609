//! The Statement Lowerer (§4.4): walks one function body's statement list, threading the local
//! scope and closure-context state the Expression Lowerer needs for each embedded expression.

use crate::access::Access;
use crate::closure::{ClosureArena, ContextFrameId};
use crate::context::ModuleContext;
use crate::expr_lower::ExprLowerer;
use crate::function_context::FunctionContext;
use crate::source::{LocalId, Stmt, SwitchCase};
use std::collections::HashMap;
use wasm_encoder::Instruction;

/// Walks a function's statement list, emitting instructions through `func` and updating `locals`
/// as `Variable` declarations are encountered (§4.4).
pub struct StmtLowerer<'a> {
    pub ctx: &'a mut ModuleContext,
    pub func: &'a mut FunctionContext,
    pub locals: &'a mut HashMap<LocalId, Access>,
    pub closures: &'a ClosureArena,
    pub scope: ContextFrameId,
    /// The class owning the function currently being lowered; `None` for free functions.
    pub owner_class: Option<crate::types::SourceTypeId>,
}

impl<'a> StmtLowerer<'a> {
    fn expr_lowerer(&mut self) -> ExprLowerer<'_> {
        ExprLowerer {
            ctx: self.ctx,
            func: self.func,
            locals: self.locals,
            closures: self.closures,
            scope: self.scope,
            owner_class: self.owner_class,
        }
    }

    pub fn lower_block(&mut self, stmts: &[Stmt]) -> crate::Result<()> {
        for stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    pub fn lower_stmt(&mut self, stmt: &Stmt) -> crate::Result<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.expr_lowerer().lower_value(expr)?;
                // Expression statements discard their value unless the expression is itself
                // `void`-typed (calls to a `void`-returning function push nothing, so there is
                // nothing to drop in that case — but this lowerer has no type information at this
                // point, so the Expression Lowerer is responsible for never leaving a surplus
                // value for a void-typed expression statement).
                Ok(())
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => self.lower_if(condition, then_branch, else_branch),
            Stmt::Block(stmts) => self.lower_block(stmts),
            Stmt::Return(value) => self.lower_return(value.as_ref()),
            Stmt::While { condition, body } => self.lower_while(condition, body),
            Stmt::DoWhile { body, condition } => self.lower_do_while(body, condition),
            Stmt::For {
                init,
                condition,
                update,
                body,
            } => self.lower_for(init.as_deref(), condition.as_ref(), update.as_ref(), body),
            Stmt::Break => {
                let target = self.func.current_break_target()?;
                let depth = self.func.branch_depth_to(target)?;
                self.func.emit(&Instruction::Br(depth));
                Ok(())
            }
            Stmt::Continue => {
                let target = self.func.current_continue_target()?;
                let depth = self.func.branch_depth_to(target)?;
                self.func.emit(&Instruction::Br(depth));
                Ok(())
            }
            Stmt::Switch {
                discriminant,
                cases,
                default,
            } => self.lower_switch(discriminant, cases, default),
            Stmt::Variable {
                local,
                ty,
                initializer,
                captured,
            } => self.lower_variable(*local, ty, initializer.as_ref(), *captured),
            Stmt::ImportDeclaration(import) => {
                // Module-init-function ordering (§4.4) is the Module Driver's job: by the time a
                // function body is being lowered, every `import-declaration` has already been
                // folded into the start function's call sequence.
                let _ = import;
                Ok(())
            }
        }
    }

    fn lower_if(
        &mut self,
        condition: &crate::source::Expr,
        then_branch: &[Stmt],
        else_branch: &[Stmt],
    ) -> crate::Result<()> {
        self.expr_lowerer().lower_value(condition)?;
        self.func
            .emit(&Instruction::If(wasm_encoder::BlockType::Empty));
        self.func.enter_block();
        self.lower_block(then_branch)?;
        if !else_branch.is_empty() {
            self.func.emit(&Instruction::Else);
            self.lower_block(else_branch)?;
        }
        self.func.emit(&Instruction::End);
        self.func.exit_block();
        Ok(())
    }

    fn lower_return(&mut self, value: Option<&crate::source::Expr>) -> crate::Result<()> {
        if let Some(value) = value {
            self.expr_lowerer().lower_value(value)?;
            if let Some(slot) = self.func.return_slot() {
                self.func.emit(&Instruction::LocalSet(slot.0));
            }
        }
        self.func.emit(&Instruction::Return);
        Ok(())
    }

    /// `while (cond) body` lowers to `block { loop { br_if $exit (i32.eqz cond); body; br $loop } }`
    /// so that `break`'s target is the enclosing `block` and `continue`'s target is the `loop`
    /// itself (§4.4 "Break and continue target stored block labels").
    fn lower_while(&mut self, condition: &crate::source::Expr, body: &[Stmt]) -> crate::Result<()> {
        self.func.emit(&Instruction::Block(wasm_encoder::BlockType::Empty));
        let exit = self.func.enter_block();
        self.func.emit(&Instruction::Loop(wasm_encoder::BlockType::Empty));
        let loop_start = self.func.enter_block();

        self.func.push_loop_targets(exit, Some(loop_start));
        self.expr_lowerer().lower_value(condition)?;
        self.func.emit(&Instruction::I32Eqz);
        let exit_depth = self.func.branch_depth_to(exit)?;
        self.func.emit(&Instruction::BrIf(exit_depth));
        self.lower_block(body)?;
        let loop_depth = self.func.branch_depth_to(loop_start)?;
        self.func.emit(&Instruction::Br(loop_depth));
        self.func.pop_loop_targets(true);

        self.func.emit(&Instruction::End);
        self.func.exit_block();
        self.func.emit(&Instruction::End);
        self.func.exit_block();
        Ok(())
    }

    fn lower_do_while(&mut self, body: &[Stmt], condition: &crate::source::Expr) -> crate::Result<()> {
        self.func.emit(&Instruction::Block(wasm_encoder::BlockType::Empty));
        let exit = self.func.enter_block();
        self.func.emit(&Instruction::Loop(wasm_encoder::BlockType::Empty));
        let loop_start = self.func.enter_block();

        self.func.push_loop_targets(exit, Some(loop_start));
        self.lower_block(body)?;
        self.expr_lowerer().lower_value(condition)?;
        let loop_depth = self.func.branch_depth_to(loop_start)?;
        self.func.emit(&Instruction::BrIf(loop_depth));
        self.func.pop_loop_targets(true);

        self.func.emit(&Instruction::End);
        self.func.exit_block();
        self.func.emit(&Instruction::End);
        self.func.exit_block();
        Ok(())
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&crate::source::Expr>,
        update: Option<&crate::source::Expr>,
        body: &[Stmt],
    ) -> crate::Result<()> {
        if let Some(init) = init {
            self.lower_stmt(init)?;
        }

        self.func.emit(&Instruction::Block(wasm_encoder::BlockType::Empty));
        let exit = self.func.enter_block();
        self.func.emit(&Instruction::Loop(wasm_encoder::BlockType::Empty));
        let loop_start = self.func.enter_block();

        self.func.push_loop_targets(exit, Some(loop_start));
        if let Some(condition) = condition {
            self.expr_lowerer().lower_value(condition)?;
            self.func.emit(&Instruction::I32Eqz);
            let exit_depth = self.func.branch_depth_to(exit)?;
            self.func.emit(&Instruction::BrIf(exit_depth));
        }
        self.lower_block(body)?;
        if let Some(update) = update {
            self.expr_lowerer().lower_value(update)?;
        }
        let loop_depth = self.func.branch_depth_to(loop_start)?;
        self.func.emit(&Instruction::Br(loop_depth));
        self.func.pop_loop_targets(true);

        self.func.emit(&Instruction::End);
        self.func.exit_block();
        self.func.emit(&Instruction::End);
        self.func.exit_block();
        Ok(())
    }

    /// `switch` lowers to one `block` per case plus one for `default`, nested innermost-first in
    /// case order, with `default` just inside the outer `break` target (§4.4). A dispatch sequence
    /// compares the discriminant against each case value and `br_if`s straight to the matching
    /// case's landing point; falling off the end of a case body (no `break`) runs directly into
    /// the next case's body because that is exactly what closing its wrapping block does — real
    /// fallthrough, not a chain of independently-gated `if`s that would re-test the discriminant
    /// per case and never share control flow between them. A `br_table` form over a typed table is
    /// left for a future pass (§9 does not flag this as needing redesign).
    fn lower_switch(
        &mut self,
        discriminant: &crate::source::Expr,
        cases: &[SwitchCase],
        default: &[Stmt],
    ) -> crate::Result<()> {
        self.func.emit(&Instruction::Block(wasm_encoder::BlockType::Empty));
        let exit = self.func.enter_block();
        self.func.push_loop_targets(exit, None);

        self.func.emit(&Instruction::Block(wasm_encoder::BlockType::Empty));
        let default_block = self.func.enter_block();

        let mut case_blocks = vec![None; cases.len()];
        for index in (0..cases.len()).rev() {
            self.func.emit(&Instruction::Block(wasm_encoder::BlockType::Empty));
            case_blocks[index] = Some(self.func.enter_block());
        }

        let temp = self.func.alloc_local(wasm_encoder::ValType::F64);
        self.expr_lowerer().lower_value(discriminant)?;
        self.func.emit(&Instruction::LocalSet(temp.0));

        for (case, block) in cases.iter().zip(&case_blocks) {
            let block = block.expect("every case was assigned a block above");
            self.func.emit(&Instruction::LocalGet(temp.0));
            self.expr_lowerer().lower_value(&case.value)?;
            self.func.emit(&Instruction::F64Eq);
            let depth = self.func.branch_depth_to(block)?;
            self.func.emit(&Instruction::BrIf(depth));
        }
        // No case value matched: jump straight to `default`, skipping every case body.
        let default_depth = self.func.branch_depth_to(default_block)?;
        self.func.emit(&Instruction::Br(default_depth));

        for case in cases {
            self.func.emit(&Instruction::End);
            self.func.exit_block();
            self.lower_block(&case.body)?;
        }

        self.func.emit(&Instruction::End);
        self.func.exit_block();
        self.lower_block(default)?;

        self.func.pop_loop_targets(false);
        self.func.emit(&Instruction::End);
        self.func.exit_block();
        Ok(())
    }

    /// Emits a zero-argument `super()` call for a constructor whose body doesn't start with an
    /// explicit one (§4.5 step 4). Raw instructions rather than a delegated `Expr::SuperCall`
    /// lowering, since the implicit call has no `Expr` node of its own to hand the Expression
    /// Lowerer.
    pub fn lower_implicit_super_call(&mut self, base: crate::types::SourceTypeId) -> crate::Result<()> {
        let base_name = self.ctx.class_mangled_name(base)?.to_string();
        let ctor = self.ctx.function_id(&crate::ident::constructor_name(&base_name))?;
        let this_local = match self.locals.get(&LocalId::THIS) {
            Some(Access::LocalSlot { local, .. }) => *local,
            _ => {
                return Err(crate::error::LowerError::invariant(
                    "implicit `super()` requires a bound `this`",
                ))
            }
        };

        self.func.emit(&Instruction::RefNull(wasm_encoder::HeapType::Abstract {
            shared: false,
            ty: wasm_encoder::AbstractHeapType::Any,
        }));
        self.func.emit(&Instruction::LocalGet(this_local.0));
        self.func.emit(&Instruction::Call(ctor.0));
        Ok(())
    }

    fn lower_variable(
        &mut self,
        local: LocalId,
        ty: &crate::types::SourceType,
        initializer: Option<&crate::source::Expr>,
        captured: bool,
    ) -> crate::Result<()> {
        let val_type = self.ctx.type_lower.wasm_value_type(ty)?;
        let slot = self.func.alloc_local(val_type);
        self.locals.insert(
            local,
            Access::LocalSlot {
                local: slot,
                ty: ty.clone(),
            },
        );

        if let Some(initializer) = initializer {
            self.expr_lowerer().lower_value(initializer)?;
            self.func.emit(&Instruction::LocalSet(slot.0));
        }

        // A captured local needs no extra bookkeeping here: every function's own capture list is
        // already flattened to the exact enclosing-scope locals it needs (§4.2), so the nested
        // function literal that closes over this one reads it directly out of `slot` by value, at
        // the point the closure is created (`ExprLowerer::lower_function_expr`). A later mutation
        // of `local` in the declaring scope is therefore not observed by closures created before
        // it, a deliberate capture-by-value simplification (see DESIGN.md).
        let _ = captured;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Expr;
    use crate::types::SourceType;

    #[test]
    fn factorial_style_recursion_lowers_without_error() {
        let allocations = crate::allocations::Allocations::new();
        let mut func = FunctionContext::new(&allocations, 1);
        let mut ctx = ModuleContext::new();
        let mut locals = HashMap::new();
        let mut closures = ClosureArena::new();
        let heap = ctx.type_lower.function_closure_struct().heap_type;
        let scope = closures.root(crate::function_context::LocalIndex(0), heap);

        let body = vec![Stmt::If {
            condition: Expr::Binary {
                op: crate::source::BinOp::Le,
                left: Box::new(Expr::Identifier {
                    local: LocalId(1),
                    ty: SourceType::Number,
                }),
                right: Box::new(Expr::NumberLiteral(1.0)),
            },
            then_branch: vec![Stmt::Return(Some(Expr::NumberLiteral(1.0)))],
            else_branch: vec![Stmt::Return(Some(Expr::NumberLiteral(2.0)))],
        }];

        locals.insert(
            LocalId(1),
            Access::LocalSlot {
                local: crate::function_context::LocalIndex(0),
                ty: SourceType::Number,
            },
        );

        let mut lowerer = StmtLowerer {
            ctx: &mut ctx,
            func: &mut func,
            locals: &mut locals,
            closures: &closures,
            scope,
            owner_class: None,
        };
        assert!(lowerer.lower_block(&body).is_ok());
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let allocations = crate::allocations::Allocations::new();
        let mut func = FunctionContext::new(&allocations, 0);
        let mut ctx = ModuleContext::new();
        let mut locals = HashMap::new();
        let mut closures = ClosureArena::new();
        let heap = ctx.type_lower.function_closure_struct().heap_type;
        let scope = closures.root(crate::function_context::LocalIndex(0), heap);

        let mut lowerer = StmtLowerer {
            ctx: &mut ctx,
            func: &mut func,
            locals: &mut locals,
            closures: &closures,
            scope,
            owner_class: None,
        };
        assert!(lowerer.lower_stmt(&Stmt::Break).is_err());
    }
}

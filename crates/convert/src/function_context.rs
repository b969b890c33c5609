//! Function Context (§2): per-function scratch used while lowering one function body — the local
//! index allocator, return-slot registration, and the nested-block depth bookkeeping `break`/
//! `continue`/`switch` need.
//!
//! Generalizes a `Builder`-style construct that elsewhere exists to manage a *stack-machine*
//! operand stack, because that input (WebAssembly bytecode) is itself a stack machine. This
//! design's input is a resolved expression tree, so expressions are lowered by direct recursive
//! descent straight into encoded instruction bytes — there is no operand stack to
//! manage. What does carry over is the rest of `Builder`'s job: a pooled, reusable buffer
//! (`body`), a local-index allocator, and `finish()` handing back a complete definition.

use wasm_encoder::{Encode, Instruction, ValType};

/// Index of a local variable (parameters occupy the lowest indices, per §4.1
/// `function-param-types`: context first, then `this` for methods, then the source parameters).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct LocalIndex(pub u32);

/// Opaque label identifying a `block`/`loop` nesting level, returned by [`FunctionContext::enter_block`]
/// and consumed by [`FunctionContext::branch_depth_to`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockId(u32);

/// Per-function scratch built fresh for each function the Module Driver lowers (§4.5 step 1).
pub struct FunctionContext {
    body: Vec<u8>,
    param_count: u32,
    extra_locals: Vec<ValType>,
    nesting_depth: u32,
    return_slot: Option<LocalIndex>,
    break_targets: Vec<BlockId>,
    continue_targets: Vec<BlockId>,
}

impl FunctionContext {
    pub fn new(allocations: &crate::allocations::Allocations, param_count: u32) -> Self {
        Self {
            body: allocations.take_body_buffer(),
            param_count,
            extra_locals: Vec::new(),
            nesting_depth: 0,
            return_slot: None,
            break_targets: Vec::new(),
            continue_targets: Vec::new(),
        }
    }

    /// Allocates a fresh local of type `ty`, returning its index. Parameters are assumed to
    /// already occupy indices `0..param_count`; this always returns the next unused index.
    pub fn alloc_local(&mut self, ty: ValType) -> LocalIndex {
        let index = self.param_count + self.extra_locals.len() as u32;
        self.extra_locals.push(ty);
        LocalIndex(index)
    }

    /// Registers the function's return slot (§4.5 step 5): the local that `return` statements
    /// store into before branching to the function-level `statements` block. For constructors,
    /// callers pass the `this` local instead of allocating a fresh one.
    pub fn set_return_slot(&mut self, local: LocalIndex) {
        self.return_slot = Some(local);
    }

    pub fn return_slot(&self) -> Option<LocalIndex> {
        self.return_slot
    }

    /// Emits one instruction, encoding it directly into the body buffer.
    pub fn emit(&mut self, instruction: &Instruction) {
        instruction.encode(&mut self.body);
    }

    /// Opens a new `block`/`loop`/`if` nesting level, returning its [`BlockId`] for later branch-
    /// depth computation. Callers are responsible for emitting the corresponding
    /// `Instruction::Block`/`Loop`/`If` themselves; this only tracks depth bookkeeping (§4.4).
    pub fn enter_block(&mut self) -> BlockId {
        let id = BlockId(self.nesting_depth);
        self.nesting_depth += 1;
        id
    }

    /// Closes the innermost nesting level. Callers emit the matching `Instruction::End`
    /// themselves.
    pub fn exit_block(&mut self) {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
    }

    /// The relative branch depth (for `br`/`br_if`) from the current position to `target`.
    pub fn branch_depth_to(&self, target: BlockId) -> crate::Result<u32> {
        self.nesting_depth
            .checked_sub(target.0 + 1)
            .ok_or_else(|| crate::error::LowerError::invariant("branch target outside current nesting"))
    }

    /// Registers `target` as the `break`/`continue` destination for the statement currently being
    /// lowered (a loop or `switch`), per §4.4 "Break and continue target stored block labels."
    pub fn push_loop_targets(&mut self, break_target: BlockId, continue_target: Option<BlockId>) {
        self.break_targets.push(break_target);
        if let Some(continue_target) = continue_target {
            self.continue_targets.push(continue_target);
        }
    }

    pub fn pop_loop_targets(&mut self, had_continue: bool) {
        self.break_targets.pop();
        if had_continue {
            self.continue_targets.pop();
        }
    }

    pub fn current_break_target(&self) -> crate::Result<BlockId> {
        self.break_targets
            .last()
            .copied()
            .ok_or_else(|| crate::error::LowerError::invariant("`break` outside of a loop or switch"))
    }

    pub fn current_continue_target(&self) -> crate::Result<BlockId> {
        self.continue_targets
            .last()
            .copied()
            .ok_or_else(|| crate::error::LowerError::invariant("`continue` outside of a loop"))
    }

    /// Finishes lowering, returning the complete local-types list (beyond the parameters) and the
    /// raw encoded instruction bytes, ready to be wrapped in a [`wasm_encoder::Function`].
    pub fn finish(self) -> FunctionBody {
        debug_assert_eq!(self.nesting_depth, 0, "unbalanced block nesting");
        FunctionBody {
            extra_locals: self.extra_locals,
            body: self.body,
        }
    }
}

/// The result of [`FunctionContext::finish`]: enough to build a [`wasm_encoder::Function`] once
/// the caller groups `extra_locals` into the compressed `(count, type)` runs the format expects.
pub struct FunctionBody {
    pub extra_locals: Vec<ValType>,
    pub body: Vec<u8>,
}

impl FunctionBody {
    /// Builds the final [`wasm_encoder::Function`], compressing consecutive identical local types
    /// into single `(count, type)` entries the way `wasm-encoder` expects.
    pub fn into_function(self) -> wasm_encoder::Function {
        let mut runs: Vec<(u32, ValType)> = Vec::new();
        for ty in self.extra_locals {
            match runs.last_mut() {
                Some((count, last_ty)) if *last_ty == ty => *count += 1,
                _ => runs.push((1, ty)),
            }
        }

        let mut function = wasm_encoder::Function::new(runs);
        function.raw(self.body.iter().copied());
        function
    }
}

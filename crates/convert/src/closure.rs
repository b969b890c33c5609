//! The Closure Context Builder (§4.2).
//!
//! Per the redesign flag in §9 ("Recursive closure-chain walks expressed as parent-pointer
//! traversal"), scopes are not linked by raw pointers or `Rc`-cycles back to the scope tree.
//! Instead every scope that is either a function or a block gets a [`ContextFrameId`] into one
//! flat [`ClosureArena`], and identifier resolution becomes index chasing through a `parent`
//! field rather than following a live reference. This also sidesteps any cyclic reference between
//! a context and the scope that declared it.

use crate::types::SourceType;
use wasm_encoder::HeapType;

/// An index into a [`ClosureArena`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ContextFrameId(u32);

/// One scope's closure-context bookkeeping.
struct ContextFrame {
    parent: Option<ContextFrameId>,
    /// `None` when this scope captured nothing and simply aliases its parent's context value
    /// (§4.2 "If the scope has no free variables...").
    layout: Option<crate::type_lower::ClosureContextLayout>,
    /// The local variable slot holding this scope's own context reference (shared with the
    /// parent's local when `layout` is `None`).
    local: crate::function_context::LocalIndex,
    heap_type: HeapType,
}

/// The arena of context frames for one function being lowered (§9, §4.2).
pub struct ClosureArena {
    frames: Vec<ContextFrame>,
}

impl ClosureArena {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Registers the function's own top-level scope for a function with no captures of its own:
    /// `heap_type` is never actually read through, since `resolve` can never find anything in a
    /// frame with no layout.
    pub fn root(
        &mut self,
        context_param: crate::function_context::LocalIndex,
        heap_type: HeapType,
    ) -> ContextFrameId {
        let id = ContextFrameId(self.frames.len() as u32);
        self.frames.push(ContextFrame {
            parent: None,
            layout: None,
            local: context_param,
            heap_type,
        });
        id
    }

    /// Registers the function's own top-level scope for a function that itself captures
    /// variables from its enclosing scope (§4.2): `context_param` must already have been narrowed
    /// (`ref.cast`) from the generic `anyref` calling convention down to `layout`'s own struct
    /// type, so its captures resolve at zero hops, directly from this frame.
    pub fn root_with_layout(
        &mut self,
        context_param: crate::function_context::LocalIndex,
        layout: crate::type_lower::ClosureContextLayout,
    ) -> ContextFrameId {
        let heap_type = layout.struct_type.heap_type;
        let id = ContextFrameId(self.frames.len() as u32);
        self.frames.push(ContextFrame {
            parent: None,
            layout: Some(layout),
            local: context_param,
            heap_type,
        });
        id
    }

    /// Resolves a captured variable read/write, walking the parent chain via index chasing (§9).
    /// Each hop reads field 0 (always the parent pointer, stored as bare `anyref`) and must
    /// `ref.cast` the result down to the next frame's own struct type before it can be read
    /// itself, so this returns the wasm struct type index to cast/`struct.get` against at every
    /// hop along the way, plus the declaring frame's own struct type, field index, and source
    /// type for the final read.
    ///
    /// Fails fatally (§4.2 "Failure") if no frame on the chain declares `name`.
    pub fn resolve(&self, scope: ContextFrameId, name: &str) -> crate::Result<ClosureResolution> {
        let mut current = Some(scope);
        let mut hop_type_indices = Vec::new();

        while let Some(frame_id) = current {
            let frame = &self.frames[frame_id.0 as usize];
            if let Some(layout) = &frame.layout {
                if let Some((field_index, ty)) = layout.capture_slots.get(name) {
                    return Ok(ClosureResolution {
                        hop_type_indices,
                        struct_type_index: concrete_type_index(frame.heap_type)?,
                        field_index: *field_index,
                        ty: ty.clone(),
                    });
                }
            }

            hop_type_indices.push(concrete_type_index(frame.heap_type)?);
            current = frame.parent;
        }

        Err(anyhow::Error::from(
            crate::error::LowerError::ClosureVariableUnresolved {
                name: name.to_string(),
            },
        ))
    }

    /// The local holding `scope`'s own context reference.
    pub fn local_of(&self, scope: ContextFrameId) -> crate::function_context::LocalIndex {
        self.frames[scope.0 as usize].local
    }
}

impl Default for ClosureArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the wasm type index backing a closure-context frame's own struct type. Every frame
/// registered by [`ClosureArena::root`]/[`ClosureArena::root_with_layout`] is always a concrete GC
/// struct type, never one of the abstract heap types.
fn concrete_type_index(heap_type: HeapType) -> crate::Result<u32> {
    match heap_type {
        HeapType::Concrete(index) => Ok(index),
        _ => Err(crate::error::LowerError::invariant(
            "closure context frame has no concrete struct type",
        )),
    }
}

/// The result of walking the closure-context parent chain to find a captured variable's
/// declaring frame (§4.2, §9).
#[derive(Clone, Debug)]
pub struct ClosureResolution {
    /// Wasm struct type index to `ref.cast`/`struct.get $ty 0` against at each hop, in order from
    /// the reading scope upward to (but not including) the declaring frame.
    pub hop_type_indices: Vec<u32>,
    /// Wasm struct type index of the declaring frame's own struct, for the final field read.
    pub struct_type_index: u32,
    /// Field index within the declaring frame's struct (1-based; field 0 is the parent).
    pub field_index: u32,
    /// The captured variable's own source type.
    pub ty: SourceType,
}

/// The closure-context slot name a given local is registered/looked up under. There is no
/// separate debug-name table in the resolved tree (§4.2); a local's own stable id is a perfectly
/// good key as long as both the registering side (building a scope's capture list) and the
/// resolving side (`ExprLowerer::resolve_local`) derive it the same way.
pub fn capture_key(local: crate::source::LocalId) -> String {
    format!("local#{}", local.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_context::LocalIndex;
    use crate::type_lower::TypeLowerer;

    #[test]
    fn own_captures_resolve_at_the_root_frame() {
        let mut type_lower = TypeLowerer::new();
        let mut arena = ClosureArena::new();
        let layout = type_lower
            .closure_context_layout(&[("z".into(), SourceType::Number)])
            .unwrap();
        let root = arena.root_with_layout(LocalIndex(0), layout);

        let resolution = arena.resolve(root, "z").unwrap();
        assert_eq!(resolution.field_index, 1);
        assert!(resolution.hop_type_indices.is_empty());
    }

    #[test]
    fn nested_frame_walks_one_hop_to_the_parent() {
        let mut type_lower = TypeLowerer::new();
        let mut arena = ClosureArena::new();
        let parent_layout = type_lower
            .closure_context_layout(&[("z".into(), SourceType::Number)])
            .unwrap();
        let parent_type_index = match parent_layout.struct_type.heap_type {
            HeapType::Concrete(index) => index,
            _ => panic!("expected a concrete struct type"),
        };
        let root = arena.root_with_layout(LocalIndex(0), parent_layout);

        let child_layout = type_lower.closure_context_layout(&[]).unwrap();
        let child_heap = child_layout.struct_type.heap_type;
        let child = ContextFrameId(arena.frames.len() as u32);
        arena.frames.push(ContextFrame {
            parent: Some(root),
            layout: Some(child_layout),
            local: LocalIndex(1),
            heap_type: child_heap,
        });

        let resolution = arena.resolve(child, "z").unwrap();
        assert_eq!(resolution.hop_type_indices, vec![parent_type_index]);
        assert_eq!(resolution.field_index, 1);
    }

    #[test]
    fn unresolved_capture_is_fatal() {
        let mut type_lower = TypeLowerer::new();
        let mut arena = ClosureArena::new();
        let root_heap = type_lower.function_closure_struct().heap_type;
        let root = arena.root(LocalIndex(0), root_heap);
        assert!(arena.resolve(root, "nope").is_err());
    }
}

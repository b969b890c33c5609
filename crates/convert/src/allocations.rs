//! Reusable buffer pools shared across the functions in one compilation (§5 "Allocations pool").
//!
//! A small bundle of [`crate::pool::Pool`]s that per-function lowering borrows from and returns
//! to, so that lowering many functions (serial or, with the `rayon` feature, in parallel) does not
//! repeatedly allocate and drop the same shapes of scratch buffer.

use crate::pool::Pool;

/// Buffer pools threaded through every function's lowering (§4.5, §5).
#[derive(Default)]
pub struct Allocations {
    body_buffers: Pool<Vec<u8>>,
}

impl Allocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a cleared instruction-body buffer, reusing a previously returned one if the pool
    /// has one available.
    pub fn take_body_buffer(&self) -> Vec<u8> {
        let mut buffer = self.body_buffers.pop().unwrap_or_default();
        buffer.clear();
        buffer
    }

    /// Returns a buffer to the pool once the caller is done with it (normally via
    /// [`crate::function_context::FunctionBody`] being consumed by the Module Driver).
    pub fn recycle_body_buffer(&self, buffer: Vec<u8>) {
        self.body_buffers.push(buffer);
    }
}

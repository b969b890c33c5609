//! The Data Segment Arena: pooled allocator for string literals and itables in linear memory
//! (§2, §3 "Itable layout").
//!
//! One arena is owned by the [`crate::context::ModuleContext`] for the lifetime of a single
//! compilation and is destroyed with it (§5) — there is no cross-compilation persistence, the same
//! scoping a per-conversion cache gets when it lives only as long as one `Convert` call.

use indexmap::IndexMap;

/// The first 1024 bytes of linear memory are reserved and unused (§6), so every real allocation
/// starts past this point.
pub const RESERVED_PREFIX: u32 = 1024;

/// The kind tag written into an itable entry (§3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ItableEntryKind {
    Field = 0,
    Method = 1,
    Getter = 2,
    Setter = 3,
}

/// One `(name-offset, kind, slot-index)` triple to be written into a class's itable.
#[derive(Clone, Debug)]
pub struct ItableEntry {
    pub name: String,
    pub kind: ItableEntryKind,
    pub slot_index: u32,
}

/// Pooled allocator for the module's linear-memory data segment.
#[derive(Debug)]
pub struct DataSegmentArena {
    bytes: Vec<u8>,
    /// String literal content → offset. Every string literal with `dedup=true` (all of them, in
    /// this design — see §8 "Every string literal... produces a single data-segment offset")
    /// shares one offset across every call site that references it.
    string_offsets: IndexMap<String, u32>,
    /// Class type-id → itable offset, assigned on first reference (§5).
    itable_offsets: IndexMap<u32, u32>,
}

impl DataSegmentArena {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; RESERVED_PREFIX as usize],
            string_offsets: IndexMap::new(),
            itable_offsets: IndexMap::new(),
        }
    }

    fn align_to(&mut self, align: usize) {
        let rem = self.bytes.len() % align;
        if rem != 0 {
            self.bytes.resize(self.bytes.len() + (align - rem), 0);
        }
    }

    /// Interns a string literal's UTF-8 bytes, returning its (deduplicated) offset into linear
    /// memory. The host ABI's `dyntype_new_string` and raw name-pointer arguments (§6) both use
    /// this offset; the encoding is a little-endian `u32` length prefix followed by the raw UTF-8
    /// bytes, which is what the host runtime ABI's string constructors expect.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(offset) = self.string_offsets.get(s) {
            return *offset;
        }

        self.align_to(4);
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(s.as_bytes());
        self.string_offsets.insert(s.to_string(), offset);
        offset
    }

    /// Returns this class's itable offset, building and writing the itable layout on first
    /// reference (§5 "itable offsets are assigned on first reference").
    ///
    /// `entries` must already reflect the Open Question 3 decision (DESIGN.md): an accessor with
    /// both a getter and a setter contributes two consecutive entries sharing the same name.
    pub fn itable_offset(
        &mut self,
        type_id: u32,
        entries: impl FnOnce() -> Vec<ItableEntry>,
    ) -> u32 {
        if let Some(offset) = self.itable_offsets.get(&type_id) {
            return *offset;
        }

        let entries = entries();
        let name_offsets: Vec<u32> = entries
            .iter()
            .map(|e| self.intern_string(&e.name))
            .collect();

        self.align_to(4);
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&type_id.to_le_bytes());
        self.bytes
            .extend_from_slice(&(entries.len() as u32).to_le_bytes());

        for (entry, name_offset) in entries.iter().zip(name_offsets) {
            self.bytes.extend_from_slice(&name_offset.to_le_bytes());
            self.bytes
                .extend_from_slice(&(entry.kind as u32).to_le_bytes());
            self.bytes.extend_from_slice(&entry.slot_index.to_le_bytes());
        }

        self.itable_offsets.insert(type_id, offset);
        offset
    }

    /// Finishes the arena, returning the complete linear-memory contents to be written as the
    /// module's data segment, starting at offset 0 (the reserved prefix is included).
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    /// Borrows the arena's current contents without consuming it, for callers that only hold a
    /// shared reference to the owning [`crate::context::ModuleContext`] at assembly time.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for DataSegmentArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literals_are_deduplicated() {
        let mut arena = DataSegmentArena::new();
        let a = arena.intern_string("hello");
        let b = arena.intern_string("hello");
        let c = arena.intern_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn reserved_prefix_is_never_allocated_into() {
        let mut arena = DataSegmentArena::new();
        let offset = arena.intern_string("x");
        assert!(offset >= RESERVED_PREFIX);
    }

    #[test]
    fn itable_offset_is_assigned_once_per_type() {
        let mut arena = DataSegmentArena::new();
        let mut calls = 0;
        let offset_a = arena.itable_offset(1, || {
            calls += 1;
            vec![ItableEntry {
                name: "m".into(),
                kind: ItableEntryKind::Method,
                slot_index: 0,
            }]
        });
        let offset_b = arena.itable_offset(1, || {
            calls += 1;
            vec![]
        });
        assert_eq!(offset_a, offset_b);
        assert_eq!(calls, 1);
    }
}

//! Construction of mangled linkage names for functions, globals, and types.
//!
//! Every class, interface, and function in the source program gets a unique mangled name used
//! both as the debug name embedded in the WebAssembly [`name` custom section] and as the key that
//! [`ModuleContext`] uses to detect accidental re-registration of the same declaration.
//!
//! [`name` custom section]: https://webassembly.github.io/spec/core/appendix/custom.html#name-section
//! [`ModuleContext`]: crate::context::ModuleContext

mod mangled_ident;

pub use mangled_ident::MangledIdent;

/// Builds the mangled name for a class or interface member, of the form `Owner|member`.
///
/// A pipe is used as the separator (rather than `.`) so that it survives [`MangledIdent`]
/// escaping as a single two-character run, keeping names of methods on deeply nested classes
/// legible in module dumps.
pub fn member_name(owner: &str, member: &str) -> String {
    format!("{owner}|{member}")
}

/// Builds the mangled name for a class constructor.
pub fn constructor_name(owner: &str) -> String {
    member_name(owner, "constructor")
}

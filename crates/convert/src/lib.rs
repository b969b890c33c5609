//! Lowers a resolved, TypeScript-like semantic tree into a [WebAssembly] module targeting the
//! [garbage collection], [function references], and [typed tables] proposals.
//!
//! Building the semantic tree itself — parsing, scope resolution, type checking — is out of scope
//! (§1 Non-goals): callers hand a fully-resolved [`source::Program`] to [`module_driver::lower`]
//! and get back a validated `.wasm` binary.
//!
//! [WebAssembly]: https://webassembly.github.io/spec/core/
//! [garbage collection]: https://github.com/WebAssembly/gc
//! [function references]: https://github.com/WebAssembly/function-references
//! [typed tables]: https://github.com/WebAssembly/typed-function-references

#![cfg_attr(doc_cfg, feature(doc_auto_cfg))]
#![deny(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_debug_implementations)]
#![deny(clippy::exhaustive_enums)]

mod abi;
mod access;
mod allocations;
mod closure;
mod context;
mod data_segment;
mod error;
mod expr_lower;
mod function_context;
pub mod ident;
mod module_driver;
mod pool;
pub mod source;
mod stmt_lower;
mod type_lower;
pub mod types;

#[doc(no_inline)]
pub use anyhow::{Error, Result};

pub use abi::import_count as abi_import_count;
pub use error::LowerError;
pub use module_driver::{lower, LowerOptions};

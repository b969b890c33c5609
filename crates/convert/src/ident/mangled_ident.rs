/// A name suitable for use in the WebAssembly [`name` custom section], constructed from an
/// arbitrary, possibly non-ASCII source identifier.
///
/// Mangling guarantees that two distinct source paths never collide on the same mangled string,
/// which matters because mangled names double as the dedup key for [`ModuleContext`]'s function
/// and global name tables.
///
/// [`name` custom section]: https://webassembly.github.io/spec/core/appendix/custom.html#name-section
/// [`ModuleContext`]: crate::context::ModuleContext
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct MangledIdent<'a>(pub &'a str);

impl<'a> From<&'a str> for MangledIdent<'a> {
    fn from(ident: &'a str) -> Self {
        Self(ident)
    }
}

impl MangledIdent<'_> {
    /// Indicates the start of every mangled identifier, so mangled names can never collide with
    /// an unmangled host ABI import name (see [`crate::abi`]).
    pub const START: &'static str = "_ts2wasmgc_";
}

impl std::fmt::Display for MangledIdent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use std::fmt::Write;

        f.write_str(Self::START)?;

        for c in self.0.chars() {
            match c {
                _ if c.is_ascii_alphanumeric() => f.write_char(c)?,
                '_' => f.write_str("__")?,
                '.' => f.write_str("_o")?,
                '|' => f.write_str("_p")?,
                '-' => f.write_str("_L")?,
                _ => {
                    let n = c as u32;
                    let width = if n > 0xFFFF {
                        6
                    } else if n > 0xFF {
                        4
                    } else {
                        2
                    };

                    write!(f, "_x{n:0width$X}")?
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for MangledIdent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::MangledIdent;

    #[test]
    fn distinct_paths_never_collide() {
        let a = MangledIdent("Foo.bar").to_string();
        let b = MangledIdent("Foo_obar").to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn constructor_mangling_matches_method_mangling() {
        // "C|constructor" (a class constructor) must mangle distinctly from a method literally
        // named "constructor" accessed through a field-style separator.
        let ctor = MangledIdent("C|constructor").to_string();
        let field = MangledIdent("C.constructor").to_string();
        assert_ne!(ctor, field);
    }
}

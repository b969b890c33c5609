//! The shape of the resolved semantic tree this crate lowers.
//!
//! Building this tree (parsing, scope resolution, type checking) is an explicit non-goal (§1):
//! this module only fixes the node shapes the [`ModuleDriver`] walks. A front end hands the driver
//! a fully-resolved [`Program`]; every name has already been bound, every expression already has
//! a [`SourceType`], and operator tags have already been translated into the [`BinOp`]/[`UnOp`]
//! enumerations below rather than left as the front end's own syntactic tags (§9, "Reflection over
//! operator kinds by integer codes").
//!
//! [`ModuleDriver`]: crate::module_driver::ModuleDriver

use crate::types::{FunctionType, SourceType, SourceTypeId};
use std::sync::Arc;

/// A whole compilation unit: every declared class, interface, function, and global the driver
/// must walk (§4.5).
#[derive(Debug, Default)]
pub struct Program {
    pub classes: Vec<crate::types::ClassDef>,
    pub interfaces: Vec<crate::types::InterfaceDef>,
    pub functions: Vec<FunctionDecl>,
    pub globals: Vec<GlobalDecl>,
    /// Imported modules, in the order their `import-declaration` statements must run (§4.4).
    pub imports: Vec<ImportDecl>,
    /// `true` for the entry module, which gets a `start` function (§4.5).
    pub is_entry: bool,
}

/// A single module-level function declaration.
#[derive(Debug)]
pub struct FunctionDecl {
    pub ty: Arc<FunctionType>,
    pub mangled_name: String,
    pub exported_name: Option<String>,
    /// `Some` for instance/static methods, naming the owning class or interface.
    pub owner: Option<SourceTypeId>,
    pub params: Vec<LocalId>,
    pub body: Vec<Stmt>,
    /// `true` for an ambient (`declare`) function: the driver emits a thin import-forwarding
    /// wrapper instead of lowering a body (§4.5).
    pub is_declare: bool,
    /// Variables captured from an enclosing scope by this function itself (§4.2), each paired
    /// with its source type since closure-context fields must be lowered to a concrete wasm value
    /// type before this function's own body can be lowered at all.
    pub captures: Vec<(LocalId, SourceType)>,
}

/// A module-level variable.
#[derive(Debug)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: SourceType,
    /// `None` for a default-valued global; `Some` appends the initializer to global-init (§4.4).
    pub initializer: Option<Expr>,
}

/// A cross-module `import` statement (§4.4).
#[derive(Debug)]
pub struct ImportDecl {
    pub module_init_function: String,
}

/// Stable identity for a local variable or parameter within one function's scope tree.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LocalId(pub u32);

impl LocalId {
    /// Sentinel identity for `this` inside an instance-scope method or constructor body. There is
    /// no `Expr::This` node in this tree (every receiver-implicit member access still goes through
    /// `Expr::Identifier`, same as any other local); the front end threads `this` through under
    /// this reserved id instead of a dedicated variant, since it behaves exactly like any other
    /// captured-or-plain local from the Statement/Expression Lowerer's point of view.
    pub const THIS: LocalId = LocalId(u32::MAX);
}

/// A statement in the resolved tree (§4.4).
#[derive(Debug)]
#[non_exhaustive]
pub enum Stmt {
    Expr(Expr),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    Block(Vec<Stmt>),
    Return(Option<Expr>),
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        body: Vec<Stmt>,
        condition: Expr,
    },
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        update: Option<Expr>,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Switch {
        discriminant: Expr,
        cases: Vec<SwitchCase>,
        default: Vec<Stmt>,
    },
    Variable {
        local: LocalId,
        ty: SourceType,
        initializer: Option<Expr>,
        /// `true` when this declaration is captured by some nested closure, so writes and reads
        /// must go through the enclosing context struct rather than a local slot (§4.4, §4.2).
        captured: bool,
    },
    ImportDeclaration(ImportDecl),
}

/// One `case` clause of a `switch` statement.
#[derive(Debug)]
pub struct SwitchCase {
    pub value: Expr,
    pub body: Vec<Stmt>,
}

/// An expression in the resolved tree (§4.3). Every variant already carries the [`SourceType`]
/// its evaluation produces, established at resolution time by the (external) type checker.
#[derive(Debug)]
#[non_exhaustive]
pub enum Expr {
    NumberLiteral(f64),
    BooleanLiteral(bool),
    StringLiteral(Arc<str>),
    NullLiteral,
    UndefinedLiteral,
    Identifier {
        local: LocalId,
        ty: SourceType,
    },
    GlobalRef {
        name: String,
        ty: SourceType,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    PropertyAccess {
        receiver: Box<Expr>,
        name: String,
    },
    ElementAccess {
        receiver: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    New {
        class: SourceTypeId,
        args: Vec<Expr>,
    },
    NewArray(NewArrayKind),
    SuperCall {
        args: Vec<Expr>,
    },
    FunctionExpr(Arc<FunctionType>, u32),
    Cast {
        value: Box<Expr>,
        target: SourceType,
    },
    /// Boxes a statically typed value up to `any`; inserted by the front end or by this crate's
    /// own argument-shaping logic (§4.3 "Argument shaping", "Boxing to `any`"). `source_ty` is the
    /// value's own static type, since boxing dispatches on it (number/boolean go through a host
    /// constructor, everything else is already reference-shaped).
    Box {
        value: Box<Expr>,
        source_ty: SourceType,
    },
    /// Unboxes an `any` value down to a static type (§4.3 "Unboxing from `any`").
    Unbox {
        value: Box<Expr>,
        target: SourceType,
    },
}

/// The three forms of `new Array(...)`/`new T[]` (§4.3 "New expression").
#[derive(Debug)]
#[non_exhaustive]
pub enum NewArrayKind {
    /// `new T[n]`: default-filled, explicit length.
    DefaultFilled { length: Box<Expr>, element: SourceType },
    /// `new Array(n)`: sized, default-filled.
    Sized { length: Box<Expr>, element: SourceType },
    /// `new Array(a, b, ...)`: initialized from an explicit element list.
    FromElements { elements: Vec<Expr>, element: SourceType },
}

/// The full binary operator enumeration (§9, replacing syntactic operator tags).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    ShrUnsigned,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogicalAnd,
    LogicalOr,
}

/// The full unary operator enumeration (§9).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
    Truthiness,
}

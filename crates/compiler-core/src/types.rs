//! The type model.
//!
//! Types are a small closed tagged union. Two *thunk* cases stand in for
//! names that cannot be resolved while parsing is still in flight: a
//! struct named before its definition, and an array whose length is an
//! unevaluated expression. [`Type::dethunkify`] resolves both once the
//! referenced definitions exist.

use std::fmt;
use std::sync::Arc;

use diagnostics::{CompilerError, Result, SourceLoc};

use crate::ast::Expr;
use crate::globals::{Context, GlobalKind};
use crate::interface::Evaluator;
use crate::pool::{GlobalId, GroupId, StructId};

/// A resolved or thunked type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// The unit type.
    Void,
    /// Boolean.
    Bool,
    /// Unsigned byte.
    U8,
    /// Signed byte.
    S8,
    /// Unsigned word.
    U16,
    /// Signed word.
    S16,
    /// Unbounded compile-time integer.
    Int,
    /// Unbounded compile-time real.
    Real,
    /// Typed element array: `len` elements of `elem`.
    Tea {
        /// Element type.
        elem: Box<Type>,
        /// Element count.
        len: u16,
    },
    /// A TEA whose length is an unevaluated expression.
    TeaThunk {
        /// Element type.
        elem: Box<Type>,
        /// Length expression, evaluated during dethunkify.
        len: Box<Expr>,
    },
    /// Packed address array: `len` raw bytes described by locators.
    Paa {
        /// Byte count; zero means "sized by the initializer".
        len: u16,
    },
    /// A resolved struct.
    Struct(StructId),
    /// A struct named before its definition resolved.
    StructThunk(GlobalId),
    /// A pointer carrying the groups it may dereference into.
    Ptr {
        /// Group tail: every group the pointee may live in.
        groups: Arc<[GroupId]>,
        /// True for banked (far) pointers.
        banked: bool,
    },
    /// A function signature.
    Fn(Arc<FnSig>),
}

/// Parameter and return types of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnSig {
    /// Parameter types, in declaration order.
    pub params: Vec<Type>,
    /// Return type.
    pub return_type: Type,
}

impl Type {
    /// A pointer over the given group tail.
    #[must_use]
    pub fn ptr(groups: impl Into<Arc<[GroupId]>>, banked: bool) -> Self {
        Self::Ptr {
            groups: groups.into(),
            banked,
        }
    }

    /// A TEA of `len` elements.
    #[must_use]
    pub fn tea(elem: Self, len: u16) -> Self {
        Self::Tea {
            elem: Box::new(elem),
            len,
        }
    }

    /// True for types only representable at compile time.
    #[must_use]
    pub fn is_ct(&self) -> bool {
        match self {
            Self::Int | Self::Real => true,
            Self::Tea { elem, .. } | Self::TeaThunk { elem, .. } => elem.is_ct(),
            _ => false,
        }
    }

    /// True when the type still contains a thunk.
    #[must_use]
    pub fn is_thunk(&self) -> bool {
        match self {
            Self::TeaThunk { .. } | Self::StructThunk(_) => true,
            Self::Tea { elem, .. } => elem.is_thunk(),
            _ => false,
        }
    }

    /// True for pointer types.
    #[must_use]
    pub const fn is_ptr(&self) -> bool {
        matches!(self, Self::Ptr { .. })
    }

    /// The group tail of a pointer; empty for every other type.
    #[must_use]
    pub fn group_tail(&self) -> &[GroupId] {
        match self {
            Self::Ptr { groups, .. } => groups,
            _ => &[],
        }
    }

    /// Byte size of a value of this type.
    ///
    /// # Panics
    ///
    /// Panics on thunks; callers dethunkify first.
    #[must_use]
    pub fn size_of(&self, ctx: &Context) -> usize {
        match self {
            Self::Void => 0,
            Self::Bool | Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 | Self::Ptr { .. } => 2,
            Self::Int | Self::Real => 0,
            Self::Tea { elem, len } => elem.size_of(ctx) * usize::from(*len),
            Self::Paa { len } => usize::from(*len),
            Self::Struct(id) => {
                let s = ctx.structs().get(*id);
                s.field_types()
                    .iter()
                    .map(|field_type| field_type.size_of(ctx))
                    .sum()
            }
            Self::TeaThunk { .. } | Self::StructThunk(_) => {
                panic!("size_of on thunked type {self}")
            }
            Self::Fn(_) => 2,
        }
    }

    /// Number of gmembers a value of this type occupies.
    ///
    /// Primitives count one; structs recurse; a TEA multiplies by its
    /// element count; a PAA is a single member regardless of length.
    ///
    /// # Panics
    ///
    /// Panics on thunks; callers dethunkify first.
    #[must_use]
    pub fn num_members(&self, ctx: &Context) -> u32 {
        match self {
            Self::Void => 0,
            Self::Tea { elem, len } => u32::from(*len) * elem.num_members(ctx),
            Self::Struct(id) => ctx.structs().get(*id).num_members(),
            Self::TeaThunk { .. } | Self::StructThunk(_) => {
                panic!("num_members on thunked type {self}")
            }
            _ => 1,
        }
    }

    /// Resolves thunks against the definitions interned so far.
    ///
    /// With `full` false (the count-members phase) struct thunks resolve
    /// and TEA length expressions are evaluated; with `full` true (the
    /// precheck phase) pointer and function component types are resolved
    /// recursively as well.
    ///
    /// # Errors
    ///
    /// Returns an error when a struct thunk names a non-struct global or
    /// a TEA length expression does not evaluate to an in-range integer.
    pub fn dethunkify(
        &self,
        ctx: &Context,
        eval: &dyn Evaluator,
        full: bool,
        loc: &SourceLoc,
    ) -> Result<Self> {
        match self {
            Self::StructThunk(global_id) => {
                let global = ctx.globals().get(*global_id);
                match global.kind() {
                    GlobalKind::Struct(id) => Ok(Self::Struct(id)),
                    _ => Err(CompilerError::at(
                        loc.clone(),
                        format!("{} is not a struct", global.name),
                    )),
                }
            }
            Self::TeaThunk { elem, len } => {
                let elem = elem.dethunkify(ctx, eval, full, loc)?;
                let (_, value) = eval.interpret_expr(ctx, &len.loc, len, &Self::Int)?;
                let length = value.as_int().ok_or_else(|| {
                    CompilerError::at(len.loc.clone(), "array length is not an integer")
                })?;
                let length = u16::try_from(length).map_err(|_| {
                    CompilerError::at(len.loc.clone(), format!("array length {length} out of range"))
                })?;
                Ok(Self::Tea {
                    elem: Box::new(elem),
                    len: length,
                })
            }
            Self::Tea { elem, len } => Ok(Self::Tea {
                elem: Box::new(elem.dethunkify(ctx, eval, full, loc)?),
                len: *len,
            }),
            Self::Fn(sig) if full => {
                let params = sig
                    .params
                    .iter()
                    .map(|param| param.dethunkify(ctx, eval, full, loc))
                    .collect::<Result<Vec<_>>>()?;
                let return_type = sig.return_type.dethunkify(ctx, eval, full, loc)?;
                Ok(Self::Fn(Arc::new(FnSig {
                    params,
                    return_type,
                })))
            }
            _ => Ok(self.clone()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::Bool => write!(f, "bool"),
            Self::U8 => write!(f, "u8"),
            Self::S8 => write!(f, "s8"),
            Self::U16 => write!(f, "u16"),
            Self::S16 => write!(f, "s16"),
            Self::Int => write!(f, "int"),
            Self::Real => write!(f, "real"),
            Self::Tea { elem, len } => write!(f, "{elem}[{len}]"),
            Self::TeaThunk { elem, .. } => write!(f, "{elem}[?]"),
            Self::Paa { len } => write!(f, "paa[{len}]"),
            Self::Struct(id) => write!(f, "struct{id}"),
            Self::StructThunk(id) => write!(f, "struct?{id}"),
            Self::Ptr { groups, banked } => {
                write!(f, "{}ptr(", if *banked { "banked " } else { "" })?;
                for (i, group) in groups.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{group}")?;
                }
                write!(f, ")")
            }
            Self::Fn(sig) => {
                write!(f, "fn(")?;
                for (i, param) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ") {}", sig.return_type)
            }
        }
    }
}

/// A declared type together with the location of its declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcType {
    /// The declared type.
    pub ty: Type,
    /// Where it was declared.
    pub loc: SourceLoc,
}

impl SrcType {
    /// Creates a source type.
    #[must_use]
    pub const fn new(ty: Type, loc: SourceLoc) -> Self {
        Self { ty, loc }
    }

    /// Dethunkifies the declared type in place.
    ///
    /// # Errors
    ///
    /// Propagates [`Type::dethunkify`] errors.
    pub fn dethunkify(&mut self, ctx: &Context, eval: &dyn Evaluator, full: bool) -> Result<()> {
        self.ty = self.ty.dethunkify(ctx, eval, full, &self.loc)?;
        Ok(())
    }
}

//! Contracts to the driver's external collaborators.
//!
//! The expression evaluator, the IR builder/optimizer, and the code
//! generator live outside this crate; the driver reaches them only
//! through the [`Evaluator`] and [`Backend`] traits. Tests substitute
//! stub implementations.

use diagnostics::{Result, SourceLoc};

use crate::ast::Expr;
use crate::fns::PrecheckTracked;
use crate::globals::Context;
use crate::ir::{Ir, Locator};
use crate::pool::FnId;
use crate::types::Type;

/// An interpreted compile-time value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// An integer scalar.
    Int(i64),
    /// An aggregate: TEA elements or struct fields, in order.
    List(Vec<Value>),
}

impl Value {
    /// The integer payload, when the value is a scalar.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::List(_) => None,
        }
    }
}

/// The expression evaluator and interpreter.
pub trait Evaluator: Sync {
    /// Walks a function body producing its precheck dataflow record.
    ///
    /// The record must exclude calls to compile-time functions; those are
    /// folded away before code exists.
    ///
    /// # Errors
    ///
    /// Returns evaluation errors as compiler errors.
    fn build_tracked(&self, ctx: &Context, fn_id: FnId) -> Result<PrecheckTracked>;

    /// Evaluates a PAA initializer to a byte-locator vector.
    ///
    /// # Errors
    ///
    /// Returns evaluation errors as compiler errors.
    fn interpret_paa(&self, ctx: &Context, loc: &SourceLoc, expr: &Expr) -> Result<Vec<Locator>>;

    /// Evaluates an expression against a declared type.
    ///
    /// The returned type may refine the declared one (sizing an unsized
    /// array from its initializer).
    ///
    /// # Errors
    ///
    /// Returns evaluation errors as compiler errors.
    fn interpret_expr(
        &self,
        ctx: &Context,
        loc: &SourceLoc,
        expr: &Expr,
        declared: &Type,
    ) -> Result<(Type, Value)>;
}

/// The IR builder, optimizer suite, byteifier, and code generator.
pub trait Backend: Sync {
    /// Builds the initial IR for a function.
    ///
    /// # Errors
    ///
    /// Returns lowering errors as compiler errors.
    fn build_ir(&self, ctx: &Context, fn_id: FnId) -> Result<Ir>;

    /// Runs the optimizer suite in place; `post_byteify` selects the
    /// second, byte-level pass configuration.
    ///
    /// # Errors
    ///
    /// Returns optimizer errors as compiler errors.
    fn optimize(&self, ctx: &Context, ir: &mut Ir, fn_id: FnId, post_byteify: bool) -> Result<()>;

    /// Rewrites the IR into byte-sized operations.
    ///
    /// # Errors
    ///
    /// Returns lowering errors as compiler errors.
    fn byteify(&self, ctx: &Context, ir: &mut Ir, fn_id: FnId) -> Result<()>;

    /// Lowers the IR to machine code.
    ///
    /// # Errors
    ///
    /// Returns code generation errors as compiler errors.
    fn code_gen(&self, ctx: &Context, ir: &mut Ir, fn_id: FnId) -> Result<()>;
}

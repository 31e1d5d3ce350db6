//! The Vireo global compilation driver.
//!
//! This crate takes a parsed but unresolved program and drives it
//! through the multi-phase pipeline: interning and definition, the
//! dependency DAG with cycle detection and weak-edge promotion, the
//! ready-queue worker pool, per-function precheck and IR dataflow
//! summaries, and the mode/NMI/fence coupling. The lexer/parser,
//! evaluator, optimizer suite, and code generator are external; they
//! plug in through [`interface::Evaluator`] and [`interface::Backend`].

#[cfg(test)]
use rstest as _;
#[cfg(test)]
use tempfile as _;

/// The slice of the AST the driver dispatches on.
pub mod ast;
/// Dense dynamic bitsets over pool indexes.
pub mod bitset;
/// Variables, constants, gmembers, ROM arrays, and member counting.
pub mod data;
/// Functions: precheck dataflow, mode/NMI coupling, compilation.
pub mod fns;
/// The global symbol table, definition protocol, and context.
pub mod globals;
/// CFG/SSA GraphViz dump emission.
pub mod graphviz;
/// Groups: named partitions of memory visibility.
pub mod group;
/// External collaborator contracts (evaluator, backend).
pub mod interface;
/// The IR surface the dataflow summarizer walks.
pub mod ir;
/// Driver configuration.
pub mod options;
/// Dependency ordering and the parallel phase scheduler.
pub mod order;
/// The compiler phase machine.
pub mod phase;
/// Typed ids and append-only object pools.
pub mod pool;
/// Address spans.
pub mod span;
/// Structs: field flattening and member counting.
pub mod structs;
/// The type model.
pub mod types;

//! Shared harness for driver tests: stub evaluator/backend and
//! definition shorthands.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use compiler_core::ast::{Expr, FnDef, Mods, Stmt, StmtKind, Token, TokenKind};
use compiler_core::fns::{FnClass, PrecheckTracked};
use compiler_core::globals::Context;
use compiler_core::interface::{Backend, Evaluator, Value};
use compiler_core::ir::{Ir, Locator};
use compiler_core::options::Options;
use compiler_core::pool::{FnId, GlobalId, GroupDataId, GroupId, GroupVarsId, GvarId};
use compiler_core::types::{SrcType, Type};
use diagnostics::{Result, SourceLoc};

/// A location on `test.vr` at the given line.
pub fn loc(line: u32) -> SourceLoc {
    SourceLoc::new(PathBuf::from("test.vr"), line, 1)
}

/// A context in the parse phase.
pub fn parse_ctx() -> Context {
    parse_ctx_with(Options::default())
}

/// A context in the parse phase with `num_threads` workers.
pub fn parse_ctx_threads(num_threads: usize) -> Context {
    parse_ctx_with(Options {
        num_threads,
        ..Options::default()
    })
}

/// A context in the parse phase with explicit options.
pub fn parse_ctx_with(options: Options) -> Context {
    let ctx = Context::new(options);
    ctx.init();
    ctx
}

/// Evaluator stub: serves prebuilt tracked records and interprets
/// expressions literally (integer tokens in order).
#[derive(Default)]
pub struct TestEval {
    tracked: HashMap<FnId, PrecheckTracked>,
}

impl TestEval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracked(mut self, fn_id: FnId, tracked: PrecheckTracked) -> Self {
        self.tracked.insert(fn_id, tracked);
        self
    }
}

impl Evaluator for TestEval {
    fn build_tracked(&self, _ctx: &Context, fn_id: FnId) -> Result<PrecheckTracked> {
        Ok(self.tracked.get(&fn_id).cloned().unwrap_or_default())
    }

    fn interpret_paa(&self, _ctx: &Context, _loc: &SourceLoc, expr: &Expr) -> Result<Vec<Locator>> {
        Ok(expr_ints(expr)
            .into_iter()
            .map(|v| Locator::Const(v as u8))
            .collect())
    }

    fn interpret_expr(
        &self,
        _ctx: &Context,
        _loc: &SourceLoc,
        expr: &Expr,
        declared: &Type,
    ) -> Result<(Type, Value)> {
        let ints = expr_ints(expr);
        match declared {
            Type::Tea { elem, len } => {
                let actual = if *len == 0 { ints.len() as u16 } else { *len };
                let value = Value::List(ints.into_iter().map(Value::Int).collect());
                Ok((Type::tea((**elem).clone(), actual), value))
            }
            _ => Ok((
                declared.clone(),
                Value::Int(ints.first().copied().unwrap_or(0)),
            )),
        }
    }
}

fn expr_ints(expr: &Expr) -> Vec<i64> {
    expr.tokens
        .iter()
        .filter_map(|token| match token.kind {
            TokenKind::Int(v) => Some(v),
            TokenKind::Name(_) => None,
        })
        .collect()
}

/// Backend stub: serves prebuilt IRs (an empty one-block IR otherwise)
/// and treats every later stage as a no-op.
#[derive(Default)]
pub struct TestBackend {
    irs: HashMap<FnId, Ir>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ir(mut self, fn_id: FnId, ir: Ir) -> Self {
        self.irs.insert(fn_id, ir);
        self
    }
}

impl Backend for TestBackend {
    fn build_ir(&self, _ctx: &Context, fn_id: FnId) -> Result<Ir> {
        Ok(self.irs.get(&fn_id).cloned().unwrap_or_else(empty_ir))
    }

    fn optimize(&self, _ctx: &Context, _ir: &mut Ir, _fn_id: FnId, _post_byteify: bool) -> Result<()> {
        Ok(())
    }

    fn byteify(&self, _ctx: &Context, _ir: &mut Ir, _fn_id: FnId) -> Result<()> {
        Ok(())
    }

    fn code_gen(&self, _ctx: &Context, _ir: &mut Ir, _fn_id: FnId) -> Result<()> {
        Ok(())
    }
}

/// An IR with a single empty block.
pub fn empty_ir() -> Ir {
    let mut ir = Ir::new();
    ir.add_block();
    ir
}

/// An expression holding one integer literal.
pub fn int_expr(line: u32, value: i64) -> Expr {
    Expr::int(loc(line), value)
}

/// An expression listing several integer literals.
pub fn list_expr(line: u32, values: &[i64]) -> Expr {
    Expr {
        loc: loc(line),
        tokens: values
            .iter()
            .map(|&v| Token {
                loc: loc(line),
                kind: TokenKind::Int(v),
            })
            .collect(),
    }
}

fn dep_set(deps: &[GlobalId]) -> BTreeSet<GlobalId> {
    deps.iter().copied().collect()
}

/// Defines a vars group.
pub fn def_group_vars(ctx: &Context, line: u32, name: &str) -> (GroupId, GroupVarsId) {
    ctx.define_group_vars(loc(line), name).expect("group vars")
}

/// Defines a data group.
pub fn def_group_data(ctx: &Context, line: u32, name: &str) -> (GroupId, GroupDataId) {
    ctx.define_group_data(loc(line), name).expect("group data")
}

/// Defines a variable.
pub fn def_var(
    ctx: &Context,
    line: u32,
    name: &str,
    ty: Type,
    group: (GroupId, GroupVarsId),
    init: Option<Expr>,
    deps: &[GlobalId],
) -> (GlobalId, GvarId) {
    let global = ctx.lookup(loc(line), name);
    let gvar = ctx
        .define_var(global, loc(line), dep_set(deps), SrcType::new(ty, loc(line)), group, init)
        .expect("define var");
    (global, gvar)
}

/// Defines a function with explicit everything.
pub fn def_fn(
    ctx: &Context,
    line: u32,
    name: &str,
    class: FnClass,
    def: FnDef,
    mods: Option<Mods>,
    deps: &[GlobalId],
) -> (GlobalId, FnId) {
    let global = ctx.lookup(loc(line), name);
    let fn_id = ctx
        .define_fn(
            global,
            loc(line),
            dep_set(deps),
            BTreeSet::new(),
            Type::Void,
            def,
            mods,
            class,
        )
        .expect("define fn");
    (global, fn_id)
}

/// Defines a plain function with no body statements or modifiers.
pub fn simple_fn(ctx: &Context, line: u32, name: &str, deps: &[GlobalId]) -> (GlobalId, FnId) {
    def_fn(ctx, line, name, FnClass::Fn, FnDef::default(), None, deps)
}

/// Defines an NMI handler.
pub fn nmi_fn(ctx: &Context, line: u32, name: &str, deps: &[GlobalId]) -> (GlobalId, FnId) {
    def_fn(ctx, line, name, FnClass::Nmi, FnDef::default(), None, deps)
}

/// Defines a mode wired to an NMI handler.
pub fn mode_fn(
    ctx: &Context,
    line: u32,
    name: &str,
    nmi_global: GlobalId,
    deps: &[GlobalId],
) -> (GlobalId, FnId) {
    let mut mods = Mods::new(loc(line));
    mods.nmi = Some(nmi_global);
    def_fn(ctx, line, name, FnClass::Mode, FnDef::default(), Some(mods), deps)
}

/// A modifier set with an explicit `vars(...)` list.
pub fn explicit_vars_mods(line: u32, groups: &[GroupId]) -> Mods {
    let mut mods = Mods::new(loc(line));
    mods.explicit_group_vars = true;
    for &group in groups {
        mods.group_vars.insert(group, loc(line));
    }
    mods
}

/// A body holding one `goto mode` statement, optionally preserving a
/// vars group through the transfer.
pub fn goto_mode_def(stmt_line: u32, target: GlobalId, preserve: Option<GroupId>) -> FnDef {
    let mut def = FnDef::default();
    let mods = preserve.map(|group| {
        def.mods.push(explicit_vars_mods(stmt_line, &[group]));
        0
    });
    def.stmts.push(Stmt {
        kind: StmtKind::GotoMode { target },
        loc: loc(stmt_line),
        mods,
    });
    def
}

/// A tracked record calling the given functions.
pub fn tracked_calls(calls: &[(FnId, u32)]) -> PrecheckTracked {
    PrecheckTracked {
        calls: calls.iter().map(|&(id, line)| (id, loc(line))).collect(),
        ..PrecheckTracked::default()
    }
}

/// A tracked record using the given variables.
pub fn tracked_gvars(gvars: &[(GvarId, u32)]) -> PrecheckTracked {
    PrecheckTracked {
        gvars_used: gvars.iter().map(|&(id, line)| (id, loc(line))).collect(),
        ..PrecheckTracked::default()
    }
}

/// Runs parse-cleanup through the precheck phase.
pub fn run_to_precheck(ctx: &Context, eval: &TestEval) -> Result<()> {
    ctx.parse_cleanup()?;
    ctx.count_members(eval)?;
    ctx.build_order(true)?;
    ctx.precheck_all(eval)
}

/// Runs the whole pipeline through the compile phase.
pub fn run_to_compile(ctx: &Context, eval: &TestEval, backend: &TestBackend) -> Result<()> {
    run_to_precheck(ctx, eval)?;
    ctx.build_order(false)?;
    ctx.compile_all(backend)
}

//! The global symbol table and definition protocol.
//!
//! Every top-level name interns to exactly one [`Global`]. A global
//! starts undefined and transitions at most once to a concrete
//! classification through [`Context::define`]; the classification's
//! record lives in a per-kind pool and the global keeps its id. Globals
//! also carry the dependency sets the scheduler orders phases by.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use diagnostics::{CompilerError, Diagnostic, Result, SourceLoc};

use crate::ast::{FnDef, Mods};
use crate::data::{Const, Gmember, Gvar, RomArray, RomProc};
use crate::fns::{FnClass, Func};
use crate::group::{Group, GroupData, GroupMap, GroupVars};
use crate::options::Options;
use crate::order::ReadyQueue;
use crate::phase::{Phase, PhaseCell};
use crate::pool::{
    lock, read_lock, write_lock, ConstId, FnId, GlobalId, GmemberId, GroupDataId, GroupId,
    GroupVarsId, GvarId, Pool, RomArrayId, RomProcId, StructId,
};
use crate::structs::{Field, Struct};
use crate::types::{SrcType, Type};

/// A global's classification, fixed once by the definition protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalKind {
    /// Not yet defined; an error if still present after parse-cleanup.
    Undefined,
    /// A function.
    Fn(FnId),
    /// A RAM variable.
    Var(GvarId),
    /// A ROM constant.
    Const(ConstId),
    /// A struct type.
    Struct(StructId),
    /// A group.
    Group(GroupId),
}

impl std::fmt::Display for GlobalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Fn(_) => "fn",
            Self::Var(_) => "var",
            Self::Const(_) => "const",
            Self::Struct(_) => "struct",
            Self::Group(_) => "group",
        };
        write!(f, "{name}")
    }
}

/// The datum record of a var or const global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumId {
    /// A variable's record.
    Var(GvarId),
    /// A constant's record.
    Const(ConstId),
}

#[derive(Debug)]
struct Definition {
    kind: GlobalKind,
    loc: Option<SourceLoc>,
}

#[derive(Debug, Default)]
pub(crate) struct Deps {
    pub(crate) ideps: BTreeSet<GlobalId>,
    pub(crate) weak_ideps: BTreeSet<GlobalId>,
    pub(crate) iuses: Vec<GlobalId>,
}

/// An interned top-level name.
#[derive(Debug)]
pub struct Global {
    /// The interned name.
    pub name: String,
    first_loc: Mutex<Option<SourceLoc>>,
    def: Mutex<Definition>,
    pub(crate) deps: RwLock<Deps>,
    pub(crate) ideps_left: AtomicU32,
    prechecked: AtomicBool,
    compiled: AtomicBool,
}

impl Global {
    fn new(name: String, loc: Option<SourceLoc>) -> Self {
        Self {
            name,
            first_loc: Mutex::new(loc),
            def: Mutex::new(Definition {
                kind: GlobalKind::Undefined,
                loc: None,
            }),
            deps: RwLock::new(Deps::default()),
            ideps_left: AtomicU32::new(0),
            prechecked: AtomicBool::new(false),
            compiled: AtomicBool::new(false),
        }
    }

    /// The global's classification.
    #[must_use]
    pub fn kind(&self) -> GlobalKind {
        lock(&self.def).kind
    }

    /// The defining location, once defined.
    #[must_use]
    pub fn def_loc(&self) -> Option<SourceLoc> {
        lock(&self.def).loc.clone()
    }

    /// The best location for diagnostics: the defining location, else
    /// the location of the first sighting.
    #[must_use]
    pub fn loc(&self) -> Option<SourceLoc> {
        self.def_loc().or_else(|| lock(&self.first_loc).clone())
    }

    /// The strong dependency set.
    #[must_use]
    pub fn ideps(&self) -> BTreeSet<GlobalId> {
        read_lock(&self.deps).ideps.clone()
    }

    /// True once this global's precheck completed.
    #[must_use]
    pub fn prechecked(&self) -> bool {
        self.prechecked.load(Ordering::Acquire)
    }

    /// True once this global's compile completed.
    #[must_use]
    pub fn compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }

    pub(crate) fn set_prechecked(&self) {
        self.prechecked.store(true, Ordering::Release);
    }

    pub(crate) fn set_compiled(&self) {
        self.compiled.store(true, Ordering::Release);
    }
}

/// The compilation context: pools, name table, phase, queue, options.
#[derive(Debug)]
pub struct Context {
    phase: PhaseCell,
    options: Options,
    globals: Pool<GlobalId, Global>,
    name_map: Mutex<HashMap<String, GlobalId>>,
    fns: Pool<FnId, Func>,
    gvars: Pool<GvarId, Gvar>,
    consts: Pool<ConstId, Const>,
    structs: Pool<StructId, Struct>,
    groups: Pool<GroupId, Group>,
    group_map: Mutex<GroupMap>,
    group_vars: Pool<GroupVarsId, GroupVars>,
    group_data: Pool<GroupDataId, GroupData>,
    gmembers: Pool<GmemberId, Gmember>,
    rom_arrays: Pool<RomArrayId, RomArray>,
    rom_array_map: Mutex<HashMap<u64, RomArrayId>>,
    rom_procs: Pool<RomProcId, RomProc>,
    modes: Mutex<Vec<FnId>>,
    nmis: Mutex<Vec<FnId>>,
    pub(crate) ready: ReadyQueue,
    warnings: Mutex<Vec<Diagnostic>>,
}

impl Context {
    /// Creates a context at the init phase.
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            phase: PhaseCell::new(),
            options,
            globals: Pool::new(),
            name_map: Mutex::new(HashMap::new()),
            fns: Pool::new(),
            gvars: Pool::new(),
            consts: Pool::new(),
            structs: Pool::new(),
            groups: Pool::new(),
            group_map: Mutex::new(GroupMap::new()),
            group_vars: Pool::new(),
            group_data: Pool::new(),
            gmembers: Pool::new(),
            rom_arrays: Pool::new(),
            rom_array_map: Mutex::new(HashMap::new()),
            rom_procs: Pool::new(),
            modes: Mutex::new(Vec::new()),
            nmis: Mutex::new(Vec::new()),
            ready: ReadyQueue::new(),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// The configured options.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub(crate) const fn phase_cell(&self) -> &PhaseCell {
        &self.phase
    }

    /// The global pool.
    #[must_use]
    pub const fn globals(&self) -> &Pool<GlobalId, Global> {
        &self.globals
    }

    /// The function pool.
    #[must_use]
    pub const fn fns(&self) -> &Pool<FnId, Func> {
        &self.fns
    }

    /// The variable pool.
    #[must_use]
    pub const fn gvars(&self) -> &Pool<GvarId, Gvar> {
        &self.gvars
    }

    /// The constant pool.
    #[must_use]
    pub const fn consts(&self) -> &Pool<ConstId, Const> {
        &self.consts
    }

    /// The struct pool.
    #[must_use]
    pub const fn structs(&self) -> &Pool<StructId, Struct> {
        &self.structs
    }

    /// The group pool.
    #[must_use]
    pub const fn groups(&self) -> &Pool<GroupId, Group> {
        &self.groups
    }

    /// The vars-group pool.
    #[must_use]
    pub const fn group_vars(&self) -> &Pool<GroupVarsId, GroupVars> {
        &self.group_vars
    }

    /// The data-group pool.
    #[must_use]
    pub const fn group_data(&self) -> &Pool<GroupDataId, GroupData> {
        &self.group_data
    }

    /// The gmember pool.
    #[must_use]
    pub const fn gmembers(&self) -> &Pool<GmemberId, Gmember> {
        &self.gmembers
    }

    /// The ROM array pool.
    #[must_use]
    pub const fn rom_arrays(&self) -> &Pool<RomArrayId, RomArray> {
        &self.rom_arrays
    }

    /// The ROM proc pool.
    #[must_use]
    pub const fn rom_procs(&self) -> &Pool<RomProcId, RomProc> {
        &self.rom_procs
    }

    pub(crate) const fn group_map(&self) -> &Mutex<GroupMap> {
        &self.group_map
    }

    pub(crate) const fn rom_array_map(&self) -> &Mutex<HashMap<u64, RomArrayId>> {
        &self.rom_array_map
    }

    /// Every mode function, in definition order.
    #[must_use]
    pub fn modes(&self) -> Vec<FnId> {
        lock(&self.modes).clone()
    }

    /// Every NMI function, in definition order.
    #[must_use]
    pub fn nmis(&self) -> Vec<FnId> {
        lock(&self.nmis).clone()
    }

    /// Records a warning.
    pub fn push_warning(&self, warning: Diagnostic) {
        lock(&self.warnings).push(warning);
    }

    /// Drains the warnings collected so far.
    #[must_use]
    pub fn take_warnings(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut lock(&self.warnings))
    }

    /// Advances init → parse. The planned synthetic universal globals
    /// were never activated; this only moves the phase machine.
    pub fn init(&self) {
        assert_eq!(self.phase(), Phase::Init);
        self.phase.advance_to(Phase::Parse);
    }

    /// Interns `name`, recording `loc` as its first sighting.
    ///
    /// Two lookups of byte-equal names return the same id for the life
    /// of the context.
    pub fn lookup(&self, loc: SourceLoc, name: &str) -> GlobalId {
        let mut map = lock(&self.name_map);
        if let Some(&id) = map.get(name) {
            return id;
        }
        let id = self
            .globals
            .push(Global::new(name.to_owned(), Some(loc)));
        map.insert(name.to_owned(), id);
        id
    }

    /// Looks `name` up without interning; `None` on a miss.
    #[must_use]
    pub fn lookup_sourceless(&self, name: &str) -> Option<GlobalId> {
        lock(&self.name_map).get(name).copied()
    }

    /// Fixes a global's classification, exactly once.
    ///
    /// `create_impl` must emplace the classification record in its pool
    /// and return the resulting kind; it runs under the global's
    /// definition lock.
    ///
    /// # Errors
    ///
    /// Returns a redefinition error citing both sites when the global is
    /// already defined.
    ///
    /// # Panics
    ///
    /// Panics when called after the parse phase.
    pub fn define(
        &self,
        global_id: GlobalId,
        loc: SourceLoc,
        ideps: BTreeSet<GlobalId>,
        weak_ideps: BTreeSet<GlobalId>,
        create_impl: impl FnOnce(GlobalId) -> GlobalKind,
    ) -> Result<GlobalKind> {
        assert!(self.phase() <= Phase::Parse, "define after parse phase");
        debug_assert!(!ideps.contains(&global_id), "global depends on itself");

        let global = self.globals.get(global_id);
        let kind = {
            let mut def = lock(&global.def);
            if !matches!(def.kind, GlobalKind::Undefined) {
                let err = CompilerError::at(
                    loc,
                    format!("global identifier {} already in use", global.name),
                );
                return Err(match &def.loc {
                    Some(prior) => err.with_note_at(prior.clone(), "previous definition here"),
                    None => err,
                });
            }
            let kind = create_impl(global_id);
            def.kind = kind;
            def.loc = Some(loc);
            kind
        };

        let mut deps = write_lock(&global.deps);
        deps.ideps = ideps;
        deps.weak_ideps = weak_ideps;
        Ok(kind)
    }

    /// Defines a function, inserting it into the modes or NMIs list as
    /// its class requires.
    ///
    /// # Errors
    ///
    /// Propagates redefinition errors.
    #[allow(clippy::too_many_arguments)]
    pub fn define_fn(
        &self,
        global_id: GlobalId,
        loc: SourceLoc,
        ideps: BTreeSet<GlobalId>,
        weak_ideps: BTreeSet<GlobalId>,
        ty: Type,
        def: FnDef,
        mods: Option<Mods>,
        class: FnClass,
    ) -> Result<FnId> {
        let mut created = None;
        self.define(global_id, loc, ideps, weak_ideps, |g| {
            let fn_id = self.fns.push(Func::new(g, class, ty, def, mods));
            created = Some(fn_id);
            GlobalKind::Fn(fn_id)
        })?;
        let fn_id = created.expect("create_impl ran");
        match class {
            FnClass::Mode => lock(&self.modes).push(fn_id),
            FnClass::Nmi => lock(&self.nmis).push(fn_id),
            FnClass::Fn | FnClass::Ct => {}
        }
        Ok(fn_id)
    }

    /// Defines a variable and registers it with its vars group.
    ///
    /// # Errors
    ///
    /// Propagates redefinition errors.
    pub fn define_var(
        &self,
        global_id: GlobalId,
        loc: SourceLoc,
        ideps: BTreeSet<GlobalId>,
        src_type: SrcType,
        group: (GroupId, GroupVarsId),
        init_expr: Option<crate::ast::Expr>,
    ) -> Result<GvarId> {
        let mut created = None;
        self.define(global_id, loc, ideps, BTreeSet::new(), |g| {
            let gvar_id = self
                .gvars
                .push(Gvar::new(g, src_type, group.1, init_expr));
            created = Some(gvar_id);
            GlobalKind::Var(gvar_id)
        })?;
        let gvar_id = created.expect("create_impl ran");
        self.group_vars.get(group.1).add_gvar(gvar_id);
        Ok(gvar_id)
    }

    /// Defines a constant and registers it with its data group, when it
    /// has one.
    ///
    /// # Errors
    ///
    /// Propagates redefinition errors.
    pub fn define_const(
        &self,
        global_id: GlobalId,
        loc: SourceLoc,
        ideps: BTreeSet<GlobalId>,
        src_type: SrcType,
        group: Option<(GroupId, GroupDataId)>,
        init_expr: Option<crate::ast::Expr>,
    ) -> Result<ConstId> {
        let mut created = None;
        self.define(global_id, loc, ideps, BTreeSet::new(), |g| {
            let const_id = self
                .consts
                .push(Const::new(g, src_type, group.map(|(_, data)| data), init_expr));
            created = Some(const_id);
            GlobalKind::Const(const_id)
        })?;
        let const_id = created.expect("create_impl ran");
        if let Some((_, data)) = group {
            self.group_data.get(data).add_const(const_id);
        }
        Ok(const_id)
    }

    /// Defines a struct.
    ///
    /// # Errors
    ///
    /// Propagates redefinition errors.
    pub fn define_struct(
        &self,
        global_id: GlobalId,
        loc: SourceLoc,
        ideps: BTreeSet<GlobalId>,
        fields: Vec<Field>,
    ) -> Result<StructId> {
        let mut created = None;
        self.define(global_id, loc, ideps, BTreeSet::new(), |g| {
            let struct_id = self.structs.push(Struct::new(g, fields));
            created = Some(struct_id);
            GlobalKind::Struct(struct_id)
        })?;
        Ok(created.expect("create_impl ran"))
    }

    /// True when `a` is `b` or transitively depends on `b` through
    /// strong edges.
    #[must_use]
    pub fn has_dep(&self, a: GlobalId, b: GlobalId) -> bool {
        assert!(self.phase() > Phase::Parse);
        if a == b {
            return true;
        }
        let ideps = self.globals.get(a).ideps();
        if ideps.contains(&b) {
            return true;
        }
        ideps.iter().any(|&idep| self.has_dep(idep, b))
    }

    /// Single-threaded validation after parsing completes: every name
    /// defined, every modifier's groups consistent, every mode wired to
    /// an NMI, and per-group initializer summaries.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn parse_cleanup(&self) -> Result<()> {
        self.phase.advance_to(Phase::ParseCleanup);

        // Verify globals (groups included) are defined:
        for id in self.globals.ids() {
            let global = self.globals.get(id);
            if matches!(global.kind(), GlobalKind::Undefined) {
                return Err(match global.loc() {
                    Some(loc) => CompilerError::at(loc, "name not in scope"),
                    None => CompilerError::msg(format!("name not in scope: {}", global.name)),
                });
            }
        }

        // Validate groups and mods:
        for fn_id in self.fns.ids() {
            let f = self.fns.get(fn_id);
            for mods in &f.def().mods {
                mods.validate_groups(self)?;
            }
            if let Some(mods) = f.mods() {
                mods.validate_groups(self)?;
            }

            let fn_loc = self.globals.get(f.global).loc();
            match f.mods().and_then(|mods| mods.nmi) {
                Some(nmi_global_id) => {
                    let nmi_global = self.globals.get(nmi_global_id);
                    let is_nmi = matches!(
                        nmi_global.kind(),
                        GlobalKind::Fn(nmi_fn) if self.fns.get(nmi_fn).class == FnClass::Nmi
                    );
                    if !is_nmi {
                        let err = match fn_loc {
                            Some(loc) => CompilerError::at(
                                loc,
                                format!("{} is not an nmi function", nmi_global.name),
                            ),
                            None => CompilerError::msg(format!(
                                "{} is not an nmi function",
                                nmi_global.name
                            )),
                        };
                        return Err(match nmi_global.loc() {
                            Some(loc) => err.with_note_at(loc, "declared here"),
                            None => err,
                        });
                    }
                }
                None if f.class == FnClass::Mode => {
                    return Err(match fn_loc {
                        Some(loc) => CompilerError::at(loc, "missing nmi modifier"),
                        None => CompilerError::msg(format!(
                            "missing nmi modifier on mode {}",
                            self.globals.get(f.global).name
                        )),
                    });
                }
                None => {}
            }
        }

        // Determine group vars inits:
        for id in self.group_vars.ids() {
            self.group_vars.get(id).determine_has_init(self);
        }

        Ok(())
    }

    /// Hands the context over to the RAM/ROM allocator: advances the
    /// phase so span assignment becomes legal.
    ///
    /// # Panics
    ///
    /// Panics unless the compile phase just finished.
    pub fn begin_alloc(&self) {
        assert_eq!(self.phase(), Phase::Compile);
        self.phase.advance_to(Phase::AllocRam);
    }

    /// The datum record of a var or const global.
    #[must_use]
    pub fn datum(&self, global_id: GlobalId) -> Option<DatumId> {
        match self.globals.get(global_id).kind() {
            GlobalKind::Var(id) => Some(DatumId::Var(id)),
            GlobalKind::Const(id) => Some(DatumId::Const(id)),
            _ => None,
        }
    }

    /// The unique entry point: the function named `main`, which must be
    /// a mode with no parameters.
    ///
    /// # Errors
    ///
    /// Returns an error when `main` is missing, is not a mode, or
    /// declares parameters.
    pub fn get_main_entry(&self) -> Result<FnId> {
        assert!(self.phase() > Phase::Parse);

        let main_fn = self.lookup_sourceless("main").and_then(|id| {
            match self.globals.get(id).kind() {
                GlobalKind::Fn(fn_id) if self.fns.get(fn_id).class == FnClass::Mode => Some(fn_id),
                _ => None,
            }
        });
        let Some(fn_id) = main_fn else {
            return Err(CompilerError::msg(
                "missing definition of mode main; program has no entry point",
            ));
        };

        let f = self.fns.get(fn_id);
        if let Some(param) = f.def().params.first() {
            return Err(CompilerError::at(
                param.src_type.loc.clone(),
                "mode main cannot have parameters",
            ));
        }
        Ok(fn_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::{Context, GlobalKind};
    use crate::fns::FnClass;
    use crate::options::Options;
    use crate::types::Type;
    use diagnostics::SourceLoc;

    fn loc(line: u32) -> SourceLoc {
        SourceLoc::new(PathBuf::from("unit.vr"), line, 1)
    }

    fn parse_ctx() -> Context {
        let ctx = Context::new(Options::default());
        ctx.init();
        ctx
    }

    fn define_simple_fn(ctx: &Context, line: u32, name: &str, deps: &[super::GlobalId]) {
        let global = ctx.lookup(loc(line), name);
        ctx.define_fn(
            global,
            loc(line),
            deps.iter().copied().collect(),
            BTreeSet::new(),
            Type::Void,
            Default::default(),
            None,
            FnClass::Fn,
        )
        .unwrap();
    }

    #[test]
    fn lookup_interns_by_byte_equality() {
        let ctx = parse_ctx();
        assert_eq!(ctx.lookup(loc(1), "alpha"), ctx.lookup(loc(2), "alpha"));
        assert_ne!(ctx.lookup(loc(1), "alpha"), ctx.lookup(loc(1), "beta"));
    }

    #[test]
    fn lookup_sourceless_never_interns() {
        let ctx = parse_ctx();
        assert_eq!(ctx.lookup_sourceless("ghost"), None);
        assert_eq!(ctx.globals().len(), 0);
    }

    #[test]
    fn kind_transitions_exactly_once() {
        let ctx = parse_ctx();
        define_simple_fn(&ctx, 1, "f", &[]);
        let global = ctx.lookup(loc(2), "f");
        let err = ctx
            .define_fn(
                global,
                loc(2),
                BTreeSet::new(),
                BTreeSet::new(),
                Type::Void,
                Default::default(),
                None,
                FnClass::Fn,
            )
            .unwrap_err();
        assert!(err.to_string().contains("already in use"), "{err}");
        assert!(err.diagnostic.cites(&loc(1)));
        assert!(err.diagnostic.cites(&loc(2)));
    }

    #[test]
    fn kinds_display_as_lowercase_nouns() {
        assert_eq!(GlobalKind::Undefined.to_string(), "undefined");
        let ctx = parse_ctx();
        define_simple_fn(&ctx, 1, "f", &[]);
        let global = ctx.globals().get(ctx.lookup(loc(1), "f"));
        assert_eq!(global.kind().to_string(), "fn");
    }

    #[test]
    fn has_dep_is_reflexive_and_transitive() {
        let ctx = parse_ctx();
        let a = ctx.lookup(loc(1), "a");
        let b = ctx.lookup(loc(2), "b");
        let c = ctx.lookup(loc(3), "c");
        define_simple_fn(&ctx, 1, "a", &[]);
        define_simple_fn(&ctx, 2, "b", &[a]);
        define_simple_fn(&ctx, 3, "c", &[b]);
        ctx.parse_cleanup().unwrap();

        assert!(ctx.has_dep(a, a));
        assert!(ctx.has_dep(c, a));
        assert!(!ctx.has_dep(a, c));
    }

    #[test]
    fn defining_location_wins_over_first_sighting() {
        let ctx = parse_ctx();
        let global_id = ctx.lookup(loc(10), "f");
        assert_eq!(ctx.globals().get(global_id).loc(), Some(loc(10)));
        define_simple_fn(&ctx, 20, "f", &[]);
        assert_eq!(ctx.globals().get(global_id).loc(), Some(loc(20)));
    }
}

//! Functions: precheck dataflow, mode/NMI coupling, and compilation.
//!
//! A function is classified as a regular fn, a *mode* (an entry point,
//! always paired with an NMI handler), an *NMI* handler, or a
//! compile-time fn. Precheck runs the evaluator over the body and folds
//! the result into bitsets over group-vars, gmembers, and functions,
//! enforcing the group-visibility rule at every contributing site. After
//! the precheck queue drains, a single-threaded finalization wires modes
//! to NMIs, assigns NMI indexes, and tags every function with its
//! ROM-visibility flags. Compile builds the IR through the backend,
//! summarizes it, and lowers it to code.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, RwLock};

use bitflags::bitflags;
use diagnostics::{CompilerError, Diagnostic, Result, SourceLoc};

use crate::ast::{FnDef, Mods};
use crate::bitset::Bitset;
use crate::globals::{Context, GlobalKind};
use crate::graphviz::save_graphs;
use crate::interface::{Backend, Evaluator};
use crate::ir::{Ir, Locator, SsaFlags, SsaOp, SsaValue};
use crate::pool::{lock, read_lock, write_lock, FnId, GlobalId, GroupId, GvarId, PoolId, RomProcId};
use crate::span::Span;
use crate::types::{FnSig, Type};

bitflags! {
    /// ROM-visibility flags: under which roots a function's code must be
    /// emitted.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RomvFlags: u8 {
        /// Reachable from a mode.
        const IN_MODE = 1 << 0;
        /// Reachable from an NMI handler.
        const IN_NMI = 1 << 1;
    }
}

/// The ROM-visibility planes, used to index per-plane tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Romv {
    /// The mode (main thread) plane.
    Mode = 0,
    /// The NMI plane.
    Nmi = 1,
}

/// Number of ROM-visibility planes.
pub const NUM_ROMV: usize = 2;

impl Romv {
    /// Index into per-plane tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The flag bit of this plane.
    #[must_use]
    pub const fn flag(self) -> RomvFlags {
        match self {
            Self::Mode => RomvFlags::IN_MODE,
            Self::Nmi => RomvFlags::IN_NMI,
        }
    }
}

/// Function classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnClass {
    /// A regular function.
    Fn,
    /// An entry point; must carry an `nmi` modifier.
    Mode,
    /// A non-maskable-interrupt handler.
    Nmi,
    /// A compile-time function; generates no code.
    Ct,
}

/// The dataflow record the evaluator produces for one function body.
///
/// Calls to compile-time functions are excluded; they are folded away
/// before any code exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecheckTracked {
    /// Directly used variables, with one use location each.
    pub gvars_used: Vec<(GvarId, SourceLoc)>,
    /// Directly called functions, with one call location each.
    pub calls: Vec<(FnId, SourceLoc)>,
    /// `fence` sites.
    pub fences: Vec<SourceLoc>,
    /// `wait nmi` sites.
    pub wait_nmis: Vec<SourceLoc>,
    /// `goto mode` sites: target mode and statement index.
    pub goto_modes: Vec<(FnId, usize)>,
    /// Pointer-dereference sites: each group of the pointer's tail.
    pub deref_groups: Vec<(GroupId, DerefInfo)>,
}

/// Details of one pointer-dereference site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerefInfo {
    /// The pointer's type.
    pub ty: Type,
    /// The dereference location.
    pub loc: SourceLoc,
}

/// Precheck products, published once per non-compile-time function.
#[derive(Debug)]
pub struct Precheck {
    /// The evaluator's dataflow record.
    pub tracked: PrecheckTracked,
    /// Touched vars groups, over the group-vars pool.
    pub group_vars: Bitset,
    /// Read or written gmembers, over the gmember pool.
    pub rw: Bitset,
    /// Transitive callees, over the function pool.
    pub calls: Bitset,
    /// True when the function or a callee waits on an NMI.
    pub wait_nmi: bool,
    /// True when the function or a callee fences.
    pub fences: bool,
}

/// IR dataflow summary, published once per compiled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrInfo {
    /// Read gmembers.
    pub reads: Bitset,
    /// Written gmembers.
    pub writes: Bitset,
    /// Touched vars groups.
    pub group_vars: Bitset,
    /// Groups dereferenced through pointers.
    pub deref_groups: Bitset,
    /// Called functions.
    pub calls: Bitset,
    /// True when the function has no I/O side effects.
    pub io_pure: bool,
    /// True when the function contains a fence.
    pub fences: bool,
}

/// What the NMIs of a fence-using function's parent modes may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceSets {
    /// Union of the parent modes' NMIs' available reads.
    pub reads: Bitset,
    /// Union of the parent modes' NMIs' available writes.
    pub writes: Bitset,
}

/// A function's local-variable layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lvars {
    /// Locators of this function's own lvars.
    pub this_lvars: Vec<Locator>,
    /// Locators borrowed from callees' lvar tables.
    pub call_lvars: Vec<(FnId, Locator)>,
}

impl Lvars {
    /// Number of lvars owned by the function itself.
    #[must_use]
    pub const fn num_this_lvars(&self) -> usize {
        self.this_lvars.len()
    }

    /// Total lvars, own plus borrowed.
    #[must_use]
    pub const fn num_all_lvars(&self) -> usize {
        self.this_lvars.len() + self.call_lvars.len()
    }

    /// The table index of a locator, if present.
    #[must_use]
    pub fn index(&self, loc: &Locator) -> Option<usize> {
        if let Some(i) = self.this_lvars.iter().position(|l| l == loc) {
            return Some(i);
        }
        self.call_lvars
            .iter()
            .position(|(_, l)| l == loc)
            .map(|i| i + self.this_lvars.len())
    }
}

/// Mode-specific state.
#[derive(Debug, Default)]
pub struct ModeImpl {
    incoming_preserved_groups: Mutex<BTreeMap<GroupId, SourceLoc>>,
}

impl ModeImpl {
    /// Groups preserved by `goto mode` statements targeting this mode.
    #[must_use]
    pub fn incoming_preserved_groups(&self) -> BTreeMap<GroupId, SourceLoc> {
        lock(&self.incoming_preserved_groups).clone()
    }

    pub(crate) fn merge_incoming(&self, groups: &BTreeMap<GroupId, SourceLoc>) {
        let mut incoming = lock(&self.incoming_preserved_groups);
        for (&group, loc) in groups {
            incoming.entry(group).or_insert_with(|| loc.clone());
        }
    }
}

/// NMI-specific state.
#[derive(Debug, Default)]
pub struct NmiImpl {
    index: OnceLock<u32>,
    used_in_modes: Mutex<Bitset>,
}

impl NmiImpl {
    /// The dense NMI index, assigned during precheck finalization.
    #[must_use]
    pub fn index(&self) -> Option<u32> {
        self.index.get().copied()
    }

    /// Which modes run this NMI, as a bitset over the function pool.
    #[must_use]
    pub fn used_in_modes(&self) -> Bitset {
        lock(&self.used_in_modes).clone()
    }

    pub(crate) fn set_index(&self, index: u32) {
        let _ = self.index.set(index);
    }

    pub(crate) fn reset_used_in_modes(&self, fn_count: usize) {
        *lock(&self.used_in_modes) = Bitset::new(fn_count);
    }

    pub(crate) fn mark_used_in_mode(&self, mode: FnId) {
        lock(&self.used_in_modes).set(mode.index() as usize);
    }
}

#[derive(Debug)]
enum ClassImpl {
    None,
    Mode(ModeImpl),
    Nmi(NmiImpl),
}

/// A function definition and its per-phase products.
#[derive(Debug)]
pub struct Func {
    /// The function's global.
    pub global: GlobalId,
    /// The function's classification.
    pub class: FnClass,
    ty: RwLock<Type>,
    def: FnDef,
    mods: Option<Mods>,
    class_impl: ClassImpl,
    precheck: OnceLock<Precheck>,
    parent_modes: RwLock<BTreeSet<FnId>>,
    romv: AtomicU8,
    rom_proc: OnceLock<RomProcId>,
    ir_info: OnceLock<IrInfo>,
    fence_sets: OnceLock<FenceSets>,
    lvars: RwLock<Option<Lvars>>,
    lvar_spans: RwLock<[Vec<Span>; NUM_ROMV]>,
}

impl Func {
    pub(crate) fn new(
        global: GlobalId,
        class: FnClass,
        ty: Type,
        def: FnDef,
        mods: Option<Mods>,
    ) -> Self {
        let class_impl = match class {
            FnClass::Mode => ClassImpl::Mode(ModeImpl::default()),
            FnClass::Nmi => ClassImpl::Nmi(NmiImpl::default()),
            FnClass::Fn | FnClass::Ct => ClassImpl::None,
        };
        Self {
            global,
            class,
            ty: RwLock::new(ty),
            def,
            mods,
            class_impl,
            precheck: OnceLock::new(),
            parent_modes: RwLock::new(BTreeSet::new()),
            romv: AtomicU8::new(0),
            rom_proc: OnceLock::new(),
            ir_info: OnceLock::new(),
            fence_sets: OnceLock::new(),
            lvars: RwLock::new(None),
            lvar_spans: RwLock::new([Vec::new(), Vec::new()]),
        }
    }

    /// The parsed definition.
    #[must_use]
    pub const fn def(&self) -> &FnDef {
        &self.def
    }

    /// The declared modifier set.
    #[must_use]
    pub const fn mods(&self) -> Option<&Mods> {
        self.mods.as_ref()
    }

    /// The (possibly still thunked) function type.
    #[must_use]
    pub fn ty(&self) -> Type {
        read_lock(&self.ty).clone()
    }

    pub(crate) fn set_ty(&self, ty: Type) {
        *write_lock(&self.ty) = ty;
    }

    /// The precheck products, once published.
    #[must_use]
    pub fn precheck_opt(&self) -> Option<&Precheck> {
        self.precheck.get()
    }

    /// The precheck products.
    ///
    /// # Panics
    ///
    /// Panics before this function's precheck completed (compile-time
    /// functions never publish one).
    #[must_use]
    pub fn precheck(&self) -> &Precheck {
        self.precheck.get().expect("fn precheck products missing")
    }

    /// The IR summary, once the function compiled.
    #[must_use]
    pub fn ir_info_opt(&self) -> Option<&IrInfo> {
        self.ir_info.get()
    }

    /// The IR summary.
    ///
    /// # Panics
    ///
    /// Panics before this function compiled.
    #[must_use]
    pub fn ir_info(&self) -> &IrInfo {
        self.ir_info.get().expect("fn ir summary missing")
    }

    /// The fence read/write sets of a fence-using function.
    #[must_use]
    pub fn fence_sets(&self) -> Option<&FenceSets> {
        self.fence_sets.get()
    }

    /// The modes this function is transitively reachable from.
    #[must_use]
    pub fn parent_modes(&self) -> BTreeSet<FnId> {
        read_lock(&self.parent_modes).clone()
    }

    pub(crate) fn add_parent_mode(&self, mode: FnId) {
        write_lock(&self.parent_modes).insert(mode);
    }

    /// The accumulated ROM-visibility flags.
    #[must_use]
    pub fn romv(&self) -> RomvFlags {
        RomvFlags::from_bits_truncate(self.romv.load(Ordering::Acquire))
    }

    pub(crate) fn add_romv(&self, flags: RomvFlags) {
        self.romv.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// The function's ROM proc, once allocated.
    #[must_use]
    pub fn rom_proc(&self) -> Option<RomProcId> {
        self.rom_proc.get().copied()
    }

    pub(crate) fn set_rom_proc(&self, id: RomProcId) {
        let _ = self.rom_proc.set(id);
    }

    /// Mode-specific state, for mode functions.
    #[must_use]
    pub const fn mode_impl(&self) -> Option<&ModeImpl> {
        match &self.class_impl {
            ClassImpl::Mode(mode) => Some(mode),
            _ => None,
        }
    }

    /// NMI-specific state, for NMI functions.
    #[must_use]
    pub const fn nmi_impl(&self) -> Option<&NmiImpl> {
        match &self.class_impl {
            ClassImpl::Nmi(nmi) => Some(nmi),
            _ => None,
        }
    }

    /// The dense NMI index of an NMI function.
    ///
    /// # Panics
    ///
    /// Panics on non-NMI functions or before precheck finalization.
    #[must_use]
    pub fn nmi_index(&self) -> u32 {
        self.nmi_impl()
            .and_then(NmiImpl::index)
            .expect("nmi index not assigned")
    }

    /// The NMI handler of a mode function.
    ///
    /// # Panics
    ///
    /// Panics on non-mode functions; parse-cleanup guarantees the
    /// modifier resolves to an NMI fn.
    #[must_use]
    pub fn mode_nmi(&self, ctx: &Context) -> FnId {
        assert_eq!(self.class, FnClass::Mode);
        let nmi_global = self
            .mods()
            .and_then(|mods| mods.nmi)
            .expect("mode without nmi modifier");
        match ctx.globals().get(nmi_global).kind() {
            GlobalKind::Fn(fn_id) => fn_id,
            _ => panic!("nmi modifier does not name a fn"),
        }
    }

    /// The gmembers an NMI may read, from the perspective of a function
    /// that does (`has_dep`) or does not have a strong dependency on the
    /// NMI. With a dependency the NMI is already compiled and its IR
    /// summary is exact; without one the conservative precheck set is
    /// used.
    #[must_use]
    pub fn avail_reads(&self, has_dep: bool) -> Bitset {
        if has_dep {
            self.ir_info().reads.clone()
        } else {
            self.precheck().rw.clone()
        }
    }

    /// The gmembers an NMI may write; see [`Func::avail_reads`].
    #[must_use]
    pub fn avail_writes(&self, has_dep: bool) -> Bitset {
        if has_dep {
            self.ir_info().writes.clone()
        } else {
            self.precheck().rw.clone()
        }
    }

    /// Installs the local-variable layout and sizes the per-plane span
    /// tables.
    pub fn assign_lvars(&self, lvars: Lvars) {
        let num_this = lvars.num_this_lvars();
        *write_lock(&self.lvars) = Some(lvars);
        let mut spans = write_lock(&self.lvar_spans);
        for vec in spans.iter_mut() {
            vec.clear();
            vec.resize(num_this, Span::default());
        }
    }

    /// The local-variable layout, once assigned.
    #[must_use]
    pub fn lvars(&self) -> Option<Lvars> {
        read_lock(&self.lvars).clone()
    }

    /// Records the span of one own lvar on one plane.
    ///
    /// # Panics
    ///
    /// Panics when the slot is already assigned or the function's code
    /// is not emitted under `romv`.
    pub fn assign_lvar_span(&self, romv: Romv, lvar_i: usize, span: Span) {
        assert!(
            self.romv().contains(romv.flag()),
            "fn not emitted under this romv plane"
        );
        let mut spans = write_lock(&self.lvar_spans);
        let slot = &mut spans[romv.index()][lvar_i];
        assert!(slot.is_null(), "lvar span already assigned");
        *slot = span;
    }

    /// The span of an lvar on one plane. Own lvars read the local
    /// table; call lvars resolve through the callee's table.
    #[must_use]
    pub fn lvar_span(&self, ctx: &Context, romv: Romv, lvar_i: usize) -> Option<Span> {
        let lvars = self.lvars()?;
        if lvar_i < lvars.num_this_lvars() {
            return Some(read_lock(&self.lvar_spans)[romv.index()][lvar_i]);
        }
        let (callee_id, loc) = lvars.call_lvars.get(lvar_i - lvars.num_this_lvars())?;
        let callee = ctx.fns().get(*callee_id);
        let callee_lvars = callee.lvars()?;
        let index = callee_lvars.index(loc)?;
        if index >= callee_lvars.num_this_lvars() {
            return Some(Span::default());
        }
        callee.lvar_span(ctx, romv, index)
    }
}

impl Context {
    /// Prechecks one function: type resolution, evaluator walk, bitset
    /// derivation.
    pub(crate) fn fn_precheck(&self, fn_id: FnId, eval: &dyn Evaluator) -> Result<()> {
        let f = self.fns().get(fn_id);

        let mut params = Vec::with_capacity(f.def().params.len());
        for local in &f.def().params {
            params.push(
                local
                    .src_type
                    .ty
                    .dethunkify(self, eval, true, &local.src_type.loc)?,
            );
        }
        let return_type = match &f.def().return_type {
            Some(src_type) => src_type.ty.dethunkify(self, eval, true, &src_type.loc)?,
            None => Type::Void,
        };
        f.set_ty(Type::Fn(std::sync::Arc::new(FnSig {
            params: params.clone(),
            return_type: return_type.clone(),
        })));

        if f.class == FnClass::Ct {
            return Ok(());
        }

        for (local, ty) in f.def().params.iter().zip(&params) {
            if ty.is_ct() {
                return Err(CompilerError::at(
                    local.src_type.loc.clone(),
                    format!("function must be declared ct to use type {ty}"),
                ));
            }
        }
        if return_type.is_ct() {
            let loc = f
                .def()
                .return_type
                .as_ref()
                .map(|src_type| src_type.loc.clone())
                .or_else(|| self.globals().get(f.global).loc());
            return Err(match loc {
                Some(loc) => CompilerError::at(
                    loc,
                    format!("function must be declared ct to use type {return_type}"),
                ),
                None => CompilerError::msg(format!(
                    "function must be declared ct to use type {return_type}"
                )),
            });
        }

        let tracked = eval.build_tracked(self, fn_id)?;
        self.calc_precheck_bitsets(fn_id, tracked)
    }

    /// Folds a tracked record into the function's precheck bitsets,
    /// enforcing the group-visibility rule at every contributing site.
    pub(crate) fn calc_precheck_bitsets(&self, fn_id: FnId, tracked: PrecheckTracked) -> Result<()> {
        let f = self.fns().get(fn_id);
        let fn_name = self.globals().get(f.global).name.clone();

        let mut wait_nmi = !tracked.wait_nmis.is_empty();
        let mut fences = !tracked.fences.is_empty() || wait_nmi;

        let mut group_vars = Bitset::new(self.group_vars().len());
        let mut rw = Bitset::new(self.gmembers().len());
        let mut calls = Bitset::new(self.fns().len());

        // The declared group list, as a bitset for word-parallel checks.
        let mut mod_group_vars = Bitset::new(self.group_vars().len());
        let explicit_vars = f.mods().is_some_and(|mods| mods.explicit_group_vars);
        let explicit_data = f.mods().is_some_and(|mods| mods.explicit_group_data);
        if explicit_vars {
            if let Some(mods) = f.mods() {
                mods.for_each_group_vars(self, |gv| mod_group_vars.set(gv.index() as usize));
            }
            group_vars.union_with(&mod_group_vars);
        }

        // Accesses through pointers:
        for (group_id, info) in &tracked.deref_groups {
            let group = self.groups().get(*group_id);
            match group.class() {
                Some(crate::group::GroupClass::Vars(gv)) => {
                    if explicit_vars
                        && !f
                            .mods()
                            .is_some_and(|mods| mods.group_vars.contains_key(group_id))
                    {
                        return Err(self.deref_visibility_error(&f, &fn_name, info, "vars"));
                    }
                    group_vars.set(gv.index() as usize);
                }
                Some(crate::group::GroupClass::Data(_)) => {
                    if explicit_data
                        && !f
                            .mods()
                            .is_some_and(|mods| mods.group_data.contains_key(group_id))
                    {
                        return Err(self.deref_visibility_error(&f, &fn_name, info, "data"));
                    }
                }
                None => unreachable!("undefined group past parse-cleanup"),
            }
        }

        // Accesses through goto modes:
        for (target, stmt_index) in &tracked.goto_modes {
            let stmt_loc = f.def().stmts[*stmt_index].loc.clone();
            let Some(goto_mods) = f.def().mods_of(*stmt_index) else {
                return Err(CompilerError::at(stmt_loc, "missing vars modifier"));
            };
            if !goto_mods.explicit_group_vars {
                return Err(CompilerError::at(stmt_loc, "missing vars modifier"));
            }

            // Track incoming, for the called mode:
            if let Some(mode_impl) = self.fns().get(*target).mode_impl() {
                mode_impl.merge_incoming(&goto_mods.group_vars);
            }

            // Handle our own groups:
            for (group_id, _) in &goto_mods.group_vars {
                let group = self.groups().get(*group_id);
                if let Some(crate::group::GroupClass::Vars(gv)) = group.class() {
                    if explicit_vars
                        && !f
                            .mods()
                            .is_some_and(|mods| mods.group_vars.contains_key(group_id))
                    {
                        let declared = self.group_vars_names(&mod_group_vars);
                        return Err(CompilerError::at(
                            stmt_loc,
                            format!(
                                "preserved groups are excluded from {fn_name} (vars {declared})"
                            ),
                        )
                        .with_note(format!("excluded groups: vars {}", group.name)));
                    }
                    group_vars.set(gv.index() as usize);
                }
            }
        }

        // Direct variable uses:
        for (gvar_id, loc) in &tracked.gvars_used {
            let gvar = self.gvars().get(*gvar_id);
            let gv = self.group_vars().get(gvar.group_vars);
            let group = self.groups().get(gv.group);
            if explicit_vars
                && !f
                    .mods()
                    .is_some_and(|mods| mods.group_vars.contains_key(&gv.group))
            {
                let declared = self.group_vars_names(&mod_group_vars);
                let used_name = self.globals().get(gvar.global).name.clone();
                return Err(CompilerError::at(
                    loc.clone(),
                    format!(
                        "{used_name} (vars {}) requires groups that are excluded from {fn_name} (vars {declared})",
                        group.name
                    ),
                )
                .with_note(format!("excluded groups: vars {}", group.name)));
            }
            group_vars.set(gvar.group_vars.index() as usize);
            if let Some((begin, count)) = gvar.gmember_range() {
                rw.set_n(begin.index() as usize, count as usize);
            }
        }

        // Direct calls:
        for (callee_id, _) in &tracked.calls {
            let callee = self.fns().get(*callee_id);
            debug_assert_ne!(callee.class, FnClass::Mode);
            let callee_precheck = callee.precheck();

            let mut excess = callee_precheck.group_vars.clone();
            excess.difference_with(&mod_group_vars);
            if explicit_vars && !excess.all_clear() {
                let callee_name = self.globals().get(callee.global).name.clone();
                let callee_groups = self.group_vars_names(&callee_precheck.group_vars);
                let declared = self.group_vars_names(&mod_group_vars);
                let missing = self.group_vars_names(&excess);
                let loc = f
                    .def()
                    .find_global(callee.global)
                    .cloned()
                    .or_else(|| self.globals().get(f.global).loc());
                let message = format!(
                    "{callee_name} (vars {callee_groups}) requires groups that are excluded from {fn_name} (vars {declared})"
                );
                let err = match loc {
                    Some(loc) => CompilerError::at(loc, message),
                    None => CompilerError::msg(message),
                };
                return Err(err.with_note(format!("excluded groups: vars {missing}")));
            }

            group_vars.union_with(&callee_precheck.group_vars);
            rw.union_with(&callee_precheck.rw);
            calls.set(callee_id.index() as usize);
            calls.union_with(&callee_precheck.calls);
            fences |= callee_precheck.fences;
            wait_nmi |= callee_precheck.wait_nmi;
        }

        let _ = f.precheck.set(Precheck {
            tracked,
            group_vars,
            rw,
            calls,
            wait_nmi,
            fences,
        });
        Ok(())
    }

    fn deref_visibility_error(
        &self,
        f: &Func,
        fn_name: &str,
        info: &DerefInfo,
        keyword: &str,
    ) -> CompilerError {
        let mut missing = String::new();
        for group_id in info.ty.group_tail() {
            let group = self.groups().get(*group_id);
            let is_keyword_class = match keyword {
                "vars" => group.vars().is_some(),
                _ => group.data().is_some(),
            };
            let listed = f.mods().is_some_and(|mods| match keyword {
                "vars" => mods.group_vars.contains_key(group_id),
                _ => mods.group_data.contains_key(group_id),
            });
            if is_keyword_class && !listed {
                if !missing.is_empty() {
                    missing.push_str(", ");
                }
                missing.push_str(&group.name);
            }
        }
        CompilerError::at(
            info.loc.clone(),
            format!(
                "{} access requires groups that are excluded from {fn_name}",
                info.ty
            ),
        )
        .with_note(format!("excluded groups: {keyword} {missing}"))
    }

    /// Renders the names of the groups in a group-vars bitset.
    fn group_vars_names(&self, bitset: &Bitset) -> String {
        let mut out = String::new();
        bitset.for_each(|index| {
            let gv = self.group_vars().get(PoolId::from_index(
                u32::try_from(index).expect("group-vars index overflow"),
            ));
            let group = self.groups().get(gv.group);
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(&group.name);
        });
        if out.is_empty() {
            out.push_str("(no groups)");
        }
        out
    }

    /// Single-threaded mode/NMI finalization after the precheck queue
    /// drains: preserved-group warnings, NMI misuse errors, parent-mode
    /// population, NMI indexing, `used_in_modes`, ROM-visibility flags,
    /// and ROM proc allocation.
    pub(crate) fn precheck_finish(&self) -> Result<()> {
        let modes = self.modes();
        let nmis = self.nmis();

        for &mode in &modes {
            self.precheck_finish_mode(mode);
        }
        for &nmi in &nmis {
            self.precheck_finish_nmi(nmi)?;
        }

        // Verify fences:
        for &nmi in &nmis {
            let f = self.fns().get(nmi);
            if f.precheck().wait_nmi {
                let name = self.globals().get(f.global).name.clone();
                return Err(match self.globals().get(f.global).loc() {
                    Some(loc) => CompilerError::at(loc, "waiting for nmi inside nmi handler"),
                    None => CompilerError::msg(format!(
                        "waiting for nmi inside nmi handler {name}"
                    )),
                });
            }
        }

        // Define parent modes:
        for &mode in &modes {
            let m = self.fns().get(mode);
            for index in m.precheck().calls.ones() {
                let callee =
                    self.fns()
                        .get(FnId::from_index(u32::try_from(index).expect("fn index")));
                callee.add_parent_mode(mode);
            }
            m.add_parent_mode(mode);
        }

        // Assign NMI indexes, then allocate and populate 'used_in_modes':
        let fn_count = self.fns().len();
        for (index, &nmi) in nmis.iter().enumerate() {
            let f = self.fns().get(nmi);
            let nmi_impl = f.nmi_impl().expect("nmi class impl");
            nmi_impl.set_index(u32::try_from(index).expect("nmi index"));
            nmi_impl.reset_used_in_modes(fn_count);
        }
        for &mode in &modes {
            let nmi = self.fns().get(mode).mode_nmi(self);
            self.fns()
                .get(nmi)
                .nmi_impl()
                .expect("nmi class impl")
                .mark_used_in_mode(mode);
        }

        // ROM-visibility flags:
        for &mode in &modes {
            let m = self.fns().get(mode);
            for index in m.precheck().calls.ones() {
                self.fns()
                    .get(FnId::from_index(u32::try_from(index).expect("fn index")))
                    .add_romv(RomvFlags::IN_MODE);
            }
            m.add_romv(RomvFlags::IN_MODE);
        }
        for &nmi in &nmis {
            let n = self.fns().get(nmi);
            for index in n.precheck().calls.ones() {
                self.fns()
                    .get(FnId::from_index(u32::try_from(index).expect("fn index")))
                    .add_romv(RomvFlags::IN_NMI);
            }
            n.add_romv(RomvFlags::IN_NMI);
        }

        // Allocate rom procs:
        for fn_id in self.fns().ids() {
            let f = self.fns().get(fn_id);
            let proc = self
                .rom_procs()
                .push(crate::data::RomProc { romv: f.romv() });
            f.set_rom_proc(proc);
        }
        Ok(())
    }

    /// Warns when a `goto mode` preserves a group the target mode
    /// excludes.
    fn precheck_finish_mode(&self, mode: FnId) {
        let m = self.fns().get(mode);
        let Some(mode_impl) = m.mode_impl() else {
            return;
        };
        let precheck = m.precheck();
        let mode_name = self.globals().get(m.global).name.clone();

        for (group_id, loc) in mode_impl.incoming_preserved_groups() {
            let group = self.groups().get(group_id);
            let Some(gv) = group.vars() else {
                continue;
            };
            if !precheck.group_vars.test(gv.index() as usize) {
                let includes = if precheck.group_vars.all_clear() {
                    "(no groups)".to_owned()
                } else {
                    format!("vars {}", self.group_vars_names(&precheck.group_vars))
                };
                let mut warning = Diagnostic::warning_at(
                    loc,
                    format!(
                        "preserving {} has no effect as mode {mode_name} is excluding it",
                        group.name
                    ),
                );
                if let Some(mode_loc) = self.globals().get(m.global).loc() {
                    warning = warning.with_note_at(
                        mode_loc,
                        format!("{mode_name} includes: {includes}"),
                    );
                }
                self.push_warning(warning);
            }
        }
    }

    /// Rejects `goto mode` inside an NMI or any of its callees.
    fn precheck_finish_nmi(&self, nmi: FnId) -> Result<()> {
        let n = self.fns().get(nmi);
        let nmi_name = self.globals().get(n.global).name.clone();

        let first_goto_mode = |f: &Func| -> Option<SourceLoc> {
            f.precheck()
                .tracked
                .goto_modes
                .first()
                .map(|(_, stmt_index)| f.def().stmts[*stmt_index].loc.clone())
        };

        if let Some(loc) = first_goto_mode(&n) {
            return Err(CompilerError::at(loc, "goto mode inside nmi"));
        }

        for index in n.precheck().calls.ones() {
            let callee = self
                .fns()
                .get(FnId::from_index(u32::try_from(index).expect("fn index")));
            if let Some(loc) = first_goto_mode(&callee) {
                let err = CompilerError::at(
                    loc,
                    format!("goto mode reachable from nmi {nmi_name}"),
                );
                return Err(match self.globals().get(n.global).loc() {
                    Some(nmi_loc) => {
                        err.with_note_at(nmi_loc, format!("{nmi_name} declared here"))
                    }
                    None => err,
                });
            }
        }
        Ok(())
    }

    /// Compiles one function: IR construction, optimization, dataflow
    /// summarization, byteification, and code generation, with GraphViz
    /// dumps at each stage when enabled.
    pub(crate) fn fn_compile(&self, fn_id: FnId, backend: &dyn Backend) -> Result<()> {
        let f = self.fns().get(fn_id);
        if f.class == FnClass::Ct {
            return Ok(());
        }
        let name = self.globals().get(f.global).name.clone();

        let mut ir = backend.build_ir(self, fn_id)?;
        save_graphs(self, &ir, &name, "1_initial");

        backend.optimize(self, &mut ir, fn_id, false)?;
        save_graphs(self, &ir, &name, "2_o1");

        self.calc_ir_bitsets(fn_id, &ir);

        backend.byteify(self, &mut ir, fn_id)?;
        save_graphs(self, &ir, &name, "3_byteify");

        backend.optimize(self, &mut ir, fn_id, true)?;
        save_graphs(self, &ir, &name, "4_o2");

        backend.code_gen(self, &mut ir, fn_id)?;
        save_graphs(self, &ir, &name, "5_cg");
        Ok(())
    }

    /// Walks every SSA value of a compiled function's IR, producing its
    /// read/write/call/group dataflow summary. Pure: repeated runs over
    /// the same IR produce identical summaries.
    #[must_use]
    pub fn summarize_ir(&self, fn_id: FnId, ir: &Ir) -> IrInfo {
        let f = self.fns().get(fn_id);

        let mut reads = Bitset::new(self.gmembers().len());
        let mut writes = Bitset::new(self.gmembers().len());
        let mut group_vars = Bitset::new(self.group_vars().len());
        let mut deref_groups = Bitset::new(self.groups().len());
        let mut calls = Bitset::new(self.fns().len());
        let mut io_pure = true;
        let mut fences = false;

        // Handle preserved groups:
        for (_, stmt_index) in &f.precheck().tracked.goto_modes {
            if let Some(goto_mods) = f.def().mods_of(*stmt_index) {
                goto_mods.for_each_group_vars(self, |gv| {
                    group_vars.set(gv.index() as usize);
                    reads.union_with(&self.group_vars().get(gv).gmembers());
                });
            }
        }

        // Iterate the IR looking for reads and writes:
        for id in ir.node_ids() {
            let node = ir.node(id);
            let flags = node.op.flags();

            if flags.contains(SsaFlags::IO_IMPURE) {
                io_pure = false;
            }

            if let SsaOp::FnCall(callee_id) = node.op {
                let callee = self.fns().get(callee_id);
                let callee_info = callee.ir_info();
                writes.union_with(&callee_info.writes);
                reads.union_with(&callee_info.reads);
                group_vars.union_with(&callee_info.group_vars);
                calls.union_with(&callee_info.calls);
                calls.set(callee_id.index() as usize);
                io_pure &= callee_info.io_pure;
                fences |= callee_info.fences;
            }

            if flags.contains(SsaFlags::WRITE_GLOBALS) {
                ir.for_each_written_global(id, |value, loc| {
                    if let Some(gmember_id) = loc.gmember() {
                        // Writes only have effect if they're not writing
                        // back a previously read value.
                        let self_write = matches!(value, SsaValue::Node(def)
                            if ir.node(*def).op == SsaOp::ReadGlobal
                                && ir.node(*def).inputs.get(1).and_then(SsaValue::as_locator)
                                    == Some(loc));
                        if !self_write {
                            writes.set(gmember_id.index() as usize);
                            let gvar = self.gvars().get(self.gmembers().get(gmember_id).gvar);
                            group_vars.set(gvar.group_vars.index() as usize);
                        }
                    }
                });
            } else if node.op == SsaOp::ReadGlobal {
                if let Some(loc) = node.inputs.get(1).and_then(SsaValue::as_locator) {
                    if let Some(gmember_id) = loc.gmember() {
                        // Reads only have effect if something actually
                        // uses them:
                        for (consumer_id, input_index) in ir.consumers(id) {
                            let consumer = ir.node(consumer_id);
                            let locator_write = consumer
                                .op
                                .flags()
                                .contains(SsaFlags::WRITE_GLOBALS)
                                && input_index % 2 == 0;
                            let write_back = locator_write
                                && consumer
                                    .inputs
                                    .get(input_index + 1)
                                    .and_then(SsaValue::as_locator)
                                    == Some(loc);
                            if !write_back {
                                reads.set(gmember_id.index() as usize);
                                let gvar =
                                    self.gvars().get(self.gmembers().get(gmember_id).gvar);
                                group_vars.set(gvar.group_vars.index() as usize);
                                break;
                            }
                        }
                    }
                }
            }

            if flags.contains(SsaFlags::INDEXES_PTR) {
                io_pure = false;
                let ptr_type = ir
                    .value_type(&node.inputs[0])
                    .cloned()
                    .unwrap_or(Type::Void);
                for group_id in ptr_type.group_tail() {
                    deref_groups.set(group_id.index() as usize);
                    let group = self.groups().get(*group_id);
                    if let Some(gv) = group.vars() {
                        group_vars.set(gv.index() as usize);
                    }
                }
            }

            if flags.contains(SsaFlags::FENCE) {
                fences = true;
            }
        }

        IrInfo {
            reads,
            writes,
            group_vars,
            deref_groups,
            calls,
            io_pure,
            fences,
        }
    }

    /// Publishes a function's IR summary and, for fence-using functions,
    /// derives its fence read/write sets from its parent modes' NMIs.
    pub(crate) fn calc_ir_bitsets(&self, fn_id: FnId, ir: &Ir) {
        let f = self.fns().get(fn_id);
        let info = self.summarize_ir(fn_id, ir);
        let _ = f.ir_info.set(info);

        if f.precheck().fences {
            let mut reads = Bitset::new(self.gmembers().len());
            let mut writes = Bitset::new(self.gmembers().len());
            for mode in f.parent_modes() {
                let nmi_id = self.fns().get(mode).mode_nmi(self);
                let nmi = self.fns().get(nmi_id);
                let has_dep = self.has_dep(f.global, nmi.global);
                reads.union_with(&nmi.avail_reads(has_dep));
                writes.union_with(&nmi.avail_writes(has_dep));
            }
            let _ = f.fence_sets.set(FenceSets { reads, writes });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FnClass, Func, Lvars, Romv, RomvFlags};
    use crate::ast::FnDef;
    use crate::ir::Locator;
    use crate::pool::{FnId, GlobalId, PoolId};
    use crate::span::Span;
    use crate::types::Type;

    fn bare_fn(class: FnClass) -> Func {
        Func::new(
            GlobalId::from_index(0),
            class,
            Type::Void,
            FnDef::default(),
            None,
        )
    }

    #[test]
    fn lvar_index_spans_own_then_call_lvars() {
        let lvars = Lvars {
            this_lvars: vec![Locator::Const(1), Locator::Const(2)],
            call_lvars: vec![(FnId::from_index(7), Locator::Const(9))],
        };
        assert_eq!(lvars.num_this_lvars(), 2);
        assert_eq!(lvars.num_all_lvars(), 3);
        assert_eq!(lvars.index(&Locator::Const(2)), Some(1));
        assert_eq!(lvars.index(&Locator::Const(9)), Some(2));
        assert_eq!(lvars.index(&Locator::Const(3)), None);
    }

    #[test]
    fn assigned_lvar_spans_read_back_per_plane() {
        let f = bare_fn(FnClass::Fn);
        f.add_romv(RomvFlags::IN_MODE);
        f.assign_lvars(Lvars {
            this_lvars: vec![Locator::Const(0)],
            call_lvars: vec![],
        });
        f.assign_lvar_span(Romv::Mode, 0, Span::new(0x200, 2));

        let ctx = crate::globals::Context::new(crate::options::Options::default());
        assert_eq!(
            f.lvar_span(&ctx, Romv::Mode, 0),
            Some(Span::new(0x200, 2))
        );
        assert_eq!(f.lvar_span(&ctx, Romv::Nmi, 0), Some(Span::default()));
    }

    #[test]
    #[should_panic(expected = "lvar span already assigned")]
    fn double_span_assignment_panics() {
        let f = bare_fn(FnClass::Fn);
        f.add_romv(RomvFlags::IN_MODE);
        f.assign_lvars(Lvars {
            this_lvars: vec![Locator::Const(0)],
            call_lvars: vec![],
        });
        f.assign_lvar_span(Romv::Mode, 0, Span::new(0x200, 2));
        f.assign_lvar_span(Romv::Mode, 0, Span::new(0x300, 2));
    }

    #[test]
    fn mode_and_nmi_class_impls_are_exclusive() {
        assert!(bare_fn(FnClass::Mode).mode_impl().is_some());
        assert!(bare_fn(FnClass::Mode).nmi_impl().is_none());
        assert!(bare_fn(FnClass::Nmi).nmi_impl().is_some());
        assert!(bare_fn(FnClass::Fn).mode_impl().is_none());
    }

    #[test]
    fn romv_planes_map_to_their_flags() {
        assert_eq!(Romv::Mode.flag(), RomvFlags::IN_MODE);
        assert_eq!(Romv::Nmi.flag(), RomvFlags::IN_NMI);
        assert_eq!(Romv::Mode.index(), 0);
        assert_eq!(Romv::Nmi.index(), 1);
    }
}

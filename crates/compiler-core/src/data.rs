//! Variables, constants, gmembers, ROM arrays, and member counting.
//!
//! A variable's gmembers are its primitive leaves, emplaced contiguously
//! during the count-members phase; the gmember is the unit of RAM
//! allocation and dataflow. Initializers interpret during precheck: a
//! PAA initializer becomes a locator vector (interned as a ROM array for
//! constants), and any other initializer becomes a typed value plus its
//! byte-level locator rendering, kept for zero-init detection and ROM
//! emission.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{OnceLock, RwLock};

use diagnostics::{CompilerError, Result, SourceLoc};

use crate::ast::Expr;
use crate::bitset::Bitset;
use crate::fns::RomvFlags;
use crate::globals::{Context, DatumId};
use crate::interface::{Evaluator, Value};
use crate::ir::Locator;
use crate::phase::Phase;
use crate::pool::{
    lock, read_lock, write_lock, GlobalId, GmemberId, GroupDataId, GroupVarsId, GvarId, PoolId,
    RomArrayId,
};
use crate::span::Span;
use crate::structs::flatten_leaves;
use crate::types::{SrcType, Type};

/// Interpreted initializer products of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GvarInit {
    /// The typed value, absent for PAA initializers.
    pub sval: Option<Value>,
    /// Byte-level locator rendering of the initializer.
    pub init_data: Vec<Locator>,
}

/// A RAM variable.
#[derive(Debug)]
pub struct Gvar {
    /// The variable's global.
    pub global: GlobalId,
    src_type: RwLock<SrcType>,
    /// The owning vars group.
    pub group_vars: GroupVarsId,
    /// The unevaluated initializer, when one was written.
    pub init_expr: Option<Expr>,
    init: OnceLock<GvarInit>,
    gmembers: OnceLock<(GmemberId, u32)>,
}

impl Gvar {
    pub(crate) fn new(
        global: GlobalId,
        src_type: SrcType,
        group_vars: GroupVarsId,
        init_expr: Option<Expr>,
    ) -> Self {
        Self {
            global,
            src_type: RwLock::new(src_type),
            group_vars,
            init_expr,
            init: OnceLock::new(),
            gmembers: OnceLock::new(),
        }
    }

    /// The declared type, with whatever resolution has happened so far.
    #[must_use]
    pub fn ty(&self) -> Type {
        read_lock(&self.src_type).ty.clone()
    }

    /// The declared type and location.
    #[must_use]
    pub fn src_type(&self) -> SrcType {
        read_lock(&self.src_type).clone()
    }

    pub(crate) fn with_src_type_mut<R>(&self, f: impl FnOnce(&mut SrcType) -> R) -> R {
        f(&mut write_lock(&self.src_type))
    }

    /// The contiguous gmember range: first id and member count.
    #[must_use]
    pub fn gmember_range(&self) -> Option<(GmemberId, u32)> {
        self.gmembers.get().copied()
    }

    /// The interpreted initializer, once precheck has run.
    #[must_use]
    pub fn init(&self) -> Option<&GvarInit> {
        self.init.get()
    }

    pub(crate) fn set_init(&self, init: GvarInit) {
        let _ = self.init.set(init);
    }

    pub(crate) fn set_gmember_range(&self, begin: GmemberId, count: u32) {
        let _ = self.gmembers.set((begin, count));
    }
}

/// A ROM constant.
#[derive(Debug)]
pub struct Const {
    /// The constant's global.
    pub global: GlobalId,
    src_type: RwLock<SrcType>,
    /// The owning data group, when the constant was declared in one.
    pub group_data: Option<GroupDataId>,
    /// The unevaluated initializer, when one was written.
    pub init_expr: Option<Expr>,
    rom_array: OnceLock<RomArrayId>,
    sval: OnceLock<Value>,
}

impl Const {
    pub(crate) fn new(
        global: GlobalId,
        src_type: SrcType,
        group_data: Option<GroupDataId>,
        init_expr: Option<Expr>,
    ) -> Self {
        Self {
            global,
            src_type: RwLock::new(src_type),
            group_data,
            init_expr,
            rom_array: OnceLock::new(),
            sval: OnceLock::new(),
        }
    }

    /// The declared type, with whatever resolution has happened so far.
    #[must_use]
    pub fn ty(&self) -> Type {
        read_lock(&self.src_type).ty.clone()
    }

    pub(crate) fn with_src_type_mut<R>(&self, f: impl FnOnce(&mut SrcType) -> R) -> R {
        f(&mut write_lock(&self.src_type))
    }

    /// The interned ROM array of a PAA constant.
    #[must_use]
    pub fn rom_array(&self) -> Option<RomArrayId> {
        self.rom_array.get().copied()
    }

    /// The interpreted value of a non-PAA constant.
    #[must_use]
    pub fn sval(&self) -> Option<&Value> {
        self.sval.get()
    }
}

/// One primitive leaf of a variable.
#[derive(Debug)]
pub struct Gmember {
    /// The owning variable.
    pub gvar: GvarId,
    /// Index of this leaf within the variable's members.
    pub member: u32,
    spans: RwLock<Vec<Span>>,
}

impl Gmember {
    pub(crate) fn new(gvar: GvarId, member: u32) -> Self {
        Self {
            gvar,
            member,
            spans: RwLock::new(Vec::new()),
        }
    }

    /// The leaf's type, read out of the owning variable's flattening.
    #[must_use]
    pub fn ty(&self, ctx: &Context) -> Type {
        let gvar = ctx.gvars().get(self.gvar);
        let (types, _) = flatten_gvar(ctx, &gvar.ty());
        types[self.member as usize].clone()
    }

    /// The byte-level locators initializing this leaf, when the owning
    /// variable has an interpreted non-PAA initializer.
    #[must_use]
    pub fn init_bytes(&self, ctx: &Context) -> Option<Vec<Locator>> {
        let gvar = ctx.gvars().get(self.gvar);
        let init = gvar.init()?;
        init.sval.as_ref()?;
        let (types, offsets) = flatten_gvar(ctx, &gvar.ty());
        let offset = offsets[self.member as usize] as usize;
        let size = types[self.member as usize].size_of(ctx);
        Some(init.init_data[offset..offset + size].to_vec())
    }

    /// True when the leaf's initializer is entirely zero bytes. A leaf
    /// with no initializer is not zero-init.
    #[must_use]
    pub fn zero_init(&self, ctx: &Context) -> bool {
        self.init_bytes(ctx)
            .is_some_and(|bytes| bytes.iter().all(|loc| loc.eq_const(0)))
    }

    /// Sizes the per-atom span table; one atom per byte of the leaf.
    pub fn alloc_spans(&self, ctx: &Context) {
        assert!(ctx.phase() >= Phase::AllocRam);
        let mut spans = write_lock(&self.spans);
        assert!(spans.is_empty(), "spans already allocated");
        spans.resize(self.ty(ctx).size_of(ctx), Span::default());
    }

    /// The allocated span of one atom.
    #[must_use]
    pub fn span(&self, atom: usize) -> Span {
        read_lock(&self.spans)[atom]
    }

    /// Records the allocated span of one atom.
    pub fn assign_span(&self, atom: usize, span: Span) {
        write_lock(&self.spans)[atom] = span;
    }
}

fn flatten_gvar(ctx: &Context, ty: &Type) -> (Vec<Type>, Vec<u16>) {
    let mut types = Vec::new();
    let mut offsets = Vec::new();
    let mut offset = 0u16;
    let mut has_tea = false;
    flatten_leaves(ctx, ty, &mut offset, &mut types, &mut offsets, &mut has_tea);
    (types, offsets)
}

/// A content-interned ROM byte array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomArray {
    /// The array's bytes, as locators.
    pub data: Vec<Locator>,
    /// The data group the array was declared in.
    pub group_data: Option<GroupDataId>,
}

/// One function's ROM procedure, tagged with the visibility flags its
/// code must be emitted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomProc {
    /// The accumulated ROM-visibility flags.
    pub romv: RomvFlags,
}

impl Context {
    /// The count-members phase: counts every struct, dethunkifies every
    /// variable's type, emplaces its gmembers contiguously, and builds
    /// each vars group's gmember bitset.
    ///
    /// # Errors
    ///
    /// Propagates type resolution errors.
    pub fn count_members(&self, eval: &dyn Evaluator) -> Result<()> {
        self.phase_cell().advance_to(Phase::CountMembers);

        for id in self.structs().ids() {
            self.struct_count_members(id, eval)?;
        }

        for gvar_id in self.gvars().ids() {
            let gvar = self.gvars().get(gvar_id);
            gvar.with_src_type_mut(|src_type| src_type.dethunkify(self, eval, false))?;

            let num = gvar.ty().num_members(self);
            let begin = GmemberId::from_index(
                u32::try_from(self.gmembers().len()).expect("gmember index overflow"),
            );
            for member in 0..num {
                self.gmembers().push(Gmember::new(gvar_id, member));
            }
            gvar.set_gmember_range(begin, num);
        }

        for gv_id in self.group_vars().ids() {
            let gv = self.group_vars().get(gv_id);
            let mut bitset = Bitset::new(self.gmembers().len());
            for gvar_id in gv.gvars() {
                if let Some((begin, count)) = self.gvars().get(gvar_id).gmember_range() {
                    bitset.set_n(begin.index() as usize, count as usize);
                }
            }
            gv.set_gmembers(bitset);
        }

        Ok(())
    }

    /// Prechecks a var or const: full dethunkify, then initializer
    /// interpretation.
    ///
    /// # Errors
    ///
    /// Propagates type resolution, evaluation, and initializer shape
    /// errors.
    pub(crate) fn datum_precheck(&self, datum: DatumId, eval: &dyn Evaluator) -> Result<()> {
        match datum {
            DatumId::Var(id) => self.gvar_precheck(id, eval),
            DatumId::Const(id) => self.const_precheck(id, eval),
        }
    }

    fn gvar_precheck(&self, id: GvarId, eval: &dyn Evaluator) -> Result<()> {
        let gvar = self.gvars().get(id);
        gvar.with_src_type_mut(|src_type| src_type.dethunkify(self, eval, true))?;
        let Some(init_expr) = &gvar.init_expr else {
            return Ok(());
        };

        let src_type = gvar.src_type();
        if let Type::Paa { len } = src_type.ty {
            let paa = eval.interpret_paa(self, &src_type.loc, init_expr)?;
            let actual = check_paa_len(&src_type, len, paa.len())?;
            gvar.with_src_type_mut(|src_type| src_type.ty = Type::Paa { len: actual });
            gvar.set_init(GvarInit {
                sval: None,
                init_data: paa,
            });
        } else {
            let (refined, value) =
                eval.interpret_expr(self, &src_type.loc, init_expr, &src_type.ty)?;
            gvar.with_src_type_mut(|src_type| src_type.ty = refined.clone());
            let init_data = append_locator_bytes(self, &value, &refined, &src_type.loc)?;
            gvar.set_init(GvarInit {
                sval: Some(value),
                init_data,
            });
        }
        Ok(())
    }

    fn const_precheck(&self, id: crate::pool::ConstId, eval: &dyn Evaluator) -> Result<()> {
        let konst = self.consts().get(id);
        konst.with_src_type_mut(|src_type| src_type.dethunkify(self, eval, true))?;
        let Some(init_expr) = &konst.init_expr else {
            return Ok(());
        };

        let src_type = read_lock(&konst.src_type).clone();
        if let Type::Paa { len } = src_type.ty {
            let paa = eval.interpret_paa(self, &src_type.loc, init_expr)?;
            let actual = check_paa_len(&src_type, len, paa.len())?;
            konst.with_src_type_mut(|src_type| src_type.ty = Type::Paa { len: actual });
            let array = self.intern_rom_array(paa, konst.group_data);
            let _ = konst.rom_array.set(array);
        } else {
            let (refined, value) =
                eval.interpret_expr(self, &src_type.loc, init_expr, &src_type.ty)?;
            konst.with_src_type_mut(|src_type| src_type.ty = refined);
            let _ = konst.sval.set(value);
        }
        Ok(())
    }

    /// Interns a ROM array, deduplicating by content and group.
    pub fn intern_rom_array(
        &self,
        data: Vec<Locator>,
        group_data: Option<GroupDataId>,
    ) -> RomArrayId {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        group_data.hash(&mut hasher);
        let key = hasher.finish();

        let mut map = lock(self.rom_array_map());
        if let Some(&existing) = map.get(&key) {
            let array = self.rom_arrays().get(existing);
            if array.data == data && array.group_data == group_data {
                return existing;
            }
        }
        let id = self.rom_arrays().push(RomArray { data, group_data });
        map.insert(key, id);
        id
    }
}

fn check_paa_len(src_type: &SrcType, declared: u16, actual: usize) -> Result<u16> {
    if declared != 0 && usize::from(declared) != actual {
        return Err(CompilerError::at(
            src_type.loc.clone(),
            format!(
                "length of data ({actual}) does not match its type {}",
                src_type.ty
            ),
        ));
    }
    u16::try_from(actual).map_err(|_| {
        CompilerError::at(
            src_type.loc.clone(),
            format!("data length {actual} out of range"),
        )
    })
}

/// Renders an interpreted value as little-endian byte locators matching
/// the flattened layout of `ty`.
///
/// # Errors
///
/// Returns an initializer shape error on a value/type mismatch.
pub fn append_locator_bytes(
    ctx: &Context,
    value: &Value,
    ty: &Type,
    loc: &SourceLoc,
) -> Result<Vec<Locator>> {
    let mut out = Vec::new();
    append_value(ctx, value, ty, loc, &mut out)?;
    Ok(out)
}

fn append_value(
    ctx: &Context,
    value: &Value,
    ty: &Type,
    loc: &SourceLoc,
    out: &mut Vec<Locator>,
) -> Result<()> {
    match (value, ty) {
        (Value::Int(v), Type::Bool | Type::U8 | Type::S8) => {
            out.push(Locator::Const(int_byte(*v, 0)));
            Ok(())
        }
        (Value::Int(v), Type::U16 | Type::S16) => {
            out.push(Locator::Const(int_byte(*v, 0)));
            out.push(Locator::Const(int_byte(*v, 1)));
            Ok(())
        }
        (Value::List(values), Type::Tea { elem, len }) => {
            if values.len() != usize::from(*len) {
                return Err(shape_error(loc, value, ty));
            }
            for element in values {
                append_value(ctx, element, elem, loc, out)?;
            }
            Ok(())
        }
        (Value::List(values), Type::Struct(id)) => {
            let field_types = ctx.structs().get(*id).field_types();
            if values.len() != field_types.len() {
                return Err(shape_error(loc, value, ty));
            }
            for (element, field_type) in values.iter().zip(&field_types) {
                append_value(ctx, element, field_type, loc, out)?;
            }
            Ok(())
        }
        _ => Err(shape_error(loc, value, ty)),
    }
}

const fn int_byte(value: i64, byte: u32) -> u8 {
    (value >> (byte * 8)) as u8
}

fn shape_error(loc: &SourceLoc, value: &Value, ty: &Type) -> CompilerError {
    CompilerError::at(loc.clone(), format!("initializer {value:?} does not fit type {ty}"))
}

//! Structs: field flattening and member counting.
//!
//! A struct's *members* are its primitive leaves: nested structs
//! recurse, and a TEA field contributes one leaf per element. The count
//! is cached after the count-members phase; the flat leaf-type/offset
//! layout is generated during the struct's precheck.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{OnceLock, RwLock};

use diagnostics::Result;

use crate::globals::Context;
use crate::interface::Evaluator;
use crate::pool::{read_lock, write_lock, GlobalId, StructId};
use crate::types::{SrcType, Type};

const UNCOUNTED: u32 = u32::MAX;

/// A declared struct field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Declared type and location.
    pub src_type: SrcType,
}

/// The flattened layout of a struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// One entry per member leaf, in declaration order.
    pub member_types: Vec<Type>,
    /// Byte offset of each member leaf.
    pub member_offsets: Vec<u16>,
    /// True when any field flattened through a TEA.
    pub has_tea_member: bool,
}

/// A struct definition.
#[derive(Debug)]
pub struct Struct {
    /// The struct's global.
    pub global: GlobalId,
    fields: RwLock<Vec<Field>>,
    num_members: AtomicU32,
    layout: OnceLock<Layout>,
}

impl Struct {
    pub(crate) fn new(global: GlobalId, fields: Vec<Field>) -> Self {
        Self {
            global,
            fields: RwLock::new(fields),
            num_members: AtomicU32::new(UNCOUNTED),
            layout: OnceLock::new(),
        }
    }

    /// The fields, with whatever dethunkification has happened so far.
    #[must_use]
    pub fn fields(&self) -> Vec<Field> {
        read_lock(&self.fields).clone()
    }

    /// The field types only.
    #[must_use]
    pub fn field_types(&self) -> Vec<Type> {
        read_lock(&self.fields)
            .iter()
            .map(|field| field.src_type.ty.clone())
            .collect()
    }

    /// The cached member count.
    ///
    /// # Panics
    ///
    /// Panics before the count-members phase has counted this struct.
    #[must_use]
    pub fn num_members(&self) -> u32 {
        let count = self.num_members.load(Ordering::Acquire);
        assert_ne!(count, UNCOUNTED, "struct members not yet counted");
        count
    }

    /// The flattened layout, once the struct's precheck has run.
    #[must_use]
    pub fn layout(&self) -> Option<&Layout> {
        self.layout.get()
    }
}

impl Context {
    /// Counts a struct's members, recursing into field structs and
    /// multiplying through TEA fields. Idempotent via the cached count.
    pub(crate) fn struct_count_members(&self, id: StructId, eval: &dyn Evaluator) -> Result<u32> {
        let s = self.structs().get(id);
        let cached = s.num_members.load(Ordering::Acquire);
        if cached != UNCOUNTED {
            return Ok(cached);
        }

        {
            let mut fields = write_lock(&s.fields);
            for field in fields.iter_mut() {
                field.src_type.dethunkify(self, eval, false)?;
            }
        }

        let mut count = 0;
        for field in s.fields() {
            count += self.count_type_members(&field.src_type.ty, eval)?;
        }
        s.num_members.store(count, Ordering::Release);
        Ok(count)
    }

    /// Member count of a (dethunkified) type, counting nested structs
    /// on demand.
    pub(crate) fn count_type_members(&self, ty: &Type, eval: &dyn Evaluator) -> Result<u32> {
        Ok(match ty {
            Type::Void => 0,
            Type::Tea { elem, len } => {
                u32::from(*len) * self.count_type_members(elem, eval)?
            }
            Type::Struct(id) => self.struct_count_members(*id, eval)?,
            _ => 1,
        })
    }

    /// Fully dethunkifies a struct's fields and generates its flattened
    /// layout.
    pub(crate) fn struct_precheck(&self, id: StructId, eval: &dyn Evaluator) -> Result<()> {
        let s = self.structs().get(id);
        {
            let mut fields = write_lock(&s.fields);
            for field in fields.iter_mut() {
                field.src_type.dethunkify(self, eval, true)?;
            }
        }

        let mut member_types = Vec::new();
        let mut member_offsets = Vec::new();
        let mut has_tea_member = false;
        let mut offset = 0u16;
        for field in s.fields() {
            flatten_leaves(
                self,
                &field.src_type.ty,
                &mut offset,
                &mut member_types,
                &mut member_offsets,
                &mut has_tea_member,
            );
        }
        let _ = s.layout.set(Layout {
            member_types,
            member_offsets,
            has_tea_member,
        });
        Ok(())
    }
}

/// Flattens a type into its member leaves, appending (type, offset)
/// pairs in declaration order. A TEA emits one leaf per element.
pub(crate) fn flatten_leaves(
    ctx: &Context,
    ty: &Type,
    offset: &mut u16,
    types: &mut Vec<Type>,
    offsets: &mut Vec<u16>,
    has_tea: &mut bool,
) {
    match ty {
        Type::Void => {}
        Type::Tea { elem, len } => {
            *has_tea = true;
            for _ in 0..*len {
                flatten_leaves(ctx, elem, offset, types, offsets, has_tea);
            }
        }
        Type::Struct(id) => {
            let s = ctx.structs().get(*id);
            for field in s.fields() {
                flatten_leaves(ctx, &field.src_type.ty, offset, types, offsets, has_tea);
            }
        }
        _ => {
            types.push(ty.clone());
            offsets.push(*offset);
            let size = u16::try_from(ty.size_of(ctx)).expect("leaf size fits u16");
            *offset = offset.checked_add(size).expect("layout offset overflow");
        }
    }
}

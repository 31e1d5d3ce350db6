//! Groups: named partitions of memory visibility.
//!
//! A group is either a *vars* group (RAM variables) or a *data* group
//! (ROM constants). Group names intern through the global table like any
//! other definition; repeated definitions of the same class merge into
//! one group, while a vars/data conflict is a redefinition error. A group
//! name that is used but never defined is caught at parse-cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use diagnostics::{CompilerError, Result, SourceLoc};

use crate::bitset::Bitset;
use crate::globals::{Context, GlobalKind};
use crate::pool::{lock, ConstId, GlobalId, GroupDataId, GroupId, GroupVarsId, GvarId, PoolId};

/// A group's class with its class-specific record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupClass {
    /// RAM variables.
    Vars(GroupVarsId),
    /// ROM constants.
    Data(GroupDataId),
}

/// A named visibility partition.
#[derive(Debug)]
pub struct Group {
    /// The group's global.
    pub global: GlobalId,
    /// The group's name (including its leading `/`).
    pub name: String,
    class: Mutex<Option<GroupClass>>,
}

impl Group {
    pub(crate) fn new(global: GlobalId, name: String) -> Self {
        Self {
            global,
            name,
            class: Mutex::new(None),
        }
    }

    /// The group's class, once defined.
    #[must_use]
    pub fn class(&self) -> Option<GroupClass> {
        *lock(&self.class)
    }

    /// The vars record, when the group is a vars group.
    #[must_use]
    pub fn vars(&self) -> Option<GroupVarsId> {
        match self.class() {
            Some(GroupClass::Vars(id)) => Some(id),
            _ => None,
        }
    }

    /// The data record, when the group is a data group.
    #[must_use]
    pub fn data(&self) -> Option<GroupDataId> {
        match self.class() {
            Some(GroupClass::Data(id)) => Some(id),
            _ => None,
        }
    }
}

/// A vars group's record: its member variables.
#[derive(Debug)]
pub struct GroupVars {
    /// The owning group.
    pub group: GroupId,
    gvars: Mutex<Vec<GvarId>>,
    has_init: AtomicBool,
    gmembers: Mutex<Bitset>,
}

impl GroupVars {
    pub(crate) fn new(group: GroupId) -> Self {
        Self {
            group,
            gvars: Mutex::new(Vec::new()),
            has_init: AtomicBool::new(false),
            gmembers: Mutex::new(Bitset::default()),
        }
    }

    pub(crate) fn add_gvar(&self, gvar: GvarId) {
        lock(&self.gvars).push(gvar);
    }

    /// Member variables, in definition order.
    #[must_use]
    pub fn gvars(&self) -> Vec<GvarId> {
        lock(&self.gvars).clone()
    }

    /// True when any member variable carries an initializer.
    #[must_use]
    pub fn has_init(&self) -> bool {
        self.has_init.load(Ordering::Acquire)
    }

    /// Records whether any member variable carries an initializer.
    pub(crate) fn determine_has_init(&self, ctx: &Context) {
        let any = self
            .gvars()
            .iter()
            .any(|&gvar| ctx.gvars().get(gvar).init_expr.is_some());
        self.has_init.store(any, Ordering::Release);
    }

    /// The gmembers of every member variable, as a bitset over the
    /// gmember pool. Populated at the end of count-members.
    #[must_use]
    pub fn gmembers(&self) -> Bitset {
        lock(&self.gmembers).clone()
    }

    pub(crate) fn set_gmembers(&self, bitset: Bitset) {
        *lock(&self.gmembers) = bitset;
    }
}

/// A data group's record: its member constants.
#[derive(Debug)]
pub struct GroupData {
    /// The owning group.
    pub group: GroupId,
    consts: Mutex<Vec<ConstId>>,
}

impl GroupData {
    pub(crate) fn new(group: GroupId) -> Self {
        Self {
            group,
            consts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_const(&self, id: ConstId) {
        lock(&self.consts).push(id);
    }

    /// Member constants, in definition order.
    #[must_use]
    pub fn consts(&self) -> Vec<ConstId> {
        lock(&self.consts).clone()
    }
}

/// Group interning and definition. See the module docs for the merge
/// semantics of repeated definitions.
impl Context {
    /// Interns `name` as a group, creating its global and group records
    /// on first sight. The group's class stays undefined until a
    /// definition arrives.
    pub fn lookup_group(&self, loc: SourceLoc, name: &str) -> (GlobalId, GroupId) {
        let global = self.lookup(loc, name);
        let mut map = lock(self.group_map());
        let group = *map.entry(global).or_insert_with(|| {
            self.groups().push(Group::new(global, name.to_owned()))
        });
        (global, group)
    }

    /// Defines (or merges into) a vars group.
    ///
    /// # Errors
    ///
    /// Returns a redefinition error when the name is already a data
    /// group or a non-group global.
    pub fn define_group_vars(&self, loc: SourceLoc, name: &str) -> Result<(GroupId, GroupVarsId)> {
        let (global, group_id) = self.lookup_group(loc.clone(), name);
        let group = self.groups().get(group_id);
        let mut class = lock(&group.class);
        match *class {
            None => {
                self.define(global, loc, Default::default(), Default::default(), |_| {
                    GlobalKind::Group(group_id)
                })?;
                let vars = self.group_vars().push(GroupVars::new(group_id));
                *class = Some(GroupClass::Vars(vars));
                Ok((group_id, vars))
            }
            Some(GroupClass::Vars(vars)) => Ok((group_id, vars)),
            Some(GroupClass::Data(_)) => Err(self.group_class_conflict(&group, loc, "data")),
        }
    }

    /// Defines (or merges into) a data group.
    ///
    /// # Errors
    ///
    /// Returns a redefinition error when the name is already a vars
    /// group or a non-group global.
    pub fn define_group_data(&self, loc: SourceLoc, name: &str) -> Result<(GroupId, GroupDataId)> {
        let (global, group_id) = self.lookup_group(loc.clone(), name);
        let group = self.groups().get(group_id);
        let mut class = lock(&group.class);
        match *class {
            None => {
                self.define(global, loc, Default::default(), Default::default(), |_| {
                    GlobalKind::Group(group_id)
                })?;
                let data = self.group_data().push(GroupData::new(group_id));
                *class = Some(GroupClass::Data(data));
                Ok((group_id, data))
            }
            Some(GroupClass::Data(data)) => Ok((group_id, data)),
            Some(GroupClass::Vars(_)) => Err(self.group_class_conflict(&group, loc, "vars")),
        }
    }

    fn group_class_conflict(&self, group: &Group, loc: SourceLoc, prior: &str) -> CompilerError {
        let err = CompilerError::at(
            loc,
            format!("group {} is already defined as a {prior} group", group.name),
        );
        match self.globals().get(group.global).loc() {
            Some(prior_loc) => err.with_note_at(prior_loc, "previous definition here"),
            None => err,
        }
    }

    /// The dense group-vars index of a group, when it is a vars group.
    #[must_use]
    pub fn group_vars_index(&self, group: GroupId) -> Option<usize> {
        self.groups()
            .get(group)
            .vars()
            .map(|id| id.index() as usize)
    }
}

pub(crate) type GroupMap = HashMap<GlobalId, GroupId>;

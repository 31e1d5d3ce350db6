//! The slice of the AST the driver needs.
//!
//! The parser owns the full grammar; the driver only sees tokens and
//! expressions as opaque payloads for the evaluator, plus the pieces it
//! dispatches on itself: function definitions, `goto mode` statements and
//! their modifier sets, and group lists.

use std::collections::BTreeMap;

use diagnostics::{CompilerError, Result, SourceLoc};

use crate::globals::Context;
use crate::group::GroupClass;
use crate::pool::{GlobalId, GroupId, GroupVarsId};
use crate::types::SrcType;

/// A lexed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Location of the token.
    pub loc: SourceLoc,
    /// Token payload.
    pub kind: TokenKind,
}

/// Token payloads the evaluator interprets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// An integer literal.
    Int(i64),
    /// An identifier.
    Name(String),
}

/// An unevaluated expression: a token sequence plus its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    /// Location of the whole expression.
    pub loc: SourceLoc,
    /// Tokens in source order.
    pub tokens: Vec<Token>,
}

impl Expr {
    /// An expression holding a single integer literal.
    #[must_use]
    pub fn int(loc: SourceLoc, value: i64) -> Self {
        Self {
            loc: loc.clone(),
            tokens: vec![Token {
                loc,
                kind: TokenKind::Int(value),
            }],
        }
    }
}

/// A declared local variable (parameters come first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    /// Declared name.
    pub name: String,
    /// Declared type and its location.
    pub src_type: SrcType,
}

/// Statement payloads the driver dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtKind {
    /// An expression statement (opaque to the driver).
    Expr(Expr),
    /// A `goto mode` control transfer.
    GotoMode {
        /// The target mode's global.
        target: GlobalId,
    },
    /// A `fence` synchronization point.
    Fence,
    /// A `wait nmi` blocking fence.
    WaitNmi,
}

/// A statement with its location and optional modifier set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    /// Statement payload.
    pub kind: StmtKind,
    /// Location of the statement.
    pub loc: SourceLoc,
    /// Index into [`FnDef::mods`] when the statement carries modifiers.
    pub mods: Option<usize>,
}

/// A parsed function definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FnDef {
    /// Parameters, in declaration order.
    pub params: Vec<Local>,
    /// Declared return type.
    pub return_type: Option<SrcType>,
    /// Statements, in source order.
    pub stmts: Vec<Stmt>,
    /// Modifier sets referenced by statements.
    pub mods: Vec<Mods>,
    /// Globals referenced in the body, with the location of one use each.
    pub referenced: Vec<(GlobalId, SourceLoc)>,
}

impl FnDef {
    /// The modifier set attached to statement `stmt_index`, if any.
    #[must_use]
    pub fn mods_of(&self, stmt_index: usize) -> Option<&Mods> {
        self.stmts
            .get(stmt_index)
            .and_then(|stmt| stmt.mods)
            .and_then(|i| self.mods.get(i))
    }

    /// A use location for `global` inside this body, if one was recorded.
    #[must_use]
    pub fn find_global(&self, global: GlobalId) -> Option<&SourceLoc> {
        self.referenced
            .iter()
            .find(|(id, _)| *id == global)
            .map(|(_, loc)| loc)
    }
}

/// A modifier set: declared group lists and the optional NMI reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mods {
    /// Location of the modifier list.
    pub loc: SourceLoc,
    /// True when a `vars(...)` list was written explicitly.
    pub explicit_group_vars: bool,
    /// Listed vars groups, each with the location of its mention.
    pub group_vars: BTreeMap<GroupId, SourceLoc>,
    /// True when a `data(...)` list was written explicitly.
    pub explicit_group_data: bool,
    /// Listed data groups, each with the location of its mention.
    pub group_data: BTreeMap<GroupId, SourceLoc>,
    /// The global named by an `nmi` modifier.
    pub nmi: Option<GlobalId>,
}

impl Mods {
    /// An empty modifier set at `loc`.
    #[must_use]
    pub fn new(loc: SourceLoc) -> Self {
        Self {
            loc,
            explicit_group_vars: false,
            group_vars: BTreeMap::new(),
            explicit_group_data: false,
            group_data: BTreeMap::new(),
            nmi: None,
        }
    }

    /// Checks every listed group against its defined class.
    ///
    /// # Errors
    ///
    /// Returns an error when a group under `vars` was defined as a data
    /// group or vice versa.
    pub fn validate_groups(&self, ctx: &Context) -> Result<()> {
        for (&group_id, loc) in &self.group_vars {
            let group = ctx.groups().get(group_id);
            if !matches!(group.class(), Some(GroupClass::Vars(_))) {
                return Err(CompilerError::at(
                    loc.clone(),
                    format!("{} is not a vars group", group.name),
                ));
            }
        }
        for (&group_id, loc) in &self.group_data {
            let group = ctx.groups().get(group_id);
            if !matches!(group.class(), Some(GroupClass::Data(_))) {
                return Err(CompilerError::at(
                    loc.clone(),
                    format!("{} is not a data group", group.name),
                ));
            }
        }
        Ok(())
    }

    /// Calls `f` with the group-vars id of every listed vars group.
    pub fn for_each_group_vars(&self, ctx: &Context, mut f: impl FnMut(GroupVarsId)) {
        for &group_id in self.group_vars.keys() {
            if let Some(GroupClass::Vars(gv)) = ctx.groups().get(group_id).class() {
                f(gv);
            }
        }
    }
}

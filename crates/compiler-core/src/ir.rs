//! The IR surface the dataflow summarizer walks.
//!
//! The optimizer suite owns the IR's semantics; the driver only needs
//! CFG/SSA iteration, per-op flags, call-target recovery, and the
//! (value, location) pairs of global-writing ops. Locators are the IR's
//! address-type operands: symbolic references to gmembers, ROM arrays,
//! functions, or constant bytes.

use bitflags::bitflags;

use crate::pool::{FnId, GmemberId, PoolId, RomArrayId};
use crate::types::Type;

bitflags! {
    /// Behavior flags of an SSA op.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SsaFlags: u8 {
        /// The op has externally visible effects beyond its operands.
        const IO_IMPURE = 1 << 0;
        /// The op writes globals through (value, locator) input pairs.
        const WRITE_GLOBALS = 1 << 1;
        /// The op dereferences a pointer operand.
        const INDEXES_PTR = 1 << 2;
        /// The op is a synchronization fence.
        const FENCE = 1 << 3;
    }
}

/// SSA op kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsaOp {
    /// SSA phi join.
    Phi,
    /// Value cast.
    Cast,
    /// Two's-complement addition.
    Add,
    /// Call to another function.
    FnCall(FnId),
    /// Read of a global location; input 1 is the locator.
    ReadGlobal,
    /// Write of globals through (value, locator) input pairs.
    WriteGlobals,
    /// Load through a pointer; input 0 is the pointer.
    PtrLoad,
    /// Store through a pointer; input 0 is the pointer.
    PtrStore,
    /// A `fence` synchronization point.
    Fence,
    /// A `wait nmi` blocking fence.
    WaitNmi,
    /// A hardware I/O access.
    Io,
    /// Function return.
    Return,
}

impl SsaOp {
    /// The behavior flags of this op.
    #[must_use]
    pub const fn flags(self) -> SsaFlags {
        match self {
            Self::Phi | Self::Cast | Self::Add | Self::FnCall(_) | Self::ReadGlobal | Self::Return => {
                SsaFlags::empty()
            }
            Self::WriteGlobals => SsaFlags::WRITE_GLOBALS,
            Self::PtrLoad => SsaFlags::INDEXES_PTR,
            Self::PtrStore => SsaFlags::INDEXES_PTR.union(SsaFlags::IO_IMPURE),
            Self::Fence | Self::WaitNmi => SsaFlags::FENCE,
            Self::Io => SsaFlags::IO_IMPURE,
        }
    }
}

/// A symbolic reference to an addressable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// A constant byte.
    Const(u8),
    /// One atom of a gmember.
    Gmember {
        /// The gmember.
        gmember: GmemberId,
        /// Byte atom within the gmember.
        atom: u8,
    },
    /// A function's code address.
    Fn(FnId),
    /// A ROM array's base address.
    RomArray(RomArrayId),
}

impl Locator {
    /// True when the locator is the constant byte `byte`.
    #[must_use]
    pub const fn eq_const(&self, byte: u8) -> bool {
        matches!(self, Self::Const(value) if *value == byte)
    }

    /// The referenced gmember, when there is one.
    #[must_use]
    pub const fn gmember(&self) -> Option<GmemberId> {
        match self {
            Self::Gmember { gmember, .. } => Some(*gmember),
            _ => None,
        }
    }
}

/// Id of an SSA node within one function's IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SsaId(u32);

impl SsaId {
    /// The raw node index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// An SSA operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsaValue {
    /// The result of another node.
    Node(SsaId),
    /// A locator constant.
    Loc(Locator),
    /// A numeric constant.
    Num(u8),
}

impl SsaValue {
    /// The locator payload, when the operand is one.
    #[must_use]
    pub const fn as_locator(&self) -> Option<&Locator> {
        match self {
            Self::Loc(loc) => Some(loc),
            _ => None,
        }
    }
}

/// One SSA node: op, result type, operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsaNode {
    /// Op kind.
    pub op: SsaOp,
    /// Result type.
    pub ty: Type,
    /// Operands.
    pub inputs: Vec<SsaValue>,
}

/// A basic block: node ids in execution order plus successor blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlock {
    /// Nodes in execution order.
    pub nodes: Vec<SsaId>,
    /// Successor block indexes.
    pub succs: Vec<usize>,
}

/// A function's IR: a CFG of basic blocks over a pool of SSA nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ir {
    nodes: Vec<SsaNode>,
    blocks: Vec<BasicBlock>,
}

impl Ir {
    /// Creates an empty IR.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an empty basic block, returning its index.
    pub fn add_block(&mut self) -> usize {
        self.blocks.push(BasicBlock::default());
        self.blocks.len() - 1
    }

    /// Adds a CFG edge from `from` to `to`.
    pub fn add_edge(&mut self, from: usize, to: usize) {
        self.blocks[from].succs.push(to);
    }

    /// Appends a node to `block`, returning its id.
    pub fn add_node(&mut self, block: usize, node: SsaNode) -> SsaId {
        let id = SsaId(u32::try_from(self.nodes.len()).expect("ssa index overflow"));
        self.nodes.push(node);
        self.blocks[block].nodes.push(id);
        id
    }

    /// The node for `id`.
    #[must_use]
    pub fn node(&self, id: SsaId) -> &SsaNode {
        &self.nodes[id.index()]
    }

    /// The basic blocks, in creation order.
    #[must_use]
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// The result type of an operand; `None` for constants.
    #[must_use]
    pub fn value_type(&self, value: &SsaValue) -> Option<&Type> {
        match value {
            SsaValue::Node(id) => Some(&self.node(*id).ty),
            _ => None,
        }
    }

    /// Every (consumer node, input index) edge out of `id`.
    #[must_use]
    pub fn consumers(&self, id: SsaId) -> Vec<(SsaId, usize)> {
        let mut out = Vec::new();
        for (node_index, node) in self.nodes.iter().enumerate() {
            for (input_index, input) in node.inputs.iter().enumerate() {
                if matches!(input, SsaValue::Node(input_id) if *input_id == id) {
                    out.push((SsaId(u32::try_from(node_index).expect("ssa index overflow")), input_index));
                }
            }
        }
        out
    }

    /// Calls `f` with every (value, locator) pair written by a node
    /// flagged [`SsaFlags::WRITE_GLOBALS`]. Inputs are laid out as
    /// consecutive value/locator pairs.
    pub fn for_each_written_global(&self, id: SsaId, mut f: impl FnMut(&SsaValue, &Locator)) {
        let node = self.node(id);
        debug_assert!(node.op.flags().contains(SsaFlags::WRITE_GLOBALS));
        for pair in node.inputs.chunks_exact(2) {
            if let Some(loc) = pair[1].as_locator() {
                f(&pair[0], loc);
            }
        }
    }

    /// Node ids in block order then node order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<SsaId> {
        self.blocks
            .iter()
            .flat_map(|block| block.nodes.iter().copied())
            .collect()
    }
}

/// A gmember locator over atom zero, the common case in the summarizer
/// and its tests.
#[must_use]
pub fn gmember_loc(index: u32) -> Locator {
    Locator::Gmember {
        gmember: GmemberId::from_index(index),
        atom: 0,
    }
}

//! GraphViz dumps of a function's CFG and SSA graph.
//!
//! When the `graphviz` option is on, the compile pipeline writes
//! `cfg__<name>__<suffix>.gv` and `ssa__<name>__<suffix>.gv` into the
//! configured directory, one pair per pipeline stage.

use std::fs::File;
use std::io::{self, Write};

use crate::globals::Context;
use crate::ir::{Ir, SsaValue};

/// Writes the CFG as a GraphViz digraph: one node per basic block, one
/// edge per successor.
///
/// # Errors
///
/// Propagates write errors.
pub fn write_cfg<W: Write>(ir: &Ir, out: &mut W) -> io::Result<()> {
    writeln!(out, "digraph cfg {{")?;
    writeln!(out, "    node [shape=box];")?;
    for (index, block) in ir.blocks().iter().enumerate() {
        writeln!(
            out,
            "    bb{index} [label=\"bb{index} ({} ssa)\"];",
            block.nodes.len()
        )?;
        for succ in &block.succs {
            writeln!(out, "    bb{index} -> bb{succ};")?;
        }
    }
    writeln!(out, "}}")
}

/// Writes the SSA graph as a GraphViz digraph: one node per SSA value,
/// one edge per def-use input.
///
/// # Errors
///
/// Propagates write errors.
pub fn write_ssa<W: Write>(ir: &Ir, out: &mut W) -> io::Result<()> {
    writeln!(out, "digraph ssa {{")?;
    writeln!(out, "    node [shape=ellipse];")?;
    for (block_index, block) in ir.blocks().iter().enumerate() {
        for id in &block.nodes {
            let node = ir.node(*id);
            writeln!(
                out,
                "    ssa{} [label=\"bb{block_index}: {:?}\"];",
                id.index(),
                node.op
            )?;
            for input in &node.inputs {
                if let SsaValue::Node(input_id) = input {
                    writeln!(out, "    ssa{} -> ssa{};", input_id.index(), id.index())?;
                }
            }
        }
    }
    writeln!(out, "}}")
}

/// Emits both dumps for one pipeline stage when the option is on. A
/// file that cannot be opened is skipped with a log message.
pub(crate) fn save_graphs(ctx: &Context, ir: &Ir, name: &str, suffix: &str) {
    if !ctx.options().graphviz {
        return;
    }
    let dir = &ctx.options().graphs_dir;
    if let Err(err) = std::fs::create_dir_all(dir) {
        log::warn!("graphviz: cannot create {}: {err}", dir.display());
        return;
    }
    let dumps: [(&str, fn(&Ir, &mut File) -> io::Result<()>); 2] =
        [("cfg", write_cfg), ("ssa", write_ssa)];
    for (kind, write) in dumps {
        let path = dir.join(format!("{kind}__{name}__{suffix}.gv"));
        match File::create(&path) {
            Ok(mut file) => {
                if let Err(err) = write(ir, &mut file) {
                    log::warn!("graphviz: write to {} failed: {err}", path.display());
                }
            }
            Err(err) => log::warn!("graphviz: cannot open {}: {err}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{write_cfg, write_ssa};
    use crate::ir::{Ir, SsaNode, SsaOp, SsaValue};
    use crate::types::Type;

    fn two_block_ir() -> Ir {
        let mut ir = Ir::new();
        let entry = ir.add_block();
        let exit = ir.add_block();
        ir.add_edge(entry, exit);
        let lhs = ir.add_node(
            entry,
            SsaNode {
                op: SsaOp::Cast,
                ty: Type::U8,
                inputs: vec![SsaValue::Num(1)],
            },
        );
        ir.add_node(
            exit,
            SsaNode {
                op: SsaOp::Return,
                ty: Type::Void,
                inputs: vec![SsaValue::Node(lhs)],
            },
        );
        ir
    }

    #[test]
    fn cfg_dump_contains_blocks_and_edges() {
        let mut out = Vec::new();
        write_cfg(&two_block_ir(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("digraph cfg {"));
        assert!(text.contains("bb0 -> bb1;"));
    }

    #[test]
    fn ssa_dump_contains_def_use_edges() {
        let mut out = Vec::new();
        write_ssa(&two_block_ir(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ssa0 -> ssa1;"));
    }
}

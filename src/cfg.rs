//! Control-flow graphs.
//!
//! Blocks are formed by splitting the linear instruction sequence of a
//! function at *address anchors*: the function entry, every direct
//! branch target, and the fall-through address of every conditional
//! branch. Edges are recorded as block indices. Natural loops are
//! derived from back-edges in the dominator relation.

use crate::disasm;
use crate::error::Result;
use crate::insn::{DecodeMode, Instruction};

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// A basic block: straight-line code with one entry and one exit. Only
/// the final instruction may transfer control.
#[derive(Debug)]
pub struct BasicBlock {
    pub index: usize,
    insns: Vec<Instruction>,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
    /// Loop nesting level; 0 outside any loop.
    pub depth: u32,
    /// Set when the block cannot be safely instrumented (an anchor
    /// collided with the middle of one of its instructions, or the
    /// block is unreachable from the entry).
    pub non_instrumentable: bool,
}

impl BasicBlock {
    #[inline]
    pub fn entry_addr(&self) -> u64 {
        self.insns[0].addr()
    }

    /// Address one past the final instruction.
    #[inline]
    pub fn exit_addr(&self) -> u64 {
        self.insns.last().map(|i| i.next_addr()).unwrap_or(0)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.exit_addr() - self.entry_addr()
    }

    #[inline]
    pub fn in_range(&self, addr: u64) -> bool {
        addr >= self.entry_addr() && addr < self.exit_addr()
    }

    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.insns
    }

    #[inline]
    pub fn instruction_count(&self) -> usize {
        self.insns.len()
    }

    /// Number of probe-eligible memory operations.
    pub fn memory_op_count(&self) -> usize {
        self.insns.iter().filter(|i| i.is_memory_operation()).count()
    }
}

/// A single undivided instruction block, used for free-text regions
/// that decode but get no branch analysis.
#[derive(Debug)]
pub struct CodeBlock {
    base: u64,
    insns: Vec<Instruction>,
}

impl CodeBlock {
    pub(crate) fn new(base: u64, insns: Vec<Instruction>) -> Self {
        CodeBlock { base, insns }
    }

    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.insns
    }

    #[inline]
    pub fn instruction_count(&self) -> usize {
        self.insns.len()
    }
}

/// A natural loop: `head` dominates every member.
#[derive(Debug)]
pub struct Loop {
    pub head: usize,
    pub members: Vec<usize>,
}

/// The flow graph of one function.
#[derive(Debug)]
pub struct FlowGraph {
    pub blocks: Vec<BasicBlock>,
    pub loops: Vec<Loop>,
}

impl FlowGraph {
    #[inline]
    pub fn basic_block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instruction_count()).sum()
    }

    pub fn memory_op_count(&self) -> usize {
        self.blocks.iter().map(|b| b.memory_op_count()).sum()
    }

    pub fn block_at_addr(&self, addr: u64) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.in_range(addr))
    }

    pub fn instruction_at_addr(&self, addr: u64) -> Option<&Instruction> {
        self.blocks
            .iter()
            .find(|b| b.in_range(addr))?
            .instructions()
            .iter()
            .find(|i| i.addr() == addr)
    }
}

/// Decodes `size` bytes at `base` and applies the tail-truncation rule.
///
/// Returns the instructions together with the number of overrun bytes
/// (0 when the object decodes exactly).
pub(crate) fn digest_linear(
    mode: DecodeMode,
    base: u64,
    bytes: &[u8],
    size: usize,
) -> Result<(Vec<Instruction>, u32)> {
    let (mut insns, decoded) = disasm::decode_linear(mode, base, bytes, size)?;
    let mut overrun = 0u32;
    if decoded > size {
        overrun = (decoded - size) as u32;
        if let Some(last) = insns.last_mut() {
            let keep = last.len() - overrun;
            last.truncate(keep);
            #[cfg(feature = "log")]
            log::warn!(
                "[Disasm] instruction at {:#x} exceeds its object by {} bytes, truncating",
                last.addr(),
                overrun
            );
        }
    }
    Ok((insns, overrun))
}

/// Builds the flow graph of a function occupying `size` bytes at
/// `base`.
pub(crate) fn build_flow_graph(
    mode: DecodeMode,
    base: u64,
    bytes: &[u8],
    size: usize,
) -> Result<FlowGraph> {
    let (insns, _overrun) = digest_linear(mode, base, bytes, size)?;
    if insns.is_empty() {
        return Ok(FlowGraph {
            blocks: Vec::new(),
            loops: Vec::new(),
        });
    }
    let end = base + size as u64;

    // Address anchors: entry, in-range branch targets, and the
    // fall-through of every conditional branch.
    let mut anchors: BTreeSet<u64> = BTreeSet::new();
    anchors.insert(base);
    for insn in &insns {
        if let Some(target) = insn.branch_target() {
            if target >= base && target < end {
                anchors.insert(target);
            }
        }
        if insn.is_control() && insn.next_addr() < end {
            anchors.insert(insn.next_addr());
        }
    }

    // An anchor that does not start an instruction landed mid-insn;
    // keep the instruction intact and poison the covering block.
    let starts: BTreeSet<u64> = insns.iter().map(|i| i.addr()).collect();
    let mut poisoned: Vec<u64> = Vec::new();
    anchors.retain(|a| {
        if starts.contains(a) {
            true
        } else {
            poisoned.push(*a);
            false
        }
    });
    #[cfg(feature = "log")]
    for addr in &poisoned {
        log::warn!(
            "[Cfg] branch target {addr:#x} falls inside an instruction, keeping it intact"
        );
    }

    // Split at anchors and after control transfers.
    let mut blocks: Vec<BasicBlock> = Vec::new();
    let mut current: Vec<Instruction> = Vec::new();
    for insn in insns {
        if !current.is_empty() && anchors.contains(&insn.addr()) {
            blocks.push(make_block(blocks.len(), core::mem::take(&mut current)));
        }
        let is_control = insn.is_control();
        current.push(insn);
        if is_control {
            blocks.push(make_block(blocks.len(), core::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        blocks.push(make_block(blocks.len(), current));
    }

    for addr in poisoned {
        if let Some(block) = blocks.iter_mut().find(|b| b.in_range(addr)) {
            block.non_instrumentable = true;
        }
    }

    connect_edges(&mut blocks, base, end);
    mark_unreachable(&mut blocks);
    let loops = build_loops(&mut blocks);

    Ok(FlowGraph { blocks, loops })
}

fn make_block(index: usize, insns: Vec<Instruction>) -> BasicBlock {
    BasicBlock {
        index,
        insns,
        preds: Vec::new(),
        succs: Vec::new(),
        depth: 0,
        non_instrumentable: false,
    }
}

fn connect_edges(blocks: &mut [BasicBlock], base: u64, end: u64) {
    let entry_of: Vec<u64> = blocks.iter().map(|b| b.entry_addr()).collect();
    let index_of = |addr: u64| entry_of.iter().position(|a| *a == addr);

    let mut edges: Vec<(usize, usize)> = Vec::new();
    for (i, block) in blocks.iter().enumerate() {
        let Some(last) = block.insns.last() else {
            continue;
        };
        let falls_through = !last.is_unconditional_branch() && !last.is_return();
        if falls_through && last.next_addr() < end {
            if let Some(j) = index_of(last.next_addr()) {
                edges.push((i, j));
            }
        }
        if last.is_control() && !last.is_call() {
            if let Some(target) = last.branch_target() {
                if target >= base && target < end {
                    if let Some(j) = index_of(target) {
                        edges.push((i, j));
                    }
                }
            }
        }
    }
    for (from, to) in edges {
        if !blocks[from].succs.contains(&to) {
            blocks[from].succs.push(to);
        }
        if !blocks[to].preds.contains(&from) {
            blocks[to].preds.push(from);
        }
    }
}

fn mark_unreachable(blocks: &mut [BasicBlock]) {
    if blocks.is_empty() {
        return;
    }
    let mut seen = alloc::vec![false; blocks.len()];
    let mut stack = alloc::vec![0usize];
    seen[0] = true;
    while let Some(i) = stack.pop() {
        for &s in &blocks[i].succs {
            if !seen[s] {
                seen[s] = true;
                stack.push(s);
            }
        }
    }
    for (i, block) in blocks.iter_mut().enumerate() {
        if !seen[i] {
            block.non_instrumentable = true;
            #[cfg(feature = "log")]
            log::warn!(
                "[Cfg] block at {:#x} unreachable from the function entry",
                block.entry_addr()
            );
        }
    }
}

/// Computes dominators, finds back-edges, forms natural loops, and
/// assigns per-block nesting depth.
fn build_loops(blocks: &mut [BasicBlock]) -> Vec<Loop> {
    let n = blocks.len();
    if n == 0 {
        return Vec::new();
    }

    // Iterative dominator sets over block bitmasks would be overkill;
    // functions here are small enough for the quadratic fixpoint.
    let mut dom: Vec<BTreeSet<usize>> = Vec::with_capacity(n);
    let all: BTreeSet<usize> = (0..n).collect();
    for i in 0..n {
        if i == 0 {
            dom.push([0].into_iter().collect());
        } else {
            dom.push(all.clone());
        }
    }
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..n {
            let mut new: Option<BTreeSet<usize>> = None;
            for &p in &blocks[i].preds {
                new = Some(match new {
                    None => dom[p].clone(),
                    Some(acc) => acc.intersection(&dom[p]).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(i);
            if new != dom[i] {
                dom[i] = new;
                changed = true;
            }
        }
    }

    let mut loops: Vec<Loop> = Vec::new();
    for u in 0..n {
        for &v in &blocks[u].succs {
            if dom[u].contains(&v) {
                // Back edge u -> v; collect the natural loop body.
                let mut members: BTreeSet<usize> = [v, u].into_iter().collect();
                let mut stack = alloc::vec![u];
                while let Some(x) = stack.pop() {
                    if x == v {
                        continue;
                    }
                    for &p in &blocks[x].preds {
                        if members.insert(p) {
                            stack.push(p);
                        }
                    }
                }
                loops.push(Loop {
                    head: v,
                    members: members.into_iter().collect(),
                });
            }
        }
    }

    for l in &loops {
        for &m in &l.members {
            blocks[m].depth += 1;
        }
    }
    loops
}

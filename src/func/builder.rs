//! Builder pattern for programmatic construction of raw functions.
//!
//! This module provides a closure-based API for building pre-SSA
//! functions without the boilerplate of manual block/varnode management.
//! It is useful for:
//!
//! - Writing unit tests for heritage and rewrite rules
//! - Hosts that lift elsewhere and hand the core a finished op stream
//!
//! Blocks are defined inside a single expression, keeping the CFG
//! structure visually clear:
//!
//! ```rust,ignore
//! let fd = FunctionBuilder::new(&arch, 0x1000).build_with(|f| {
//!     f.block(0, |b| {
//!         b.copy(r0, Operand::Const(7));
//!         b.branch(0x2000);
//!     });
//!     f.block(1, |b| b.ret(Some(Operand::Storage(r0))));
//!     f.edge(0, 1);
//! });
//! ```
//!
//! Every operand use materializes a fresh free varnode, exactly as the
//! translator boundary does; run heritage to link the result into SSA.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{
    address::{Address, VarnodeData},
    cfg::BlockId,
    func::{Funcdata, FunctionFlags},
    ir::{OpId, VarnodeFlags},
    opcodes::OpCode,
    program::Architecture,
};

/// An operand of a raw operation under construction.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    /// A storage location; each use becomes a fresh free varnode.
    Storage(VarnodeData),
    /// A constant value; sized by context.
    Const(u64),
}

/// Builder for constructing raw functions programmatically.
pub struct FunctionBuilder {
    fd: Funcdata,
    blocks: FxHashMap<usize, BlockId>,
}

impl FunctionBuilder {
    /// Creates a builder for a function entered at `entry_offset` in the
    /// code space.
    #[must_use]
    pub fn new(arch: &Arc<Architecture>, entry_offset: u64) -> Self {
        let entry = arch.code_address(entry_offset);
        Self {
            fd: Funcdata::new("built", entry, arch.clone()),
            blocks: FxHashMap::default(),
        }
    }

    fn block_id(&mut self, id: usize) -> BlockId {
        if let Some(&bid) = self.blocks.get(&id) {
            return bid;
        }
        let bid = self.fd.graph.new_block(None);
        self.blocks.insert(id, bid);
        bid
    }

    /// Builds the function using a closure that defines all blocks.
    #[must_use]
    pub fn build_with(mut self, f: impl FnOnce(&mut FunctionBuilder)) -> Funcdata {
        f(&mut self);
        if let Some(&entry) = self.blocks.get(&0) {
            self.fd.graph.set_entry(entry);
        }
        self.fd.set_function_flag(FunctionFlags::BLOCKS_GENERATED);
        if self.fd.graph.num_blocks() > 0 {
            self.fd.graph.calc_dominators();
            self.fd.graph.calc_loop_depth();
        }
        self.fd
    }

    /// Defines (or extends) block `id` through a cursor closure.
    pub fn block(&mut self, id: usize, f: impl FnOnce(&mut BlockCursor<'_>)) {
        let bid = self.block_id(id);
        let pc = self
            .fd
            .graph
            .block(bid)
            .range()
            .map_or(self.fd.entry(), |(start, _)| start);
        let mut cursor = BlockCursor {
            fd: &mut self.fd,
            block: bid,
            pc,
        };
        f(&mut cursor);
    }

    /// Adds a control-flow edge between two declared blocks.
    pub fn edge(&mut self, from: usize, to: usize) {
        let f = self.block_id(from);
        let t = self.block_id(to);
        self.fd.graph.add_edge(f, t);
    }
}

/// Cursor appending operations to one block.
pub struct BlockCursor<'a> {
    fd: &'a mut Funcdata,
    block: BlockId,
    pc: Address,
}

impl BlockCursor<'_> {
    fn materialize(&mut self, operand: Operand, size: u32) -> crate::ir::VarnodeId {
        match operand {
            Operand::Storage(data) => self.fd.store.new_varnode(data.size, data.addr),
            Operand::Const(value) => self.fd.store.new_constant(size, value),
        }
    }

    fn advance(&mut self) -> Address {
        let pc = self.pc;
        self.pc = self.pc.add_wrap(4);
        pc
    }

    fn append(&mut self, op: OpId) {
        self.fd
            .op_insert_end(op, self.block)
            .expect("builder insertion cannot fail");
    }

    /// Appends `dest = COPY src`.
    pub fn copy(&mut self, dest: VarnodeData, src: Operand) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(OpCode::Copy, 1, pc);
        let vn = self.materialize(src, dest.size);
        self.fd.store.set_input(op, vn, 0).expect("fresh slot");
        self.fd
            .store
            .new_varnode_out(dest.size, dest.addr, op)
            .expect("fresh output");
        self.append(op);
        op
    }

    /// Appends `dest = opcode a, b`.
    pub fn binop(&mut self, opcode: OpCode, dest: VarnodeData, a: Operand, b: Operand) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(opcode, 2, pc);
        let va = self.materialize(a, dest.size);
        let vb = self.materialize(b, dest.size);
        self.fd.store.set_input(op, va, 0).expect("fresh slot");
        self.fd.store.set_input(op, vb, 1).expect("fresh slot");
        self.fd
            .store
            .new_varnode_out(dest.size, dest.addr, op)
            .expect("fresh output");
        self.append(op);
        op
    }

    /// Appends `dest = opcode a`.
    pub fn unop(&mut self, opcode: OpCode, dest: VarnodeData, a: Operand) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(opcode, 1, pc);
        let va = self.materialize(a, dest.size);
        self.fd.store.set_input(op, va, 0).expect("fresh slot");
        self.fd
            .store
            .new_varnode_out(dest.size, dest.addr, op)
            .expect("fresh output");
        self.append(op);
        op
    }

    /// Appends `dest = LOAD ptr` from the code space.
    pub fn load(&mut self, dest: VarnodeData, ptr: Operand) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(OpCode::Load, 2, pc);
        let space = self.fd.arch().code_space();
        let space_vn = self.fd.store.new_constant(8, u64::from(space.0));
        self.fd.store.set_input(op, space_vn, 0).expect("fresh slot");
        let vp = self.materialize(ptr, 8);
        self.fd.store.set_input(op, vp, 1).expect("fresh slot");
        self.fd
            .store
            .new_varnode_out(dest.size, dest.addr, op)
            .expect("fresh output");
        self.append(op);
        op
    }

    /// Appends an unconditional branch to a code offset.
    pub fn branch(&mut self, target_offset: u64) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(OpCode::Branch, 1, pc);
        let target = self.fd.arch().code_address(target_offset);
        let dest = self.fd.store.new_varnode(8, target);
        self.fd.store.var_mut(dest).set_flag(VarnodeFlags::ANNOTATION);
        self.fd.store.set_input(op, dest, 0).expect("fresh slot");
        self.append(op);
        op
    }

    /// Appends a conditional branch on `cond` to a code offset; the
    /// fall-through is the block's out-edge 0.
    pub fn cbranch(&mut self, target_offset: u64, cond: Operand) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(OpCode::CBranch, 2, pc);
        let target = self.fd.arch().code_address(target_offset);
        let dest = self.fd.store.new_varnode(8, target);
        self.fd.store.var_mut(dest).set_flag(VarnodeFlags::ANNOTATION);
        self.fd.store.set_input(op, dest, 0).expect("fresh slot");
        let vc = self.materialize(cond, 1);
        self.fd.store.set_input(op, vc, 1).expect("fresh slot");
        self.append(op);
        op
    }

    /// Appends an indirect branch through a computed target.
    pub fn branchind(&mut self, target: Operand) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(OpCode::BranchInd, 1, pc);
        let vt = self.materialize(target, 8);
        self.fd.store.set_input(op, vt, 0).expect("fresh slot");
        self.append(op);
        op
    }

    /// Appends a call to a code offset.
    pub fn call(&mut self, target_offset: u64) -> OpId {
        let pc = self.advance();
        let op = self.fd.store.new_op(OpCode::Call, 1, pc);
        let target = self.fd.arch().code_address(target_offset);
        let dest = self.fd.store.new_varnode(8, target);
        self.fd.store.var_mut(dest).set_flag(VarnodeFlags::ANNOTATION);
        self.fd.store.set_input(op, dest, 0).expect("fresh slot");
        self.append(op);
        op
    }

    /// Appends a return, optionally carrying a value.
    pub fn ret(&mut self, value: Option<Operand>) -> OpId {
        let pc = self.advance();
        let num_inputs = 1 + usize::from(value.is_some());
        let op = self.fd.store.new_op(OpCode::Return, num_inputs, pc);
        let ret_addr = self.fd.store.new_constant(8, 0);
        self.fd.store.set_input(op, ret_addr, 0).expect("fresh slot");
        if let Some(v) = value {
            let vn = self.materialize(v, 8);
            self.fd.store.set_input(op, vn, 1).expect("fresh slot");
        }
        self.append(op);
        op
    }
}

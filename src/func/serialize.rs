//! Persistence of a function's analysis state.
//!
//! The persisted form is a nested document: function identity, prototype,
//! local-scope symbols, jump tables, overrides, and optionally the full
//! p-code tree, one entry per alive operation. Operations reference
//! varnodes by storage plus, for written varnodes, the defining sequence
//! number. String-keyed tags exist only at this boundary.

use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, VarnodeData},
    cfg::BlockId,
    error::invariant_error,
    func::{proto::FuncProto, Funcdata, FunctionFlags, JumpTable},
    ir::{OpId, SeqNum, VarnodeId},
    opcodes::OpCode,
    program::Architecture,
    symbols::ScopeLocal,
    translate::FlowOverride,
    Result,
};
use std::sync::Arc;

/// A varnode reference inside an operation document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDoc {
    /// Storage descriptor.
    pub storage: VarnodeData,
    /// Defining sequence number for written varnodes.
    pub def: Option<SeqNum>,
    /// `true` for function inputs.
    pub input: bool,
}

/// One alive operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDoc {
    /// Operation code.
    pub opcode: OpCode,
    /// Sequence number.
    pub seq: SeqNum,
    /// Output reference, if bound.
    pub output: Option<VarDoc>,
    /// Input references in slot order.
    pub inputs: Vec<Option<VarDoc>>,
}

/// One basic block with its operations and edges.
///
/// Both edge lists are slot-ordered: out-edge order distinguishes
/// fall-through from taken, in-edge order aligns with phi operands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDoc {
    /// Covered instruction address range.
    pub range: Option<(Address, Address)>,
    /// Operations in block order.
    pub ops: Vec<OpDoc>,
    /// Out-edges as indices into the block list, in slot order.
    pub out_edges: Vec<usize>,
    /// In-edges as indices into the block list, in slot order.
    pub in_edges: Vec<usize>,
}

/// The persisted analysis state of one function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDoc {
    /// Function name.
    pub name: String,
    /// Entry address.
    pub entry: Address,
    /// Body size in bytes.
    pub size: u64,
    /// Recovered prototype.
    pub proto: FuncProto,
    /// Local scope symbols.
    pub scope: ScopeLocal,
    /// Recovered jump tables.
    pub jump_tables: Vec<JumpTable>,
    /// Installed flow overrides.
    pub overrides: Vec<(Address, FlowOverride)>,
    /// The p-code tree; omitted when only the prototype and listing are
    /// wanted.
    pub tree: Option<Vec<BlockDoc>>,
}

impl Funcdata {
    fn var_doc(&self, vn: VarnodeId) -> VarDoc {
        let v = self.store.var(vn);
        VarDoc {
            storage: v.storage(),
            def: v.def().map(|d| self.store.op(d).seq()),
            input: v.is_input(),
        }
    }

    /// Serializes the function's analysis state.
    ///
    /// With `save_tree` the full p-code tree is included; otherwise only
    /// identity, prototype, scope, jump tables, and overrides.
    #[must_use]
    pub fn save_doc(&self, save_tree: bool) -> FunctionDoc {
        let tree = save_tree.then(|| {
            let blocks: Vec<BlockId> = self.graph.iter_blocks().collect();
            let index_of = |id: BlockId| blocks.iter().position(|&b| b == id).unwrap_or(0);
            blocks
                .iter()
                .map(|&bid| {
                    let block = self.graph.block(bid);
                    BlockDoc {
                        range: block.range(),
                        ops: block
                            .ops()
                            .iter()
                            .map(|&op_id| {
                                let op = self.store.op(op_id);
                                OpDoc {
                                    opcode: op.opcode(),
                                    seq: op.seq(),
                                    output: op.output().map(|o| self.var_doc(o)),
                                    inputs: op
                                        .inputs()
                                        .iter()
                                        .map(|i| i.map(|vn| self.var_doc(vn)))
                                        .collect(),
                                }
                            })
                            .collect(),
                        out_edges: block.outs().iter().map(|&s| index_of(s)).collect(),
                        in_edges: block.intos().iter().map(|&s| index_of(s)).collect(),
                    }
                })
                .collect()
        });
        FunctionDoc {
            name: self.name().to_string(),
            entry: self.entry(),
            size: self.size(),
            proto: self.proto().clone(),
            scope: self.scope().clone(),
            jump_tables: self.jump_tables.clone(),
            overrides: {
                let mut list: Vec<(Address, FlowOverride)> = self
                    .flow_overrides()
                    .iter()
                    .map(|(&a, &o)| (a, o))
                    .collect();
                list.sort_by_key(|(a, _)| *a);
                list
            },
            tree,
        }
    }

    /// Serializes to a JSON string.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures.
    pub fn save_json(&self, save_tree: bool) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.save_doc(save_tree))?)
    }

    /// Restores a function from its persisted state.
    ///
    /// Creation indices are relabeled; everything else is structurally
    /// identical to the saved function.
    ///
    /// # Errors
    ///
    /// Fails on dangling definition references or linkage inconsistency.
    pub fn restore_doc(doc: &FunctionDoc, arch: Arc<Architecture>) -> Result<Funcdata> {
        let mut fd = Funcdata::new(&doc.name, doc.entry, arch);
        fd.set_size(doc.size);
        fd.proto = doc.proto.clone();
        let mut scope = doc.scope.clone();
        scope.rebuild_name_index();
        fd.scope = scope;
        fd.jump_tables = doc.jump_tables.clone();
        for &(addr, over) in &doc.overrides {
            fd.set_flow_override(addr, over);
        }

        let Some(tree) = &doc.tree else {
            return Ok(fd);
        };

        // Pass 1: blocks, ops, and their outputs
        let mut block_ids: Vec<BlockId> = Vec::with_capacity(tree.len());
        let mut outputs: rustc_hash::FxHashMap<SeqNum, VarnodeId> =
            rustc_hash::FxHashMap::default();
        let mut op_ids: Vec<Vec<OpId>> = Vec::with_capacity(tree.len());
        for block_doc in tree {
            let bid = fd.graph.new_block(block_doc.range);
            let mut ids = Vec::with_capacity(block_doc.ops.len());
            for op_doc in &block_doc.ops {
                let op = fd
                    .store
                    .new_op_seq(op_doc.opcode, op_doc.inputs.len(), op_doc.seq);
                if let Some(out) = &op_doc.output {
                    let vn =
                        fd.store
                            .new_varnode_out(out.storage.size, out.storage.addr, op)?;
                    outputs.insert(op_doc.seq, vn);
                }
                ids.push(op);
            }
            block_ids.push(bid);
            op_ids.push(ids);
        }

        // Pass 2: edges, interleaved so both out-slot and in-slot orders
        // are reproduced exactly
        let n = tree.len();
        let mut out_pos = vec![0usize; n];
        let mut in_pos = vec![0usize; n];
        let mut remaining: usize = tree.iter().map(|b| b.out_edges.len()).sum();
        while remaining > 0 {
            let mut progressed = false;
            for i in 0..n {
                while out_pos[i] < tree[i].out_edges.len() {
                    let to = tree[i].out_edges[out_pos[i]];
                    if to >= n {
                        return Err(invariant_error!("edge to missing block {to}"));
                    }
                    if in_pos[to] < tree[to].in_edges.len() && tree[to].in_edges[in_pos[to]] == i {
                        fd.graph.add_edge(block_ids[i], block_ids[to]);
                        out_pos[i] += 1;
                        in_pos[to] += 1;
                        remaining -= 1;
                        progressed = true;
                    } else {
                        break;
                    }
                }
            }
            if !progressed {
                return Err(invariant_error!("inconsistent edge slot ordering"));
            }
        }

        // Pass 3: inputs resolved against outputs and shared input
        // varnodes
        let mut inputs: rustc_hash::FxHashMap<VarnodeData, VarnodeId> =
            rustc_hash::FxHashMap::default();
        let constant_space = fd.store.constant_space();
        for (i, block_doc) in tree.iter().enumerate() {
            for (j, op_doc) in block_doc.ops.iter().enumerate() {
                let op = op_ids[i][j];
                for (slot, input_doc) in op_doc.inputs.iter().enumerate() {
                    let Some(input_doc) = input_doc else { continue };
                    let vn = if let Some(def_seq) = input_doc.def {
                        *outputs.get(&def_seq).ok_or_else(|| {
                            invariant_error!("input references unknown definition {def_seq}")
                        })?
                    } else if input_doc.input {
                        match inputs.get(&input_doc.storage) {
                            Some(&vn) => vn,
                            None => {
                                let vn = fd
                                    .store
                                    .new_varnode(input_doc.storage.size, input_doc.storage.addr);
                                let vn = fd.store.mark_input(vn)?;
                                inputs.insert(input_doc.storage, vn);
                                vn
                            }
                        }
                    } else if input_doc.storage.addr.space == constant_space {
                        fd.store
                            .new_constant(input_doc.storage.size, input_doc.storage.addr.offset)
                    } else {
                        fd.store
                            .new_varnode(input_doc.storage.size, input_doc.storage.addr)
                    };
                    fd.store.set_input(op, vn, slot)?;
                }
                fd.op_insert_end(op, block_ids[i])?;
            }
        }

        fd.set_function_flag(FunctionFlags::BLOCKS_GENERATED);
        Ok(fd)
    }

    /// Restores from a JSON string.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON or structural inconsistency.
    pub fn restore_json(json: &str, arch: Arc<Architecture>) -> Result<Funcdata> {
        let doc: FunctionDoc = serde_json::from_str(json)?;
        Self::restore_doc(&doc, arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arch;

    fn sample_function() -> Funcdata {
        let arch = test_arch();
        let mut fd = Funcdata::new("sample", arch.code_address(0x1000), arch.clone());
        let b0 = fd.graph.new_block(Some((
            arch.code_address(0x1000),
            arch.code_address(0x1008),
        )));
        let b1 = fd.graph.new_block(Some((
            arch.code_address(0x1008),
            arch.code_address(0x100c),
        )));
        fd.graph.add_edge(b0, b1);
        let pc = arch.code_address(0x1000);

        let x = fd.store.new_varnode(4, arch.register_address(0x10));
        let x = fd.store.mark_input(x).unwrap();
        let add = fd.store.new_op(OpCode::IntAdd, 2, pc);
        fd.store.set_input(add, x, 0).unwrap();
        let c = fd.store.new_constant(4, 5);
        fd.store.set_input(add, c, 1).unwrap();
        let sum = fd
            .store
            .new_varnode_out(4, arch.register_address(0x18), add)
            .unwrap();
        fd.op_insert_end(add, b0).unwrap();

        let ret = fd.store.new_op(OpCode::Return, 1, arch.code_address(0x1008));
        fd.store.set_input(ret, sum, 0).unwrap();
        fd.op_insert_end(ret, b1).unwrap();

        fd.set_function_flag(FunctionFlags::BLOCKS_GENERATED);
        fd.set_size(12);
        fd
    }

    #[test]
    fn test_round_trip_structural_equality() {
        let fd = sample_function();
        let doc = fd.save_doc(true);
        let restored = Funcdata::restore_doc(&doc, fd.arch().clone()).unwrap();
        restored.verify_integrity().unwrap();

        // Serialize then deserialize yields a structurally equal function
        let doc2 = restored.save_doc(true);
        assert_eq!(doc.name, doc2.name);
        assert_eq!(doc.entry, doc2.entry);
        assert_eq!(doc.size, doc2.size);
        assert_eq!(doc.tree, doc2.tree);
    }

    #[test]
    fn test_round_trip_through_json() {
        let fd = sample_function();
        let json = fd.save_json(true).unwrap();
        let restored = Funcdata::restore_json(&json, fd.arch().clone()).unwrap();
        let json2 = restored.save_json(true).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn test_save_without_tree() {
        let fd = sample_function();
        let doc = fd.save_doc(false);
        assert!(doc.tree.is_none());
        let restored = Funcdata::restore_doc(&doc, fd.arch().clone()).unwrap();
        assert_eq!(restored.name(), "sample");
        assert_eq!(restored.graph().num_blocks(), 0);
    }

    #[test]
    fn test_overrides_survive() {
        let mut fd = sample_function();
        fd.set_flow_override(
            fd.arch().code_address(0x1004),
            FlowOverride::NoReturn,
        );
        let doc = fd.save_doc(false);
        let restored = Funcdata::restore_doc(&doc, fd.arch().clone()).unwrap();
        assert_eq!(
            restored.flow_override(fd.arch().code_address(0x1004)),
            Some(FlowOverride::NoReturn)
        );
    }
}

//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use relift::{
    address::{Address, SpaceId, VarnodeData},
    program::{Architecture, ProtoModel},
    translate::RawOp,
    OpCode,
};

/// Builds the standard test architecture: return value and call-kill in
/// register 0x0, parameters in registers 0x20 and 0x28.
///
/// Space ids follow builder order: const, unique, iop, then register.
pub fn arch() -> Arc<Architecture> {
    let reg = |offset: u64, size: u32| VarnodeData::new(Address::new(SpaceId(3), offset), size);
    let model = ProtoModel {
        name: "default".to_string(),
        killed_by_call: vec![reg(0x0, 8)],
        param_locations: vec![reg(0x20, 8), reg(0x28, 8)],
        return_location: Some(reg(0x0, 8)),
    };
    Architecture::builder().model(model).build().unwrap()
}

/// Register storage helper.
pub fn reg(arch: &Arc<Architecture>, offset: u64, size: u32) -> VarnodeData {
    VarnodeData::new(arch.register_address(offset), size)
}

/// Constant storage helper.
pub fn konst(arch: &Arc<Architecture>, value: u64, size: u32) -> VarnodeData {
    VarnodeData::new(Address::new(arch.spaces().constant_space(), value), size)
}

/// Code-reference helper.
pub fn code(arch: &Arc<Architecture>, offset: u64) -> VarnodeData {
    VarnodeData::new(arch.code_address(offset), 8)
}

/// Raw COPY op.
pub fn raw_copy(dest: VarnodeData, src: VarnodeData) -> RawOp {
    RawOp {
        opcode: OpCode::Copy,
        output: Some(dest),
        inputs: vec![src],
    }
}

/// Raw binary op.
pub fn raw_binop(opcode: OpCode, dest: VarnodeData, a: VarnodeData, b: VarnodeData) -> RawOp {
    RawOp {
        opcode,
        output: Some(dest),
        inputs: vec![a, b],
    }
}

/// Raw LOAD through the code space.
pub fn raw_load(arch: &Arc<Architecture>, dest: VarnodeData, ptr: VarnodeData) -> RawOp {
    RawOp {
        opcode: OpCode::Load,
        output: Some(dest),
        inputs: vec![konst(arch, u64::from(arch.code_space().0), 8), ptr],
    }
}

/// Raw unconditional branch.
pub fn raw_branch(arch: &Arc<Architecture>, target: u64) -> RawOp {
    RawOp {
        opcode: OpCode::Branch,
        output: None,
        inputs: vec![code(arch, target)],
    }
}

/// Raw conditional branch.
pub fn raw_cbranch(arch: &Arc<Architecture>, target: u64, cond: VarnodeData) -> RawOp {
    RawOp {
        opcode: OpCode::CBranch,
        output: None,
        inputs: vec![code(arch, target), cond],
    }
}

/// Raw indirect branch.
pub fn raw_branchind(target: VarnodeData) -> RawOp {
    RawOp {
        opcode: OpCode::BranchInd,
        output: None,
        inputs: vec![target],
    }
}

/// Raw return carrying a value.
pub fn raw_ret(arch: &Arc<Architecture>, value: VarnodeData) -> RawOp {
    RawOp {
        opcode: OpCode::Return,
        output: None,
        inputs: vec![konst(arch, 0, 8), value],
    }
}

/// Raw void return.
pub fn raw_ret_void(arch: &Arc<Architecture>) -> RawOp {
    RawOp {
        opcode: OpCode::Return,
        output: None,
        inputs: vec![konst(arch, 0, 8)],
    }
}

//! The fixed set of p-code operation codes.
//!
//! Opcodes are architecture-neutral RISC-like operations emitted by the
//! translator. The analysis core never extends this set; idioms the machine
//! expresses differently are normalized by rules into combinations of these.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter};

/// A p-code operation code.
///
/// The integer discriminants are stable and used to index per-opcode rule
/// tables ([`strum::EnumCount`] sizes the tables). Display names follow the
/// conventional p-code spelling.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumCount,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum OpCode {
    #[strum(serialize = "COPY")]
    Copy = 0,
    #[strum(serialize = "LOAD")]
    Load,
    #[strum(serialize = "STORE")]
    Store,
    #[strum(serialize = "BRANCH")]
    Branch,
    #[strum(serialize = "CBRANCH")]
    CBranch,
    #[strum(serialize = "BRANCHIND")]
    BranchInd,
    #[strum(serialize = "CALL")]
    Call,
    #[strum(serialize = "CALLIND")]
    CallInd,
    #[strum(serialize = "CALLOTHER")]
    CallOther,
    #[strum(serialize = "RETURN")]
    Return,
    #[strum(serialize = "INT_EQUAL")]
    IntEqual,
    #[strum(serialize = "INT_NOTEQUAL")]
    IntNotEqual,
    #[strum(serialize = "INT_SLESS")]
    IntSLess,
    #[strum(serialize = "INT_SLESSEQUAL")]
    IntSLessEqual,
    #[strum(serialize = "INT_LESS")]
    IntLess,
    #[strum(serialize = "INT_LESSEQUAL")]
    IntLessEqual,
    #[strum(serialize = "INT_ZEXT")]
    IntZExt,
    #[strum(serialize = "INT_SEXT")]
    IntSExt,
    #[strum(serialize = "INT_ADD")]
    IntAdd,
    #[strum(serialize = "INT_SUB")]
    IntSub,
    #[strum(serialize = "INT_CARRY")]
    IntCarry,
    #[strum(serialize = "INT_SCARRY")]
    IntSCarry,
    #[strum(serialize = "INT_SBORROW")]
    IntSBorrow,
    #[strum(serialize = "INT_2COMP")]
    Int2Comp,
    #[strum(serialize = "INT_NEGATE")]
    IntNegate,
    #[strum(serialize = "INT_XOR")]
    IntXor,
    #[strum(serialize = "INT_AND")]
    IntAnd,
    #[strum(serialize = "INT_OR")]
    IntOr,
    #[strum(serialize = "INT_LEFT")]
    IntLeft,
    #[strum(serialize = "INT_RIGHT")]
    IntRight,
    #[strum(serialize = "INT_SRIGHT")]
    IntSRight,
    #[strum(serialize = "INT_MULT")]
    IntMult,
    #[strum(serialize = "INT_DIV")]
    IntDiv,
    #[strum(serialize = "INT_SDIV")]
    IntSDiv,
    #[strum(serialize = "INT_REM")]
    IntRem,
    #[strum(serialize = "INT_SREM")]
    IntSRem,
    #[strum(serialize = "BOOL_NEGATE")]
    BoolNegate,
    #[strum(serialize = "BOOL_XOR")]
    BoolXor,
    #[strum(serialize = "BOOL_AND")]
    BoolAnd,
    #[strum(serialize = "BOOL_OR")]
    BoolOr,
    #[strum(serialize = "FLOAT_EQUAL")]
    FloatEqual,
    #[strum(serialize = "FLOAT_NOTEQUAL")]
    FloatNotEqual,
    #[strum(serialize = "FLOAT_LESS")]
    FloatLess,
    #[strum(serialize = "FLOAT_LESSEQUAL")]
    FloatLessEqual,
    #[strum(serialize = "FLOAT_NAN")]
    FloatNan,
    #[strum(serialize = "FLOAT_ADD")]
    FloatAdd,
    #[strum(serialize = "FLOAT_DIV")]
    FloatDiv,
    #[strum(serialize = "FLOAT_MULT")]
    FloatMult,
    #[strum(serialize = "FLOAT_SUB")]
    FloatSub,
    #[strum(serialize = "FLOAT_NEG")]
    FloatNeg,
    #[strum(serialize = "FLOAT_ABS")]
    FloatAbs,
    #[strum(serialize = "FLOAT_SQRT")]
    FloatSqrt,
    #[strum(serialize = "FLOAT_INT2FLOAT")]
    FloatInt2Float,
    #[strum(serialize = "FLOAT_FLOAT2FLOAT")]
    FloatFloat2Float,
    #[strum(serialize = "FLOAT_TRUNC")]
    FloatTrunc,
    #[strum(serialize = "FLOAT_CEIL")]
    FloatCeil,
    #[strum(serialize = "FLOAT_FLOOR")]
    FloatFloor,
    #[strum(serialize = "FLOAT_ROUND")]
    FloatRound,
    #[strum(serialize = "MULTIEQUAL")]
    MultiEqual,
    #[strum(serialize = "INDIRECT")]
    Indirect,
    #[strum(serialize = "PIECE")]
    Piece,
    #[strum(serialize = "SUBPIECE")]
    SubPiece,
    #[strum(serialize = "CAST")]
    Cast,
    #[strum(serialize = "PTRADD")]
    PtrAdd,
    #[strum(serialize = "PTRSUB")]
    PtrSub,
    #[strum(serialize = "SEGMENTOP")]
    SegmentOp,
    #[strum(serialize = "CPOOLREF")]
    CPoolRef,
    #[strum(serialize = "NEW")]
    New,
    #[strum(serialize = "INSERT")]
    Insert,
    #[strum(serialize = "EXTRACT")]
    Extract,
    #[strum(serialize = "POPCOUNT")]
    PopCount,
}

impl OpCode {
    /// Returns the opcode's table index.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns `true` for operations that transfer control flow.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(self, OpCode::Branch | OpCode::CBranch | OpCode::BranchInd)
    }

    /// Returns `true` for CALL, CALLIND, and CALLOTHER.
    #[must_use]
    pub const fn is_call(self) -> bool {
        matches!(self, OpCode::Call | OpCode::CallInd | OpCode::CallOther)
    }

    /// Returns `true` if the operation ends a basic block.
    #[must_use]
    pub const fn is_block_terminator(self) -> bool {
        matches!(
            self,
            OpCode::Branch | OpCode::CBranch | OpCode::BranchInd | OpCode::Return
        )
    }

    /// Returns `true` if execution can continue at the next instruction.
    #[must_use]
    pub const fn has_fallthrough(self) -> bool {
        !matches!(self, OpCode::Branch | OpCode::BranchInd | OpCode::Return)
    }

    /// Returns `true` for the phi pseudo-operation.
    #[must_use]
    pub const fn is_phi(self) -> bool {
        matches!(self, OpCode::MultiEqual)
    }

    /// Returns `true` if the two inputs of a binary operation may be swapped
    /// without changing the result.
    #[must_use]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            OpCode::IntEqual
                | OpCode::IntNotEqual
                | OpCode::IntAdd
                | OpCode::IntCarry
                | OpCode::IntSCarry
                | OpCode::IntXor
                | OpCode::IntAnd
                | OpCode::IntOr
                | OpCode::IntMult
                | OpCode::BoolXor
                | OpCode::BoolAnd
                | OpCode::BoolOr
                | OpCode::FloatEqual
                | OpCode::FloatNotEqual
                | OpCode::FloatAdd
                | OpCode::FloatMult
        )
    }

    /// Returns `true` for comparisons producing a single boolean byte.
    #[must_use]
    pub const fn is_boolean_output(self) -> bool {
        matches!(
            self,
            OpCode::IntEqual
                | OpCode::IntNotEqual
                | OpCode::IntSLess
                | OpCode::IntSLessEqual
                | OpCode::IntLess
                | OpCode::IntLessEqual
                | OpCode::IntCarry
                | OpCode::IntSCarry
                | OpCode::IntSBorrow
                | OpCode::BoolNegate
                | OpCode::BoolXor
                | OpCode::BoolAnd
                | OpCode::BoolOr
                | OpCode::FloatEqual
                | OpCode::FloatNotEqual
                | OpCode::FloatLess
                | OpCode::FloatLessEqual
                | OpCode::FloatNan
        )
    }

    /// Returns `true` for floating-point operations.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            OpCode::FloatEqual
                | OpCode::FloatNotEqual
                | OpCode::FloatLess
                | OpCode::FloatLessEqual
                | OpCode::FloatNan
                | OpCode::FloatAdd
                | OpCode::FloatDiv
                | OpCode::FloatMult
                | OpCode::FloatSub
                | OpCode::FloatNeg
                | OpCode::FloatAbs
                | OpCode::FloatSqrt
                | OpCode::FloatInt2Float
                | OpCode::FloatFloat2Float
                | OpCode::FloatTrunc
                | OpCode::FloatCeil
                | OpCode::FloatFloor
                | OpCode::FloatRound
        )
    }

    /// Returns `true` if the operation has no side effect beyond its output.
    ///
    /// Pure operations with an unread output are dead-code candidates.
    #[must_use]
    pub const fn is_pure(self) -> bool {
        !matches!(
            self,
            OpCode::Store
                | OpCode::Branch
                | OpCode::CBranch
                | OpCode::BranchInd
                | OpCode::Call
                | OpCode::CallInd
                | OpCode::CallOther
                | OpCode::Return
                | OpCode::Indirect
                | OpCode::SegmentOp
                | OpCode::New
        )
    }

    /// Returns the number of data inputs a well-formed operation carries, or
    /// `None` when the count is variable (calls, phis, RETURN).
    #[must_use]
    pub const fn fixed_input_count(self) -> Option<usize> {
        match self {
            OpCode::Copy
            | OpCode::Branch
            | OpCode::BranchInd
            | OpCode::IntZExt
            | OpCode::IntSExt
            | OpCode::Int2Comp
            | OpCode::IntNegate
            | OpCode::BoolNegate
            | OpCode::FloatNan
            | OpCode::FloatNeg
            | OpCode::FloatAbs
            | OpCode::FloatSqrt
            | OpCode::FloatInt2Float
            | OpCode::FloatFloat2Float
            | OpCode::FloatTrunc
            | OpCode::FloatCeil
            | OpCode::FloatFloor
            | OpCode::FloatRound
            | OpCode::Cast
            | OpCode::CPoolRef
            | OpCode::PopCount => Some(1),
            OpCode::Load
            | OpCode::CBranch
            | OpCode::IntEqual
            | OpCode::IntNotEqual
            | OpCode::IntSLess
            | OpCode::IntSLessEqual
            | OpCode::IntLess
            | OpCode::IntLessEqual
            | OpCode::IntAdd
            | OpCode::IntSub
            | OpCode::IntCarry
            | OpCode::IntSCarry
            | OpCode::IntSBorrow
            | OpCode::IntXor
            | OpCode::IntAnd
            | OpCode::IntOr
            | OpCode::IntLeft
            | OpCode::IntRight
            | OpCode::IntSRight
            | OpCode::IntMult
            | OpCode::IntDiv
            | OpCode::IntSDiv
            | OpCode::IntRem
            | OpCode::IntSRem
            | OpCode::BoolXor
            | OpCode::BoolAnd
            | OpCode::BoolOr
            | OpCode::FloatEqual
            | OpCode::FloatNotEqual
            | OpCode::FloatLess
            | OpCode::FloatLessEqual
            | OpCode::FloatAdd
            | OpCode::FloatDiv
            | OpCode::FloatMult
            | OpCode::FloatSub
            | OpCode::SubPiece
            | OpCode::Piece
            | OpCode::Indirect
            | OpCode::PtrSub => Some(2),
            OpCode::Store | OpCode::PtrAdd | OpCode::SegmentOp | OpCode::Insert
            | OpCode::Extract => Some(3),
            _ => None,
        }
    }
}

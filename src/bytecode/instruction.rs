//! Decoded JVM instruction representation.
//!
//! A decoded method body is an ordered sequence of [`Instruction`]s indexed by
//! byte offset. The representation keeps the original encoding size so every
//! analysis can address per-position state arrays sized to the code length,
//! and classifies control flow ([`FlowKind`]) so the control-flow builder does
//! not re-derive it from opcode bytes.

use smallvec::SmallVec;

use crate::bytecode::opcode;

/// Operand payload of a decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand.
    None,
    /// A local-variable slot index (already widened if `wide`-prefixed).
    Local(u16),
    /// A signed immediate (`bipush`, `sipush`).
    Immediate(i32),
    /// A constant pool index.
    Pool(u16),
    /// A branch offset relative to this instruction's offset.
    Branch(i32),
    /// Local slot plus increment (`iinc`).
    Iinc {
        /// Local variable slot.
        local: u16,
        /// Signed increment.
        delta: i16,
    },
    /// `tableswitch` payload.
    TableSwitch {
        /// Relative default target.
        default: i32,
        /// Lowest case value.
        low: i32,
        /// Relative jump offsets for `low..=low + offsets.len() - 1`.
        offsets: Vec<i32>,
    },
    /// `lookupswitch` payload.
    LookupSwitch {
        /// Relative default target.
        default: i32,
        /// Sorted (match, relative offset) pairs.
        pairs: Vec<(i32, i32)>,
    },
    /// `newarray` primitive element code (4 = boolean .. 11 = long).
    ArrayType(u8),
    /// `multianewarray`: pool index of the array class plus dimension count.
    MultiArray {
        /// Constant pool index of the array class.
        pool: u16,
        /// Number of dimensions popped from the stack.
        dims: u8,
    },
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Falls through to the next instruction.
    Sequential,
    /// Two-way: falls through or jumps.
    ConditionalBranch,
    /// Unconditional jump.
    Branch,
    /// Multi-way jump (`tableswitch`, `lookupswitch`).
    Switch,
    /// Leaves the method normally.
    Return,
    /// Raises an exception.
    Throw,
}

/// A decoded JVM instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Byte offset within the method's code array.
    pub offset: u32,
    /// The opcode byte (`wide` prefixes are folded away).
    pub opcode: u8,
    /// Human-readable mnemonic.
    pub mnemonic: &'static str,
    /// Decoded operand payload.
    pub operand: Operand,
    /// Encoded size in bytes, including the operand (and any `wide` prefix).
    pub size: u32,
}

impl Instruction {
    /// Classifies the control-flow behavior of this instruction.
    #[must_use]
    pub fn flow_kind(&self) -> FlowKind {
        match self.opcode {
            opcode::GOTO | opcode::GOTO_W => FlowKind::Branch,
            opcode::IFEQ
            | opcode::IFNE
            | opcode::IFLT
            | opcode::IFGE
            | opcode::IFGT
            | opcode::IFLE
            | opcode::IF_ICMPEQ
            | opcode::IF_ICMPNE
            | opcode::IF_ICMPLT
            | opcode::IF_ICMPGE
            | opcode::IF_ICMPGT
            | opcode::IF_ICMPLE
            | opcode::IF_ACMPEQ
            | opcode::IF_ACMPNE
            | opcode::IFNULL
            | opcode::IFNONNULL => FlowKind::ConditionalBranch,
            opcode::TABLESWITCH | opcode::LOOKUPSWITCH => FlowKind::Switch,
            opcode::IRETURN
            | opcode::LRETURN
            | opcode::FRETURN
            | opcode::DRETURN
            | opcode::ARETURN
            | opcode::RETURN => FlowKind::Return,
            opcode::ATHROW => FlowKind::Throw,
            _ => FlowKind::Sequential,
        }
    }

    /// Byte offset of the instruction following this one.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size
    }

    /// Absolute successor offsets within the method, in evaluation order.
    ///
    /// For conditional branches the fall-through target comes first. Returns
    /// an empty list for returns and throws.
    #[must_use]
    pub fn successor_offsets(&self) -> SmallVec<[u32; 2]> {
        let abs = |rel: i32| (self.offset as i64 + i64::from(rel)) as u32;
        let mut out = SmallVec::new();
        match self.flow_kind() {
            FlowKind::Sequential => out.push(self.next_offset()),
            FlowKind::ConditionalBranch => {
                out.push(self.next_offset());
                if let Operand::Branch(rel) = self.operand {
                    out.push(abs(rel));
                }
            }
            FlowKind::Branch => {
                if let Operand::Branch(rel) = self.operand {
                    out.push(abs(rel));
                }
            }
            FlowKind::Switch => match &self.operand {
                Operand::TableSwitch {
                    default, offsets, ..
                } => {
                    out.push(abs(*default));
                    for rel in offsets {
                        let target = abs(*rel);
                        if !out.contains(&target) {
                            out.push(target);
                        }
                    }
                }
                Operand::LookupSwitch { default, pairs } => {
                    out.push(abs(*default));
                    for (_, rel) in pairs {
                        let target = abs(*rel);
                        if !out.contains(&target) {
                            out.push(target);
                        }
                    }
                }
                _ => {}
            },
            FlowKind::Return | FlowKind::Throw => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(opcode: u8, operand: Operand, size: u32) -> Instruction {
        let (_, mnemonic) = opcode::shape(opcode).unwrap();
        Instruction {
            offset: 10,
            opcode,
            mnemonic,
            operand,
            size,
        }
    }

    #[test]
    fn conditional_branch_lists_fall_through_first() {
        let i = insn(opcode::IFEQ, Operand::Branch(6), 3);
        assert_eq!(i.flow_kind(), FlowKind::ConditionalBranch);
        assert_eq!(i.successor_offsets().as_slice(), &[13, 16]);
    }

    #[test]
    fn switch_deduplicates_targets() {
        let i = insn(
            opcode::TABLESWITCH,
            Operand::TableSwitch {
                default: 20,
                low: 0,
                offsets: vec![20, 24],
            },
            16,
        );
        assert_eq!(i.successor_offsets().as_slice(), &[30, 34]);
    }

    #[test]
    fn return_has_no_successors() {
        let i = insn(opcode::RETURN, Operand::None, 1);
        assert!(i.successor_offsets().is_empty());
    }
}

//! Assembly of instruction streams back into code arrays.
//!
//! The weave phase edits methods at the instruction level; this module lays
//! the edited stream back out as bytes. Branch operands in an input stream
//! use an *index convention*: every `Branch`, `TableSwitch` and
//! `LookupSwitch` payload value is an index into the instruction slice, not a
//! byte offset. [`assemble`] performs iterative layout (switch padding and
//! wide local forms change sizes, which change offsets, which change padding)
//! and only then materializes relative byte offsets.
//!
//! Conditional branches have no wide encoding in the JVM instruction set;
//! a woven method whose branch span exceeds `i16` range fails with an
//! encoding error rather than silently truncating. `goto` is transparently
//! promoted to `goto_w` when needed.

use crate::{
    bytecode::{
        instruction::{Instruction, Operand},
        opcode::{self, OperandKind},
    },
    Error, Result,
};

/// Computes the encoded size of `insn` when placed at `offset`, with branch
/// spans resolved against `offsets` (the current layout estimate).
fn layout_size(insn: &Instruction, offset: u32, offsets: &[u32], insns: &[Instruction]) -> u32 {
    let (kind, _) = opcode::shape(insn.opcode).expect("defined opcode");
    match kind {
        OperandKind::None => 1,
        OperandKind::Byte | OperandKind::PoolByte => 2,
        OperandKind::Short | OperandKind::Pool => 3,
        OperandKind::Local => match insn.operand {
            Operand::Local(idx) if idx > 0xFF => 4, // wide prefix
            _ => 2,
        },
        OperandKind::Iinc => match insn.operand {
            Operand::Iinc { local, delta }
                if local > 0xFF || i16::from(delta as i8) != delta =>
            {
                6
            }
            _ => 3,
        },
        OperandKind::Branch => {
            // goto promotes to goto_w when the span overflows i16.
            if insn.opcode == opcode::GOTO {
                if let Operand::Branch(target_idx) = insn.operand {
                    let rel = branch_span(offset, target_idx, offsets, insns);
                    if i32::from(rel as i16) != rel {
                        return 5;
                    }
                }
            }
            3
        }
        OperandKind::BranchWide => 5,
        OperandKind::InterfaceCall | OperandKind::DynamicCall => 5,
        OperandKind::MultiArray => 4,
        OperandKind::TableSwitch => {
            let pad = pad4(offset + 1);
            let count = match &insn.operand {
                Operand::TableSwitch { offsets, .. } => offsets.len() as u32,
                _ => 0,
            };
            1 + pad + 12 + 4 * count
        }
        OperandKind::LookupSwitch => {
            let pad = pad4(offset + 1);
            let count = match &insn.operand {
                Operand::LookupSwitch { pairs, .. } => pairs.len() as u32,
                _ => 0,
            };
            1 + pad + 8 + 8 * count
        }
    }
}

fn pad4(offset: u32) -> u32 {
    (4 - offset % 4) % 4
}

/// Relative span from the instruction at `offset` to the instruction at
/// stream index `target_idx`, under the current layout estimate.
fn branch_span(offset: u32, target_idx: i32, offsets: &[u32], insns: &[Instruction]) -> i32 {
    debug_assert_eq!(offsets.len(), insns.len());
    let idx = target_idx as usize;
    let target = offsets.get(idx).copied().unwrap_or(0);
    target as i32 - offset as i32
}

/// Lays out and encodes an instruction stream.
///
/// Branch operands must follow the index convention documented on the module.
/// Returns the encoded bytes together with the final byte offset of each
/// instruction (parallel to the input slice).
///
/// # Errors
///
/// Returns [`Error::Encode`] for branch targets out of range, conditional
/// branch spans exceeding `i16`, and operands inconsistent with their opcode.
pub fn assemble(insns: &[Instruction]) -> Result<(Vec<u8>, Vec<u32>)> {
    // Iterate layout until sizes stabilize. Switch padding and goto_w
    // promotion both depend on offsets, so a single pass is not enough.
    let mut offsets = vec![0u32; insns.len()];
    for _round in 0..8 {
        let mut changed = false;
        let mut offset = 0u32;
        for (i, insn) in insns.iter().enumerate() {
            if offsets[i] != offset {
                offsets[i] = offset;
                changed = true;
            }
            offset += layout_size(insn, offset, &offsets, insns);
        }
        if !changed {
            break;
        }
    }

    let check_target = |idx: i32, at: u32| -> Result<usize> {
        let i = usize::try_from(idx)
            .map_err(|_| Error::Encode(format!("negative branch target index at {at}")))?;
        if i >= insns.len() {
            return Err(Error::Encode(format!(
                "branch target index {i} out of range at {at}"
            )));
        }
        Ok(i)
    };

    let mut out = Vec::new();
    for (i, insn) in insns.iter().enumerate() {
        let offset = offsets[i];
        debug_assert_eq!(offset as usize, out.len());
        let (kind, _) = opcode::shape(insn.opcode)
            .ok_or_else(|| Error::Encode(format!("undefined opcode {:#04x}", insn.opcode)))?;
        match (kind, &insn.operand) {
            (OperandKind::None, _) => out.push(insn.opcode),
            (OperandKind::Byte, Operand::Immediate(v)) => {
                out.push(insn.opcode);
                out.push(*v as u8);
            }
            (OperandKind::Byte, Operand::ArrayType(code)) => {
                out.push(insn.opcode);
                out.push(*code);
            }
            (OperandKind::Short, Operand::Immediate(v)) => {
                out.push(insn.opcode);
                out.extend_from_slice(&(*v as i16).to_be_bytes());
            }
            (OperandKind::PoolByte, Operand::Pool(idx)) => {
                if *idx > 0xFF {
                    return Err(Error::Encode(format!(
                        "ldc pool index {idx} exceeds one byte at {offset}"
                    )));
                }
                out.push(insn.opcode);
                out.push(*idx as u8);
            }
            (OperandKind::Pool, Operand::Pool(idx)) => {
                out.push(insn.opcode);
                out.extend_from_slice(&idx.to_be_bytes());
            }
            (OperandKind::Local, Operand::Local(idx)) => {
                if *idx > 0xFF {
                    out.push(opcode::WIDE);
                    out.push(insn.opcode);
                    out.extend_from_slice(&idx.to_be_bytes());
                } else {
                    out.push(insn.opcode);
                    out.push(*idx as u8);
                }
            }
            (OperandKind::Iinc, Operand::Iinc { local, delta }) => {
                if *local > 0xFF || i16::from(*delta as i8) != *delta {
                    out.push(opcode::WIDE);
                    out.push(insn.opcode);
                    out.extend_from_slice(&local.to_be_bytes());
                    out.extend_from_slice(&delta.to_be_bytes());
                } else {
                    out.push(insn.opcode);
                    out.push(*local as u8);
                    out.push(*delta as u8);
                }
            }
            (OperandKind::Branch | OperandKind::BranchWide, Operand::Branch(target_idx)) => {
                check_target(*target_idx, offset)?;
                let rel = branch_span(offset, *target_idx, &offsets, insns);
                let wide_form = insn.opcode == opcode::GOTO_W
                    || (insn.opcode == opcode::GOTO && i32::from(rel as i16) != rel);
                if wide_form {
                    out.push(opcode::GOTO_W);
                    out.extend_from_slice(&rel.to_be_bytes());
                } else {
                    if i32::from(rel as i16) != rel {
                        return Err(Error::Encode(format!(
                            "conditional branch span {rel} exceeds i16 at {offset}"
                        )));
                    }
                    out.push(insn.opcode);
                    out.extend_from_slice(&(rel as i16).to_be_bytes());
                }
            }
            (OperandKind::TableSwitch, Operand::TableSwitch { default, low, offsets: targets }) => {
                out.push(insn.opcode);
                for _ in 0..pad4(offset + 1) {
                    out.push(0);
                }
                check_target(*default, offset)?;
                let default_rel = branch_span(offset, *default, &offsets, insns);
                out.extend_from_slice(&default_rel.to_be_bytes());
                out.extend_from_slice(&low.to_be_bytes());
                let high = low + targets.len() as i32 - 1;
                out.extend_from_slice(&high.to_be_bytes());
                for t in targets {
                    check_target(*t, offset)?;
                    let rel = branch_span(offset, *t, &offsets, insns);
                    out.extend_from_slice(&rel.to_be_bytes());
                }
            }
            (OperandKind::LookupSwitch, Operand::LookupSwitch { default, pairs }) => {
                out.push(insn.opcode);
                for _ in 0..pad4(offset + 1) {
                    out.push(0);
                }
                check_target(*default, offset)?;
                let default_rel = branch_span(offset, *default, &offsets, insns);
                out.extend_from_slice(&default_rel.to_be_bytes());
                out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                for (key, t) in pairs {
                    check_target(*t, offset)?;
                    let rel = branch_span(offset, *t, &offsets, insns);
                    out.extend_from_slice(&key.to_be_bytes());
                    out.extend_from_slice(&rel.to_be_bytes());
                }
            }
            (OperandKind::InterfaceCall, Operand::Pool(idx)) => {
                out.push(insn.opcode);
                out.extend_from_slice(&idx.to_be_bytes());
                // The count byte is recomputed by class-file writers; a
                // placeholder of 1 keeps historical verifiers content.
                out.push(1);
                out.push(0);
            }
            (OperandKind::DynamicCall, Operand::Pool(idx)) => {
                out.push(insn.opcode);
                out.extend_from_slice(&idx.to_be_bytes());
                out.push(0);
                out.push(0);
            }
            (OperandKind::MultiArray, Operand::MultiArray { pool, dims }) => {
                out.push(insn.opcode);
                out.extend_from_slice(&pool.to_be_bytes());
                out.push(*dims);
            }
            (_, operand) => {
                return Err(Error::Encode(format!(
                    "operand {operand:?} does not fit opcode {:#04x} at {offset}",
                    insn.opcode
                )))
            }
        }
    }
    Ok((out, offsets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{decoder::decode_stream, opcode as op};

    fn insn(opcode: u8, operand: Operand) -> Instruction {
        let (_, mnemonic) = op::shape(opcode).unwrap();
        Instruction {
            offset: 0,
            opcode,
            mnemonic,
            operand,
            size: 0,
        }
    }

    #[test]
    fn assembles_branches_by_index() {
        // 0: iload_0, 1: ifeq -> 4, 2: iconst_1, 3: ireturn, 4: iconst_0, 5: ireturn
        let insns = vec![
            insn(op::ILOAD_0, Operand::None),
            insn(op::IFEQ, Operand::Branch(4)),
            insn(op::ICONST_1, Operand::None),
            insn(op::IRETURN, Operand::None),
            insn(op::ICONST_0, Operand::None),
            insn(op::IRETURN, Operand::None),
        ];
        let (bytes, offsets) = assemble(&insns).unwrap();
        assert_eq!(offsets, vec![0, 1, 4, 5, 6, 7]);
        let decoded = decode_stream(&bytes).unwrap();
        assert_eq!(decoded[1].operand, Operand::Branch(5)); // 1 + 5 = 6
    }

    #[test]
    fn wide_local_changes_layout() {
        let insns = vec![
            insn(op::ILOAD, Operand::Local(300)),
            insn(op::IRETURN, Operand::None),
        ];
        let (bytes, offsets) = assemble(&insns).unwrap();
        assert_eq!(offsets, vec![0, 4]);
        assert_eq!(bytes[0], op::WIDE);
    }

    #[test]
    fn rejects_out_of_range_target() {
        let insns = vec![insn(op::GOTO, Operand::Branch(9))];
        assert!(assemble(&insns).is_err());
    }
}

//! Decoding of raw JVM code arrays into instruction streams.
//!
//! The decoder walks the code array linearly, folding `wide` prefixes into
//! the widened instruction form and materializing switch payloads. Truncated
//! instructions and undefined opcode bytes are reported as bad code with the
//! offending offset. `jsr`/`ret` subroutines are rejected outright: no
//! supported compiler emits them, and the dataflow analyses do not model
//! return-address values.

use crate::{
    bytecode::{
        instruction::{Instruction, Operand},
        opcode::{self, OperandKind},
    },
    Result,
};

/// Sequential big-endian reader over a code array.
struct CodeReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> CodeReader<'a> {
    fn new(code: &'a [u8]) -> Self {
        CodeReader { code, pos: 0 }
    }

    fn offset(&self) -> u32 {
        self.pos as u32
    }

    fn has_more(&self) -> bool {
        self.pos < self.code.len()
    }

    fn u8(&mut self, at: u32) -> Result<u8> {
        let b = self
            .code
            .get(self.pos)
            .copied()
            .ok_or_else(|| bad_code!(at, "truncated instruction"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self, at: u32) -> Result<u16> {
        Ok(u16::from(self.u8(at)?) << 8 | u16::from(self.u8(at)?))
    }

    fn i16(&mut self, at: u32) -> Result<i16> {
        Ok(self.u16(at)? as i16)
    }

    fn i32(&mut self, at: u32) -> Result<i32> {
        Ok(i32::from(self.i16(at)?) << 16 | i32::from(self.u16(at)?))
    }

    fn align4(&mut self) {
        while self.pos % 4 != 0 {
            self.pos += 1;
        }
    }
}

/// Decodes one instruction starting at the reader's current offset.
fn decode_one(reader: &mut CodeReader<'_>) -> Result<Instruction> {
    let at = reader.offset();
    let mut byte = reader.u8(at)?;

    // Fold the wide prefix into the widened form of the inner instruction.
    let wide = byte == opcode::WIDE;
    if wide {
        byte = reader.u8(at)?;
    }

    let (kind, mnemonic) =
        opcode::shape(byte).ok_or_else(|| bad_code!(at, "undefined opcode {:#04x}", byte))?;

    if matches!(byte, opcode::JSR | opcode::JSR_W | opcode::RET) {
        return Err(bad_code!(at, "jsr/ret subroutines are not supported"));
    }
    if wide && !matches!(kind, OperandKind::Local | OperandKind::Iinc) {
        return Err(bad_code!(at, "wide prefix on non-widenable {mnemonic}"));
    }

    let operand = match kind {
        OperandKind::None => Operand::None,
        OperandKind::Local => {
            let idx = if wide {
                reader.u16(at)?
            } else {
                u16::from(reader.u8(at)?)
            };
            Operand::Local(idx)
        }
        OperandKind::Byte => Operand::Immediate(i32::from(reader.u8(at)? as i8)),
        OperandKind::Short => Operand::Immediate(i32::from(reader.i16(at)?)),
        OperandKind::PoolByte => Operand::Pool(u16::from(reader.u8(at)?)),
        OperandKind::Pool => Operand::Pool(reader.u16(at)?),
        OperandKind::Branch => Operand::Branch(i32::from(reader.i16(at)?)),
        OperandKind::BranchWide => Operand::Branch(reader.i32(at)?),
        OperandKind::Iinc => {
            if wide {
                Operand::Iinc {
                    local: reader.u16(at)?,
                    delta: reader.i16(at)?,
                }
            } else {
                Operand::Iinc {
                    local: u16::from(reader.u8(at)?),
                    delta: i16::from(reader.u8(at)? as i8),
                }
            }
        }
        OperandKind::TableSwitch => {
            reader.align4();
            let default = reader.i32(at)?;
            let low = reader.i32(at)?;
            let high = reader.i32(at)?;
            if high < low {
                return Err(bad_code!(at, "tableswitch high {high} below low {low}"));
            }
            let count = (i64::from(high) - i64::from(low) + 1) as usize;
            if count > reader.code.len() {
                return Err(bad_code!(at, "tableswitch entry count {count} exceeds code"));
            }
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(reader.i32(at)?);
            }
            Operand::TableSwitch {
                default,
                low,
                offsets,
            }
        }
        OperandKind::LookupSwitch => {
            reader.align4();
            let default = reader.i32(at)?;
            let npairs = reader.i32(at)?;
            if npairs < 0 || npairs as usize > reader.code.len() {
                return Err(bad_code!(at, "lookupswitch pair count {npairs} invalid"));
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for _ in 0..npairs {
                let key = reader.i32(at)?;
                let rel = reader.i32(at)?;
                pairs.push((key, rel));
            }
            Operand::LookupSwitch { default, pairs }
        }
        OperandKind::InterfaceCall => {
            let pool = reader.u16(at)?;
            let _count = reader.u8(at)?;
            let zero = reader.u8(at)?;
            if zero != 0 {
                return Err(bad_code!(at, "invokeinterface trailing byte must be zero"));
            }
            Operand::Pool(pool)
        }
        OperandKind::DynamicCall => {
            let pool = reader.u16(at)?;
            let z1 = reader.u8(at)?;
            let z2 = reader.u8(at)?;
            if z1 != 0 || z2 != 0 {
                return Err(bad_code!(at, "invokedynamic trailing bytes must be zero"));
            }
            Operand::Pool(pool)
        }
        OperandKind::MultiArray => Operand::MultiArray {
            pool: reader.u16(at)?,
            dims: reader.u8(at)?,
        },
    };

    Ok(Instruction {
        offset: at,
        opcode: byte,
        mnemonic,
        operand,
        size: reader.offset() - at,
    })
}

/// Decodes an entire code array into an instruction stream.
///
/// The returned instructions are in offset order and contiguous: each one
/// starts where the previous one ended.
///
/// # Errors
///
/// Returns [`Error::BadCode`](crate::Error::BadCode) for truncated or
/// undefined instructions and unsupported subroutine opcodes.
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut reader = CodeReader::new(code);
    let mut out = Vec::new();
    while reader.has_more() {
        out.push(decode_one(&mut reader)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opcode as op;

    #[test]
    fn decodes_simple_method() {
        // iload_0; iconst_1; iadd; ireturn
        let code = [op::ILOAD_0, op::ICONST_1, op::IADD, op::IRETURN];
        let insns = decode_stream(&code).unwrap();
        assert_eq!(insns.len(), 4);
        assert_eq!(insns[2].mnemonic, "iadd");
        assert_eq!(insns[3].offset, 3);
    }

    #[test]
    fn folds_wide_prefix() {
        let code = [op::WIDE, op::ILOAD, 0x01, 0x00, op::IRETURN];
        let insns = decode_stream(&code).unwrap();
        assert_eq!(insns[0].opcode, op::ILOAD);
        assert_eq!(insns[0].operand, Operand::Local(0x0100));
        assert_eq!(insns[0].size, 4);
        assert_eq!(insns[1].offset, 4);
    }

    #[test]
    fn decodes_tableswitch_with_padding() {
        // offset 0: iconst_0, offset 1: tableswitch (pad to 4)
        let mut code = vec![op::ICONST_0, op::TABLESWITCH, 0, 0];
        // default=16, low=0, high=1, two offsets
        for v in [16i32, 0, 1, 16, 20] {
            code.extend_from_slice(&v.to_be_bytes());
        }
        code.push(op::RETURN);
        let insns = decode_stream(&code).unwrap();
        match &insns[1].operand {
            Operand::TableSwitch {
                default,
                low,
                offsets,
            } => {
                assert_eq!((*default, *low), (16, 0));
                assert_eq!(offsets.as_slice(), &[16, 20]);
            }
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn rejects_truncation_and_subroutines() {
        assert!(decode_stream(&[op::BIPUSH]).is_err());
        assert!(decode_stream(&[op::JSR, 0, 3, op::RETURN]).is_err());
        assert!(decode_stream(&[0xCA]).is_err());
    }
}

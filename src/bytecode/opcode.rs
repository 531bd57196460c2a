//! JVM opcode byte constants and per-opcode decoding shape.
//!
//! This module provides the raw byte values for all JVM opcodes, named after
//! their mnemonic (e.g. [`GETSTATIC`] = `0xB2`), plus the [`shape`] table the
//! decoder consults for each opcode's operand encoding. The `wide` prefix
//! ([`WIDE`] = `0xC4`) is handled by the decoder and never appears in decoded
//! streams.
#![allow(missing_docs)]

// ── Constants ──────────────────────────────────────────────────────────────

pub const NOP: u8 = 0x00;
pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_M1: u8 = 0x02;
pub const ICONST_0: u8 = 0x03;
pub const ICONST_1: u8 = 0x04;
pub const ICONST_2: u8 = 0x05;
pub const ICONST_3: u8 = 0x06;
pub const ICONST_4: u8 = 0x07;
pub const ICONST_5: u8 = 0x08;
pub const LCONST_0: u8 = 0x09;
pub const LCONST_1: u8 = 0x0A;
pub const FCONST_0: u8 = 0x0B;
pub const FCONST_1: u8 = 0x0C;
pub const FCONST_2: u8 = 0x0D;
pub const DCONST_0: u8 = 0x0E;
pub const DCONST_1: u8 = 0x0F;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;

// ── Loads ──────────────────────────────────────────────────────────────────

pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1A;
pub const ILOAD_1: u8 = 0x1B;
pub const ILOAD_2: u8 = 0x1C;
pub const ILOAD_3: u8 = 0x1D;
pub const LLOAD_0: u8 = 0x1E;
pub const LLOAD_1: u8 = 0x1F;
pub const LLOAD_2: u8 = 0x20;
pub const LLOAD_3: u8 = 0x21;
pub const FLOAD_0: u8 = 0x22;
pub const FLOAD_1: u8 = 0x23;
pub const FLOAD_2: u8 = 0x24;
pub const FLOAD_3: u8 = 0x25;
pub const DLOAD_0: u8 = 0x26;
pub const DLOAD_1: u8 = 0x27;
pub const DLOAD_2: u8 = 0x28;
pub const DLOAD_3: u8 = 0x29;
pub const ALOAD_0: u8 = 0x2A;
pub const ALOAD_1: u8 = 0x2B;
pub const ALOAD_2: u8 = 0x2C;
pub const ALOAD_3: u8 = 0x2D;
pub const IALOAD: u8 = 0x2E;
pub const LALOAD: u8 = 0x2F;
pub const FALOAD: u8 = 0x30;
pub const DALOAD: u8 = 0x31;
pub const AALOAD: u8 = 0x32;
pub const BALOAD: u8 = 0x33;
pub const CALOAD: u8 = 0x34;
pub const SALOAD: u8 = 0x35;

// ── Stores ─────────────────────────────────────────────────────────────────

pub const ISTORE: u8 = 0x36;
pub const LSTORE: u8 = 0x37;
pub const FSTORE: u8 = 0x38;
pub const DSTORE: u8 = 0x39;
pub const ASTORE: u8 = 0x3A;
pub const ISTORE_0: u8 = 0x3B;
pub const ISTORE_1: u8 = 0x3C;
pub const ISTORE_2: u8 = 0x3D;
pub const ISTORE_3: u8 = 0x3E;
pub const LSTORE_0: u8 = 0x3F;
pub const LSTORE_1: u8 = 0x40;
pub const LSTORE_2: u8 = 0x41;
pub const LSTORE_3: u8 = 0x42;
pub const FSTORE_0: u8 = 0x43;
pub const FSTORE_1: u8 = 0x44;
pub const FSTORE_2: u8 = 0x45;
pub const FSTORE_3: u8 = 0x46;
pub const DSTORE_0: u8 = 0x47;
pub const DSTORE_1: u8 = 0x48;
pub const DSTORE_2: u8 = 0x49;
pub const DSTORE_3: u8 = 0x4A;
pub const ASTORE_0: u8 = 0x4B;
pub const ASTORE_1: u8 = 0x4C;
pub const ASTORE_2: u8 = 0x4D;
pub const ASTORE_3: u8 = 0x4E;
pub const IASTORE: u8 = 0x4F;
pub const LASTORE: u8 = 0x50;
pub const FASTORE: u8 = 0x51;
pub const DASTORE: u8 = 0x52;
pub const AASTORE: u8 = 0x53;
pub const BASTORE: u8 = 0x54;
pub const CASTORE: u8 = 0x55;
pub const SASTORE: u8 = 0x56;

// ── Stack manipulation ─────────────────────────────────────────────────────

pub const POP: u8 = 0x57;
pub const POP2: u8 = 0x58;
pub const DUP: u8 = 0x59;
pub const DUP_X1: u8 = 0x5A;
pub const DUP_X2: u8 = 0x5B;
pub const DUP2: u8 = 0x5C;
pub const DUP2_X1: u8 = 0x5D;
pub const DUP2_X2: u8 = 0x5E;
pub const SWAP: u8 = 0x5F;

// ── Arithmetic ─────────────────────────────────────────────────────────────

pub const IADD: u8 = 0x60;
pub const LADD: u8 = 0x61;
pub const FADD: u8 = 0x62;
pub const DADD: u8 = 0x63;
pub const ISUB: u8 = 0x64;
pub const LSUB: u8 = 0x65;
pub const FSUB: u8 = 0x66;
pub const DSUB: u8 = 0x67;
pub const IMUL: u8 = 0x68;
pub const LMUL: u8 = 0x69;
pub const FMUL: u8 = 0x6A;
pub const DMUL: u8 = 0x6B;
pub const IDIV: u8 = 0x6C;
pub const LDIV: u8 = 0x6D;
pub const FDIV: u8 = 0x6E;
pub const DDIV: u8 = 0x6F;
pub const IREM: u8 = 0x70;
pub const LREM: u8 = 0x71;
pub const FREM: u8 = 0x72;
pub const DREM: u8 = 0x73;
pub const INEG: u8 = 0x74;
pub const LNEG: u8 = 0x75;
pub const FNEG: u8 = 0x76;
pub const DNEG: u8 = 0x77;
pub const ISHL: u8 = 0x78;
pub const LSHL: u8 = 0x79;
pub const ISHR: u8 = 0x7A;
pub const LSHR: u8 = 0x7B;
pub const IUSHR: u8 = 0x7C;
pub const LUSHR: u8 = 0x7D;
pub const IAND: u8 = 0x7E;
pub const LAND: u8 = 0x7F;
pub const IOR: u8 = 0x80;
pub const LOR: u8 = 0x81;
pub const IXOR: u8 = 0x82;
pub const LXOR: u8 = 0x83;
pub const IINC: u8 = 0x84;

// ── Conversions ────────────────────────────────────────────────────────────

pub const I2L: u8 = 0x85;
pub const I2F: u8 = 0x86;
pub const I2D: u8 = 0x87;
pub const L2I: u8 = 0x88;
pub const L2F: u8 = 0x89;
pub const L2D: u8 = 0x8A;
pub const F2I: u8 = 0x8B;
pub const F2L: u8 = 0x8C;
pub const F2D: u8 = 0x8D;
pub const D2I: u8 = 0x8E;
pub const D2L: u8 = 0x8F;
pub const D2F: u8 = 0x90;
pub const I2B: u8 = 0x91;
pub const I2C: u8 = 0x92;
pub const I2S: u8 = 0x93;

// ── Comparisons and branches ───────────────────────────────────────────────

pub const LCMP: u8 = 0x94;
pub const FCMPL: u8 = 0x95;
pub const FCMPG: u8 = 0x96;
pub const DCMPL: u8 = 0x97;
pub const DCMPG: u8 = 0x98;
pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9A;
pub const IFLT: u8 = 0x9B;
pub const IFGE: u8 = 0x9C;
pub const IFGT: u8 = 0x9D;
pub const IFLE: u8 = 0x9E;
pub const IF_ICMPEQ: u8 = 0x9F;
pub const IF_ICMPNE: u8 = 0xA0;
pub const IF_ICMPLT: u8 = 0xA1;
pub const IF_ICMPGE: u8 = 0xA2;
pub const IF_ICMPGT: u8 = 0xA3;
pub const IF_ICMPLE: u8 = 0xA4;
pub const IF_ACMPEQ: u8 = 0xA5;
pub const IF_ACMPNE: u8 = 0xA6;
pub const GOTO: u8 = 0xA7;
pub const JSR: u8 = 0xA8;
pub const RET: u8 = 0xA9;
pub const TABLESWITCH: u8 = 0xAA;
pub const LOOKUPSWITCH: u8 = 0xAB;

// ── Returns ────────────────────────────────────────────────────────────────

pub const IRETURN: u8 = 0xAC;
pub const LRETURN: u8 = 0xAD;
pub const FRETURN: u8 = 0xAE;
pub const DRETURN: u8 = 0xAF;
pub const ARETURN: u8 = 0xB0;
pub const RETURN: u8 = 0xB1;

// ── Field / method access ──────────────────────────────────────────────────

pub const GETSTATIC: u8 = 0xB2;
pub const PUTSTATIC: u8 = 0xB3;
pub const GETFIELD: u8 = 0xB4;
pub const PUTFIELD: u8 = 0xB5;
pub const INVOKEVIRTUAL: u8 = 0xB6;
pub const INVOKESPECIAL: u8 = 0xB7;
pub const INVOKESTATIC: u8 = 0xB8;
pub const INVOKEINTERFACE: u8 = 0xB9;
pub const INVOKEDYNAMIC: u8 = 0xBA;

// ── Objects and arrays ─────────────────────────────────────────────────────

pub const NEW: u8 = 0xBB;
pub const NEWARRAY: u8 = 0xBC;
pub const ANEWARRAY: u8 = 0xBD;
pub const ARRAYLENGTH: u8 = 0xBE;
pub const ATHROW: u8 = 0xBF;
pub const CHECKCAST: u8 = 0xC0;
pub const INSTANCEOF: u8 = 0xC1;
pub const MONITORENTER: u8 = 0xC2;
pub const MONITOREXIT: u8 = 0xC3;

// ── Extended ───────────────────────────────────────────────────────────────

pub const WIDE: u8 = 0xC4;
pub const MULTIANEWARRAY: u8 = 0xC5;
pub const IFNULL: u8 = 0xC6;
pub const IFNONNULL: u8 = 0xC7;
pub const GOTO_W: u8 = 0xC8;
pub const JSR_W: u8 = 0xC9;

/// How the bytes following an opcode are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand bytes.
    None,
    /// One local-variable index byte (two bytes under `wide`).
    Local,
    /// One signed immediate byte (`bipush`, `newarray`).
    Byte,
    /// Two signed immediate bytes (`sipush`).
    Short,
    /// One constant pool index byte (`ldc`).
    PoolByte,
    /// Two constant pool index bytes.
    Pool,
    /// Two-byte signed branch offset.
    Branch,
    /// Four-byte signed branch offset (`goto_w`, `jsr_w`).
    BranchWide,
    /// Local index byte plus signed increment byte (`iinc`).
    Iinc,
    /// Padded `tableswitch` payload.
    TableSwitch,
    /// Padded `lookupswitch` payload.
    LookupSwitch,
    /// Pool index plus count and zero bytes (`invokeinterface`).
    InterfaceCall,
    /// Pool index plus two zero bytes (`invokedynamic`).
    DynamicCall,
    /// Pool index plus dimension count byte (`multianewarray`).
    MultiArray,
}

/// Returns the operand encoding and mnemonic of `opcode`, or `None` for
/// undefined opcode bytes.
#[must_use]
pub fn shape(opcode: u8) -> Option<(OperandKind, &'static str)> {
    use OperandKind as K;
    Some(match opcode {
        NOP => (K::None, "nop"),
        ACONST_NULL => (K::None, "aconst_null"),
        ICONST_M1 => (K::None, "iconst_m1"),
        ICONST_0 => (K::None, "iconst_0"),
        ICONST_1 => (K::None, "iconst_1"),
        ICONST_2 => (K::None, "iconst_2"),
        ICONST_3 => (K::None, "iconst_3"),
        ICONST_4 => (K::None, "iconst_4"),
        ICONST_5 => (K::None, "iconst_5"),
        LCONST_0 => (K::None, "lconst_0"),
        LCONST_1 => (K::None, "lconst_1"),
        FCONST_0 => (K::None, "fconst_0"),
        FCONST_1 => (K::None, "fconst_1"),
        FCONST_2 => (K::None, "fconst_2"),
        DCONST_0 => (K::None, "dconst_0"),
        DCONST_1 => (K::None, "dconst_1"),
        BIPUSH => (K::Byte, "bipush"),
        SIPUSH => (K::Short, "sipush"),
        LDC => (K::PoolByte, "ldc"),
        LDC_W => (K::Pool, "ldc_w"),
        LDC2_W => (K::Pool, "ldc2_w"),
        ILOAD => (K::Local, "iload"),
        LLOAD => (K::Local, "lload"),
        FLOAD => (K::Local, "fload"),
        DLOAD => (K::Local, "dload"),
        ALOAD => (K::Local, "aload"),
        ILOAD_0 => (K::None, "iload_0"),
        ILOAD_1 => (K::None, "iload_1"),
        ILOAD_2 => (K::None, "iload_2"),
        ILOAD_3 => (K::None, "iload_3"),
        LLOAD_0 => (K::None, "lload_0"),
        LLOAD_1 => (K::None, "lload_1"),
        LLOAD_2 => (K::None, "lload_2"),
        LLOAD_3 => (K::None, "lload_3"),
        FLOAD_0 => (K::None, "fload_0"),
        FLOAD_1 => (K::None, "fload_1"),
        FLOAD_2 => (K::None, "fload_2"),
        FLOAD_3 => (K::None, "fload_3"),
        DLOAD_0 => (K::None, "dload_0"),
        DLOAD_1 => (K::None, "dload_1"),
        DLOAD_2 => (K::None, "dload_2"),
        DLOAD_3 => (K::None, "dload_3"),
        ALOAD_0 => (K::None, "aload_0"),
        ALOAD_1 => (K::None, "aload_1"),
        ALOAD_2 => (K::None, "aload_2"),
        ALOAD_3 => (K::None, "aload_3"),
        IALOAD => (K::None, "iaload"),
        LALOAD => (K::None, "laload"),
        FALOAD => (K::None, "faload"),
        DALOAD => (K::None, "daload"),
        AALOAD => (K::None, "aaload"),
        BALOAD => (K::None, "baload"),
        CALOAD => (K::None, "caload"),
        SALOAD => (K::None, "saload"),
        ISTORE => (K::Local, "istore"),
        LSTORE => (K::Local, "lstore"),
        FSTORE => (K::Local, "fstore"),
        DSTORE => (K::Local, "dstore"),
        ASTORE => (K::Local, "astore"),
        ISTORE_0 => (K::None, "istore_0"),
        ISTORE_1 => (K::None, "istore_1"),
        ISTORE_2 => (K::None, "istore_2"),
        ISTORE_3 => (K::None, "istore_3"),
        LSTORE_0 => (K::None, "lstore_0"),
        LSTORE_1 => (K::None, "lstore_1"),
        LSTORE_2 => (K::None, "lstore_2"),
        LSTORE_3 => (K::None, "lstore_3"),
        FSTORE_0 => (K::None, "fstore_0"),
        FSTORE_1 => (K::None, "fstore_1"),
        FSTORE_2 => (K::None, "fstore_2"),
        FSTORE_3 => (K::None, "fstore_3"),
        DSTORE_0 => (K::None, "dstore_0"),
        DSTORE_1 => (K::None, "dstore_1"),
        DSTORE_2 => (K::None, "dstore_2"),
        DSTORE_3 => (K::None, "dstore_3"),
        ASTORE_0 => (K::None, "astore_0"),
        ASTORE_1 => (K::None, "astore_1"),
        ASTORE_2 => (K::None, "astore_2"),
        ASTORE_3 => (K::None, "astore_3"),
        IASTORE => (K::None, "iastore"),
        LASTORE => (K::None, "lastore"),
        FASTORE => (K::None, "fastore"),
        DASTORE => (K::None, "dastore"),
        AASTORE => (K::None, "aastore"),
        BASTORE => (K::None, "bastore"),
        CASTORE => (K::None, "castore"),
        SASTORE => (K::None, "sastore"),
        POP => (K::None, "pop"),
        POP2 => (K::None, "pop2"),
        DUP => (K::None, "dup"),
        DUP_X1 => (K::None, "dup_x1"),
        DUP_X2 => (K::None, "dup_x2"),
        DUP2 => (K::None, "dup2"),
        DUP2_X1 => (K::None, "dup2_x1"),
        DUP2_X2 => (K::None, "dup2_x2"),
        SWAP => (K::None, "swap"),
        IADD => (K::None, "iadd"),
        LADD => (K::None, "ladd"),
        FADD => (K::None, "fadd"),
        DADD => (K::None, "dadd"),
        ISUB => (K::None, "isub"),
        LSUB => (K::None, "lsub"),
        FSUB => (K::None, "fsub"),
        DSUB => (K::None, "dsub"),
        IMUL => (K::None, "imul"),
        LMUL => (K::None, "lmul"),
        FMUL => (K::None, "fmul"),
        DMUL => (K::None, "dmul"),
        IDIV => (K::None, "idiv"),
        LDIV => (K::None, "ldiv"),
        FDIV => (K::None, "fdiv"),
        DDIV => (K::None, "ddiv"),
        IREM => (K::None, "irem"),
        LREM => (K::None, "lrem"),
        FREM => (K::None, "frem"),
        DREM => (K::None, "drem"),
        INEG => (K::None, "ineg"),
        LNEG => (K::None, "lneg"),
        FNEG => (K::None, "fneg"),
        DNEG => (K::None, "dneg"),
        ISHL => (K::None, "ishl"),
        LSHL => (K::None, "lshl"),
        ISHR => (K::None, "ishr"),
        LSHR => (K::None, "lshr"),
        IUSHR => (K::None, "iushr"),
        LUSHR => (K::None, "lushr"),
        IAND => (K::None, "iand"),
        LAND => (K::None, "land"),
        IOR => (K::None, "ior"),
        LOR => (K::None, "lor"),
        IXOR => (K::None, "ixor"),
        LXOR => (K::None, "lxor"),
        IINC => (K::Iinc, "iinc"),
        I2L => (K::None, "i2l"),
        I2F => (K::None, "i2f"),
        I2D => (K::None, "i2d"),
        L2I => (K::None, "l2i"),
        L2F => (K::None, "l2f"),
        L2D => (K::None, "l2d"),
        F2I => (K::None, "f2i"),
        F2L => (K::None, "f2l"),
        F2D => (K::None, "f2d"),
        D2I => (K::None, "d2i"),
        D2L => (K::None, "d2l"),
        D2F => (K::None, "d2f"),
        I2B => (K::None, "i2b"),
        I2C => (K::None, "i2c"),
        I2S => (K::None, "i2s"),
        LCMP => (K::None, "lcmp"),
        FCMPL => (K::None, "fcmpl"),
        FCMPG => (K::None, "fcmpg"),
        DCMPL => (K::None, "dcmpl"),
        DCMPG => (K::None, "dcmpg"),
        IFEQ => (K::Branch, "ifeq"),
        IFNE => (K::Branch, "ifne"),
        IFLT => (K::Branch, "iflt"),
        IFGE => (K::Branch, "ifge"),
        IFGT => (K::Branch, "ifgt"),
        IFLE => (K::Branch, "ifle"),
        IF_ICMPEQ => (K::Branch, "if_icmpeq"),
        IF_ICMPNE => (K::Branch, "if_icmpne"),
        IF_ICMPLT => (K::Branch, "if_icmplt"),
        IF_ICMPGE => (K::Branch, "if_icmpge"),
        IF_ICMPGT => (K::Branch, "if_icmpgt"),
        IF_ICMPLE => (K::Branch, "if_icmple"),
        IF_ACMPEQ => (K::Branch, "if_acmpeq"),
        IF_ACMPNE => (K::Branch, "if_acmpne"),
        GOTO => (K::Branch, "goto"),
        JSR => (K::Branch, "jsr"),
        RET => (K::Local, "ret"),
        TABLESWITCH => (K::TableSwitch, "tableswitch"),
        LOOKUPSWITCH => (K::LookupSwitch, "lookupswitch"),
        IRETURN => (K::None, "ireturn"),
        LRETURN => (K::None, "lreturn"),
        FRETURN => (K::None, "freturn"),
        DRETURN => (K::None, "dreturn"),
        ARETURN => (K::None, "areturn"),
        RETURN => (K::None, "return"),
        GETSTATIC => (K::Pool, "getstatic"),
        PUTSTATIC => (K::Pool, "putstatic"),
        GETFIELD => (K::Pool, "getfield"),
        PUTFIELD => (K::Pool, "putfield"),
        INVOKEVIRTUAL => (K::Pool, "invokevirtual"),
        INVOKESPECIAL => (K::Pool, "invokespecial"),
        INVOKESTATIC => (K::Pool, "invokestatic"),
        INVOKEINTERFACE => (K::InterfaceCall, "invokeinterface"),
        INVOKEDYNAMIC => (K::DynamicCall, "invokedynamic"),
        NEW => (K::Pool, "new"),
        NEWARRAY => (K::Byte, "newarray"),
        ANEWARRAY => (K::Pool, "anewarray"),
        ARRAYLENGTH => (K::None, "arraylength"),
        ATHROW => (K::None, "athrow"),
        CHECKCAST => (K::Pool, "checkcast"),
        INSTANCEOF => (K::Pool, "instanceof"),
        MONITORENTER => (K::None, "monitorenter"),
        MONITOREXIT => (K::None, "monitorexit"),
        MULTIANEWARRAY => (K::MultiArray, "multianewarray"),
        IFNULL => (K::Branch, "ifnull"),
        IFNONNULL => (K::Branch, "ifnonnull"),
        GOTO_W => (K::BranchWide, "goto_w"),
        JSR_W => (K::BranchWide, "jsr_w"),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_covers_defined_range() {
        // Every opcode up to jsr_w except the wide prefix and the 0xCA+ gap.
        for op in 0x00..=0xC9u8 {
            if op == WIDE {
                assert!(shape(op).is_none());
            } else {
                assert!(shape(op).is_some(), "missing shape for {op:#04x}");
            }
        }
        assert!(shape(0xCA).is_none());
        assert!(shape(0xFF).is_none());
    }

    #[test]
    fn mnemonics_match_constants() {
        assert_eq!(shape(GETSTATIC).unwrap().1, "getstatic");
        assert_eq!(shape(INVOKEDYNAMIC).unwrap().0, OperandKind::DynamicCall);
        assert_eq!(shape(TABLESWITCH).unwrap().0, OperandKind::TableSwitch);
    }
}

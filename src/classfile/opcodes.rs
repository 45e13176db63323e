//! JVM opcodes referenced by name in this crate

pub const NOP: u8 = 0x00;
pub const ICONST_0: u8 = 0x03;
pub const ICONST_1: u8 = 0x04;
pub const ICONST_2: u8 = 0x05;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const LDC2_W: u8 = 0x14;
pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const ALOAD: u8 = 0x19;
pub const ISTORE: u8 = 0x36;
pub const LSTORE: u8 = 0x37;
pub const ASTORE: u8 = 0x3a;
pub const AASTORE: u8 = 0x53;
pub const POP: u8 = 0x57;
pub const DUP: u8 = 0x59;
pub const IINC: u8 = 0x84;
pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const PUTSTATIC: u8 = 0xb3;
pub const GETFIELD: u8 = 0xb4;
pub const PUTFIELD: u8 = 0xb5;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const NEWARRAY: u8 = 0xbc;
pub const ANEWARRAY: u8 = 0xbd;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;
pub const INSTANCEOF: u8 = 0xc1;
pub const WIDE: u8 = 0xc4;
pub const MULTIANEWARRAY: u8 = 0xc5;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// Operand layout of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operands {
    None,
    /// bipush, newarray, ldc
    U8,
    /// sipush and every constant-pool referencing opcode with a u2 index
    U16,
    /// xload/xstore/ret: u1 local index, u2 under `wide`
    Local,
    Iinc,
    Branch16,
    Branch32,
    TableSwitch,
    LookupSwitch,
    InvokeInterface,
    InvokeDynamic,
    MultiANewArray,
    Wide,
}

/// Operand layout for `opcode`, or `None` if it may not appear in a class file
pub(crate) fn operands(opcode: u8) -> Option<Operands> {
    let layout = match opcode {
        0x00..=0x0f => Operands::None,
        BIPUSH | LDC | NEWARRAY => Operands::U8,
        SIPUSH | LDC_W | LDC2_W => Operands::U16,
        ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Operands::Local,
        0x1a..=0x35 | 0x3b..=0x83 => Operands::None,
        IINC => Operands::Iinc,
        0x85..=0x98 => Operands::None,
        IFEQ..=JSR | IFNULL | IFNONNULL => Operands::Branch16,
        TABLESWITCH => Operands::TableSwitch,
        LOOKUPSWITCH => Operands::LookupSwitch,
        IRETURN..=RETURN => Operands::None,
        GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Operands::U16,
        INVOKEINTERFACE => Operands::InvokeInterface,
        INVOKEDYNAMIC => Operands::InvokeDynamic,
        0xbe | ATHROW | 0xc2 | 0xc3 => Operands::None,
        WIDE => Operands::Wide,
        MULTIANEWARRAY => Operands::MultiANewArray,
        GOTO_W | JSR_W => Operands::Branch32,
        _ => return None,
    };
    Some(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_standard_opcode_has_layout() {
        for op in 0x00..=0xc9u8 {
            assert!(operands(op).is_some(), "opcode {op:#04x} has no layout");
        }
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        assert_eq!(operands(0xca), None); // breakpoint
        assert_eq!(operands(0xfe), None);
        assert_eq!(operands(0xff), None);
    }

    #[test]
    fn test_selected_layouts() {
        assert_eq!(operands(RET), Some(Operands::Local));
        assert_eq!(operands(IFNONNULL), Some(Operands::Branch16));
        assert_eq!(operands(GOTO_W), Some(Operands::Branch32));
        assert_eq!(operands(0x1a), Some(Operands::None)); // iload_0
        assert_eq!(operands(0x4e), Some(Operands::None)); // astore_3
    }
}

//! Errors raised while parsing or re-serializing class files

use thiserror::Error;

/// Errors that can occur while reading, rewriting or writing a class file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("unexpected end of class data at offset {offset} (needed {needed} more bytes)")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("{0} trailing bytes after end of class file")]
    TrailingBytes(usize),

    #[error("invalid constant pool index {0}")]
    BadConstantIndex(u16),

    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("constant pool entry {index} is not a {expected}")]
    ConstantType { index: u16, expected: &'static str },

    #[error("constant pool entry {0} holds invalid modified UTF-8")]
    BadUtf8(u16),

    #[error("constant pool overflow: more than 65535 slots")]
    ConstantPoolOverflow,

    #[error("unknown opcode {opcode:#04x} at bytecode offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u32 },

    #[error("bytecode position {position} is not an instruction boundary")]
    NotInstructionBoundary { position: i64 },

    #[error("malformed switch at bytecode offset {0}")]
    BadSwitch(u32),

    #[error("unknown stack map frame type {0}")]
    UnknownFrameType(u8),

    #[error("stack map frame at offset {0} is not after the previous frame")]
    FrameOrder(u32),

    #[error("unknown verification type tag {0}")]
    UnknownVerificationType(u8),

    #[error("unknown annotation element tag {0:?}")]
    UnknownElementTag(char),

    #[error("method body of {0} bytes exceeds the 65535 byte limit")]
    CodeTooLarge(usize),

    #[error("branch at offset {offset} cannot reach its target ({delta} bytes away)")]
    BranchOutOfRange { offset: u32, delta: i64 },

    #[error("{what} count {count} does not fit in its length field")]
    TooMany { what: &'static str, count: usize },

    #[error("class already declares member {0}")]
    DuplicateMember(String),
}

/// Result type for class file operations
pub type Result<T> = std::result::Result<T, ClassFileError>;

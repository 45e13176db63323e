//! Method bodies: decoded instruction lists with labels
//!
//! A `Code` attribute is decoded into instructions whose branch targets, and
//! every pc-bearing table around them, refer to instruction indices
//! (`Label`) instead of byte offsets. Encoding lays the instructions out
//! again, recomputing switch padding and operand widths, and translates every
//! label back to its new offset. Nothing is recomputed beyond that: frames are
//! carried as decoded, and new frames are written by hand.

use super::bytes::{ByteReader, ByteWriter};
use super::constant_pool::ConstantPool;
use super::error::{ClassFileError, Result};
use super::opcodes::*;
use super::stackmap::{self, StackMapFrame};
use super::Attribute;

/// Largest legal `code_length`
const MAX_CODE_LENGTH: usize = 65535;

/// Position of an instruction in `Code::instructions`; `Label(len)` is the end of the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Opcode without operands
    Simple(u8),
    /// bipush / sipush
    Push { opcode: u8, value: i16 },
    /// newarray with its primitive type code
    NewArray(u8),
    /// ldc family and every opcode that carries a u2 constant pool index
    Constant { opcode: u8, index: u16 },
    /// xload / xstore / ret
    Local { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    Branch { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    MultiANewArray { index: u16, dimensions: u8 },
}

impl Instruction {
    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Simple(op) => *op,
            Instruction::Push { opcode, .. }
            | Instruction::Constant { opcode, .. }
            | Instruction::Local { opcode, .. }
            | Instruction::Branch { opcode, .. } => *opcode,
            Instruction::NewArray(_) => NEWARRAY,
            Instruction::Iinc { .. } => IINC,
            Instruction::TableSwitch { .. } => TABLESWITCH,
            Instruction::LookupSwitch { .. } => LOOKUPSWITCH,
            Instruction::InvokeInterface { .. } => INVOKEINTERFACE,
            Instruction::InvokeDynamic { .. } => INVOKEDYNAMIC,
            Instruction::MultiANewArray { .. } => MULTIANEWARRAY,
        }
    }

    /// True for instructions that introduce control-flow join points
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Instruction::Branch { .. }
                | Instruction::TableSwitch { .. }
                | Instruction::LookupSwitch { .. }
        )
    }

    fn for_each_label(&mut self, f: &mut impl FnMut(&mut Label)) {
        match self {
            Instruction::Branch { target, .. } => f(target),
            Instruction::TableSwitch {
                default, targets, ..
            } => {
                f(default);
                for t in targets {
                    f(t);
                }
            }
            Instruction::LookupSwitch { default, pairs } => {
                f(default);
                for (_, t) in pairs {
                    f(t);
                }
            }
            _ => {}
        }
    }

    /// Encoded size when placed at `offset`
    fn size(&self, offset: usize) -> usize {
        match self {
            Instruction::Simple(_) => 1,
            Instruction::Push { opcode, value } => {
                if *opcode == BIPUSH && i8::try_from(*value).is_ok() {
                    2
                } else {
                    3
                }
            }
            Instruction::NewArray(_) => 2,
            Instruction::Constant { opcode, index } => {
                if *opcode == LDC && *index <= u8::MAX as u16 {
                    2
                } else {
                    3
                }
            }
            Instruction::Local { index, .. } => {
                if *index <= u8::MAX as u16 {
                    2
                } else {
                    4
                }
            }
            Instruction::Iinc { index, delta } => {
                if *index <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                    3
                } else {
                    6
                }
            }
            Instruction::Branch { opcode, .. } => {
                if matches!(*opcode, GOTO_W | JSR_W) {
                    5
                } else {
                    3
                }
            }
            Instruction::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len()
            }
            Instruction::LookupSwitch { pairs, .. } => 1 + switch_padding(offset) + 8 + 8 * pairs.len(),
            Instruction::InvokeInterface { .. } | Instruction::InvokeDynamic { .. } => 5,
            Instruction::MultiANewArray { .. } => 4,
        }
    }

    fn emit(&self, w: &mut ByteWriter, offset: u32, offset_of: &impl Fn(Label) -> u32) -> Result<()> {
        match self {
            Instruction::Simple(op) => w.u8(*op),
            Instruction::Push { opcode, value } => match i8::try_from(*value) {
                Ok(byte) if *opcode == BIPUSH => {
                    w.u8(BIPUSH);
                    w.u8(byte as u8);
                }
                _ => {
                    w.u8(SIPUSH);
                    w.u16(*value as u16);
                }
            },
            Instruction::NewArray(atype) => {
                w.u8(NEWARRAY);
                w.u8(*atype);
            }
            Instruction::Constant { opcode, index } => {
                if *opcode == LDC && *index <= u8::MAX as u16 {
                    w.u8(LDC);
                    w.u8(*index as u8);
                } else {
                    w.u8(if *opcode == LDC { LDC_W } else { *opcode });
                    w.u16(*index);
                }
            }
            Instruction::Local { opcode, index } => {
                if *index <= u8::MAX as u16 {
                    w.u8(*opcode);
                    w.u8(*index as u8);
                } else {
                    w.u8(WIDE);
                    w.u8(*opcode);
                    w.u16(*index);
                }
            }
            Instruction::Iinc { index, delta } => match i8::try_from(*delta) {
                Ok(delta) if *index <= u8::MAX as u16 => {
                    w.u8(IINC);
                    w.u8(*index as u8);
                    w.u8(delta as u8);
                }
                _ => {
                    w.u8(WIDE);
                    w.u8(IINC);
                    w.u16(*index);
                    w.u16(*delta as u16);
                }
            },
            Instruction::Branch { opcode, target } => {
                let delta = offset_of(*target) as i64 - offset as i64;
                w.u8(*opcode);
                if matches!(*opcode, GOTO_W | JSR_W) {
                    w.i32(delta as i32);
                } else {
                    let short = i16::try_from(delta)
                        .map_err(|_| ClassFileError::BranchOutOfRange { offset, delta })?;
                    w.u16(short as u16);
                }
            }
            Instruction::TableSwitch {
                default,
                low,
                targets,
            } => {
                w.u8(TABLESWITCH);
                write_padding(w, offset);
                w.i32(relative(offset_of(*default), offset));
                w.i32(*low);
                let high = *low as i64 + targets.len() as i64 - 1;
                let high = i32::try_from(high).map_err(|_| ClassFileError::BadSwitch(offset))?;
                w.i32(high);
                for target in targets {
                    w.i32(relative(offset_of(*target), offset));
                }
            }
            Instruction::LookupSwitch { default, pairs } => {
                w.u8(LOOKUPSWITCH);
                write_padding(w, offset);
                w.i32(relative(offset_of(*default), offset));
                w.i32(pairs.len() as i32);
                for (key, target) in pairs {
                    w.i32(*key);
                    w.i32(relative(offset_of(*target), offset));
                }
            }
            Instruction::InvokeInterface { index, count } => {
                w.u8(INVOKEINTERFACE);
                w.u16(*index);
                w.u8(*count);
                w.u8(0);
            }
            Instruction::InvokeDynamic { index } => {
                w.u8(INVOKEDYNAMIC);
                w.u16(*index);
                w.u16(0);
            }
            Instruction::MultiANewArray { index, dimensions } => {
                w.u8(MULTIANEWARRAY);
                w.u16(*index);
                w.u8(*dimensions);
            }
        }
        Ok(())
    }
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

fn write_padding(w: &mut ByteWriter, offset: u32) {
    for _ in 0..switch_padding(offset as usize) {
        w.u8(0);
    }
}

fn relative(target: u32, from: u32) -> i32 {
    (target as i64 - from as i64) as i32
}

/// Exception table entry; `end` is exclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Class index, or 0 for `finally`
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub start: Label,
    pub line: u16,
}

/// Entry of `LocalVariableTable` or `LocalVariableTypeTable`; `end` is exclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: Label,
    pub end: Label,
    pub name_index: u16,
    /// Descriptor, or signature for the type table
    pub descriptor_index: u16,
    pub index: u16,
}

/// Attributes nested in `Code`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeAttribute {
    LineNumberTable {
        name_index: u16,
        entries: Vec<LineNumber>,
    },
    LocalVariableTable {
        name_index: u16,
        entries: Vec<LocalVariable>,
    },
    LocalVariableTypeTable {
        name_index: u16,
        entries: Vec<LocalVariable>,
    },
    StackMapTable {
        name_index: u16,
        frames: Vec<StackMapFrame>,
    },
    /// Carried through untouched
    Other(Attribute),
}

/// A decoded `Code` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Instruction>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<CodeAttribute>,
}

impl Code {
    pub fn new(max_stack: u16, max_locals: u16, instructions: Vec<Instruction>) -> Self {
        Self {
            max_stack,
            max_locals,
            instructions,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Label just past the last instruction
    pub fn end(&self) -> Label {
        Label(self.instructions.len() as u32)
    }

    /// Whether the verifier needs frames for this body
    pub fn has_join_points(&self) -> bool {
        !self.exception_table.is_empty() || self.instructions.iter().any(Instruction::is_jump)
    }

    pub fn stack_map(&self) -> Option<&[StackMapFrame]> {
        self.attributes.iter().find_map(|attr| match attr {
            CodeAttribute::StackMapTable { frames, .. } => Some(frames.as_slice()),
            _ => None,
        })
    }

    /// Visit every label held by the body and its tables
    pub fn for_each_label(&mut self, f: &mut impl FnMut(&mut Label)) {
        for insn in &mut self.instructions {
            insn.for_each_label(f);
        }
        for handler in &mut self.exception_table {
            f(&mut handler.start);
            f(&mut handler.end);
            f(&mut handler.handler);
        }
        for attr in &mut self.attributes {
            match attr {
                CodeAttribute::LineNumberTable { entries, .. } => {
                    for entry in entries {
                        f(&mut entry.start);
                    }
                }
                CodeAttribute::LocalVariableTable { entries, .. }
                | CodeAttribute::LocalVariableTypeTable { entries, .. } => {
                    for entry in entries {
                        f(&mut entry.start);
                        f(&mut entry.end);
                    }
                }
                CodeAttribute::StackMapTable { frames, .. } => {
                    for frame in frames {
                        frame.for_each_label(f);
                    }
                }
                CodeAttribute::Other(_) => {}
            }
        }
    }

    /// Insert `instruction` ahead of the whole body.
    ///
    /// Branches, handlers, frames and line numbers keep pointing at the
    /// instructions they pointed at before. Local variables that were live from
    /// the first instruction stay live from the new first instruction.
    pub fn prepend(&mut self, instruction: Instruction) {
        self.for_each_label(&mut |label| label.0 += 1);
        for attr in &mut self.attributes {
            if let CodeAttribute::LocalVariableTable { entries, .. }
            | CodeAttribute::LocalVariableTypeTable { entries, .. } = attr
            {
                for entry in entries.iter_mut().filter(|e| e.start == Label(1)) {
                    entry.start = Label(0);
                }
            }
        }
        self.instructions.insert(0, instruction);
    }

    /// Decode a `Code` attribute body.
    ///
    /// Code-level type annotation tables are offset-bearing and have no effect
    /// on execution; they are not carried into the decoded form.
    pub fn decode(info: &[u8], cp: &ConstantPool) -> Result<Self> {
        let mut r = ByteReader::new(info);
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;
        let code_length = r.u32()? as usize;
        if code_length > MAX_CODE_LENGTH {
            return Err(ClassFileError::CodeTooLarge(code_length));
        }
        let bytecode = r.bytes(code_length)?;
        let (mut instructions, offsets) = decode_instructions(bytecode)?;

        // offset -> instruction index, u32::MAX where no instruction starts
        let mut index_of = vec![u32::MAX; code_length + 1];
        for (index, offset) in offsets.iter().enumerate() {
            index_of[*offset as usize] = index as u32;
        }
        index_of[code_length] = instructions.len() as u32;
        let to_label = |position: u32| -> Result<Label> {
            match index_of.get(position as usize) {
                Some(&index) if index != u32::MAX => Ok(Label(index)),
                _ => Err(ClassFileError::NotInstructionBoundary {
                    position: position as i64,
                }),
            }
        };

        let mut failure = None;
        let mut relabel = |label: &mut Label| match to_label(label.0) {
            Ok(mapped) => *label = mapped,
            Err(err) => {
                failure.get_or_insert(err);
            }
        };
        for insn in &mut instructions {
            insn.for_each_label(&mut relabel);
        }

        let handler_count = r.u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            let mut handler = ExceptionHandler {
                start: Label(r.u16()? as u32),
                end: Label(r.u16()? as u32),
                handler: Label(r.u16()? as u32),
                catch_type: r.u16()?,
            };
            relabel(&mut handler.start);
            relabel(&mut handler.end);
            relabel(&mut handler.handler);
            exception_table.push(handler);
        }

        let attribute_count = r.u16()?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            let raw = Attribute::parse(&mut r)?;
            let name = cp.utf8(raw.name_index)?;
            let mut attr = match name.as_str() {
                "LineNumberTable" => CodeAttribute::LineNumberTable {
                    name_index: raw.name_index,
                    entries: parse_line_numbers(&raw.info)?,
                },
                "LocalVariableTable" => CodeAttribute::LocalVariableTable {
                    name_index: raw.name_index,
                    entries: parse_local_variables(&raw.info)?,
                },
                "LocalVariableTypeTable" => CodeAttribute::LocalVariableTypeTable {
                    name_index: raw.name_index,
                    entries: parse_local_variables(&raw.info)?,
                },
                "StackMapTable" => CodeAttribute::StackMapTable {
                    name_index: raw.name_index,
                    frames: stackmap::parse(&raw.info)?,
                },
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    tracing::trace!(attribute = %name, "dropping code type annotations");
                    continue;
                }
                _ => CodeAttribute::Other(raw),
            };
            match &mut attr {
                CodeAttribute::LineNumberTable { entries, .. } => {
                    for entry in entries {
                        relabel(&mut entry.start);
                    }
                }
                CodeAttribute::LocalVariableTable { entries, .. }
                | CodeAttribute::LocalVariableTypeTable { entries, .. } => {
                    for entry in entries {
                        relabel(&mut entry.start);
                        relabel(&mut entry.end);
                    }
                }
                CodeAttribute::StackMapTable { frames, .. } => {
                    for frame in frames {
                        frame.for_each_label(&mut relabel);
                    }
                }
                CodeAttribute::Other(_) => {}
            }
            attributes.push(attr);
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if !r.is_empty() {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            max_stack,
            max_locals,
            instructions,
            exception_table,
            attributes,
        })
    }

    /// Encode into a `Code` attribute body
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut offsets = Vec::with_capacity(self.instructions.len() + 1);
        let mut offset = 0usize;
        for insn in &self.instructions {
            offsets.push(offset as u32);
            offset += insn.size(offset);
            if offset > MAX_CODE_LENGTH {
                return Err(ClassFileError::CodeTooLarge(offset));
            }
        }
        let code_length = offset as u32;
        offsets.push(code_length);
        let offset_of = |label: Label| offsets.get(label.0 as usize).copied().unwrap_or(code_length);

        let mut code = ByteWriter::new();
        for (insn, at) in self.instructions.iter().zip(&offsets) {
            insn.emit(&mut code, *at, &offset_of)?;
        }

        let mut w = ByteWriter::new();
        w.u16(self.max_stack);
        w.u16(self.max_locals);
        w.blob("code bytes", &code.into_inner())?;

        w.count("exception handlers", self.exception_table.len())?;
        for handler in &self.exception_table {
            w.u16(offset_of(handler.start) as u16);
            w.u16(offset_of(handler.end) as u16);
            w.u16(offset_of(handler.handler) as u16);
            w.u16(handler.catch_type);
        }

        w.count("code attributes", self.attributes.len())?;
        for attr in &self.attributes {
            let (name_index, info) = match attr {
                CodeAttribute::LineNumberTable {
                    name_index,
                    entries,
                } => {
                    let mut t = ByteWriter::new();
                    t.count("line numbers", entries.len())?;
                    for entry in entries {
                        t.u16(offset_of(entry.start) as u16);
                        t.u16(entry.line);
                    }
                    (*name_index, t.into_inner())
                }
                CodeAttribute::LocalVariableTable {
                    name_index,
                    entries,
                }
                | CodeAttribute::LocalVariableTypeTable {
                    name_index,
                    entries,
                } => {
                    let mut t = ByteWriter::new();
                    t.count("local variables", entries.len())?;
                    for entry in entries {
                        let start = offset_of(entry.start);
                        let end = offset_of(entry.end);
                        t.u16(start as u16);
                        t.u16(end.saturating_sub(start) as u16);
                        t.u16(entry.name_index);
                        t.u16(entry.descriptor_index);
                        t.u16(entry.index);
                    }
                    (*name_index, t.into_inner())
                }
                CodeAttribute::StackMapTable { name_index, frames } => {
                    (*name_index, stackmap::write(frames, offset_of)?)
                }
                CodeAttribute::Other(raw) => (raw.name_index, raw.info.clone()),
            };
            w.u16(name_index);
            w.blob("attribute", &info)?;
        }

        Ok(w.into_inner())
    }
}

/// Decode raw bytecode. Branch targets come back as raw byte offsets.
fn decode_instructions(code: &[u8]) -> Result<(Vec<Instruction>, Vec<u32>)> {
    let mut r = ByteReader::new(code);
    let mut instructions = Vec::new();
    let mut offsets = Vec::new();

    let target = |offset: u32, delta: i64| -> Result<Label> {
        let position = offset as i64 + delta;
        if position < 0 || position > code.len() as i64 {
            return Err(ClassFileError::NotInstructionBoundary { position });
        }
        Ok(Label(position as u32))
    };

    while !r.is_empty() {
        let offset = r.position() as u32;
        let opcode = r.u8()?;
        let layout = operands(opcode).ok_or(ClassFileError::UnknownOpcode { opcode, offset })?;
        let insn = match layout {
            Operands::None => Instruction::Simple(opcode),
            Operands::U8 => match opcode {
                BIPUSH => Instruction::Push {
                    opcode,
                    value: r.i8()? as i16,
                },
                NEWARRAY => Instruction::NewArray(r.u8()?),
                _ => Instruction::Constant {
                    opcode,
                    index: r.u8()? as u16,
                },
            },
            Operands::U16 if opcode == SIPUSH => Instruction::Push {
                opcode,
                value: r.i16()?,
            },
            Operands::U16 => Instruction::Constant {
                opcode,
                index: r.u16()?,
            },
            Operands::Local => Instruction::Local {
                opcode,
                index: r.u8()? as u16,
            },
            Operands::Iinc => Instruction::Iinc {
                index: r.u8()? as u16,
                delta: r.i8()? as i16,
            },
            Operands::Branch16 => Instruction::Branch {
                opcode,
                target: target(offset, r.i16()? as i64)?,
            },
            Operands::Branch32 => Instruction::Branch {
                opcode,
                target: target(offset, r.i32()? as i64)?,
            },
            Operands::TableSwitch => {
                r.skip(switch_padding(offset as usize))?;
                let default = target(offset, r.i32()? as i64)?;
                let low = r.i32()?;
                let high = r.i32()?;
                let count = high as i64 - low as i64 + 1;
                if count < 1 || count * 4 > r.remaining() as i64 {
                    return Err(ClassFileError::BadSwitch(offset));
                }
                let targets = (0..count)
                    .map(|_| target(offset, r.i32()? as i64))
                    .collect::<Result<Vec<_>>>()?;
                Instruction::TableSwitch {
                    default,
                    low,
                    targets,
                }
            }
            Operands::LookupSwitch => {
                r.skip(switch_padding(offset as usize))?;
                let default = target(offset, r.i32()? as i64)?;
                let count = r.i32()?;
                if count < 0 || count as i64 * 8 > r.remaining() as i64 {
                    return Err(ClassFileError::BadSwitch(offset));
                }
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = r.i32()?;
                    pairs.push((key, target(offset, r.i32()? as i64)?));
                }
                Instruction::LookupSwitch { default, pairs }
            }
            Operands::InvokeInterface => {
                let index = r.u16()?;
                let count = r.u8()?;
                r.skip(1)?;
                Instruction::InvokeInterface { index, count }
            }
            Operands::InvokeDynamic => {
                let index = r.u16()?;
                r.skip(2)?;
                Instruction::InvokeDynamic { index }
            }
            Operands::MultiANewArray => Instruction::MultiANewArray {
                index: r.u16()?,
                dimensions: r.u8()?,
            },
            Operands::Wide => {
                let modified = r.u8()?;
                match operands(modified) {
                    Some(Operands::Iinc) => Instruction::Iinc {
                        index: r.u16()?,
                        delta: r.i16()?,
                    },
                    Some(Operands::Local) => Instruction::Local {
                        opcode: modified,
                        index: r.u16()?,
                    },
                    _ => {
                        return Err(ClassFileError::UnknownOpcode {
                            opcode: modified,
                            offset: offset + 1,
                        })
                    }
                }
            }
        };
        offsets.push(offset);
        instructions.push(insn);
    }

    Ok((instructions, offsets))
}

fn parse_line_numbers(info: &[u8]) -> Result<Vec<LineNumber>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    (0..count)
        .map(|_| {
            Ok(LineNumber {
                start: Label(r.u16()? as u32),
                line: r.u16()?,
            })
        })
        .collect()
}

fn parse_local_variables(info: &[u8]) -> Result<Vec<LocalVariable>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    (0..count)
        .map(|_| {
            let start = r.u16()? as u32;
            let length = r.u16()? as u32;
            Ok(LocalVariable {
                start: Label(start),
                end: Label(start + length),
                name_index: r.u16()?,
                descriptor_index: r.u16()?,
                index: r.u16()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_decode(code: &Code, cp: &ConstantPool) -> Code {
        Code::decode(&code.encode().unwrap(), cp).unwrap()
    }

    #[test]
    fn test_branch_targets_become_labels() {
        // 0: iconst_0  1: ifeq +4 -> 5  4: nop  5: return
        let raw = [0, 1, 0, 1, 0, 0, 0, 6, ICONST_0, IFEQ, 0, 4, NOP, RETURN, 0, 0, 0, 0];
        let code = Code::decode(&raw, &ConstantPool::new()).unwrap();
        assert_eq!(
            code.instructions[1],
            Instruction::Branch {
                opcode: IFEQ,
                target: Label(3)
            }
        );
        assert_eq!(code.encode().unwrap(), raw.to_vec());
    }

    #[test]
    fn test_branch_into_operand_rejected() {
        // ifeq +1 lands inside its own operand
        let raw = [0, 1, 0, 1, 0, 0, 0, 4, IFEQ, 0, 1, RETURN, 0, 0, 0, 0];
        let err = Code::decode(&raw, &ConstantPool::new()).unwrap_err();
        assert_eq!(err, ClassFileError::NotInstructionBoundary { position: 1 });
    }

    #[test]
    fn test_prepend_realigns_tableswitch() {
        let mut code = Code::new(
            1,
            1,
            vec![
                Instruction::Simple(ICONST_0),
                Instruction::TableSwitch {
                    default: Label(3),
                    low: 0,
                    targets: vec![Label(2)],
                },
                Instruction::Simple(NOP),
                Instruction::Simple(RETURN),
            ],
        );
        let cp = ConstantPool::new();
        let before = code.encode().unwrap();
        code.prepend(Instruction::Simple(NOP));
        let after = code.encode().unwrap();

        // switch moved from offset 1 to offset 2: padding shrinks from 2 to 1 byte
        let before_len = u32::from_be_bytes([before[4], before[5], before[6], before[7]]);
        let after_len = u32::from_be_bytes([after[4], after[5], after[6], after[7]]);
        assert_eq!(after_len, before_len);

        let decoded = encode_decode(&code, &cp);
        assert_eq!(
            decoded.instructions[2],
            Instruction::TableSwitch {
                default: Label(4),
                low: 0,
                targets: vec![Label(3)],
            }
        );
    }

    #[test]
    fn test_prepend_keeps_parameter_scope() {
        let mut code = Code::new(1, 1, vec![Instruction::Simple(RETURN)]);
        code.attributes.push(CodeAttribute::LocalVariableTable {
            name_index: 1,
            entries: vec![LocalVariable {
                start: Label(0),
                end: Label(1),
                name_index: 2,
                descriptor_index: 3,
                index: 0,
            }],
        });
        code.attributes.push(CodeAttribute::LineNumberTable {
            name_index: 4,
            entries: vec![LineNumber {
                start: Label(0),
                line: 12,
            }],
        });
        code.prepend(Instruction::Simple(NOP));

        match &code.attributes[0] {
            CodeAttribute::LocalVariableTable { entries, .. } => {
                assert_eq!(entries[0].start, Label(0));
                assert_eq!(entries[0].end, Label(2));
            }
            other => panic!("unexpected attribute {other:?}"),
        }
        match &code.attributes[1] {
            CodeAttribute::LineNumberTable { entries, .. } => assert_eq!(entries[0].start, Label(1)),
            other => panic!("unexpected attribute {other:?}"),
        }
    }

    #[test]
    fn test_wide_forms_reencode() {
        let code = Code::new(
            2,
            300,
            vec![
                Instruction::Local {
                    opcode: ILOAD,
                    index: 299,
                },
                Instruction::Iinc {
                    index: 3,
                    delta: 1000,
                },
                Instruction::Constant {
                    opcode: LDC,
                    index: 400,
                },
                Instruction::Simple(RETURN),
            ],
        );
        let bytes = code.encode().unwrap();
        // wide iload (4) + wide iinc (6) + ldc_w (3) + return (1)
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 14);
        assert_eq!(bytes[8], WIDE);
        assert_eq!(bytes[12], WIDE);
        assert_eq!(bytes[18], LDC_W);

        let decoded = encode_decode(&code, &ConstantPool::new());
        assert_eq!(decoded.instructions[0], code.instructions[0]);
        assert_eq!(decoded.instructions[1], code.instructions[1]);
        assert_eq!(
            decoded.instructions[2],
            Instruction::Constant {
                opcode: LDC_W,
                index: 400
            }
        );
    }

    #[test]
    fn test_short_branch_out_of_range() {
        let mut instructions = vec![Instruction::Branch {
            opcode: GOTO,
            target: Label(40_001),
        }];
        // 40,000 x sipush puts the target ~120,000 bytes away
        instructions.extend((0..40_000).map(|_| Instruction::Push {
            opcode: SIPUSH,
            value: 1000,
        }));
        instructions.push(Instruction::Simple(RETURN));
        let code = Code::new(1, 0, instructions);
        assert!(matches!(
            code.encode(),
            Err(ClassFileError::CodeTooLarge(_))
        ));

        let mut near = vec![Instruction::Branch {
            opcode: GOTO,
            target: Label(12_001),
        }];
        near.extend((0..12_000).map(|_| Instruction::Push {
            opcode: SIPUSH,
            value: 1000,
        }));
        near.push(Instruction::Simple(RETURN));
        assert!(matches!(
            Code::new(1, 0, near).encode(),
            Err(ClassFileError::BranchOutOfRange { offset: 0, .. })
        ));
    }

    #[test]
    fn test_join_point_detection() {
        let straight = Code::new(0, 0, vec![Instruction::Simple(RETURN)]);
        assert!(!straight.has_join_points());
        let branching = Code::new(
            1,
            0,
            vec![
                Instruction::Simple(ICONST_0),
                Instruction::Branch {
                    opcode: IFNE,
                    target: Label(2),
                },
                Instruction::Simple(RETURN),
            ],
        );
        assert!(branching.has_join_points());
    }
}

//! `StackMapTable` frames (JVMS 4.7.4)
//!
//! Frames are held against instruction labels rather than byte offsets, so a
//! body can be relaid out without touching them. Encoding picks the most
//! compact frame type for each delta.

use super::bytes::{ByteReader, ByteWriter};
use super::code::Label;
use super::error::{ClassFileError, Result};

/// A verification type in a frame's locals or stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Class constant pool index
    Object(u16),
    /// Label of the `new` instruction that created the value
    Uninitialized(Label),
}

impl VerificationType {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        Ok(match tag {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(r.u16()?),
            8 => VerificationType::Uninitialized(Label(r.u16()? as u32)),
            _ => return Err(ClassFileError::UnknownVerificationType(tag)),
        })
    }

    fn write(&self, w: &mut ByteWriter, offset_of: &impl Fn(Label) -> u32) {
        match self {
            VerificationType::Top => w.u8(0),
            VerificationType::Integer => w.u8(1),
            VerificationType::Float => w.u8(2),
            VerificationType::Double => w.u8(3),
            VerificationType::Long => w.u8(4),
            VerificationType::Null => w.u8(5),
            VerificationType::UninitializedThis => w.u8(6),
            VerificationType::Object(class_index) => {
                w.u8(7);
                w.u16(*class_index);
            }
            VerificationType::Uninitialized(label) => {
                w.u8(8);
                w.u16(offset_of(*label) as u16);
            }
        }
    }
}

/// Frame contents relative to the previous frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    /// Drop the last 1..=3 locals
    Chop(u8),
    /// Add 1..=3 locals
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

/// One explicit frame, located at `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapFrame {
    pub target: Label,
    pub kind: FrameKind,
}

impl StackMapFrame {
    pub fn same(target: Label) -> Self {
        Self {
            target,
            kind: FrameKind::Same,
        }
    }

    pub(crate) fn for_each_label(&mut self, f: &mut impl FnMut(&mut Label)) {
        f(&mut self.target);
        match &mut self.kind {
            FrameKind::SameLocals1StackItem(VerificationType::Uninitialized(label)) => f(label),
            FrameKind::Append(locals) => visit_uninitialized(locals, f),
            FrameKind::Full { locals, stack } => {
                visit_uninitialized(locals, f);
                visit_uninitialized(stack, f);
            }
            _ => {}
        }
    }
}

fn visit_uninitialized(types: &mut [VerificationType], f: &mut impl FnMut(&mut Label)) {
    for ty in types {
        if let VerificationType::Uninitialized(label) = ty {
            f(label);
        }
    }
}

fn parse_types(r: &mut ByteReader<'_>, count: usize) -> Result<Vec<VerificationType>> {
    (0..count).map(|_| VerificationType::parse(r)).collect()
}

/// Parse a `StackMapTable` body. Targets and `Uninitialized` labels hold raw
/// byte offsets; the caller converts them to instruction labels.
pub(crate) fn parse(info: &[u8]) -> Result<Vec<StackMapFrame>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = r.u8()?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u32, FrameKind::Same),
            64..=127 => (
                (frame_type - 64) as u32,
                FrameKind::SameLocals1StackItem(VerificationType::parse(&mut r)?),
            ),
            247 => {
                let delta = r.u16()? as u32;
                (
                    delta,
                    FrameKind::SameLocals1StackItem(VerificationType::parse(&mut r)?),
                )
            }
            248..=250 => (r.u16()? as u32, FrameKind::Chop(251 - frame_type)),
            251 => (r.u16()? as u32, FrameKind::Same),
            252..=254 => {
                let delta = r.u16()? as u32;
                let locals = parse_types(&mut r, (frame_type - 251) as usize)?;
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = r.u16()? as u32;
                let local_count = r.u16()? as usize;
                let locals = parse_types(&mut r, local_count)?;
                let stack_count = r.u16()? as usize;
                let stack = parse_types(&mut r, stack_count)?;
                (delta, FrameKind::Full { locals, stack })
            }
            _ => return Err(ClassFileError::UnknownFrameType(frame_type)),
        };

        let offset = match previous {
            None => delta,
            Some(prev) => prev.saturating_add(delta).saturating_add(1),
        };
        previous = Some(offset);
        frames.push(StackMapFrame {
            target: Label(offset),
            kind,
        });
    }

    if !r.is_empty() {
        return Err(ClassFileError::TrailingBytes(r.remaining()));
    }
    Ok(frames)
}

/// Encode frames, translating labels through `offset_of`
pub(crate) fn write(frames: &[StackMapFrame], offset_of: impl Fn(Label) -> u32) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.count("stack map frames", frames.len())?;
    let mut previous: Option<u32> = None;

    for frame in frames {
        let offset = offset_of(frame.target);
        let delta = match previous {
            None => offset,
            Some(prev) if offset > prev => offset - prev - 1,
            Some(_) => return Err(ClassFileError::FrameOrder(offset)),
        };
        previous = Some(offset);
        let delta16 = u16::try_from(delta).map_err(|_| ClassFileError::FrameOrder(offset))?;

        match &frame.kind {
            FrameKind::Same if delta <= 63 => w.u8(delta as u8),
            FrameKind::Same => {
                w.u8(251);
                w.u16(delta16);
            }
            FrameKind::SameLocals1StackItem(ty) => {
                if delta <= 63 {
                    w.u8(64 + delta as u8);
                } else {
                    w.u8(247);
                    w.u16(delta16);
                }
                ty.write(&mut w, &offset_of);
            }
            FrameKind::Chop(k) => {
                w.u8(251 - k);
                w.u16(delta16);
            }
            FrameKind::Append(locals) => {
                w.u8(251 + locals.len() as u8);
                w.u16(delta16);
                for ty in locals {
                    ty.write(&mut w, &offset_of);
                }
            }
            FrameKind::Full { locals, stack } => {
                w.u8(255);
                w.u16(delta16);
                w.count("frame locals", locals.len())?;
                for ty in locals {
                    ty.write(&mut w, &offset_of);
                }
                w.count("frame stack", stack.len())?;
                for ty in stack {
                    ty.write(&mut w, &offset_of);
                }
            }
        }
    }
    Ok(w.into_inner())
}

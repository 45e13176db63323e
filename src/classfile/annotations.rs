//! `RuntimeVisibleAnnotations` / `RuntimeInvisibleAnnotations` (JVMS 4.7.16)

use super::bytes::{ByteReader, ByteWriter};
use super::constant_pool::ConstantPool;
use super::error::{ClassFileError, Result};
use super::Attribute;

pub const RUNTIME_VISIBLE: &str = "RuntimeVisibleAnnotations";
pub const RUNTIME_INVISIBLE: &str = "RuntimeInvisibleAnnotations";

/// One annotation: its type descriptor index plus element/value pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub type_index: u16,
    pub elements: Vec<(u16, ElementValue)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementValue {
    /// Primitive or string constant; `tag` is one of `BCDFIJSZs`
    Const { tag: u8, index: u16 },
    Enum { type_name_index: u16, const_name_index: u16 },
    Class { info_index: u16 },
    Annotation(Annotation),
    Array(Vec<ElementValue>),
}

impl Annotation {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let type_index = r.u16()?;
        let count = r.u16()?;
        let elements = (0..count)
            .map(|_| Ok((r.u16()?, ElementValue::parse(r)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            type_index,
            elements,
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.u16(self.type_index);
        w.count("annotation elements", self.elements.len())?;
        for (name_index, value) in &self.elements {
            w.u16(*name_index);
            value.write(w)?;
        }
        Ok(())
    }
}

impl ElementValue {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        Ok(match tag {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' => ElementValue::Const {
                tag,
                index: r.u16()?,
            },
            b'e' => ElementValue::Enum {
                type_name_index: r.u16()?,
                const_name_index: r.u16()?,
            },
            b'c' => ElementValue::Class {
                info_index: r.u16()?,
            },
            b'@' => ElementValue::Annotation(Annotation::parse(r)?),
            b'[' => {
                let count = r.u16()?;
                ElementValue::Array(
                    (0..count)
                        .map(|_| ElementValue::parse(r))
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            _ => return Err(ClassFileError::UnknownElementTag(tag as char)),
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            ElementValue::Const { tag, index } => {
                w.u8(*tag);
                w.u16(*index);
            }
            ElementValue::Enum {
                type_name_index,
                const_name_index,
            } => {
                w.u8(b'e');
                w.u16(*type_name_index);
                w.u16(*const_name_index);
            }
            ElementValue::Class { info_index } => {
                w.u8(b'c');
                w.u16(*info_index);
            }
            ElementValue::Annotation(annotation) => {
                w.u8(b'@');
                annotation.write(w)?;
            }
            ElementValue::Array(values) => {
                w.u8(b'[');
                w.count("array elements", values.len())?;
                for value in values {
                    value.write(w)?;
                }
            }
        }
        Ok(())
    }
}

/// Parse the body of an annotations attribute
pub fn parse(info: &[u8]) -> Result<Vec<Annotation>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let annotations = (0..count)
        .map(|_| Annotation::parse(&mut r))
        .collect::<Result<Vec<_>>>()?;
    if !r.is_empty() {
        return Err(ClassFileError::TrailingBytes(r.remaining()));
    }
    Ok(annotations)
}

/// Build an annotations attribute named `attribute_name`
pub fn attribute(
    cp: &mut ConstantPool,
    attribute_name: &str,
    annotations: &[Annotation],
) -> Result<Attribute> {
    let mut w = ByteWriter::new();
    w.count("annotations", annotations.len())?;
    for annotation in annotations {
        annotation.write(&mut w)?;
    }
    Ok(Attribute {
        name_index: cp.add_utf8(attribute_name)?,
        info: w.into_inner(),
    })
}

/// Whether any annotation attribute in `attributes` carries `descriptor`
pub fn has_annotation(
    attributes: &[Attribute],
    cp: &ConstantPool,
    descriptor: &str,
) -> Result<bool> {
    for attr in attributes {
        if !cp.utf8_eq(attr.name_index, RUNTIME_INVISIBLE)
            && !cp.utf8_eq(attr.name_index, RUNTIME_VISIBLE)
        {
            continue;
        }
        if parse(&attr.info)?
            .iter()
            .any(|a| cp.utf8_eq(a.type_index, descriptor))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

//! Constant pool model
//!
//! Entries keep their raw encoding so that a class whose pool is only appended
//! to re-serializes the original entries byte for byte. Names are decoded from
//! modified UTF-8 on demand.

use super::bytes::{ByteReader, ByteWriter};
use super::error::{ClassFileError, Result};

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// `REF_invokeStatic` method handle kind
pub const REF_INVOKE_STATIC: u8 = 6;

/// A single constant pool entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    /// Modified UTF-8 bytes, kept raw
    Utf8(Vec<u8>),
    Integer(i32),
    /// IEEE 754 bits
    Float(u32),
    Long(i64),
    /// IEEE 754 bits
    Double(u64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    FieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    MethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
}

impl Constant {
    /// Long and Double take two pool slots
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Constant::Utf8(_) => "Utf8",
            Constant::Integer(_) => "Integer",
            Constant::Float(_) => "Float",
            Constant::Long(_) => "Long",
            Constant::Double(_) => "Double",
            Constant::Class { .. } => "Class",
            Constant::String { .. } => "String",
            Constant::FieldRef { .. } => "Fieldref",
            Constant::MethodRef { .. } => "Methodref",
            Constant::InterfaceMethodRef { .. } => "InterfaceMethodref",
            Constant::NameAndType { .. } => "NameAndType",
            Constant::MethodHandle { .. } => "MethodHandle",
            Constant::MethodType { .. } => "MethodType",
            Constant::Dynamic { .. } => "Dynamic",
            Constant::InvokeDynamic { .. } => "InvokeDynamic",
            Constant::Module { .. } => "Module",
            Constant::Package { .. } => "Package",
        }
    }
}

/// Constant pool with 1-based indexing; slot 0 and the slot after every
/// Long/Double are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Option<Constant>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            entries: vec![None],
        }
    }

    pub(crate) fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let count = r.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(None);

        while entries.len() < count as usize {
            let index = entries.len() as u16;
            let tag = r.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(r.bytes(len)?.to_vec())
                }
                TAG_INTEGER => Constant::Integer(r.i32()?),
                TAG_FLOAT => Constant::Float(r.u32()?),
                TAG_LONG => Constant::Long(r.u64()? as i64),
                TAG_DOUBLE => Constant::Double(r.u64()?),
                TAG_CLASS => Constant::Class {
                    name_index: r.u16()?,
                },
                TAG_STRING => Constant::String {
                    string_index: r.u16()?,
                },
                TAG_FIELDREF => Constant::FieldRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                TAG_METHODREF => Constant::MethodRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodRef {
                    class_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name_index: r.u16()?,
                    descriptor_index: r.u16()?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    reference_kind: r.u8()?,
                    reference_index: r.u16()?,
                },
                TAG_METHOD_TYPE => Constant::MethodType {
                    descriptor_index: r.u16()?,
                },
                TAG_DYNAMIC => Constant::Dynamic {
                    bootstrap_method_attr_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap_method_attr_index: r.u16()?,
                    name_and_type_index: r.u16()?,
                },
                TAG_MODULE => Constant::Module {
                    name_index: r.u16()?,
                },
                TAG_PACKAGE => Constant::Package {
                    name_index: r.u16()?,
                },
                _ => return Err(ClassFileError::UnknownConstantTag { tag, index }),
            };
            let wide = constant.is_wide();
            entries.push(Some(constant));
            if wide {
                entries.push(None);
            }
        }

        // A trailing Long/Double may claim one slot past `count`
        if entries.len() > count as usize {
            return Err(ClassFileError::BadConstantIndex(count));
        }

        Ok(Self { entries })
    }

    pub(crate) fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.count("constant pool", self.entries.len())?;
        for constant in self.entries.iter().flatten() {
            match constant {
                Constant::Utf8(bytes) => {
                    w.u8(TAG_UTF8);
                    w.count("utf8 bytes", bytes.len())?;
                    w.bytes(bytes);
                }
                Constant::Integer(v) => {
                    w.u8(TAG_INTEGER);
                    w.i32(*v);
                }
                Constant::Float(bits) => {
                    w.u8(TAG_FLOAT);
                    w.u32(*bits);
                }
                Constant::Long(v) => {
                    w.u8(TAG_LONG);
                    w.u64(*v as u64);
                }
                Constant::Double(bits) => {
                    w.u8(TAG_DOUBLE);
                    w.u64(*bits);
                }
                Constant::Class { name_index } => {
                    w.u8(TAG_CLASS);
                    w.u16(*name_index);
                }
                Constant::String { string_index } => {
                    w.u8(TAG_STRING);
                    w.u16(*string_index);
                }
                Constant::FieldRef {
                    class_index,
                    name_and_type_index,
                } => {
                    w.u8(TAG_FIELDREF);
                    w.u16(*class_index);
                    w.u16(*name_and_type_index);
                }
                Constant::MethodRef {
                    class_index,
                    name_and_type_index,
                } => {
                    w.u8(TAG_METHODREF);
                    w.u16(*class_index);
                    w.u16(*name_and_type_index);
                }
                Constant::InterfaceMethodRef {
                    class_index,
                    name_and_type_index,
                } => {
                    w.u8(TAG_INTERFACE_METHODREF);
                    w.u16(*class_index);
                    w.u16(*name_and_type_index);
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    w.u8(TAG_NAME_AND_TYPE);
                    w.u16(*name_index);
                    w.u16(*descriptor_index);
                }
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    w.u8(TAG_METHOD_HANDLE);
                    w.u8(*reference_kind);
                    w.u16(*reference_index);
                }
                Constant::MethodType { descriptor_index } => {
                    w.u8(TAG_METHOD_TYPE);
                    w.u16(*descriptor_index);
                }
                Constant::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    w.u8(TAG_DYNAMIC);
                    w.u16(*bootstrap_method_attr_index);
                    w.u16(*name_and_type_index);
                }
                Constant::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    w.u8(TAG_INVOKE_DYNAMIC);
                    w.u16(*bootstrap_method_attr_index);
                    w.u16(*name_and_type_index);
                }
                Constant::Module { name_index } => {
                    w.u8(TAG_MODULE);
                    w.u16(*name_index);
                }
                Constant::Package { name_index } => {
                    w.u8(TAG_PACKAGE);
                    w.u16(*name_index);
                }
            }
        }
        Ok(())
    }

    /// Number of slots, including the unused slot 0
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    /// Look up an entry by index
    pub fn get(&self, index: u16) -> Result<&Constant> {
        self.entries
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(ClassFileError::BadConstantIndex(index))
    }

    /// Raw modified UTF-8 bytes of a Utf8 entry
    pub fn utf8_bytes(&self, index: u16) -> Result<&[u8]> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(bytes),
            _ => Err(ClassFileError::ConstantType {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// Decoded string of a Utf8 entry
    pub fn utf8(&self, index: u16) -> Result<String> {
        decode_modified_utf8(self.utf8_bytes(index)?).ok_or(ClassFileError::BadUtf8(index))
    }

    /// Compare a Utf8 entry against a string without decoding it
    pub fn utf8_eq(&self, index: u16, value: &str) -> bool {
        self.utf8_bytes(index)
            .map(|bytes| bytes == encode_modified_utf8(value).as_slice())
            .unwrap_or(false)
    }

    /// Internal name referenced by a Class entry
    pub fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(ClassFileError::ConstantType {
                index,
                expected: "Class",
            }),
        }
    }

    /// Find an existing equal entry or append a new one
    pub fn intern(&mut self, constant: Constant) -> Result<u16> {
        if let Some(index) = self
            .entries
            .iter()
            .position(|slot| slot.as_ref() == Some(&constant))
        {
            return Ok(index as u16);
        }

        let index = self.entries.len();
        let needed = if constant.is_wide() { 2 } else { 1 };
        if index + needed > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }

        tracing::trace!(index, kind = constant.kind(), "constant pool append");
        let wide = constant.is_wide();
        self.entries.push(Some(constant));
        if wide {
            self.entries.push(None);
        }
        Ok(index as u16)
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(Constant::Utf8(encode_modified_utf8(value)))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16> {
        let name_index = self.add_utf8(internal_name)?;
        self.intern(Constant::Class { name_index })
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16> {
        let string_index = self.add_utf8(value)?;
        self.intern(Constant::String { string_index })
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::FieldRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::MethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::InterfaceMethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_method_handle(&mut self, reference_kind: u8, reference_index: u16) -> Result<u16> {
        self.intern(Constant::MethodHandle {
            reference_kind,
            reference_index,
        })
    }

    pub fn add_invoke_dynamic(
        &mut self,
        bootstrap_method_attr_index: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::InvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        })
    }

    /// Resolve a Fieldref/Methodref/InterfaceMethodref into (owner, name, descriptor)
    pub fn member_ref(&self, index: u16) -> Result<(String, String, String)> {
        let (class_index, nat_index) = match self.get(index)? {
            Constant::FieldRef {
                class_index,
                name_and_type_index,
            }
            | Constant::MethodRef {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index),
            _ => {
                return Err(ClassFileError::ConstantType {
                    index,
                    expected: "member reference",
                })
            }
        };
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok((self.class_name(class_index)?, name, descriptor))
    }

    /// Resolve a NameAndType entry
    pub fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(ClassFileError::ConstantType {
                index,
                expected: "NameAndType",
            }),
        }
    }
}

/// Decode modified UTF-8 (JVMS 4.4.7); `None` on malformed input or lone surrogates
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            if b == 0 {
                return None;
            }
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1)?;
            if b2 & 0xC0 != 0x80 {
                return None;
            }
            units.push((((b & 0x1F) as u16) << 6) | (b2 & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1)?;
            let b3 = *bytes.get(i + 2)?;
            if b2 & 0xC0 != 0x80 || b3 & 0xC0 != 0x80 {
                return None;
            }
            units.push(
                (((b & 0x0F) as u16) << 12) | (((b2 & 0x3F) as u16) << 6) | (b3 & 0x3F) as u16,
            );
            i += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}

/// Encode a string as modified UTF-8
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

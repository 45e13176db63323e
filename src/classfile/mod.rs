//! Class file reading and writing
//!
//! Just enough of JVMS chapter 4 to rewrite a class without disturbing what
//! is not touched: the constant pool keeps raw entries, unknown attributes are
//! carried as bytes, and method bodies are decoded only when asked for.

pub mod annotations;
mod bytes;
pub mod code;
pub mod constant_pool;
mod error;
pub mod opcodes;
pub mod stackmap;

use bytes::{ByteReader, ByteWriter};

pub use code::{Code, CodeAttribute, ExceptionHandler, Instruction, Label};
pub use constant_pool::{Constant, ConstantPool};
pub use error::{ClassFileError, Result};
pub use stackmap::{FrameKind, StackMapFrame, VerificationType};

pub const MAGIC: u32 = 0xCAFE_BABE;

/// First version whose verifier requires `StackMapTable`
pub const VERSION_STACK_MAP: u16 = 50;
/// First version carrying `invokedynamic`
pub const VERSION_INVOKEDYNAMIC: u16 = 51;
/// First version allowing code on interface methods
pub const VERSION_INTERFACE_CODE: u16 = 52;

/// Access flags shared by classes, fields and methods
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
    pub const ANNOTATION: u16 = 0x2000;
    pub const MODULE: u16 = 0x8000;
}

/// An attribute kept as its raw body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    pub(crate) fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let name_index = r.u16()?;
        let len = r.u32()? as usize;
        Ok(Self {
            name_index,
            info: r.bytes(len)?.to_vec(),
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.u16(self.name_index);
        w.blob("attribute", &self.info)
    }
}

fn parse_attributes(r: &mut ByteReader<'_>) -> Result<Vec<Attribute>> {
    let count = r.u16()?;
    (0..count).map(|_| Attribute::parse(r)).collect()
}

fn write_attributes(w: &mut ByteWriter, attributes: &[Attribute]) -> Result<()> {
    w.count("attributes", attributes.len())?;
    for attr in attributes {
        attr.write(w)?;
    }
    Ok(())
}

/// A field or method: both share one layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

pub type FieldInfo = MemberInfo;
pub type MethodInfo = MemberInfo;

impl MemberInfo {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            access_flags: r.u16()?,
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            attributes: parse_attributes(r)?,
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.u16(self.access_flags);
        w.u16(self.name_index);
        w.u16(self.descriptor_index);
        write_attributes(w, &self.attributes)
    }

    pub fn name(&self, cp: &ConstantPool) -> Result<String> {
        cp.utf8(self.name_index)
    }

    pub fn descriptor(&self, cp: &ConstantPool) -> Result<String> {
        cp.utf8(self.descriptor_index)
    }

    /// Match by name and, when given, descriptor
    pub fn is(&self, cp: &ConstantPool, name: &str, descriptor: Option<&str>) -> bool {
        cp.utf8_eq(self.name_index, name)
            && descriptor.map_or(true, |d| cp.utf8_eq(self.descriptor_index, d))
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    fn code_slot(&self, cp: &ConstantPool) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attr| cp.utf8_eq(attr.name_index, "Code"))
    }

    /// Whether the member has a body (abstract and native methods do not)
    pub fn has_code(&self, cp: &ConstantPool) -> bool {
        self.code_slot(cp).is_some()
    }

    /// Decode the method body, if any
    pub fn code(&self, cp: &ConstantPool) -> Result<Option<Code>> {
        self.code_slot(cp)
            .map(|slot| Code::decode(&self.attributes[slot].info, cp))
            .transpose()
    }

    /// Replace (or attach) the method body
    pub fn set_code(&mut self, cp: &mut ConstantPool, code: &Code) -> Result<()> {
        let info = code.encode()?;
        match self.code_slot(cp) {
            Some(slot) => self.attributes[slot].info = info,
            None => {
                let name_index = cp.add_utf8("Code")?;
                self.attributes.push(Attribute { name_index, info });
            }
        }
        Ok(())
    }

    /// Whether the member carries an annotation of type `descriptor`
    pub fn has_annotation(&self, cp: &ConstantPool, descriptor: &str) -> Result<bool> {
        annotations::has_annotation(&self.attributes, cp, descriptor)
    }
}

/// A parsed class file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Start an empty class `internal_name` extending `super_name`
    pub fn new(
        internal_name: &str,
        super_name: &str,
        access_flags: u16,
        major_version: u16,
    ) -> Result<Self> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.add_class(internal_name)?;
        let super_class = constant_pool.add_class(super_name)?;
        Ok(Self {
            minor_version: 0,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor_version = r.u16()?;
        let major_version = r.u16()?;
        let constant_pool = ConstantPool::parse(&mut r)?;
        let access_flags = r.u16()?;
        let this_class = r.u16()?;
        let super_class = r.u16()?;

        let interface_count = r.u16()?;
        let interfaces = (0..interface_count)
            .map(|_| r.u16())
            .collect::<Result<Vec<_>>>()?;
        let field_count = r.u16()?;
        let fields = (0..field_count)
            .map(|_| MemberInfo::parse(&mut r))
            .collect::<Result<Vec<_>>>()?;
        let method_count = r.u16()?;
        let methods = (0..method_count)
            .map(|_| MemberInfo::parse(&mut r))
            .collect::<Result<Vec<_>>>()?;
        let attributes = parse_attributes(&mut r)?;

        if !r.is_empty() {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        w.u32(MAGIC);
        w.u16(self.minor_version);
        w.u16(self.major_version);
        self.constant_pool.write(&mut w)?;
        w.u16(self.access_flags);
        w.u16(self.this_class);
        w.u16(self.super_class);
        w.count("interfaces", self.interfaces.len())?;
        for interface in &self.interfaces {
            w.u16(*interface);
        }
        w.count("fields", self.fields.len())?;
        for field in &self.fields {
            field.write(&mut w)?;
        }
        w.count("methods", self.methods.len())?;
        for method in &self.methods {
            method.write(&mut w)?;
        }
        write_attributes(&mut w, &self.attributes)?;
        Ok(w.into_inner())
    }

    /// Internal name, e.g. `app/Foo`
    pub fn internal_name(&self) -> Result<String> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn super_name(&self) -> Result<String> {
        self.constant_pool.class_name(self.super_class)
    }

    /// Binary name, e.g. `app.Foo`
    pub fn binary_name(&self) -> Result<String> {
        Ok(self.internal_name()?.replace('/', "."))
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    pub fn is_module(&self) -> bool {
        self.access_flags & access::MODULE != 0
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.is(&self.constant_pool, name, Some(descriptor)))
    }

    /// Whether any field or method is named `name`
    pub fn declares_member(&self, name: &str) -> bool {
        self.fields
            .iter()
            .chain(&self.methods)
            .any(|m| m.is(&self.constant_pool, name, None))
    }

    pub fn add_interface(&mut self, internal_name: &str) -> Result<()> {
        let index = self.constant_pool.add_class(internal_name)?;
        if !self.interfaces.contains(&index) {
            self.interfaces.push(index);
        }
        Ok(())
    }

    pub fn add_field(&mut self, access_flags: u16, name: &str, descriptor: &str) -> Result<usize> {
        if self
            .fields
            .iter()
            .any(|f| f.is(&self.constant_pool, name, Some(descriptor)))
        {
            return Err(ClassFileError::DuplicateMember(name.to_string()));
        }
        self.fields.push(MemberInfo {
            access_flags,
            name_index: self.constant_pool.add_utf8(name)?,
            descriptor_index: self.constant_pool.add_utf8(descriptor)?,
            attributes: Vec::new(),
        });
        Ok(self.fields.len() - 1)
    }

    /// Append a method; `code` is `None` for abstract and native methods
    pub fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Option<&Code>,
    ) -> Result<usize> {
        if self.find_method(name, descriptor).is_some() {
            return Err(ClassFileError::DuplicateMember(format!("{name}{descriptor}")));
        }
        let mut method = MemberInfo {
            access_flags,
            name_index: self.constant_pool.add_utf8(name)?,
            descriptor_index: self.constant_pool.add_utf8(descriptor)?,
            attributes: Vec::new(),
        };
        if let Some(code) = code {
            method.set_code(&mut self.constant_pool, code)?;
        }
        self.methods.push(method);
        Ok(self.methods.len() - 1)
    }

    /// Decode and re-encode the body of method `index` through `edit`
    pub fn edit_code(
        &mut self,
        index: usize,
        edit: impl FnOnce(&mut Code, &mut ConstantPool) -> Result<()>,
    ) -> Result<bool> {
        let Some(method) = self.methods.get_mut(index) else {
            return Ok(false);
        };
        let Some(mut code) = method.code(&self.constant_pool)? else {
            return Ok(false);
        };
        edit(&mut code, &mut self.constant_pool)?;
        method.set_code(&mut self.constant_pool, &code)?;
        Ok(true)
    }

    /// Add an entry to `BootstrapMethods`, reusing an identical one; returns its index
    pub fn add_bootstrap_method(&mut self, method_handle: u16, arguments: &[u16]) -> Result<u16> {
        let slot = self
            .attributes
            .iter()
            .position(|attr| self.constant_pool.utf8_eq(attr.name_index, "BootstrapMethods"));
        let mut entries = match slot {
            Some(slot) => parse_bootstrap_methods(&self.attributes[slot].info)?,
            None => Vec::new(),
        };

        let wanted = (method_handle, arguments.to_vec());
        if let Some(existing) = entries.iter().position(|e| *e == wanted) {
            return Ok(existing as u16);
        }
        entries.push(wanted);
        let index = u16::try_from(entries.len() - 1).map_err(|_| ClassFileError::TooMany {
            what: "bootstrap methods",
            count: entries.len(),
        })?;

        let mut w = ByteWriter::new();
        w.count("bootstrap methods", entries.len())?;
        for (handle, args) in &entries {
            w.u16(*handle);
            w.count("bootstrap arguments", args.len())?;
            for arg in args {
                w.u16(*arg);
            }
        }
        let info = w.into_inner();
        match slot {
            Some(slot) => self.attributes[slot].info = info,
            None => {
                let name_index = self.constant_pool.add_utf8("BootstrapMethods")?;
                self.attributes.push(Attribute { name_index, info });
            }
        }
        Ok(index)
    }
}

fn parse_bootstrap_methods(info: &[u8]) -> Result<Vec<(u16, Vec<u16>)>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    (0..count)
        .map(|_| {
            let handle = r.u16()?;
            let arg_count = r.u16()?;
            let args = (0..arg_count).map(|_| r.u16()).collect::<Result<Vec<_>>>()?;
            Ok((handle, args))
        })
        .collect()
}

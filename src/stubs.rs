//! Class files for the Java side of the bridge
//!
//! Applications compile against `huella.DoNotTrack` to opt methods out, and
//! instrumented classes link against `huella.Runtime`. Its static initializer
//! loads the native library (see [`crate::jni_bridge`]), installs the runtime
//! from the `huella.args` system property and registers `huella.Runtime$Flush`
//! as a shutdown hook performing the final flush.
//!
//! ```text
//! direct:     huella$notify ──► Runtime.record (native)
//! call-site:  huella$notify ──invokedynamic──► MutableCallSite
//!                 bootstrap: link (native) → site bound to armed(site, handle)
//!                 armed:     fire (native) → setTarget(disarmed)
//! ```

use std::path::PathBuf;

use crate::classfile::annotations::{self, Annotation, ElementValue, RUNTIME_INVISIBLE, RUNTIME_VISIBLE};
use crate::classfile::constant_pool::REF_INVOKE_STATIC;
use crate::classfile::opcodes::*;
use crate::classfile::{access, ClassFile, Code, Instruction, Result};
use crate::jni_bridge;
use crate::marker;
use crate::runtime;

/// Version the stubs are written with; `ldc` of a method handle needs 51+
const STUB_VERSION: u16 = 52;

/// Internal name of the shutdown hook thread
pub const FLUSH_HOOK_CLASS: &str = "huella/Runtime$Flush";

const CALL_SITE: &str = "java/lang/invoke/MutableCallSite";
const METHOD_HANDLE: &str = "Ljava/lang/invoke/MethodHandle;";
const SET_TARGET: &str = "(Ljava/lang/invoke/MethodHandle;)V";
/// Live target, bound to its site and handle by `bootstrap`
const ARMED_METHOD: &str = "armed";
const ARMED_DESCRIPTOR: &str = "(Ljava/lang/invoke/MutableCallSite;JLjava/lang/String;)V";
/// No-op target a site switches to after its first call
const DISARMED_METHOD: &str = "disarmed";

/// A generated class and where it belongs under a class path root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stub {
    pub internal_name: &'static str,
    pub bytes: Vec<u8>,
}

impl Stub {
    /// Path relative to a class path root, e.g. `huella/Runtime.class`
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.class", self.internal_name))
    }
}

pub fn generate() -> Result<Vec<Stub>> {
    Ok(vec![
        Stub {
            internal_name: marker::DO_NOT_TRACK,
            bytes: do_not_track()?.to_bytes()?,
        },
        Stub {
            internal_name: runtime::BRIDGE_CLASS,
            bytes: bridge()?.to_bytes()?,
        },
        Stub {
            internal_name: FLUSH_HOOK_CLASS,
            bytes: flush_hook()?.to_bytes()?,
        },
    ])
}

/// `@Retention(CLASS) @Target(METHOD) public @interface DoNotTrack {}`
fn do_not_track() -> Result<ClassFile> {
    let mut class = ClassFile::new(
        marker::DO_NOT_TRACK,
        "java/lang/Object",
        access::PUBLIC | access::INTERFACE | access::ABSTRACT | access::ANNOTATION,
        STUB_VERSION,
    )?;
    class.add_interface("java/lang/annotation/Annotation")?;

    let cp = &mut class.constant_pool;
    let value = cp.add_utf8("value")?;
    let retention = Annotation {
        type_index: cp.add_utf8("Ljava/lang/annotation/Retention;")?,
        elements: vec![(
            value,
            ElementValue::Enum {
                type_name_index: cp.add_utf8("Ljava/lang/annotation/RetentionPolicy;")?,
                const_name_index: cp.add_utf8("CLASS")?,
            },
        )],
    };
    let target = Annotation {
        type_index: cp.add_utf8("Ljava/lang/annotation/Target;")?,
        elements: vec![(
            value,
            ElementValue::Array(vec![ElementValue::Enum {
                type_name_index: cp.add_utf8("Ljava/lang/annotation/ElementType;")?,
                const_name_index: cp.add_utf8("METHOD")?,
            }]),
        )],
    };
    let attr = annotations::attribute(cp, RUNTIME_VISIBLE, &[retention, target])?;
    class.attributes.push(attr);
    Ok(class)
}

/// Add a method with a body and mark it `@DoNotTrack`, so the bridge never
/// reports itself even when a prefix happens to match it
fn add_untracked(
    class: &mut ClassFile,
    access_flags: u16,
    name: &str,
    descriptor: &str,
    code: &Code,
) -> Result<usize> {
    let index = class.add_method(access_flags, name, descriptor, Some(code))?;
    let marker = Annotation {
        type_index: class.constant_pool.add_utf8(marker::DO_NOT_TRACK_DESCRIPTOR)?,
        elements: vec![],
    };
    let attr = annotations::attribute(&mut class.constant_pool, RUNTIME_INVISIBLE, &[marker])?;
    class.methods[index].attributes.push(attr);
    Ok(index)
}

fn super_constructor(class: &mut ClassFile, super_name: &str) -> Result<Code> {
    let init = class
        .constant_pool
        .add_method_ref(super_name, "<init>", "()V")?;
    Ok(Code::new(
        1,
        1,
        vec![
            Instruction::Local {
                opcode: ALOAD,
                index: 0,
            },
            Instruction::Constant {
                opcode: INVOKESPECIAL,
                index: init,
            },
            Instruction::Simple(RETURN),
        ],
    ))
}

/// `public final class Runtime`: natives bound by the JNI bridge plus the
/// bytecode that drives the self-disarming call sites
fn bridge() -> Result<ClassFile> {
    let mut class = ClassFile::new(
        runtime::BRIDGE_CLASS,
        "java/lang/Object",
        access::PUBLIC | access::FINAL | access::SUPER,
        STUB_VERSION,
    )?;
    let constructor = super_constructor(&mut class, "java/lang/Object")?;
    add_untracked(&mut class, access::PRIVATE, "<init>", "()V", &constructor)?;

    for native in &jni_bridge::NATIVES {
        let visibility = if native.method == runtime::RECORD_METHOD {
            access::PUBLIC
        } else {
            0
        };
        class.add_method(
            visibility | access::STATIC | access::NATIVE,
            native.method,
            native.descriptor,
            None,
        )?;
    }

    let clinit = static_init(&mut class)?;
    add_untracked(&mut class, access::STATIC, "<clinit>", "()V", &clinit)?;
    let bootstrap = bootstrap_body(&mut class)?;
    add_untracked(
        &mut class,
        access::PUBLIC | access::STATIC,
        runtime::BOOTSTRAP_METHOD,
        runtime::BOOTSTRAP_DESCRIPTOR,
        &bootstrap,
    )?;
    let armed = armed_body(&mut class)?;
    add_untracked(
        &mut class,
        access::PRIVATE | access::STATIC,
        ARMED_METHOD,
        ARMED_DESCRIPTOR,
        &armed,
    )?;
    let disarmed = Code::new(0, 1, vec![Instruction::Simple(RETURN)]);
    add_untracked(
        &mut class,
        access::PRIVATE | access::STATIC,
        DISARMED_METHOD,
        runtime::SITE_DESCRIPTOR,
        &disarmed,
    )?;
    Ok(class)
}

/// ```text
/// System.loadLibrary("huella");
/// install(System.getProperty("huella.args"));
/// java.lang.Runtime.getRuntime().addShutdownHook(new Runtime$Flush());
/// ```
fn static_init(class: &mut ClassFile) -> Result<Code> {
    let cp = &mut class.constant_pool;
    let library = cp.add_string(jni_bridge::LIBRARY_NAME)?;
    let load_library = cp.add_method_ref("java/lang/System", "loadLibrary", "(Ljava/lang/String;)V")?;
    let property = cp.add_string(jni_bridge::ARGS_PROPERTY)?;
    let get_property = cp.add_method_ref(
        "java/lang/System",
        "getProperty",
        "(Ljava/lang/String;)Ljava/lang/String;",
    )?;
    let install = cp.add_method_ref(runtime::BRIDGE_CLASS, "install", "(Ljava/lang/String;)V")?;
    let get_runtime = cp.add_method_ref("java/lang/Runtime", "getRuntime", "()Ljava/lang/Runtime;")?;
    let hook_class = cp.add_class(FLUSH_HOOK_CLASS)?;
    let hook_init = cp.add_method_ref(FLUSH_HOOK_CLASS, "<init>", "()V")?;
    let add_hook = cp.add_method_ref(
        "java/lang/Runtime",
        "addShutdownHook",
        "(Ljava/lang/Thread;)V",
    )?;

    let constant = |opcode, index| Instruction::Constant { opcode, index };
    Ok(Code::new(
        3,
        0,
        vec![
            constant(LDC, library),
            constant(INVOKESTATIC, load_library),
            constant(LDC, property),
            constant(INVOKESTATIC, get_property),
            constant(INVOKESTATIC, install),
            constant(INVOKESTATIC, get_runtime),
            constant(NEW, hook_class),
            Instruction::Simple(DUP),
            constant(INVOKESPECIAL, hook_init),
            constant(INVOKEVIRTUAL, add_hook),
            Instruction::Simple(RETURN),
        ],
    ))
}

/// ```text
/// MutableCallSite site = new MutableCallSite(type);
/// long handle = link(lookup.lookupClass().getName(), name, type.toMethodDescriptorString());
/// site.setTarget(MethodHandles.insertArguments(armed, 0, site, handle));
/// return site;
/// ```
fn bootstrap_body(class: &mut ClassFile) -> Result<Code> {
    let cp = &mut class.constant_pool;
    let site_class = cp.add_class(CALL_SITE)?;
    let site_init = cp.add_method_ref(CALL_SITE, "<init>", "(Ljava/lang/invoke/MethodType;)V")?;
    let lookup_class = cp.add_method_ref(
        "java/lang/invoke/MethodHandles$Lookup",
        "lookupClass",
        "()Ljava/lang/Class;",
    )?;
    let get_name = cp.add_method_ref("java/lang/Class", "getName", "()Ljava/lang/String;")?;
    let descriptor_string = cp.add_method_ref(
        "java/lang/invoke/MethodType",
        "toMethodDescriptorString",
        "()Ljava/lang/String;",
    )?;
    let link = cp.add_method_ref(
        runtime::BRIDGE_CLASS,
        "link",
        "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;)J",
    )?;
    let armed_ref = cp.add_method_ref(runtime::BRIDGE_CLASS, ARMED_METHOD, ARMED_DESCRIPTOR)?;
    let armed = cp.add_method_handle(REF_INVOKE_STATIC, armed_ref)?;
    let object = cp.add_class("java/lang/Object")?;
    let box_long = cp.add_method_ref("java/lang/Long", "valueOf", "(J)Ljava/lang/Long;")?;
    let insert_arguments = cp.add_method_ref(
        "java/lang/invoke/MethodHandles",
        "insertArguments",
        &format!("({METHOD_HANDLE}I[Ljava/lang/Object;){METHOD_HANDLE}"),
    )?;
    let set_target = cp.add_method_ref(CALL_SITE, "setTarget", SET_TARGET)?;

    let constant = |opcode, index| Instruction::Constant { opcode, index };
    let local = |opcode, index| Instruction::Local { opcode, index };
    // locals: 0 lookup, 1 name, 2 type, 3 site, 4-5 handle
    Ok(Code::new(
        8,
        6,
        vec![
            constant(NEW, site_class),
            Instruction::Simple(DUP),
            local(ALOAD, 2),
            constant(INVOKESPECIAL, site_init),
            local(ASTORE, 3),
            local(ALOAD, 0),
            constant(INVOKEVIRTUAL, lookup_class),
            constant(INVOKEVIRTUAL, get_name),
            local(ALOAD, 1),
            local(ALOAD, 2),
            constant(INVOKEVIRTUAL, descriptor_string),
            constant(INVOKESTATIC, link),
            local(LSTORE, 4),
            local(ALOAD, 3),
            constant(LDC, armed),
            Instruction::Simple(ICONST_0),
            Instruction::Simple(ICONST_2),
            constant(ANEWARRAY, object),
            Instruction::Simple(DUP),
            Instruction::Simple(ICONST_0),
            local(ALOAD, 3),
            Instruction::Simple(AASTORE),
            Instruction::Simple(DUP),
            Instruction::Simple(ICONST_1),
            local(LLOAD, 4),
            constant(INVOKESTATIC, box_long),
            Instruction::Simple(AASTORE),
            constant(INVOKESTATIC, insert_arguments),
            constant(INVOKEVIRTUAL, set_target),
            local(ALOAD, 3),
            Instruction::Simple(ARETURN),
        ],
    ))
}

/// `fire(handle, unit); site.setTarget(disarmed);`
///
/// Racing first callers all reach `fire`; the native side lets one of them
/// report.
fn armed_body(class: &mut ClassFile) -> Result<Code> {
    let cp = &mut class.constant_pool;
    let fire = cp.add_method_ref(runtime::BRIDGE_CLASS, "fire", "(JLjava/lang/String;)V")?;
    let disarmed_ref = cp.add_method_ref(
        runtime::BRIDGE_CLASS,
        DISARMED_METHOD,
        runtime::SITE_DESCRIPTOR,
    )?;
    let disarmed = cp.add_method_handle(REF_INVOKE_STATIC, disarmed_ref)?;
    let set_target = cp.add_method_ref(CALL_SITE, "setTarget", SET_TARGET)?;

    let constant = |opcode, index| Instruction::Constant { opcode, index };
    let local = |opcode, index| Instruction::Local { opcode, index };
    // locals: 0 site, 1-2 handle, 3 unit
    Ok(Code::new(
        3,
        4,
        vec![
            local(LLOAD, 1),
            local(ALOAD, 3),
            constant(INVOKESTATIC, fire),
            local(ALOAD, 0),
            constant(LDC, disarmed),
            constant(INVOKEVIRTUAL, set_target),
            Instruction::Simple(RETURN),
        ],
    ))
}

/// `final class Runtime$Flush extends Thread { public void run() { Runtime.shutdown(); } }`
fn flush_hook() -> Result<ClassFile> {
    let mut class = ClassFile::new(
        FLUSH_HOOK_CLASS,
        "java/lang/Thread",
        access::FINAL | access::SUPER,
        STUB_VERSION,
    )?;
    let constructor = super_constructor(&mut class, "java/lang/Thread")?;
    add_untracked(&mut class, 0, "<init>", "()V", &constructor)?;

    let shutdown = class
        .constant_pool
        .add_method_ref(runtime::BRIDGE_CLASS, "shutdown", "()V")?;
    let run = Code::new(
        0,
        1,
        vec![
            Instruction::Constant {
                opcode: INVOKESTATIC,
                index: shutdown,
            },
            Instruction::Simple(RETURN),
        ],
    );
    add_untracked(&mut class, access::PUBLIC, "run", "()V", &run)?;
    Ok(class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{classify, MethodStatus};

    fn opcodes(class: &ClassFile, name: &str, descriptor: &str) -> Vec<u8> {
        let index = class.find_method(name, descriptor).unwrap();
        class.methods[index]
            .code(&class.constant_pool)
            .unwrap()
            .unwrap()
            .instructions
            .iter()
            .map(Instruction::opcode)
            .collect()
    }

    fn invoked(class: &ClassFile, name: &str, descriptor: &str) -> Vec<(String, String, String)> {
        let index = class.find_method(name, descriptor).unwrap();
        let code = class.methods[index]
            .code(&class.constant_pool)
            .unwrap()
            .unwrap();
        code.instructions
            .iter()
            .filter_map(|insn| match insn {
                Instruction::Constant {
                    opcode: INVOKESTATIC | INVOKEVIRTUAL | INVOKESPECIAL,
                    index,
                } => Some(class.constant_pool.member_ref(*index).unwrap()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_stubs_parse_back() {
        let stubs = generate().unwrap();
        assert_eq!(stubs.len(), 3);
        for stub in &stubs {
            let class = ClassFile::parse(&stub.bytes).unwrap();
            assert_eq!(class.internal_name().unwrap(), stub.internal_name);
        }
        assert_eq!(
            stubs[1].relative_path(),
            PathBuf::from("huella/Runtime.class")
        );
        assert_eq!(
            stubs[2].relative_path(),
            PathBuf::from("huella/Runtime$Flush.class")
        );
    }

    #[test]
    fn test_annotation_type_shape() {
        let class = do_not_track().unwrap();
        assert!(class.is_interface());
        assert_ne!(class.access_flags & access::ANNOTATION, 0);
        let parsed = annotations::parse(&class.attributes[0].info).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(class
            .constant_pool
            .utf8_eq(parsed[0].type_index, "Ljava/lang/annotation/Retention;"));
    }

    #[test]
    fn test_bridge_declares_every_bound_native() {
        let class = bridge().unwrap();
        for native in &jni_bridge::NATIVES {
            let index = class.find_method(native.method, native.descriptor).unwrap();
            let method = &class.methods[index];
            assert_ne!(method.access_flags & access::NATIVE, 0, "{}", native.method);
            assert!(!method.has_code(&class.constant_pool));
        }
        let record = class
            .find_method(runtime::RECORD_METHOD, runtime::RECORD_DESCRIPTOR)
            .unwrap();
        assert_ne!(class.methods[record].access_flags & access::PUBLIC, 0);

        // every other method has a body
        let natives = class
            .methods
            .iter()
            .filter(|m| m.access_flags & access::NATIVE != 0)
            .count();
        assert_eq!(natives, jni_bridge::NATIVES.len());
    }

    #[test]
    fn test_static_init_loads_library_and_registers_flush_hook() {
        let class = bridge().unwrap();
        assert_eq!(
            opcodes(&class, "<clinit>", "()V"),
            vec![
                LDC,
                INVOKESTATIC,
                LDC,
                INVOKESTATIC,
                INVOKESTATIC,
                INVOKESTATIC,
                NEW,
                DUP,
                INVOKESPECIAL,
                INVOKEVIRTUAL,
                RETURN
            ]
        );
        let calls: Vec<_> = invoked(&class, "<clinit>", "()V")
            .into_iter()
            .map(|(owner, name, _)| format!("{owner}.{name}"))
            .collect();
        assert_eq!(
            calls,
            vec![
                "java/lang/System.loadLibrary",
                "java/lang/System.getProperty",
                "huella/Runtime.install",
                "java/lang/Runtime.getRuntime",
                "huella/Runtime$Flush.<init>",
                "java/lang/Runtime.addShutdownHook"
            ]
        );
    }

    #[test]
    fn test_bootstrap_links_and_binds_armed_target() {
        let class = bridge().unwrap();
        let calls: Vec<_> = invoked(&class, runtime::BOOTSTRAP_METHOD, runtime::BOOTSTRAP_DESCRIPTOR)
            .into_iter()
            .map(|(_, name, _)| name)
            .collect();
        assert_eq!(
            calls,
            vec![
                "<init>",
                "lookupClass",
                "getName",
                "toMethodDescriptorString",
                "link",
                "valueOf",
                "insertArguments",
                "setTarget"
            ]
        );
        let armed: Vec<_> = invoked(&class, ARMED_METHOD, ARMED_DESCRIPTOR)
            .into_iter()
            .map(|(_, name, _)| name)
            .collect();
        assert_eq!(armed, vec!["fire", "setTarget"]);
        assert_eq!(
            opcodes(&class, DISARMED_METHOD, runtime::SITE_DESCRIPTOR),
            vec![RETURN]
        );
    }

    #[test]
    fn test_flush_hook_runs_shutdown() {
        let class = flush_hook().unwrap();
        assert_eq!(class.super_name().unwrap(), "java/lang/Thread");
        let calls = invoked(&class, "run", "()V");
        assert_eq!(
            calls,
            vec![(
                runtime::BRIDGE_CLASS.to_string(),
                "shutdown".to_string(),
                "()V".to_string()
            )]
        );
    }

    #[test]
    fn test_stubs_are_never_instrumented() {
        let instrumenter = crate::instrument::Instrumenter::default();
        for stub in generate().unwrap() {
            let class = ClassFile::parse(&stub.bytes).unwrap();
            for method in &class.methods {
                assert_ne!(
                    classify(&class, method).unwrap(),
                    MethodStatus::Trackable,
                    "{}.{}",
                    stub.internal_name,
                    method.name(&class.constant_pool).unwrap()
                );
            }
            assert_eq!(instrumenter.transform(&stub.bytes), None);
        }
    }
}

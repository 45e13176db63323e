// Integration test utilities
//
// A tiny class host: loads class files through a LoadHook, runs <clinit> once
// per class and interprets the handful of opcodes that the fixtures below and
// the rewriter's generated code use. java/util/concurrent/atomic/AtomicBoolean
// is modelled by an Arc<AtomicBool>; the natives of huella/Runtime are bound
// either to a local store/notifier or to the process-wide huella::runtime.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Context, Result};
use huella::agent::LoadHook;
use huella::classfile::annotations::{self, Annotation, RUNTIME_INVISIBLE};
use huella::classfile::opcodes::*;
use huella::classfile::{
    access, ClassFile, Code, CodeAttribute, Constant, Instruction, Label, StackMapFrame,
    VERSION_STACK_MAP,
};
use huella::marker;
use huella::notifier::{CallSite, Notifier, SiteContext};
use huella::recorder::RecordingStore;
use huella::runtime;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

const ATOMIC_BOOLEAN: &str = "java/util/concurrent/atomic/AtomicBoolean";
const STEP_LIMIT: usize = 100_000;

/// A value on the operand stack, in a local or in a static field
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Str(Arc<str>),
    Flag(Arc<AtomicBool>),
    Null,
}

impl Value {
    fn int(&self) -> Result<i32> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(anyhow!("expected int, found {other:?}")),
        }
    }
}

/// Where huella/Runtime natives go
pub enum Bridge {
    Local {
        store: Arc<RecordingStore>,
        notifier: Notifier,
    },
    Global,
}

impl Bridge {
    pub fn local(store: Arc<RecordingStore>) -> Self {
        Bridge::Local {
            notifier: Notifier::new(Arc::clone(&store)),
            store,
        }
    }

    fn record(&self, unit: &str) {
        match self {
            Bridge::Local { store, .. } => {
                store.record(unit);
            }
            Bridge::Global => runtime::record(unit),
        }
    }

    fn bootstrap(&self, context: SiteContext) -> Result<Arc<CallSite>> {
        match self {
            Bridge::Local { notifier, .. } => Ok(notifier.bootstrap(context)),
            Bridge::Global => runtime::bootstrap(context).context("runtime not installed"),
        }
    }
}

struct LoadedClass {
    class: ClassFile,
    internal_name: String,
    bodies: HashMap<(String, String), Arc<Code>>,
    statics: RwLock<HashMap<String, Value>>,
    initialized: OnceLock<()>,
}

pub struct Host {
    hook: Option<Box<dyn LoadHook>>,
    bridge: Bridge,
    classes: RwLock<HashMap<String, Arc<LoadedClass>>>,
    sites: Mutex<HashMap<(String, u16), Arc<CallSite>>>,
}

impl Host {
    pub fn new(bridge: Bridge, hook: Option<Box<dyn LoadHook>>) -> Self {
        Self {
            hook,
            bridge,
            classes: RwLock::new(HashMap::new()),
            sites: Mutex::new(HashMap::new()),
        }
    }

    /// Define a class, passing it through the hook first. Returns the bytes
    /// that were actually defined.
    pub fn load(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let original = ClassFile::parse(bytes)?;
        let name = original.internal_name()?;
        let defined = self
            .hook
            .as_ref()
            .and_then(|hook| hook.on_class_load(&name, bytes))
            .unwrap_or_else(|| bytes.to_vec());

        let class = ClassFile::parse(&defined).context("hook returned an unparsable class")?;
        check_frames(&class)?;
        let mut bodies = HashMap::new();
        for method in &class.methods {
            if let Some(code) = method.code(&class.constant_pool)? {
                bodies.insert(
                    (
                        method.name(&class.constant_pool)?,
                        method.descriptor(&class.constant_pool)?,
                    ),
                    Arc::new(code),
                );
            }
        }
        let loaded = LoadedClass {
            class,
            internal_name: name.clone(),
            bodies,
            statics: RwLock::new(HashMap::new()),
            initialized: OnceLock::new(),
        };
        self.classes
            .write()
            .unwrap()
            .insert(name, Arc::new(loaded));
        Ok(defined)
    }

    /// Call a static method of a loaded class (dotted or internal name)
    pub fn call(
        &self,
        class: &str,
        method: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let class = self.class(&class.replace('.', "/"))?;
        self.ensure_initialized(&class)?;
        self.invoke(&class, method, descriptor, args)
    }

    /// Read a static field, initializing the class if needed
    pub fn get_static(&self, class: &str, field: &str) -> Result<Value> {
        let class = self.class(&class.replace('.', "/"))?;
        self.ensure_initialized(&class)?;
        let statics = class.statics.read().unwrap();
        statics
            .get(field)
            .cloned()
            .with_context(|| format!("no static {field}"))
    }

    pub fn linked_sites(&self) -> Vec<Arc<CallSite>> {
        self.sites.lock().unwrap().values().cloned().collect()
    }

    fn class(&self, internal_name: &str) -> Result<Arc<LoadedClass>> {
        self.classes
            .read()
            .unwrap()
            .get(internal_name)
            .cloned()
            .with_context(|| format!("class {internal_name} not loaded"))
    }

    fn ensure_initialized(&self, class: &Arc<LoadedClass>) -> Result<()> {
        let mut failure = None;
        class.initialized.get_or_init(|| {
            if class.bodies.contains_key(&("<clinit>".to_string(), "()V".to_string())) {
                if let Err(err) = self.invoke(class, "<clinit>", "()V", Vec::new()) {
                    failure = Some(err);
                }
            }
        });
        match failure {
            Some(err) => Err(err.context(format!("<clinit> of {} failed", class.internal_name))),
            None => Ok(()),
        }
    }

    fn invoke(
        &self,
        class: &Arc<LoadedClass>,
        method: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let code = class
            .bodies
            .get(&(method.to_string(), descriptor.to_string()))
            .cloned()
            .with_context(|| format!("{}.{method}{descriptor} has no body", class.internal_name))?;
        self.execute(class, &code, args)
    }

    fn execute(&self, class: &Arc<LoadedClass>, code: &Code, args: Vec<Value>) -> Result<Option<Value>> {
        let cp = &class.class.constant_pool;
        let mut locals = args;
        locals.resize(code.max_locals.max(locals.len() as u16) as usize, Value::Null);
        let mut stack: Vec<Value> = Vec::with_capacity(code.max_stack as usize);
        let mut pc = 0usize;

        for _ in 0..STEP_LIMIT {
            let insn = code
                .instructions
                .get(pc)
                .with_context(|| format!("fell off the end of a body at {pc}"))?;
            pc += 1;
            if stack.len() > code.max_stack as usize {
                bail!("max_stack {} exceeded", code.max_stack);
            }
            match insn {
                Instruction::Simple(op) => match *op {
                    NOP => {}
                    0x02..=0x08 => stack.push(Value::Int(*op as i32 - ICONST_0 as i32)),
                    0x1a..=0x1d => stack.push(locals[(*op - 0x1a) as usize].clone()),
                    0x2a..=0x2d => stack.push(locals[(*op - 0x2a) as usize].clone()),
                    0x3b..=0x3e => locals[(*op - 0x3b) as usize] = pop(&mut stack)?,
                    POP => {
                        pop(&mut stack)?;
                    }
                    DUP => {
                        let top = pop(&mut stack)?;
                        stack.push(top.clone());
                        stack.push(top);
                    }
                    0x60 => {
                        let (b, a) = (pop(&mut stack)?.int()?, pop(&mut stack)?.int()?);
                        stack.push(Value::Int(a.wrapping_add(b)));
                    }
                    0x64 => {
                        let (b, a) = (pop(&mut stack)?.int()?, pop(&mut stack)?.int()?);
                        stack.push(Value::Int(a.wrapping_sub(b)));
                    }
                    IRETURN | ARETURN => return Ok(Some(pop(&mut stack)?)),
                    RETURN => return Ok(None),
                    other => bail!("unsupported opcode {other:#04x}"),
                },
                Instruction::Push { value, .. } => stack.push(Value::Int(*value as i32)),
                Instruction::Local { opcode, index } => match *opcode {
                    ILOAD | ALOAD => stack.push(locals[*index as usize].clone()),
                    ISTORE | ASTORE => locals[*index as usize] = pop(&mut stack)?,
                    other => bail!("unsupported local opcode {other:#04x}"),
                },
                Instruction::Iinc { index, delta } => {
                    let slot = &mut locals[*index as usize];
                    *slot = Value::Int(slot.int()?.wrapping_add(*delta as i32));
                }
                Instruction::Branch { opcode, target } => {
                    let taken = match *opcode {
                        GOTO => true,
                        IFEQ => pop(&mut stack)?.int()? == 0,
                        IFNE => pop(&mut stack)?.int()? != 0,
                        // if_icmplt
                        0xa1 => {
                            let (b, a) = (pop(&mut stack)?.int()?, pop(&mut stack)?.int()?);
                            a < b
                        }
                        other => bail!("unsupported branch {other:#04x}"),
                    };
                    if taken {
                        pc = target.0 as usize;
                    }
                }
                Instruction::Constant { opcode, index } => match *opcode {
                    LDC | LDC_W => match cp.get(*index)? {
                        Constant::String { string_index } => {
                            stack.push(Value::Str(cp.utf8(*string_index)?.into()))
                        }
                        Constant::Integer(v) => stack.push(Value::Int(*v)),
                        other => bail!("unsupported ldc of {other:?}"),
                    },
                    GETSTATIC => {
                        let (owner, name, _) = cp.member_ref(*index)?;
                        let target = self.static_owner(class, &owner)?;
                        let value = target
                            .statics
                            .read()
                            .unwrap()
                            .get(&name)
                            .cloned()
                            .with_context(|| format!("static {owner}.{name} read before it was set"))?;
                        stack.push(value);
                    }
                    PUTSTATIC => {
                        let (owner, name, _) = cp.member_ref(*index)?;
                        let target = self.static_owner(class, &owner)?;
                        let value = pop(&mut stack)?;
                        target.statics.write().unwrap().insert(name, value);
                    }
                    NEW => {
                        let name = cp.class_name(*index)?;
                        if name != ATOMIC_BOOLEAN {
                            bail!("cannot instantiate {name}");
                        }
                        stack.push(Value::Flag(Arc::new(AtomicBool::new(false))));
                    }
                    INVOKESPECIAL => {
                        let (owner, name, _) = cp.member_ref(*index)?;
                        match (owner.as_str(), name.as_str()) {
                            ("java/lang/Object" | ATOMIC_BOOLEAN, "<init>") => {
                                pop(&mut stack)?;
                            }
                            _ => bail!("unsupported invokespecial {owner}.{name}"),
                        }
                    }
                    INVOKEVIRTUAL => {
                        let (owner, name, descriptor) = cp.member_ref(*index)?;
                        if owner != ATOMIC_BOOLEAN {
                            bail!("unsupported invokevirtual {owner}.{name}{descriptor}");
                        }
                        match (name.as_str(), descriptor.as_str()) {
                            ("get", "()Z") => {
                                let Value::Flag(flag) = pop(&mut stack)? else {
                                    bail!("get on a non-flag");
                                };
                                stack.push(Value::Int(flag.load(Ordering::SeqCst) as i32));
                            }
                            ("compareAndSet", "(ZZ)Z") => {
                                let update = pop(&mut stack)?.int()? != 0;
                                let expect = pop(&mut stack)?.int()? != 0;
                                let Value::Flag(flag) = pop(&mut stack)? else {
                                    bail!("compareAndSet on a non-flag");
                                };
                                let swapped = flag
                                    .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
                                    .is_ok();
                                stack.push(Value::Int(swapped as i32));
                            }
                            _ => bail!("unsupported invokevirtual {owner}.{name}{descriptor}"),
                        }
                    }
                    INVOKESTATIC => {
                        let (owner, name, descriptor) = cp.member_ref(*index)?;
                        let argc = parameter_count(&descriptor)?;
                        if stack.len() < argc {
                            bail!("operand stack underflow calling {owner}.{name}");
                        }
                        let args = stack.split_off(stack.len() - argc);
                        if owner == runtime::BRIDGE_CLASS && name == runtime::RECORD_METHOD {
                            let [Value::Str(unit)] = args.as_slice() else {
                                bail!("record called with {args:?}");
                            };
                            self.bridge.record(unit);
                            continue;
                        }
                        let target = self.static_owner(class, &owner)?;
                        if let Some(result) = self.invoke(&target, &name, &descriptor, args)? {
                            stack.push(result);
                        }
                    }
                    other => bail!("unsupported constant opcode {other:#04x}"),
                },
                Instruction::InvokeDynamic { index } => {
                    let site = self.link(class, *index)?;
                    let Value::Str(unit) = pop(&mut stack)? else {
                        bail!("notify site expects a string");
                    };
                    site.invoke(&unit);
                }
                other => bail!("unsupported instruction {other:?}"),
            }
        }
        bail!("step limit exceeded")
    }

    /// Resolve the class owning a static member, initializing it unless it is
    /// the class currently executing
    fn static_owner(&self, current: &Arc<LoadedClass>, owner: &str) -> Result<Arc<LoadedClass>> {
        if owner == current.internal_name {
            return Ok(Arc::clone(current));
        }
        let target = self.class(owner)?;
        self.ensure_initialized(&target)?;
        Ok(target)
    }

    fn link(&self, class: &Arc<LoadedClass>, index: u16) -> Result<Arc<CallSite>> {
        let key = (class.internal_name.clone(), index);
        let mut sites = self.sites.lock().unwrap();
        if let Some(site) = sites.get(&key) {
            return Ok(Arc::clone(site));
        }
        let cp = &class.class.constant_pool;
        let Constant::InvokeDynamic {
            name_and_type_index,
            ..
        } = cp.get(index)?
        else {
            bail!("constant {index} is not InvokeDynamic");
        };
        let (name, descriptor) = cp.name_and_type(*name_and_type_index)?;
        let site = self.bridge.bootstrap(SiteContext {
            owner: class.internal_name.clone(),
            name,
            descriptor,
        })?;
        sites.insert(key, Arc::clone(&site));
        Ok(site)
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value> {
    stack.pop().context("operand stack underflow")
}

fn parameter_count(descriptor: &str) -> Result<usize> {
    let params = descriptor
        .strip_prefix('(')
        .and_then(|d| d.split_once(')'))
        .map(|(params, _)| params)
        .with_context(|| format!("bad descriptor {descriptor}"))?;
    let mut count = 0;
    let mut chars = params.chars();
    while let Some(c) = chars.next() {
        match c {
            '[' => continue,
            'L' => {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                }
            }
            _ => {}
        }
        count += 1;
    }
    Ok(count)
}

/// Stand-in for the split verifier: from version 50 on, every branch target
/// needs a frame
pub fn check_frames(class: &ClassFile) -> Result<()> {
    if class.major_version < VERSION_STACK_MAP {
        return Ok(());
    }
    for method in &class.methods {
        let Some(code) = method.code(&class.constant_pool)? else {
            continue;
        };
        let framed: Vec<Label> = code
            .stack_map()
            .map(|frames| frames.iter().map(|f| f.target).collect())
            .unwrap_or_default();
        for insn in &code.instructions {
            if let Instruction::Branch { target, .. } = insn {
                if !framed.contains(target) {
                    bail!(
                        "{} has a branch to {:?} without a frame",
                        method.name(&class.constant_pool)?,
                        target
                    );
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn new_class(internal_name: &str, version: u16) -> ClassFile {
    ClassFile::new(
        internal_name,
        "java/lang/Object",
        access::PUBLIC | access::SUPER,
        version,
    )
    .unwrap()
}

pub fn add_constructor(class: &mut ClassFile) {
    let object_init = class
        .constant_pool
        .add_method_ref("java/lang/Object", "<init>", "()V")
        .unwrap();
    let body = Code::new(
        1,
        1,
        vec![
            Instruction::Simple(0x2a), // aload_0
            Instruction::Constant {
                opcode: INVOKESPECIAL,
                index: object_init,
            },
            Instruction::Simple(RETURN),
        ],
    );
    class
        .add_method(access::PUBLIC, "<init>", "()V", Some(&body))
        .unwrap();
}

/// `static void name() { }`
pub fn add_void(class: &mut ClassFile, name: &str) -> usize {
    let body = Code::new(
        1,
        0,
        vec![
            Instruction::Simple(ICONST_1),
            Instruction::Simple(POP),
            Instruction::Simple(RETURN),
        ],
    );
    class
        .add_method(access::PUBLIC | access::STATIC, name, "()V", Some(&body))
        .unwrap()
}

/// `static int name(int x) { if (x == 0) return 0; return x + 1; }`, with a
/// frame at the join point when the version calls for one
pub fn add_branching(class: &mut ClassFile, name: &str) -> usize {
    let mut body = Code::new(
        2,
        1,
        vec![
            Instruction::Simple(0x1a), // iload_0
            Instruction::Branch {
                opcode: IFNE,
                target: Label(4),
            },
            Instruction::Simple(ICONST_0),
            Instruction::Simple(IRETURN),
            Instruction::Simple(0x1a),
            Instruction::Simple(ICONST_1),
            Instruction::Simple(0x60), // iadd
            Instruction::Simple(IRETURN),
        ],
    );
    if class.major_version >= VERSION_STACK_MAP {
        body.attributes.push(CodeAttribute::StackMapTable {
            name_index: class.constant_pool.add_utf8("StackMapTable").unwrap(),
            frames: vec![StackMapFrame::same(Label(4))],
        });
    }
    class
        .add_method(access::PUBLIC | access::STATIC, name, "(I)I", Some(&body))
        .unwrap()
}

pub fn mark_do_not_track(class: &mut ClassFile, method: usize) {
    let marker = Annotation {
        type_index: class
            .constant_pool
            .add_utf8(marker::DO_NOT_TRACK_DESCRIPTOR)
            .unwrap(),
        elements: vec![],
    };
    let attr = annotations::attribute(&mut class.constant_pool, RUNTIME_INVISIBLE, &[marker]).unwrap();
    class.methods[method].attributes.push(attr);
}

/// `app.Foo`: two trackable methods, one excluded
pub fn app_foo() -> Vec<u8> {
    let mut class = new_class("app/Foo", 52);
    add_constructor(&mut class);
    add_void(&mut class, "first");
    add_branching(&mut class, "second");
    let excluded = add_void(&mut class, "excluded");
    mark_do_not_track(&mut class, excluded);
    class.to_bytes().unwrap()
}

/// A class with a single trackable `static void work()`
pub fn worker(internal_name: &str, version: u16) -> Vec<u8> {
    let mut class = new_class(internal_name, version);
    add_constructor(&mut class);
    add_void(&mut class, "work");
    class.to_bytes().unwrap()
}

/// A class whose only code is a constructor and an excluded method
pub fn untrackable(internal_name: &str) -> Vec<u8> {
    let mut class = new_class(internal_name, 52);
    add_constructor(&mut class);
    let quiet = add_void(&mut class, "quiet");
    mark_do_not_track(&mut class, quiet);
    class
        .add_method(access::PUBLIC | access::STATIC | access::NATIVE, "native", "()V", None)
        .unwrap();
    class.to_bytes().unwrap()
}

/// Interface with a static method, at `version`
pub fn interface(internal_name: &str, version: u16) -> Vec<u8> {
    let mut class = ClassFile::new(
        internal_name,
        "java/lang/Object",
        access::PUBLIC | access::INTERFACE | access::ABSTRACT,
        version,
    )
    .unwrap();
    add_branching(&mut class, "helper");
    class
        .add_method(access::PUBLIC | access::ABSTRACT, "contract", "()V", None)
        .unwrap();
    class.to_bytes().unwrap()
}

/// A class with a `<clinit>` that sets `static int counter = 41`
pub fn with_static_init(internal_name: &str) -> Vec<u8> {
    let mut class = new_class(internal_name, 52);
    class
        .add_field(access::STATIC, "counter", "I")
        .unwrap();
    let counter = class
        .constant_pool
        .add_field_ref(internal_name, "counter", "I")
        .unwrap();
    let clinit = Code::new(
        1,
        0,
        vec![
            Instruction::Push {
                opcode: BIPUSH,
                value: 41,
            },
            Instruction::Constant {
                opcode: PUTSTATIC,
                index: counter,
            },
            Instruction::Simple(RETURN),
        ],
    );
    class
        .add_method(access::STATIC, "<clinit>", "()V", Some(&clinit))
        .unwrap();
    let read = Code::new(
        1,
        0,
        vec![
            Instruction::Constant {
                opcode: GETSTATIC,
                index: counter,
            },
            Instruction::Simple(IRETURN),
        ],
    );
    class
        .add_method(access::PUBLIC | access::STATIC, "counter", "()I", Some(&read))
        .unwrap();
    class.to_bytes().unwrap()
}

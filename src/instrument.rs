//! Class rewriting: flag, entry calls and the notify routine
//!
//! For each eligible class the rewriter
//! - prepends `invokestatic huella$notify()V` to every trackable method,
//! - generates `huella$notify`, which reports the class once.
//!
//! Under the direct strategy the routine guards the report with the
//! `huella$notified` flag, created first thing in `<clinit>`. Under call-site
//! it is a bare `invokedynamic` whose target disarms itself.
//!
//! Frames are never recomputed. The only join point the rewriter creates is
//! the skip target inside the flag-guarded routine, and its frame is written
//! by hand.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classfile::constant_pool::REF_INVOKE_STATIC;
use crate::classfile::opcodes::*;
use crate::classfile::{
    access, ClassFile, Code, CodeAttribute, Instruction, Label, MethodInfo, Result,
    StackMapFrame, VERSION_INTERFACE_CODE, VERSION_INVOKEDYNAMIC, VERSION_STACK_MAP,
};
use crate::marker;
use crate::runtime;

/// How the notify routine reaches the recording store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyStrategy {
    /// `invokestatic huella/Runtime.record`
    #[default]
    Direct,
    /// `invokedynamic` bound through `huella/Runtime.bootstrap` to a
    /// self-disarming call site
    CallSite,
}

impl NotifyStrategy {
    /// Lowest class version able to carry the generated code
    pub fn minimum_version(self) -> u16 {
        match self {
            NotifyStrategy::Direct => 0,
            NotifyStrategy::CallSite => VERSION_INVOKEDYNAMIC,
        }
    }
}

impl FromStr for NotifyStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "direct" => Ok(NotifyStrategy::Direct),
            "call-site" | "callsite" | "indy" => Ok(NotifyStrategy::CallSite),
            other => Err(format!(
                "unknown notify strategy '{other}' (expected direct or call-site)"
            )),
        }
    }
}

impl fmt::Display for NotifyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotifyStrategy::Direct => "direct",
            NotifyStrategy::CallSite => "call-site",
        })
    }
}

/// Why a class was left as loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// `module-info` has no initializer and no code
    Module,
    /// Interfaces before version 52 cannot hold the generated static code
    InterfaceTooOld { version: u16 },
    AlreadyInstrumented,
    /// No method is trackable
    NothingToTrack,
    /// Raising the version would require frames the class does not carry
    NeedsFrames { version: u16 },
    /// `<clinit>` is declared without a body
    AbstractInitializer,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Module => write!(f, "module descriptor"),
            SkipReason::InterfaceTooOld { version } => {
                write!(f, "interface at version {version} cannot carry static code")
            }
            SkipReason::AlreadyInstrumented => write!(f, "already instrumented"),
            SkipReason::NothingToTrack => write!(f, "no trackable methods"),
            SkipReason::NeedsFrames { version } => {
                write!(f, "version {version} class needs stack map frames to be upgraded")
            }
            SkipReason::AbstractInitializer => write!(f, "<clinit> has no body"),
        }
    }
}

/// Outcome of a rewrite attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    Instrumented { bytes: Vec<u8>, entry_calls: usize },
    Skipped(SkipReason),
}

/// Per-method eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodStatus {
    Trackable,
    /// `<init>` or `<clinit>`
    Initializer,
    /// Abstract or native
    NoBody,
    /// Carries `@DoNotTrack`
    Excluded,
}

pub fn classify(class: &ClassFile, method: &MethodInfo) -> Result<MethodStatus> {
    let cp = &class.constant_pool;
    if method.is(cp, "<init>", None) || method.is(cp, "<clinit>", None) {
        return Ok(MethodStatus::Initializer);
    }
    if !method.has_code(cp) {
        return Ok(MethodStatus::NoBody);
    }
    if marker::is_excluded(class, method)? {
        return Ok(MethodStatus::Excluded);
    }
    Ok(MethodStatus::Trackable)
}

/// The class rewriter
#[derive(Debug, Clone, Copy, Default)]
pub struct Instrumenter {
    strategy: NotifyStrategy,
}

impl Instrumenter {
    pub fn new(strategy: NotifyStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> NotifyStrategy {
        self.strategy
    }

    /// Rewrite `bytes`, or `None` to load the class unchanged.
    ///
    /// Never fails: errors and panics inside the rewriter are logged and
    /// turned into `None`.
    pub fn transform(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.try_transform(bytes))) {
            Ok(Ok(Transformed::Instrumented { bytes, entry_calls })) => {
                tracing::trace!(entry_calls, size = bytes.len(), "class rewritten");
                Some(bytes)
            }
            Ok(Ok(Transformed::Skipped(reason))) => {
                tracing::debug!(%reason, "class skipped");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "class left unchanged after rewrite failure");
                None
            }
            Err(_) => {
                tracing::warn!("class left unchanged after rewriter panic");
                None
            }
        }
    }

    pub fn try_transform(&self, bytes: &[u8]) -> Result<Transformed> {
        let class = ClassFile::parse(bytes)?;
        self.rewrite(class)
    }

    /// Rewrite an already parsed class
    pub fn rewrite(&self, mut class: ClassFile) -> Result<Transformed> {
        let skip = |reason| Ok(Transformed::Skipped(reason));
        let version = class.major_version;
        let interface = class.is_interface();

        if class.is_module() {
            return skip(SkipReason::Module);
        }
        if interface && version < VERSION_INTERFACE_CODE {
            return skip(SkipReason::InterfaceTooOld { version });
        }
        if marker::is_instrumented(&class) {
            return skip(SkipReason::AlreadyInstrumented);
        }

        let mut targets = Vec::new();
        for (index, method) in class.methods.iter().enumerate() {
            if classify(&class, method)? == MethodStatus::Trackable {
                targets.push(index);
            }
        }
        if targets.is_empty() {
            return skip(SkipReason::NothingToTrack);
        }

        let required = version.max(self.strategy.minimum_version());
        if required > version {
            if required >= VERSION_INVOKEDYNAMIC && needs_frames(&class)? {
                return skip(SkipReason::NeedsFrames { version });
            }
            tracing::trace!(from = version, to = required, "raising class version");
            class.major_version = required;
            class.minor_version = 0;
        }

        let owner = class.internal_name()?;
        let unit_id = class.binary_name()?;

        // Under call-site the site's own compare-and-swap is the only dedup
        // layer; a flag in front of it would keep the site from ever being hit
        // twice and leave the per-call atomic in place.
        let flag = match self.strategy {
            NotifyStrategy::Direct => {
                let flag_access = if interface {
                    access::PUBLIC | access::STATIC | access::FINAL | access::SYNTHETIC
                } else {
                    access::PRIVATE | access::STATIC | access::FINAL | access::SYNTHETIC
                };
                class.add_field(flag_access, marker::FLAG_FIELD, marker::FLAG_DESCRIPTOR)?;
                let flag = class.constant_pool.add_field_ref(
                    &owner,
                    marker::FLAG_FIELD,
                    marker::FLAG_DESCRIPTOR,
                )?;
                if !init_flag(&mut class, flag)? {
                    return skip(SkipReason::AbstractInitializer);
                }
                Some(flag)
            }
            NotifyStrategy::CallSite => None,
        };

        let notify = if interface {
            class.constant_pool.add_interface_method_ref(
                &owner,
                marker::NOTIFY_METHOD,
                marker::NOTIFY_DESCRIPTOR,
            )?
        } else {
            class
                .constant_pool
                .add_method_ref(&owner, marker::NOTIFY_METHOD, marker::NOTIFY_DESCRIPTOR)?
        };
        for &index in &targets {
            class.edit_code(index, |code, _| {
                code.prepend(Instruction::Constant {
                    opcode: INVOKESTATIC,
                    index: notify,
                });
                Ok(())
            })?;
        }

        let body = match flag {
            Some(flag) => flag_guarded_body(&mut class, flag, &unit_id)?,
            None => call_site_body(&mut class, &unit_id)?,
        };
        class.add_method(
            access::PUBLIC | access::STATIC | access::SYNTHETIC,
            marker::NOTIFY_METHOD,
            marker::NOTIFY_DESCRIPTOR,
            Some(&body),
        )?;

        tracing::debug!(class = %unit_id, entry_calls = targets.len(), strategy = %self.strategy, "instrumented");
        Ok(Transformed::Instrumented {
            bytes: class.to_bytes()?,
            entry_calls: targets.len(),
        })
    }
}

/// `if (!flag.get() && flag.compareAndSet(false, true)) Runtime.record(unit_id);`
///
/// The plain volatile read keeps every call after the first off the locked
/// compare-and-set.
fn flag_guarded_body(class: &mut ClassFile, flag: u16, unit_id: &str) -> Result<Code> {
    let cp = &mut class.constant_pool;
    let get = cp.add_method_ref(marker::FLAG_TYPE, "get", "()Z")?;
    let cas = cp.add_method_ref(marker::FLAG_TYPE, "compareAndSet", "(ZZ)Z")?;
    let id = cp.add_string(unit_id)?;
    let record = cp.add_method_ref(
        runtime::BRIDGE_CLASS,
        runtime::RECORD_METHOD,
        runtime::RECORD_DESCRIPTOR,
    )?;

    let done = Label(10);
    let mut code = Code::new(
        3,
        0,
        vec![
            Instruction::Constant {
                opcode: GETSTATIC,
                index: flag,
            },
            Instruction::Constant {
                opcode: INVOKEVIRTUAL,
                index: get,
            },
            Instruction::Branch {
                opcode: IFNE,
                target: done,
            },
            Instruction::Constant {
                opcode: GETSTATIC,
                index: flag,
            },
            Instruction::Simple(ICONST_0),
            Instruction::Simple(ICONST_1),
            Instruction::Constant {
                opcode: INVOKEVIRTUAL,
                index: cas,
            },
            Instruction::Branch {
                opcode: IFEQ,
                target: done,
            },
            Instruction::Constant {
                opcode: LDC,
                index: id,
            },
            Instruction::Constant {
                opcode: INVOKESTATIC,
                index: record,
            },
            Instruction::Simple(RETURN),
        ],
    );
    if class.major_version >= VERSION_STACK_MAP {
        code.attributes.push(CodeAttribute::StackMapTable {
            name_index: class.constant_pool.add_utf8("StackMapTable")?,
            frames: vec![StackMapFrame::same(done)],
        });
    }
    Ok(code)
}

/// `invokedynamic notify(unit_id)` through `huella/Runtime.bootstrap`
///
/// Straight-line, so no frames are needed.
fn call_site_body(class: &mut ClassFile, unit_id: &str) -> Result<Code> {
    let cp = &mut class.constant_pool;
    let id = cp.add_string(unit_id)?;
    let bootstrap = cp.add_method_ref(
        runtime::BRIDGE_CLASS,
        runtime::BOOTSTRAP_METHOD,
        runtime::BOOTSTRAP_DESCRIPTOR,
    )?;
    let handle = cp.add_method_handle(REF_INVOKE_STATIC, bootstrap)?;
    let bsm = class.add_bootstrap_method(handle, &[])?;
    let site = class
        .constant_pool
        .add_invoke_dynamic(bsm, runtime::SITE_NAME, runtime::SITE_DESCRIPTOR)?;
    Ok(Code::new(
        1,
        0,
        vec![
            Instruction::Constant {
                opcode: LDC,
                index: id,
            },
            Instruction::InvokeDynamic { index: site },
            Instruction::Simple(RETURN),
        ],
    ))
}

/// Create the flag ahead of everything else in `<clinit>`, adding one if needed.
/// Returns false when `<clinit>` exists without a body.
fn init_flag(class: &mut ClassFile, flag: u16) -> Result<bool> {
    let cp = &mut class.constant_pool;
    let new_index = cp.add_class(marker::FLAG_TYPE)?;
    let ctor = cp.add_method_ref(marker::FLAG_TYPE, "<init>", "()V")?;
    let sequence = [
        Instruction::Constant {
            opcode: NEW,
            index: new_index,
        },
        Instruction::Simple(DUP),
        Instruction::Constant {
            opcode: INVOKESPECIAL,
            index: ctor,
        },
        Instruction::Constant {
            opcode: PUTSTATIC,
            index: flag,
        },
    ];

    match class.find_method("<clinit>", "()V") {
        Some(index) => class.edit_code(index, |code, _| {
            for insn in sequence.into_iter().rev() {
                code.prepend(insn);
            }
            code.max_stack = code.max_stack.max(2);
            Ok(())
        }),
        None => {
            let mut instructions = sequence.to_vec();
            instructions.push(Instruction::Simple(RETURN));
            class.add_method(
                access::STATIC,
                "<clinit>",
                "()V",
                Some(&Code::new(2, 0, instructions)),
            )?;
            Ok(true)
        }
    }
}

/// Whether any branching body lacks the frames a version 51 verifier demands
fn needs_frames(class: &ClassFile) -> Result<bool> {
    for method in &class.methods {
        if let Some(code) = method.code(&class.constant_pool)? {
            if code.has_join_points() && code.stack_map().is_none() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

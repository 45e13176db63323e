//! JNI exports behind the native methods of `huella/Runtime`
//!
//! `Runtime.<clinit>` calls `System.loadLibrary("huella")`; the JVM then
//! resolves each native method of the class by its mangled symbol. The
//! exports never unwind into the JVM: panics are caught and logged.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};

use jni::objects::{JClass, JString};
use jni::sys::{jint, jlong, JNI_VERSION_1_8};
use jni::JNIEnv;
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::notifier::SiteContext;
use crate::runtime;

/// Name passed to `System.loadLibrary`
pub const LIBRARY_NAME: &str = "huella";
/// System property holding the agent argument string
pub const ARGS_PROPERTY: &str = "huella.args";
/// Environment variable with the log filter, e.g. `HUELLA_LOG=debug`
pub const LOG_ENV: &str = "HUELLA_LOG";

/// A native method of the bridge class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Native {
    pub method: &'static str,
    pub descriptor: &'static str,
}

impl Native {
    /// Symbol the JVM looks up for this method
    pub fn symbol(&self) -> String {
        symbol(runtime::BRIDGE_CLASS, self.method)
    }
}

/// Every native of `huella/Runtime`, each exported below
pub const NATIVES: [Native; 5] = [
    Native {
        method: "install",
        descriptor: "(Ljava/lang/String;)V",
    },
    Native {
        method: runtime::RECORD_METHOD,
        descriptor: runtime::RECORD_DESCRIPTOR,
    },
    Native {
        method: "link",
        descriptor: "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;)J",
    },
    Native {
        method: "fire",
        descriptor: "(JLjava/lang/String;)V",
    },
    Native {
        method: "shutdown",
        descriptor: "()V",
    },
];

/// Short JNI name of `class.method`, e.g. `Java_huella_Runtime_record`
pub fn symbol(class: &str, method: &str) -> String {
    let mut out = String::from("Java_");
    mangle(class, &mut out);
    out.push('_');
    mangle(method, &mut out);
    out
}

fn mangle(name: &str, out: &mut String) {
    for c in name.chars() {
        match c {
            '/' => out.push('_'),
            '_' => out.push_str("_1"),
            ';' => out.push_str("_2"),
            '[' => out.push_str("_3"),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => out.push_str(&format!("_0{:04x}", u32::from(c))),
        }
    }
}

fn guarded<T>(native: &'static str, fallback: T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!(native, "panic in native call");
        fallback
    })
}

fn init_logging() {
    // a host that already installed a subscriber keeps it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env(LOG_ENV))
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    if value.is_null() {
        return None;
    }
    match env.get_string(value) {
        Ok(text) => Some(text.into()),
        Err(err) => {
            tracing::warn!(error = %err, "could not read Java string");
            None
        }
    }
}

/// Install from the `huella.args` value, falling back to defaults
fn install_from_args(args: Option<&str>) {
    let config = AgentConfig::from_agent_args(args).unwrap_or_else(|err| {
        tracing::error!(error = %err, property = ARGS_PROPERTY, "invalid agent arguments; using defaults");
        AgentConfig::default()
    });
    runtime::install(&config);
}

/// `Class.getName()` yields `app.Foo`; sites are keyed by internal name
fn site_context(owner: &str, name: String, descriptor: String) -> SiteContext {
    SiteContext {
        owner: owner.replace('.', "/"),
        name,
        descriptor,
    }
}

fn to_jlong(handle: Option<usize>) -> jlong {
    handle.and_then(|h| jlong::try_from(h).ok()).unwrap_or(-1)
}

fn from_jlong(handle: jlong) -> Option<usize> {
    usize::try_from(handle).ok()
}

fn finish() {
    match runtime::shutdown() {
        Some(Ok(outcome)) => tracing::info!(?outcome, "final flush"),
        Some(Err(err)) => tracing::error!(error = %err, "final flush failed"),
        None => tracing::debug!("shutdown before install"),
    }
}

#[no_mangle]
pub extern "system" fn JNI_OnLoad(_vm: *mut jni::sys::JavaVM, _reserved: *mut c_void) -> jint {
    guarded("JNI_OnLoad", JNI_VERSION_1_8, || {
        init_logging();
        JNI_VERSION_1_8
    })
}

#[no_mangle]
pub extern "system" fn JNI_OnUnload(_vm: *mut jni::sys::JavaVM, _reserved: *mut c_void) {
    guarded("JNI_OnUnload", (), finish);
}

#[no_mangle]
pub extern "system" fn Java_huella_Runtime_install<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    args: JString<'local>,
) {
    guarded("install", (), || {
        init_logging();
        let args = read_string(&mut env, &args);
        install_from_args(args.as_deref());
    });
}

#[no_mangle]
pub extern "system" fn Java_huella_Runtime_record<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    unit_id: JString<'local>,
) {
    guarded("record", (), || {
        if let Some(unit_id) = read_string(&mut env, &unit_id) {
            runtime::record(&unit_id);
        }
    });
}

#[no_mangle]
pub extern "system" fn Java_huella_Runtime_link<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    owner: JString<'local>,
    name: JString<'local>,
    descriptor: JString<'local>,
) -> jlong {
    guarded("link", -1, || {
        let owner = read_string(&mut env, &owner).unwrap_or_default();
        let name = read_string(&mut env, &name).unwrap_or_default();
        let descriptor = read_string(&mut env, &descriptor).unwrap_or_default();
        to_jlong(runtime::link(site_context(&owner, name, descriptor)))
    })
}

#[no_mangle]
pub extern "system" fn Java_huella_Runtime_fire<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    unit_id: JString<'local>,
) {
    guarded("fire", (), || {
        let Some(unit_id) = read_string(&mut env, &unit_id) else {
            return;
        };
        match from_jlong(handle) {
            Some(handle) => runtime::fire(handle, &unit_id),
            None => tracing::debug!(handle, unit = %unit_id, "site was never linked"),
        }
    });
}

#[no_mangle]
pub extern "system" fn Java_huella_Runtime_shutdown<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
) {
    guarded("shutdown", (), finish);
}

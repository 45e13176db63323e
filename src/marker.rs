//! Per-method opt-out marker and the names of generated members

use crate::classfile::{ClassFile, MethodInfo, Result};

/// Internal name of the opt-out annotation type
pub const DO_NOT_TRACK: &str = "huella/DoNotTrack";
pub const DO_NOT_TRACK_DESCRIPTOR: &str = "Lhuella/DoNotTrack;";

/// Per-class flag set by the first notification (direct strategy)
pub const FLAG_FIELD: &str = "huella$notified";
pub const FLAG_TYPE: &str = "java/util/concurrent/atomic/AtomicBoolean";
pub const FLAG_DESCRIPTOR: &str = "Ljava/util/concurrent/atomic/AtomicBoolean;";

/// Per-class routine every instrumented method calls first
pub const NOTIFY_METHOD: &str = "huella$notify";
pub const NOTIFY_DESCRIPTOR: &str = "()V";

/// Whether `method` opted out of tracking
pub fn is_excluded(class: &ClassFile, method: &MethodInfo) -> Result<bool> {
    method.has_annotation(&class.constant_pool, DO_NOT_TRACK_DESCRIPTOR)
}

/// Whether `class` already went through the rewriter
pub fn is_instrumented(class: &ClassFile) -> bool {
    class.declares_member(FLAG_FIELD) || class.declares_member(NOTIFY_METHOD)
}

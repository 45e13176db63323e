//! Huella - load-time class coverage with self-disabling notifications
//!
//! This library rewrites JVM class files as they are loaded so that each
//! class reports itself, once, the first time one of its methods runs. The
//! reported names are kept in a process-wide set that a background thread
//! flushes to a plain text file.

pub mod agent;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod filter;
pub mod inspect;
pub mod instrument;
pub mod jni_bridge;
pub mod marker;
pub mod notifier;
pub mod offline;
pub mod recorder;
pub mod runtime;
pub mod stubs;

//! Process-wide entry points reached from instrumented code
//!
//! The native methods of `huella/Runtime` are bound to these functions by
//! [`crate::jni_bridge`]. Everything here is a no-op until `install` ran.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::AgentConfig;
use crate::notifier::{CallSite, Notifier, SiteContext};
use crate::recorder::{FlushError, FlushOutcome, FlushWorker, RecordingStore};

/// Internal name of the bridge class
pub const BRIDGE_CLASS: &str = "huella/Runtime";
pub const RECORD_METHOD: &str = "record";
pub const RECORD_DESCRIPTOR: &str = "(Ljava/lang/String;)V";
pub const BOOTSTRAP_METHOD: &str = "bootstrap";
pub const BOOTSTRAP_DESCRIPTOR: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;";
/// Name and type of the `invokedynamic` site inside `huella$notify`
pub const SITE_NAME: &str = "notify";
pub const SITE_DESCRIPTOR: &str = "(Ljava/lang/String;)V";

struct Runtime {
    store: Arc<RecordingStore>,
    notifier: Notifier,
    worker: Mutex<Option<FlushWorker>>,
    /// Linked call sites, addressed by the handle `link` hands out
    sites: Mutex<Vec<Arc<CallSite>>>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Create the process-wide store and start its flush thread.
///
/// Only the first call has an effect; later calls return the existing store.
pub fn install(config: &AgentConfig) -> Arc<RecordingStore> {
    let runtime = RUNTIME.get_or_init(|| {
        let store = Arc::new(RecordingStore::new(&config.output));
        let worker = match FlushWorker::spawn(Arc::clone(&store), config.flush_interval()) {
            Ok(worker) => Some(worker),
            Err(err) => {
                tracing::error!(error = %err, "could not start flush thread; only the shutdown flush will run");
                None
            }
        };
        tracing::info!(
            prefix = %config.prefix,
            output = %config.output.display(),
            "coverage runtime installed"
        );
        Runtime {
            notifier: Notifier::new(Arc::clone(&store)),
            store,
            worker: Mutex::new(worker),
            sites: Mutex::new(Vec::new()),
        }
    });
    Arc::clone(&runtime.store)
}

/// The installed store, if any
pub fn store() -> Option<Arc<RecordingStore>> {
    RUNTIME.get().map(|rt| Arc::clone(&rt.store))
}

/// `huella/Runtime.record(String)`
pub fn record(unit_id: &str) {
    match RUNTIME.get() {
        Some(rt) => {
            rt.store.record(unit_id);
        }
        None => tracing::debug!(unit = unit_id, "record before install ignored"),
    }
}

/// `huella/Runtime.bootstrap(Lookup, String, MethodType)`
pub fn bootstrap(context: SiteContext) -> Option<Arc<CallSite>> {
    match RUNTIME.get() {
        Some(rt) => Some(rt.notifier.bootstrap(context)),
        None => {
            tracing::debug!(owner = %context.owner, "bootstrap before install ignored");
            None
        }
    }
}

/// `huella/Runtime.link(String, String, String)`: bootstrap a site and keep
/// it alive under a handle the bytecode side passes back to [`fire`]
pub fn link(context: SiteContext) -> Option<usize> {
    let site = bootstrap(context)?;
    let rt = RUNTIME.get()?;
    let mut sites = rt.sites.lock();
    sites.push(site);
    Some(sites.len() - 1)
}

/// `huella/Runtime.fire(long, String)`
pub fn fire(handle: usize, unit_id: &str) {
    let site = RUNTIME
        .get()
        .and_then(|rt| rt.sites.lock().get(handle).cloned());
    match site {
        Some(site) => site.invoke(unit_id),
        None => tracing::debug!(handle, unit = unit_id, "fire on unknown site ignored"),
    }
}

/// Stop the flush thread and flush one last time. Hosts call this on exit.
pub fn shutdown() -> Option<Result<FlushOutcome, FlushError>> {
    let rt = RUNTIME.get()?;
    let outcome = match rt.worker.lock().take() {
        Some(worker) => worker.shutdown(),
        None => rt.store.flush_if_changed(),
    };
    Some(outcome)
}

//! Self-disarming call sites
//!
//! A call site holds a pointer to its current target. It starts on the live
//! target, which swaps the pointer to the disarmed target and reports the
//! class. After that, an invocation is one atomic load plus a call to an
//! empty function.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crate::recorder::RecordingStore;

/// Where a call site is linked: the class and the `invokedynamic` name/type
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiteContext {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

struct CallTarget {
    invoke: fn(&CallSite, &str),
}

static LIVE: CallTarget = CallTarget { invoke: fire };
static DISARMED: CallTarget = CallTarget { invoke: ignore };

fn slot(target: &'static CallTarget) -> *mut CallTarget {
    ptr::from_ref(target).cast_mut()
}

fn fire(site: &CallSite, unit: &str) {
    // only the thread that moves the site off LIVE reports
    if site
        .target
        .compare_exchange(slot(&LIVE), slot(&DISARMED), Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        tracing::trace!(owner = %site.context.owner, unit, "call site disarmed");
        site.store.record(unit);
    }
}

fn ignore(_: &CallSite, _: &str) {}

/// A rebindable call target bound to one linked call site
pub struct CallSite {
    target: AtomicPtr<CallTarget>,
    context: SiteContext,
    store: Arc<RecordingStore>,
}

impl CallSite {
    fn new(context: SiteContext, store: Arc<RecordingStore>) -> Self {
        Self {
            target: AtomicPtr::new(slot(&LIVE)),
            context,
            store,
        }
    }

    #[inline]
    fn current(&self) -> &'static CallTarget {
        let target = self.target.load(Ordering::Acquire);
        // SAFETY: the slot only ever holds pointers to LIVE or DISARMED,
        // both statics that are never written.
        unsafe { &*target }
    }

    /// Invoke through the current target
    #[inline]
    pub fn invoke(&self, unit: &str) {
        (self.current().invoke)(self, unit)
    }

    pub fn is_disarmed(&self) -> bool {
        ptr::eq(self.current(), &DISARMED)
    }

    pub fn context(&self) -> &SiteContext {
        &self.context
    }
}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite")
            .field("context", &self.context)
            .field("disarmed", &self.is_disarmed())
            .finish()
    }
}

/// Links call sites to a recording store
#[derive(Debug)]
pub struct Notifier {
    store: Arc<RecordingStore>,
    linked: AtomicU64,
}

impl Notifier {
    pub fn new(store: Arc<RecordingStore>) -> Self {
        Self {
            store,
            linked: AtomicU64::new(0),
        }
    }

    /// Link a call site; it starts out live
    pub fn bootstrap(&self, context: SiteContext) -> Arc<CallSite> {
        self.linked.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(owner = %context.owner, name = %context.name, "call site linked");
        Arc::new(CallSite::new(context, Arc::clone(&self.store)))
    }

    /// Number of call sites linked so far
    pub fn linked(&self) -> u64 {
        self.linked.load(Ordering::Relaxed)
    }
}

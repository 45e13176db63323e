//! The load hook: filter plus rewriter
//!
//! The host calls `on_class_load` once per class, before the class becomes
//! executable, and substitutes the returned bytes when there are any.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{AgentConfig, ConfigError};
use crate::filter::LoadFilter;
use crate::instrument::Instrumenter;
use crate::runtime;

/// Hook the host invokes for every class it is about to define
pub trait LoadHook: Send + Sync {
    /// Replacement bytes for the class, or `None` to keep the original
    fn on_class_load(&self, name: &str, bytes: &[u8]) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentStats {
    /// Classes handed to the hook
    pub seen: u64,
    /// Classes matching the prefix
    pub matched: u64,
    /// Classes returned rewritten
    pub instrumented: u64,
}

#[derive(Debug, Default)]
pub struct CoverageAgent {
    filter: LoadFilter,
    instrumenter: Instrumenter,
    seen: AtomicU64,
    matched: AtomicU64,
    instrumented: AtomicU64,
}

impl CoverageAgent {
    pub fn new(filter: LoadFilter, instrumenter: Instrumenter) -> Self {
        Self {
            filter,
            instrumenter,
            ..Self::default()
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            LoadFilter::new(&config.prefix),
            Instrumenter::new(config.strategy),
        )
    }

    /// Parse the agent argument string, install the runtime and build the hook
    pub fn start(args: Option<&str>) -> Result<Self, ConfigError> {
        let config = AgentConfig::from_agent_args(args)?;
        if config.prefix.is_empty() {
            tracing::warn!("no class prefix configured; nothing will be instrumented");
        }
        runtime::install(&config);
        Ok(Self::from_config(&config))
    }

    pub fn filter(&self) -> &LoadFilter {
        &self.filter
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            seen: self.seen.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            instrumented: self.instrumented.load(Ordering::Relaxed),
        }
    }
}

impl LoadHook for CoverageAgent {
    fn on_class_load(&self, name: &str, bytes: &[u8]) -> Option<Vec<u8>> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        if !self.filter.should_instrument(name) {
            return None;
        }
        self.matched.fetch_add(1, Ordering::Relaxed);

        let _span = tracing::debug_span!("class_load", class = name).entered();
        let rewritten = self.instrumenter.transform(bytes)?;
        self.instrumented.fetch_add(1, Ordering::Relaxed);
        Some(rewritten)
    }
}

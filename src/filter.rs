//! Load filter: which classes get instrumented
//!
//! Names arrive either dotted (`app.Foo`) or in internal form (`app/Foo`),
//! depending on the host. Both compare equal against a dotted prefix.

/// Prefix predicate over class names
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadFilter {
    /// Dotted prefix; empty matches nothing
    prefix: String,
}

impl LoadFilter {
    /// Create a filter; internal-form prefixes are accepted too
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim().replace('/', "."),
        }
    }

    /// A filter that never matches
    pub fn none() -> Self {
        Self::default()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the class named `name` should be routed through the rewriter
    pub fn should_instrument(&self, name: &str) -> bool {
        if self.prefix.is_empty() || name.len() < self.prefix.len() {
            return false;
        }
        name.bytes()
            .zip(self.prefix.bytes())
            .all(|(n, p)| n == p || (n == b'/' && p == b'.'))
    }
}

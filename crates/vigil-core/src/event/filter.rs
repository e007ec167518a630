//! Capture filter ports.
//!
//! Capture jobs may carry a filter so only matching events reach the
//! output file. Filter *expressions* are compiled by an external
//! [`FilterCompiler`] (the rule condition compiler owns the language);
//! this module only defines the predicate shape plus the one predicate
//! the ring builds itself: container scoping.

use std::sync::Arc;

use super::Event;

/// A compiled event predicate.
pub trait EventPredicate: Send + Sync {
    /// Returns `true` if `event` passes the filter.
    fn matches(&self, event: &Event) -> bool;
}

/// Error compiling a filter expression.
#[derive(Debug, thiserror::Error)]
#[error("error compiling capture filter ({expr}): {detail}")]
pub struct FilterError {
    /// The offending expression.
    pub expr: String,
    /// Compiler diagnostic.
    pub detail: String,
}

/// Port to the external filter expression compiler.
pub trait FilterCompiler: Send + Sync {
    /// Compiles `expr` into a predicate.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] for a malformed expression; the caller
    /// stamps the triggering action result failed and the event is not
    /// dropped.
    fn compile(&self, expr: &str) -> Result<Arc<dyn EventPredicate>, FilterError>;
}

/// Restricts a capture to one container.
#[derive(Debug, Clone)]
pub struct ContainerPredicate {
    container_id: String,
}

impl ContainerPredicate {
    /// Predicate accepting only events from `container_id`.
    #[must_use]
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
        }
    }
}

impl EventPredicate for ContainerPredicate {
    fn matches(&self, event: &Event) -> bool {
        event.container() == Some(self.container_id.as_str())
    }
}

/// Conjunction of two predicates.
pub struct AndPredicate {
    left: Arc<dyn EventPredicate>,
    right: Arc<dyn EventPredicate>,
}

impl AndPredicate {
    /// Predicate accepting events both `left` and `right` accept.
    #[must_use]
    pub fn new(left: Arc<dyn EventPredicate>, right: Arc<dyn EventPredicate>) -> Self {
        Self { left, right }
    }
}

impl EventPredicate for AndPredicate {
    fn matches(&self, event: &Event) -> bool {
        self.left.matches(event) && self.right.matches(event)
    }
}

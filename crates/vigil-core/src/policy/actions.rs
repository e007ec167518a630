//! Asynchronous action completion plumbing.
//!
//! Completions never touch engine state directly: every dispatched
//! container command carries an [`ActionCompletionHandle`] naming the
//! owning action state by a monotonic [`ActionHandle`] and a result slot
//! index. The handle sends into a channel the engine drains on its own
//! scheduler; a handle whose state has been retired simply misses the
//! guarded lookup and is dropped.

use std::sync::mpsc;

/// Monotonic identity of one `ActionState` in the engine's table.
///
/// Handles are never reused within an engine, so a completion arriving
/// after its state was retired fails the table lookup instead of
/// stamping someone else's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionHandle(pub(crate) u64);

impl std::fmt::Display for ActionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "action-{}", self.0)
    }
}

/// One completed asynchronous action.
#[derive(Debug)]
pub struct ActionCompletion {
    /// Owning action state.
    pub handle: ActionHandle,

    /// Result slot index within the state, in configuration order.
    pub slot: usize,

    /// Whether the command succeeded.
    pub successful: bool,

    /// Failure detail, if any.
    pub errmsg: Option<String>,
}

/// Single-use completion callback for one dispatched action.
#[derive(Debug)]
pub struct ActionCompletionHandle {
    tx: mpsc::Sender<ActionCompletion>,
    handle: ActionHandle,
    slot: usize,
}

impl ActionCompletionHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<ActionCompletion>,
        handle: ActionHandle,
        slot: usize,
    ) -> Self {
        Self { tx, handle, slot }
    }

    /// Reports the command outcome. A send after the engine has shut
    /// down is silently dropped.
    pub fn complete(self, successful: bool, errmsg: Option<String>) {
        let _ = self.tx.send(ActionCompletion {
            handle: self.handle,
            slot: self.slot,
            successful,
            errmsg,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_carries_handle_and_slot() {
        let (tx, rx) = mpsc::channel();
        let handle = ActionCompletionHandle::new(tx, ActionHandle(7), 2);
        handle.complete(false, Some("no such container".to_string()));

        let done = rx.try_recv().unwrap();
        assert_eq!(done.handle, ActionHandle(7));
        assert_eq!(done.slot, 2);
        assert!(!done.successful);
    }

    #[test]
    fn test_complete_after_receiver_drop_is_silent() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ActionCompletionHandle::new(tx, ActionHandle(1), 0).complete(true, None);
    }
}

//! Extension points called by the archiver
//!
//! Hooks observe (and can veto) archiver steps without replacing any of its
//! types. A `before_*` hook returning an error fails that step exactly as an
//! I/O error would.

use crate::archiver::{ArchiverState, PassReport};
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use wk_core::SegmentIndex;

/// Callbacks invoked at defined points of an archiver pass
///
/// Every method has a no-op default. Hooks run on the archiver's blocking
/// thread and outside the manager lock, so a hook may block.
pub trait ArchiverHook: Send + Sync {
    fn on_state_change(&self, _from: ArchiverState, _to: ArchiverState) {}

    fn before_archive(&self, _index: SegmentIndex) -> io::Result<()> {
        Ok(())
    }

    fn after_archive(&self, _index: SegmentIndex) {}

    fn before_compress(&self, _index: SegmentIndex) -> io::Result<()> {
        Ok(())
    }

    fn before_delete(&self, _index: SegmentIndex) -> io::Result<()> {
        Ok(())
    }

    fn after_delete(&self, _index: SegmentIndex) {}

    fn on_pass_complete(&self, _report: &PassReport) {}
}

/// Registered hooks, called in registration order
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ArchiverHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn ArchiverHook>) {
        self.hooks.write().push(hook);
    }

    pub fn clear(&self) {
        self.hooks.write().clear();
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    // Hooks may block, so they are called on a snapshot of the list
    fn snapshot(&self) -> Vec<Arc<dyn ArchiverHook>> {
        self.hooks.read().clone()
    }

    pub(crate) fn state_changed(&self, from: ArchiverState, to: ArchiverState) {
        for hook in self.snapshot() {
            hook.on_state_change(from, to);
        }
    }

    pub(crate) fn before_archive(&self, index: SegmentIndex) -> io::Result<()> {
        self.snapshot()
            .iter()
            .try_for_each(|hook| hook.before_archive(index))
    }

    pub(crate) fn after_archive(&self, index: SegmentIndex) {
        for hook in self.snapshot() {
            hook.after_archive(index);
        }
    }

    pub(crate) fn before_compress(&self, index: SegmentIndex) -> io::Result<()> {
        self.snapshot()
            .iter()
            .try_for_each(|hook| hook.before_compress(index))
    }

    pub(crate) fn before_delete(&self, index: SegmentIndex) -> io::Result<()> {
        self.snapshot()
            .iter()
            .try_for_each(|hook| hook.before_delete(index))
    }

    pub(crate) fn after_delete(&self, index: SegmentIndex) {
        for hook in self.snapshot() {
            hook.after_delete(index);
        }
    }

    pub(crate) fn pass_complete(&self, report: &PassReport) {
        for hook in self.snapshot() {
            hook.on_pass_complete(report);
        }
    }
}

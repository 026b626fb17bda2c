//! Shared run state and the guard that records which thread holds it.
//!
//! Page callbacks run while a run is locked, and a callback may stop or supersede that same run.
//! Such an abort cannot take the lock again on the holding thread, so it is parked on the cell
//! and applied by the holder as soon as the callback returns.

use super::run::Run;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

thread_local! {
    /// Cells locked by the current thread, innermost last
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
pub struct RunCell {
    run: Mutex<Run>,
    parked_abort: Mutex<Option<String>>,
    /// Mirrors a terminal phase for callers that cannot take the lock
    finished: AtomicBool,
}

impl RunCell {
    pub fn new(run: Run) -> Self {
        Self {
            run: Mutex::new(run),
            parked_abort: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> RunGuard<'_> {
        let guard = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        HELD.with(|held| held.borrow_mut().push(self.addr()));
        RunGuard { cell: self, guard }
    }

    /// Whether the current thread is inside a [`RunGuard`] of this cell.
    pub fn held_here(&self) -> bool {
        let addr = self.addr();
        HELD.with(|held| held.borrow().contains(&addr))
    }

    /// Leave an abort for the guard holder to apply.
    ///
    /// Returns `false` when the run already ended or an abort is already parked.
    pub fn park_abort(&self, reason: &str) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        let mut parked = self
            .parked_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if parked.is_some() {
            return false;
        }
        *parked = Some(reason.to_string());
        true
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

/// Lock on a [`RunCell`]; derefs to the [`Run`].
pub struct RunGuard<'a> {
    cell: &'a RunCell,
    guard: MutexGuard<'a, Run>,
}

impl RunGuard<'_> {
    /// Abort parked while this guard was held, if any
    pub fn take_parked_abort(&self) -> Option<String> {
        self.cell
            .parked_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Publish whether the run has reached a terminal phase.
    pub fn sync_finished(&self) {
        self.cell
            .finished
            .store(self.guard.phase().is_terminal(), Ordering::Release);
    }
}

impl Deref for RunGuard<'_> {
    type Target = Run;

    fn deref(&self) -> &Run {
        &self.guard
    }
}

impl DerefMut for RunGuard<'_> {
    fn deref_mut(&mut self) -> &mut Run {
        &mut self.guard
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let addr = self.cell.addr();
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|a| *a == addr) {
                held.remove(pos);
            }
        });
    }
}

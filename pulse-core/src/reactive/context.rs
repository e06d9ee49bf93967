//! Reactive Context
//!
//! The reactive context records which cells are read while a computation
//! runs. This enables automatic dependency tracking: when a cell's value is
//! read inside an open tracking window, the cell is added to that window's
//! found set, and the computation is wired as its dependent afterwards.
//!
//! # Implementation
//!
//! Each instance keeps a stack of frames. Entering a context pushes a frame;
//! dropping the guard pops it. Frames nest, so a computed created while
//! another computation is running tracks into its own frame only.
//!
//! Untracked frames swallow reads, which keeps a static-deps computed or an
//! explicit `untracked` block from leaking edges into an enclosing frame.

use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::graph::CellId;

#[derive(Debug)]
struct Frame {
    token: u64,
    collect: bool,
    found: IndexSet<CellId>,
}

/// Per-instance stack of tracking frames.
#[derive(Debug, Default)]
pub(crate) struct TrackingStack {
    frames: Mutex<Vec<Frame>>,
}

impl TrackingStack {
    /// Whether reads are currently being recorded.
    pub(crate) fn is_tracking(&self) -> bool {
        self.frames
            .lock()
            .last()
            .map(|frame| frame.collect)
            .unwrap_or(false)
    }

    /// Record a read of `id` in the innermost frame.
    pub(crate) fn track(&self, id: CellId) {
        if let Some(frame) = self.frames.lock().last_mut() {
            if frame.collect {
                frame.found.insert(id);
            }
        }
    }
}

/// Guard that pops its frame when dropped.
///
/// This keeps the stack balanced even if the computation panics.
pub(crate) struct ReactiveContext<'a> {
    stack: &'a TrackingStack,
    token: u64,
    open: bool,
}

impl<'a> ReactiveContext<'a> {
    /// Open a frame. With `collect == false` reads inside are ignored.
    pub(crate) fn enter(stack: &'a TrackingStack, collect: bool) -> Self {
        static TOKENS: AtomicU64 = AtomicU64::new(0);
        let token = TOKENS.fetch_add(1, Ordering::Relaxed);

        stack.frames.lock().push(Frame {
            token,
            collect,
            found: IndexSet::new(),
        });

        Self {
            stack,
            token,
            open: true,
        }
    }

    /// Close the frame and return the cells read inside it.
    pub(crate) fn finish(mut self) -> IndexSet<CellId> {
        self.open = false;
        self.pop().map(|frame| frame.found).unwrap_or_default()
    }

    fn pop(&self) -> Option<Frame> {
        let popped = self.stack.frames.lock().pop();
        if let Some(frame) = &popped {
            debug_assert_eq!(
                frame.token, self.token,
                "ReactiveContext mismatch: frames closed out of order"
            );
        }
        popped
    }
}

impl Drop for ReactiveContext<'_> {
    fn drop(&mut self) {
        if self.open {
            self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_collects_reads() {
        let stack = TrackingStack::default();
        let a = CellId::new();
        let b = CellId::new();

        assert!(!stack.is_tracking());
        stack.track(a);

        let ctx = ReactiveContext::enter(&stack, true);
        assert!(stack.is_tracking());
        stack.track(a);
        stack.track(b);
        stack.track(a);

        let found = ctx.finish();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![a, b]);
        assert!(!stack.is_tracking());
    }

    #[test]
    fn nested_frames_are_isolated() {
        let stack = TrackingStack::default();
        let outer_read = CellId::new();
        let inner_read = CellId::new();

        let outer = ReactiveContext::enter(&stack, true);
        stack.track(outer_read);
        {
            let inner = ReactiveContext::enter(&stack, true);
            stack.track(inner_read);
            let found = inner.finish();
            assert!(found.contains(&inner_read));
            assert!(!found.contains(&outer_read));
        }

        let found = outer.finish();
        assert!(found.contains(&outer_read));
        assert!(!found.contains(&inner_read));
    }

    #[test]
    fn untracked_frame_swallows_reads() {
        let stack = TrackingStack::default();
        let id = CellId::new();

        let outer = ReactiveContext::enter(&stack, true);
        {
            let _quiet = ReactiveContext::enter(&stack, false);
            assert!(!stack.is_tracking());
            stack.track(id);
        }
        assert!(outer.finish().is_empty());
    }

    #[test]
    fn dropped_guard_pops_frame() {
        let stack = TrackingStack::default();
        {
            let _ctx = ReactiveContext::enter(&stack, true);
            assert!(stack.is_tracking());
        }
        assert!(!stack.is_tracking());
    }
}

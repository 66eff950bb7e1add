use std::alloc::{GlobalAlloc, Layout};
use std::cell::Cell;

use crate::tracer::Tracer;

thread_local! {
    static IN_BOOKKEEPING: Cell<bool> = const { Cell::new(false) };
    static LOCK_OWNER: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as doing tracer bookkeeping.
///
/// While held, allocations made on this thread (hash table growth, stack copies,
/// symbol strings) pass straight through every tracer untracked, so a tracer
/// installed as the global allocator neither recurses into itself nor reports its
/// own memory. Frees are still honoured, see [`LockOwner`].
pub(crate) struct BookkeepingGuard {
    _private: (),
}

impl BookkeepingGuard {
    /// Returns `None` when the thread is already inside bookkeeping, or when its
    /// thread-local storage is being torn down.
    #[inline]
    pub(crate) fn enter() -> Option<Self> {
        IN_BOOKKEEPING
            .try_with(|flag| {
                if flag.replace(true) {
                    None
                } else {
                    Some(Self { _private: () })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for BookkeepingGuard {
    #[inline]
    fn drop(&mut self) {
        let _ = IN_BOOKKEEPING.try_with(|flag| flag.set(false));
    }
}

/// Records which tracer's table lock the current thread holds.
///
/// While a tracer holds its own lock only bookkeeping memory is allocated or freed,
/// and none of it is in the table, so frees reaching that tracer in this window are
/// skipped instead of deadlocking on the lock. Every other free takes the lock.
pub(crate) struct LockOwner {
    previous: usize,
}

impl LockOwner {
    #[inline]
    pub(crate) fn claim(owner: usize) -> Self {
        let previous = LOCK_OWNER.try_with(|cell| cell.replace(owner)).unwrap_or(0);
        Self { previous }
    }

    #[inline]
    pub(crate) fn holds(owner: usize) -> bool {
        LOCK_OWNER
            .try_with(|cell| cell.get() == owner)
            .unwrap_or(false)
    }
}

impl Drop for LockOwner {
    #[inline]
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = LOCK_OWNER.try_with(|cell| cell.set(previous));
    }
}

/// Tracks `$ptr` with the stack captured from the expanding function.
///
/// Expanded in place so that `stack::capture` is called straight from the tracer
/// entry point, which must be `#[inline(never)]` for frame skipping to hold.
macro_rules! track_here {
    ($tracer:expr, $ptr:expr, $size:expr) => {{
        let tracer = $tracer;
        let ptr: *mut u8 = $ptr;
        if tracer.should_track(ptr) {
            if let Some(_guard) = $crate::alloc::allocator::BookkeepingGuard::enter() {
                let captured = if tracer.level() == $crate::level::Level::Stacks {
                    $crate::stack::capture(tracer.frame_limit())
                } else {
                    None
                };
                tracer.insert(ptr, $size, captured.as_ref());
            }
        }
    }};
}

pub(crate) use track_here;

unsafe impl<A: GlobalAlloc> GlobalAlloc for Tracer<A> {
    #[inline(never)]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.delegate().alloc(layout) };
        track_here!(self, ptr, layout.size());
        ptr
    }

    #[inline(never)]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.delegate().alloc_zeroed(layout) };
        track_here!(self, ptr, layout.size());
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Untrack first: once the delegate frees the block another thread may be
        // handed the same address.
        self.untrack(ptr);
        unsafe { self.delegate().dealloc(ptr, layout) };
    }

    #[inline(never)]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let retired = self.retire(ptr);
        let new_ptr = unsafe { self.delegate().realloc(ptr, layout, new_size) };

        if new_ptr.is_null() {
            // The old block is still valid and still owned by the caller.
            if let Some(retired) = retired {
                self.restore(ptr, retired);
            }
            return new_ptr;
        }

        track_here!(self, new_ptr, new_size);
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_is_not_reentrant() {
        let outer = BookkeepingGuard::enter().expect("first entry");
        assert!(BookkeepingGuard::enter().is_none());
        drop(outer);
        assert!(BookkeepingGuard::enter().is_some());
    }

    #[test]
    fn test_guard_is_per_thread() {
        let _outer = BookkeepingGuard::enter().expect("first entry");
        let entered_elsewhere = std::thread::spawn(|| BookkeepingGuard::enter().is_some())
            .join()
            .expect("thread");
        assert!(entered_elsewhere);
    }

    #[test]
    fn test_lock_owner_nests_and_restores() {
        assert!(!LockOwner::holds(1));
        {
            let _outer = LockOwner::claim(1);
            assert!(LockOwner::holds(1));
            {
                let _inner = LockOwner::claim(2);
                assert!(LockOwner::holds(2));
                assert!(!LockOwner::holds(1));
            }
            assert!(LockOwner::holds(1));
        }
        assert!(!LockOwner::holds(1));
    }
}

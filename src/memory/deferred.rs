use std::fmt;
use std::fmt::Debug;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// An intrusive link the reclaimer uses to thread condemned nodes together.
///
/// The link is read and written through relaxed atomics rather than a plain
/// field: a thread holding a stale reference to a node may still load its link
/// while the reclaimer is re-chaining that node onto the pending list. The
/// stale reader throws the value away once its CAS fails, but the access
/// itself must not race.
pub trait Chained {
    fn next_link(&self) -> *mut Self;
    fn set_next_link(&self, next: *mut Self);
}

/// A reclamation service that defers freeing until a quiescent moment.
///
/// Removal sections are bracketed by `enter` and `retire`. Nodes handed to
/// `retire` while other threads are inside a removal section cannot be freed,
/// because one of those threads may be mid-dereference of a stale reference;
/// they are chained onto a lock-free pending list instead. Whichever thread
/// later observes itself to be the sole active remover takes the whole list
/// in one exchange and frees it in a batch.
///
/// Under sustained contention the pending list can grow without bound before
/// a quiescent moment arrives. That is a property of the scheme, not a leak:
/// no node is ever freed while a thread could still reach it, and the next
/// uncontended removal drains everything.
pub struct QuiescentReclaimer<N: Chained> {
    active_threads: AtomicUsize,
    pending: AtomicPtr<N>
}

impl<N: Chained> QuiescentReclaimer<N> {
    pub fn new() -> Self {
        QuiescentReclaimer {
            active_threads: AtomicUsize::new(0),
            pending: AtomicPtr::default()
        }
    }

    /// Mark the calling thread as inside a removal section. Every `enter`
    /// must be balanced by exactly one `retire`.
    pub fn enter(&self) {
        self.active_threads.fetch_add(1, Ordering::SeqCst);
    }

    /// Leave the removal section, condemning `node` if it is non-null. The
    /// node must already be unreachable from the live structure.
    ///
    /// If this thread is the only active remover it takes ownership of the
    /// pending list; if it is confirmed still alone after leaving, it frees
    /// the list and `node` outright. Nodes condemned by threads that arrived
    /// mid-drain cannot be proven safe and are chained back. A thread that
    /// was never alone just adds `node` to the list and leaves.
    pub unsafe fn retire(&self, node: *mut N) {
        if self.active_threads.load(Ordering::SeqCst) == 1 {
            let claimed = self.pending.swap(ptr::null_mut(), Ordering::AcqRel);
            if self.active_threads.fetch_sub(1, Ordering::SeqCst) == 1 {
                free_list(claimed);
            } else if !claimed.is_null() {
                self.chain_list(claimed);
            }
            if !node.is_null() {
                drop(Box::from_raw(node));
            }
        } else {
            if !node.is_null() {
                self.chain_one(node);
            }
            self.active_threads.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True when no condemned nodes are awaiting reclamation.
    pub fn is_quiescent(&self) -> bool {
        self.pending.load(Ordering::Acquire).is_null()
    }

    fn chain_list(&self, first: *mut N) {
        let mut last = first;
        unsafe {
            loop {
                let next = (*last).next_link();
                if next.is_null() {
                    break;
                }
                last = next;
            }
        }
        self.chain_span(first, last);
    }

    fn chain_one(&self, node: *mut N) {
        self.chain_span(node, node);
    }

    // Prepend the sublist first..=last in one CAS, tolerating concurrent
    // prepends by other retiring threads.
    fn chain_span(&self, first: *mut N, last: *mut N) {
        let mut old_head = self.pending.load(Ordering::Relaxed);
        loop {
            unsafe { (*last).set_next_link(old_head); }
            match self.pending.compare_exchange_weak(old_head, first, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => { return; },
                Err(actual) => { old_head = actual; }
            }
        }
    }
}

unsafe fn free_list<N: Chained>(mut node: *mut N) {
    while !node.is_null() {
        let next = (*node).next_link();
        drop(Box::from_raw(node));
        node = next;
    }
}

impl<N: Chained> Drop for QuiescentReclaimer<N> {
    fn drop(&mut self) {
        // Teardown assumes no thread is still inside a removal section
        unsafe {
            free_list(self.pending.load(Ordering::Relaxed));
        }
    }
}

impl<N: Chained> Debug for QuiescentReclaimer<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "QuiescentReclaimer {{ active_threads: {}, quiescent: {} }}",
               self.active_threads.load(Ordering::Relaxed), self.is_quiescent())
    }
}

#[cfg(test)]
mod tests {
    use super::{Chained, QuiescentReclaimer};
    use std::ptr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

    struct TestNode {
        drops: Arc<AtomicUsize>,
        next: AtomicPtr<TestNode>
    }

    impl TestNode {
        fn new(drops: &Arc<AtomicUsize>) -> *mut Self {
            Box::into_raw(Box::new(TestNode {
                drops: drops.clone(),
                next: AtomicPtr::default()
            }))
        }
    }

    impl Drop for TestNode {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Chained for TestNode {
        fn next_link(&self) -> *mut Self {
            self.next.load(Ordering::Relaxed)
        }

        fn set_next_link(&self, next: *mut Self) {
            self.next.store(next, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_sole_remover_frees_immediately() {
        let drops = Arc::new(AtomicUsize::new(0));
        let reclaimer: QuiescentReclaimer<TestNode> = QuiescentReclaimer::new();

        reclaimer.enter();
        unsafe { reclaimer.retire(TestNode::new(&drops)); }

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(reclaimer.is_quiescent());
    }

    #[test]
    fn test_contended_retire_defers() {
        let drops = Arc::new(AtomicUsize::new(0));
        let reclaimer: QuiescentReclaimer<TestNode> = QuiescentReclaimer::new();

        // A second remover is still inside its section, so the first retire
        // cannot free anything
        reclaimer.enter();
        reclaimer.enter();
        unsafe { reclaimer.retire(TestNode::new(&drops)); }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(!reclaimer.is_quiescent());

        // The remaining remover leaves alone and drains the batch
        unsafe { reclaimer.retire(TestNode::new(&drops)); }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(reclaimer.is_quiescent());
    }

    #[test]
    fn test_null_retire_only_balances() {
        let drops = Arc::new(AtomicUsize::new(0));
        let reclaimer: QuiescentReclaimer<TestNode> = QuiescentReclaimer::new();

        reclaimer.enter();
        reclaimer.enter();
        unsafe { reclaimer.retire(TestNode::new(&drops)); }
        assert!(!reclaimer.is_quiescent());

        // An empty removal under contention condemns nothing and drains nothing
        reclaimer.enter();
        unsafe { reclaimer.retire(ptr::null_mut()); }
        assert!(!reclaimer.is_quiescent());

        // The last remover out drains the batch even though it condemned nothing
        unsafe { reclaimer.retire(ptr::null_mut()); }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(reclaimer.is_quiescent());
    }

    #[test]
    fn test_drop_drains_pending() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let reclaimer: QuiescentReclaimer<TestNode> = QuiescentReclaimer::new();
            reclaimer.chain_one(TestNode::new(&drops));
            reclaimer.chain_one(TestNode::new(&drops));
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            assert!(!reclaimer.is_quiescent());
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}

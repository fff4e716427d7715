use memory::{Chained, QuiescentReclaimer};
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A lock-free Treiber stack with deferred batched reclamation.
///
/// Unlike [`Stack`](struct.Stack.html), nodes carry no reference counts.
/// Instead every pop runs inside a removal section of a
/// [`QuiescentReclaimer`](../memory/struct.QuiescentReclaimer.html): an
/// unlinked node is freed on the spot by a pop that can prove it ran alone,
/// and condemned onto the reclaimer's pending list otherwise. Under sustained
/// pop contention condemned nodes accumulate until a quiescent moment lets a
/// lone popper drain them in one batch; that delays reclamation but never
/// compromises it, since no node is freed while any thread could still reach
/// it.
pub struct DeferredStack<T: Send> {
    head: AtomicPtr<Node<T>>,
    reclaimer: QuiescentReclaimer<Node<T>>
}

unsafe impl<T: Send> Send for DeferredStack<T> {}
unsafe impl<T: Send> Sync for DeferredStack<T> {}

struct Node<T> {
    data: Option<T>,
    next: AtomicPtr<Node<T>>
}

impl<T> Node<T> {
    fn new_as_pointer(val: T, next: *mut Node<T>) -> *mut Self {
        Box::into_raw(Box::new(Node {
            data: Some(val),
            next: AtomicPtr::new(next)
        }))
    }
}

impl<T> Chained for Node<T> {
    fn next_link(&self) -> *mut Self {
        self.next.load(Ordering::Relaxed)
    }

    fn set_next_link(&self, next: *mut Self) {
        self.next.store(next, Ordering::Relaxed);
    }
}

impl<T: Send> DeferredStack<T> {
    /// Create a new DeferredStack.
    /// # Examples
    /// ```
    /// use linkfree::structures::DeferredStack;
    ///
    /// let stack: DeferredStack<String> = DeferredStack::new();
    /// ```
    pub fn new() -> Self {
        DeferredStack {
            head: AtomicPtr::default(),
            reclaimer: QuiescentReclaimer::new()
        }
    }

    /// Push an element onto the top of the stack.
    /// # Examples
    /// ```
    /// use linkfree::structures::DeferredStack;
    ///
    /// let stack: DeferredStack<String> = DeferredStack::new();
    /// stack.push("hello".to_owned());
    /// ```
    pub fn push(&self, val: T) {
        let node = Node::new_as_pointer(val, self.head.load(Ordering::Relaxed));
        loop {
            let old_head = unsafe { (*node).next_link() };
            match self.head.compare_exchange_weak(old_head, node, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => { return; },
                Err(actual) => unsafe { (*node).set_next_link(actual); }
            }
        }
    }

    /// Pop the most recently pushed element, or return None if the stack is empty.
    /// # Examples
    /// ```
    /// use linkfree::structures::DeferredStack;
    ///
    /// let stack: DeferredStack<String> = DeferredStack::new();
    /// stack.push("hello".to_owned());
    /// assert_eq!(stack.pop(), Some("hello".to_owned()));
    /// assert_eq!(stack.pop(), None);
    /// ```
    pub fn pop(&self) -> Option<T> {
        self.reclaimer.enter();
        let mut old_head = self.head.load(Ordering::Acquire);
        while !old_head.is_null() {
            let next = unsafe { (*old_head).next_link() };
            match self.head.compare_exchange_weak(old_head, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => { break; },
                Err(actual) => { old_head = actual; }
            }
        }
        // The unlinked node belongs to this thread alone now; hand the data
        // out before the node is condemned
        let res = if old_head.is_null() {
            None
        } else {
            unsafe { (*old_head).data.take() }
        };
        unsafe { self.reclaimer.retire(old_head); }
        res
    }

    /// True when no condemned nodes are awaiting reclamation.
    pub fn is_quiescent(&self) -> bool {
        self.reclaimer.is_quiescent()
    }
}

impl<T: Send> Default for DeferredStack<T> {
    fn default() -> Self {
        DeferredStack::new()
    }
}

impl<T: Send> Drop for DeferredStack<T> {
    fn drop(&mut self) {
        // The reclaimer's own Drop frees the pending list
        let mut current = self.head.load(Ordering::Relaxed);
        while !current.is_null() {
            unsafe {
                let next = (*current).next_link();
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

impl<T: Send> Debug for DeferredStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeferredStack {{ empty: {}, reclaimer: {:?} }}",
               self.head.load(Ordering::Relaxed).is_null(), self.reclaimer)
    }
}

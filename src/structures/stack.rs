use memory::{AtomicCountedPtr, CountedNode, CountedPtr};
use std::cell::UnsafeCell;
use std::cmp;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use rand::{FromEntropy, Rng};
use rand::rngs::SmallRng;
use thread_local::CachedThreadLocal;

const MAX_BACKOFF: u32 = 2048;

/// A lock-free stack with split reference counting.
///
/// This is the queue's reclamation discipline specialized to a single-ended
/// list: one counted head handle over the same counted nodes. There is no
/// dummy node; a null head pointer means the stack is empty.
///
/// A stack node is only ever named by one external counter at a time. When a
/// push displaces the head, the displaced handle value rides inside the new
/// node's next field, count included, and is restored verbatim when that node
/// is popped, so references acquired before the push stay accounted for.
pub struct Stack<T: Send> {
    head: AtomicCountedPtr<CountedNode<T>>,
    rng: CachedThreadLocal<UnsafeCell<SmallRng>>
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T: Send> Stack<T> {
    /// Create a new Stack.
    /// # Examples
    /// ```
    /// use linkfree::structures::Stack;
    ///
    /// let stack: Stack<String> = Stack::new();
    /// ```
    pub fn new() -> Self {
        Stack {
            head: AtomicCountedPtr::new(CountedPtr::null()),
            rng: CachedThreadLocal::new()
        }
    }

    fn backoff(&self, max_backoff: u32) -> u32 {
        let rng = self.rng.get_or(|| Box::new(UnsafeCell::new(SmallRng::from_entropy())));
        unsafe {
            let backoff_time = (*rng.get()).gen_range(0, max_backoff);
            thread::sleep(Duration::new(0, backoff_time * 10));
        }
        cmp::min(max_backoff * 2, MAX_BACKOFF)
    }

    /// Push an element onto the top of the stack.
    /// # Examples
    /// ```
    /// use linkfree::structures::Stack;
    ///
    /// let stack: Stack<String> = Stack::new();
    /// stack.push("hello".to_owned());
    /// ```
    pub fn push(&self, val: T) {
        let node = CountedNode::with_value(val);
        let new_head = CountedPtr::new(1, node);
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next.store(old_head, Ordering::Relaxed); }
            match self.head.compare_exchange_weak(old_head, new_head, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => { return; },
                Err(actual) => { old_head = actual; }
            }
        }
    }

    /// Pop the most recently pushed element, or return None if the stack is empty.
    /// # Examples
    /// ```
    /// use linkfree::structures::Stack;
    ///
    /// let stack: Stack<String> = Stack::new();
    /// stack.push("hello".to_owned());
    /// assert_eq!(stack.pop(), Some("hello".to_owned()));
    /// assert_eq!(stack.pop(), None);
    /// ```
    pub fn pop(&self) -> Option<T> {
        let mut backoff = 1;
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            self.head.increase_external_count(&mut old_head);
            let node = old_head.ptr;
            if node.is_null() {
                return None;
            }
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            match self.head.compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    unsafe {
                        let res = (*node).take_data();
                        CountedNode::free_external_counter(old_head);
                        return res;
                    }
                },
                Err(actual) => {
                    unsafe { CountedNode::release_ref(node); }
                    old_head = actual;
                }
            }
            backoff = self.backoff(backoff);
        }
    }
}

impl<T: Send> Default for Stack<T> {
    fn default() -> Self {
        Stack::new()
    }
}

impl<T: Send> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut current = self.head.load(Ordering::Relaxed).ptr;
        while !current.is_null() {
            unsafe {
                let next = (*current).next.load(Ordering::Relaxed).ptr;
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

impl<T: Send> Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Stack {{ head: {:?} }}", self.head)
    }
}

use memory::{AtomicCountedPtr, CountedNode, CountedPtr};
use std::cell::UnsafeCell;
use std::cmp;
use std::fmt;
use std::fmt::Debug;
use std::ptr;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use rand::{FromEntropy, Rng};
use rand::rngs::SmallRng;
use thread_local::CachedThreadLocal;

const MAX_BACKOFF: u32 = 2048;

/// A lock-free queue with split reference counting.
///
/// The queue is a linked list of counted nodes in the style of [Simple, Fast,
/// and Practical Non-blocking and Blocking Concurrent Queue Algorithms](https://dl.acm.org/citation.cfm?id=248106),
/// with memory reclaimed through the external counts carried by the head and
/// tail handles. The list always contains at least one node: the tail node is
/// a dummy whose data slot the next enqueue claims, so the queue is logically
/// empty exactly when head and tail point at the same node.
///
/// Enqueue uses a helping protocol. A thread that loses the race to claim the
/// tail's data slot links the winner's next dummy and advances the tail on the
/// winner's behalf, so a stalled peer can never hold the queue up.
pub struct Queue<T: Send> {
    head: AtomicCountedPtr<CountedNode<T>>,
    tail: AtomicCountedPtr<CountedNode<T>>,
    rng: CachedThreadLocal<UnsafeCell<SmallRng>>
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T: Send> Queue<T> {
    /// Create a new Queue.
    /// # Examples
    /// ```
    /// use linkfree::structures::Queue;
    ///
    /// let queue: Queue<String> = Queue::new();
    /// ```
    pub fn new() -> Self {
        let dummy = CountedNode::dummy();
        Queue {
            head: AtomicCountedPtr::new(CountedPtr::new(1, dummy)),
            tail: AtomicCountedPtr::new(CountedPtr::new(1, dummy)),
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

    /// Add a new element to the back of the queue.
    /// # Examples
    /// ```
    /// use linkfree::structures::Queue;
    ///
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// ```
    pub fn enqueue(&self, val: T) {
        let mut backoff = 1;
        let data = Box::into_raw(Box::new(val));
        // The dummy that will become the new tail. A helping peer may consume
        // it, in which case a fresh one is allocated for the retry.
        let mut new_next = CountedPtr::new(1, CountedNode::dummy());
        let mut old_tail = self.tail.load(Ordering::Relaxed);
        loop {
            self.tail.increase_external_count(&mut old_tail);
            unsafe {
                if (*old_tail.ptr).claim_data(data) {
                    // This thread claimed the slot. Link our dummy, unless a
                    // helper already linked one for us.
                    let mut next = new_next;
                    if let Err(actual) = (*old_tail.ptr).next
                            .compare_exchange(CountedPtr::null(), new_next, Ordering::AcqRel, Ordering::Acquire) {
                        drop(Box::from_raw(new_next.ptr));
                        next = actual;
                    }
                    self.set_new_tail(old_tail, next);
                    return;
                } else {
                    // Another thread claimed first: help it by linking its
                    // next dummy, then retry on the advanced tail
                    match (*old_tail.ptr).next
                            .compare_exchange(CountedPtr::null(), new_next, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => {
                            let next = new_next;
                            new_next = CountedPtr::new(1, CountedNode::dummy());
                            self.set_new_tail(old_tail, next);
                        },
                        Err(actual) => {
                            self.set_new_tail(old_tail, actual);
                        }
                    }
                }
            }
            backoff = self.backoff(backoff);
        }
    }

    // Advance the shared tail from old_tail to new_tail, then reconcile
    // ownership: the thread whose CAS moved the pointer retires the old
    // handle's external counter, while a thread that lost to a concurrent
    // advance only gives back its own acquired reference.
    fn set_new_tail(&self, mut old_tail: CountedPtr<CountedNode<T>>, new_tail: CountedPtr<CountedNode<T>>) {
        let current = old_tail.ptr;
        loop {
            match self.tail.compare_exchange_weak(old_tail, new_tail, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    unsafe { CountedNode::free_external_counter(old_tail); }
                    return;
                },
                Err(actual) => {
                    if !ptr::eq(actual.ptr, current) {
                        unsafe { CountedNode::release_ref(current); }
                        return;
                    }
                    // Same node, new count: a peer acquired the tail while we
                    // were advancing it
                    old_tail = actual;
                }
            }
        }
    }

    /// Take an element from the front of the queue, or return None if the queue is empty.
    /// # Examples
    /// ```
    /// use linkfree::structures::Queue;
    ///
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// assert_eq!(queue.dequeue(), Some("hello".to_owned()));
    /// ```
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = 1;
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            self.head.increase_external_count(&mut old_head);
            let node = old_head.ptr;
            if ptr::eq(node, self.tail.load(Ordering::Acquire).ptr) {
                // Only the dummy is left: logically empty. The acquired
                // reference still has to be handed back.
                unsafe { CountedNode::release_ref(node); }
                return None;
            }
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
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

impl<T: Send> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T: Send> Drop for Queue<T> {
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

impl<T: Send> Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Queue {{ head: {:?}, tail: {:?} }}", self.head, self.tail)
    }
}

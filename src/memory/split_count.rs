use std::fmt;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

// A pointer and its external count share one atomic word: the count lives in
// the 16 bits above the 48-bit user-space address. User-space pointers on
// x86-64 and AArch64 fit in 48 bits, and the count only needs to cover the
// threads simultaneously inside an acquire.
const PTR_BITS: u64 = 48;
const PTR_MASK: u64 = (1 << PTR_BITS) - 1;

/// A snapshot of a counted pointer: how many external references have been
/// handed out through the handle, and the node the handle refers to.
pub struct CountedPtr<N> {
    pub external_count: usize,
    pub ptr: *mut N
}

impl<N> CountedPtr<N> {
    pub fn new(external_count: usize, ptr: *mut N) -> Self {
        CountedPtr {
            external_count,
            ptr
        }
    }

    pub fn null() -> Self {
        CountedPtr {
            external_count: 0,
            ptr: ptr::null_mut()
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

impl<N> Clone for CountedPtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for CountedPtr<N> {}

impl<N> PartialEq for CountedPtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.external_count == other.external_count && ptr::eq(self.ptr, other.ptr)
    }
}

impl<N> Debug for CountedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CountedPtr {{ external_count: {}, ptr: {:?} }}", self.external_count, self.ptr)
    }
}

fn pack<N>(counted: CountedPtr<N>) -> u64 {
    ((counted.external_count as u64) << PTR_BITS) | (counted.ptr as u64 & PTR_MASK)
}

fn unpack<N>(bits: u64) -> CountedPtr<N> {
    CountedPtr {
        external_count: (bits >> PTR_BITS) as usize,
        ptr: (bits & PTR_MASK) as usize as *mut N
    }
}

/// A counted pointer updatable as one atomic unit.
///
/// Comparing the count together with the pointer is what defeats the ABA
/// problem: a freed and reused address can never match a stale snapshot,
/// because the count moved on. Every thread that wants to dereference the
/// target must first register itself with `increase_external_count`.
pub struct AtomicCountedPtr<N> {
    bits: AtomicU64,
    _marker: PhantomData<*mut N>
}

impl<N> AtomicCountedPtr<N> {
    pub fn new(counted: CountedPtr<N>) -> Self {
        AtomicCountedPtr {
            bits: AtomicU64::new(pack(counted)),
            _marker: PhantomData
        }
    }

    pub fn load(&self, order: Ordering) -> CountedPtr<N> {
        unpack(self.bits.load(order))
    }

    pub fn store(&self, counted: CountedPtr<N>, order: Ordering) {
        self.bits.store(pack(counted), order)
    }

    pub fn compare_exchange(&self, current: CountedPtr<N>, new: CountedPtr<N>, success: Ordering, failure: Ordering)
            -> Result<CountedPtr<N>, CountedPtr<N>> {
        match self.bits.compare_exchange(pack(current), pack(new), success, failure) {
            Ok(bits) => Ok(unpack(bits)),
            Err(bits) => Err(unpack(bits))
        }
    }

    pub fn compare_exchange_weak(&self, current: CountedPtr<N>, new: CountedPtr<N>, success: Ordering, failure: Ordering)
            -> Result<CountedPtr<N>, CountedPtr<N>> {
        match self.bits.compare_exchange_weak(pack(current), pack(new), success, failure) {
            Ok(bits) => Ok(unpack(bits)),
            Err(bits) => Err(unpack(bits))
        }
    }

    /// Register an external reference on whatever value the handle currently
    /// holds, leaving `current` as the post-increment snapshot. After this
    /// returns, the caller may dereference `current.ptr` until it hands the
    /// reference back through one of the release paths on the node.
    pub fn increase_external_count(&self, current: &mut CountedPtr<N>) {
        loop {
            let new = CountedPtr::new(current.external_count + 1, current.ptr);
            match self.compare_exchange_weak(*current, new, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => {
                    *current = new;
                    return;
                },
                Err(actual) => {
                    *current = actual;
                }
            }
        }
    }
}

impl<N> Debug for AtomicCountedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Atomic{:?}", self.load(Ordering::Relaxed))
    }
}

// The internal adjustment and the number of external counters still naming
// the node, packed so both can move in one CAS. The internal half is signed:
// folding in a finished external counter can push it below zero until the
// remaining in-flight releases arrive.
struct Counts {
    internal: i32,
    external_counters: u32
}

fn pack_counts(counts: Counts) -> u64 {
    ((counts.internal as u32 as u64) << 32) | counts.external_counters as u64
}

fn unpack_counts(bits: u64) -> Counts {
    Counts {
        internal: (bits >> 32) as u32 as i32,
        external_counters: bits as u32
    }
}

struct SplitCounter {
    bits: AtomicU64
}

impl SplitCounter {
    fn new(external_counters: u32) -> Self {
        SplitCounter {
            bits: AtomicU64::new(pack_counts(Counts { internal: 0, external_counters }))
        }
    }

    /// Drop one internal reference. Returns true when the node is dead and
    /// the caller must free it.
    fn release_ref(&self) -> bool {
        let mut old_bits = self.bits.load(Ordering::Relaxed);
        loop {
            let mut counts = unpack_counts(old_bits);
            counts.internal -= 1;
            let dead = counts.internal == 0 && counts.external_counters == 0;
            match self.bits.compare_exchange_weak(old_bits, pack_counts(counts), Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => { return dead; },
                Err(bits) => { old_bits = bits; }
            }
        }
    }

    /// Retire one external counter, folding its final count into the internal
    /// half. The two subtracted references pay for the counter itself and for
    /// the calling thread's own acquire. Returns true when the node is dead.
    fn free_external(&self, external_count: usize) -> bool {
        let delta = external_count as i32 - 2;
        let mut old_bits = self.bits.load(Ordering::Relaxed);
        loop {
            let mut counts = unpack_counts(old_bits);
            counts.internal += delta;
            counts.external_counters -= 1;
            let dead = counts.internal == 0 && counts.external_counters == 0;
            match self.bits.compare_exchange_weak(old_bits, pack_counts(counts), Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => { return dead; },
                Err(bits) => { old_bits = bits; }
            }
        }
    }
}

impl Debug for SplitCounter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let counts = unpack_counts(self.bits.load(Ordering::Relaxed));
        write!(f, "SplitCounter {{ internal: {}, external_counters: {} }}", counts.internal, counts.external_counters)
    }
}

/// A linked node whose lifetime is governed by split reference counting.
///
/// The node is freed exactly when every external counter that ever named it
/// has been retired and every in-flight acquire has been released. Both free
/// paths live here so the accounting cannot be split across call sites.
pub struct CountedNode<T> {
    data: AtomicPtr<T>,
    counter: SplitCounter,
    pub next: AtomicCountedPtr<CountedNode<T>>
}

impl<T> CountedNode<T> {
    /// A node with no data yet, referenced by two external counters for its
    /// whole live life: the tail handle plus either the head handle or the
    /// predecessor's next handle. This is the queue's dummy.
    pub fn dummy() -> *mut Self {
        Box::into_raw(Box::new(CountedNode {
            data: AtomicPtr::default(),
            counter: SplitCounter::new(2),
            next: AtomicCountedPtr::new(CountedPtr::null())
        }))
    }

    /// A node created with its data in place, referenced by a single external
    /// counter. This is a stack node: only the head handle ever names it.
    pub fn with_value(value: T) -> *mut Self {
        Box::into_raw(Box::new(CountedNode {
            data: AtomicPtr::new(Box::into_raw(Box::new(value))),
            counter: SplitCounter::new(1),
            next: AtomicCountedPtr::new(CountedPtr::null())
        }))
    }

    /// Claim the empty data slot for `data`. The slot is write-once: exactly
    /// one claiming thread succeeds, and the failure ordering is acquire so a
    /// losing helper observes the winner's value as published.
    pub fn claim_data(&self, data: *mut T) -> bool {
        self.data.compare_exchange(ptr::null_mut(), data, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Take ownership of the stored data, leaving the slot empty. The slot is
    /// never read again once a popping thread has swapped it out.
    pub fn take_data(&self) -> Option<T> {
        let data = self.data.swap(ptr::null_mut(), Ordering::AcqRel);
        if data.is_null() {
            None
        } else {
            unsafe { Some(*Box::from_raw(data)) }
        }
    }

    /// Hand back a reference obtained through `increase_external_count`,
    /// freeing the node if this was the last one. The only legal deallocation
    /// paths for a counted node are this and `free_external_counter`.
    pub unsafe fn release_ref(node: *mut Self) {
        if (*node).counter.release_ref() {
            drop(Box::from_raw(node));
        }
    }

    /// Retire the external counter snapshotted in `old`, freeing the node if
    /// its counts are exhausted. Called by the thread that removed the handle
    /// from the structure, with the snapshot its removal CAS observed.
    pub unsafe fn free_external_counter(old: CountedPtr<CountedNode<T>>) {
        if (*old.ptr).counter.free_external(old.external_count) {
            drop(Box::from_raw(old.ptr));
        }
    }
}

impl<T> Drop for CountedNode<T> {
    fn drop(&mut self) {
        let data = self.data.load(Ordering::Relaxed);
        if !data.is_null() {
            unsafe {
                drop(Box::from_raw(data));
            }
        }
    }
}

impl<T> Debug for CountedNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CountedNode {{ claimed: {}, counter: {:?}, next: {:?} }}",
               !self.data.load(Ordering::Relaxed).is_null(), self.counter, self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicCountedPtr, CountedNode, CountedPtr};
    use std::ptr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropTally {
        drops: Arc<AtomicUsize>
    }

    impl Drop for DropTally {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_pack_roundtrip() {
        let node = CountedNode::with_value(42u64);
        let handle = AtomicCountedPtr::new(CountedPtr::new(7, node));
        let loaded = handle.load(Ordering::Relaxed);
        assert_eq!(loaded.external_count, 7);
        assert!(ptr::eq(loaded.ptr, node));

        let null: AtomicCountedPtr<CountedNode<u64>> = AtomicCountedPtr::new(CountedPtr::null());
        assert!(null.load(Ordering::Relaxed).is_null());
        assert_eq!(null.load(Ordering::Relaxed).external_count, 0);

        unsafe { CountedNode::free_external_counter(CountedPtr::new(2, node)); }
    }

    #[test]
    fn test_acquire_bumps_count() {
        let node = CountedNode::with_value(1u8);
        let handle = AtomicCountedPtr::new(CountedPtr::new(1, node));
        let mut snapshot = handle.load(Ordering::Relaxed);
        handle.increase_external_count(&mut snapshot);
        assert_eq!(snapshot.external_count, 2);
        assert_eq!(handle.load(Ordering::Relaxed).external_count, 2);

        // A stale snapshot resyncs instead of spinning forever
        let mut stale = CountedPtr::new(1, node);
        handle.increase_external_count(&mut stale);
        assert_eq!(stale.external_count, 3);

        unsafe { CountedNode::free_external_counter(CountedPtr::new(3, node)); }
        unsafe { CountedNode::release_ref(node); }
    }

    #[test]
    fn test_sole_acquirer_frees_on_unlink() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = CountedNode::with_value(DropTally { drops: drops.clone() });
        let handle = AtomicCountedPtr::new(CountedPtr::new(1, node));

        let mut snapshot = handle.load(Ordering::Relaxed);
        handle.increase_external_count(&mut snapshot);
        let value = unsafe { (*snapshot.ptr).take_data() };
        assert!(value.is_some());
        drop(value);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // external count 2, delta 0, last counter retired: node freed here
        unsafe { CountedNode::free_external_counter(snapshot); }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_straggler_frees_after_unlink() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = CountedNode::with_value(DropTally { drops: drops.clone() });
        let handle = AtomicCountedPtr::new(CountedPtr::new(1, node));

        // Two readers acquire, then one of them unlinks
        let mut unlinker = handle.load(Ordering::Relaxed);
        handle.increase_external_count(&mut unlinker);
        let mut straggler = unlinker;
        handle.increase_external_count(&mut straggler);

        drop(unsafe { (*straggler.ptr).take_data() });
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        unsafe { CountedNode::free_external_counter(straggler); }

        // The unlink left one internal reference for the straggler
        unsafe { CountedNode::release_ref(node); }
    }

    #[test]
    fn test_claim_data_is_write_once() {
        let node_ptr = CountedNode::dummy();
        let node = unsafe { &*node_ptr };
        let first = Box::into_raw(Box::new(10u32));
        let second = Box::into_raw(Box::new(20u32));

        assert!(node.claim_data(first));
        assert!(!node.claim_data(second));
        unsafe { drop(Box::from_raw(second)); }

        assert_eq!(node.take_data(), Some(10));
        assert_eq!(node.take_data(), None);

        unsafe { drop(Box::from_raw(node_ptr)); }
    }
}

//! A node pointer bundled with its external reference count in a single atomic word.
//!
//! Split reference counting needs the pair `(external_count, node)` to be read, written and
//! compared as one unit. The pair is packed into one integer twice the width of a pointer:
//! the full node address in the low half and the count in the high half. On 64-bit targets
//! that word is swapped with a double-word CAS (`cmpxchg16b`, `casp`/`ldxp`+`stxp`) through
//! `portable_atomic::AtomicU128`; on 32-bit targets a plain `AtomicU64` does.
//!
//! The count grows by one every time a thread takes a reference through the slot and only
//! starts over when the node is unlinked, so it needs at least the range of a machine `int`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        use portable_atomic::AtomicU128 as AtomicBits;

        type Bits = u128;
        const PTR_BITS: u32 = 64;
    } else {
        use std::sync::atomic::AtomicU64 as AtomicBits;

        type Bits = u64;
        const PTR_BITS: u32 = 32;
    }
}

const PTR_MASK: Bits = (1 << PTR_BITS) - 1;

/// Largest external count a `CountedNodePtr` can carry.
pub const MAX_EXTERNAL_COUNT: u64 = (Bits::max_value() >> PTR_BITS) as u64;

/// `(external_count, node)` pair. A plain value: copying it never touches the node.
pub struct CountedNodePtr<N> {
    bits: Bits,
    _marker: PhantomData<*mut N>,
}

impl<N> Clone for CountedNodePtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for CountedNodePtr<N> {}

impl<N> PartialEq for CountedNodePtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<N> Eq for CountedNodePtr<N> {}

impl<N> fmt::Debug for CountedNodePtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CountedNodePtr")
            .field("external_count", &self.external_count())
            .field("ptr", &self.ptr())
            .finish()
    }
}

impl<N> CountedNodePtr<N> {
    #[inline]
    fn from_bits(bits: Bits) -> Self {
        CountedNodePtr {
            bits,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn new(ptr: *mut N, external_count: u64) -> Self {
        debug_assert!(external_count <= MAX_EXTERNAL_COUNT);
        Self::from_bits(ptr as usize as Bits | (external_count as Bits) << PTR_BITS)
    }

    /// The empty sentinel: a null node held once by the head slot.
    #[inline]
    pub fn null() -> Self {
        Self::from_bits(1 << PTR_BITS)
    }

    #[inline]
    pub fn ptr(&self) -> *mut N {
        (self.bits & PTR_MASK) as usize as *mut N
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.bits & PTR_MASK == 0
    }

    #[inline]
    pub fn external_count(&self) -> u64 {
        (self.bits >> PTR_BITS) as u64
    }

    /// Same node, one more external reference.
    #[inline]
    pub fn with_incremented_count(&self) -> Self {
        assert!(
            self.external_count() < MAX_EXTERNAL_COUNT,
            "external count overflow"
        );
        Self::from_bits(self.bits + (1 << PTR_BITS))
    }
}

/// The shared slot holding a `CountedNodePtr`. It is only ever changed through atomic
/// read-modify-write operations.
pub struct AtomicCountedPtr<N> {
    bits: AtomicBits,
    _marker: PhantomData<*mut N>,
}

impl<N> AtomicCountedPtr<N> {
    pub fn new(v: CountedNodePtr<N>) -> Self {
        AtomicCountedPtr {
            bits: AtomicBits::new(v.bits),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> CountedNodePtr<N> {
        CountedNodePtr::from_bits(self.bits.load(order))
    }

    #[inline]
    pub fn swap(&self, v: CountedNodePtr<N>, order: Ordering) -> CountedNodePtr<N> {
        CountedNodePtr::from_bits(self.bits.swap(v.bits, order))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: CountedNodePtr<N>,
        new: CountedNodePtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedNodePtr<N>, CountedNodePtr<N>> {
        self.bits
            .compare_exchange(current.bits, new.bits, success, failure)
            .map(CountedNodePtr::from_bits)
            .map_err(CountedNodePtr::from_bits)
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: CountedNodePtr<N>,
        new: CountedNodePtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedNodePtr<N>, CountedNodePtr<N>> {
        self.bits
            .compare_exchange_weak(current.bits, new.bits, success, failure)
            .map(CountedNodePtr::from_bits)
            .map_err(CountedNodePtr::from_bits)
    }
}

mod test {

    #[test]
    fn test_null() {
        use counted_ptr::CountedNodePtr;

        let p = CountedNodePtr::<u64>::null();
        assert!(p.is_null());
        assert!(p.ptr().is_null());
        assert_eq!(p.external_count(), 1);
    }

    #[test]
    fn test_pack() {
        use counted_ptr::CountedNodePtr;

        let node = Box::into_raw(Box::new(42_u64));
        let p = CountedNodePtr::new(node, 1);
        assert_eq!(p.ptr(), node);
        assert!(!p.is_null());
        assert_eq!(p.external_count(), 1);

        let q = p.with_incremented_count().with_incremented_count();
        assert_eq!(q.ptr(), node);
        assert_eq!(q.external_count(), 3);
        assert!(p != q);
        assert_eq!(unsafe { *q.ptr() }, 42);

        unsafe { drop(Box::from_raw(node)) };
    }

    #[test]
    fn test_count_range() {
        use counted_ptr::{CountedNodePtr, MAX_EXTERNAL_COUNT};

        assert!(MAX_EXTERNAL_COUNT >= i32::max_value() as u64);

        let node = Box::into_raw(Box::new(0_u8));
        let mut p = CountedNodePtr::new(node, 0xfffe);
        for _ in 0..4 {
            p = p.with_incremented_count();
        }
        assert_eq!(p.external_count(), 0x1_0002);
        assert_eq!(p.ptr(), node);

        let q = CountedNodePtr::new(node, MAX_EXTERNAL_COUNT);
        assert_eq!(q.external_count(), MAX_EXTERNAL_COUNT);
        assert_eq!(q.ptr(), node);
        unsafe { drop(Box::from_raw(node)) };
    }

    #[test]
    fn test_any_address_fits() {
        use counted_ptr::CountedNodePtr;

        // Tagged or 57-bit addresses keep every bit.
        let addr = !0_usize & !0xf;
        let p = CountedNodePtr::new(addr as *mut u64, 7);
        assert_eq!(p.ptr() as usize, addr);
        assert_eq!(p.external_count(), 7);
        assert_eq!(p.with_incremented_count().ptr() as usize, addr);
        assert!(!p.is_null());
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_slot_is_lock_free() {
        use counted_ptr::AtomicBits;

        assert!(AtomicBits::is_lock_free());
    }

    #[test]
    #[should_panic(expected = "external count overflow")]
    fn test_count_overflow() {
        use counted_ptr::{CountedNodePtr, MAX_EXTERNAL_COUNT};

        let p = CountedNodePtr::new(8 as *mut u64, MAX_EXTERNAL_COUNT);
        p.with_incremented_count();
    }

    #[test]
    fn test_atomic_slot() {
        use counted_ptr::{AtomicCountedPtr, CountedNodePtr};
        use std::sync::atomic::Ordering;

        let node = Box::into_raw(Box::new(1_i32));
        let slot = AtomicCountedPtr::new(CountedNodePtr::null());
        let empty = slot.load(Ordering::Relaxed);
        let full = CountedNodePtr::new(node, 1);

        assert_eq!(
            slot.compare_exchange(full, empty, Ordering::SeqCst, Ordering::SeqCst),
            Err(empty)
        );
        assert_eq!(
            slot.compare_exchange(empty, full, Ordering::SeqCst, Ordering::SeqCst),
            Ok(empty)
        );
        let bumped = full.with_incremented_count();
        assert!(
            slot.compare_exchange(full, bumped, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        );
        assert_eq!(slot.swap(CountedNodePtr::null(), Ordering::SeqCst), bumped);
        assert!(slot.load(Ordering::SeqCst).is_null());

        unsafe { drop(Box::from_raw(node)) };
    }
}

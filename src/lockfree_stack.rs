//! `LockFreeStack`, a Treiber stack whose nodes are reclaimed by split reference counting.
//!
//! The head slot holds a `CountedNodePtr`: the top node plus an *external* count of the
//! references handed out through the slot. Every node carries an *internal* count that
//! collects the references given back. A thread that wants to look at the top node first
//! bumps the external count with a CAS (`get_head`), so the node cannot be freed while it
//! is being inspected. When a pop unlinks the node, the popper moves the external count,
//! minus its own reference and the one held by the head slot, into the internal count.
//! Threads that lost the race give their reference back by decrementing the internal count.
//! Whichever update brings the combined count to zero frees the node; it may be the popper
//! or any thread that was still looking at the node.

use backoff::Backoff;
use counted_ptr::{AtomicCountedPtr, CountedNodePtr};
use error::AllocError;
use util::WrappedAlign64Type;
use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicIsize, Ordering};

cfg_if! {
    if #[cfg(feature = "seq_cst")] {
        const HEAD_ACQUIRE: Ordering = Ordering::SeqCst;
        const HEAD_PUBLISH: Ordering = Ordering::SeqCst;
        const HEAD_UNLINK: Ordering = Ordering::SeqCst;
        const COUNT_UPDATE: Ordering = Ordering::SeqCst;
        const SNAPSHOT: Ordering = Ordering::SeqCst;
    } else {
        // Pairs with HEAD_PUBLISH, so the node behind an acquired head is fully written.
        const HEAD_ACQUIRE: Ordering = Ordering::Acquire;
        const HEAD_PUBLISH: Ordering = Ordering::Release;
        const HEAD_UNLINK: Ordering = Ordering::AcqRel;
        // Every access to a node happens before the count update that gives the reference
        // back, and the update that reaches zero acquires all of them.
        const COUNT_UPDATE: Ordering = Ordering::AcqRel;
        // Snapshots are never dereferenced before a successful acquiring CAS.
        const SNAPSHOT: Ordering = Ordering::Relaxed;
    }
}

type LIFONodePtr<T> = *mut LIFONode<T>;

struct LIFONode<T> {
    // Taken only by the thread whose CAS unlinked the node.
    value: UnsafeCell<Option<T>>,
    internal_count: AtomicIsize,
    // Written before the node is published, read-only afterwards.
    next: CountedNodePtr<LIFONode<T>>,
}

impl<T> LIFONode<T> {
    fn new(value: T) -> Self {
        LIFONode {
            value: UnsafeCell::new(Some(value)),
            internal_count: AtomicIsize::new(0),
            next: CountedNodePtr::null(),
        }
    }
}

cfg_if! {
    if #[cfg(any(test, feature = "node_stats"))] {
        use std::sync::atomic::AtomicUsize;

        /// Nodes allocated and reclaimed over the lifetime of a stack.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct NodeStats {
            pub allocated: usize,
            pub reclaimed: usize,
        }

        struct NodeCounter {
            allocated: AtomicUsize,
            reclaimed: AtomicUsize,
        }

        impl NodeCounter {
            fn new() -> Self {
                NodeCounter {
                    allocated: AtomicUsize::new(0),
                    reclaimed: AtomicUsize::new(0),
                }
            }

            #[inline]
            fn on_alloc(&self) {
                self.allocated.fetch_add(1, Ordering::Relaxed);
            }

            #[inline]
            fn on_reclaim(&self) {
                let reclaimed = self.reclaimed.fetch_add(1, Ordering::Relaxed) + 1;
                assert!(
                    reclaimed <= self.allocated.load(Ordering::Relaxed),
                    "more nodes reclaimed than allocated"
                );
            }

            fn stats(&self) -> NodeStats {
                NodeStats {
                    allocated: self.allocated.load(Ordering::Relaxed),
                    reclaimed: self.reclaimed.load(Ordering::Relaxed),
                }
            }
        }
    } else {
        struct NodeCounter;

        impl NodeCounter {
            fn new() -> Self {
                NodeCounter
            }

            #[inline]
            fn on_alloc(&self) {}

            #[inline]
            fn on_reclaim(&self) {}
        }
    }
}

/// Lock-free LIFO stack. `push` and `try_pop` may be called from any number of threads at
/// once through a shared reference.
pub struct LockFreeStack<T> {
    head: WrappedAlign64Type<AtomicCountedPtr<LIFONode<T>>>,
    node_counter: NodeCounter,
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}

unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeStack<T> {
    /// Create an empty stack. Nothing is allocated until the first push.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_splitref_stack::lockfree_stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::<i32>::new();
    /// assert!(stack.try_pop().is_none());
    /// ```
    ///
    pub fn new() -> Self {
        LockFreeStack {
            head: WrappedAlign64Type(AtomicCountedPtr::new(CountedNodePtr::null())),
            node_counter: NodeCounter::new(),
        }
    }

    /// Push `v` on top of the stack. Never fails except by aborting when the node can't be
    /// allocated; see `try_push` for a fallible version.
    pub fn push(&self, v: T) {
        let node = Box::into_raw(Box::new(LIFONode::new(v)));
        unsafe { self.link(node) }
    }

    /// Push `v` on top of the stack, handing it back inside the error if the node can't be
    /// allocated. The stack is unchanged in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_splitref_stack::lockfree_stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::new();
    /// stack.try_push("a").unwrap();
    /// assert_eq!(stack.try_pop(), Some("a"));
    /// ```
    ///
    pub fn try_push(&self, v: T) -> Result<(), AllocError<T>> {
        let layout = Layout::new::<LIFONode<T>>();
        let node = unsafe { alloc::alloc(layout) } as LIFONodePtr<T>;
        if node.is_null() {
            warn!("node allocation failed, size={}", layout.size());
            return Err(AllocError(v));
        }
        unsafe {
            ptr::write(node, LIFONode::new(v));
            self.link(node);
        }
        Ok(())
    }

    unsafe fn link(&self, node: LIFONodePtr<T>) {
        self.node_counter.on_alloc();
        let new_head = CountedNodePtr::new(node, 1);
        let mut backoff = Backoff::new();
        // `next` keeps the external count of the old head: references already handed out
        // for it stay accounted for when it becomes the head again.
        (*node).next = self.head.load(SNAPSHOT);
        while let Err(cur) = self.head.compare_exchange_weak(
            (*node).next,
            new_head,
            HEAD_PUBLISH,
            SNAPSHOT,
        ) {
            (*node).next = cur;
            backoff.spin();
        }
    }

    /// Pop the most recently pushed value, or return `None` if the stack is empty.
    ///
    /// The node is unlinked from the stack before its value is moved out. Whatever happens
    /// after the unlink, the element is never put back: a fault at that point loses it.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_splitref_stack::lockfree_stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::new();
    /// stack.push(1);
    /// stack.push(2);
    /// assert_eq!(stack.try_pop(), Some(2));
    /// assert_eq!(stack.try_pop(), Some(1));
    /// assert_eq!(stack.try_pop(), None);
    /// ```
    ///
    pub fn try_pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            let old_head = self.get_head();
            let node = old_head.ptr();
            if node.is_null() {
                return None;
            }
            unsafe {
                if self
                    .head
                    .compare_exchange(old_head, (*node).next, HEAD_UNLINK, SNAPSHOT)
                    .is_ok()
                {
                    let ret = (*(*node).value.get()).take();
                    debug_assert!(ret.is_some());
                    // Our own reference and the one the head slot held are gone.
                    let released = old_head.external_count() as isize - 2;
                    if (*node).internal_count.fetch_add(released, COUNT_UPDATE) == -released {
                        self.reclaim(node);
                    }
                    return ret;
                }
                self.release_ref(node);
            }
            backoff.spin();
        }
    }

    /// Snapshot of the head with one more external reference taken on its node. An empty
    /// head is returned as is: there is no node to hold on to.
    fn get_head(&self) -> CountedNodePtr<LIFONode<T>> {
        let mut backoff = Backoff::new();
        let mut old_head = self.head.load(SNAPSHOT);
        loop {
            if old_head.is_null() {
                return old_head;
            }
            let new_head = old_head.with_incremented_count();
            match self.head.compare_exchange_weak(old_head, new_head, HEAD_ACQUIRE, SNAPSHOT) {
                Ok(_) => return new_head,
                Err(cur) => {
                    old_head = cur;
                    backoff.spin();
                }
            }
        }
    }

    /// Give back one reference taken by `get_head` on a node this thread did not unlink.
    unsafe fn release_ref(&self, node: LIFONodePtr<T>) {
        if (*node).internal_count.fetch_sub(1, COUNT_UPDATE) == 1 {
            self.reclaim(node);
        }
    }

    unsafe fn reclaim(&self, node: LIFONodePtr<T>) {
        self.node_counter.on_reclaim();
        drop(Box::from_raw(node));
    }

    /// Return true if the stack looked empty at the moment of the load. Not synchronized with
    /// concurrent pushes and pops, the answer may be stale as soon as it is returned.
    pub fn unsafe_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Free every node still on the stack, dropping the values in them. Taking `&mut self`
    /// guarantees no other thread is using the stack. Called when dropping `LockFreeStack`.
    pub fn unsafe_clear(&mut self) {
        let mut cur = self.head.swap(CountedNodePtr::null(), HEAD_UNLINK);
        let mut freed = 0_usize;
        while !cur.is_null() {
            let node = cur.ptr();
            unsafe {
                cur = (*node).next;
                self.reclaim(node);
            }
            freed += 1;
        }
        if freed > 0 {
            debug!("unsafe_clear freed {} nodes", freed);
        }
    }

    /// Iterator popping values until the stack is seen empty. Pushes racing with the drain
    /// may or may not be observed.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_splitref_stack::lockfree_stack::LockFreeStack;
    ///
    /// let stack = LockFreeStack::new();
    /// for i in 0..3 {
    ///     stack.push(i);
    /// }
    /// assert_eq!(stack.drain().collect::<Vec<_>>(), vec![2, 1, 0]);
    /// assert!(stack.unsafe_empty());
    /// ```
    ///
    pub fn drain(&self) -> Drain<T> {
        Drain { stack: self }
    }

    #[cfg(any(test, feature = "node_stats"))]
    pub fn node_stats(&self) -> NodeStats {
        self.node_counter.stats()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        self.unsafe_clear();
    }
}

impl<T> fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("empty", &self.unsafe_empty())
            .finish()
    }
}

/// Draining iterator returned by `LockFreeStack::drain`.
pub struct Drain<'a, T: 'a> {
    stack: &'a LockFreeStack<T>,
}

impl<'a, T: 'a> Iterator for Drain<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.stack.try_pop()
    }
}

mod test {
    struct Node<'a, T> {
        cnt: &'a ::std::cell::RefCell<i32>,
        v: T,
    }

    impl<'a, T> Drop for Node<'a, T> {
        fn drop(&mut self) {
            *self.cnt.borrow_mut() += 1;
        }
    }

    #[test]
    fn test_base() {
        use lockfree_stack::LockFreeStack;
        let stack = LockFreeStack::new();
        assert!(stack.try_pop().is_none());
        stack.push(1);
        assert_eq!(stack.try_pop().unwrap(), 1);
        let test_num = 100;
        for i in 0..test_num {
            stack.push(i);
        }
        for i in 0..test_num {
            assert_eq!(stack.try_pop().unwrap(), test_num - i - 1);
        }
        assert!(stack.try_pop().is_none());
        assert_eq!(
            stack.node_stats(),
            ::lockfree_stack::NodeStats {
                allocated: 101,
                reclaimed: 101,
            }
        );
    }

    #[test]
    fn test_pop_order() {
        use lockfree_stack::LockFreeStack;
        let stack = LockFreeStack::new();
        for v in [3, 2, 1, 0].iter() {
            stack.push(*v);
        }
        assert!(!stack.unsafe_empty());
        assert_eq!(stack.try_pop(), Some(0));
        assert_eq!(stack.try_pop(), Some(1));
        assert_eq!(stack.try_pop(), Some(2));
        assert_eq!(stack.try_pop(), Some(3));
        assert_eq!(stack.try_pop(), None);
        assert!(stack.unsafe_empty());
    }

    #[test]
    fn test_empty_pop_leaves_head_untouched() {
        use counted_ptr::CountedNodePtr;
        use lockfree_stack::LockFreeStack;
        let stack = LockFreeStack::<u8>::new();
        for _ in 0..100_000 {
            assert!(stack.try_pop().is_none());
        }
        assert_eq!(stack.head.load(::std::sync::atomic::Ordering::SeqCst), CountedNodePtr::null());
        stack.push(9);
        assert_eq!(stack.try_pop(), Some(9));
    }

    #[test]
    fn test_memory_leak() {
        use lockfree_stack::LockFreeStack;
        use std::cell::RefCell;
        let cnt = RefCell::new(0);
        let stack = LockFreeStack::new();
        let test_num = 100;
        for i in 0..test_num {
            stack.push(Node { cnt: &cnt, v: i });
        }
        assert_eq!(*cnt.borrow(), 0);
        for i in 0..test_num {
            assert_eq!(stack.try_pop().unwrap().v, test_num - i - 1);
        }
        assert_eq!(*cnt.borrow(), test_num);
    }

    #[test]
    fn test_drop_remaining() {
        use lockfree_stack::LockFreeStack;
        use std::cell::RefCell;
        let cnt = RefCell::new(0);
        {
            let stack = LockFreeStack::new();
            for i in 0..10 {
                stack.push(Node { cnt: &cnt, v: i });
            }
            assert_eq!(stack.try_pop().unwrap().v, 9);
            assert_eq!(*cnt.borrow(), 1);
        }
        assert_eq!(*cnt.borrow(), 10);
    }

    #[test]
    fn test_unsafe_clear() {
        use lockfree_stack::LockFreeStack;
        use std::cell::RefCell;
        let cnt = RefCell::new(0);
        let mut stack = LockFreeStack::new();
        for i in 0..10 {
            stack.push(Node { cnt: &cnt, v: i });
        }
        stack.unsafe_clear();
        assert_eq!(*cnt.borrow(), 10);
        assert!(stack.unsafe_empty());
        assert!(stack.try_pop().is_none());
        let stats = stack.node_stats();
        assert_eq!(stats.allocated, 10);
        assert_eq!(stats.reclaimed, 10);

        stack.push(Node { cnt: &cnt, v: 10 });
        assert_eq!(stack.try_pop().unwrap().v, 10);
        assert_eq!(*cnt.borrow(), 11);
    }

    #[test]
    fn test_drain() {
        use lockfree_stack::LockFreeStack;
        let stack = LockFreeStack::new();
        for i in 0..5 {
            stack.push(i);
        }
        let drained: Vec<i32> = stack.drain().collect();
        assert_eq!(drained, vec![4, 3, 2, 1, 0]);
        assert!(stack.drain().next().is_none());
    }

    #[test]
    fn test_try_push() {
        use lockfree_stack::LockFreeStack;
        let stack = LockFreeStack::new();
        for i in 0..4 {
            assert!(stack.try_push(i).is_ok());
        }
        stack.push(4);
        assert_eq!(stack.drain().collect::<Vec<_>>(), vec![4, 3, 2, 1, 0]);
        assert_eq!(stack.node_stats().reclaimed, 5);
    }

    #[test]
    fn test_reclaim_by_last_holder() {
        use lockfree_stack::LockFreeStack;
        use std::cell::RefCell;
        let cnt = RefCell::new(0);
        let stack = LockFreeStack::new();
        stack.push(Node { cnt: &cnt, v: 1 });

        // Another thread is still looking at the top node when it gets popped.
        let held = stack.get_head();
        assert_eq!(held.external_count(), 2);

        assert_eq!(stack.try_pop().unwrap().v, 1);
        assert_eq!(*cnt.borrow(), 1);
        assert!(stack.unsafe_empty());
        assert_eq!(stack.node_stats().reclaimed, 0);

        // Its CAS would fail now; giving the reference back frees the node.
        unsafe {
            assert_eq!((*held.ptr()).next, ::counted_ptr::CountedNodePtr::null());
            stack.release_ref(held.ptr());
        }
        assert_eq!(stack.node_stats().reclaimed, 1);
    }

    #[test]
    fn test_count_survives_push() {
        use lockfree_stack::LockFreeStack;
        let stack = LockFreeStack::new();
        stack.push(1);
        let held = stack.get_head();
        stack.push(2);

        // The holder of node 1 loses its race and gives the reference back. The count it
        // added travels with node 1 in the `next` of node 2.
        unsafe { stack.release_ref(held.ptr()) };
        assert_eq!(stack.node_stats().reclaimed, 0);

        assert_eq!(stack.try_pop(), Some(2));
        assert_eq!(stack.node_stats().reclaimed, 1);
        assert_eq!(stack.head.load(::std::sync::atomic::Ordering::SeqCst).external_count(), 2);
        assert_eq!(stack.try_pop(), Some(1));
        assert_eq!(stack.node_stats().reclaimed, 2);
        assert!(stack.try_pop().is_none());
    }

    #[test]
    fn test_many_lost_races_on_one_node() {
        use lockfree_stack::LockFreeStack;
        use std::sync::mpsc;
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let stack = Arc::new(LockFreeStack::new());
        stack.push(0);
        let rounds = 70_000;
        for i in 0..rounds {
            // A popper takes a reference on node 0, a push wins the race, the popper gives its
            // reference back, and a pop puts node 0 on top again with the count it had.
            let held = stack.get_head();
            stack.push(i + 1);
            unsafe { stack.release_ref(held.ptr()) };
            assert_eq!(stack.try_pop(), Some(i + 1));
        }
        let head = stack.head.load(::std::sync::atomic::Ordering::SeqCst);
        assert_eq!(head.external_count(), rounds as u64 + 1);
        assert_eq!(stack.node_stats().reclaimed, rounds);

        let (tx, rx) = mpsc::channel();
        {
            let stack = stack.clone();
            thread::spawn(move || {
                tx.send(stack.try_pop()).unwrap();
            });
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(Some(0)));
        assert!(stack.try_pop().is_none());

        let stats = stack.node_stats();
        assert_eq!(stats.allocated, rounds + 1);
        assert_eq!(stats.reclaimed, rounds + 1);
    }

    #[test]
    fn test_multi_threads() {
        use lockfree_stack::LockFreeStack;
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let thread_cnt = 8;
        let push_per_thread = 10_000;
        let stack = Arc::new(LockFreeStack::new());

        let threads: Vec<_> = (0..thread_cnt)
            .map(|t| {
                let stack = stack.clone();
                thread::spawn(move || {
                    let mut popped = vec![];
                    for i in 0..push_per_thread {
                        stack.push(t * push_per_thread + i);
                        if i % 2 == 1 {
                            popped.extend(stack.try_pop());
                        }
                    }
                    popped
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for t in threads {
            for v in t.join().unwrap() {
                assert!(seen.insert(v), "value {} popped twice", v);
            }
        }
        for v in stack.drain() {
            assert!(seen.insert(v), "value {} popped twice", v);
        }
        assert_eq!(seen.len(), thread_cnt * push_per_thread);

        let stats = stack.node_stats();
        assert_eq!(stats.allocated, thread_cnt * push_per_thread);
        assert_eq!(stats.reclaimed, stats.allocated);
    }
}
